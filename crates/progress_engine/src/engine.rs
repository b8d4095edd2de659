use std::collections::HashMap;
use std::sync::Arc;

use progress_core::WorkspaceId;
use progress_logging::progress_info;

use crate::{
    ChannelClient, FetchError, PusherChannelClient, ReqwestSnapshotFetcher, SessionController,
    SessionHandle, SessionSettings, SnapshotFetcher, SyncSettings,
};

/// Owns the shared channel client and fetcher, and one session per watched
/// workspace.
pub struct ProgressEngine {
    channel: Arc<dyn ChannelClient>,
    fetcher: Arc<dyn SnapshotFetcher>,
    settings: SessionSettings,
    sessions: HashMap<WorkspaceId, SessionHandle>,
}

impl ProgressEngine {
    pub fn new(
        channel: Arc<dyn ChannelClient>,
        fetcher: Arc<dyn SnapshotFetcher>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            channel,
            fetcher,
            settings,
            sessions: HashMap::new(),
        }
    }

    /// Builds the websocket channel client and HTTP fetcher from settings.
    pub fn from_settings(settings: &SyncSettings) -> Result<Self, FetchError> {
        let channel = Arc::new(PusherChannelClient::new(settings.channel.clone()));
        let fetcher = Arc::new(ReqwestSnapshotFetcher::new(settings.snapshot.clone())?);
        Ok(Self::new(channel, fetcher, settings.session.clone()))
    }

    /// Starts a session for the workspace, or returns the running one.
    pub fn watch(&mut self, workspace_id: WorkspaceId) -> &SessionHandle {
        self.sessions.entry(workspace_id).or_insert_with_key(|id| {
            progress_info!("watching workspace {}", id);
            SessionController::start(
                id.clone(),
                self.channel.clone(),
                self.fetcher.clone(),
                self.settings.clone(),
            )
        })
    }

    pub fn session(&self, workspace_id: &WorkspaceId) -> Option<&SessionHandle> {
        self.sessions.get(workspace_id)
    }

    /// Stops the workspace's session. Returns false if none was running.
    pub async fn unwatch(&mut self, workspace_id: &WorkspaceId) -> bool {
        match self.sessions.remove(workspace_id) {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn workspaces(&self) -> impl Iterator<Item = &WorkspaceId> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn shutdown(mut self) {
        for (_, session) in self.sessions.drain() {
            session.stop().await;
        }
        progress_info!("progress engine stopped");
    }
}
