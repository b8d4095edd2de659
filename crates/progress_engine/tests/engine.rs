use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use progress_core::{ProgressState, WorkspaceId};
use progress_engine::{
    ChannelClient, ChannelEvent, ChannelSubscription, ConnectionState, FailureKind, FetchError,
    ProgressEngine, SessionPhase, SessionSettings, SnapshotFetcher, SyncSettings,
};
use tokio::sync::{broadcast, watch};

#[derive(Default)]
struct RecordingChannel {
    subscribed: Mutex<Vec<WorkspaceId>>,
    unsubscribed: Mutex<Vec<WorkspaceId>>,
    senders: Mutex<Vec<(broadcast::Sender<ChannelEvent>, watch::Sender<ConnectionState>)>>,
}

#[async_trait::async_trait]
impl ChannelClient for RecordingChannel {
    async fn subscribe(&self, workspace_id: &WorkspaceId) -> ChannelSubscription {
        self.subscribed.lock().unwrap().push(workspace_id.clone());
        let (events_tx, events) = broadcast::channel(4);
        let (state_tx, connection) = watch::channel(ConnectionState::Connected);
        self.senders.lock().unwrap().push((events_tx, state_tx));
        ChannelSubscription { events, connection }
    }

    async fn unsubscribe(&self, workspace_id: &WorkspaceId) {
        self.unsubscribed.lock().unwrap().push(workspace_id.clone());
    }
}

struct NoJobs;

#[async_trait::async_trait]
impl SnapshotFetcher for NoJobs {
    async fn fetch(&self, _workspace_id: &WorkspaceId) -> Result<Option<ProgressState>, FetchError> {
        Ok(None)
    }
}

fn engine(channel: &Arc<RecordingChannel>) -> ProgressEngine {
    ProgressEngine::new(channel.clone(), Arc::new(NoJobs), SessionSettings::default())
}

#[tokio::test]
async fn watching_twice_keeps_one_session() {
    let channel = Arc::new(RecordingChannel::default());
    let mut engine = engine(&channel);
    let workspace = WorkspaceId::new("ws-1");

    let mut phase = engine.watch(workspace.clone()).watch_phase();
    engine.watch(workspace.clone());
    phase
        .wait_for(|phase| *phase == SessionPhase::Live)
        .await
        .expect("session running");

    assert_eq!(engine.len(), 1);
    assert_eq!(*channel.subscribed.lock().unwrap(), vec![workspace.clone()]);
    assert!(engine.session(&workspace).is_some());
}

#[tokio::test]
async fn unwatch_stops_only_that_workspace() {
    let channel = Arc::new(RecordingChannel::default());
    let mut engine = engine(&channel);
    let first = WorkspaceId::new("ws-1");
    let second = WorkspaceId::new("ws-2");
    engine.watch(first.clone());
    engine.watch(second.clone());

    assert!(engine.unwatch(&first).await);
    assert!(!engine.unwatch(&first).await);

    assert_eq!(engine.workspaces().collect::<Vec<_>>(), vec![&second]);
    assert_eq!(*channel.unsubscribed.lock().unwrap(), vec![first]);
}

#[tokio::test]
async fn shutdown_releases_every_channel() {
    let channel = Arc::new(RecordingChannel::default());
    let mut engine = engine(&channel);
    engine.watch(WorkspaceId::new("ws-1"));
    engine.watch(WorkspaceId::new("ws-2"));

    engine.shutdown().await;

    let mut released = channel.unsubscribed.lock().unwrap().clone();
    released.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(
        released,
        vec![WorkspaceId::new("ws-1"), WorkspaceId::new("ws-2")]
    );
}

#[test]
fn invalid_snapshot_url_fails_engine_construction() {
    let mut settings = SyncSettings::default();
    settings.snapshot.base_url = "::nope::".to_string();

    let err = ProgressEngine::from_settings(&settings)
        .err()
        .expect("rejected");

    assert_eq!(err.kind, FailureKind::InvalidUrl);
}
