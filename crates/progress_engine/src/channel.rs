use progress_core::{RawEvent, WorkspaceId};
use tokio::sync::{broadcast, watch};

use crate::ConnectionState;

/// What a push subscription delivers besides connection state.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel subscription is (again) active. Sent after every
    /// reconnect, since events missed while disconnected are not replayed.
    SubscriptionSucceeded,
    SubscriptionError(String),
    Raw(RawEvent),
}

/// Receiving side of one workspace subscription.
#[derive(Debug)]
pub struct ChannelSubscription {
    pub events: broadcast::Receiver<ChannelEvent>,
    pub connection: watch::Receiver<ConnectionState>,
}

/// Push-messaging client keyed by workspace.
///
/// Implementations keep at most one transport connection per workspace and
/// hand out additional receivers for repeated subscriptions. Transport
/// failures are reported through the connection state, never returned.
#[async_trait::async_trait]
pub trait ChannelClient: Send + Sync {
    async fn subscribe(&self, workspace_id: &WorkspaceId) -> ChannelSubscription;

    /// Releases the workspace's connection. Calling it again is a no-op.
    async fn unsubscribe(&self, workspace_id: &WorkspaceId);
}
