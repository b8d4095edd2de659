//! Progress engine: push channel, snapshot fetching and session control.
mod channel;
mod engine;
mod fetch;
mod pusher;
mod session;
mod settings;
mod types;

pub use channel::{ChannelClient, ChannelEvent, ChannelSubscription};
pub use engine::ProgressEngine;
pub use fetch::{ReqwestSnapshotFetcher, SnapshotFetcher};
pub use pusher::{ChannelError, PusherChannelClient};
pub use session::{SessionController, SessionHandle};
pub use settings::{
    ChannelSettings, SessionSettings, SettingsError, SnapshotSettings, SyncSettings,
};
pub use types::{
    ConnectionState, FailureKind, FetchError, ProgressUpdate, SessionNotice, SessionPhase,
};
