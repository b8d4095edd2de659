//! Pusher protocol (v7) channel client over a websocket.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use progress_core::{RawEvent, WorkspaceId};
use progress_logging::{progress_debug, progress_info, progress_trace, progress_warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::{ChannelClient, ChannelEvent, ChannelSettings, ChannelSubscription, ConnectionState};

const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
const SUBSCRIBE: &str = "pusher:subscribe";
const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
const ERROR: &str = "pusher:error";
const PING: &str = "pusher:ping";
const PONG: &str = "pusher:pong";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed by server")]
    Closed,
    #[error("no pong within {0:?}")]
    PongTimeout(Duration),
}

struct Connection {
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl Connection {
    fn subscription(&self) -> ChannelSubscription {
        ChannelSubscription {
            events: self.events.subscribe(),
            connection: self.state.clone(),
        }
    }
}

/// One websocket per subscribed workspace, reconnecting with backoff.
pub struct PusherChannelClient {
    settings: ChannelSettings,
    connections: Mutex<HashMap<WorkspaceId, Connection>>,
}

impl PusherChannelClient {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            settings,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel_name(&self, workspace_id: &WorkspaceId) -> String {
        format!("{}{}", self.settings.channel_prefix, workspace_id)
    }

    /// Number of workspaces with a live connection task.
    pub fn connection_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|conn| !conn.cancel.is_cancelled())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkspaceId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ChannelClient for PusherChannelClient {
    async fn subscribe(&self, workspace_id: &WorkspaceId) -> ChannelSubscription {
        let mut connections = self.lock();
        if let Some(conn) = connections.get(workspace_id) {
            // A connection that gave up is replaced below.
            if !conn.cancel.is_cancelled() {
                progress_debug!("reusing channel connection for workspace {}", workspace_id);
                return conn.subscription();
            }
        }

        let (events, _) = broadcast::channel(self.settings.event_buffer.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let conn = Connection {
            events: events.clone(),
            state,
            cancel: cancel.clone(),
        };
        let subscription = conn.subscription();
        connections.insert(workspace_id.clone(), conn);

        let channel = self.channel_name(workspace_id);
        progress_info!("opening channel {}", channel);
        tokio::spawn(run_connection(
            self.settings.clone(),
            channel,
            events,
            state_tx,
            cancel,
        ));
        subscription
    }

    async fn unsubscribe(&self, workspace_id: &WorkspaceId) {
        if let Some(conn) = self.lock().remove(workspace_id) {
            progress_info!("closing channel for workspace {}", workspace_id);
            conn.cancel.cancel();
        }
    }
}

async fn run_connection(
    settings: ChannelSettings,
    channel: String,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut backoff = settings.min_backoff;
    let mut failures: u32 = 0;

    loop {
        let mut subscribed = false;
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_and_stream(&settings, &channel, &events, &state, &mut subscribed) => result,
        };
        // Only attempts that never reached the subscription count as failures.
        if subscribed {
            backoff = settings.min_backoff;
            failures = 0;
        } else {
            failures += 1;
        }
        if let Err(err) = result {
            progress_warn!(
                "channel {} dropped ({} failed attempts, retry in {:?}): {}",
                channel,
                failures,
                backoff,
                err
            );
        }

        if settings
            .max_reconnect_attempts
            .is_some_and(|max| failures >= max)
        {
            progress_warn!("channel {} giving up after {} attempts", channel, failures);
            state.send_replace(ConnectionState::Failed);
            break;
        }
        state.send_replace(ConnectionState::DisconnectedRetrying);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(settings.max_backoff);
    }

    cancel.cancel();
    progress_debug!("channel {} task finished", channel);
}

async fn connect_and_stream(
    settings: &ChannelSettings,
    channel: &str,
    events: &broadcast::Sender<ChannelEvent>,
    state: &watch::Sender<ConnectionState>,
    subscribed: &mut bool,
) -> Result<(), ChannelError> {
    let url = connection_url(settings);
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ChannelError::Connect(err.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let established = tokio::time::timeout(settings.handshake_timeout, next_frame(&mut stream))
        .await
        .map_err(|_| ChannelError::Handshake("no connection_established".to_string()))??;
    if established.event != CONNECTION_ESTABLISHED {
        return Err(ChannelError::Handshake(format!(
            "unexpected first event {}",
            established.event
        )));
    }

    send_frame(
        &mut sink,
        &Frame::new(SUBSCRIBE, serde_json::json!({ "channel": channel })),
    )
    .await?;

    let mut awaiting_pong = false;
    loop {
        let wait = if awaiting_pong {
            settings.pong_timeout
        } else {
            settings.activity_timeout
        };
        let frame = match tokio::time::timeout(wait, next_frame(&mut stream)).await {
            Ok(frame) => frame?,
            Err(_) if awaiting_pong => return Err(ChannelError::PongTimeout(wait)),
            Err(_) => {
                send_frame(&mut sink, &Frame::new(PING, serde_json::json!({}))).await?;
                awaiting_pong = true;
                continue;
            }
        };
        awaiting_pong = false;

        match frame.event.as_str() {
            PING => send_frame(&mut sink, &Frame::new(PONG, serde_json::json!({}))).await?,
            PONG => {}
            SUBSCRIPTION_SUCCEEDED if frame.channel.as_deref() == Some(channel) => {
                progress_info!("subscribed to channel {}", channel);
                *subscribed = true;
                state.send_replace(ConnectionState::Connected);
                let _ = events.send(ChannelEvent::SubscriptionSucceeded);
            }
            SUBSCRIPTION_ERROR | ERROR => {
                let detail = frame.payload().to_string();
                progress_warn!("channel {} reported {}: {}", channel, frame.event, detail);
                let _ = events.send(ChannelEvent::SubscriptionError(detail));
            }
            name if !name.starts_with("pusher") && frame.channel.as_deref() == Some(channel) => {
                let payload = frame.payload();
                let _ = events.send(ChannelEvent::Raw(RawEvent::new(
                    name,
                    channel,
                    payload,
                    Utc::now(),
                )));
            }
            other => progress_trace!("channel {} ignoring {}", channel, other),
        }
    }
}

fn connection_url(settings: &ChannelSettings) -> String {
    format!(
        "{}/app/{}?protocol=7&client=progress-sync&version={}",
        settings.endpoint.trim_end_matches('/'),
        settings.app_key,
        env!("CARGO_PKG_VERSION")
    )
}

/// Reads until the next decodable text frame.
async fn next_frame<S>(stream: &mut S) -> Result<Frame, ChannelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(frame) => return Ok(frame),
                Err(err) => progress_warn!("skipping undecodable frame: {}", err),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(ChannelError::Transport(err.to_string())),
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ChannelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text =
        serde_json::to_string(frame).map_err(|err| ChannelError::Transport(err.to_string()))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|err| ChannelError::Transport(err.to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

impl Frame {
    fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            channel: None,
            data,
        }
    }

    /// Pusher double-encodes `data` as a JSON string; plain objects are
    /// accepted too.
    fn payload(&self) -> serde_json::Value {
        match &self.data {
            serde_json::Value::String(text) => serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.clone())),
            other => other.clone(),
        }
    }
}
