use std::sync::Once;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use progress_core::WorkspaceId;
use progress_engine::{
    ChannelClient, ChannelEvent, ChannelSettings, ConnectionState, PusherChannelClient,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(progress_logging::initialize_for_tests);
}

type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

async fn send(socket: &mut ServerSocket, frame: serde_json::Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

async fn recv(socket: &mut ServerSocket) -> serde_json::Value {
    loop {
        match socket.next().await.expect("client open").expect("frame") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
            _ => continue,
        }
    }
}

/// Accepts one client and runs the handshake up to the subscription ack.
async fn accept_subscriber(listener: &TcpListener) -> (ServerSocket, String) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut socket = tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket upgrade");
    send(
        &mut socket,
        json!({
            "event": "pusher:connection_established",
            "data": "{\"socket_id\":\"1.1\",\"activity_timeout\":120}"
        }),
    )
    .await;

    let subscribe = recv(&mut socket).await;
    assert_eq!(subscribe["event"], "pusher:subscribe");
    let channel = subscribe["data"]["channel"]
        .as_str()
        .expect("channel name")
        .to_string();
    send(
        &mut socket,
        json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": channel,
            "data": "{}"
        }),
    )
    .await;
    (socket, channel)
}

async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

fn settings(listener: &TcpListener) -> ChannelSettings {
    let addr = listener.local_addr().expect("bound");
    ChannelSettings {
        endpoint: format!("ws://{addr}"),
        app_key: "test-key".to_string(),
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        ..ChannelSettings::default()
    }
}

#[tokio::test]
async fn delivers_progress_events_after_subscribing() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let client = PusherChannelClient::new(settings(&listener));
    let workspace = WorkspaceId::new("ws-1");

    let mut subscription = client.subscribe(&workspace).await;
    let (mut socket, channel) = accept_subscriber(&listener).await;
    assert_eq!(channel, "workspace-ws-1");

    assert_eq!(
        next_event(&mut subscription.events).await,
        ChannelEvent::SubscriptionSucceeded
    );
    subscription
        .connection
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .expect("connected");

    send(
        &mut socket,
        json!({
            "event": "analysis_progress",
            "channel": channel,
            "data": "{\"jobId\":\"job-1\",\"sequenceNumber\":1,\"steps\":{\"upload\":\"completed\"}}"
        }),
    )
    .await;

    match next_event(&mut subscription.events).await {
        ChannelEvent::Raw(event) => {
            assert!(event.is_progress());
            assert_eq!(event.channel, "workspace-ws-1");
            assert_eq!(event.payload["jobId"], "job-1");
            assert_eq!(event.payload["steps"]["upload"], "completed");
        }
        other => panic!("expected a raw event, got {other:?}"),
    }

    client.unsubscribe(&workspace).await;
    assert_eq!(client.connection_count(), 0);
}

#[tokio::test]
async fn answers_server_pings() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let client = PusherChannelClient::new(settings(&listener));
    let workspace = WorkspaceId::new("ws-1");

    let _subscription = client.subscribe(&workspace).await;
    let (mut socket, _) = accept_subscriber(&listener).await;

    send(&mut socket, json!({ "event": "pusher:ping", "data": {} })).await;
    let reply = recv(&mut socket).await;

    assert_eq!(reply["event"], "pusher:pong");
    client.unsubscribe(&workspace).await;
}

#[tokio::test]
async fn repeated_subscribe_shares_one_connection() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let client = PusherChannelClient::new(settings(&listener));
    let workspace = WorkspaceId::new("ws-1");

    let mut first = client.subscribe(&workspace).await;
    let (mut socket, channel) = accept_subscriber(&listener).await;
    assert_eq!(
        next_event(&mut first.events).await,
        ChannelEvent::SubscriptionSucceeded
    );
    let mut second = client.subscribe(&workspace).await;
    assert_eq!(client.connection_count(), 1);
    assert_eq!(*second.connection.borrow(), ConnectionState::Connected);

    send(
        &mut socket,
        json!({
            "event": "analysis_progress",
            "channel": channel,
            "data": { "jobId": "job-1" }
        }),
    )
    .await;
    for events in [&mut first.events, &mut second.events] {
        match next_event(events).await {
            ChannelEvent::Raw(event) => assert_eq!(event.payload["jobId"], "job-1"),
            other => panic!("expected a raw event, got {other:?}"),
        }
    }

    client.unsubscribe(&workspace).await;
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_the_server_drops() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let client = PusherChannelClient::new(settings(&listener));
    let workspace = WorkspaceId::new("ws-1");

    let mut subscription = client.subscribe(&workspace).await;
    let (socket, _) = accept_subscriber(&listener).await;
    assert_eq!(
        next_event(&mut subscription.events).await,
        ChannelEvent::SubscriptionSucceeded
    );
    drop(socket);

    subscription
        .connection
        .wait_for(|state| *state == ConnectionState::DisconnectedRetrying)
        .await
        .expect("retrying");
    let (_socket, _) = accept_subscriber(&listener).await;

    assert_eq!(
        next_event(&mut subscription.events).await,
        ChannelEvent::SubscriptionSucceeded
    );
    subscription
        .connection
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .expect("connected again");

    client.unsubscribe(&workspace).await;
}

#[tokio::test]
async fn gives_up_after_the_configured_attempts() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = {
        let addr = listener.local_addr().expect("bound");
        drop(listener);
        format!("ws://{addr}")
    };
    let client = PusherChannelClient::new(ChannelSettings {
        endpoint,
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        max_reconnect_attempts: Some(2),
        ..ChannelSettings::default()
    });

    let mut subscription = client.subscribe(&WorkspaceId::new("ws-1")).await;

    tokio::time::timeout(
        Duration::from_secs(5),
        subscription
            .connection
            .wait_for(|state| *state == ConnectionState::Failed),
    )
    .await
    .expect("gives up in time")
    .expect("state kept");
    assert_eq!(client.connection_count(), 0);
}

#[tokio::test]
async fn dropping_a_healthy_connection_is_not_a_failed_attempt() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let client = PusherChannelClient::new(ChannelSettings {
        max_reconnect_attempts: Some(1),
        ..settings(&listener)
    });
    let workspace = WorkspaceId::new("ws-1");

    let mut subscription = client.subscribe(&workspace).await;
    let (socket, _) = accept_subscriber(&listener).await;
    assert_eq!(
        next_event(&mut subscription.events).await,
        ChannelEvent::SubscriptionSucceeded
    );
    drop(socket);

    let (_socket, _) = tokio::time::timeout(Duration::from_secs(5), accept_subscriber(&listener))
        .await
        .expect("client reconnects");
    assert_eq!(
        next_event(&mut subscription.events).await,
        ChannelEvent::SubscriptionSucceeded
    );
    assert_eq!(*subscription.connection.borrow(), ConnectionState::Connected);
    assert_eq!(client.connection_count(), 1);

    client.unsubscribe(&workspace).await;
}
