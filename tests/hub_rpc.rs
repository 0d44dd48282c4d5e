#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use cap_socket::auth::AuthToken;
use cap_socket::config::HubRpcOptions;
use cap_socket::error::Kind;
use cap_socket::{
    BackendKind, ConnectionState, LifecycleEvent, ManagerConfig, ReconnectConfig, SocketManager,
};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use crate::common::{events_until, wait_for_state};

const RS: char = '\u{1e}';

/// Mock hub speaking the JSON hub protocol.
struct MockHub {
    addr: SocketAddr,
    /// Frames pushed to every connected client
    push_tx: broadcast::Sender<String>,
    /// Request URIs of accepted WebSocket connections
    uris_rx: mpsc::UnboundedReceiver<String>,
    /// Hub messages received from clients, pings excluded
    messages_rx: mpsc::UnboundedReceiver<Value>,
}

impl MockHub {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (push_tx, _) = broadcast::channel::<String>(100);
        let (uris_tx, uris_rx) = mpsc::unbounded_channel::<String>();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel::<Value>();
        let broadcast_tx = push_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let uris_tx = uris_tx.clone();
                let callback = move |request: &Request, response: Response| {
                    drop(uris_tx.send(request.uri().to_string()));
                    Ok(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let messages_tx = messages_tx.clone();
                let mut push_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    // Handshake
                    let Some(Ok(Message::Text(handshake))) = read.next().await else {
                        return;
                    };
                    assert!(
                        handshake.as_str().starts_with(r#"{"protocol":"json","version":1}"#),
                        "unexpected handshake {handshake}"
                    );
                    let welcome = format!(
                        "{{}}{RS}{}{RS}",
                        json!({"type": 1, "target": "ReceiveMessage", "arguments": ["server", "welcome"]})
                    );
                    if write.send(Message::Text(welcome.into())).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                let Some(Ok(Message::Text(text))) = msg else {
                                    break;
                                };
                                for frame in text.as_str().split(RS).filter(|f| !f.is_empty()) {
                                    let message: Value = serde_json::from_str(frame).unwrap();
                                    if message["type"] == 6 {
                                        continue;
                                    }
                                    drop(messages_tx.send(message.clone()));

                                    for reply in respond(&message) {
                                        if write.send(Message::Text(reply.into())).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                            msg = push_rx.recv() => {
                                let Ok(frame) = msg else { break };
                                if write.send(Message::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            push_tx,
            uris_rx,
            messages_rx,
        }
    }

    fn url(&self) -> String {
        format!("http://{}/chathub", self.addr)
    }

    fn push(&self, message: &Value) {
        drop(self.push_tx.send(format!("{message}{RS}")));
    }

    async fn recv_uri(&mut self) -> String {
        timeout(Duration::from_secs(5), self.uris_rx.recv())
            .await
            .expect("connection expected")
            .unwrap()
    }

    async fn recv_message(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.messages_rx.recv())
            .await
            .expect("message expected")
            .unwrap()
    }
}

/// Completions for client invocations; `Fail` is answered with an error.
fn respond(message: &Value) -> Vec<String> {
    if message["type"] != 1 {
        return Vec::new();
    }
    let id = message["invocationId"].clone();
    let completion = if message["target"] == "Fail" {
        json!({"type": 3, "invocationId": id, "error": "boom"})
    } else {
        json!({"type": 3, "invocationId": id, "result": null})
    };
    let echo = json!({
        "type": 1,
        "target": "ReceiveMessage",
        "arguments": ["echo", message["arguments"][0].clone()]
    });
    vec![format!("{completion}{RS}{echo}{RS}")]
}

fn config(hub: &MockHub) -> ManagerConfig {
    ManagerConfig::builder()
        .backend(BackendKind::HubRpc)
        .url(hub.url())
        .reconnect(
            ReconnectConfig::builder()
                .base_delay(Duration::from_millis(50))
                .max_delay(Duration::from_millis(200))
                .build(),
        )
        .hub_rpc(HubRpcOptions::builder().skip_negotiation(true).build())
        .build()
}

fn channel_listener(manager: &SocketManager, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.on(event, move |payload| drop(tx.send(payload.clone())));
    rx
}

async fn next_payload(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("payload expected")
        .unwrap()
}

#[tokio::test]
async fn invocations_should_reach_listeners_with_collapsed_arguments() -> anyhow::Result<()> {
    let hub = MockHub::start().await;
    let manager = SocketManager::new(config(&hub))?;
    let mut received = channel_listener(&manager, "ReceiveMessage");

    manager.connect().await?;
    wait_for_state(&manager, ConnectionState::Connected).await;

    assert_eq!(next_payload(&mut received).await, json!(["server", "welcome"]));

    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn send_should_await_completion() -> anyhow::Result<()> {
    let mut hub = MockHub::start().await;
    let manager = SocketManager::new(config(&hub))?;
    let mut received = channel_listener(&manager, "ReceiveMessage");

    manager.connect().await?;
    wait_for_state(&manager, ConnectionState::Connected).await;
    next_payload(&mut received).await;

    manager.send("SendMessage", "hi").await?;

    let invocation = hub.recv_message().await;
    assert_eq!(invocation["type"], 1);
    assert_eq!(invocation["target"], "SendMessage");
    assert_eq!(invocation["arguments"], json!(["hi"]));
    assert_eq!(next_payload(&mut received).await, json!(["echo", "hi"]));

    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn completion_error_should_surface_to_caller() -> anyhow::Result<()> {
    let hub = MockHub::start().await;
    let manager = SocketManager::new(config(&hub))?;

    manager.connect().await?;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let err = manager.send("Fail", &json!({"n": 1})).await.unwrap_err();

    assert_eq!(err.kind(), Kind::Transport);
    assert!(err.to_string().contains("boom"), "{err}");
    assert_eq!(manager.connection_state(), ConnectionState::Connected);

    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn token_should_travel_as_access_token_query() -> anyhow::Result<()> {
    let mut hub = MockHub::start().await;
    let mut config = config(&hub);
    config.auth = Some(AuthToken::from_static("t0k"));
    let manager = SocketManager::new(config)?;

    manager.connect().await?;

    let uri = hub.recv_uri().await;
    assert!(uri.starts_with("/chathub?"), "unexpected uri {uri}");
    assert!(uri.contains("access_token=t0k"), "token missing from {uri}");

    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn close_message_should_trigger_reconnect() -> anyhow::Result<()> {
    let hub = MockHub::start().await;
    let manager = SocketManager::new(config(&hub))?;
    let mut received = channel_listener(&manager, "ReceiveMessage");
    let mut events = manager.lifecycle_events();

    manager.connect().await?;
    events_until(&mut events, "connect").await;
    next_payload(&mut received).await;

    hub.push(&json!({"type": 7, "error": "Server is shutting down", "allowReconnect": true}));
    let seen = events_until(&mut events, "connect").await;

    assert_eq!(
        seen[0],
        LifecycleEvent::Disconnect {
            reason: "Server is shutting down".to_owned()
        }
    );
    assert_eq!(
        next_payload(&mut received).await,
        json!(["server", "welcome"]),
        "listener not re-attached after reconnect"
    );

    manager.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn zero_keep_alive_should_be_rejected_before_connecting() {
    let hub = MockHub::start().await;
    let mut config = config(&hub);
    config.hub_rpc.keep_alive_interval = Duration::ZERO;

    let err = SocketManager::new(config).unwrap_err();

    assert_eq!(err.kind(), Kind::Validation);
    assert!(
        err.to_string().contains("keep_alive_interval"),
        "unexpected error: {err}"
    );
}
