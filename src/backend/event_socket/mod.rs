//! Event socket backend: Socket.IO v5 over an Engine.IO v4 WebSocket.
//!
//! Only the WebSocket transport is spoken; there is no long-polling fallback.
//! The path of the endpoint URL names the namespace to join, so
//! `http://host/chat` talks to `/chat` through the configured mount path.
//! Before each handshake the endpoint's base path can be probed over HTTP so a
//! dead server fails fast and feeds the manager's retry loop.

mod packet;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt as _;
use reqwest::Client;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use self::packet::{EnginePacket, OpenPayload, SocketPacket};
use super::{
    Backend, Inbound, Link, OpenRequest, PumpOptions, Transport, TransportError, WsStream,
    http_url, next_text, spawn_pump, websocket_url,
};
use crate::config::{BackendKind, EventSocketOptions};
use crate::listener::{Listener, ListenerId, ListenerRegistry};

/// Opens [`EventSocketTransport`]s.
#[derive(Debug, Clone)]
pub struct EventSocketBackend {
    options: EventSocketOptions,
    client: Client,
}

impl EventSocketBackend {
    pub fn new(options: EventSocketOptions) -> crate::Result<Self> {
        Ok(Self {
            options,
            client: Client::builder().build()?,
        })
    }

    /// Namespace joined for `endpoint`.
    pub fn namespace(endpoint: &str) -> Result<String, TransportError> {
        Ok(packet::namespace_from_path(Url::parse(endpoint)?.path()))
    }

    /// WebSocket URL of the Engine.IO endpoint for `endpoint`.
    pub fn socket_url(&self, endpoint: &str) -> Result<Url, TransportError> {
        let mut url = websocket_url(endpoint)?;
        let path = if self.options.path.starts_with('/') {
            self.options.path.clone()
        } else {
            format!("/{}", self.options.path)
        };
        url.set_path(&path);
        url.set_query(Some("EIO=4&transport=websocket"));
        url.set_fragment(None);
        Ok(url)
    }

    /// GET the endpoint's base path. Anything below 500 counts as alive.
    pub async fn probe(&self, endpoint: &str) -> Result<(), TransportError> {
        let mut url = http_url(endpoint)?;
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);

        let response = self
            .client
            .get(url)
            .timeout(self.options.probe_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Probe {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for EventSocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EventSocket
    }

    async fn open(&self, request: OpenRequest) -> Result<Arc<dyn Transport>, TransportError> {
        if self.options.probe {
            self.probe(&request.url).await?;
            crate::debug_log!(request.debug, url = %request.url, "liveness probe passed");
        }

        let namespace = Self::namespace(&request.url)?;
        let url = self.socket_url(&request.url)?;
        let (mut stream, _) = connect_async(url.as_str()).await?;

        let session = read_open(&mut stream).await?;
        stream
            .send(Message::Text(
                packet::encode_connect(&namespace, request.token.as_ref()).into(),
            ))
            .await?;
        await_namespace(&mut stream, &namespace).await?;
        crate::debug_log!(request.debug, url = %url, namespace = %namespace, "event socket connected");

        let handlers = Arc::new(ListenerRegistry::new());
        let dispatch = Arc::clone(&handlers);
        let joined = namespace.clone();
        let debug = request.debug;
        let link = spawn_pump(
            stream,
            handlers,
            request.events.clone(),
            PumpOptions {
                idle_timeout: Duration::from_millis(
                    session.ping_interval.saturating_add(session.ping_timeout),
                ),
                keep_alive: None,
                farewell: Some(packet::encode_disconnect(&namespace)),
                backlog: Vec::new(),
            },
            move |text| on_frame(&dispatch, &joined, text, debug),
        );

        request.events.opened();
        Ok(Arc::new(EventSocketTransport { link, namespace }))
    }
}

/// Live event socket connection.
pub struct EventSocketTransport {
    link: Link,
    namespace: String,
}

#[async_trait]
impl Transport for EventSocketTransport {
    fn is_ready(&self) -> bool {
        self.link.is_ready()
    }

    async fn send_message(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.link.send_text(packet::encode_event(&self.namespace, event, payload)?)
    }

    fn subscribe(&self, id: ListenerId, event: &str, listener: Listener) {
        self.link.subscribe(id, event, listener);
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.link.unsubscribe(id)
    }

    fn start_dispatch(&self) {
        self.link.start_dispatch();
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.shutdown();
        Ok(())
    }
}

async fn read_open(stream: &mut WsStream) -> Result<OpenPayload, TransportError> {
    let text = next_text(stream).await?;
    match packet::decode_engine(&text)? {
        EnginePacket::Open(session) => Ok(session),
        other => Err(TransportError::Handshake(format!(
            "expected engine open packet, got {other:?}"
        ))),
    }
}

async fn await_namespace(stream: &mut WsStream, namespace: &str) -> Result<(), TransportError> {
    loop {
        let text = next_text(stream).await?;
        match packet::decode_engine(&text)? {
            EnginePacket::Ping => {
                stream.send(Message::Text(packet::PONG.into())).await?;
            }
            EnginePacket::Message(data) => {
                let (addressed, content) = packet::decode_socket(data)?;
                if addressed != namespace {
                    continue;
                }
                match content {
                    SocketPacket::Connect => return Ok(()),
                    SocketPacket::ConnectError { message } => {
                        return Err(TransportError::Handshake(message));
                    }
                    SocketPacket::Disconnect => return Err(TransportError::ConnectionClosed),
                    SocketPacket::Event { .. } | SocketPacket::Unsupported(_) => {}
                }
            }
            EnginePacket::Close => return Err(TransportError::ConnectionClosed),
            EnginePacket::Open(_) | EnginePacket::Pong | EnginePacket::Noop => {}
        }
    }
}

fn on_frame(handlers: &ListenerRegistry, namespace: &str, text: &str, debug: bool) -> Inbound {
    let data = match packet::decode_engine(text) {
        Ok(EnginePacket::Message(data)) => data,
        Ok(EnginePacket::Ping) => return Inbound::Reply(packet::PONG.to_owned()),
        Ok(EnginePacket::Close) => return Inbound::Close("transport close".to_owned()),
        Ok(_) => return Inbound::Continue,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "dropping malformed engine frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return Inbound::Continue;
        }
    };

    match packet::decode_socket(data) {
        Ok((addressed, _)) if addressed != namespace => {
            crate::debug_log!(debug, namespace = %addressed, "ignoring packet for another namespace");
            Inbound::Continue
        }
        Ok((_, SocketPacket::Event { event, payload })) => {
            if handlers.dispatch(&event, &payload) == 0 {
                crate::debug_log!(debug, event = %event, "no listener for event");
            }
            Inbound::Continue
        }
        Ok((_, SocketPacket::Disconnect)) => Inbound::Close("io server disconnect".to_owned()),
        Ok((_, SocketPacket::ConnectError { message })) => Inbound::Close(message),
        Ok((_, SocketPacket::Connect | SocketPacket::Unsupported(_))) => Inbound::Continue,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "dropping malformed socket packet");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            Inbound::Continue
        }
    }
}
