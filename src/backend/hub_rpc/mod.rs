//! Hub RPC backend: the JSON hub protocol over WebSocket.
//!
//! An open performs the optional negotiate round trip, connects the WebSocket
//! transport and completes the protocol handshake. Outgoing sends are hub
//! invocations that resolve when the server's completion message arrives.

mod protocol;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::SinkExt as _;
use reqwest::Client;
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use self::protocol::{HubMessage, NegotiateResponse};
use super::{
    Backend, Inbound, Link, OpenRequest, PumpOptions, Transport, TransportError, http_url,
    next_text, payload_from_args, spawn_pump, websocket_url,
};
use crate::config::{BackendKind, HubRpcOptions};
use crate::listener::{Listener, ListenerId, ListenerRegistry};

const MAX_NEGOTIATE_REDIRECTS: usize = 5;

type Pending = DashMap<String, oneshot::Sender<Result<(), String>>>;

/// Where the WebSocket transport should connect after negotiation.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub endpoint: String,
    pub connection_id: Option<String>,
    pub token: Option<SecretString>,
}

/// Opens [`HubRpcTransport`]s.
#[derive(Debug, Clone)]
pub struct HubRpcBackend {
    options: HubRpcOptions,
    client: Client,
}

impl HubRpcBackend {
    pub fn new(options: HubRpcOptions) -> crate::Result<Self> {
        Ok(Self {
            options,
            client: Client::builder().build()?,
        })
    }

    /// Run `POST {endpoint}/negotiate`, following redirects to other endpoints.
    pub async fn negotiate(
        &self,
        endpoint: &str,
        token: Option<SecretString>,
    ) -> Result<Negotiated, TransportError> {
        let mut endpoint = endpoint.to_owned();
        let mut token = token;

        for _ in 0..=MAX_NEGOTIATE_REDIRECTS {
            let mut request = self.client.post(negotiate_url(&endpoint)?);
            if let Some(token) = &token {
                request = request.bearer_auth(token.expose_secret());
            }

            let response: NegotiateResponse =
                request.send().await?.error_for_status()?.json().await?;

            if let Some(error) = response.error {
                return Err(TransportError::Handshake(error));
            }

            if let Some(redirect) = response.url {
                endpoint = redirect;
                if let Some(access_token) = response.access_token {
                    token = Some(SecretString::from(access_token));
                }
                continue;
            }

            if !response.supports_websockets() {
                return Err(TransportError::Handshake(
                    "server does not offer the WebSockets transport".to_owned(),
                ));
            }

            return Ok(Negotiated {
                connection_id: response.connection_id().map(str::to_owned),
                endpoint,
                token,
            });
        }

        Err(TransportError::Handshake(format!(
            "negotiate redirected more than {MAX_NEGOTIATE_REDIRECTS} times"
        )))
    }

    /// WebSocket URL for a negotiated (or skipped) session.
    pub fn socket_url(&self, negotiated: &Negotiated) -> Result<Url, TransportError> {
        let mut url = websocket_url(&negotiated.endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(id) = &negotiated.connection_id {
                query.append_pair("id", id);
            }
            if let Some(token) = &negotiated.token {
                query.append_pair("access_token", token.expose_secret());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

#[async_trait]
impl Backend for HubRpcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HubRpc
    }

    async fn open(&self, request: OpenRequest) -> Result<Arc<dyn Transport>, TransportError> {
        let negotiated = if self.options.skip_negotiation {
            Negotiated {
                endpoint: request.url.clone(),
                connection_id: None,
                token: request.token.clone(),
            }
        } else {
            self.negotiate(&request.url, request.token.clone()).await?
        };

        let url = self.socket_url(&negotiated)?;
        let (mut stream, _) = connect_async(url.as_str()).await?;

        stream
            .send(Message::Text(protocol::handshake_request().into()))
            .await?;
        let backlog = protocol::parse_handshake(&next_text(&mut stream).await?)?;
        crate::debug_log!(request.debug, endpoint = %negotiated.endpoint, "hub handshake completed");

        let handlers = Arc::new(ListenerRegistry::new());
        let pending = Arc::new(Pending::new());
        let guard = PendingGuard(Arc::clone(&pending));
        let dispatch = Arc::clone(&handlers);
        let debug = request.debug;
        let link = spawn_pump(
            stream,
            handlers,
            request.events.clone(),
            PumpOptions {
                idle_timeout: self.options.server_timeout,
                keep_alive: Some((self.options.keep_alive_interval, protocol::ping_frame())),
                farewell: None,
                backlog,
            },
            move |text| on_frame(&dispatch, &guard.0, text, debug),
        );

        request.events.opened();
        Ok(Arc::new(HubRpcTransport {
            link,
            pending,
            next_invocation: AtomicU64::new(0),
        }))
    }
}

/// Live hub connection.
pub struct HubRpcTransport {
    link: Link,
    pending: Arc<Pending>,
    next_invocation: AtomicU64,
}

#[async_trait]
impl Transport for HubRpcTransport {
    fn is_ready(&self) -> bool {
        self.link.is_ready()
    }

    async fn send_message(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let id = self
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let frame = HubMessage::invocation(id.clone(), event, payload).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        // Registered before the readiness check: the pump clears the table only after it marks the link down.
        if let Err(e) = self.link.send_text(frame) {
            self.pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(TransportError::Invocation(error)),
            Err(_closed) => Err(TransportError::ConnectionClosed),
        }
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

/// Fails every outstanding invocation once the pump that would complete it is gone.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.clear();
    }
}

fn negotiate_url(endpoint: &str) -> Result<Url, TransportError> {
    let mut url = http_url(endpoint)?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

fn on_frame(handlers: &ListenerRegistry, pending: &Pending, text: &str, debug: bool) -> Inbound {
    for frame in protocol::split_frames(text) {
        let message = match HubMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "dropping malformed hub message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                continue;
            }
        };

        match message.kind {
            protocol::INVOCATION => {
                if let Some(target) = message.target {
                    let payload = payload_from_args(message.arguments.unwrap_or_default());
                    if handlers.dispatch(&target, &payload) == 0 {
                        crate::debug_log!(debug, target = %target, "no listener for hub method");
                    }
                }
            }
            protocol::COMPLETION => {
                if let Some(id) = message.invocation_id
                    && let Some((_, tx)) = pending.remove(&id)
                {
                    let outcome = message.error.map_or(Ok(()), Err);
                    _ = tx.send(outcome);
                }
            }
            protocol::CLOSE => {
                return Inbound::Close(
                    message
                        .error
                        .unwrap_or_else(|| "server closed the connection".to_owned()),
                );
            }
            // Stream items and server-side cancellations never target this client.
            _ => {}
        }
    }
    Inbound::Continue
}
