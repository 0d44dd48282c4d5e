//! Backend adapters.
//!
//! Each transport family implements [`Backend`] (how to open a connection) and
//! hands back a [`Transport`] handle (what a live connection can do). The
//! manager only ever talks to these traits; which implementation sits behind
//! them is decided once, by [`for_config`].
//!
//! Adapters report what happens to a live connection through
//! [`TransportEvents`], normalized to three notifications regardless of the
//! wire protocol: opened, closed and transient failure.

pub mod error;
pub mod event_socket;
pub mod hub_rpc;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use secrecy::SecretString;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

pub use error::TransportError;
pub use event_socket::EventSocketBackend;
pub use hub_rpc::HubRpcBackend;

use crate::config::{BackendKind, ManagerConfig};
use crate::listener::{Listener, ListenerId, ListenerRegistry};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Semantic notifications a transport raises about itself.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The handshake completed and the handle is usable.
    Opened,
    /// The connection ended, either side initiated.
    Closed { reason: String },
    /// The connection became unusable (I/O error, heartbeat timeout).
    TransientFailure { reason: String },
}

/// Sending half of the notification channel given to a backend on every open.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn closed<S: Into<String>>(&self, reason: S) {
        self.emit(TransportEvent::Closed {
            reason: reason.into(),
        });
    }

    pub fn transient_failure<S: Into<String>>(&self, reason: S) {
        self.emit(TransportEvent::TransientFailure {
            reason: reason.into(),
        });
    }

    fn emit(&self, event: TransportEvent) {
        // A dropped receiver means the manager already moved past this handle.
        _ = self.tx.send(event);
    }
}

/// Everything a backend needs for one connection attempt.
#[non_exhaustive]
#[derive(Debug)]
pub struct OpenRequest {
    /// Endpoint URL from the manager configuration
    pub url: String,
    /// Token resolved for this attempt only
    pub token: Option<SecretString>,
    /// Where the resulting transport reports lifecycle notifications
    pub events: TransportEvents,
    /// Mirrors `ManagerConfig::debug`
    pub debug: bool,
}

impl OpenRequest {
    #[must_use]
    pub fn new(url: String, token: Option<SecretString>, events: TransportEvents) -> Self {
        Self {
            url,
            token,
            events,
            debug: false,
        }
    }
}

/// Opens transports of one kind.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Transport family implemented by this backend.
    fn kind(&self) -> BackendKind;

    /// Perform the handshake and return a live handle.
    ///
    /// The manager bounds this call with its connect timeout and drops the
    /// future if the attempt is superseded.
    async fn open(&self, request: OpenRequest) -> Result<Arc<dyn Transport>, TransportError>;
}

/// A live connection handle. Owned by the manager; never exposed to callers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether the handle can still carry messages.
    fn is_ready(&self) -> bool;

    /// Deliver one application event to the remote side.
    async fn send_message(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Append a listener for inbound `event`. Existing listeners are kept.
    fn subscribe(&self, id: ListenerId, event: &str, listener: Listener);

    /// Detach a listener previously attached with [`Transport::subscribe`].
    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Begin delivering inbound events. Called once the manager has attached its listeners.
    fn start_dispatch(&self);

    /// Best-effort shutdown. Never panics; failures are reported, not raised.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Select the adapter for a configuration. Pure function of `config.backend`.
pub fn for_config(config: &ManagerConfig) -> crate::Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::EventSocket => Arc::new(EventSocketBackend::new(config.event_socket.clone())?),
        BackendKind::HubRpc => Arc::new(HubRpcBackend::new(config.hub_rpc)?),
    };
    Ok(backend)
}

/// Collapse positional event arguments into one payload value.
pub(crate) fn payload_from_args(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.pop().unwrap_or(Value::Null),
        _ => Value::Array(args),
    }
}

/// Endpoint URL rewritten to a WebSocket scheme.
pub(crate) fn websocket_url(endpoint: &str) -> Result<Url, TransportError> {
    rewrite_scheme(endpoint, "ws", "wss")
}

/// Endpoint URL rewritten to an HTTP scheme.
pub(crate) fn http_url(endpoint: &str) -> Result<Url, TransportError> {
    rewrite_scheme(endpoint, "http", "https")
}

fn rewrite_scheme(endpoint: &str, plain: &str, secure: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint)?;
    let scheme = match url.scheme() {
        "http" | "ws" => plain,
        "https" | "wss" => secure,
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme `{other}` in {endpoint}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(endpoint.to_owned()))?;
    Ok(url)
}

/// Next text frame during a handshake, skipping control frames.
pub(crate) async fn next_text(stream: &mut WsStream) -> Result<String, TransportError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// What the protocol layer wants done with one inbound text frame.
pub(crate) enum Inbound {
    Continue,
    Reply(String),
    Close(String),
}

/// Shared pieces of a WebSocket-backed transport handle.
pub(crate) struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    handlers: Arc<ListenerRegistry>,
    ready: Arc<AtomicBool>,
    armed: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Link {
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_e| TransportError::NotReady)
    }

    pub(crate) fn subscribe(&self, id: ListenerId, event: &str, listener: Listener) {
        self.handlers.insert_with_id(id, event, listener);
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        self.handlers.remove(id)
    }

    pub(crate) fn start_dispatch(&self) {
        self.armed.send_replace(true);
    }

    pub(crate) fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.shutdown.cancel();
    }
}

/// Tunables of the pump loop that differ per protocol.
pub(crate) struct PumpOptions {
    /// Silence from the server longer than this is a transient failure.
    pub(crate) idle_timeout: Duration,
    /// Periodic client frame, if the protocol wants one.
    pub(crate) keep_alive: Option<(Duration, String)>,
    /// Frame sent before a locally requested close.
    pub(crate) farewell: Option<String>,
    /// Text already received during the handshake, processed before the socket is read.
    pub(crate) backlog: Vec<String>,
}

/// Spawn the I/O task for an opened socket and return the handle pieces.
///
/// `on_text` runs on the I/O task for every inbound text frame, after
/// [`Link::start_dispatch`] was called.
pub(crate) fn spawn_pump<F>(
    stream: WsStream,
    handlers: Arc<ListenerRegistry>,
    events: TransportEvents,
    options: PumpOptions,
    on_text: F,
) -> Link
where
    F: FnMut(&str) -> Inbound + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (armed_tx, armed_rx) = watch::channel(false);
    let ready = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();

    tokio::spawn(run_pump(
        stream,
        outbound_rx,
        armed_rx,
        Arc::clone(&ready),
        shutdown.clone(),
        events,
        options,
        on_text,
    ));

    Link {
        outbound: outbound_tx,
        handlers,
        ready,
        armed: armed_tx,
        shutdown,
    }
}

#[expect(
    clippy::too_many_arguments,
    reason = "The pump owns every piece of the connection; bundling them would only move the list"
)]
async fn run_pump<F>(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut armed: watch::Receiver<bool>,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
    events: TransportEvents,
    options: PumpOptions,
    mut on_text: F,
) where
    F: FnMut(&str) -> Inbound + Send + 'static,
{
    let (mut write, mut read) = stream.split();

    // Hold inbound frames until the manager has attached its listeners.
    tokio::select! {
        () = shutdown.cancelled() => {
            _ = write.close().await;
            ready.store(false, Ordering::Release);
            return;
        }
        armed_ok = async { armed.wait_for(|armed| *armed).await.is_ok() } => {
            if !armed_ok {
                ready.store(false, Ordering::Release);
                return;
            }
        }
    }

    let mut outcome = None;
    for text in &options.backlog {
        match on_text(text) {
            Inbound::Continue => {}
            Inbound::Reply(reply) => {
                if let Err(e) = write.send(Message::Text(reply.into())).await {
                    outcome = Some(TransportEvent::TransientFailure {
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            Inbound::Close(reason) => {
                outcome = Some(TransportEvent::Closed { reason });
                break;
            }
        }
    }

    let idle = sleep(options.idle_timeout);
    tokio::pin!(idle);
    // A zero period disables keep-alive.
    let mut keep_alive = options
        .keep_alive
        .filter(|(period, _)| !period.is_zero())
        .map(|(period, frame)| (interval_at(Instant::now() + period, period), frame));

    while outcome.is_none() {
        tokio::select! {
            () = shutdown.cancelled() => {
                if let Some(frame) = &options.farewell {
                    _ = write.send(Message::Text(frame.clone().into())).await;
                }
                _ = write.close().await;
                break;
            }

            frame = read.next() => {
                idle.as_mut().reset(Instant::now() + options.idle_timeout);
                match frame {
                    Some(Ok(Message::Text(text))) => match on_text(text.as_str()) {
                        Inbound::Continue => {}
                        Inbound::Reply(reply) => {
                            if let Err(e) = write.send(Message::Text(reply.into())).await {
                                outcome = Some(TransportEvent::TransientFailure { reason: e.to_string() });
                            }
                        }
                        Inbound::Close(reason) => {
                            outcome = Some(TransportEvent::Closed { reason });
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "transport close".to_owned());
                        outcome = Some(TransportEvent::Closed { reason });
                    }
                    Some(Ok(_)) => {
                        // Control and binary frames only count as liveness.
                    }
                    Some(Err(e)) => {
                        outcome = Some(TransportEvent::TransientFailure { reason: e.to_string() });
                    }
                    None => {
                        outcome = Some(TransportEvent::Closed { reason: "transport close".to_owned() });
                    }
                }
            }

            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = write.send(message).await {
                        outcome = Some(TransportEvent::TransientFailure { reason: e.to_string() });
                    }
                }
                None => {
                    // Handle dropped without close.
                    _ = write.close().await;
                    break;
                }
            },

            frame = async {
                match keep_alive.as_mut() {
                    Some((ticker, frame)) => {
                        ticker.tick().await;
                        frame.clone()
                    }
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    outcome = Some(TransportEvent::TransientFailure { reason: e.to_string() });
                }
            }

            () = &mut idle => {
                outcome = Some(TransportEvent::TransientFailure {
                    reason: format!("no frame received within {:?}", options.idle_timeout),
                });
            }
        }
    }

    ready.store(false, Ordering::Release);
    match outcome {
        Some(TransportEvent::Closed { reason }) => events.closed(reason),
        Some(TransportEvent::TransientFailure { reason }) => events.transient_failure(reason),
        Some(TransportEvent::Opened) | None => {}
    }
}
