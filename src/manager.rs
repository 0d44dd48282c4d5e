#![expect(
    clippy::module_name_repetitions,
    reason = "Manager types expose their domain in the name for clarity"
)]

//! Connection controller.
//!
//! A [`SocketManager`] owns at most one live transport, drives the state
//! machine `Disconnected -> Connecting -> Connected -> Reconnecting`, runs the
//! retry loop and keeps the listener registry in sync with whichever transport
//! is current.
//!
//! Every connection episode (one `connect()` until success, exhaustion or
//! `disconnect()`) runs in its own task tagged with a generation number.
//! Anything that task tries to publish after the generation moved on is
//! discarded, so a superseded attempt can never overwrite newer state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::auth::AuthToken;
use crate::backend::{self, Backend, OpenRequest, Transport, TransportEvent, TransportEvents};
use crate::config::{BackendKind, ManagerConfig};
use crate::document;
use crate::error::Error;
use crate::listener::{LifecycleEvent, Listener, ListenerId, ListenerRegistry};
use crate::retry::{RetryEngine, RetryState};

/// Broadcast channel capacity for lifecycle events.
const EVENT_CAPACITY: usize = 256;

/// Reason attached to the `disconnect` event raised by [`SocketManager::disconnect`].
pub const MANUAL_DISCONNECT: &str = "manual";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ConnectionState {
    /// No transport and no attempt in progress
    Disconnected,
    /// First attempt of an episode in progress
    Connecting,
    /// A transport is open and usable
    Connected,
    /// Waiting out a backoff delay or retrying after a failure
    Reconnecting,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

struct Session {
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    cancel: Option<CancellationToken>,
    retry: RetryState,
}

struct Inner {
    config: ManagerConfig,
    backend: Arc<dyn Backend>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    listeners: ListenerRegistry,
    session: Mutex<Session>,
    /// Serializes state changes with the dispatch of their lifecycle event.
    transitions: Mutex<()>,
}

/// Unified real-time connection manager.
///
/// Cheap to clone; clones share the same connection. Listeners may be
/// registered at any time and survive reconnects.
///
/// # Example
///
/// ```no_run
/// use cap_socket::config::{BackendKind, ManagerConfig};
/// use cap_socket::SocketManager;
///
/// # async fn run() -> cap_socket::Result<()> {
/// let manager = SocketManager::new(
///     ManagerConfig::builder()
///         .backend(BackendKind::EventSocket)
///         .url("http://localhost:3001")
///         .build(),
/// )?;
///
/// manager.on("message", |payload| println!("server says {payload}"));
/// manager.connect().await?;
/// manager.send("SendMessage", "hello").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SocketManager {
    inner: Arc<Inner>,
}

impl SocketManager {
    /// Build a manager for `config` using the backend adapter it names.
    ///
    /// Does not connect.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::for_config(&config)?;
        Ok(Self::from_parts(config, backend))
    }

    /// Build a manager around a caller-supplied backend.
    ///
    /// The backend must implement the transport family named by `config.backend`.
    pub fn with_backend(config: ManagerConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        if backend.kind() != config.backend {
            return Err(Error::validation(format!(
                "backend implements {} but the configuration asks for {}",
                backend.kind(),
                config.backend
            )));
        }
        Ok(Self::from_parts(config, backend))
    }

    /// Build a manager from the runtime document served under `base_url`.
    ///
    /// Returns `None` when the document selects no backend or when anything
    /// about it is unusable: missing, malformed, or describing an invalid
    /// configuration. Problems are logged, never raised.
    pub async fn from_document(base_url: &str) -> Option<Self> {
        match Self::load_document(base_url).await {
            Ok(manager) => manager,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, base_url, "runtime configuration disables sockets");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                None
            }
        }
    }

    async fn load_document(base_url: &str) -> Result<Option<Self>> {
        let client = reqwest::Client::builder().build()?;
        let document = document::fetch(&client, base_url).await;
        match document.into_manager_config()? {
            Some(config) => Self::new(config).map(Some),
            None => Ok(None),
        }
    }

    fn from_parts(config: ManagerConfig, backend: Arc<dyn Backend>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                state_tx,
                events_tx,
                listeners: ListenerRegistry::new(),
                session: Mutex::new(Session {
                    generation: 0,
                    transport: None,
                    cancel: None,
                    retry: RetryState::default(),
                }),
                transitions: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events.
    ///
    /// Each call returns a new independent receiver that sees every event
    /// raised after the call, in the same order listeners see them.
    #[must_use]
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Retry bookkeeping of the current episode.
    #[must_use]
    pub fn retry_state(&self) -> RetryState {
        self.inner.session().retry.clone()
    }

    /// Number of listeners registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.count(event)
    }

    /// Start a connection episode.
    ///
    /// No-op when already connected or connecting. From `Reconnecting` the
    /// pending wait is abandoned and a fresh episode starts immediately.
    ///
    /// Returns once the episode is started, unless
    /// [`ManagerConfig::wait_for_connection`] is set, in which case it waits
    /// for the episode to either connect or give up.
    pub async fn connect(&self) -> Result<()> {
        self.start_episode();

        if !self.inner.config.wait_for_connection {
            return Ok(());
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        let settled = *state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Disconnected
                )
            })
            .await
            .map_err(|_e| Error::connection_failed("manager state channel closed"))?;

        if settled.is_connected() {
            Ok(())
        } else {
            let reason = self
                .retry_state()
                .last_failure_reason
                .unwrap_or_else(|| "disconnected before the connection was established".to_owned());
            Err(Error::connection_failed(reason))
        }
    }

    /// Close the current transport, cancel any pending retry and settle in `Disconnected`.
    ///
    /// Emits `disconnect` with reason `"manual"` unless the manager was already disconnected.
    pub async fn disconnect(&self) {
        let transport = {
            let _serial = lock(&self.inner.transitions);
            let (transport, previous) = {
                let mut session = self.inner.session();
                session.generation = session.generation.wrapping_add(1);
                if let Some(cancel) = session.cancel.take() {
                    cancel.cancel();
                }
                session.retry = RetryState::default();
                let previous = self.inner.state_tx.send_replace(ConnectionState::Disconnected);
                (session.transport.take(), previous)
            };

            if previous != ConnectionState::Disconnected {
                self.inner.emit(LifecycleEvent::Disconnect {
                    reason: MANUAL_DISCONNECT.to_owned(),
                });
            }
            transport
        };

        if let Some(transport) = transport {
            close_quietly(transport).await;
        }
    }

    /// Send an application event through the current transport.
    ///
    /// Fails immediately with [`crate::error::Kind::NotConnected`] unless the
    /// manager is connected; nothing is queued.
    pub async fn send<P: Serialize + ?Sized>(&self, event: &str, payload: &P) -> Result<()> {
        let transport = {
            let session = self.inner.session();
            let state = *self.inner.state_tx.borrow();
            match &session.transport {
                Some(transport) if state.is_connected() && transport.is_ready() => {
                    Arc::clone(transport)
                }
                _ => return Err(Error::not_connected(state)),
            }
        };

        let payload = serde_json::to_value(payload)?;
        transport.send_message(event, payload).await?;
        Ok(())
    }

    /// Register a listener for `event`.
    ///
    /// Application events are attached to the live transport right away and
    /// to every later transport. Lifecycle events (`connect`, `disconnect`,
    /// `reconnecting`, `error`) are raised by the manager itself.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let session = self.inner.session();
        let id = self.inner.listeners.insert(event, Arc::clone(&listener));
        if !LifecycleEvent::is_reserved(event)
            && let Some(transport) = &session.transport
        {
            transport.subscribe(id, event, listener);
        }
        id
    }

    /// Remove a listener registered with [`SocketManager::on`].
    pub fn off(&self, id: ListenerId) -> bool {
        let session = self.inner.session();
        let removed = self.inner.listeners.remove(id);
        if removed && let Some(transport) = &session.transport {
            transport.unsubscribe(id);
        }
        removed
    }

    fn start_episode(&self) {
        let _serial = lock(&self.inner.transitions);
        let mut session = self.inner.session();

        let current = *self.inner.state_tx.borrow();
        if matches!(
            current,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return;
        }

        session.generation = session.generation.wrapping_add(1);
        if let Some(previous) = session.cancel.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        session.cancel = Some(cancel.clone());
        session.retry = RetryState::default();
        let generation = session.generation;
        self.inner.state_tx.send_replace(ConnectionState::Connecting);
        drop(session);

        crate::debug_log!(
            self.inner.config.debug,
            backend = %self.inner.config.backend,
            url = %self.inner.config.url,
            "connecting"
        );

        tokio::spawn(Arc::clone(&self.inner).run_episode(generation, cancel));
    }
}

impl fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketManager")
            .field("backend", &self.inner.config.backend)
            .field("url", &self.inner.config.url)
            .field("state", &self.connection_state())
            .field("listeners", &self.inner.listeners)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    /// Dispatch to registered listeners, then to lifecycle subscribers.
    fn emit(&self, event: LifecycleEvent) {
        self.listeners.dispatch(event.name(), &event.payload());
        _ = self.events_tx.send(event);
    }

    /// Apply `update`, publish `state` and raise `event`, unless `generation` is stale.
    fn transition<F>(
        &self,
        generation: u64,
        state: ConnectionState,
        event: Option<LifecycleEvent>,
        update: F,
    ) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let _serial = lock(&self.transitions);
        {
            let mut session = self.session();
            if session.generation != generation {
                return false;
            }
            update(&mut session);
            self.state_tx.send_replace(state);
        }
        if let Some(event) = event {
            self.emit(event);
        }
        true
    }

    /// One connection episode: open, supervise, back off, repeat.
    async fn run_episode(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let config = &self.config;
        let mut retry = RetryEngine::new(config.reconnect);

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if retry.is_exhausted() {
                self.give_up(generation, &retry);
                return;
            }

            let (events, mut events_rx) = TransportEvents::channel();
            let mut request = OpenRequest::new(
                config.url.clone(),
                config.auth.as_ref().and_then(AuthToken::resolve),
                events,
            );
            request.debug = config.debug;

            crate::debug_log!(
                config.debug,
                attempt = retry.state().attempt_count.saturating_add(1),
                "opening transport"
            );

            let opened = tokio::select! {
                () = cancel.cancelled() => return,
                result = timeout(config.connect_timeout, self.backend.open(request)) => match result {
                    Ok(Ok(transport)) => Ok(transport),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_elapsed) => Err(format!(
                        "connection attempt timed out after {:?}",
                        config.connect_timeout
                    )),
                },
            };

            let reason = match opened {
                Ok(transport) => {
                    if !self.install(generation, &transport, &mut retry) {
                        close_quietly(transport).await;
                        return;
                    }

                    let Some(reason) = supervise(&cancel, &mut events_rx).await else {
                        return;
                    };

                    let detached = self.transition(
                        generation,
                        ConnectionState::Reconnecting,
                        Some(LifecycleEvent::Disconnect {
                            reason: reason.clone(),
                        }),
                        |session| session.transport = None,
                    );
                    close_quietly(transport).await;
                    if !detached {
                        return;
                    }
                    reason
                }
                Err(reason) => reason,
            };

            let step = retry.record_failure(reason.clone());
            crate::debug_log!(
                config.debug,
                attempt = step.attempt,
                delay = ?step.delay,
                reason = %reason,
                "reconnecting"
            );

            let state = retry.state().clone();
            let current = self.transition(
                generation,
                ConnectionState::Reconnecting,
                Some(LifecycleEvent::Reconnecting {
                    attempt: step.attempt,
                    reason,
                }),
                |session| session.retry = state,
            );
            if !current {
                return;
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep(step.delay) => {}
            }
        }
    }

    /// Attach listeners to a freshly opened transport and publish `Connected`.
    fn install(
        &self,
        generation: u64,
        transport: &Arc<dyn Transport>,
        retry: &mut RetryEngine,
    ) -> bool {
        let installed = self.transition(
            generation,
            ConnectionState::Connected,
            Some(LifecycleEvent::Connect),
            |session| {
                for (event, id, listener) in self.listeners.snapshot() {
                    if !LifecycleEvent::is_reserved(&event) {
                        transport.subscribe(id, &event, listener);
                    }
                }
                crate::debug_log!(self.config.debug, "listeners attached to transport");

                retry.reset();
                session.retry = RetryState::default();
                session.transport = Some(Arc::clone(transport));
            },
        );

        if installed {
            transport.start_dispatch();
        }
        installed
    }

    fn give_up(&self, generation: u64, retry: &RetryEngine) {
        let state = retry.state().clone();
        let reason = format!(
            "max attempts exceeded ({}), last error: {}",
            self.config.reconnect.max_attempts,
            state.last_failure_reason.as_deref().unwrap_or("unknown"),
        );

        #[cfg(feature = "tracing")]
        tracing::warn!(url = %self.config.url, %reason, "giving up on connection");

        self.transition(
            generation,
            ConnectionState::Disconnected,
            Some(LifecycleEvent::Error { reason }),
            |session| {
                session.cancel = None;
                session.retry = state;
            },
        );
    }
}

/// Wait until the transport reports it is gone. `None` when the episode was cancelled.
async fn supervise(
    cancel: &CancellationToken,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Option<String> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            event = events.recv() => match event {
                Some(TransportEvent::Opened) => {}
                Some(TransportEvent::Closed { reason } | TransportEvent::TransientFailure { reason }) => {
                    return Some(reason);
                }
                None => return Some("transport dropped".to_owned()),
            },
        }
    }
}

async fn close_quietly(transport: Arc<dyn Transport>) {
    if let Err(e) = transport.close().await {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %e, "failed to close transport");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }
}

// Session and transition state stay consistent across a panicking listener.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
