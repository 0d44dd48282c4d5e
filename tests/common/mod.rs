#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every integration test uses every helper"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cap_socket::auth::ExposeSecret as _;
use cap_socket::backend::{Backend, OpenRequest, Transport, TransportError, TransportEvents};
use cap_socket::listener::{LifecycleEvent, Listener, ListenerId, ListenerRegistry};
use cap_socket::{BackendKind, ConnectionState, SocketManager};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep, timeout};

/// What the next open attempt does.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Fail(&'static str),
    Succeed,
    /// Succeed after a delay
    Delay(Duration),
    /// Never complete
    Hang,
}

/// Backend whose open attempts follow a script.
pub struct ScriptedBackend {
    kind: BackendKind,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    opens: Mutex<Vec<Instant>>,
    tokens: Mutex<Vec<Option<String>>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl ScriptedBackend {
    pub fn new<I>(kind: BackendKind, script: I, fallback: Outcome) -> Arc<Self>
    where
        I: IntoIterator<Item = Outcome>,
    {
        Arc::new(Self {
            kind,
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            opens: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock().unwrap()[index])
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn open(&self, request: OpenRequest) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.lock().unwrap().push(Instant::now());
        self.tokens
            .lock()
            .unwrap()
            .push(request.token.as_ref().map(|t| t.expose_secret().to_owned()));

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        match outcome {
            Outcome::Fail(reason) => return Err(TransportError::Handshake(reason.to_owned())),
            Outcome::Hang => std::future::pending::<()>().await,
            Outcome::Delay(delay) => sleep(delay).await,
            Outcome::Succeed => {}
        }

        let transport = Arc::new(MockTransport::new(request.events));
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// In-memory transport recording everything the manager does with it.
pub struct MockTransport {
    events: TransportEvents,
    ready: AtomicBool,
    dispatching: AtomicBool,
    handlers: ListenerRegistry,
    sent: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
}

impl MockTransport {
    fn new(events: TransportEvents) -> Self {
        events.opened();
        Self {
            events,
            ready: AtomicBool::new(true),
            dispatching: AtomicBool::new(false),
            handlers: ListenerRegistry::new(),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    /// Simulate an inbound application event.
    pub fn push(&self, event: &str, payload: &Value) -> usize {
        assert!(
            self.dispatching.load(Ordering::SeqCst),
            "inbound event before dispatch started"
        );
        self.handlers.dispatch(event, payload)
    }

    /// Simulate the server closing the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.ready.store(false, Ordering::SeqCst);
        self.events.closed(reason);
    }

    /// Simulate an I/O failure on the connection.
    pub fn fail(&self, reason: &str) {
        self.ready.store(false, Ordering::SeqCst);
        self.events.transient_failure(reason);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn subscribed(&self, event: &str) -> usize {
        self.handlers.count(event)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send_message(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.sent.lock().unwrap().push((event.to_owned(), payload));
        Ok(())
    }

    fn subscribe(&self, id: ListenerId, event: &str, listener: Listener) {
        self.handlers.insert_with_id(id, event, listener);
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.handlers.remove(id)
    }

    fn start_dispatch(&self) {
        self.dispatching.store(true, Ordering::SeqCst);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ready.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collect payloads dispatched to `event` listeners.
pub fn record(manager: &SocketManager, event: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on(event, move |payload| sink.lock().unwrap().push(payload.clone()));
    seen
}

/// Wait until the manager reaches `state`.
pub async fn wait_for_state(manager: &SocketManager, state: ConnectionState) {
    let mut rx = manager.state_receiver();
    timeout(Duration::from_secs(60), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("state {state} not reached"))
        .unwrap();
}

/// Next lifecycle event, failing the test if none arrives.
pub async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("lifecycle event expected")
        .unwrap()
}

/// Wait until an event with `name` arrives, returning the events seen on the way.
pub async fn events_until(
    rx: &mut broadcast::Receiver<LifecycleEvent>,
    name: &str,
) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = event.name() == name;
        seen.push(event);
        if done {
            return seen;
        }
    }
}
