//! Reconnecting event stream client.
//!
//! `StreamEventClient` owns one logical subscription to the Chatter events
//! feed. A background worker acquires the byte stream, reassembles SSE frames,
//! parses them into events, and fans each one out to listeners registered for
//! its kind, reconnecting with bounded backoff when the transport fails.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::auth::AuthProvider;
use crate::retry::RetryPolicy;
use crate::stream::event::{EventKind, StreamEvent};
use crate::stream::sse::FrameDecoder;
use crate::stream::transport::EventTransport;

/// Lifecycle of the logical subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Never connected since construction or since the last failed-fast call.
    Idle,
    /// Acquiring the byte stream.
    Connecting,
    /// Read loop active; this is the steady state.
    Open,
    /// Teardown requested, worker not yet finished.
    Closing,
    /// No subscription and none pending. Terminal until `connect()`.
    Closed,
    /// Waiting out the backoff delay before the next acquisition.
    ReconnectScheduled,
}

/// Callback handle invoked for each event matching its registered kind.
///
/// The same handle value passed to `add_event_listener` removes the
/// registration again; removal compares by `Arc` identity.
pub type EventListener = Arc<dyn Fn(&StreamEvent) + Send + Sync + 'static>;

/// Snapshot returned by [`StreamEventClient::connection_stats`].
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    /// Time since the current connection opened; `None` while not connected.
    pub connection_duration: Option<Duration>,
    /// Successfully parsed messages delivered since construction.
    pub event_count: u64,
    /// Whether the subscription is currently open.
    pub is_connected: bool,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Time since the last parsed event; `None` before the first one.
    pub last_event_age: Option<Duration>,
}

/// Errors produced by stream transport handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Transport-level failure while establishing or reading the stream.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The events endpoint rejected the request outright.
    #[error("events endpoint returned http status {0}")]
    HttpStatus(StatusCode),
}

/// Client owning one logical subscription to the events stream.
///
/// Construct one per composition root and share it by reference; `connect()`
/// and `disconnect()` bracket the consumer lifecycle. All methods take
/// `&self` and are safe to call concurrently with the read loop.
pub struct StreamEventClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn EventTransport>,
    policy: RetryPolicy,
    state: Mutex<ConnectionState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    /// Session generation. `connect()` and `disconnect()` each start a new
    /// one; writes from a worker whose epoch was superseded are ignored.
    epoch: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<EventListener>>>,
    events_received: AtomicU64,
    reconnect_attempts: AtomicU32,
    connected_at: Mutex<Option<Instant>>,
    last_event_at: Mutex<Option<Instant>>,
}

impl StreamEventClient {
    /// Creates a client with the standard reconnect schedule.
    pub fn new(auth: Arc<dyn AuthProvider>, transport: Arc<dyn EventTransport>) -> Self {
        Self::with_reconnect_policy(auth, transport, RetryPolicy::standard())
    }

    /// Creates a client with an explicit reconnect schedule.
    pub fn with_reconnect_policy(
        auth: Arc<dyn AuthProvider>,
        transport: Arc<dyn EventTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                auth,
                transport,
                policy,
                state: Mutex::new(ConnectionState::Idle),
                shutdown: Mutex::new(None),
                epoch: AtomicU64::new(0),
                listeners: Mutex::new(HashMap::new()),
                events_received: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                connected_at: Mutex::new(None),
                last_event_at: Mutex::new(None),
            }),
        }
    }

    /// Starts the subscription. Idempotent and non-throwing.
    ///
    /// Fails fast with an error log when the auth collaborator reports no
    /// session; logs and returns when a subscription is already active.
    /// Returning does not mean the stream is open yet, only that the worker
    /// has been scheduled. Must be called within a Tokio runtime.
    pub fn connect(&self) {
        let epoch;
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Connecting
                | ConnectionState::Open
                | ConnectionState::ReconnectScheduled => {
                    debug!(
                        event = "connect_ignored",
                        state = ?*state,
                        "subscription already active"
                    );
                    return;
                }
                _ => {}
            }

            if !self.shared.auth.is_authenticated() {
                error!(
                    event = "connect_unauthenticated",
                    "connect requires an authenticated session; call connect() again after signing in"
                );
                return;
            }

            epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *state = ConnectionState::Connecting;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *lock(&self.shared.shutdown) = Some(shutdown_tx);

        let shared = Arc::clone(&self.shared);
        let _worker = tokio::spawn(subscription_worker(shared, shutdown_rx, epoch));
    }

    /// Stops the subscription. Idempotent and safe from any state.
    ///
    /// The state reads [`ConnectionState::Closed`] as soon as this returns;
    /// a pending backoff timer is cancelled and no further events are
    /// delivered, even for frames already buffered.
    pub fn disconnect(&self) {
        // Starting a new epoch detaches any live worker immediately, even one
        // spawned so recently that its shutdown sender is not stored yet.
        let _ = self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        let sender = lock(&self.shared.shutdown).take();
        if sender.is_some() {
            // Transient teardown marker; a racing dispatch stops immediately.
            *lock(&self.shared.state) = ConnectionState::Closing;
        }

        if let Some(sender) = sender {
            let _ = sender.send(true);
        }

        *lock(&self.shared.connected_at) = None;
        *lock(&self.shared.state) = ConnectionState::Closed;
    }

    /// Registers `listener` for every future event of `kind`.
    ///
    /// Multiple listeners per kind are invoked in registration order.
    /// Registering the same handle twice delivers each matching event twice;
    /// duplicates are intentionally not rejected so each registration pairs
    /// with one removal.
    pub fn add_event_listener(&self, kind: EventKind, listener: EventListener) {
        lock(&self.shared.listeners)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Wraps `callback` into a listener handle and registers it for `kind`.
    ///
    /// The returned handle is the removal token for `remove_event_listener`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> EventListener
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(callback);
        self.add_event_listener(kind, Arc::clone(&listener));
        listener
    }

    /// Removes the first registration of `listener` for `kind`, if any.
    ///
    /// Matching is by `Arc` identity; other listeners are unaffected.
    pub fn remove_event_listener(&self, kind: &EventKind, listener: &EventListener) {
        let mut registry = lock(&self.shared.listeners);
        if let Some(list) = registry.get_mut(kind) {
            if let Some(index) = list.iter().position(|entry| Arc::ptr_eq(entry, listener)) {
                let _ = list.remove(index);
            }
            if list.is_empty() {
                let _ = registry.remove(kind);
            }
        }
    }

    /// Pure read of the current connection counters.
    pub fn connection_stats(&self) -> ConnectionStats {
        let state = *lock(&self.shared.state);
        ConnectionStats {
            connection_duration: lock(&self.shared.connected_at).map(|opened| opened.elapsed()),
            event_count: self.shared.events_received.load(Ordering::SeqCst),
            is_connected: state == ConnectionState::Open,
            reconnect_attempts: self.shared.reconnect_attempts.load(Ordering::SeqCst),
            last_event_age: lock(&self.shared.last_event_at).map(|at| at.elapsed()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }
}

impl Drop for StreamEventClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ClientShared {
    /// Whether `epoch` is still the live session generation.
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Transitions state only while `epoch` is the live session, so a
    /// superseded worker's teardown cannot clobber its successor.
    /// Disconnect always wins the race with the worker.
    fn set_state_if_current(&self, epoch: u64, next: ConnectionState) {
        let mut state = lock(&self.state);
        if self.is_current(epoch) {
            *state = next;
        }
    }

    fn mark_open(&self, epoch: u64) {
        let mut state = lock(&self.state);
        if !self.is_current(epoch) {
            return;
        }
        *state = ConnectionState::Open;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *lock(&self.connected_at) = Some(Instant::now());
        debug!(event = "stream_open", "event stream established");
    }

    fn mark_session_ended(&self, epoch: u64) {
        if self.is_current(epoch) {
            *lock(&self.connected_at) = None;
        }
    }

    /// Parses one framed payload and delivers it. The counters move only
    /// when delivery actually happened, keeping `event_count` equal to the
    /// number of messages handed to listeners.
    fn deliver_payload(&self, epoch: u64, payload: &str) {
        match StreamEvent::from_text(payload) {
            Ok(event) => {
                if self.dispatch(epoch, &event) {
                    let _ = self.events_received.fetch_add(1, Ordering::SeqCst);
                    *lock(&self.last_event_at) = Some(Instant::now());
                }
            }
            Err(err) => {
                warn!(
                    event = "event_parse_failed",
                    error = %err,
                    "dropping malformed stream message"
                );
            }
        }
    }

    /// Invokes every listener registered for the event's kind, in
    /// registration order, and reports whether delivery happened. Delivery
    /// is refused once `epoch` is superseded, so frames still buffered at
    /// `disconnect()` go nowhere. A panicking listener is caught and logged
    /// without affecting later listeners or the read loop.
    fn dispatch(&self, epoch: u64, event: &StreamEvent) -> bool {
        if !self.is_current(epoch) {
            return false;
        }

        let listeners: Vec<EventListener> = lock(&self.listeners)
            .get(&event.kind)
            .map(|entries| entries.to_vec())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(
                    event = "listener_panicked",
                    kind = %event.kind,
                    "event listener panicked; continuing dispatch"
                );
            }
        }
        true
    }
}

enum SessionOutcome {
    Shutdown,
    Retry,
}

async fn subscription_worker(
    shared: Arc<ClientShared>,
    mut shutdown: watch::Receiver<bool>,
    epoch: u64,
) {
    loop {
        let outcome = run_subscription(&shared, &mut shutdown, epoch).await;
        shared.mark_session_ended(epoch);

        match outcome {
            SessionOutcome::Shutdown => {
                shared.set_state_if_current(epoch, ConnectionState::Closed);
                break;
            }
            SessionOutcome::Retry => {
                if !shared.is_current(epoch) {
                    break;
                }
                let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt as usize > shared.policy.max_attempts {
                    error!(
                        event = "reconnect_exhausted",
                        attempts = attempt - 1,
                        "giving up on the event stream; call connect() to retry"
                    );
                    shared.set_state_if_current(epoch, ConnectionState::Closed);
                    break;
                }

                shared.set_state_if_current(epoch, ConnectionState::ReconnectScheduled);
                let delay = shared.policy.delay_for_attempt(attempt as usize);
                debug!(
                    event = "reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                if *shutdown.borrow() || !shared.is_current(epoch) {
                    break;
                }

                shared.set_state_if_current(epoch, ConnectionState::Connecting);
            }
        }
    }
}

/// Runs one connected session: stream acquisition, then the read loop.
///
/// Establishment failure and mid-stream failure both resolve to
/// [`SessionOutcome::Retry`]; only a shutdown signal resolves to
/// [`SessionOutcome::Shutdown`].
async fn run_subscription(
    shared: &Arc<ClientShared>,
    shutdown: &mut watch::Receiver<bool>,
    epoch: u64,
) -> SessionOutcome {
    // A disconnect() racing the spawn may have superseded this worker
    // before its shutdown channel was stored.
    if !shared.is_current(epoch) {
        return SessionOutcome::Shutdown;
    }

    let Some(token) = shared.auth.bearer_token() else {
        warn!(
            event = "stream_token_missing",
            "session token unavailable; retrying after backoff"
        );
        return SessionOutcome::Retry;
    };

    let mut stream = tokio::select! {
        biased;
        _ = shutdown.changed() => return SessionOutcome::Shutdown,
        opened = shared.transport.open(&token) => match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!(event = "stream_open_failed", error = %err);
                return SessionOutcome::Retry;
            }
        }
    };

    shared.mark_open(epoch);
    shared.dispatch(epoch, &StreamEvent::connection_established());

    let mut decoder = FrameDecoder::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return SessionOutcome::Shutdown,
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for payload in decoder.push(&bytes) {
                        shared.deliver_payload(epoch, &payload);
                    }
                }
                Some(Err(err)) => {
                    warn!(event = "stream_read_failed", error = %err);
                    return SessionOutcome::Retry;
                }
                None => {
                    warn!(event = "stream_ended", "server closed the event stream");
                    return SessionOutcome::Retry;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use reqwest::StatusCode;
    use secrecy::SecretString;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::{
        lock, ConnectionState, EventListener, StreamClientError, StreamEventClient,
    };
    use crate::auth::AuthProvider;
    use crate::retry::RetryPolicy;
    use crate::stream::event::{EventKind, StreamEvent};
    use crate::stream::transport::{ByteChunkStream, EventTransport};

    const CHUNK_EVENT: &str = r#"{"id":"e1","type":"chat.message.chunk","timestamp":"2024-01-01T00:00:00Z","data":{"content":"hi"}}"#;
    const STATUS_EVENT: &str = r#"{"id":"e2","type":"workflow.status","timestamp":"2024-01-01T00:00:01Z","data":{}}"#;

    struct StaticAuth {
        authenticated: bool,
    }

    impl AuthProvider for StaticAuth {
        fn is_authenticated(&self) -> bool {
            self.authenticated
        }

        fn bearer_token(&self) -> Option<SecretString> {
            self.authenticated
                .then(|| SecretString::new("test-token".to_string()))
        }
    }

    fn authenticated() -> Arc<dyn AuthProvider> {
        Arc::new(StaticAuth {
            authenticated: true,
        })
    }

    enum Script {
        Fail,
        Stream(ByteChunkStream),
    }

    struct ScriptedTransport {
        opens: AtomicUsize,
        scripts: Mutex<VecDeque<Script>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                scripts: Mutex::new(scripts.into_iter().collect()),
            })
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        async fn open(&self, _token: &SecretString) -> Result<ByteChunkStream, StreamClientError> {
            let _ = self.opens.fetch_add(1, Ordering::SeqCst);
            match lock(&self.scripts).pop_front() {
                Some(Script::Stream(stream)) => Ok(stream),
                Some(Script::Fail) | None => {
                    Err(StreamClientError::HttpStatus(StatusCode::SERVICE_UNAVAILABLE))
                }
            }
        }
    }

    /// Stream that stays open forever after yielding nothing.
    fn pending_stream() -> ByteChunkStream {
        futures_util::stream::pending().boxed()
    }

    /// Channel-fed stream so tests can push chunks interactively.
    fn channel_stream() -> (
        mpsc::UnboundedSender<Result<Bytes, StreamClientError>>,
        ByteChunkStream,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, UnboundedReceiverStream::new(rx).boxed())
    }

    fn frame(payload: &str) -> Bytes {
        Bytes::from(format!("data: {payload}\n\n"))
    }

    /// Listener that forwards each delivered event into a channel.
    fn forwarding_listener() -> (EventListener, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: EventListener = Arc::new(move |event: &StreamEvent| {
            let _ = tx.send(event.clone());
        });
        (listener, rx)
    }

    fn quick_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn unauthenticated_connect_is_a_noop() {
        let transport = ScriptedTransport::new(vec![]);
        let client = StreamEventClient::new(
            Arc::new(StaticAuth {
                authenticated: false,
            }),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        client.connect();
        tokio::task::yield_now().await;

        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.connection_stats().is_connected);
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_connect_acquires_one_stream() {
        let transport = ScriptedTransport::new(vec![Script::Stream(pending_stream())]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let (listener, mut opened) = forwarding_listener();
        client.add_event_listener(EventKind::ConnectionEstablished, listener);

        client.connect();
        client.connect();

        let _ = opened.recv().await.expect("connection established");
        client.connect();
        tokio::task::yield_now().await;

        assert_eq!(transport.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn events_route_by_kind_in_registration_order() {
        let (chunks_tx, stream) = channel_stream();
        let transport = ScriptedTransport::new(vec![Script::Stream(stream)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            let _ = client.on(EventKind::ChatMessageChunk, move |_event| {
                lock(&order).push(tag);
            });
        }
        let (status_listener, mut status_rx) = forwarding_listener();
        client.add_event_listener(EventKind::WorkflowStatus, status_listener);

        client.connect();
        chunks_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");
        chunks_tx.send(Ok(frame(STATUS_EVENT))).expect("send status");

        let status = status_rx.recv().await.expect("status event");
        assert_eq!(status.id, "e2");
        assert_eq!(*lock(&order), vec!["first", "second"]);
        assert_eq!(client.connection_stats().event_count, 2);
    }

    #[tokio::test]
    async fn unknown_kind_routes_to_literal_subscribers() {
        let (chunks_tx, stream) = channel_stream();
        let transport = ScriptedTransport::new(vec![Script::Stream(stream)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let (listener, mut rx) = forwarding_listener();
        client.add_event_listener(
            EventKind::Other("billing.invoice.ready".to_string()),
            listener,
        );

        client.connect();
        let payload = r#"{"id":"e9","type":"billing.invoice.ready","timestamp":"2024-01-01T00:00:00Z","data":{}}"#;
        chunks_tx.send(Ok(frame(payload))).expect("send chunk");

        let event = rx.recv().await.expect("unknown-kind event");
        assert_eq!(event.kind.as_str(), "billing.invoice.ready");
    }

    #[tokio::test]
    async fn malformed_message_does_not_break_the_stream() {
        let (chunks_tx, stream) = channel_stream();
        let transport = ScriptedTransport::new(vec![Script::Stream(stream)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let (listener, mut rx) = forwarding_listener();
        client.add_event_listener(EventKind::ChatMessageChunk, listener);

        client.connect();
        chunks_tx
            .send(Ok(Bytes::from_static(b"data: {bad json\n\n")))
            .expect("send malformed");
        chunks_tx.send(Ok(frame(CHUNK_EVENT))).expect("send valid");

        let event = rx.recv().await.expect("valid event after malformed one");
        assert_eq!(event.id, "e1");
        assert_eq!(client.connection_stats().event_count, 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_dispatch() {
        let (chunks_tx, stream) = channel_stream();
        let transport = ScriptedTransport::new(vec![Script::Stream(stream)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let _ = client.on(EventKind::ChatMessageChunk, |_event| {
            panic!("listener failure");
        });
        let (listener, mut rx) = forwarding_listener();
        client.add_event_listener(EventKind::ChatMessageChunk, listener);

        client.connect();
        chunks_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");

        let event = rx.recv().await.expect("second listener still invoked");
        assert_eq!(event.id, "e1");
    }

    #[tokio::test]
    async fn removed_listener_receives_nothing_further() {
        let (chunks_tx, stream) = channel_stream();
        let transport = ScriptedTransport::new(vec![Script::Stream(stream)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let (removed, mut removed_rx) = forwarding_listener();
        client.add_event_listener(EventKind::ChatMessageChunk, Arc::clone(&removed));
        let (sentinel, mut sentinel_rx) = forwarding_listener();
        client.add_event_listener(EventKind::WorkflowStatus, sentinel);

        client.connect();
        chunks_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");
        let first = removed_rx.recv().await.expect("event before removal");
        assert_eq!(first.id, "e1");

        client.remove_event_listener(&EventKind::ChatMessageChunk, &removed);
        chunks_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");
        chunks_tx.send(Ok(frame(STATUS_EVENT))).expect("send status");

        // Events dispatch in order, so the sentinel observing the later
        // status event proves the second chunk already went by.
        let _ = sentinel_rx.recv().await.expect("sentinel event");
        assert!(removed_rx.try_recv().is_err(), "no delivery after removal");
    }

    #[tokio::test]
    async fn disconnect_is_synchronous_and_silences_delivery() {
        let (chunks_tx, stream) = channel_stream();
        let transport = ScriptedTransport::new(vec![Script::Stream(stream)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let (listener, mut rx) = forwarding_listener();
        client.add_event_listener(EventKind::ChatMessageChunk, listener);

        client.connect();
        chunks_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");
        let _ = rx.recv().await.expect("event while open");

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.connection_stats().is_connected);

        let _ = chunks_tx.send(Ok(frame(CHUNK_EVENT)));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "no delivery after disconnect");
        // Undelivered frames are not counted either.
        assert_eq!(client.connection_stats().event_count, 1);

        // Safe to repeat from the closed state.
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_delivers_again() {
        let (first_tx, first) = channel_stream();
        let (second_tx, second) = channel_stream();
        let transport =
            ScriptedTransport::new(vec![Script::Stream(first), Script::Stream(second)]);
        let client = StreamEventClient::new(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
        );

        let (listener, mut rx) = forwarding_listener();
        client.add_event_listener(EventKind::ChatMessageChunk, listener);

        client.connect();
        first_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");
        let _ = rx.recv().await.expect("event on first session");

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Closed);

        // The first worker's teardown must not leak into the new session.
        client.connect();
        second_tx.send(Ok(frame(CHUNK_EVENT))).expect("send chunk");
        let event = rx.recv().await.expect("event after reconnect");
        assert_eq!(event.id, "e1");

        assert_eq!(transport.open_count(), 2);
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.connection_stats().event_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn establishment_failure_retries_once_after_base_delay() {
        let transport =
            ScriptedTransport::new(vec![Script::Fail, Script::Stream(pending_stream())]);
        let client = StreamEventClient::with_reconnect_policy(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            quick_policy(4),
        );

        let (listener, mut opened) = forwarding_listener();
        client.add_event_listener(EventKind::ConnectionEstablished, listener);

        client.connect();
        let _ = opened.recv().await.expect("open after one retry");

        assert_eq!(transport.open_count(), 2);
        let stats = client.connection_stats();
        assert!(stats.is_connected);
        // Counter resets on the successful open transition.
        assert_eq!(stats.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_visible_while_failing() {
        let transport = ScriptedTransport::new(vec![Script::Fail, Script::Fail]);
        let client = StreamEventClient::with_reconnect_policy(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            quick_policy(8),
        );

        client.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.state(), ConnectionState::ReconnectScheduled);
        assert_eq!(client.connection_stats().reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_closed() {
        let transport = ScriptedTransport::new(vec![]);
        let client = StreamEventClient::with_reconnect_policy(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            quick_policy(2),
        );

        client.connect();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Initial attempt plus two reconnects, then the client gives up.
        assert_eq!(transport.open_count(), 3);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.connection_stats().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let transport = ScriptedTransport::new(vec![Script::Fail]);
        let client = StreamEventClient::with_reconnect_policy(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            quick_policy(8),
        );

        client.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ConnectionState::ReconnectScheduled);

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_count(), 1, "no retry after disconnect");
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn mid_stream_end_reenters_connecting() {
        let (chunks_tx, first) = channel_stream();
        let transport = ScriptedTransport::new(vec![
            Script::Stream(first),
            Script::Stream(pending_stream()),
        ]);
        let client = StreamEventClient::with_reconnect_policy(
            authenticated(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            RetryPolicy {
                max_attempts: 4,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter: Duration::ZERO,
            },
        );

        let (listener, mut opened) = forwarding_listener();
        client.add_event_listener(EventKind::ConnectionEstablished, listener);

        client.connect();
        let _ = opened.recv().await.expect("first open");

        drop(chunks_tx); // server closes the stream
        let _ = opened.recv().await.expect("reopen after end-of-stream");

        assert_eq!(transport.open_count(), 2);
        assert_eq!(client.connection_stats().reconnect_attempts, 0);
    }
}
