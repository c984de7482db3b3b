//! Session: handshake, dispatch, and lifecycle.
//!
//! A session wraps one wire. It runs the SyncConfig handshake, then
//! drains the wire's inbound queue on a dedicated task: Opens become
//! service invocations, Blocks are routed to their pipe, Closes settle
//! call results, and a Control Close tears everything down. All pipes of
//! a session die with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use asterisque_core::{
    abort, Abort, BlockFlags, CircuitBreaker, CloseResult, Control, Error, Gate, Message,
    SyncConfig, Value, Wire, DEFAULT_PING_SECS, DEFAULT_SESSION_TIMEOUT_SECS, MAX_PING_SECS,
    MAX_SESSION_TIMEOUT_SECS, MIN_PING_SECS, MIN_SESSION_TIMEOUT_SECS, PROTOCOL_VERSION,
};

use crate::pipe::{Pipe, PipeContext};
use crate::repository::{now_millis, Principal, SessionRepository};
use crate::service::{Params, Registry};
use crate::space::{Admission, PipeSpace};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Active,
    Closing,
    Closed,
}

/// Ping and timeout values agreed during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    pub ping_secs: i32,
    pub session_timeout_secs: i32,
}

/// Tunables of a single session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ping interval this peer asks for.
    pub ping_secs: i32,
    /// Session timeout this peer asks for.
    pub session_timeout_secs: i32,
    /// Bounds applied by the primary when negotiating.
    pub min_ping_secs: i32,
    pub max_ping_secs: i32,
    pub min_session_timeout_secs: i32,
    pub max_session_timeout_secs: i32,
    /// Received blocks one pipe may buffer before its consumer catches
    /// up; overflow fails the pipe.
    pub max_pipe_backlog: usize,
    /// Pending outbound messages: soft pauses block senders, hard trips
    /// the breaker.
    pub outbound_soft_limit: usize,
    pub outbound_hard_limit: usize,
    /// Buffered inbound blocks across all pipes awaiting consumption.
    pub inbound_soft_limit: usize,
    pub inbound_hard_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ping_secs: DEFAULT_PING_SECS,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            min_ping_secs: MIN_PING_SECS,
            max_ping_secs: MAX_PING_SECS,
            min_session_timeout_secs: MIN_SESSION_TIMEOUT_SECS,
            max_session_timeout_secs: MAX_SESSION_TIMEOUT_SECS,
            max_pipe_backlog: 256,
            outbound_soft_limit: 256,
            outbound_hard_limit: 8192,
            inbound_soft_limit: 256,
            inbound_hard_limit: 8192,
        }
    }
}

/// Cheaply clonable posting handle. Pipes reach their session through
/// this instead of holding the session itself, so pipe ↔ session never
/// forms an ownership cycle.
#[derive(Clone)]
pub(crate) struct SessionPost {
    inner: Arc<PostInner>,
}

struct PostInner {
    wire: Arc<Wire>,
    gate: Gate,
    breaker: Arc<CircuitBreaker>,
    space: Weak<PipeSpace>,
}

impl SessionPost {
    fn new(
        wire: Arc<Wire>,
        gate: Gate,
        breaker: Arc<CircuitBreaker>,
        space: Weak<PipeSpace>,
    ) -> Self {
        SessionPost {
            inner: Arc::new(PostInner {
                wire,
                gate,
                breaker,
                space,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(wire: Arc<Wire>) -> Self {
        SessionPost::new(
            wire,
            Gate::new(),
            Arc::new(CircuitBreaker::new("outbound", 1 << 16, 1 << 17)),
            Weak::new(),
        )
    }

    /// Enqueue a message for the transport. FIFO order at offer time is
    /// the only inter-thread ordering guarantee.
    pub(crate) fn post(&self, msg: Message) -> Result<(), Error> {
        msg.validate()?;
        self.inner.wire.outbound().offer(msg)
    }

    /// Like [`post`](Self::post), but waits at the overload gate first.
    /// Used for block traffic so bulk senders pause under congestion
    /// while Opens and Closes still get through.
    pub(crate) async fn post_block(&self, msg: Message) -> Result<(), Error> {
        if self.inner.breaker.is_broken() {
            return Err(Error::ResourceExhausted(
                "outbound hard limit reached".to_string(),
            ));
        }
        self.inner.gate.pass().await?;
        self.post(msg)
    }

    pub(crate) fn destroy(&self, pipe_id: u16) {
        if let Some(space) = self.inner.space.upgrade() {
            space.destroy(pipe_id);
        }
    }
}

/// Observer of session teardown, used by nodes to reap dead sessions.
pub trait SessionListener: Send + Sync {
    fn session_closed(&self, session: &Session);
}

/// Aborts the session when the outbound breaker trips.
struct BreakerTrip {
    session: Weak<Session>,
}

impl asterisque_core::BreakerListener for BreakerTrip {
    fn broken(&self) {
        if let Some(session) = self.session.upgrade() {
            session.shutdown(false, "outbound hard limit reached");
        }
    }
}

pub struct Session {
    name: String,
    node_id: Uuid,
    primary: bool,
    config: SessionConfig,
    wire: Arc<Wire>,
    space: Arc<PipeSpace>,
    registry: Arc<Registry>,
    repository: Arc<dyn SessionRepository>,
    post: SessionPost,
    gate: Gate,
    id: Mutex<Uuid>,
    state_tx: watch::Sender<SessionState>,
    closed: AtomicBool,
    sync_received: AtomicBool,
    negotiated: Mutex<Option<Negotiation>>,
    last_inbound: Mutex<Instant>,
    outbound_breaker: Arc<CircuitBreaker>,
    inbound_breaker: Arc<CircuitBreaker>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl Session {
    /// Wrap a wire into a session and start its dispatcher. On a
    /// secondary wire the handshake is initiated immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        node_id: Uuid,
        registry: Arc<Registry>,
        repository: Arc<dyn SessionRepository>,
        wire: Arc<Wire>,
        config: SessionConfig,
    ) -> Arc<Session> {
        let outbound_breaker = Arc::new(CircuitBreaker::new(
            "outbound",
            config.outbound_soft_limit,
            config.outbound_hard_limit,
        ));
        let inbound_breaker = Arc::new(CircuitBreaker::new(
            "inbound",
            config.inbound_soft_limit,
            config.inbound_hard_limit,
        ));
        let gate = Gate::new();
        outbound_breaker.add_listener(Arc::new(gate.clone()));
        wire.outbound().set_meter(outbound_breaker.clone());

        let space = PipeSpace::new(wire.is_primary());
        let post = SessionPost::new(
            wire.clone(),
            gate.clone(),
            outbound_breaker.clone(),
            Arc::downgrade(&space),
        );
        let (state_tx, _) = watch::channel(SessionState::AwaitingHandshake);

        let session = Arc::new(Session {
            name: name.into(),
            node_id,
            primary: wire.is_primary(),
            config,
            wire,
            space,
            registry,
            repository,
            post,
            gate,
            id: Mutex::new(Uuid::nil()),
            state_tx,
            closed: AtomicBool::new(false),
            sync_received: AtomicBool::new(false),
            negotiated: Mutex::new(None),
            last_inbound: Mutex::new(Instant::now()),
            outbound_breaker,
            inbound_breaker,
            listeners: Mutex::new(Vec::new()),
        });
        // A broken outbound breaker means the peer has stopped draining
        // us for good; the session aborts rather than buffer forever.
        session.outbound_breaker.add_listener(Arc::new(BreakerTrip {
            session: Arc::downgrade(&session),
        }));
        session.clone().spawn_dispatcher();
        session.clone().spawn_keepalive();
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session id; nil until the handshake assigns one.
    pub fn id(&self) -> Uuid {
        *self.id.lock()
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    /// Values agreed during the handshake, once active.
    pub fn negotiation(&self) -> Option<Negotiation> {
        *self.negotiated.lock()
    }

    /// Live pipe count, mostly for diagnostics.
    pub fn pipe_count(&self) -> usize {
        self.space.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        if self.is_closed() {
            listener.session_closed(self);
            return;
        }
        self.listeners.lock().push(listener);
    }

    /// Wait until the handshake completes. Fails if the session dies
    /// first.
    pub async fn wait_active(&self) -> Result<(), Error> {
        let mut rx = self.state_tx.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, SessionState::AwaitingHandshake))
            .await
            .map_err(|_| Error::Closed("session"))?;
        match *state {
            SessionState::Active => Ok(()),
            _ => Err(Error::Closed("session")),
        }
    }

    /// Wait until the session reaches its terminal state.
    pub async fn wait_closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| matches!(s, SessionState::Closed)).await;
    }

    /// The call primitive: allocate a pipe, announce it to the peer,
    /// and hand it back. The caller awaits `pipe.result()` and may
    /// stream blocks meanwhile.
    pub fn open(
        &self,
        priority: i8,
        function_id: u16,
        params: Vec<Value>,
    ) -> Result<Arc<Pipe>, Error> {
        match self.state() {
            SessionState::Active => {}
            SessionState::AwaitingHandshake => {
                return Err(Error::Closed("session not yet active"));
            }
            _ => return Err(Error::Closed("session")),
        }
        let pipe = self
            .space
            .allocate(function_id, priority, &self.pipe_context())?;
        if let Err(e) = pipe.open(params) {
            self.space.destroy(pipe.id());
            return Err(e);
        }
        tracing::debug!(
            session = %self.name,
            pipe = pipe.id(),
            function = function_id,
            "opened"
        );
        Ok(pipe)
    }

    /// Close the session. A graceful close tells the peer first; a
    /// forced close just tears down. Either way every outstanding call
    /// fails with a session-closed result. Idempotent.
    pub fn close(&self, graceful: bool) {
        let reason = if graceful { "local close" } else { "local forced close" };
        self.shutdown(graceful, reason);
    }

    fn pipe_context(&self) -> PipeContext {
        PipeContext {
            post: self.post.clone(),
            max_backlog: self.config.max_pipe_backlog,
            meter: self.inbound_breaker.clone(),
        }
    }

    fn spawn_dispatcher(self: Arc<Self>) {
        tokio::spawn(async move {
            if !self.primary {
                // The secondary opens the handshake; a reconnecting
                // node would carry its prior session id here.
                self.send_sync_config(
                    Uuid::nil(),
                    self.config.ping_secs,
                    self.config.session_timeout_secs,
                );
            }
            while let Some(msg) = self.wire.inbound().take().await {
                *self.last_inbound.lock() = Instant::now();
                self.dispatch(msg);
                if self.is_closed() {
                    break;
                }
            }
            self.shutdown(false, "wire closed");
        });
    }

    /// Pings at the negotiated interval and aborts the session when the
    /// peer has been silent past the negotiated timeout.
    fn spawn_keepalive(self: Arc<Self>) {
        tokio::spawn(async move {
            if self.wait_active().await.is_err() {
                return;
            }
            let Some(negotiation) = self.negotiation() else {
                return;
            };
            let ping = Duration::from_secs(negotiation.ping_secs.max(1) as u64);
            let timeout = Duration::from_secs(negotiation.session_timeout_secs.max(1) as u64);
            let mut interval = tokio::time::interval(ping);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // the first tick completes immediately
            loop {
                interval.tick().await;
                if self.is_closed() {
                    return;
                }
                if self.last_inbound.lock().elapsed() > timeout {
                    self.shutdown(false, "session timeout");
                    return;
                }
                let ping = Message::Control(Control::Ping {
                    utc_millis: now_millis(),
                });
                if self.post.post(ping).is_err() {
                    return;
                }
            }
        });
    }

    fn dispatch(&self, msg: Message) {
        match self.state() {
            SessionState::AwaitingHandshake => match msg {
                Message::Control(Control::SyncConfig(sc)) => self.handle_sync_config(sc),
                other => {
                    tracing::error!(
                        session = %self.name,
                        message = other.type_name(),
                        "message before handshake"
                    );
                    self.shutdown(false, "protocol violation: message before handshake");
                }
            },
            SessionState::Active => match msg {
                Message::Control(Control::SyncConfig(_)) => {
                    tracing::error!(session = %self.name, "second SyncConfig");
                    self.shutdown(false, "protocol violation: second SyncConfig");
                }
                Message::Control(Control::Close) => {
                    self.shutdown(false, "closed by peer");
                }
                Message::Control(Control::Ping { utc_millis }) => {
                    let pong = Message::Control(Control::Pong { utc_millis });
                    if self.post.post(pong).is_err() {
                        tracing::debug!(session = %self.name, "could not answer ping");
                    }
                }
                Message::Control(Control::Pong { .. }) => {
                    // Receipt alone refreshed the liveness clock.
                }
                Message::Open {
                    pipe_id,
                    priority,
                    function_id,
                    params,
                } => self.handle_open(pipe_id, priority, function_id, params),
                Message::Block {
                    pipe_id,
                    flags,
                    payload,
                    ..
                } => self.handle_block(pipe_id, flags, payload),
                Message::Close { pipe_id, result } => self.handle_pipe_close(pipe_id, result),
            },
            SessionState::Closing | SessionState::Closed => {
                tracing::debug!(
                    session = %self.name,
                    message = msg.type_name(),
                    "dropping message after close"
                );
            }
        }
    }

    fn handle_sync_config(&self, sc: SyncConfig) {
        if self.sync_received.swap(true, Ordering::AcqRel) {
            self.shutdown(false, "protocol violation: second SyncConfig");
            return;
        }
        if sc.version >> 8 != PROTOCOL_VERSION >> 8 {
            tracing::error!(
                session = %self.name,
                version = sc.version,
                "incompatible protocol version"
            );
            self.shutdown(false, "incompatible protocol version");
            return;
        }

        if self.primary {
            let principal = Principal::from_tls(self.wire.tls());
            let session_id = if sc.is_new_session() {
                self.repository.next_uuid()
            } else if self
                .repository
                .load_and_delete(&principal, sc.session_id)
                .is_some()
            {
                tracing::debug!(session = %self.name, id = %sc.session_id, "resuming session");
                sc.session_id
            } else {
                self.repository.next_uuid()
            };
            let negotiation = Negotiation {
                ping_secs: sc
                    .ping_secs
                    .clamp(self.config.min_ping_secs, self.config.max_ping_secs),
                session_timeout_secs: sc.session_timeout_secs.clamp(
                    self.config.min_session_timeout_secs,
                    self.config.max_session_timeout_secs,
                ),
            };
            *self.id.lock() = session_id;
            *self.negotiated.lock() = Some(negotiation);
            // Record the issued id so the peer can resume within the
            // negotiated timeout window.
            self.repository.store(
                &principal,
                session_id,
                Vec::new(),
                now_millis() + i64::from(negotiation.session_timeout_secs) * 1000,
            );
            self.send_sync_config(
                session_id,
                negotiation.ping_secs,
                negotiation.session_timeout_secs,
            );
            self.become_active(session_id);
        } else {
            // The primary's reply is authoritative for both peers.
            *self.id.lock() = sc.session_id;
            *self.negotiated.lock() = Some(Negotiation {
                ping_secs: sc.ping_secs,
                session_timeout_secs: sc.session_timeout_secs,
            });
            self.become_active(sc.session_id);
        }
    }

    fn become_active(&self, session_id: Uuid) {
        let _ = self.state_tx.send(SessionState::Active);
        tracing::debug!(session = %self.name, id = %session_id, "active");
    }

    fn send_sync_config(&self, session_id: Uuid, ping_secs: i32, session_timeout_secs: i32) {
        let sc = SyncConfig {
            version: PROTOCOL_VERSION,
            node_id: self.node_id,
            session_id,
            utc_millis: now_millis(),
            ping_secs,
            session_timeout_secs,
        };
        if self
            .post
            .post(Message::Control(Control::SyncConfig(sc)))
            .is_err()
        {
            self.shutdown(false, "wire closed during handshake");
        }
    }

    fn handle_open(&self, pipe_id: u16, priority: i8, function_id: u16, params: Vec<Value>) {
        let ctx = self.pipe_context();
        match self.space.admit(pipe_id, function_id, priority, &ctx) {
            Err(e) => {
                tracing::error!(session = %self.name, pipe = pipe_id, error = %e, "bad Open");
                self.shutdown(false, "protocol violation in Open");
            }
            Ok(Admission::Duplicate) => {
                self.post_close(
                    pipe_id,
                    Err(Abort::new(
                        abort::DUPLICATE_PIPE_ID,
                        format!("duplicate pipe-id: {}", pipe_id),
                    )),
                );
            }
            Ok(Admission::Created(pipe)) => match self.registry.lookup(function_id) {
                None => {
                    self.space.destroy(pipe_id);
                    self.post_close(
                        pipe_id,
                        Err(Abort::new(
                            abort::FUNCTION_NOT_FOUND,
                            format!("function not found: {}", function_id),
                        )),
                    );
                }
                Some(function) => {
                    // One task per pipe keeps invocations for a pipe
                    // sequential while different pipes run concurrently.
                    let fut = function.invoke(pipe.clone(), Params::new(params));
                    let session = self.name.clone();
                    tokio::spawn(async move {
                        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(Ok(value)) => pipe.close_success(value),
                            Ok(Err(a)) => pipe.close_failure(a.code, a.message),
                            Err(_) => {
                                tracing::error!(
                                    session = %session,
                                    pipe = pipe.id(),
                                    "handler panicked"
                                );
                                pipe.close_failure(abort::UNEXPECTED, "unexpected error");
                            }
                        }
                    });
                }
            },
        }
    }

    fn handle_block(&self, pipe_id: u16, flags: BlockFlags, payload: Bytes) {
        match self.space.get(pipe_id) {
            None => {
                self.post_close(
                    pipe_id,
                    Err(Abort::new(
                        abort::UNKNOWN_PIPE_ID,
                        format!("unknown pipe-id: {}", pipe_id),
                    )),
                );
            }
            Some(pipe) => {
                if let Err(e) = pipe.deliver(flags, payload) {
                    tracing::warn!(session = %self.name, pipe = pipe_id, error = %e, "pipe overrun");
                    self.space.destroy(pipe_id);
                    pipe.close_failure(abort::BACKLOG_EXCEEDED, e.to_string());
                } else if self.inbound_breaker.is_broken() {
                    self.shutdown(false, "inbound hard limit reached");
                }
            }
        }
    }

    fn handle_pipe_close(&self, pipe_id: u16, result: CloseResult) {
        match self.space.destroy(pipe_id) {
            Some(pipe) => pipe.on_remote_close(result),
            None => {
                // Expected after a local close raced the peer's.
                tracing::debug!(session = %self.name, pipe = pipe_id, "close for unknown pipe");
            }
        }
    }

    /// Tell the peer a pipe closed when there is no local `Pipe` to do
    /// it (e.g. the Open was rejected before a pipe was created).
    fn post_close(&self, pipe_id: u16, result: CloseResult) {
        let close = Message::Close { pipe_id, result };
        if let Err(e) = self.post.post(close) {
            tracing::warn!(session = %self.name, pipe = pipe_id, error = %e, "could not post close");
        }
    }

    /// One-shot teardown; the first caller wins and performs every
    /// effect exactly once.
    fn shutdown(&self, notify_peer: bool, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.state_tx.send(SessionState::Closing);
        if notify_peer {
            if self.post.post(Message::Control(Control::Close)).is_err() {
                tracing::debug!(session = %self.name, "peer unreachable for close notice");
            }
        }
        for pipe in self.space.drain() {
            pipe.abort_local(Abort::session_closed());
        }
        // Closing the wire still drains already-buffered outbound
        // messages to the peer, so the close notice flushes.
        self.wire.close();
        // Release any sender parked at the overload gate; their posts
        // now fail against the closed queue instead of hanging.
        self.gate.set_open(true);
        let _ = self.state_tx.send(SessionState::Closed);
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.session_closed(self);
        }
        tracing::debug!(session = %self.name, reason, "closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("primary", &self.primary)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::VolatileRepository;
    use crate::service::Service;

    fn primary_session(wire: Arc<Wire>) -> Arc<Session> {
        let registry = Arc::new(Registry::new());
        registry
            .bind(Service::new("test").func(10, "echo", |_pipe, params| async move {
                Ok(params.value(0).cloned().unwrap_or(Value::Null))
            }))
            .unwrap();
        Session::new(
            "primary",
            Uuid::new_v4(),
            registry,
            Arc::new(VolatileRepository::new()),
            wire,
            SessionConfig::default(),
        )
    }

    fn sync_config(session_id: Uuid, ping: i32, timeout: i32) -> Message {
        Message::Control(Control::SyncConfig(SyncConfig {
            version: PROTOCOL_VERSION,
            node_id: Uuid::new_v4(),
            session_id,
            utc_millis: now_millis(),
            ping_secs: ping,
            session_timeout_secs: timeout,
        }))
    }

    #[tokio::test]
    async fn primary_assigns_id_and_clamps_negotiation() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound()
            .offer(sync_config(Uuid::nil(), 99_999, 1))
            .unwrap();

        let reply = b.inbound().take().await;
        let Some(Message::Control(Control::SyncConfig(sc))) = reply else {
            panic!("expected SyncConfig reply, got {:?}", reply);
        };
        assert_eq!(sc.version, PROTOCOL_VERSION);
        assert!(!sc.session_id.is_nil());
        assert_eq!(sc.ping_secs, MAX_PING_SECS);
        assert_eq!(sc.session_timeout_secs, MIN_SESSION_TIMEOUT_SECS);

        session.wait_active().await.unwrap();
        assert_eq!(session.id(), sc.session_id);
        assert_eq!(
            session.negotiation(),
            Some(Negotiation {
                ping_secs: MAX_PING_SECS,
                session_timeout_secs: MIN_SESSION_TIMEOUT_SECS,
            })
        );
    }

    #[tokio::test]
    async fn message_before_handshake_is_fatal() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound()
            .offer(Message::Open {
                pipe_id: 1,
                priority: 0,
                function_id: 10,
                params: vec![],
            })
            .unwrap();

        assert!(session.wait_active().await.is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn second_sync_config_is_fatal() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        // The dispatcher force-closes; the wire teardown propagates.
        while b.inbound().take().await.is_some() {}
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn open_is_refused_before_and_after_active() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        assert!(matches!(
            session.open(0, 10, vec![]),
            Err(Error::Closed(_))
        ));

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        assert!(session.open(0, 10, vec![]).is_ok());

        session.close(false);
        assert!(matches!(
            session.open(0, 10, vec![]),
            Err(Error::Closed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_function_answers_close_and_stays_active() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        let _ = b.inbound().take().await; // SyncConfig reply

        b.outbound()
            .offer(Message::Open {
                pipe_id: 1,
                priority: 0,
                function_id: 9999,
                params: vec![],
            })
            .unwrap();

        let Some(Message::Close { pipe_id, result }) = b.inbound().take().await else {
            panic!("expected Close");
        };
        assert_eq!(pipe_id, 1);
        let abort = result.unwrap_err();
        assert_eq!(abort.code, abort::FUNCTION_NOT_FOUND);
        assert!(abort.message.contains("9999"));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn unknown_pipe_block_answers_close() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        let _ = b.inbound().take().await;

        b.outbound()
            .offer(Message::Block {
                pipe_id: 42,
                priority: 0,
                flags: BlockFlags::empty(),
                loss: 0,
                payload: Bytes::from_static(&[1]),
            })
            .unwrap();

        let Some(Message::Close { pipe_id, result }) = b.inbound().take().await else {
            panic!("expected Close");
        };
        assert_eq!(pipe_id, 42);
        assert_eq!(result.unwrap_err().code, abort::UNKNOWN_PIPE_ID);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn graceful_close_notifies_peer_and_fails_pipes() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        let _ = b.inbound().take().await;

        let pipe = session.open(0, 10, vec![Value::Null]).unwrap();
        let _ = b.inbound().take().await; // the Open

        session.close(true);
        assert_eq!(session.state(), SessionState::Closed);

        // The pending call fails locally with a session-closed abort.
        assert_eq!(pipe.result().await.unwrap_err().code, abort::SESSION_CLOSED);

        // The close notice flushes to the peer before the wire dies.
        let mut saw_close = false;
        while let Some(msg) = b.inbound().take().await {
            if matches!(msg, Message::Control(Control::Close)) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn duplicate_open_answers_close_and_stays_active() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        let _ = b.inbound().take().await;

        let open = Message::Open {
            pipe_id: 3,
            priority: 0,
            function_id: 10,
            params: vec![Value::I32(1)],
        };
        b.outbound().offer(open.clone()).unwrap();
        b.outbound().offer(open).unwrap();

        // First call completes, duplicate is rejected; order of the two
        // Closes is not guaranteed.
        let mut codes = Vec::new();
        for _ in 0..2 {
            let Some(Message::Close { result, .. }) = b.inbound().take().await else {
                panic!("expected Close");
            };
            codes.push(result.map_err(|a| a.code));
        }
        assert!(codes.contains(&Ok(Value::I32(1))));
        assert!(codes.contains(&Err(abort::DUPLICATE_PIPE_ID)));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn open_from_our_own_half_is_fatal() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();

        // The primary owns the high half; a peer must never use it.
        b.outbound()
            .offer(Message::Open {
                pipe_id: 0x8002,
                priority: 0,
                function_id: 10,
                params: vec![],
            })
            .unwrap();

        while b.inbound().take().await.is_some() {}
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_then_times_out_a_silent_peer() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 1, 30)).unwrap();
        session.wait_active().await.unwrap();
        let _ = b.inbound().take().await; // SyncConfig reply

        // At the negotiated one-second interval a Ping shows up.
        let msg = b.inbound().take().await;
        assert!(matches!(
            msg,
            Some(Message::Control(Control::Ping { .. }))
        ));

        // Never answer: after the negotiated timeout the session dies.
        while b.inbound().take().await.is_some() {}
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn ping_is_answered_with_matching_pong() {
        let (a, b) = Wire::pair();
        let session = primary_session(a);

        b.outbound().offer(sync_config(Uuid::nil(), 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        let _ = b.inbound().take().await;

        b.outbound()
            .offer(Message::Control(Control::Ping { utc_millis: 777 }))
            .unwrap();
        assert_eq!(
            b.inbound().take().await,
            Some(Message::Control(Control::Pong { utc_millis: 777 }))
        );
    }

    #[tokio::test]
    async fn session_resume_reuses_stored_id() {
        let (a, b) = Wire::pair();
        let repository = Arc::new(VolatileRepository::new());
        let prior = repository.next_uuid();
        repository.store(
            &Principal::anonymous(),
            prior,
            Vec::new(),
            now_millis() + 60_000,
        );

        let registry = Arc::new(Registry::new());
        let session = Session::new(
            "primary",
            Uuid::new_v4(),
            registry,
            repository,
            a,
            SessionConfig::default(),
        );

        b.outbound().offer(sync_config(prior, 30, 120)).unwrap();
        session.wait_active().await.unwrap();
        assert_eq!(session.id(), prior);
    }
}
