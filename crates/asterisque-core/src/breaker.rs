//! Back-pressure coordination.
//!
//! A [`CircuitBreaker`] is a thresholded load counter with a soft and a
//! hard limit. Crossing the soft limit flips an overload signal that
//! producers use to pause; crossing the hard limit trips the breaker
//! once for the session's abort path. A [`Gate`] is the producer-side
//! wait point driven by the overload signal.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::Error;

/// Observer of breaker state edges. Callbacks run outside the breaker's
/// lock; implementations may re-enter the breaker.
pub trait BreakerListener: Send + Sync {
    /// Fired when load crosses the soft limit, in either direction. The
    /// engine guarantees callback count matches the net direction even
    /// under concurrent crossings.
    fn overload(&self, _overloaded: bool) {}

    /// Fired exactly once per breaker lifetime, when load first reaches
    /// the hard limit.
    fn broken(&self) {}
}

struct BreakerState {
    load: usize,
    overloaded: bool,
    broken: bool,
    listeners: Vec<Arc<dyn BreakerListener>>,
}

/// Thresholded load counter guarding one direction of a session.
pub struct CircuitBreaker {
    name: &'static str,
    soft_limit: usize,
    hard_limit: usize,
    state: Mutex<BreakerState>,
}

enum Edge {
    Overload(bool),
    Broken,
}

impl CircuitBreaker {
    /// `soft_limit` must be strictly below `hard_limit`.
    pub fn new(name: &'static str, soft_limit: usize, hard_limit: usize) -> Self {
        assert!(soft_limit < hard_limit, "soft limit must be below hard limit");
        CircuitBreaker {
            name,
            soft_limit,
            hard_limit,
            state: Mutex::new(BreakerState {
                load: 0,
                overloaded: false,
                broken: false,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        let (overloaded, broken) = {
            let mut state = self.state.lock();
            state.listeners.push(listener.clone());
            (state.overloaded, state.broken)
        };
        // Bring the new listener up to date, outside the lock.
        if overloaded {
            listener.overload(true);
        }
        if broken {
            listener.broken();
        }
    }

    /// Raise the load by one. Returns the new load.
    pub fn increment(&self) -> usize {
        let (load, edges, listeners) = {
            let mut state = self.state.lock();
            state.load += 1;
            let mut edges = Vec::new();
            if !state.overloaded && state.load >= self.soft_limit {
                state.overloaded = true;
                edges.push(Edge::Overload(true));
            }
            if !state.broken && state.load >= self.hard_limit {
                state.broken = true;
                edges.push(Edge::Broken);
                tracing::warn!(breaker = self.name, load = state.load, "hard limit reached");
            }
            let listeners = if edges.is_empty() {
                Vec::new()
            } else {
                state.listeners.clone()
            };
            (state.load, edges, listeners)
        };
        fire(&listeners, &edges);
        load
    }

    /// Lower the load by one. Returns the new load.
    pub fn decrement(&self) -> usize {
        let (load, edges, listeners) = {
            let mut state = self.state.lock();
            state.load = state.load.saturating_sub(1);
            let mut edges = Vec::new();
            if state.overloaded && state.load < self.soft_limit {
                state.overloaded = false;
                edges.push(Edge::Overload(false));
            }
            let listeners = if edges.is_empty() {
                Vec::new()
            } else {
                state.listeners.clone()
            };
            (state.load, edges, listeners)
        };
        fire(&listeners, &edges);
        load
    }

    pub fn load(&self) -> usize {
        self.state.lock().load
    }

    pub fn is_overloaded(&self) -> bool {
        self.state.lock().overloaded
    }

    /// True once the hard limit has ever been reached.
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }
}

fn fire(listeners: &[Arc<dyn BreakerListener>], edges: &[Edge]) {
    for edge in edges {
        for listener in listeners {
            match edge {
                Edge::Overload(overloaded) => listener.overload(*overloaded),
                Edge::Broken => listener.broken(),
            }
        }
    }
}

/// Producer-side pause point. Open by default; closing it parks every
/// caller of [`Gate::pass`] until it reopens.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Gate { tx: Arc::new(tx) }
    }

    pub fn set_open(&self, open: bool) {
        // send_if_modified keeps wakeups to actual edges.
        self.tx.send_if_modified(|state| {
            if *state != open {
                *state = open;
                true
            } else {
                false
            }
        });
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open. Returns immediately when it already
    /// is.
    pub async fn pass(&self) -> Result<(), Error> {
        let mut rx = self.tx.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| Error::Cancelled)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new()
    }
}

/// Ties a gate to a breaker: overload closes the gate, relief reopens
/// it. A broken breaker closes the gate for good.
impl BreakerListener for Gate {
    fn overload(&self, overloaded: bool) {
        self.set_open(!overloaded);
    }

    fn broken(&self) {
        self.set_open(false);
    }
}
