//! Bounded-by-convention message queue.
//!
//! The queue never hard-rejects an offer. Its capacity is a cooperative
//! limit: crossing it flips the `offerable` signal so producers pause on
//! their own, and dropping back below flips it again. Listener callbacks
//! always run outside the queue lock, so a callback may re-enter the
//! queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::breaker::CircuitBreaker;
use crate::message::Message;
use crate::Error;

/// Observer of queue readability/writability edges.
pub trait QueueListener: Send + Sync {
    /// `true` when the queue went from empty to non-empty, `false` when
    /// it drained back to empty.
    fn pollable(&self, _queue: &MessageQueue, _pollable: bool) {}

    /// `false` when size reached the cooperative limit, `true` when it
    /// fell back below.
    fn offerable(&self, _queue: &MessageQueue, _offerable: bool) {}
}

struct Inner {
    buf: VecDeque<Message>,
    closed: bool,
    listeners: Vec<Arc<dyn QueueListener>>,
    meter: Option<Arc<CircuitBreaker>>,
}

enum QueueEdge {
    Pollable(bool),
    Offerable(bool),
}

/// FIFO buffer between the session dispatcher and the transport bridge.
pub struct MessageQueue {
    name: String,
    cooperative_limit: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(name: impl Into<String>, cooperative_limit: usize) -> Self {
        assert!(cooperative_limit > 0, "cooperative limit must be positive");
        MessageQueue {
            name: name.into(),
            cooperative_limit,
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                closed: false,
                listeners: Vec::new(),
                meter: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cooperative_limit(&self) -> usize {
        self.cooperative_limit
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Attach a load meter; every buffered message counts one unit of
    /// load from offer until poll.
    pub fn set_meter(&self, meter: Arc<CircuitBreaker>) {
        self.inner.lock().meter = Some(meter);
    }

    /// Append a message. Fails only after [`close`](Self::close).
    pub fn offer(&self, msg: Message) -> Result<(), Error> {
        let (edges, listeners, meter) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::Closed("message queue"));
            }
            let was_empty = inner.buf.is_empty();
            inner.buf.push_back(msg);
            let len = inner.buf.len();

            let mut edges = Vec::new();
            if was_empty {
                edges.push(QueueEdge::Pollable(true));
            }
            if len == self.cooperative_limit {
                edges.push(QueueEdge::Offerable(false));
            }
            let listeners = if edges.is_empty() {
                Vec::new()
            } else {
                inner.listeners.clone()
            };
            (edges, listeners, inner.meter.clone())
        };

        if let Some(meter) = meter {
            meter.increment();
        }
        self.fire(&listeners, &edges);
        self.notify.notify_waiters();
        Ok(())
    }

    /// External equivalent of the end-of-message sentinel: the producer
    /// announces there is nothing more to offer.
    pub fn offer_end(&self) {
        self.close();
    }

    /// Remove the head without waiting. `None` means the queue is empty
    /// right now or closed and fully drained; check
    /// [`is_closed`](Self::is_closed) to tell the two apart.
    pub fn poll(&self) -> Option<Message> {
        match self.try_take() {
            TryTake::Item(msg) => Some(msg),
            TryTake::Empty | TryTake::Ended => None,
        }
    }

    /// Remove the head, waiting for one to arrive. `None` is the
    /// end-of-stream marker: the queue closed and every remaining item
    /// has been drained.
    pub async fn take(&self) -> Option<Message> {
        loop {
            // Register before checking, so an offer between the check
            // and the await cannot be missed. notify_waiters only wakes
            // futures that are already enabled.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            match self.try_take() {
                TryTake::Item(msg) => return Some(msg),
                TryTake::Ended => return None,
                TryTake::Empty => notified.await,
            }
        }
    }

    /// [`take`](Self::take) bounded by a timeout.
    pub async fn take_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Message>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.take()).await
    }

    /// Idempotent. Wakes all waiters; already-buffered messages remain
    /// pollable until drained, after which consumers see end-of-stream.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        tracing::debug!(queue = %self.name, "closed");
        self.notify.notify_waiters();
    }

    /// Register a listener and immediately report the current state to
    /// it.
    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        let len = {
            let mut inner = self.inner.lock();
            inner.listeners.push(listener.clone());
            inner.buf.len()
        };
        listener.pollable(self, len > 0);
        listener.offerable(self, len < self.cooperative_limit);
    }

    fn try_take(&self) -> TryTake {
        let (taken, edges, listeners, meter) = {
            let mut inner = self.inner.lock();
            match inner.buf.pop_front() {
                None => {
                    return if inner.closed {
                        TryTake::Ended
                    } else {
                        TryTake::Empty
                    };
                }
                Some(msg) => {
                    let len = inner.buf.len();
                    let mut edges = Vec::new();
                    if len == 0 {
                        edges.push(QueueEdge::Pollable(false));
                    }
                    if len + 1 == self.cooperative_limit {
                        edges.push(QueueEdge::Offerable(true));
                    }
                    let listeners = if edges.is_empty() {
                        Vec::new()
                    } else {
                        inner.listeners.clone()
                    };
                    (msg, edges, listeners, inner.meter.clone())
                }
            }
        };

        if let Some(meter) = meter {
            meter.decrement();
        }
        self.fire(&listeners, &edges);
        TryTake::Item(taken)
    }

    fn fire(&self, listeners: &[Arc<dyn QueueListener>], edges: &[QueueEdge]) {
        for edge in edges {
            for listener in listeners {
                match edge {
                    QueueEdge::Pollable(pollable) => listener.pollable(self, *pollable),
                    QueueEdge::Offerable(offerable) => listener.offerable(self, *offerable),
                }
            }
        }
    }
}

enum TryTake {
    Item(Message),
    Empty,
    Ended,
}
