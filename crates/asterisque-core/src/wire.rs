//! Session ↔ transport interface.
//!
//! A `Wire` owns the inbound and outbound message queues plus the
//! transport metadata the session needs (addresses, role, TLS). It holds
//! no protocol state: the bridge pumps decoded messages into `inbound`
//! and drains `outbound` into the socket, and when the transport dies it
//! closes the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::limits::DEFAULT_QUEUE_LIMIT;
use crate::queue::MessageQueue;

/// TLS session descriptor handed over by the transport bridge. The
/// engine only ever reads the peer principal; the rest is for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProfile {
    /// Peer identity as validated by the trust collaborator.
    pub peer_principal: String,
    pub cipher_suite: String,
}

/// Observer of wire teardown.
pub trait WireListener: Send + Sync {
    fn wire_closed(&self, wire: &Wire);
}

/// Construction parameters for a [`Wire`].
#[derive(Debug, Clone)]
pub struct WireOptions {
    pub local_address: String,
    pub remote_address: String,
    pub tls: Option<TlsProfile>,
    pub inbound_limit: usize,
    pub outbound_limit: usize,
}

impl Default for WireOptions {
    fn default() -> Self {
        WireOptions {
            local_address: String::new(),
            remote_address: String::new(),
            tls: None,
            inbound_limit: DEFAULT_QUEUE_LIMIT,
            outbound_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

pub struct Wire {
    name: String,
    primary: bool,
    local_address: String,
    remote_address: String,
    tls: Option<TlsProfile>,
    inbound: MessageQueue,
    outbound: MessageQueue,
    closed: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn WireListener>>>,
}

impl Wire {
    pub fn new(name: impl Into<String>, primary: bool, options: WireOptions) -> Arc<Wire> {
        let name = name.into();
        Arc::new(Wire {
            inbound: MessageQueue::new(format!("{}.in", name), options.inbound_limit),
            outbound: MessageQueue::new(format!("{}.out", name), options.outbound_limit),
            name,
            primary,
            local_address: options.local_address,
            remote_address: options.remote_address,
            tls: options.tls,
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Two cross-connected in-process wires. Everything offered to one
    /// side's outbound queue appears on the other side's inbound queue,
    /// and closing either side tears both down — the behavior of a real
    /// transport without the sockets. The first wire is the primary.
    ///
    /// Must be called from within a tokio runtime; the pumps are tasks.
    pub fn pair() -> (Arc<Wire>, Arc<Wire>) {
        Wire::pair_with(WireOptions::default(), WireOptions::default())
    }

    pub fn pair_with(primary: WireOptions, secondary: WireOptions) -> (Arc<Wire>, Arc<Wire>) {
        let a = Wire::new(
            "pair.primary",
            true,
            WireOptions {
                local_address: "mem://primary".to_string(),
                remote_address: "mem://secondary".to_string(),
                ..primary
            },
        );
        let b = Wire::new(
            "pair.secondary",
            false,
            WireOptions {
                local_address: "mem://secondary".to_string(),
                remote_address: "mem://primary".to_string(),
                ..secondary
            },
        );
        pump(a.clone(), b.clone());
        pump(b.clone(), a.clone());
        (a, b)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True on the side that accepted the transport connection.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn tls(&self) -> Option<&TlsProfile> {
        self.tls.as_ref()
    }

    /// Messages decoded from the transport, for the session dispatcher.
    pub fn inbound(&self) -> &MessageQueue {
        &self.inbound
    }

    /// Messages awaiting encode onto the transport.
    pub fn outbound(&self) -> &MessageQueue {
        &self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn WireListener>) {
        if self.is_closed() {
            listener.wire_closed(self);
            return;
        }
        self.listeners.lock().push(listener);
    }

    /// Idempotent. Closes both queues and notifies listeners; buffered
    /// outbound messages stay drainable so a graceful close can flush.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(wire = %self.name, "closing");
        self.inbound.close();
        self.outbound.close();
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.wire_closed(self);
        }
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn pump(from: Arc<Wire>, to: Arc<Wire>) {
    tokio::spawn(async move {
        loop {
            match from.outbound.take().await {
                Some(msg) => {
                    if to.inbound.offer(msg).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        // Transport gone in one direction: both ends observe a close.
        to.close();
        from.close();
    });
}
