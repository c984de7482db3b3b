//! Transport bridge interface.
//!
//! The bridge is an external collaborator: it owns sockets, the TLS
//! handshake, and the encode/decode loop, and hands the engine fully
//! formed [`Wire`]s. Concrete network bindings (WebSocket, TCP) are
//! separate crates; the one implementation living here is [`MemBridge`],
//! the in-process `mem://` binding.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use asterisque_core::{Error, Wire, WireOptions, DEFAULT_QUEUE_LIMIT};

/// TLS settings a bridge applies when dialing or accepting.
#[derive(Debug, Clone)]
pub struct TlsContext {
    /// Expected server name when dialing; bridges may derive it from
    /// the URI when absent.
    pub server_name: Option<String>,
    /// Whether to require and validate a peer certificate.
    pub verify_peer: bool,
}

impl Default for TlsContext {
    fn default() -> Self {
        TlsContext {
            server_name: None,
            verify_peer: true,
        }
    }
}

/// Per-connection bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Application subprotocol announced on the transport.
    pub subprotocol: String,
    pub inbound_queue_size: usize,
    pub outbound_queue_size: usize,
    /// Absent means a plaintext transport.
    pub tls: Option<TlsContext>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            subprotocol: "v10.asterisque".to_string(),
            inbound_queue_size: DEFAULT_QUEUE_LIMIT,
            outbound_queue_size: DEFAULT_QUEUE_LIMIT,
            tls: None,
        }
    }
}

/// Handle to a listening endpoint.
pub trait Server: Send + Sync {
    /// The URI actually bound, which may differ from the requested one
    /// (for instance port 0).
    fn uri(&self) -> &str;

    /// Stop accepting. Established wires stay up.
    fn close(&self);
}

/// Callback invoked for each newly accepted wire.
pub type AcceptCallback = Arc<dyn Fn(Arc<Wire>) + Send + Sync>;

/// A transport binding. Implementations register the URI schemes they
/// understand (typically `ws://` and `wss://`) and produce wires whose
/// queues are already being pumped.
pub trait Bridge: Send + Sync {
    /// True when this bridge can handle the given URI.
    fn supports(&self, uri: &str) -> bool;

    /// Dial a peer. The returned wire is secondary.
    fn connect(&self, uri: &str, config: BridgeConfig) -> BoxFuture<'static, Result<Arc<Wire>, Error>>;

    /// Accept peers. Each established wire is primary and handed to
    /// `on_accept`.
    fn listen(
        &self,
        uri: &str,
        config: BridgeConfig,
        on_accept: AcceptCallback,
    ) -> BoxFuture<'static, Result<Arc<dyn Server>, Error>>;
}

/// In-process bridge for the `mem://` scheme. Dialing a URI with a
/// registered listener produces a cross-connected wire pair, primary on
/// the listener side. No bytes, no codec: the same path production
/// bridges take, minus the socket.
#[derive(Clone, Default)]
pub struct MemBridge {
    inner: Arc<MemBridgeInner>,
}

#[derive(Default)]
struct MemBridgeInner {
    listeners: Mutex<HashMap<String, MemListener>>,
}

struct MemListener {
    config: BridgeConfig,
    on_accept: AcceptCallback,
}

struct MemServer {
    uri: String,
    inner: Weak<MemBridgeInner>,
}

impl Server for MemServer {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().remove(&self.uri);
        }
    }
}

impl MemBridge {
    pub fn new() -> Self {
        MemBridge::default()
    }
}

impl Bridge for MemBridge {
    fn supports(&self, uri: &str) -> bool {
        uri.starts_with("mem://")
    }

    fn connect(
        &self,
        uri: &str,
        config: BridgeConfig,
    ) -> BoxFuture<'static, Result<Arc<Wire>, Error>> {
        let inner = self.inner.clone();
        let uri = uri.to_string();
        Box::pin(async move {
            let (listener_config, on_accept) = {
                let listeners = inner.listeners.lock();
                let Some(listener) = listeners.get(&uri) else {
                    return Err(Error::Transport(format!("no listener at {}", uri)));
                };
                (listener.config.clone(), listener.on_accept.clone())
            };
            let (primary, secondary) = Wire::pair_with(
                WireOptions {
                    inbound_limit: listener_config.inbound_queue_size,
                    outbound_limit: listener_config.outbound_queue_size,
                    ..WireOptions::default()
                },
                WireOptions {
                    inbound_limit: config.inbound_queue_size,
                    outbound_limit: config.outbound_queue_size,
                    ..WireOptions::default()
                },
            );
            on_accept(primary);
            Ok(secondary)
        })
    }

    fn listen(
        &self,
        uri: &str,
        config: BridgeConfig,
        on_accept: AcceptCallback,
    ) -> BoxFuture<'static, Result<Arc<dyn Server>, Error>> {
        let inner = self.inner.clone();
        let uri = uri.to_string();
        Box::pin(async move {
            let mut listeners = inner.listeners.lock();
            if listeners.contains_key(&uri) {
                return Err(Error::Transport(format!("{} is already bound", uri)));
            }
            listeners.insert(uri.clone(), MemListener { config, on_accept });
            Ok(Arc::new(MemServer {
                uri,
                inner: Arc::downgrade(&inner),
            }) as Arc<dyn Server>)
        })
    }
}
