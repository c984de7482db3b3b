#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod bridge;
mod node;
mod pipe;
mod proxy;
mod repository;
mod service;
mod session;
mod space;
mod stream;

pub use node::Node;
pub use pipe::{BlockStream, Pipe};
pub use proxy::{Remote, RemoteInterface, RemoteMethod};
pub use repository::{Principal, SessionRepository, VolatileRepository};
pub use service::{BindError, Function, HandlerFuture, Params, Registry, Service};
pub use session::{Negotiation, Session, SessionConfig, SessionListener, SessionState};
pub use space::PipeSpace;
pub use stream::{PipeInputStream, PipeOutputStream};

// The wire-level engine, re-exported so most users depend on one crate.
pub use asterisque_core as core;
pub use asterisque_core::{
    abort, Abort, BlockFlags, CircuitBreaker, CloseResult, Control, Error, Gate, Message,
    MessageQueue, SyncConfig, TlsProfile, Value, Wire, WireOptions, MAX_PAYLOAD_SIZE,
    PRIORITY_NORMAL, PROTOCOL_VERSION,
};

/// Convenient imports for applications.
///
/// ```ignore
/// use asterisque::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Abort, Error, Node, Params, Pipe, Remote, RemoteInterface, Service, Session,
        SessionConfig, Value, Wire,
    };
    pub use asterisque_core::{IntoValue, TryFromValue};
}
