#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod breaker;
mod codec;
mod error;
mod limits;
mod message;
mod queue;
mod value;
mod wire;

pub use breaker::*;
pub use error::*;
pub use limits::*;
pub use message::*;
pub use queue::*;
pub use value::*;
pub use wire::*;

/// Frame encode/decode, kept as a named module because the function
/// names (`encode`, `decode`) only read well qualified.
pub mod frame {
    pub use crate::codec::{decode, encode, encode_to_bytes, FrameDecoder};
}
