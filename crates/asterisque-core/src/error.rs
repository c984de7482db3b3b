//! Error taxonomy for the protocol engine.
//!
//! Kinds, not mechanisms: `Error` classifies every failure a peer can
//! observe. Whether a given kind is fatal for the session is decided by
//! the dispatcher, not here.

use std::fmt;

/// A failure observed by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Framing, magic, version, ordering or field violation. Fatal for
    /// the session.
    Protocol(String),

    /// A value could not be encoded to, or decoded from, the wire form.
    /// Surfaced to the peer as an unexpected-error Close; does not kill
    /// the session.
    Codec(CodecError),

    /// Pipe-id space full or a hard load limit reached.
    ResourceExhausted(String),

    /// Unknown pipe id or function id. Surfaced as a descriptive Close;
    /// not fatal.
    NotFound(String),

    /// Operation on an already-closed pipe, session, queue or wire.
    Closed(&'static str),

    /// A single-consumer resource was observed a second time.
    AlreadyConsumed(&'static str),

    /// Cooperative cancellation.
    Cancelled,

    /// Bubbled up from the transport bridge; fatal for the affected wire.
    Transport(String),
}

impl Error {
    /// True for kinds that force the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::ResourceExhausted(_) | Error::Transport(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::Closed(what) => write!(f, "{} is closed", what),
            Error::AlreadyConsumed(what) => write!(f, "{} already consumed", what),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

/// Serialization failures, kept separate from [`Error`] so the codec can
/// be used without pulling in the session-level taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame did not start with the protocol magic.
    BadMagic(u16),
    /// Message type tag not one of Open/Close/Block/Control.
    UnknownMessageType(u8),
    /// Control subcode not recognised.
    UnknownControlCode(u8),
    /// Value type tag not in the transferable set.
    UnknownValueTag(u8),
    /// Close result tag was neither success nor failure.
    UnknownResultTag(u8),
    /// Encoded frame body would exceed the u16 length field.
    FrameTooLarge(usize),
    /// Block payload above the wire contract bound.
    PayloadTooLarge { len: usize, max: usize },
    /// A length-prefixed field does not fit its prefix.
    FieldTooLarge { field: &'static str, len: usize },
    /// Frame body ended before the structure it declared.
    Truncated { field: &'static str },
    /// Frame body declared more bytes than its structure consumed.
    TrailingBytes(usize),
    /// Value nesting deeper than the decoder is willing to recurse.
    NestingTooDeep,
    /// A string field held invalid UTF-8.
    InvalidUtf8 { field: &'static str },
    /// A char field held a value outside the Unicode scalar range.
    InvalidChar(u32),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BadMagic(m) => {
                write!(f, "bad frame magic 0x{:04X}, expected 0x2A51", m)
            }
            CodecError::UnknownMessageType(t) => write!(f, "unknown message type 0x{:02X}", t),
            CodecError::UnknownControlCode(c) => write!(f, "unknown control subcode 0x{:02X}", c),
            CodecError::UnknownValueTag(t) => write!(f, "unknown value type tag 0x{:02X}", t),
            CodecError::UnknownResultTag(t) => write!(f, "unknown close result tag 0x{:02X}", t),
            CodecError::FrameTooLarge(len) => {
                write!(f, "frame body of {} bytes exceeds the u16 length field", len)
            }
            CodecError::PayloadTooLarge { len, max } => {
                write!(f, "block payload of {} bytes exceeds the {} byte bound", len, max)
            }
            CodecError::FieldTooLarge { field, len } => {
                write!(f, "{} of {} bytes does not fit its length prefix", field, len)
            }
            CodecError::Truncated { field } => {
                write!(f, "frame body ended while reading {}", field)
            }
            CodecError::TrailingBytes(n) => {
                write!(f, "{} unconsumed bytes after the frame body", n)
            }
            CodecError::NestingTooDeep => write!(f, "value nesting too deep"),
            CodecError::InvalidUtf8 { field } => write!(f, "{} is not valid UTF-8", field),
            CodecError::InvalidChar(v) => {
                write!(f, "0x{:08X} is not a Unicode scalar value", v)
            }
        }
    }
}

impl std::error::Error for CodecError {}
