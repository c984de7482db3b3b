//! Message model.
//!
//! Four message kinds travel the wire: `Open` starts a call, `Close`
//! ends one, `Block` streams payload inside a live call, and `Control`
//! carries session-level signalling on the reserved pipe id 0.

use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;
use uuid::Uuid;

use crate::limits::{CONTROL_PIPE_ID, MAX_PAYLOAD_SIZE};
use crate::value::Value;
use crate::Error;

/// Neutral message priority. Higher values are more urgent; the field is
/// a carried tag and does not reorder queues.
pub const PRIORITY_NORMAL: i8 = 0;

bitflags! {
    /// Flag byte of a Block message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Final block of the stream.
        const EOF = 0b0000_0001;
    }
}

/// Well-known application codes carried in a failure Close.
pub mod abort {
    /// Handler raised something the engine did not expect.
    pub const UNEXPECTED: i32 = 100;
    /// The session was closed while the call was outstanding.
    pub const SESSION_CLOSED: i32 = 101;
    /// No function registered under the requested id.
    pub const FUNCTION_NOT_FOUND: i32 = 102;
    /// Open carried a pipe id that is already live.
    pub const DUPLICATE_PIPE_ID: i32 = 103;
    /// Block or Close referenced a pipe this peer does not know.
    pub const UNKNOWN_PIPE_ID: i32 = 104;
    /// The call was cooperatively cancelled.
    pub const CANCELLED: i32 = 105;
    /// The pipe's inbound block backlog exceeded its bound.
    pub const BACKLOG_EXCEEDED: i32 = 106;
}

/// Application-level failure result of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub code: i32,
    pub message: String,
}

impl Abort {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Abort {
            code,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Abort::new(abort::UNEXPECTED, message)
    }

    pub fn session_closed() -> Self {
        Abort::new(abort::SESSION_CLOSED, "session closed")
    }

    pub fn cancelled() -> Self {
        Abort::new(abort::CANCELLED, "cancelled")
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "abort({}): {}", self.code, self.message)
    }
}

impl std::error::Error for Abort {}

/// Outcome of a call as carried in a Close message.
pub type CloseResult = Result<Value, Abort>;

/// Handshake payload. Each peer sends exactly one; the exchange moves
/// the session to its active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub version: u16,
    pub node_id: Uuid,
    /// All-zero on a secondary's first connect; the primary assigns or
    /// resumes the real id in its response.
    pub session_id: Uuid,
    pub utc_millis: i64,
    pub ping_secs: i32,
    pub session_timeout_secs: i32,
}

impl SyncConfig {
    pub fn is_new_session(&self) -> bool {
        self.session_id.is_nil()
    }
}

/// Session-level signalling, bound to pipe id 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Configuration handshake.
    SyncConfig(SyncConfig),
    /// Graceful session termination.
    Close,
    /// Liveness probe, sent at the negotiated ping interval. Carries
    /// the sender's clock so the peer can echo it back.
    Ping { utc_millis: i64 },
    /// Answer to a Ping, echoing its timestamp.
    Pong { utc_millis: i64 },
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Initiates a call on the receiving peer.
    Open {
        pipe_id: u16,
        priority: i8,
        function_id: u16,
        params: Vec<Value>,
    },
    /// Terminates a call, carrying its outcome.
    Close {
        pipe_id: u16,
        result: CloseResult,
    },
    /// Streaming payload inside a live call.
    Block {
        pipe_id: u16,
        priority: i8,
        flags: BlockFlags,
        loss: u8,
        payload: Bytes,
    },
    /// Session-level signalling; pipe id is implicitly 0.
    Control(Control),
}

impl Message {
    /// Build a data block, checking the wire payload bound.
    pub fn block(pipe_id: u16, priority: i8, payload: Bytes) -> Result<Message, Error> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!(
                "block payload of {} bytes exceeds the {} byte bound",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        Ok(Message::Block {
            pipe_id,
            priority,
            flags: BlockFlags::empty(),
            loss: 0,
            payload,
        })
    }

    /// Build the stream-terminating block.
    pub fn eof_block(pipe_id: u16, priority: i8) -> Message {
        Message::Block {
            pipe_id,
            priority,
            flags: BlockFlags::EOF,
            loss: 0,
            payload: Bytes::new(),
        }
    }

    /// The pipe this message belongs to. Control messages live on the
    /// reserved id 0.
    pub fn pipe_id(&self) -> u16 {
        match self {
            Message::Open { pipe_id, .. }
            | Message::Close { pipe_id, .. }
            | Message::Block { pipe_id, .. } => *pipe_id,
            Message::Control(_) => CONTROL_PIPE_ID,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Message::Control(_))
    }

    /// Short name of the variant, for logs and errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Open { .. } => "Open",
            Message::Close { .. } => "Close",
            Message::Block { .. } => "Block",
            Message::Control(Control::SyncConfig(_)) => "Control.SyncConfig",
            Message::Control(Control::Close) => "Control.Close",
            Message::Control(Control::Ping { .. }) => "Control.Ping",
            Message::Control(Control::Pong { .. }) => "Control.Pong",
        }
    }

    /// Structural invariants every message must satisfy before it may
    /// touch the wire: data messages never use the reserved pipe id, and
    /// block payloads respect the wire bound.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Message::Open { pipe_id, .. } | Message::Close { pipe_id, .. } => {
                if *pipe_id == CONTROL_PIPE_ID {
                    return Err(Error::Protocol(format!(
                        "{} on the reserved pipe id 0",
                        self.type_name()
                    )));
                }
                Ok(())
            }
            Message::Block { pipe_id, payload, .. } => {
                if *pipe_id == CONTROL_PIPE_ID {
                    return Err(Error::Protocol("Block on the reserved pipe id 0".into()));
                }
                if payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(Error::Protocol(format!(
                        "block payload of {} bytes exceeds the {} byte bound",
                        payload.len(),
                        MAX_PAYLOAD_SIZE
                    )));
                }
                Ok(())
            }
            Message::Control(_) => Ok(()),
        }
    }
}
