//! Wire-level constants shared by both peers.

/// Two-byte frame magic, `"*Q"`. Doubles as an endianness check: a peer
/// reading `0x512A` is decoding little-endian and must abort.
pub const MAGIC: u16 = 0x2A51;

/// Current protocol version (major = 1, minor = 0).
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Maximum payload of a single Block message.
///
/// The frame length field is a u16, so a body can never exceed 65 535
/// bytes; 61 KiB leaves headroom for the Block header regardless of how
/// the surrounding fields evolve within the 1.x line.
pub const MAX_PAYLOAD_SIZE: usize = 61 * 1024;

/// Maximum encoded frame body (everything after the magic and the length
/// field itself).
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Pipe id 0 is reserved for Control messages.
pub const CONTROL_PIPE_ID: u16 = 0;

/// The high bit of a pipe id encodes which peer allocated it. Primary
/// peers set the bit, secondary peers leave it clear, giving each side a
/// disjoint 32 768-value id space.
pub const PIPE_ID_PRIMARY_MASK: u16 = 0x8000;

/// Default cooperative limit for inbound and outbound message queues.
pub const DEFAULT_QUEUE_LIMIT: usize = 64;

/// Default buffer size of the byte-oriented pipe output stream.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 4 * 1024;

/// Ping interval negotiation bounds, in seconds.
pub const DEFAULT_PING_SECS: i32 = 30;
pub const MIN_PING_SECS: i32 = 1;
pub const MAX_PING_SECS: i32 = 300;

/// Session timeout negotiation bounds, in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: i32 = 600;
pub const MIN_SESSION_TIMEOUT_SECS: i32 = 30;
pub const MAX_SESSION_TIMEOUT_SECS: i32 = 3600;
