//! Frame codec.
//!
//! Every frame is big-endian: a 2-byte magic, a 2-byte body length
//! (excluding the magic and the length field itself), a 1-byte message
//! type tag, then the type-specific body. Decoding is strictly
//! non-destructive on partial input: until a whole frame is buffered,
//! [`decode`] returns `Ok(None)` and consumes nothing.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::CodecError;
use crate::limits::{MAGIC, MAX_FRAME_BODY, MAX_PAYLOAD_SIZE};
use crate::message::{Abort, BlockFlags, Control, Message, SyncConfig};
use crate::value::Value;

const TYPE_OPEN: u8 = 0x01;
const TYPE_CLOSE: u8 = 0x02;
const TYPE_BLOCK: u8 = 0x03;
const TYPE_CONTROL: u8 = 0x04;

const CONTROL_SYNC_CONFIG: u8 = 0x00;
const CONTROL_CLOSE: u8 = 0x01;
const CONTROL_PING: u8 = 0x02;
const CONTROL_PONG: u8 = 0x03;

const RESULT_SUCCESS: u8 = 0x00;
const RESULT_FAILURE: u8 = 0x01;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_I8: u8 = 0x02;
const TAG_I16: u8 = 0x03;
const TAG_I32: u8 = 0x04;
const TAG_I64: u8 = 0x05;
const TAG_F32: u8 = 0x06;
const TAG_F64: u8 = 0x07;
const TAG_CHAR: u8 = 0x08;
const TAG_STRING: u8 = 0x09;
const TAG_BYTES: u8 = 0x0A;
const TAG_UUID: u8 = 0x0B;
const TAG_LIST: u8 = 0x0C;
const TAG_MAP: u8 = 0x0D;
const TAG_TUPLE: u8 = 0x0E;

/// Depth bound for nested lists/maps/tuples. A hostile frame can nest a
/// new collection every three bytes, which would otherwise recurse tens
/// of thousands of levels inside one 64 KiB body.
const MAX_NESTING: usize = 64;

/// Encode one message and append the complete frame to `buf`.
pub fn encode(msg: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
    let mut body = BytesMut::with_capacity(32);
    encode_body(msg, &mut body)?;
    if body.len() > MAX_FRAME_BODY {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    buf.reserve(4 + body.len());
    buf.put_u16(MAGIC);
    buf.put_u16(body.len() as u16);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Encode one message into a fresh buffer.
pub fn encode_to_bytes(msg: &Message) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete
/// frame; nothing is consumed in that case. On success the frame bytes
/// are removed from `buf`. Malformed input fails without any guarantee
/// about buffer position, and the connection must be torn down.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 4 + body_len {
        return Ok(None);
    }

    let frame = buf.split_to(4 + body_len);
    let mut reader = Reader::new(&frame[4..]);
    let msg = decode_body(&mut reader)?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }
    Ok(Some(msg))
}

/// Incremental frame boundary over a raw byte feed. The transport bridge
/// pushes whatever it read from the socket and drains complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { buf: BytesMut::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message, or `None` until more bytes arrive.
    pub fn next(&mut self) -> Result<Option<Message>, CodecError> {
        decode(&mut self.buf)
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn encode_body(msg: &Message, body: &mut BytesMut) -> Result<(), CodecError> {
    match msg {
        Message::Open {
            pipe_id,
            priority,
            function_id,
            params,
        } => {
            body.put_u8(TYPE_OPEN);
            body.put_u16(*pipe_id);
            body.put_i8(*priority);
            body.put_u16(*function_id);
            if params.len() > u8::MAX as usize {
                return Err(CodecError::FieldTooLarge {
                    field: "parameter list",
                    len: params.len(),
                });
            }
            body.put_u8(params.len() as u8);
            for param in params {
                encode_value(param, body, 0)?;
            }
        }
        Message::Close { pipe_id, result } => {
            body.put_u8(TYPE_CLOSE);
            body.put_u16(*pipe_id);
            match result {
                Ok(value) => {
                    body.put_u8(RESULT_SUCCESS);
                    encode_value(value, body, 0)?;
                }
                Err(abort) => {
                    body.put_u8(RESULT_FAILURE);
                    body.put_i32(abort.code);
                    put_short_str(&abort.message, "abort message", body)?;
                }
            }
        }
        Message::Block {
            pipe_id,
            priority,
            flags,
            loss,
            payload,
        } => {
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge {
                    len: payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            body.put_u8(TYPE_BLOCK);
            body.put_u16(*pipe_id);
            body.put_i8(*priority);
            body.put_u8(flags.bits());
            body.put_u8(*loss);
            body.put_u16(payload.len() as u16);
            body.extend_from_slice(payload);
        }
        Message::Control(control) => {
            body.put_u8(TYPE_CONTROL);
            match control {
                Control::SyncConfig(sc) => {
                    body.put_u8(CONTROL_SYNC_CONFIG);
                    body.put_u16(sc.version);
                    body.extend_from_slice(sc.node_id.as_bytes());
                    body.extend_from_slice(sc.session_id.as_bytes());
                    body.put_i64(sc.utc_millis);
                    body.put_i32(sc.ping_secs);
                    body.put_i32(sc.session_timeout_secs);
                }
                Control::Close => {
                    body.put_u8(CONTROL_CLOSE);
                }
                Control::Ping { utc_millis } => {
                    body.put_u8(CONTROL_PING);
                    body.put_i64(*utc_millis);
                }
                Control::Pong { utc_millis } => {
                    body.put_u8(CONTROL_PONG);
                    body.put_i64(*utc_millis);
                }
            }
        }
    }
    Ok(())
}

fn decode_body(r: &mut Reader<'_>) -> Result<Message, CodecError> {
    let tag = r.u8("message type")?;
    match tag {
        TYPE_OPEN => {
            let pipe_id = r.u16("pipe id")?;
            let priority = r.i8("priority")?;
            let function_id = r.u16("function id")?;
            let count = r.u8("parameter count")? as usize;
            let mut params = Vec::with_capacity(count);
            for _ in 0..count {
                params.push(decode_value(r, 0)?);
            }
            Ok(Message::Open {
                pipe_id,
                priority,
                function_id,
                params,
            })
        }
        TYPE_CLOSE => {
            let pipe_id = r.u16("pipe id")?;
            let result = match r.u8("result tag")? {
                RESULT_SUCCESS => Ok(decode_value(r, 0)?),
                RESULT_FAILURE => {
                    let code = r.i32("abort code")?;
                    let message = get_short_str(r, "abort message")?;
                    Err(Abort { code, message })
                }
                other => return Err(CodecError::UnknownResultTag(other)),
            };
            Ok(Message::Close { pipe_id, result })
        }
        TYPE_BLOCK => {
            let pipe_id = r.u16("pipe id")?;
            let priority = r.i8("priority")?;
            let flags = BlockFlags::from_bits_truncate(r.u8("flags")?);
            let loss = r.u8("loss counter")?;
            let len = r.u16("payload length")? as usize;
            if len > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge {
                    len,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            let payload = Bytes::copy_from_slice(r.take(len, "payload")?);
            Ok(Message::Block {
                pipe_id,
                priority,
                flags,
                loss,
                payload,
            })
        }
        TYPE_CONTROL => {
            let subcode = r.u8("control subcode")?;
            match subcode {
                CONTROL_SYNC_CONFIG => {
                    let version = r.u16("protocol version")?;
                    let node_id = r.uuid("node id")?;
                    let session_id = r.uuid("session id")?;
                    let utc_millis = r.i64("utc millis")?;
                    let ping_secs = r.i32("ping interval")?;
                    let session_timeout_secs = r.i32("session timeout")?;
                    Ok(Message::Control(Control::SyncConfig(SyncConfig {
                        version,
                        node_id,
                        session_id,
                        utc_millis,
                        ping_secs,
                        session_timeout_secs,
                    })))
                }
                CONTROL_CLOSE => Ok(Message::Control(Control::Close)),
                CONTROL_PING => Ok(Message::Control(Control::Ping {
                    utc_millis: r.i64("ping timestamp")?,
                })),
                CONTROL_PONG => Ok(Message::Control(Control::Pong {
                    utc_millis: r.i64("pong timestamp")?,
                })),
                other => Err(CodecError::UnknownControlCode(other)),
            }
        }
        other => Err(CodecError::UnknownMessageType(other)),
    }
}

fn encode_value(value: &Value, body: &mut BytesMut, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_NESTING {
        return Err(CodecError::NestingTooDeep);
    }
    match value {
        Value::Null => body.put_u8(TAG_NULL),
        Value::Bool(v) => {
            body.put_u8(TAG_BOOL);
            body.put_u8(u8::from(*v));
        }
        Value::I8(v) => {
            body.put_u8(TAG_I8);
            body.put_i8(*v);
        }
        Value::I16(v) => {
            body.put_u8(TAG_I16);
            body.put_i16(*v);
        }
        Value::I32(v) => {
            body.put_u8(TAG_I32);
            body.put_i32(*v);
        }
        Value::I64(v) => {
            body.put_u8(TAG_I64);
            body.put_i64(*v);
        }
        Value::F32(v) => {
            body.put_u8(TAG_F32);
            body.put_f32(*v);
        }
        Value::F64(v) => {
            body.put_u8(TAG_F64);
            body.put_f64(*v);
        }
        Value::Char(v) => {
            body.put_u8(TAG_CHAR);
            body.put_u32(*v as u32);
        }
        Value::String(v) => {
            body.put_u8(TAG_STRING);
            put_short_str(v, "string value", body)?;
        }
        Value::Bytes(v) => {
            if v.len() > u16::MAX as usize {
                return Err(CodecError::FieldTooLarge {
                    field: "bytes value",
                    len: v.len(),
                });
            }
            body.put_u8(TAG_BYTES);
            body.put_u16(v.len() as u16);
            body.extend_from_slice(v);
        }
        Value::Uuid(v) => {
            body.put_u8(TAG_UUID);
            body.extend_from_slice(v.as_bytes());
        }
        Value::List(items) => {
            if items.len() > u16::MAX as usize {
                return Err(CodecError::FieldTooLarge {
                    field: "list value",
                    len: items.len(),
                });
            }
            body.put_u8(TAG_LIST);
            body.put_u16(items.len() as u16);
            for item in items {
                encode_value(item, body, depth + 1)?;
            }
        }
        Value::Map(entries) => {
            if entries.len() > u16::MAX as usize {
                return Err(CodecError::FieldTooLarge {
                    field: "map value",
                    len: entries.len(),
                });
            }
            body.put_u8(TAG_MAP);
            body.put_u16(entries.len() as u16);
            for (k, v) in entries {
                encode_value(k, body, depth + 1)?;
                encode_value(v, body, depth + 1)?;
            }
        }
        Value::Tuple { schema, elements } => {
            if elements.len() > u16::MAX as usize {
                return Err(CodecError::FieldTooLarge {
                    field: "tuple value",
                    len: elements.len(),
                });
            }
            body.put_u8(TAG_TUPLE);
            body.put_u16(elements.len() as u16);
            put_short_str(schema, "tuple schema", body)?;
            for element in elements {
                encode_value(element, body, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn decode_value(r: &mut Reader<'_>, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_NESTING {
        return Err(CodecError::NestingTooDeep);
    }
    let tag = r.u8("value tag")?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(r.u8("bool value")? != 0)),
        TAG_I8 => Ok(Value::I8(r.i8("i8 value")?)),
        TAG_I16 => Ok(Value::I16(r.i16("i16 value")?)),
        TAG_I32 => Ok(Value::I32(r.i32("i32 value")?)),
        TAG_I64 => Ok(Value::I64(r.i64("i64 value")?)),
        TAG_F32 => Ok(Value::F32(r.f32("f32 value")?)),
        TAG_F64 => Ok(Value::F64(r.f64("f64 value")?)),
        TAG_CHAR => {
            let raw = r.u32("char value")?;
            char::from_u32(raw)
                .map(Value::Char)
                .ok_or(CodecError::InvalidChar(raw))
        }
        TAG_STRING => Ok(Value::String(get_short_str(r, "string value")?)),
        TAG_BYTES => {
            let len = r.u16("bytes length")? as usize;
            Ok(Value::Bytes(Bytes::copy_from_slice(
                r.take(len, "bytes value")?,
            )))
        }
        TAG_UUID => Ok(Value::Uuid(r.uuid("uuid value")?)),
        TAG_LIST => {
            let count = r.u16("list count")? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value(r, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = r.u16("map count")? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let k = decode_value(r, depth + 1)?;
                let v = decode_value(r, depth + 1)?;
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        TAG_TUPLE => {
            let count = r.u16("tuple count")? as usize;
            let schema = get_short_str(r, "tuple schema")?;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(decode_value(r, depth + 1)?);
            }
            Ok(Value::Tuple { schema, elements })
        }
        other => Err(CodecError::UnknownValueTag(other)),
    }
}

fn put_short_str(s: &str, field: &'static str, body: &mut BytesMut) -> Result<(), CodecError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(CodecError::FieldTooLarge {
            field,
            len: bytes.len(),
        });
    }
    body.put_u16(bytes.len() as u16);
    body.extend_from_slice(bytes);
    Ok(())
}

fn get_short_str(r: &mut Reader<'_>, field: &'static str) -> Result<String, CodecError> {
    let len = r.u16(field)? as usize;
    let bytes = r.take(len, field)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidUtf8 { field })
}

/// Bounds-checked big-endian cursor over one frame body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated { field });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, field)?[0])
    }

    fn i8(&mut self, field: &'static str) -> Result<i8, CodecError> {
        Ok(self.u8(field)? as i8)
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self, field: &'static str) -> Result<i16, CodecError> {
        Ok(self.u16(field)? as i16)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, CodecError> {
        Ok(self.u32(field)? as i32)
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        let b = self.take(8, field)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.u32(field)?))
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, CodecError> {
        let b = self.take(8, field)?;
        Ok(f64::from_bits(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])))
    }

    fn uuid(&mut self, field: &'static str) -> Result<Uuid, CodecError> {
        let b = self.take(16, field)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }
}
