//! Binary framing.
//!
//! Frame layout: 2-byte sync pattern, one type byte (`0x01` short /
//! `0x02` long), a length field sized to the type (1 byte, or 4 bytes
//! big-endian), then a packed value stream `(stream, seq, ts, field…)`.
//! Each value is a one-byte kind marker followed by a big-endian payload
//! of the kind's natural width; strings carry a one-byte length, blobs a
//! four-byte length.  The length field counts payload bytes only.

use bytes::{Buf, BytesMut};

use crate::WireError;
use crate::value::Value;

/// Frame synchronisation pattern.
pub const SYNC: [u8; 2] = [0xAA, 0xAA];

/// Payload limit of a short (`DATA_P`) frame.
pub const SHORT_PAYLOAD_MAX: usize = u8::MAX as usize;

/// Longest string payload a binary frame can carry.
pub const STRING_MAX: usize = u8::MAX as usize;

const MARKER_INT32: u8 = 0x01;
const MARKER_UINT32: u8 = 0x02;
const MARKER_INT64: u8 = 0x03;
const MARKER_UINT64: u8 = 0x04;
const MARKER_DOUBLE: u8 = 0x05;
const MARKER_STRING: u8 = 0x06;
const MARKER_BLOB: u8 = 0x07;
const MARKER_BOOL: u8 = 0x08;
const MARKER_GUID: u8 = 0x09;

/// Message type tag: short or long payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinMsgType {
    /// `DATA_P`: one-byte length field.
    Data,
    /// `LDATA_P`: four-byte big-endian length field.
    LData,
}

impl BinMsgType {
    pub fn tag(self) -> u8 {
        match self {
            BinMsgType::Data => 0x01,
            BinMsgType::LData => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Option<BinMsgType> {
        match tag {
            0x01 => Some(BinMsgType::Data),
            0x02 => Some(BinMsgType::LData),
            _ => None,
        }
    }

    fn len_width(self) -> usize {
        match self {
            BinMsgType::Data => 1,
            BinMsgType::LData => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Incremental encoder for one frame, appending into a caller-owned buffer.
///
/// `begin` writes the envelope and the `(stream, seq, ts)` prefix;
/// `finish` patches the length field and reports the final message type
/// (the frame is upgraded in place to `LDATA_P` when the payload outgrows
/// the one-byte length field).
pub struct BinEncoder<'a> {
    buf: &'a mut Vec<u8>,
    len_pos: usize,
    long: bool,
}

impl<'a> BinEncoder<'a> {
    pub fn begin(
        buf: &'a mut Vec<u8>,
        msgtype: BinMsgType,
        stream: u32,
        seq: u64,
        ts: f64,
    ) -> BinEncoder<'a> {
        buf.extend_from_slice(&SYNC);
        buf.push(msgtype.tag());
        let len_pos = buf.len();
        buf.extend_from_slice(&[0u8; 4][..msgtype.len_width()]);
        let mut enc = BinEncoder {
            buf,
            len_pos,
            long: msgtype == BinMsgType::LData,
        };
        enc.push_value(&Value::UInt32(stream));
        enc.push_value(&Value::UInt64(seq));
        enc.push_value(&Value::Double(ts));
        enc
    }

    pub fn push_value(&mut self, v: &Value) {
        let buf = &mut *self.buf;
        match v {
            Value::Int32(x) => {
                buf.push(MARKER_INT32);
                buf.extend_from_slice(&x.to_be_bytes());
            }
            Value::UInt32(x) => {
                buf.push(MARKER_UINT32);
                buf.extend_from_slice(&x.to_be_bytes());
            }
            Value::Int64(x) => {
                buf.push(MARKER_INT64);
                buf.extend_from_slice(&x.to_be_bytes());
            }
            Value::UInt64(x) => {
                buf.push(MARKER_UINT64);
                buf.extend_from_slice(&x.to_be_bytes());
            }
            Value::Double(x) => {
                buf.push(MARKER_DOUBLE);
                buf.extend_from_slice(&x.to_be_bytes());
            }
            Value::Bool(x) => {
                buf.push(MARKER_BOOL);
                buf.push(u8::from(*x));
            }
            Value::String(s) => {
                let bytes = truncated(s);
                buf.push(MARKER_STRING);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
            Value::Blob(b) => {
                buf.push(MARKER_BLOB);
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Value::Guid(x) => {
                buf.push(MARKER_GUID);
                buf.extend_from_slice(&x.to_be_bytes());
            }
        }
    }

    /// Patch the length field and return the frame's final type.
    pub fn finish(self) -> BinMsgType {
        let mut payload_len = self.buf.len() - self.len_pos - if self.long { 4 } else { 1 };
        if self.long {
            self.buf[self.len_pos..self.len_pos + 4]
                .copy_from_slice(&(payload_len as u32).to_be_bytes());
            return BinMsgType::LData;
        }
        if payload_len <= SHORT_PAYLOAD_MAX {
            self.buf[self.len_pos] = payload_len as u8;
            return BinMsgType::Data;
        }
        // Payload outgrew the one-byte length field: rewrite the type tag
        // and widen the length field in place.
        self.buf[self.len_pos - 1] = BinMsgType::LData.tag();
        self.buf
            .splice(self.len_pos..self.len_pos, [0u8, 0, 0]);
        payload_len = self.buf.len() - self.len_pos - 4;
        self.buf[self.len_pos..self.len_pos + 4]
            .copy_from_slice(&(payload_len as u32).to_be_bytes());
        BinMsgType::LData
    }
}

fn truncated(s: &str) -> &[u8] {
    if s.len() <= STRING_MAX {
        return s.as_bytes();
    }
    let mut end = STRING_MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    tracing::warn!(len = s.len(), "string truncated to {end} bytes for binary frame");
    &s.as_bytes()[..end]
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BinFrame {
    pub msgtype: BinMsgType,
    pub stream: u32,
    pub seq: u64,
    pub ts: f64,
    pub values: Vec<Value>,
}

/// Decode the next frame out of an accumulation buffer.
///
/// Junk ahead of the sync pattern is discarded (with a warning).  Returns
/// `Ok(None)` when the buffer does not yet hold a complete frame; nothing
/// past the junk is consumed, so the caller can retry once more bytes
/// arrive.  An unknown type tag consumes the sync pattern and errors, so
/// the scan resumes at the next frame boundary.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<BinFrame>, WireError> {
    skip_to_sync(buf);

    if buf.len() < 3 {
        return Ok(None);
    }
    let Some(msgtype) = BinMsgType::from_tag(buf[2]) else {
        let tag = buf[2];
        buf.advance(3);
        return Err(WireError::UnknownType(tag));
    };

    let header_len = 3 + msgtype.len_width();
    if buf.len() < header_len {
        return Ok(None);
    }
    let payload_len = match msgtype {
        BinMsgType::Data => buf[3] as usize,
        BinMsgType::LData => u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize,
    };
    if buf.len() < header_len + payload_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let payload = buf.split_to(payload_len);
    let mut cur = &payload[..];

    let stream = match read_value(&mut cur)? {
        Value::UInt32(v) => v,
        _ => return Err(WireError::Malformed("stream index is not a uint32")),
    };
    let seq = match read_value(&mut cur)? {
        Value::UInt64(v) => v,
        _ => return Err(WireError::Malformed("sequence number is not a uint64")),
    };
    let ts = match read_value(&mut cur)? {
        Value::Double(v) => v,
        _ => return Err(WireError::Malformed("timestamp is not a double")),
    };

    let mut values = Vec::new();
    while !cur.is_empty() {
        values.push(read_value(&mut cur)?);
    }

    Ok(Some(BinFrame {
        msgtype,
        stream,
        seq,
        ts,
        values,
    }))
}

fn skip_to_sync(buf: &mut BytesMut) {
    let pos = buf
        .windows(2)
        .position(|w| w == SYNC);
    match pos {
        Some(0) => {}
        Some(n) => {
            tracing::warn!(skipped = n, "skipped bytes searching for frame sync");
            buf.advance(n);
        }
        None => {
            // Keep the last byte: it may be the first half of a sync pair.
            let n = buf.len().saturating_sub(1);
            if n > 0 {
                tracing::warn!(skipped = n, "skipped bytes searching for frame sync");
                buf.advance(n);
            }
        }
    }
}

fn take<'a>(cur: &mut &'a [u8], n: usize) -> Result<&'a [u8], WireError> {
    if cur.len() < n {
        return Err(WireError::Truncated);
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

fn take_arr<const N: usize>(cur: &mut &[u8]) -> Result<[u8; N], WireError> {
    let bytes = take(cur, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    Ok(arr)
}

fn read_value(cur: &mut &[u8]) -> Result<Value, WireError> {
    let marker = take(cur, 1)?[0];
    let v = match marker {
        MARKER_INT32 => Value::Int32(i32::from_be_bytes(take_arr(cur)?)),
        MARKER_UINT32 => Value::UInt32(u32::from_be_bytes(take_arr(cur)?)),
        MARKER_INT64 => Value::Int64(i64::from_be_bytes(take_arr(cur)?)),
        MARKER_UINT64 => Value::UInt64(u64::from_be_bytes(take_arr(cur)?)),
        MARKER_DOUBLE => Value::Double(f64::from_be_bytes(take_arr(cur)?)),
        MARKER_BOOL => Value::Bool(take(cur, 1)?[0] != 0),
        MARKER_STRING => {
            let len = take(cur, 1)?[0] as usize;
            let bytes = take(cur, len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| WireError::BadUtf8)?;
            Value::String(s.to_owned())
        }
        MARKER_BLOB => {
            let len = u32::from_be_bytes(take_arr(cur)?) as usize;
            Value::Blob(take(cur, len)?.to_vec())
        }
        MARKER_GUID => Value::Guid(u64::from_be_bytes(take_arr(cur)?)),
        other => return Err(WireError::UnknownMarker(other)),
    };
    Ok(v)
}
