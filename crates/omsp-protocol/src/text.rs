//! Text framing: one sample per tab-separated line.
//!
//! `<ts>\t<index>\t<seq>\t<field>…\n`: numerics in decimal, doubles with
//! six fractional digits, strings backslash-escaped over tab, newline,
//! carriage return and backslash, blobs base64, booleans `0`/`1`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::WireError;
use crate::value::{Value, ValueKind};

/// Append the fixed row prefix (timestamp, stream index, sequence number).
pub fn push_row_start(buf: &mut Vec<u8>, ts: f64, index: u32, seq: u64) {
    use std::io::Write;
    let _ = write!(buf, "{ts:.6}\t{index}\t{seq}");
}

/// Append one tab-prefixed field in its text form.
pub fn push_field(buf: &mut Vec<u8>, v: &Value) {
    use std::io::Write;
    buf.push(b'\t');
    match v {
        Value::Int32(x) => {
            let _ = write!(buf, "{x}");
        }
        Value::UInt32(x) => {
            let _ = write!(buf, "{x}");
        }
        Value::Int64(x) => {
            let _ = write!(buf, "{x}");
        }
        Value::UInt64(x) => {
            let _ = write!(buf, "{x}");
        }
        Value::Double(x) => {
            let _ = write!(buf, "{x:.6}");
        }
        Value::Bool(x) => buf.push(if *x { b'1' } else { b'0' }),
        Value::String(s) => escape_into(s, buf),
        Value::Blob(b) => {
            let _ = write!(buf, "{}", BASE64.encode(b));
        }
        Value::Guid(x) => {
            let _ = write!(buf, "{x}");
        }
    }
}

/// Terminate the current row.
pub fn push_row_end(buf: &mut Vec<u8>) {
    buf.push(b'\n');
}

fn escape_into(s: &str, buf: &mut Vec<u8>) {
    for b in s.bytes() {
        match b {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            other => buf.push(other),
        }
    }
}

/// Undo [`escape_into`].  Unrecognized escapes keep the escaped byte.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

/// Convert one raw (already tab-split) field into the declared kind.
pub fn decode_field(kind: ValueKind, field: &str) -> Result<Value, WireError> {
    let bad = || WireError::BadField {
        kind,
        input: field.to_owned(),
    };
    match kind {
        ValueKind::Int32 => field.parse().map(Value::Int32).map_err(|_| bad()),
        ValueKind::UInt32 => field.parse().map(Value::UInt32).map_err(|_| bad()),
        ValueKind::Int64 => field.parse().map(Value::Int64).map_err(|_| bad()),
        ValueKind::UInt64 => field.parse().map(Value::UInt64).map_err(|_| bad()),
        ValueKind::Double => field.parse().map(Value::Double).map_err(|_| bad()),
        ValueKind::Bool => match field {
            "0" | "false" => Ok(Value::Bool(false)),
            "1" | "true" => Ok(Value::Bool(true)),
            _ => Err(bad()),
        },
        ValueKind::String => Ok(Value::String(unescape(field))),
        ValueKind::Blob => BASE64.decode(field).map(Value::Blob).map_err(|_| bad()),
        ValueKind::Guid => field.parse().map(Value::Guid).map_err(|_| bad()),
        ValueKind::Unknown => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_text(v: &Value) -> String {
        let mut buf = Vec::new();
        push_field(&mut buf, v);
        String::from_utf8(buf[1..].to_vec()).unwrap()
    }

    #[test]
    fn row_prefix_format() {
        let mut buf = Vec::new();
        push_row_start(&mut buf, 1.5, 3, 42);
        assert_eq!(buf, b"1.500000\t3\t42");
    }

    #[test]
    fn encode_decode_identity_all_kinds() {
        let values = [
            Value::Int32(-12),
            Value::UInt32(12),
            Value::Int64(-1234567890123),
            Value::UInt64(18446744073709551615),
            Value::Double(4.5),
            Value::Bool(true),
            Value::String("plain".to_owned()),
            Value::String("tabs\tand\nnewlines\\and\rreturns".to_owned()),
            Value::Blob(vec![0u8, 1, 2, 254, 255]),
            Value::Guid(0xdead_beef),
        ];
        for v in values {
            let text = field_text(&v);
            assert!(!text.contains('\t'), "field text leaks a tab: {text:?}");
            assert!(!text.contains('\n'), "field text leaks a newline: {text:?}");
            let back = decode_field(v.kind(), &text).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn bools_encode_as_digits() {
        assert_eq!(field_text(&Value::Bool(false)), "0");
        assert_eq!(field_text(&Value::Bool(true)), "1");
    }

    #[test]
    fn doubles_have_six_digits() {
        assert_eq!(field_text(&Value::Double(4.5)), "4.500000");
    }

    #[test]
    fn conversion_failures_are_reported() {
        assert!(decode_field(ValueKind::Int32, "4.5").is_err());
        assert!(decode_field(ValueKind::UInt32, "-1").is_err());
        assert!(decode_field(ValueKind::Bool, "yes").is_err());
        assert!(decode_field(ValueKind::Blob, "!!notbase64!!").is_err());
    }
}
