//! Header-block grammar: `key: value` lines up to the first empty line.
//!
//! Unknown keys are ignored by receivers for forward compatibility; the
//! aliases `experiment-id` and `start_time` are folded into their
//! canonical keys here so the handler matches on one spelling.

use std::fmt;
use std::str::FromStr;

/// Content mode negotiated by the `content:` header key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    Text,
    Binary,
}

impl FromStr for ContentMode {
    type Err = ();

    fn from_str(s: &str) -> Result<ContentMode, ()> {
        match s {
            "text" => Ok(ContentMode::Text),
            "binary" => Ok(ContentMode::Binary),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ContentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentMode::Text => f.write_str("text"),
            ContentMode::Binary => f.write_str("binary"),
        }
    }
}

/// Split one header line into `(key, value)`.
///
/// The value has the leading spaces after the colon stripped.  Returns
/// `None` for a line with no colon, which is a protocol error.
pub fn split_meta(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key, value.trim_start_matches(' ').trim_end_matches('\r')))
}

/// Fold header-key aliases into their canonical spelling.
pub fn canonical_key(key: &str) -> &str {
    match key {
        "experiment-id" => "domain",
        "start_time" => "start-time",
        other => other,
    }
}
