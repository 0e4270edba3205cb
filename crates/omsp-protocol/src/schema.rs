//! Measurement stream schemas and the `N NAME F:T …` meta grammar.

use crate::value::ValueKind;

/// Name of the reserved metadata stream and its backing table.
pub const METADATA_TABLE: &str = "_experiment_metadata";

/// One typed column of a stream schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: ValueKind,
}

impl FieldDef {
    pub fn new(name: &str, kind: ValueKind) -> FieldDef {
        FieldDef {
            name: name.to_owned(),
            kind,
        }
    }
}

/// A stream schema as declared on the wire: index, table name, columns.
///
/// Index 0 is reserved for [`Schema::metadata`]; client-assigned indices
/// start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub index: u32,
    pub name: String,
    pub fields: Vec<FieldDef>,
}

/// Errors from parsing or validating a schema declaration.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("empty schema declaration")]
    Empty,
    #[error("bad schema index '{0}'")]
    BadIndex(String),
    #[error("invalid identifier '{0}'")]
    InvalidName(String),
    #[error("bad field declaration '{0}' (expected name:type)")]
    BadField(String),
    #[error("unknown type token '{0}'")]
    UnknownType(String),
}

/// Validate an identifier against `[A-Za-z_][A-Za-z0-9_]*`.
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Schema {
    /// The fixed schema 0: `_experiment_metadata (subject, key, value)`.
    pub fn metadata() -> Schema {
        Schema {
            index: 0,
            name: METADATA_TABLE.to_owned(),
            fields: vec![
                FieldDef::new("subject", ValueKind::String),
                FieldDef::new("key", ValueKind::String),
                FieldDef::new("value", ValueKind::String),
            ],
        }
    }

    /// Parse the body of a `schema:` meta line: `N NAME F1:T1 F2:T2 …`.
    pub fn from_meta(body: &str) -> Result<Schema, SchemaError> {
        let mut parts = body.split_ascii_whitespace();
        let index = parts.next().ok_or(SchemaError::Empty)?;
        let index: u32 = index
            .parse()
            .map_err(|_| SchemaError::BadIndex(index.to_owned()))?;
        let name = parts.next().ok_or(SchemaError::Empty)?;
        if !valid_name(name) {
            return Err(SchemaError::InvalidName(name.to_owned()));
        }

        let mut fields = Vec::new();
        for part in parts {
            let (fname, ftype) = part
                .split_once(':')
                .ok_or_else(|| SchemaError::BadField(part.to_owned()))?;
            if !valid_name(fname) {
                return Err(SchemaError::InvalidName(fname.to_owned()));
            }
            let kind = ValueKind::from_token(ftype)
                .ok_or_else(|| SchemaError::UnknownType(ftype.to_owned()))?;
            fields.push(FieldDef {
                name: fname.to_owned(),
                kind,
            });
        }
        Ok(Schema {
            index,
            name: name.to_owned(),
            fields,
        })
    }

    /// Render the schema back into the meta grammar, canonical tokens only.
    pub fn to_meta(&self) -> String {
        let mut s = format!("{} {}", self.index, self.name);
        for f in &self.fields {
            s.push(' ');
            s.push_str(&f.name);
            s.push(':');
            s.push_str(f.kind.token());
        }
        s
    }

    /// Render without the index, as stored under `table_<name>` metadata.
    pub fn to_table_meta(&self) -> String {
        let mut s = self.name.clone();
        for f in &self.fields {
            s.push(' ');
            s.push_str(&f.name);
            s.push(':');
            s.push_str(f.kind.token());
        }
        s
    }

    /// Parse the `table_<name>` metadata form: `NAME F1:T1 F2:T2 …`.
    pub fn from_table_meta(body: &str) -> Result<Schema, SchemaError> {
        Schema::from_meta(&format!("0 {body}"))
    }

    /// Layout equality: same name, field count, field names and kinds.
    /// The index is ignored.
    pub fn layout_eq(&self, other: &Schema) -> bool {
        self.name == other.name && self.fields == other.fields
    }

    /// First mismatching column (1-based) between two same-named schemas,
    /// for conflict logging.  `None` when the layouts agree.
    pub fn first_mismatch(&self, other: &Schema) -> Option<usize> {
        if self.fields.len() != other.fields.len() {
            return Some(self.fields.len().min(other.fields.len()) + 1);
        }
        self.fields
            .iter()
            .zip(&other.fields)
            .position(|(a, b)| a != b)
            .map(|i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("foo"));
        assert!(valid_name("_foo2"));
        assert!(valid_name("F_2_bar"));
        assert!(!valid_name(""));
        assert!(!valid_name("2foo"));
        assert!(!valid_name("foo-bar"));
        assert!(!valid_name("foo bar"));
    }

    #[test]
    fn meta_round_trip() {
        let s = Schema::from_meta("3 app_radio rssi:double chan:uint32 essid:string").unwrap();
        assert_eq!(s.index, 3);
        assert_eq!(s.name, "app_radio");
        assert_eq!(s.fields.len(), 3);
        assert_eq!(s.fields[1].kind, ValueKind::UInt32);
        assert_eq!(
            s.to_meta(),
            "3 app_radio rssi:double chan:uint32 essid:string"
        );
    }

    #[test]
    fn table_meta_round_trip() {
        let s = Schema::from_meta("2 foo a:int32 b:blob").unwrap();
        let again = Schema::from_table_meta(&s.to_table_meta()).unwrap();
        assert!(s.layout_eq(&again));
    }

    #[test]
    fn legacy_tokens_canonicalize() {
        let s = Schema::from_meta("1 t a:int b:long c:float").unwrap();
        assert_eq!(s.to_meta(), "1 t a:int32 b:int32 c:double");
    }

    #[test]
    fn rejects_bad_declarations() {
        assert!(matches!(
            Schema::from_meta("x t a:int32"),
            Err(SchemaError::BadIndex(_))
        ));
        assert!(matches!(
            Schema::from_meta("1 2bad a:int32"),
            Err(SchemaError::InvalidName(_))
        ));
        assert!(matches!(
            Schema::from_meta("1 t a=int32"),
            Err(SchemaError::BadField(_))
        ));
        assert!(matches!(
            Schema::from_meta("1 t a:quux"),
            Err(SchemaError::UnknownType(_))
        ));
        assert!(matches!(Schema::from_meta(""), Err(SchemaError::Empty)));
    }

    #[test]
    fn layout_comparison_ignores_index() {
        let a = Schema::from_meta("1 t a:int32 b:double").unwrap();
        let b = Schema::from_meta("7 t a:int32 b:double").unwrap();
        assert!(a.layout_eq(&b));

        let c = Schema::from_meta("1 t a:int32 b:string").unwrap();
        assert!(!a.layout_eq(&c));
        assert_eq!(a.first_mismatch(&c), Some(2));
    }

    #[test]
    fn schema0_shape() {
        let s = Schema::metadata();
        assert_eq!(
            s.to_meta(),
            "0 _experiment_metadata subject:string key:string value:string"
        );
    }
}
