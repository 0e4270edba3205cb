//! The filter contract and the name-keyed filter registry.
//!
//! A filter consumes one field of a measurement point and produces a
//! fixed-width output tuple when its stream fires.  Filters attached to
//! the same stream run in declaration order; the stream owns them and
//! allocates nothing on their behalf beyond the output column naming.

use omsp_protocol::{Value, ValueKind};
use std::collections::BTreeMap;

use crate::writer::RowSink;

/// One output column of a filter: an optional suffix (appended to the
/// source field name with an underscore; `None` keeps the bare field
/// name) and the column kind.
#[derive(Debug, Clone, Copy)]
pub struct OutputDef {
    pub suffix: Option<&'static str>,
    pub kind: ValueKind,
}

/// A sample processor owning private window state.
pub trait Filter: Send {
    /// Registry name of this filter kind (`"avg"`, `"first"`, …).
    fn kind_name(&self) -> &'static str;

    /// Feed one sample of the attached field into the current window.
    fn input(&mut self, value: &Value) -> bool;

    /// Emit the output tuple for the current window into the row being
    /// written.  Called at most once per window.
    fn output(&mut self, sink: &mut dyn RowSink) -> bool;

    /// Reset window accumulators.  Called after every `output`.
    fn new_window(&mut self);

    /// Output column shapes, in emission order.
    fn outputs(&self) -> &[OutputDef];

    /// Adjust a filter parameter.  Unknown parameters are refused.
    fn set_param(&mut self, _name: &str, _value: &Value) -> bool {
        false
    }
}

/// A filter bound to one field of its measurement point.
pub struct BoundFilter {
    pub filter: Box<dyn Filter>,
    /// Index of the consumed field in the MP's tuple.
    pub field_index: usize,
    /// Field name; prefixes the output column names.
    pub prefix: String,
}

impl BoundFilter {
    /// Schema columns contributed by this filter.
    pub fn columns(&self) -> Vec<(String, ValueKind)> {
        self.filter
            .outputs()
            .iter()
            .map(|o| {
                let name = match o.suffix {
                    Some(sfx) => format!("{}_{}", self.prefix, sfx),
                    None => self.prefix.clone(),
                };
                (name, o.kind)
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter '{0}'")]
    Unknown(String),
    #[error("filter '{filter}' cannot process {kind} input")]
    BadInputKind { filter: &'static str, kind: ValueKind },
}

type FilterCtor = fn(ValueKind) -> Result<Box<dyn Filter>, FilterError>;

/// Registry mapping filter names to constructors.
///
/// All filters are linked in; the registry is populated with the
/// built-ins at client initialisation and never mutated afterwards.
pub struct FilterRegistry {
    ctors: BTreeMap<&'static str, FilterCtor>,
}

impl FilterRegistry {
    pub fn with_builtins() -> FilterRegistry {
        let mut reg = FilterRegistry {
            ctors: BTreeMap::new(),
        };
        reg.register("avg", crate::filters::avg::create);
        reg.register("delta", crate::filters::delta::create);
        reg.register("first", crate::filters::first::create);
        reg.register("last", crate::filters::last::create);
        reg.register("stddev", crate::filters::stddev::create);
        reg.register("sum", crate::filters::sum::create);
        reg
    }

    pub fn register(&mut self, name: &'static str, ctor: FilterCtor) {
        self.ctors.insert(name, ctor);
    }

    pub fn create(&self, name: &str, input: ValueKind) -> Result<Box<dyn Filter>, FilterError> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| FilterError::Unknown(name.to_owned()))?;
        ctor(input)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ctors.keys().copied()
    }

    /// The default policy: `avg` for numeric fields of an aggregating
    /// stream, `first` for everything else.
    pub fn create_default(
        &self,
        input: ValueKind,
        multiple_samples: bool,
    ) -> Result<Box<dyn Filter>, FilterError> {
        if multiple_samples && input.is_numeric() {
            self.create("avg", input)
        } else {
            self.create("first", input)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let reg = FilterRegistry::with_builtins();
        let names: Vec<&str> = reg.names().collect();
        assert_eq!(names, vec!["avg", "delta", "first", "last", "stddev", "sum"]);
    }

    #[test]
    fn unknown_filter_is_refused() {
        let reg = FilterRegistry::with_builtins();
        assert!(matches!(
            reg.create("median", ValueKind::Double),
            Err(FilterError::Unknown(_))
        ));
    }

    #[test]
    fn numeric_filters_refuse_strings() {
        let reg = FilterRegistry::with_builtins();
        for name in ["avg", "sum", "delta", "stddev"] {
            assert!(
                matches!(
                    reg.create(name, ValueKind::String),
                    Err(FilterError::BadInputKind { .. })
                ),
                "filter {name} accepted a string input"
            );
        }
    }

    #[test]
    fn default_policy_picks_avg_or_first() {
        let reg = FilterRegistry::with_builtins();
        assert_eq!(
            reg.create_default(ValueKind::Double, true).unwrap().kind_name(),
            "avg"
        );
        assert_eq!(
            reg.create_default(ValueKind::Double, false).unwrap().kind_name(),
            "first"
        );
        assert_eq!(
            reg.create_default(ValueKind::String, true).unwrap().kind_name(),
            "first"
        );
        assert_eq!(
            reg.create_default(ValueKind::Blob, true).unwrap().kind_name(),
            "first"
        );
    }

    #[test]
    fn bound_filter_column_naming() {
        let reg = FilterRegistry::with_builtins();
        let avg = BoundFilter {
            filter: reg.create("avg", ValueKind::Double).unwrap(),
            field_index: 0,
            prefix: "x".to_owned(),
        };
        let cols = avg.columns();
        assert_eq!(
            cols,
            vec![
                ("x_avg".to_owned(), ValueKind::Double),
                ("x_min".to_owned(), ValueKind::Double),
                ("x_max".to_owned(), ValueKind::Double),
            ]
        );

        let first = BoundFilter {
            filter: reg.create("first", ValueKind::UInt64).unwrap(),
            field_index: 0,
            prefix: "y".to_owned(),
        };
        assert_eq!(first.columns(), vec![("y".to_owned(), ValueKind::UInt64)]);
    }
}
