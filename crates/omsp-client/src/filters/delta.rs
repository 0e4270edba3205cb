//! Change of a value across windows: emits the delta since the previous
//! window's last sample, and the current value.

use omsp_protocol::{Value, ValueKind};

use crate::filter::{Filter, FilterError, OutputDef};
use crate::writer::RowSink;

const OUTPUTS: [OutputDef; 2] = [
    OutputDef {
        suffix: Some("delta"),
        kind: ValueKind::Double,
    },
    OutputDef {
        suffix: Some("last"),
        kind: ValueKind::Double,
    },
];

pub fn create(input: ValueKind) -> Result<Box<dyn Filter>, FilterError> {
    super::require_numeric("delta", input)?;
    Ok(Box::new(DeltaFilter {
        previous: 0.0,
        current: 0.0,
        seen: false,
    }))
}

struct DeltaFilter {
    /// Last value of the previous window.
    previous: f64,
    current: f64,
    seen: bool,
}

impl Filter for DeltaFilter {
    fn kind_name(&self) -> &'static str {
        "delta"
    }

    fn input(&mut self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        self.current = v;
        self.seen = true;
        true
    }

    fn output(&mut self, sink: &mut dyn RowSink) -> bool {
        sink.emit_cols(&[
            Value::Double(self.current - self.previous),
            Value::Double(self.current),
        ])
    }

    fn new_window(&mut self) {
        self.previous = self.current;
        self.seen = false;
    }

    fn outputs(&self) -> &[OutputDef] {
        &OUTPUTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::tests::CaptureSink;

    #[test]
    fn deltas_across_windows() {
        let mut f = create(ValueKind::Double).unwrap();
        f.input(&Value::Double(10.0));
        let mut sink = CaptureSink::default();
        f.output(&mut sink);
        assert_eq!(
            sink.values,
            vec![Value::Double(10.0), Value::Double(10.0)]
        );
        f.new_window();

        f.input(&Value::Double(25.0));
        let mut sink = CaptureSink::default();
        f.output(&mut sink);
        assert_eq!(
            sink.values,
            vec![Value::Double(15.0), Value::Double(25.0)]
        );
    }
}
