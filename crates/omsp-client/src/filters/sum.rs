//! Sum of all samples in a window.

use omsp_protocol::{Value, ValueKind};

use crate::filter::{Filter, FilterError, OutputDef};
use crate::writer::RowSink;

const OUTPUTS: [OutputDef; 1] = [OutputDef {
    suffix: Some("sum"),
    kind: ValueKind::Double,
}];

pub fn create(input: ValueKind) -> Result<Box<dyn Filter>, FilterError> {
    super::require_numeric("sum", input)?;
    Ok(Box::new(SumFilter { sum: 0.0 }))
}

struct SumFilter {
    sum: f64,
}

impl Filter for SumFilter {
    fn kind_name(&self) -> &'static str {
        "sum"
    }

    fn input(&mut self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        self.sum += v;
        true
    }

    fn output(&mut self, sink: &mut dyn RowSink) -> bool {
        sink.emit_cols(&[Value::Double(self.sum)])
    }

    fn new_window(&mut self) {
        self.sum = 0.0;
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
    fn sums_a_window() {
        let mut f = create(ValueKind::Int32).unwrap();
        for i in 1..=4 {
            f.input(&Value::Int32(i));
        }
        let mut sink = CaptureSink::default();
        f.output(&mut sink);
        assert_eq!(sink.values, vec![Value::Double(10.0)]);

        f.new_window();
        let mut sink = CaptureSink::default();
        f.output(&mut sink);
        assert_eq!(sink.values, vec![Value::Double(0.0)]);
    }
}
