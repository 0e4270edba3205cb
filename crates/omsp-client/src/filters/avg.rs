//! Windowed average, with the window's minimum and maximum.

use omsp_protocol::{Value, ValueKind};

use crate::filter::{Filter, FilterError, OutputDef};
use crate::writer::RowSink;

const OUTPUTS: [OutputDef; 3] = [
    OutputDef {
        suffix: Some("avg"),
        kind: ValueKind::Double,
    },
    OutputDef {
        suffix: Some("min"),
        kind: ValueKind::Double,
    },
    OutputDef {
        suffix: Some("max"),
        kind: ValueKind::Double,
    },
];

pub fn create(input: ValueKind) -> Result<Box<dyn Filter>, FilterError> {
    super::require_numeric("avg", input)?;
    Ok(Box::new(AvgFilter {
        sum: 0.0,
        count: 0,
        min: f64::NAN,
        max: f64::NAN,
    }))
}

struct AvgFilter {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl Filter for AvgFilter {
    fn kind_name(&self) -> &'static str {
        "avg"
    }

    fn input(&mut self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        self.sum += v;
        self.count += 1;
        if v < self.min || self.min.is_nan() {
            self.min = v;
        }
        if v > self.max || self.max.is_nan() {
            self.max = v;
        }
        true
    }

    fn output(&mut self, sink: &mut dyn RowSink) -> bool {
        let avg = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            f64::NAN
        };
        sink.emit_cols(&[
            Value::Double(avg),
            Value::Double(self.min),
            Value::Double(self.max),
        ])
    }

    fn new_window(&mut self) {
        self.sum = 0.0;
        self.count = 0;
        self.min = f64::NAN;
        self.max = f64::NAN;
    }

    fn outputs(&self) -> &[OutputDef] {
        &OUTPUTS
    }
}
