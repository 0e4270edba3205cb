//! Sample standard deviation and variance over a window, computed with
//! Welford's recurrence.

use omsp_protocol::{Value, ValueKind};

use crate::filter::{Filter, FilterError, OutputDef};
use crate::writer::RowSink;

const OUTPUTS: [OutputDef; 2] = [
    OutputDef {
        suffix: Some("stddev"),
        kind: ValueKind::Double,
    },
    OutputDef {
        suffix: Some("variance"),
        kind: ValueKind::Double,
    },
];

pub fn create(input: ValueKind) -> Result<Box<dyn Filter>, FilterError> {
    super::require_numeric("stddev", input)?;
    Ok(Box::new(StddevFilter {
        m: 0.0,
        s: 0.0,
        count: 0,
    }))
}

struct StddevFilter {
    m: f64,
    s: f64,
    count: u64,
}

impl Filter for StddevFilter {
    fn kind_name(&self) -> &'static str {
        "stddev"
    }

    fn input(&mut self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        self.count += 1;
        if self.count == 1 {
            self.m = v;
            self.s = 0.0;
        } else {
            let new_m = self.m + (v - self.m) / self.count as f64;
            self.s += (v - self.m) * (v - new_m);
            self.m = new_m;
        }
        true
    }

    fn output(&mut self, sink: &mut dyn RowSink) -> bool {
        let variance = if self.count > 1 {
            self.s / (self.count - 1) as f64
        } else {
            0.0
        };
        sink.emit_cols(&[Value::Double(variance.sqrt()), Value::Double(variance)])
    }

    fn new_window(&mut self) {
        self.m = 0.0;
        self.s = 0.0;
        self.count = 0;
    }

    fn outputs(&self) -> &[OutputDef] {
        &OUTPUTS
    }
}
