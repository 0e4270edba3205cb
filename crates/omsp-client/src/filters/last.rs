//! Keep the most recent sample of each window.

use omsp_protocol::{Value, ValueKind};

use crate::filter::{Filter, FilterError, OutputDef};
use crate::writer::RowSink;

pub fn create(input: ValueKind) -> Result<Box<dyn Filter>, FilterError> {
    Ok(Box::new(LastFilter {
        outputs: [OutputDef {
            suffix: None,
            kind: input,
        }],
        kind: input,
        held: None,
    }))
}

struct LastFilter {
    outputs: [OutputDef; 1],
    kind: ValueKind,
    held: Option<Value>,
}

impl Filter for LastFilter {
    fn kind_name(&self) -> &'static str {
        "last"
    }

    fn input(&mut self, value: &Value) -> bool {
        if value.kind() != self.kind {
            return false;
        }
        self.held = Some(value.clone());
        true
    }

    fn output(&mut self, sink: &mut dyn RowSink) -> bool {
        let v = self
            .held
            .clone()
            .unwrap_or_else(|| Value::default_of(self.kind));
        sink.emit_cols(std::slice::from_ref(&v))
    }

    fn new_window(&mut self) {
        self.held = None;
    }

    fn outputs(&self) -> &[OutputDef] {
        &self.outputs
    }
}
