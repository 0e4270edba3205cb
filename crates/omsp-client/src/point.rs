//! Measurement points and their attached streams.
//!
//! An MP is an immutable tuple schema plus the list of streams derived
//! from it.  Injection takes the MP's lock, feeds every stream's filter
//! chain, and fires threshold-mode streams inline; periodic streams fire
//! from their own timer thread, which takes the same lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use omsp_protocol::{FieldDef, Schema, Value};

use crate::filter::BoundFilter;
use crate::writer::Writer;

/// Handle to a declared measurement point.
pub type Mp = Arc<MeasurePoint>;

pub struct MeasurePoint {
    name: String,
    fields: Vec<FieldDef>,
    active: AtomicBool,
    state: Mutex<MpState>,
}

pub(crate) struct MpState {
    pub streams: Vec<Stream>,
}

impl MeasurePoint {
    pub(crate) fn new(name: String, fields: Vec<FieldDef>) -> MeasurePoint {
        MeasurePoint {
            name,
            fields,
            active: AtomicBool::new(true),
            state: Mutex::new(MpState {
                streams: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, MpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Position of a field by name, for metadata subjects.
    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// One processing pipeline attached to an MP.
pub(crate) struct Stream {
    pub index: u32,
    pub table: String,
    pub seq: u64,
    pub sample_count: u32,
    /// Fire after this many injections (threshold mode)…
    pub threshold: Option<u32>,
    /// …or every this many seconds (periodic mode).  Exactly one is set.
    pub interval: Option<f64>,
    pub filters: Vec<BoundFilter>,
    pub writer: Arc<dyn Writer>,
}

impl Stream {
    /// The wire schema of this stream's output.
    pub fn schema(&self) -> Schema {
        let mut fields = Vec::new();
        for bf in &self.filters {
            for (name, kind) in bf.columns() {
                fields.push(FieldDef { name, kind });
            }
        }
        Schema {
            index: self.index,
            name: self.table.clone(),
            fields,
        }
    }

    /// Feed one injected tuple into the filter chain.
    pub fn input(&mut self, values: &[Value]) {
        for bf in &mut self.filters {
            if !bf.filter.input(&values[bf.field_index]) {
                tracing::warn!(
                    stream = %self.table,
                    field = %bf.prefix,
                    "filter rejected sample"
                );
            }
        }
    }

    /// Emit one output row and open a new window.
    pub fn emit(&mut self, now: f64) {
        self.seq += 1;
        let (index, seq) = (self.index, self.seq);
        let filters = &mut self.filters;
        let ok = self.writer.write_row(index, seq, now, &mut |sink| {
            let mut all = true;
            for bf in filters.iter_mut() {
                all &= bf.filter.output(sink);
            }
            all
        });
        if !ok {
            tracing::debug!(stream = %self.table, "row not written");
        }
        for bf in &mut self.filters {
            bf.filter.new_window();
        }
        self.sample_count = 0;
    }

    /// Count one injection; fire if the sample threshold is reached.
    pub fn process(&mut self, now: f64) {
        if let Some(threshold) = self.threshold {
            self.sample_count += 1;
            if self.sample_count >= threshold {
                self.emit(now);
            }
        }
        // Periodic streams fire from their timer thread.
    }
}

/// Spawn the timer thread of a periodic stream.
///
/// The thread sleeps the interval, takes the MP lock, runs the emit path,
/// and exits once the MP is deactivated.
pub(crate) fn spawn_timer(mp: Mp, stream_index: u32, interval: f64, time_base: f64) {
    let builder = thread::Builder::new().name(format!("omsp-ms-{stream_index}"));
    let spawned = builder.spawn(move || {
        loop {
            thread::sleep(Duration::from_secs_f64(interval));
            if !mp.is_active() {
                return;
            }
            let now = crate::unix_now() - time_base;
            let mut st = mp.lock_state();
            if let Some(stream) = st.streams.iter_mut().find(|s| s.index == stream_index) {
                stream.emit(now);
            } else {
                return;
            }
        }
    });
    if let Err(e) = spawned {
        tracing::error!(stream_index, error = %e, "cannot spawn stream timer thread");
    }
}
