//! Writers serialise rows into a [`BufferedWriter`] using one of the two
//! OMSP framings.
//!
//! A row is produced in three steps: the row prefix (timestamp, stream
//! index, sequence number), any number of `emit_cols` calls from the
//! stream's filters, and the row finaliser.  The whole row happens under
//! the writer chunk's lock, so rows from concurrent streams never
//! interleave on the wire.  Rows on stream 0 are additionally recorded in
//! the header meta buffer for replay after a reconnection.

use std::sync::atomic::{AtomicBool, Ordering};

use omsp_protocol::binary::{BinEncoder, BinMsgType};
use omsp_protocol::{ContentMode, Value, text};

use crate::buffer::{BufferedWriter, RowResult};
use crate::stream::OutStream;

/// Receives the output tuples of filters while a row is being written.
pub trait RowSink {
    /// Append the given values as columns of the current row.
    fn emit_cols(&mut self, values: &[Value]) -> bool;
}

/// One encoding of the sample stream, bound to a buffered queue.
pub trait Writer: Send + Sync {
    /// Append one header line (without terminating newline).
    fn meta(&self, line: &str) -> bool;

    /// Finish the header block: the `content:` line and the separator.
    fn header_done(&self) -> bool;

    /// Serialise one row.  `emit` is invoked with the row sink once the
    /// prefix is in place; it runs the stream's filter chain.
    fn write_row(
        &self,
        index: u32,
        seq: u64,
        ts: f64,
        emit: &mut dyn FnMut(&mut dyn RowSink) -> bool,
    ) -> bool;

    /// Messages dropped under backpressure since the last call.
    fn nlost_reset(&self) -> u64;

    /// Drain and shut down.  Blocks until the queue empties or gives up.
    fn close(&self);
}

/// Build the writer for an encoding over an output stream.
pub fn create_writer(
    out: Box<dyn OutStream>,
    encoding: ContentMode,
    queue_capacity: usize,
) -> Box<dyn Writer> {
    match encoding {
        ContentMode::Text => Box::new(TextWriter {
            bw: BufferedWriter::create(out, queue_capacity, 0),
        }),
        ContentMode::Binary => Box::new(BinWriter {
            bw: BufferedWriter::create(out, queue_capacity, 0),
            long: AtomicBool::new(false),
        }),
    }
}

// ---------------------------------------------------------------------------
// Text writer
// ---------------------------------------------------------------------------

struct TextWriter {
    bw: BufferedWriter,
}

struct TextSink<'a> {
    buf: &'a mut Vec<u8>,
}

impl RowSink for TextSink<'_> {
    fn emit_cols(&mut self, values: &[Value]) -> bool {
        for v in values {
            text::push_field(self.buf, v);
        }
        true
    }
}

impl Writer for TextWriter {
    fn meta(&self, line: &str) -> bool {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.bw.push_meta(&data)
    }

    fn header_done(&self) -> bool {
        self.meta("content: text") && self.meta("")
    }

    fn write_row(
        &self,
        index: u32,
        seq: u64,
        ts: f64,
        emit: &mut dyn FnMut(&mut dyn RowSink) -> bool,
    ) -> bool {
        self.bw.write_row(|buf| {
            text::push_row_start(buf, ts, index, seq);
            let ok = emit(&mut TextSink { buf: &mut *buf });
            if !ok {
                return RowResult::Rollback;
            }
            text::push_row_end(buf);
            if index == 0 {
                RowResult::CommitMeta
            } else {
                RowResult::Commit
            }
        })
    }

    fn nlost_reset(&self) -> u64 {
        self.bw.nlost_reset()
    }

    fn close(&self) {
        self.bw.close();
    }
}

// ---------------------------------------------------------------------------
// Binary writer
// ---------------------------------------------------------------------------

struct BinWriter {
    bw: BufferedWriter,
    /// Once a row outgrows the short frame, every following row is
    /// emitted as a long frame.  Never downgrades within a session.
    long: AtomicBool,
}

struct BinSink<'a, 'b> {
    enc: &'a mut BinEncoder<'b>,
}

impl RowSink for BinSink<'_, '_> {
    fn emit_cols(&mut self, values: &[Value]) -> bool {
        for v in values {
            self.enc.push_value(v);
        }
        true
    }
}

impl Writer for BinWriter {
    fn meta(&self, line: &str) -> bool {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.bw.push_meta(&data)
    }

    fn header_done(&self) -> bool {
        self.meta("content: binary") && self.meta("")
    }

    fn write_row(
        &self,
        index: u32,
        seq: u64,
        ts: f64,
        emit: &mut dyn FnMut(&mut dyn RowSink) -> bool,
    ) -> bool {
        let msgtype = if self.long.load(Ordering::Relaxed) {
            BinMsgType::LData
        } else {
            BinMsgType::Data
        };
        self.bw.write_row(|buf| {
            let mut enc = BinEncoder::begin(buf, msgtype, index, seq, ts);
            let ok = emit(&mut BinSink { enc: &mut enc });
            let final_type = enc.finish();
            if !ok {
                return RowResult::Rollback;
            }
            if final_type == BinMsgType::LData {
                self.long.store(true, Ordering::Relaxed);
            }
            if index == 0 {
                RowResult::CommitMeta
            } else {
                RowResult::Commit
            }
        })
    }

    fn nlost_reset(&self) -> u64 {
        self.bw.nlost_reset()
    }

    fn close(&self) {
        self.bw.close();
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::OutStream;
    use std::sync::{Arc, Mutex};

    /// Sink collecting emitted values, for filter unit tests.
    #[derive(Default)]
    pub struct CaptureSink {
        pub values: Vec<Value>,
    }

    impl RowSink for CaptureSink {
        fn emit_cols(&mut self, values: &[Value]) -> bool {
            self.values.extend_from_slice(values);
            true
        }
    }

    struct VecStream {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl OutStream for VecStream {
        fn dest(&self) -> &str {
            "mock:"
        }

        fn write(&self, data: &[u8], header: &[u8]) -> usize {
            let mut sink = self.data.lock().unwrap();
            if sink.is_empty() {
                sink.extend_from_slice(header);
            }
            sink.extend_from_slice(data);
            data.len()
        }

        fn close(&self) {}
    }

    fn text_writer() -> (Box<dyn Writer>, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let w = create_writer(
            Box::new(VecStream {
                data: Arc::clone(&data),
            }),
            ContentMode::Text,
            4096,
        );
        (w, data)
    }

    #[test]
    fn text_rows_are_lines() {
        let (w, data) = text_writer();
        assert!(w.write_row(1, 1, 0.25, &mut |sink| {
            sink.emit_cols(&[Value::Int32(1), Value::String("a\tb".to_owned())])
        }));
        w.close();
        let out = String::from_utf8(data.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "0.250000\t1\t1\t1\ta\\tb\n");
    }

    #[test]
    fn header_block_ends_with_separator() {
        let (w, data) = text_writer();
        w.meta("protocol: 4");
        w.meta("domain: d1");
        assert!(w.header_done());
        w.write_row(1, 1, 0.0, &mut |sink| sink.emit_cols(&[Value::Int32(5)]));
        w.close();
        let out = String::from_utf8(data.lock().unwrap().clone()).unwrap();
        assert!(out.starts_with("protocol: 4\ndomain: d1\ncontent: text\n\n"));
    }

    #[test]
    fn binary_writer_upgrades_monotonically() {
        let data = Arc::new(Mutex::new(Vec::new()));
        let w = create_writer(
            Box::new(VecStream {
                data: Arc::clone(&data),
            }),
            ContentMode::Binary,
            8192,
        );
        // Small row: short frame.
        w.write_row(1, 1, 0.0, &mut |sink| sink.emit_cols(&[Value::Int32(1)]));
        // Oversized row forces the long format.
        w.write_row(1, 2, 0.0, &mut |sink| {
            sink.emit_cols(&[Value::Blob(vec![0u8; 400])])
        });
        // Small rows stay long from now on.
        w.write_row(1, 3, 0.0, &mut |sink| sink.emit_cols(&[Value::Int32(1)]));
        w.close();

        let mut mbuf = bytes::BytesMut::from(&data.lock().unwrap()[..]);
        let f1 = omsp_protocol::binary::decode_frame(&mut mbuf).unwrap().unwrap();
        let f2 = omsp_protocol::binary::decode_frame(&mut mbuf).unwrap().unwrap();
        let f3 = omsp_protocol::binary::decode_frame(&mut mbuf).unwrap().unwrap();
        assert_eq!(f1.msgtype, BinMsgType::Data);
        assert_eq!(f2.msgtype, BinMsgType::LData);
        assert_eq!(f3.msgtype, BinMsgType::LData);
        assert_eq!(f3.seq, 3);
    }

    #[test]
    fn schema0_rows_reach_the_meta_buffer() {
        let (w, data) = text_writer();
        w.meta("protocol: 4");
        w.header_done();
        w.write_row(0, 1, 0.0, &mut |sink| {
            sink.emit_cols(&[
                Value::String(".".to_owned()),
                Value::String("schema".to_owned()),
                Value::String("2 app_m2 y:uint64".to_owned()),
            ])
        });
        w.close();
        let out = String::from_utf8(data.lock().unwrap().clone()).unwrap();
        // The stream connects after the row was written, so the header
        // block it sends first already contains the meta copy of the row;
        // the row itself follows as data.  Receivers treat the second
        // schema declaration as a replacement.
        assert_eq!(out.matches("2 app_m2 y:uint64").count(), 2);
    }
}
