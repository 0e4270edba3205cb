//! A non-blocking, bounded, self-draining FIFO queue between sample
//! producers and the output stream.
//!
//! Data accumulates in a ring of fixed-target-size chunks.  Producers
//! append rows into the current writer chunk; a dedicated drain thread
//! walks the ring and pushes chunk contents into the [`OutStream`],
//! double-buffering through a read slot so producers are never blocked on
//! network I/O.  When the ring wraps onto unread data and the allocation
//! budget is exhausted, the oldest chunk is overwritten and its message
//! count is added to the lost counter.
//!
//! # Locking
//! The ring mutex protects the cursors and chain topology; each chunk's
//! mutex protects its bytes and message count.  The ring mutex is always
//! taken before any chunk mutex, never the other way around.  The drain
//! semaphore (`ctl` + condvar) and the header meta buffer have their own
//! locks and are leaf-level.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::stream::OutStream;

/// Default target size of each chunk in the ring.
pub const DEF_CHUNK_SIZE: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned chunk still holds valid bytes; keep draining.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Chunks and the ring
// ---------------------------------------------------------------------------

struct ChunkBuf {
    data: Vec<u8>,
    /// Start offset of the in-progress message; everything before it is
    /// committed and may be drained.
    msg_start: usize,
    nmessages: u64,
}

struct Chunk {
    buf: Mutex<ChunkBuf>,
}

impl Chunk {
    fn new(target: usize) -> Chunk {
        Chunk {
            buf: Mutex::new(ChunkBuf {
                data: Vec::with_capacity(target / 8),
                msg_start: 0,
                nmessages: 0,
            }),
        }
    }
}

struct Ring {
    chunks: Vec<Arc<Chunk>>,
    writer: usize,
    reader: usize,
    /// Chunks that may still be allocated before the drop policy kicks in.
    unallocated: usize,
    nlost: u64,
}

struct Ctl {
    signals: u32,
    active: bool,
}

struct Shared {
    dest: String,
    chunk_size: usize,
    ring: Mutex<Ring>,
    ctl: Mutex<Ctl>,
    cond: Condvar,
    meta: Mutex<Vec<u8>>,
    /// Double-buffer slot the drain thread sends from; swapped with a
    /// chunk's buffer under both locks.
    slot: Mutex<ReadSlot>,
    out: Box<dyn OutStream>,
}

/// Outcome of one row written through [`BufferedWriter::write_row`].
pub enum RowResult {
    /// Commit the appended bytes as one message.
    Commit,
    /// Commit, and additionally record the message in the header meta
    /// buffer for replay after a reconnection (schema-0 rows).
    CommitMeta,
    /// Discard the appended bytes.
    Rollback,
}

enum ChunkStatus {
    Sent,
    BackingOff,
}

struct BackoffState {
    last_failure: Option<Instant>,
    secs: u8,
}

struct ReadSlot {
    data: Vec<u8>,
    rd: usize,
}

// ---------------------------------------------------------------------------
// BufferedWriter
// ---------------------------------------------------------------------------

/// The buffered, self-draining writer; one per [`crate::writer::Writer`].
pub struct BufferedWriter {
    shared: Arc<Shared>,
    drain: Mutex<Option<thread::JoinHandle<bool>>>,
}

impl BufferedWriter {
    /// Create the queue and start its drain thread.
    ///
    /// `queue_capacity` is the total ring budget in bytes; it is carved
    /// into chunks of `chunk_size` (0 selects the default), with a floor
    /// of two chunks.
    pub fn create(out: Box<dyn OutStream>, queue_capacity: usize, chunk_size: usize) -> BufferedWriter {
        let chunk_size = if chunk_size > 0 { chunk_size } else { DEF_CHUNK_SIZE };
        let nchunks = (queue_capacity / chunk_size).max(2);
        let dest = out.dest().to_owned();
        tracing::debug!(
            dest = %dest,
            bytes = nchunks * chunk_size,
            chunks = nchunks,
            chunk_size,
            "buffered queue sized"
        );

        let shared = Arc::new(Shared {
            dest,
            chunk_size,
            ring: Mutex::new(Ring {
                chunks: vec![Arc::new(Chunk::new(chunk_size))],
                writer: 0,
                reader: 0,
                unallocated: nchunks - 1,
                nlost: 0,
            }),
            ctl: Mutex::new(Ctl {
                signals: 0,
                active: true,
            }),
            cond: Condvar::new(),
            meta: Mutex::new(Vec::new()),
            slot: Mutex::new(ReadSlot {
                data: Vec::new(),
                rd: 0,
            }),
            out,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("omsp-drain".to_owned())
            .spawn(move || drain_loop(&thread_shared))
            .ok();

        BufferedWriter {
            shared,
            drain: Mutex::new(handle),
        }
    }

    /// Append one message under the writer chunk's lock.
    ///
    /// The closure receives the chunk's byte buffer positioned at the end
    /// of the committed region and appends the encoded row; the message is
    /// committed, recorded as header metadata, or rolled back according to
    /// the returned [`RowResult`].  Returns false once the queue is
    /// closed.
    pub fn write_row(&self, f: impl FnOnce(&mut Vec<u8>) -> RowResult) -> bool {
        if !lock(&self.shared.ctl).active {
            return false;
        }

        // Find (or advance to) a writer chunk with room for a new message.
        let chunk = loop {
            let chunk = {
                let ring = lock(&self.shared.ring);
                Arc::clone(&ring.chunks[ring.writer])
            };
            let full = lock(&chunk.buf).data.len() >= self.shared.chunk_size;
            if !full {
                break chunk;
            }
            self.advance_writer(&chunk);
        };

        let mut meta_copy = None;
        {
            let mut guard = lock(&chunk.buf);
            let start = guard.msg_start;
            match f(&mut guard.data) {
                RowResult::Commit => {
                    guard.msg_start = guard.data.len();
                    guard.nmessages += 1;
                }
                RowResult::CommitMeta => {
                    meta_copy = Some(guard.data[start..].to_vec());
                    guard.msg_start = guard.data.len();
                    guard.nmessages += 1;
                }
                RowResult::Rollback => {
                    guard.data.truncate(start);
                    return false;
                }
            }
        }
        if let Some(bytes) = meta_copy {
            self.push_meta(&bytes);
        }
        self.signal();
        true
    }

    /// Append raw bytes to the header meta buffer.
    ///
    /// Meta writes never signal the drain semaphore; the stream replays
    /// the buffer on its own when it reconnects.
    pub fn push_meta(&self, data: &[u8]) -> bool {
        if !lock(&self.shared.ctl).active {
            return false;
        }
        lock(&self.shared.meta).extend_from_slice(data);
        true
    }

    /// Return and reset the count of messages dropped under backpressure.
    pub fn nlost_reset(&self) -> u64 {
        let mut ring = lock(&self.shared.ring);
        std::mem::take(&mut ring.nlost)
    }

    /// Shut down: stop the drain thread, flush what remains, close the
    /// stream.  Blocks until the drain thread exits.
    pub fn close(&self) {
        {
            let mut ctl = lock(&self.shared.ctl);
            if !ctl.active {
                return;
            }
            ctl.active = false;
            ctl.signals += 1;
        }
        self.shared.cond.notify_one();
        tracing::info!(dest = %self.shared.dest, "waiting for buffered queue to drain");

        let handle = lock(&self.drain).take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(true) => tracing::debug!(dest = %self.shared.dest, "buffered queue fully drained"),
                Ok(false) => {
                    tracing::error!(dest = %self.shared.dest, "buffered queue did not fully drain");
                }
                Err(_) => tracing::warn!(dest = %self.shared.dest, "drain thread panicked"),
            }
        }
        self.shared.out.close();
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Move the writer cursor to the next usable chunk.
    ///
    /// If the next chunk is the next to be read, either grow the ring (if
    /// the budget allows) or overwrite it, advancing the read cursor past
    /// it and accounting the unread messages as lost.  Any in-progress
    /// message tail is moved whole into the new chunk so messages never
    /// straddle chunk boundaries.
    fn advance_writer(&self, current: &Arc<Chunk>) {
        let mut ring = lock(&self.shared.ring);
        if !Arc::ptr_eq(&ring.chunks[ring.writer], current) {
            // Another producer advanced while we were waiting.
            return;
        }

        let len = ring.chunks.len();
        let mut next = (ring.writer + 1) % len;
        if next == ring.reader {
            if ring.unallocated > 0 {
                ring.unallocated -= 1;
                let pos = ring.writer + 1;
                ring.chunks.insert(pos, Arc::new(Chunk::new(self.shared.chunk_size)));
                if ring.reader >= pos {
                    ring.reader += 1;
                }
                next = pos;
                tracing::debug!(
                    dest = %self.shared.dest,
                    remaining = ring.unallocated,
                    "allocated chunk"
                );
            } else {
                ring.reader = (next + 1) % len;
            }
        }
        ring.writer = next;

        let new_chunk = Arc::clone(&ring.chunks[next]);
        let mut nb = lock(&new_chunk.buf);
        let stale = std::mem::take(&mut nb.nmessages);
        if stale > 0 {
            ring.nlost += stale;
            tracing::warn!(
                dest = %self.shared.dest,
                dropped = stale,
                bytes = nb.data.len(),
                "dropping unsent samples"
            );
        }
        nb.data.clear();
        nb.msg_start = 0;

        let mut ob = lock(&current.buf);
        if ob.data.len() > ob.msg_start {
            let msg_start = ob.msg_start;
            let tail = ob.data.split_off(msg_start);
            nb.data.extend_from_slice(&tail);
        }
    }

    fn signal(&self) {
        lock(&self.shared.ctl).signals += 1;
        self.shared.cond.notify_one();
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

fn drain_loop(shared: &Shared) -> bool {
    // Starting in nominal backoff forces a "connected" message on the
    // first successful send.
    let mut backoff = BackoffState {
        last_failure: None,
        secs: 1,
    };

    loop {
        {
            let mut ctl = lock(&shared.ctl);
            while ctl.signals == 0 && ctl.active {
                ctl = shared
                    .cond
                    .wait(ctl)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if !ctl.active {
                break;
            }
            ctl.signals = 0;
        }
        walk(shared, &mut backoff);
    }

    // Shutdown: drain whatever remains.  Backoff periods are not honoured
    // here; a failing stream forfeits the remainder instead of stalling
    // the close path.
    backoff.last_failure = None;
    loop {
        let (chunk, at_writer) = {
            let ring = lock(&shared.ring);
            (
                Arc::clone(&ring.chunks[ring.reader]),
                ring.reader == ring.writer,
            )
        };
        match process_chunk(shared, &chunk, &mut backoff) {
            ChunkStatus::BackingOff => return false,
            ChunkStatus::Sent => {
                if at_writer {
                    return true;
                }
                advance_reader(shared, &chunk);
            }
        }
    }
}

fn walk(shared: &Shared, backoff: &mut BackoffState) {
    loop {
        let (chunk, at_writer) = {
            let ring = lock(&shared.ring);
            (
                Arc::clone(&ring.chunks[ring.reader]),
                ring.reader == ring.writer,
            )
        };
        match process_chunk(shared, &chunk, backoff) {
            ChunkStatus::BackingOff => return,
            ChunkStatus::Sent => {
                if at_writer {
                    return;
                }
                advance_reader(shared, &chunk);
            }
        }
    }
}

fn advance_reader(shared: &Shared, drained: &Arc<Chunk>) {
    let mut ring = lock(&shared.ring);
    if !Arc::ptr_eq(&ring.chunks[ring.reader], drained) {
        // The writer wrapped onto this chunk and already moved the read
        // cursor past it.
        return;
    }
    if ring.reader != ring.writer {
        ring.reader = (ring.reader + 1) % ring.chunks.len();
    }
}

/// Send the contents of one chunk through the stream.
///
/// The chunk lock is held only long enough to swap its buffer into the
/// read slot; the network write happens unlocked.  The meta buffer lock
/// is held across the stream write because the stream reads it to replay
/// headers when it detects a reconnection.
fn process_chunk(shared: &Shared, chunk: &Arc<Chunk>, backoff: &mut BackoffState) -> ChunkStatus {
    if let Some(at) = backoff.last_failure {
        if at.elapsed() < Duration::from_secs(u64::from(backoff.secs)) {
            tracing::debug!(dest = %shared.dest, backoff = backoff.secs, "still in back-off period");
            return ChunkStatus::BackingOff;
        }
    }

    let mut slot = lock(&shared.slot);
    loop {
        if slot.rd >= slot.data.len() {
            // Read slot exhausted: swap in the chunk's committed bytes.
            let mut cb = lock(&chunk.buf);
            if cb.data.is_empty() {
                return ChunkStatus::Sent;
            }
            let msg_start = cb.msg_start;
            let tail = cb.data.split_off(msg_start);
            slot.data = std::mem::replace(&mut cb.data, tail);
            cb.msg_start = 0;
            cb.nmessages = 0;
            slot.rd = 0;
            if slot.data.is_empty() {
                return ChunkStatus::Sent;
            }
        }

        while slot.rd < slot.data.len() {
            let written = {
                let meta = lock(&shared.meta);
                shared.out.write(&slot.data[slot.rd..], &meta)
            };
            if written == 0 {
                backoff.last_failure = Some(Instant::now());
                backoff.secs = if backoff.secs == 0 {
                    1
                } else {
                    backoff.secs.saturating_mul(2)
                };
                tracing::warn!(
                    dest = %shared.dest,
                    backoff = backoff.secs,
                    "error sending, backing off"
                );
                return ChunkStatus::BackingOff;
            }
            slot.rd += written;
            if backoff.secs != 0 {
                backoff.secs = 0;
                backoff.last_failure = None;
                tracing::info!(dest = %shared.dest, "connected");
            }
        }
        // The slot is drained; loop to pick up anything the chunk
        // accumulated meanwhile.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::OutStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Sink capturing everything, optionally failing on demand.
    struct MockStream {
        sent: Mutex<Vec<u8>>,
        headers: Mutex<Vec<u8>>,
        fail: AtomicBool,
        writes: AtomicUsize,
    }

    impl MockStream {
        fn new(fail: bool) -> Arc<MockStream> {
            Arc::new(MockStream {
                sent: Mutex::new(Vec::new()),
                headers: Mutex::new(Vec::new()),
                fail: AtomicBool::new(fail),
                writes: AtomicUsize::new(0),
            })
        }
    }

    struct MockHandle(Arc<MockStream>);

    impl OutStream for MockHandle {
        fn dest(&self) -> &str {
            "mock:"
        }

        fn write(&self, data: &[u8], header: &[u8]) -> usize {
            self.0.writes.fetch_add(1, Ordering::SeqCst);
            if self.0.fail.load(Ordering::SeqCst) {
                return 0;
            }
            let mut h = self.0.headers.lock().unwrap();
            if h.is_empty() {
                h.extend_from_slice(header);
            }
            self.0.sent.lock().unwrap().extend_from_slice(data);
            data.len()
        }

        fn close(&self) {}
    }

    fn push_line(bw: &BufferedWriter, line: &str) -> bool {
        bw.write_row(|buf| {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            RowResult::Commit
        })
    }

    #[test]
    fn rows_drain_in_order() {
        let mock = MockStream::new(false);
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 4096, 64);
        for i in 0..100 {
            assert!(push_line(&bw, &format!("row {i}")));
        }
        bw.close();

        let sent = String::from_utf8(mock.sent.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = sent.lines().collect();
        assert_eq!(lines.len(), 100);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("row {i}"));
        }
        assert_eq!(bw.nlost_reset(), 0);
    }

    #[test]
    fn conservation_under_backpressure() {
        let mock = MockStream::new(true);
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 4096, 1024);

        let produced: u64 = 10_000;
        for i in 0..produced {
            assert!(push_line(&bw, &format!("sample {i} xxxxxxxxxxxxxxxx")));
        }

        // Nothing was ever sent, so produced == pending + in-flight + lost.
        // Every message in this test ends with exactly one newline, so the
        // unread part of the read slot can be counted by newlines.
        let lost = {
            let ring = lock(&bw.shared.ring);
            let slot = lock(&bw.shared.slot);
            let pending: u64 = ring
                .chunks
                .iter()
                .map(|c| lock(&c.buf).nmessages)
                .sum();
            let in_flight =
                slot.data[slot.rd..].iter().filter(|b| **b == b'\n').count() as u64;
            assert!(ring.nlost > 0, "ring never overwrote a chunk");
            assert_eq!(pending + in_flight + ring.nlost, produced);
            ring.nlost
        };
        assert_eq!(bw.nlost_reset(), lost);
        assert_eq!(bw.nlost_reset(), 0);
        bw.close();
    }

    #[test]
    fn ring_grows_within_budget_before_dropping() {
        let mock = MockStream::new(true);
        // Budget of 4 chunks of 32 bytes.
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 128, 32);

        // Two chunks worth of data fits without loss.
        for i in 0..4 {
            push_line(&bw, &format!("abcdefghij {i}"));
        }
        assert_eq!(bw.nlost_reset(), 0);

        // Ten chunks worth forces overwrites.
        for i in 0..20 {
            push_line(&bw, &format!("abcdefghij {i}"));
        }
        assert!(bw.nlost_reset() > 0);
        bw.close();
    }

    #[test]
    fn chunk_advance_on_exact_fill() {
        let mock = MockStream::new(true);
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 4096, 16);
        // Park the drain thread at the slot lock so it cannot swap the
        // chunk out between the two writes.
        let slot_guard = lock(&bw.shared.slot);

        // Exactly fills one chunk.
        bw.write_row(|buf| {
            buf.extend_from_slice(&[b'x'; 16]);
            RowResult::Commit
        });
        {
            let ring = lock(&bw.shared.ring);
            assert_eq!(ring.writer, 0);
        }
        // Next row must land in a freshly-advanced chunk.
        bw.write_row(|buf| {
            buf.extend_from_slice(b"y");
            RowResult::Commit
        });
        {
            let ring = lock(&bw.shared.ring);
            assert_ne!(ring.writer, 0);
            let wb = lock(&ring.chunks[ring.writer].buf);
            assert_eq!(wb.data, b"y");
        }
        drop(slot_guard);
        bw.close();
    }

    #[test]
    fn rollback_discards_bytes() {
        let mock = MockStream::new(false);
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 4096, 64);
        assert!(!bw.write_row(|buf| {
            buf.extend_from_slice(b"half a row");
            RowResult::Rollback
        }));
        push_line(&bw, "whole row");
        bw.close();
        let sent = mock.sent.lock().unwrap().clone();
        assert_eq!(sent, b"whole row\n");
    }

    #[test]
    fn meta_rows_are_replayed_as_headers() {
        let mock = MockStream::new(false);
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 4096, 64);
        bw.push_meta(b"protocol: 4\n");
        bw.write_row(|buf| {
            buf.extend_from_slice(b"0\tschema row\n");
            RowResult::CommitMeta
        });
        push_line(&bw, "1\tdata row");
        bw.close();

        let headers = mock.headers.lock().unwrap().clone();
        assert_eq!(headers, b"protocol: 4\n0\tschema row\n");
        let sent = String::from_utf8(mock.sent.lock().unwrap().clone()).unwrap();
        assert!(sent.contains("0\tschema row"));
        assert!(sent.contains("1\tdata row"));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let mock = MockStream::new(false);
        let bw = BufferedWriter::create(Box::new(MockHandle(Arc::clone(&mock))), 4096, 64);
        bw.close();
        assert!(!push_line(&bw, "late"));
        assert!(!bw.push_meta(b"late header"));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        // The doubling rule: 1 on the first failure after a success, then
        // doubling, saturating at 255.
        let mut secs: u8 = 0;
        let mut seen = Vec::new();
        for _ in 0..10 {
            secs = if secs == 0 { 1 } else { secs.saturating_mul(2) };
            seen.push(secs);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 64, 128, 255, 255]);
    }
}
