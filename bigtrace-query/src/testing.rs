//! Fakes for exercising the wrapper/worker/orchestrator pipeline without a
//! real SQL engine or filesystem. Not `#[cfg(test)]`-gated — integration
//! tests in a sibling crate, or a binary wiring up a demo, can depend on
//! these the same way they depend on `bigtrace_async::LocalTaskRunner`.

use crate::env::FileSource;
use crate::error::Error;
use crate::processor::{QuerySerializer, TraceProcessor};
use bigtrace_async::Stream;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A trivial in-memory SQL engine stand-in. Understands three query
/// shapes well enough to exercise the stateful/stateless and
/// cancellation paths: `CREATE VIEW <name> ...`, `SELECT * FROM <name>`,
/// and anything containing `RECURSIVE` (treated as a long-running query
/// that spins until interrupted).
pub struct FakeTraceProcessor {
    views: Mutex<HashSet<String>>,
    interrupted: Arc<AtomicBool>,
    parsed_bytes: AtomicUsize,
}

impl FakeTraceProcessor {
    pub fn new() -> Self {
        Self {
            views: Mutex::new(HashSet::new()),
            interrupted: Arc::new(AtomicBool::new(false)),
            parsed_bytes: AtomicUsize::new(0),
        }
    }

    pub fn parsed_bytes(&self) -> usize {
        self.parsed_bytes.load(Ordering::SeqCst)
    }
}

impl Default for FakeTraceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceProcessor for FakeTraceProcessor {
    fn parse(&self, chunk: &[u8]) -> Result<(), Error> {
        self.parsed_bytes.fetch_add(chunk.len(), Ordering::SeqCst);
        Ok(())
    }

    fn notify_end_of_file(&self) -> Result<(), Error> {
        Ok(())
    }

    fn execute_query(&self, sql: &str) -> Box<dyn QuerySerializer> {
        self.interrupted.store(false, Ordering::SeqCst);

        if let Some(name) = view_name_created_by(sql) {
            self.views.lock().insert(name);
            return Box::new(OneShot::new(b"OK".to_vec()));
        }
        if let Some(table) = table_queried_by(sql) {
            return if self.views.lock().contains(&table) {
                Box::new(OneShot::new(b"OK".to_vec()))
            } else {
                Box::new(OneShot::new(
                    format!("ERROR: no such table: {table}").into_bytes(),
                ))
            };
        }
        if sql.contains("RECURSIVE") {
            return Box::new(SpinQuery::new(self.interrupted.clone()));
        }
        Box::new(OneShot::new(format!("OK: {sql}").into_bytes()))
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn restore_initial_state(&self) {
        self.views.lock().clear();
    }
}

fn view_name_created_by(sql: &str) -> Option<String> {
    let rest = sql.strip_prefix("CREATE VIEW ")?;
    rest.split_whitespace().next().map(str::to_string)
}

fn table_queried_by(sql: &str) -> Option<String> {
    let rest = sql.strip_prefix("SELECT * FROM ")?;
    Some(rest.trim().to_string())
}

struct OneShot {
    payload: Option<Vec<u8>>,
}

impl OneShot {
    fn new(payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
        }
    }
}

impl QuerySerializer for OneShot {
    fn serialize(&mut self, out: &mut Vec<u8>) -> bool {
        if let Some(payload) = self.payload.take() {
            out.extend_from_slice(&payload);
        }
        false
    }
}

/// Simulates a query that never finishes on its own; `serialize` blocks
/// briefly and keeps reporting `has_more = true` until `interrupt()` sets
/// the shared flag.
struct SpinQuery {
    interrupted: Arc<AtomicBool>,
    ticks: u32,
}

impl SpinQuery {
    fn new(interrupted: Arc<AtomicBool>) -> Self {
        Self {
            interrupted,
            ticks: 0,
        }
    }
}

impl QuerySerializer for SpinQuery {
    fn serialize(&mut self, out: &mut Vec<u8>) -> bool {
        if self.interrupted.load(Ordering::SeqCst) {
            out.extend_from_slice(b"INTERRUPTED");
            return false;
        }
        self.ticks += 1;
        std::thread::sleep(Duration::from_millis(5));
        out.extend_from_slice(format!("TICK {}", self.ticks).as_bytes());
        true
    }
}

/// Pre-seeded in-memory file source, chunked into caller-specified sizes.
pub struct InlineFileSource {
    files: HashMap<String, Bytes>,
    chunk_size: usize,
}

impl InlineFileSource {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            files: HashMap::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.files.insert(path.into(), bytes.into());
        self
    }
}

impl FileSource for InlineFileSource {
    fn read_file(&self, path: &str) -> Stream<Result<Vec<u8>, Error>> {
        match self.files.get(path) {
            Some(bytes) => {
                let chunks: Vec<Result<Vec<u8>, Error>> = bytes
                    .chunks(self.chunk_size)
                    .map(|c| Ok(c.to_vec()))
                    .collect();
                Stream::from_iter(chunks)
            }
            None => Stream::of(Err(Error::NotFound(path.to_string()))),
        }
    }
}

/// Polls `stream` to completion on the calling thread, busy-waiting a short
/// interval between `Pending` results. Channel/blocking-pool reads ignore
/// the `ready` set's contents (they re-check real state on every poll), so
/// there is no need to track which handle actually woke up — only useful
/// for tests and small demos driving a stream without a full `TaskRunner`.
pub fn drain_blocking<T>(mut stream: Stream<T>) -> Vec<T> {
    use bigtrace_async::{HandleSet, Poll, PollContext};

    let mut items = Vec::new();
    loop {
        let mut interested = HandleSet::new();
        let ready = HandleSet::new();
        let mut cx = PollContext::new(&mut interested, &ready);
        match stream.poll_next(&mut cx) {
            Poll::Ready(Some(v)) => items.push(v),
            Poll::Ready(None) => return items,
            Poll::Pending => std::thread::sleep(Duration::from_millis(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stateless_view_wipe_round_trip() {
        let processor = FakeTraceProcessor::new();
        let mut create = processor.execute_query("CREATE VIEW v AS SELECT 1");
        let mut buf = Vec::new();
        assert!(!create.serialize(&mut buf));
        assert_eq!(buf, b"OK");

        let mut select = processor.execute_query("SELECT * FROM v");
        buf.clear();
        assert!(!select.serialize(&mut buf));
        assert_eq!(buf, b"OK");

        processor.restore_initial_state();

        let mut select_after_wipe = processor.execute_query("SELECT * FROM v");
        buf.clear();
        assert!(!select_after_wipe.serialize(&mut buf));
        assert_eq!(buf, b"ERROR: no such table: v");
    }

    #[test]
    fn inline_file_source_chunks_and_reports_missing() {
        use bigtrace_async::{HandleSet, Poll, PollContext};

        let source = InlineFileSource::new(4).with_file("a", Bytes::from_static(b"0123456789"));

        let mut present = source.read_file("a");
        let mut chunks = Vec::new();
        loop {
            let mut interested = HandleSet::new();
            let ready = HandleSet::new();
            let mut cx = PollContext::new(&mut interested, &ready);
            match present.poll_next(&mut cx) {
                Poll::Ready(Some(Ok(chunk))) => chunks.push(chunk),
                Poll::Ready(Some(Err(e))) => panic!("unexpected error: {e}"),
                Poll::Ready(None) => break,
                Poll::Pending => panic!("InlineFileSource stream should never be Pending"),
            }
        }
        assert_eq!(chunks, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);

        let mut missing = source.read_file("missing");
        let mut interested = HandleSet::new();
        let ready = HandleSet::new();
        let mut cx = PollContext::new(&mut interested, &ready);
        match missing.poll_next(&mut cx) {
            Poll::Ready(Some(Err(Error::NotFound(path)))) => assert_eq!(path, "missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
