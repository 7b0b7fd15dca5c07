//! Trace-processor wrapper: serializes load then query against a single
//! opaque SQL engine handle, enforces "at most one request in flight" via
//! the engine handle's own `Arc` strong count, and implements the
//! stateless-vs-stateful post-query cleanup policy.

use crate::blocking::BlockingPool;
use crate::error::Error;
use bigtrace_async::{
    collect, concat, continue_with, map_future, on_destroy, AllOk, Channel, Future, Poll, Stream,
    TryRecvError,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// The opaque SQL engine handle this crate treats as an external
/// collaborator. A `testing::FakeTraceProcessor` ships in the sibling
/// `testing` module for exercising the wrapper/worker/orchestrator without
/// a real engine.
pub trait TraceProcessor: Send + Sync {
    /// Feeds one chunk of trace bytes to the engine. Blocking.
    fn parse(&self, chunk: &[u8]) -> Result<(), Error>;

    /// Signals that no more chunks will arrive. Blocking.
    fn notify_end_of_file(&self) -> Result<(), Error>;

    /// Starts executing `sql`, returning a serializer that produces the
    /// result in chunks. Blocking to construct; the serializer itself is
    /// driven by further blocking calls.
    fn execute_query(&self, sql: &str) -> Box<dyn QuerySerializer>;

    /// Best-effort: ask an in-flight query to stop soon. Safe to call when
    /// no query is running.
    fn interrupt(&self);

    /// Wipes side effects (tables, registered functions) created by
    /// queries since load. Called after each query when the wrapper is
    /// `Stateless`.
    fn restore_initial_state(&self);
}

/// Produced by [`TraceProcessor::execute_query`]; pumped one chunk at a
/// time by the wrapper's `query` pump.
pub trait QuerySerializer: Send {
    /// Appends the next chunk of serialized result into `out` (which the
    /// caller has cleared beforehand) and returns whether more remains.
    fn serialize(&mut self, out: &mut Vec<u8>) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statefulness {
    Stateless,
    Stateful,
}

/// One result chunk from [`TraceProcessorWrapper::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub trace_path: String,
    pub result: Bytes,
}

pub struct TraceProcessorWrapper {
    path: String,
    pool: Arc<dyn BlockingPool>,
    statefulness: Statefulness,
    processor: Arc<dyn TraceProcessor>,
}

impl TraceProcessorWrapper {
    pub fn new(
        path: impl Into<String>,
        pool: Arc<dyn BlockingPool>,
        statefulness: Statefulness,
        processor: Arc<dyn TraceProcessor>,
    ) -> Self {
        Self {
            path: path.into(),
            pool,
            statefulness,
            processor,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `true` iff some future/stream this wrapper previously produced is
    /// still holding a clone of the processor handle. The wrapper itself
    /// holds exactly one reference when idle, so "in flight" is "more than
    /// one".
    fn in_flight(&self) -> bool {
        Arc::strong_count(&self.processor) > 1
    }

    /// Parses `chunks` sequentially (one in-flight blocking `parse` call
    /// at a time, via `map_future`'s single-pending-future rule), then
    /// calls `notify_end_of_file` once every chunk parsed cleanly.
    pub fn load_trace(&self, chunks: Stream<Result<Vec<u8>, Error>>) -> Future<Result<(), Error>> {
        if self.in_flight() {
            return Future::ready(Err(Error::InFlight));
        }

        let pool = self.pool.clone();
        let processor = self.processor.clone();
        let parse_results: Stream<Result<(), Error>> = map_future(chunks, move |chunk_result| {
            let pool = pool.clone();
            let processor = processor.clone();
            match chunk_result {
                Ok(chunk) => run_on_pool_result(&pool, Error::LoadFailure, move || {
                    processor.parse(&chunk)
                }),
                Err(e) => Future::ready(Err(e)),
            }
        });

        let loaded: Future<Result<(), Error>> = collect(parse_results, AllOk::new());

        let pool = self.pool.clone();
        let processor = self.processor.clone();
        continue_with(loaded, move |result| match result {
            Ok(()) => run_on_pool_result(&pool, Error::LoadFailure, move || {
                processor.notify_end_of_file()
            }),
            Err(e) => Future::ready(Err(e)),
        })
    }

    /// Runs `sql`, streaming result chunks as the engine produces them.
    /// Pumps the engine on the blocking pool one step at a time: the first
    /// step constructs the serializer, each following step calls
    /// `serialize` once. When a `Stateless` wrapper's query finishes,
    /// `restore_initial_state` runs before the stream reports `Done`.
    /// Dropping the returned stream (cancellation, or simple disinterest
    /// after full consumption) fires `processor.interrupt()` — harmless
    /// when nothing is running.
    pub fn query(&self, sql: impl Into<String>) -> Stream<Result<QueryResponse, Error>> {
        if self.in_flight() {
            return Stream::of(Err(Error::InFlight));
        }

        let sql = sql.into();
        let path = self.path.clone();
        let pool = self.pool.clone();
        let processor = self.processor.clone();
        let statefulness = self.statefulness;

        let pump_state: Arc<parking_lot::Mutex<Option<Box<dyn QuerySerializer>>>> =
            Arc::new(parking_lot::Mutex::new(None));

        enum Phase {
            NeedSerializer,
            Pumping,
            Done,
        }
        enum Step {
            SerializerReady,
            Chunk { bytes: Bytes, has_more: bool },
        }

        let mut phase = Phase::NeedSerializer;
        let mut pending: Option<Future<Result<Step, Error>>> = None;

        let pump: Stream<Result<QueryResponse, Error>> =
            Stream::from_fn(move |cx| loop {
                if let Some(fut) = pending.as_mut() {
                    match fut.poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            phase = Phase::Done;
                            pending = None;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Poll::Ready(Ok(Step::SerializerReady)) => {
                            phase = Phase::Pumping;
                            pending = None;
                            continue;
                        }
                        Poll::Ready(Ok(Step::Chunk { bytes, has_more })) => {
                            pending = None;
                            if !has_more {
                                phase = Phase::Done;
                            }
                            return Poll::Ready(Some(Ok(QueryResponse {
                                trace_path: path.clone(),
                                result: bytes,
                            })));
                        }
                    }
                }

                match phase {
                    Phase::Done => return Poll::Ready(None),
                    Phase::NeedSerializer => {
                        let processor = processor.clone();
                        let pump_state = pump_state.clone();
                        let sql = sql.clone();
                        pending = Some(run_on_pool_result(&pool, Error::QueryFailure, move || {
                            *pump_state.lock() = Some(processor.execute_query(&sql));
                            Ok(Step::SerializerReady)
                        }));
                    }
                    Phase::Pumping => {
                        let processor = processor.clone();
                        let pump_state = pump_state.clone();
                        pending = Some(run_on_pool_result(&pool, Error::QueryFailure, move || {
                            let mut guard = pump_state.lock();
                            let serializer = guard
                                .as_mut()
                                .expect("query pump polled before serializer existed");
                            let mut buf = Vec::new();
                            let has_more = serializer.serialize(&mut buf);
                            if !has_more && statefulness == Statefulness::Stateless {
                                processor.restore_initial_state();
                            }
                            Ok(Step::Chunk {
                                bytes: Bytes::from(buf),
                                has_more,
                            })
                        }));
                    }
                }
            });

        let interrupt_processor = self.processor.clone();
        let closer: Stream<Result<QueryResponse, Error>> =
            on_destroy(move || interrupt_processor.interrupt());
        concat(pump, closer)
    }
}

/// Runs `f` on `pool`'s worker thread and bridges its result back as a
/// `Future`, via a capacity-1 channel used purely as a one-shot rendezvous.
/// Wraps channel-creation failure (eventfd exhaustion) into the crate's
/// error type instead of propagating `io::Error` through every caller.
fn run_on_pool_result<T>(
    pool: &Arc<dyn BlockingPool>,
    err_ctor: impl FnOnce(String) -> Error + Send + 'static,
    f: impl FnOnce() -> Result<T, Error> + Send + 'static,
) -> Future<Result<T, Error>>
where
    T: Send + 'static,
{
    match run_on_pool(pool, f) {
        Ok(fut) => fut,
        Err(e) => {
            warn!(error = %e, "failed to create oneshot channel for blocking-pool step");
            Future::ready(Err(err_ctor(e.to_string())))
        }
    }
}

fn run_on_pool<T>(
    pool: &Arc<dyn BlockingPool>,
    f: impl FnOnce() -> T + Send + 'static,
) -> std::io::Result<Future<T>>
where
    T: Send + 'static,
{
    let channel = Arc::new(Channel::<T>::new(1)?);
    let writer = channel.clone();
    pool.post_task(Box::new(move || {
        let value = f();
        let _ = writer.write_nonblocking(value);
        writer.close();
    }));
    let reader = channel;
    Ok(Future::from_fn(move |cx| match reader.read_nonblocking() {
        Ok(v) => Poll::Ready(v),
        Err(TryRecvError::Empty) => {
            cx.register_interested(reader.read_handle());
            Poll::Pending
        }
        Err(TryRecvError::Closed) => {
            unreachable!("oneshot channel closed before producing a value")
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::FixedThreadPool;
    use crate::testing::{drain_blocking, FakeTraceProcessor};
    use bigtrace_async::{HandleSet, PollContext};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn wrapper(
        statefulness: Statefulness,
    ) -> (TraceProcessorWrapper, Arc<dyn BlockingPool>) {
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(2));
        let processor: Arc<dyn TraceProcessor> = Arc::new(FakeTraceProcessor::new());
        (
            TraceProcessorWrapper::new("t", pool.clone(), statefulness, processor),
            pool,
        )
    }

    /// S6 — a `Stateless` wrapper wipes side effects between queries: the
    /// same `CREATE VIEW` succeeds twice in a row, and a later `SELECT`
    /// against it fails because the view no longer exists.
    #[test]
    fn stateless_wipe_round_trip_through_wrapper() {
        let (w, _pool) = wrapper(Statefulness::Stateless);

        let create = drain_blocking(w.query("CREATE VIEW v AS SELECT 1"));
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].as_ref().unwrap().result.to_vec(), b"OK".to_vec());

        let select_missing = drain_blocking(w.query("SELECT * FROM v"));
        assert_eq!(select_missing.len(), 1);
        let body = select_missing[0].as_ref().unwrap().result.to_vec();
        assert!(String::from_utf8_lossy(&body).contains("no such table"));
    }

    /// S4 — a second `query` while one is still in flight is rejected
    /// immediately with `InFlight`, without waiting on the blocking pool.
    #[test]
    fn in_flight_guard_rejects_concurrent_query() {
        let (w, _pool) = wrapper(Statefulness::Stateful);

        let first = w.query("WITH RECURSIVE x SELECT COUNT(*)");
        let mut second = w.query("anything");

        let mut interested = HandleSet::new();
        let ready = HandleSet::new();
        let mut cx = PollContext::new(&mut interested, &ready);
        match second.poll_next(&mut cx) {
            Poll::Ready(Some(Err(Error::InFlight))) => {}
            other => panic!("expected InFlight, got {other:?}"),
        }

        drop(first);
    }

    /// S5 — dropping an in-progress query's stream interrupts the
    /// processor promptly; the blocking pool stays responsive afterward.
    #[test]
    fn dropping_query_stream_interrupts_processor() {
        let (w, pool) = wrapper(Statefulness::Stateful);

        let mut stream = w.query("WITH RECURSIVE x SELECT COUNT(*)");
        loop {
            let mut interested = HandleSet::new();
            let ready = HandleSet::new();
            let mut cx = PollContext::new(&mut interested, &ready);
            match stream.poll_next(&mut cx) {
                Poll::Ready(Some(Ok(_))) => break,
                Poll::Ready(Some(Err(e))) => panic!("unexpected error: {e}"),
                Poll::Ready(None) => panic!("stream ended before producing a chunk"),
                Poll::Pending => std::thread::sleep(Duration::from_millis(2)),
            }
        }
        drop(stream);

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        pool.post_task(Box::new(move || flag.store(true, Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(250));
        assert!(done.load(Ordering::SeqCst), "blocking pool did not stay responsive");
    }
}
