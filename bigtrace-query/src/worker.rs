//! Worker: owns a trace-path → processor map, implements the
//! `sync_trace_state`/`query_trace` RPC surfaces.

use crate::blocking::BlockingPool;
use crate::env::FileSource;
use crate::error::Error;
use crate::processor::{Statefulness, TraceProcessor, TraceProcessorWrapper};
use crate::rpc::{QueryTraceResponse, SyncTraceStateResponse};
use bigtrace_async::{
    flatten_streams, map_future, spawn_result_future, stream_of, Future, ResultSpawnHandle,
    Stream, TaskRunner,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct TraceEntry {
    wrapper: Arc<TraceProcessorWrapper>,
    _load_handle: ResultSpawnHandle<Result<(), Error>>,
}

pub struct Worker {
    task_runner: Arc<dyn TaskRunner>,
    env: Arc<dyn FileSource>,
    blocking_pool: Arc<dyn BlockingPool>,
    statefulness: Statefulness,
    make_processor: Arc<dyn Fn() -> Arc<dyn TraceProcessor> + Send + Sync>,
    traces: Mutex<HashMap<String, TraceEntry>>,
}

impl Worker {
    pub fn new(
        task_runner: Arc<dyn TaskRunner>,
        env: Arc<dyn FileSource>,
        blocking_pool: Arc<dyn BlockingPool>,
        statefulness: Statefulness,
        make_processor: Arc<dyn Fn() -> Arc<dyn TraceProcessor> + Send + Sync>,
    ) -> Self {
        Self {
            task_runner,
            env,
            blocking_pool,
            statefulness,
            make_processor,
            traces: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles the worker's loaded-trace set to exactly `traces`:
    /// existing entries are kept as-is, new paths get a fresh wrapper with
    /// a spawned load in flight, and paths no longer present are dropped
    /// (cancelling their in-flight load and releasing the processor).
    /// Yields one response per newly-loaded trace (or an error item, which
    /// terminates only that trace's sub-stream).
    pub fn sync_trace_state(&self, traces: Vec<String>) -> Stream<Result<SyncTraceStateResponse, Error>> {
        let mut current = self.traces.lock();
        let mut next: HashMap<String, TraceEntry> = HashMap::new();
        let mut new_paths: Vec<String> = Vec::new();

        for path in traces {
            if let Some(entry) = current.remove(&path) {
                next.insert(path, entry);
            } else {
                new_paths.push(path);
            }
        }
        // Whatever remains in `current` is no longer wanted; dropping it
        // cancels the in-flight load (ResultSpawnHandle's inner
        // SpawnHandle::drop) and releases the processor.
        let dropped = current.len();
        drop(std::mem::take(&mut *current));
        if dropped > 0 {
            debug!(dropped, "worker dropped traces no longer assigned");
        }

        let mut load_streams = Vec::with_capacity(new_paths.len());
        for path in new_paths {
            let processor = (self.make_processor)();
            let wrapper = Arc::new(TraceProcessorWrapper::new(
                path.clone(),
                self.blocking_pool.clone(),
                self.statefulness,
                processor,
            ));
            let chunks = self.env.read_file(&path);
            let load_future = wrapper.load_trace(chunks);

            match spawn_result_future(self.task_runner.clone(), load_future) {
                Ok(result_handle) => {
                    let response_path = path.clone();
                    let response_stream = map_future(result_handle.stream(), move |result| {
                        let response_path = response_path.clone();
                        Future::ready(result.map(|()| SyncTraceStateResponse {}).map_err(|e| {
                            warn!(trace = %response_path, error = %e, "trace load failed");
                            e
                        }))
                    });
                    next.insert(
                        path,
                        TraceEntry {
                            wrapper,
                            _load_handle: result_handle,
                        },
                    );
                    load_streams.push(response_stream);
                }
                Err(e) => {
                    warn!(trace = %path, error = %e, "failed to spawn trace load");
                    load_streams.push(stream_of(Err(Error::LoadFailure(e.to_string()))));
                }
            }
        }

        *current = next;
        drop(current);

        flatten_streams(load_streams)
    }

    /// Looks up `trace_path`; a missing path yields a single-item error
    /// stream rather than an immediate failure, matching the rest of the
    /// crate's "stream-returning methods surface preconditions as their
    /// first item" convention.
    pub fn query_trace(
        &self,
        trace_path: &str,
        sql_query: &str,
    ) -> Stream<Result<QueryTraceResponse, Error>> {
        let wrapper = {
            let traces = self.traces.lock();
            traces.get(trace_path).map(|entry| entry.wrapper.clone())
        };
        let Some(wrapper) = wrapper else {
            return stream_of(Err(Error::NotFound(trace_path.to_string())));
        };

        let trace = trace_path.to_string();
        map_future(wrapper.query(sql_query), move |result| {
            let trace = trace.clone();
            Future::ready(result.map(|response| QueryTraceResponse {
                trace,
                result: response.result,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::FixedThreadPool;
    use crate::testing::{drain_blocking, FakeTraceProcessor, InlineFileSource};
    use bigtrace_async::LocalTaskRunner;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn spawn_driver(runner: Arc<LocalTaskRunner>) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let driver_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            while !driver_stop.load(Ordering::SeqCst) {
                runner.run_until_idle();
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        (stop, handle)
    }

    fn make_processor() -> Arc<dyn Fn() -> Arc<dyn TraceProcessor> + Send + Sync> {
        Arc::new(|| Arc::new(FakeTraceProcessor::new()) as Arc<dyn TraceProcessor>)
    }

    #[test]
    fn sync_trace_state_loads_new_and_drops_missing() {
        let local_runner = Arc::new(LocalTaskRunner::new());
        let runner: Arc<dyn TaskRunner> = local_runner.clone();
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(2));
        let env: Arc<dyn FileSource> = Arc::new(
            InlineFileSource::new(8)
                .with_file("a", Bytes::from_static(b"aaa"))
                .with_file("b", Bytes::from_static(b"bbb")),
        );
        let worker = Arc::new(Worker::new(
            runner,
            env,
            pool,
            Statefulness::Stateful,
            make_processor(),
        ));
        let (stop, driver) = spawn_driver(local_runner);

        let results = drain_blocking(worker.sync_trace_state(vec!["a".into(), "b".into()]));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");

        let a_loaded = drain_blocking(worker.query_trace("a", "SELECT 1"));
        assert!(a_loaded[0].is_ok());
        let b_loaded = drain_blocking(worker.query_trace("b", "SELECT 1"));
        assert!(b_loaded[0].is_ok());

        // Re-sync to just "a"; "b" should be dropped and its in-flight
        // load's resources released (no crash, no lingering entry).
        let second = drain_blocking(worker.sync_trace_state(vec!["a".into()]));
        assert!(second.is_empty(), "no new paths, so no response items");

        let b_gone = drain_blocking(worker.query_trace("b", "SELECT 1"));
        match &b_gone[0] {
            Err(Error::NotFound(path)) => assert_eq!(path, "b"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        let a_still_there = drain_blocking(worker.query_trace("a", "SELECT 1"));
        assert!(a_still_there[0].is_ok());

        stop.store(true, Ordering::SeqCst);
        driver.join().unwrap();
    }

    #[test]
    fn sync_trace_state_surfaces_load_failure_without_aborting_the_rest() {
        let local_runner = Arc::new(LocalTaskRunner::new());
        let runner: Arc<dyn TaskRunner> = local_runner.clone();
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(2));
        let env: Arc<dyn FileSource> = Arc::new(
            InlineFileSource::new(8).with_file("good", Bytes::from_static(b"ok")),
        );
        let worker = Arc::new(Worker::new(
            runner,
            env,
            pool,
            Statefulness::Stateful,
            make_processor(),
        ));
        let (stop, driver) = spawn_driver(local_runner);

        let results = drain_blocking(worker.sync_trace_state(vec!["good".into(), "missing".into()]));
        assert_eq!(results.len(), 2);
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let err_count = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(ok_count, 1);
        assert_eq!(err_count, 1);

        let good_loaded = drain_blocking(worker.query_trace("good", "SELECT 1"));
        assert!(good_loaded[0].is_ok());

        stop.store(true, Ordering::SeqCst);
        driver.join().unwrap();
    }

    #[test]
    fn query_trace_missing_path_yields_not_found() {
        let local_runner = Arc::new(LocalTaskRunner::new());
        let runner: Arc<dyn TaskRunner> = local_runner.clone();
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(1));
        let env: Arc<dyn FileSource> = Arc::new(InlineFileSource::new(8));
        let worker = Worker::new(runner, env, pool, Statefulness::Stateful, make_processor());

        let results = drain_blocking(worker.query_trace("nope", "SELECT 1"));
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(Error::NotFound(path)) => assert_eq!(path, "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
