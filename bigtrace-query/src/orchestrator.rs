//! Orchestrator: owns named trace pools and a flat trace registry with
//! reference counting, round-robin assigns traces to workers, fans queries
//! out across workers, and periodically reconciles worker state.

use crate::error::Error;
use crate::rpc::{
    TracePoolCreateResponse, TracePoolDestroyResponse, TracePoolQueryResponse,
    TracePoolSetTracesResponse,
};
use crate::worker::Worker;
use bigtrace_async::{
    collect, flatten_streams, map_future, stream_of, AllOk, Future, PeriodicTask, SpawnHandle,
    Stream, TaskRunner,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Default period between `SyncWorkers` reconciliation passes.
pub const SYNC_WORKERS_PERIOD: Duration = Duration::from_secs(15);

struct TracePool {
    traces: Vec<String>,
}

struct TraceRegistryEntry {
    worker: usize,
    refcount: u32,
}

struct State {
    pools: HashMap<String, TracePool>,
    traces: HashMap<String, TraceRegistryEntry>,
    next_worker: usize,
    sync_in_flight: Option<SpawnHandle>,
}

struct Shared {
    task_runner: Arc<dyn TaskRunner>,
    workers: Vec<Arc<Worker>>,
    state: Mutex<State>,
}

/// The client-facing coordinator. Constructing one starts a periodic sync
/// task immediately (first tick runs right away, then every
/// [`SYNC_WORKERS_PERIOD`]); dropping the orchestrator stops it.
pub struct Orchestrator {
    shared: Arc<Shared>,
    periodic_sync: PeriodicTask,
}

impl Orchestrator {
    pub fn new(task_runner: Arc<dyn TaskRunner>, workers: Vec<Arc<Worker>>) -> Self {
        let shared = Arc::new(Shared {
            task_runner: task_runner.clone(),
            workers,
            state: Mutex::new(State {
                pools: HashMap::new(),
                traces: HashMap::new(),
                next_worker: 0,
                sync_in_flight: None,
            }),
        });

        let sync_shared = shared.clone();
        let periodic_sync = PeriodicTask::start(task_runner, SYNC_WORKERS_PERIOD, true, move || {
            execute_sync_workers_once(sync_shared.clone());
            Future::ready(())
        });

        Self {
            shared,
            periodic_sync,
        }
    }

    pub fn trace_pool_create(&self, pool_name: &str) -> Result<TracePoolCreateResponse, Error> {
        if pool_name.is_empty() {
            return Err(Error::InvalidArgument("pool name must not be empty".into()));
        }
        let pool_id = format!("stateless:{pool_name}");
        let mut state = self.shared.state.lock();
        if state.pools.contains_key(&pool_id) {
            return Err(Error::AlreadyExists(pool_id));
        }
        state.pools.insert(pool_id, TracePool { traces: Vec::new() });
        Ok(TracePoolCreateResponse {})
    }

    /// Single-shot: rejects a pool that already has traces assigned.
    /// Assigns new paths to workers round-robin; the round-robin counter
    /// only advances on brand-new registry inserts, so a path already
    /// shared by another pool keeps its original worker and does not
    /// consume a slot.
    pub fn trace_pool_set_traces(
        &self,
        pool_id: &str,
        traces: Vec<String>,
    ) -> Result<TracePoolSetTracesResponse, Error> {
        let mut state = self.shared.state.lock();

        match state.pools.get(pool_id) {
            Some(pool) if !pool.traces.is_empty() => {
                return Err(Error::InvalidArgument(format!(
                    "pool {pool_id} already has traces assigned"
                )));
            }
            Some(_) => {}
            None => return Err(Error::NotFound(pool_id.to_string())),
        }

        let num_workers = self.shared.workers.len();
        if num_workers == 0 {
            return Err(Error::InvalidArgument("orchestrator has no workers".into()));
        }

        for path in &traces {
            if let Some(entry) = state.traces.get_mut(path) {
                entry.refcount += 1;
            } else {
                let worker = state.next_worker % num_workers;
                state.next_worker += 1;
                state
                    .traces
                    .insert(path.clone(), TraceRegistryEntry { worker, refcount: 1 });
            }
        }

        if let Some(pool) = state.pools.get_mut(pool_id) {
            pool.traces = traces;
        }

        Ok(TracePoolSetTracesResponse {})
    }

    pub fn trace_pool_query(
        &self,
        pool_id: &str,
        sql_query: &str,
    ) -> Stream<Result<TracePoolQueryResponse, Error>> {
        let paths = {
            let state = self.shared.state.lock();
            match state.pools.get(pool_id) {
                Some(pool) => pool.traces.clone(),
                None => return stream_of(Err(Error::NotFound(pool_id.to_string()))),
            }
        };

        let mut streams = Vec::with_capacity(paths.len());
        for path in paths {
            let worker_idx = {
                let state = self.shared.state.lock();
                state.traces.get(&path).map(|entry| entry.worker)
            };
            let Some(worker_idx) = worker_idx else {
                continue;
            };
            let worker = self.shared.workers[worker_idx].clone();
            let sql = sql_query.to_string();
            let trace_stream = worker.query_trace(&path, &sql);
            let mapped = map_future(trace_stream, |result| {
                Future::ready(result.map(|response| TracePoolQueryResponse {
                    trace: response.trace,
                    result: response.result,
                }))
            });
            streams.push(mapped);
        }

        flatten_streams(streams)
    }

    /// Decrements every registry entry's refcount, not just the destroyed
    /// pool's own paths — preserved as-is rather than silently "fixed".
    pub fn trace_pool_destroy(&self, pool_id: &str) -> Result<TracePoolDestroyResponse, Error> {
        let mut state = self.shared.state.lock();
        if !state.pools.contains_key(pool_id) {
            return Err(Error::NotFound(pool_id.to_string()));
        }

        let mut drained = Vec::new();
        for (path, entry) in state.traces.iter_mut() {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                drained.push(path.clone());
            }
        }
        for path in drained {
            state.traces.remove(&path);
        }

        state.pools.remove(pool_id);
        Ok(TracePoolDestroyResponse {})
    }

    /// On-demand reconciliation; a no-op if a sync is already in flight.
    pub fn execute_sync_workers(&self) {
        execute_sync_workers_once(self.shared.clone());
    }

    /// Cancels any in-flight sync and starts a fresh one immediately.
    pub fn execute_force_sync_workers(&self) {
        self.shared.state.lock().sync_in_flight = None;
        execute_sync_workers_once(self.shared.clone());
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.periodic_sync.stop();
    }
}

fn execute_sync_workers_once(shared: Arc<Shared>) {
    if shared.state.lock().sync_in_flight.is_some() {
        debug!("worker sync already in flight, skipping this tick");
        return;
    }

    let sync_target = shared.clone();
    let complete_target = shared.clone();
    let sync_future: Future<()> = bigtrace_async::continue_with(
        sync_workers(sync_target),
        move |result: Result<(), Error>| {
            if let Err(e) = result {
                error!(error = %e, "worker sync failed, will retry next tick");
            }
            complete_target.state.lock().sync_in_flight = None;
            Future::ready(())
        },
    );

    let handle = bigtrace_async::spawn_future(shared.task_runner.clone(), sync_future);
    shared.state.lock().sync_in_flight = Some(handle);
}

/// Builds `worker -> paths` by inverting the trace registry, sends
/// `sync_trace_state` to every worker with at least one trace, and
/// short-circuits on the first error via `AllOk`.
fn sync_workers(shared: Arc<Shared>) -> Future<Result<(), Error>> {
    let by_worker: HashMap<usize, Vec<String>> = {
        let state = shared.state.lock();
        let mut map: HashMap<usize, Vec<String>> = HashMap::new();
        for (path, entry) in state.traces.iter() {
            map.entry(entry.worker).or_default().push(path.clone());
        }
        map
    };

    let mut streams = Vec::with_capacity(by_worker.len());
    for (worker_idx, paths) in by_worker {
        let worker = shared.workers[worker_idx].clone();
        streams.push(worker.sync_trace_state(paths));
    }

    let flattened = flatten_streams(streams);
    let discard_payload = map_future(flattened, |item| Future::ready(item.map(|_response| ())));
    collect(discard_payload, AllOk::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::FixedThreadPool;
    use crate::env::FileSource;
    use crate::processor::{QuerySerializer, Statefulness};
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

    struct TaggedProcessor(u32);

    impl crate::processor::TraceProcessor for TaggedProcessor {
        fn parse(&self, _chunk: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn notify_end_of_file(&self) -> Result<(), Error> {
            Ok(())
        }
        fn execute_query(&self, _sql: &str) -> Box<dyn QuerySerializer> {
            Box::new(TaggedSerializer {
                payload: Some(format!("W{}", self.0).into_bytes()),
            })
        }
        fn interrupt(&self) {}
        fn restore_initial_state(&self) {}
    }

    struct TaggedSerializer {
        payload: Option<Vec<u8>>,
    }

    impl QuerySerializer for TaggedSerializer {
        fn serialize(&mut self, out: &mut Vec<u8>) -> bool {
            if let Some(p) = self.payload.take() {
                out.extend_from_slice(&p);
            }
            false
        }
    }

    /// S1 — single pool, single trace: one response carrying the expected
    /// fake-processor result, then the stream ends.
    #[test]
    fn single_pool_single_trace_query() {
        let local_runner = Arc::new(LocalTaskRunner::new());
        let runner: Arc<dyn TaskRunner> = local_runner.clone();
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(2));
        let env: Arc<dyn FileSource> = Arc::new(
            InlineFileSource::new(8).with_file("t1", Bytes::from_static(b"hello")),
        );
        let make_processor: Arc<dyn Fn() -> Arc<dyn crate::processor::TraceProcessor> + Send + Sync> =
            Arc::new(|| Arc::new(FakeTraceProcessor::new()) as Arc<dyn crate::processor::TraceProcessor>);
        let worker = Arc::new(Worker::new(
            runner.clone(),
            env,
            pool,
            Statefulness::Stateful,
            make_processor,
        ));
        let orchestrator = Orchestrator::new(runner, vec![worker]);
        let (stop, driver) = spawn_driver(local_runner);

        orchestrator.trace_pool_create("P1").unwrap();
        orchestrator
            .trace_pool_set_traces("stateless:P1", vec!["t1".into()])
            .unwrap();
        orchestrator.execute_force_sync_workers();
        std::thread::sleep(Duration::from_millis(50));

        let results = drain_blocking(orchestrator.trace_pool_query("stateless:P1", "SELECT 1"));
        assert_eq!(results.len(), 1);
        let response = results[0].as_ref().unwrap();
        assert_eq!(response.trace, "t1");
        assert_eq!(response.result.to_vec(), b"OK: SELECT 1".to_vec());

        stop.store(true, Ordering::SeqCst);
        driver.join().unwrap();
    }

    /// S2 — two workers, three traces: round-robin assignment is
    /// `a -> workers[0]`, `b -> workers[1]`, `c -> workers[0]`, observed via
    /// which worker's tagged response each trace comes back with.
    #[test]
    fn cross_worker_fan_out_round_robin_assignment() {
        let local_runner = Arc::new(LocalTaskRunner::new());
        let runner: Arc<dyn TaskRunner> = local_runner.clone();
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(2));
        let env: Arc<dyn FileSource> = Arc::new(
            InlineFileSource::new(8)
                .with_file("a", Bytes::from_static(b"a"))
                .with_file("b", Bytes::from_static(b"b"))
                .with_file("c", Bytes::from_static(b"c")),
        );
        let workers: Vec<Arc<Worker>> = (0..2u32)
            .map(|idx| {
                let make_processor: Arc<
                    dyn Fn() -> Arc<dyn crate::processor::TraceProcessor> + Send + Sync,
                > = Arc::new(move || Arc::new(TaggedProcessor(idx)) as Arc<dyn crate::processor::TraceProcessor>);
                Arc::new(Worker::new(
                    runner.clone(),
                    env.clone(),
                    pool.clone(),
                    Statefulness::Stateful,
                    make_processor,
                ))
            })
            .collect();
        let orchestrator = Orchestrator::new(runner, workers);
        let (stop, driver) = spawn_driver(local_runner);

        orchestrator.trace_pool_create("P").unwrap();
        orchestrator
            .trace_pool_set_traces("stateless:P", vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        orchestrator.execute_force_sync_workers();
        std::thread::sleep(Duration::from_millis(50));

        let results = drain_blocking(orchestrator.trace_pool_query("stateless:P", "Q"));
        assert_eq!(results.len(), 3);
        let mut by_trace: HashMap<String, String> = HashMap::new();
        for r in results {
            let response = r.unwrap();
            by_trace.insert(response.trace, String::from_utf8(response.result.to_vec()).unwrap());
        }
        assert_eq!(by_trace["a"], "W0");
        assert_eq!(by_trace["b"], "W1");
        assert_eq!(by_trace["c"], "W0");

        stop.store(true, Ordering::SeqCst);
        driver.join().unwrap();
    }

    /// S3 — a trace shared by two pools survives destruction of either one
    /// alone (refcount keeps it alive) and is evicted from the worker only
    /// once the last referencing pool is destroyed and a sync runs.
    #[test]
    fn shared_trace_survives_single_pool_destroy_and_is_evicted_when_last_goes() {
        let local_runner = Arc::new(LocalTaskRunner::new());
        let runner: Arc<dyn TaskRunner> = local_runner.clone();
        let pool: Arc<dyn BlockingPool> = Arc::new(FixedThreadPool::new(2));
        let env: Arc<dyn FileSource> = Arc::new(
            InlineFileSource::new(8).with_file("x", Bytes::from_static(b"hello")),
        );
        let make_processor: Arc<dyn Fn() -> Arc<dyn crate::processor::TraceProcessor> + Send + Sync> =
            Arc::new(|| Arc::new(FakeTraceProcessor::new()) as Arc<dyn crate::processor::TraceProcessor>);
        let worker = Arc::new(Worker::new(
            runner.clone(),
            env,
            pool,
            Statefulness::Stateful,
            make_processor,
        ));
        let orchestrator = Orchestrator::new(runner, vec![worker.clone()]);
        let (stop, driver) = spawn_driver(local_runner);

        orchestrator.trace_pool_create("P1").unwrap();
        orchestrator
            .trace_pool_set_traces("stateless:P1", vec!["x".into()])
            .unwrap();
        orchestrator.trace_pool_create("P2").unwrap();
        orchestrator
            .trace_pool_set_traces("stateless:P2", vec!["x".into()])
            .unwrap();
        orchestrator.execute_force_sync_workers();
        std::thread::sleep(Duration::from_millis(50));

        let loaded = drain_blocking(worker.query_trace("x", "SELECT 1"));
        assert!(loaded[0].is_ok(), "expected x to be loaded: {:?}", loaded[0]);

        orchestrator.trace_pool_destroy("stateless:P1").unwrap();
        orchestrator.execute_force_sync_workers();
        std::thread::sleep(Duration::from_millis(50));
        let still_shared = drain_blocking(worker.query_trace("x", "SELECT 1"));
        assert!(
            still_shared[0].is_ok(),
            "x should survive while P2 still references it: {:?}",
            still_shared[0]
        );

        orchestrator.trace_pool_destroy("stateless:P2").unwrap();
        orchestrator.execute_force_sync_workers();
        std::thread::sleep(Duration::from_millis(50));
        let evicted = drain_blocking(worker.query_trace("x", "SELECT 1"));
        match &evicted[0] {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound after last pool destroyed, got {other:?}"),
        }

        stop.store(true, Ordering::SeqCst);
        driver.join().unwrap();
    }
}
