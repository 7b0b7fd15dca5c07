//! Sharded SQL-over-trace query system: the orchestrator owns named trace
//! pools and a flat trace registry, assigning traces to workers
//! round-robin; each worker owns a set of trace-processor instances and
//! streams query result chunks back. Built on the poll-based async
//! primitives in `bigtrace_async`.

pub mod blocking;
pub mod env;
pub mod error;
pub mod orchestrator;
pub mod processor;
pub mod rpc;
pub mod testing;
pub mod worker;

pub use blocking::{BlockingPool, CancelToken, FixedThreadPool, DEFAULT_BLOCKING_POOL_THREADS};
pub use env::FileSource;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, SYNC_WORKERS_PERIOD};
pub use processor::{QueryResponse, QuerySerializer, Statefulness, TraceProcessor, TraceProcessorWrapper};
pub use worker::Worker;
