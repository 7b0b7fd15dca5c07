//! Single-threaded, poll-based async primitives: handle-set readiness,
//! boxed `Future`/`Stream` trait objects, a bounded channel signaled by
//! eventfds, a spawner that bridges futures to an external [`TaskRunner`],
//! and a periodic-task helper built on top of the spawner.

pub mod channel;
pub mod combinators;
pub mod eventfd;
pub mod future;
pub mod periodic;
pub mod poll;
pub mod runner;
pub mod spawn;
pub mod stream;

pub use channel::{read_channel_stream, write_channel_future, Channel, TryRecvError, TrySendError};
pub use combinators::{
    collect, concat, continue_with, flatten_streams, map_future, on_destroy, stream_from_future,
    stream_of, AllOk, Collector, StatusOrVec, ToFutureChecked,
};
pub use eventfd::OwnedEventFd;
pub use future::{Future, FutureImpl};
pub use periodic::PeriodicTask;
pub use poll::{Handle, HandleSet, Poll, PollContext};
pub use runner::{LocalTaskRunner, Task, TaskRunner};
pub use spawn::{
    spawn_future, spawn_result_future, spawn_result_stream, ResultSpawnHandle, SpawnHandle,
    RESULT_SPAWN_CHANNEL_CAPACITY,
};
pub use stream::{Stream, StreamImpl};
