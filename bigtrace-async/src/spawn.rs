//! Spawner / `PolledFuture`: drives a future to completion against a
//! [`TaskRunner`], bridging readiness-handle callbacks to re-polls, with
//! cancellation on [`SpawnHandle`] drop.

use crate::channel::{read_channel_stream, write_channel_future, Channel};
use crate::combinators::{collect, concat, map_future, on_destroy, stream_from_future, Collector};
use crate::future::Future;
use crate::poll::{Handle, HandleSet, Poll, PollContext};
use crate::runner::{Task, TaskRunner};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Channel capacity used by [`spawn_result_stream`]/[`spawn_result_future`].
pub const RESULT_SPAWN_CHANNEL_CAPACITY: usize = 4;

struct Inner<T> {
    future: Option<Future<T>>,
    watched: HandleSet,
    pending_ready: HandleSet,
    repoll_posted: bool,
}

/// RAII token owning a heap-allocated, runner-driven future. Dropping the
/// handle schedules cancellation: the driving task, when next run on the
/// runner thread, drops the inner future (triggering any `on_destroy`
/// stream hooks) and unregisters handles. Cancellation is therefore
/// asynchronous.
pub struct SpawnHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for SpawnHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Spawns `future` (a `Future<()>`) on `runner`. The future's value is
/// discarded; only completion/cancellation matters.
pub fn spawn_future(runner: Arc<dyn TaskRunner>, future: Future<()>) -> SpawnHandle {
    let inner = Arc::new(Mutex::new(Inner {
        future: Some(future),
        watched: HandleSet::new(),
        pending_ready: HandleSet::new(),
        repoll_posted: false,
    }));

    {
        let runner = runner.clone();
        let inner = inner.clone();
        runner.post_task(Box::new(move || poll_once(runner, inner, HandleSet::new())));
    }

    let cancel_runner = runner;
    let cancel_inner = inner;
    SpawnHandle {
        cancel: Some(Box::new(move || {
            let runner_for_task = cancel_runner.clone();
            cancel_runner.post_task(Box::new(move || cancel(runner_for_task, cancel_inner)));
        })),
    }
}

fn poll_once<T: Send + 'static>(
    runner: Arc<dyn TaskRunner>,
    inner: Arc<Mutex<Inner<T>>>,
    ready: HandleSet,
) {
    let mut guard = inner.lock();
    let result = match guard.future.as_mut() {
        Some(fut) => {
            let mut interested = HandleSet::new();
            let mut cx = PollContext::new(&mut interested, &ready);
            let r = fut.poll(&mut cx);
            Some((r, interested))
        }
        None => None,
    };

    let (result, interested) = match result {
        Some(v) => v,
        None => return, // already cancelled/completed
    };

    match result {
        Poll::Ready(_) => {
            guard.future = None;
            let watched = std::mem::take(&mut guard.watched);
            drop(guard);
            for h in watched {
                runner.remove_handle_watch(h);
            }
        }
        Poll::Pending => {
            debug_assert!(
                !interested.is_empty(),
                "future returned Pending without registering any handle"
            );
            let previously_watched = std::mem::replace(&mut guard.watched, interested.clone());
            drop(guard);
            for h in previously_watched.difference(&interested) {
                runner.remove_handle_watch(*h);
            }
            // The runner's watch fires at most once and is then removed, so
            // every still-interested handle has to be re-registered on
            // every Pending poll, not only the newly-interested ones —
            // otherwise a handle that stays interested across two
            // consecutive polls goes unwatched after its first wake.
            for h in interested.iter() {
                watch_handle(runner.clone(), inner.clone(), *h);
            }
        }
    }
}

fn watch_handle<T: Send + 'static>(
    runner: Arc<dyn TaskRunner>,
    inner: Arc<Mutex<Inner<T>>>,
    handle: Handle,
) {
    let watch_runner = runner.clone();
    let watch_inner = inner.clone();
    runner.add_handle_watch(
        handle,
        Box::new(move || {
            let mut should_post = false;
            {
                let mut guard = watch_inner.lock();
                guard.pending_ready.insert(handle);
                if !guard.repoll_posted {
                    guard.repoll_posted = true;
                    should_post = true;
                }
            }
            if should_post {
                schedule_repoll(watch_runner, watch_inner);
            }
        }),
    );
}

fn schedule_repoll<T: Send + 'static>(runner: Arc<dyn TaskRunner>, inner: Arc<Mutex<Inner<T>>>) {
    let post_runner = runner.clone();
    runner.post_task(Box::new(move || {
        let ready = {
            let mut guard = inner.lock();
            guard.repoll_posted = false;
            std::mem::take(&mut guard.pending_ready)
        };
        poll_once(post_runner, inner, ready);
    }));
}

fn cancel<T>(runner: Arc<dyn TaskRunner>, inner: Arc<Mutex<Inner<T>>>) {
    let (dropped_future, watched) = {
        let mut guard = inner.lock();
        (guard.future.take(), std::mem::take(&mut guard.watched))
    };
    for h in watched {
        runner.remove_handle_watch(h);
    }
    debug!("spawn cancelled, dropping driven future");
    drop(dropped_future);
}

/// Composes a [`SpawnHandle`] with a shared [`Channel<T>`]: the consumer
/// gets a stream-like endpoint for values produced by a spawned
/// stream/future, consumable from any thread.
pub struct ResultSpawnHandle<T> {
    handle: SpawnHandle,
    channel: Arc<Channel<T>>,
}

impl<T: Send + 'static> ResultSpawnHandle<T> {
    /// A fresh stream over the channel's reader side. Intended to be
    /// called once; the channel has a single logical reader.
    pub fn stream(&self) -> Stream<T> {
        read_channel_stream(self.channel.clone())
    }

    pub fn channel(&self) -> &Arc<Channel<T>> {
        &self.channel
    }

    /// Drop the [`SpawnHandle`] explicitly, leaving the channel consumable
    /// until drained (per the "up to capacity-4 further items" boundary
    /// behavior).
    pub fn cancel(self) -> Arc<Channel<T>> {
        drop(self.handle);
        self.channel
    }
}

struct AllVoid;

impl Collector<()> for AllVoid {
    type Output = ();
    fn push(&mut self, _item: ()) -> Option<()> {
        None
    }
    fn finish(&mut self) {}
}

/// Drives `original` to completion, writing each item into a capacity-4
/// channel and closing it when the driving future tears down (whether by
/// natural completion or cancellation): `original.map(write_to_channel)
/// .concat(on_destroy(close_channel)).collect(AllVoid)`.
pub fn spawn_result_stream<T>(
    runner: Arc<dyn TaskRunner>,
    original: Stream<T>,
) -> io::Result<ResultSpawnHandle<T>>
where
    T: Send + 'static,
{
    let channel = Arc::new(Channel::<T>::new(RESULT_SPAWN_CHANNEL_CAPACITY)?);

    let write_channel = channel.clone();
    let mapped: Stream<()> = map_future(original, move |item| {
        write_channel_future(write_channel.clone(), item)
    });

    let close_channel = channel.clone();
    let closer: Stream<()> = on_destroy(move || close_channel.close());

    let composed = concat(mapped, closer);
    let driven: Future<()> = collect(composed, AllVoid);

    let handle = spawn_future(runner, driven);
    Ok(ResultSpawnHandle { handle, channel })
}

/// `spawn_result_stream` over a one-shot future instead of a stream.
pub fn spawn_result_future<T>(
    runner: Arc<dyn TaskRunner>,
    original: Future<T>,
) -> io::Result<ResultSpawnHandle<T>>
where
    T: Send + 'static,
{
    spawn_result_stream(runner, stream_from_future(original))
}
