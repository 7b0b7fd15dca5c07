//! Type-erased, single-use `Future<T>` trait object.
//!
//! This is the Rust-idiomatic analogue of the source's `FuturePollable<T>`
//! PIMPL: a single virtual `poll` method, heap-owned, constructed from
//! closures rather than hand-written structs wherever the logic is simple
//! enough. Unlike `std::future::Future`, `poll` takes `&mut self` (no
//! `Pin` is required: every implementation here is boxed once and never
//! moved again, so there is no self-referential state to protect).

use crate::poll::{Poll, PollContext};

/// Object-safe poll primitive backing [`Future<T>`].
pub trait FutureImpl<T>: Send {
    /// Must not be called again after returning `Poll::Ready`.
    fn poll(&mut self, cx: &mut PollContext<'_>) -> Poll<T>;
}

impl<T, F> FutureImpl<T> for F
where
    F: FnMut(&mut PollContext<'_>) -> Poll<T> + Send,
{
    fn poll(&mut self, cx: &mut PollContext<'_>) -> Poll<T> {
        self(cx)
    }
}

/// A polymorphic value implementing `poll(ctx) -> {Pending, Ready(T)}`.
/// Single-use: once `Ready` is observed, further polls are a logic error.
#[must_use = "futures do nothing unless polled or spawned"]
pub struct Future<T> {
    inner: Box<dyn FutureImpl<T>>,
    done: bool,
}

impl<T> Future<T> {
    pub fn new(imp: impl FutureImpl<T> + 'static) -> Self {
        Self {
            inner: Box::new(imp),
            done: false,
        }
    }

    pub fn from_fn(f: impl FnMut(&mut PollContext<'_>) -> Poll<T> + Send + 'static) -> Self {
        Self::new(f)
    }

    /// A future that yields `value` on its first poll.
    pub fn ready(value: T) -> Self
    where
        T: Send + 'static,
    {
        let mut slot = Some(value);
        Self::from_fn(move |_cx| {
            Poll::Ready(slot.take().expect("Future::ready polled after completion"))
        })
    }

    pub fn poll(&mut self, cx: &mut PollContext<'_>) -> Poll<T> {
        debug_assert!(!self.done, "polled a Future after it returned Ready");
        let result = self.inner.poll(cx);
        if result.is_ready() {
            self.done = true;
        }
        result
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future").field("done", &self.done).finish()
    }
}
