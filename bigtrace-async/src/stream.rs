//! Type-erased, single-use `Stream<T>` trait object. See [`crate::future`]
//! for the future-side counterpart; the same "boxed closure, no Pin"
//! design applies here.

use crate::poll::{Poll, PollContext};
use std::collections::VecDeque;

/// Object-safe poll primitive backing [`Stream<T>`].
pub trait StreamImpl<T>: Send {
    /// `Poll::Ready(None)` means `Done`; must not be called again after.
    fn poll_next(&mut self, cx: &mut PollContext<'_>) -> Poll<Option<T>>;
}

impl<T, F> StreamImpl<T> for F
where
    F: FnMut(&mut PollContext<'_>) -> Poll<Option<T>> + Send,
{
    fn poll_next(&mut self, cx: &mut PollContext<'_>) -> Poll<Option<T>> {
        self(cx)
    }
}

/// A polymorphic value implementing `poll_next(ctx) -> {Pending, Item(T),
/// Done}`. Single-use: once `Done` is observed, further polls are a logic
/// error.
#[must_use = "streams do nothing unless polled or spawned"]
pub struct Stream<T> {
    inner: Box<dyn StreamImpl<T>>,
    done: bool,
}

impl<T> Stream<T> {
    pub fn new(imp: impl StreamImpl<T> + 'static) -> Self {
        Self {
            inner: Box::new(imp),
            done: false,
        }
    }

    pub fn from_fn(
        f: impl FnMut(&mut PollContext<'_>) -> Poll<Option<T>> + Send + 'static,
    ) -> Self {
        Self::new(f)
    }

    /// Yields `Done` immediately, registering no handles.
    pub fn empty() -> Self
    where
        T: Send + 'static,
    {
        Self::from_fn(|_cx| Poll::Ready(None))
    }

    /// Yields `value` then `Done`.
    pub fn of(value: T) -> Self
    where
        T: Send + 'static,
    {
        let mut slot = Some(value);
        Self::from_fn(move |_cx| Poll::Ready(slot.take()))
    }

    /// Yields each element of `iter` in order, then `Done`.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
    {
        let mut items: VecDeque<T> = iter.into_iter().collect();
        Self::from_fn(move |_cx| Poll::Ready(items.pop_front()))
    }

    pub fn poll_next(&mut self, cx: &mut PollContext<'_>) -> Poll<Option<T>> {
        debug_assert!(!self.done, "polled a Stream after it returned Done");
        let result = self.inner.poll_next(cx);
        if let Poll::Ready(None) = result {
            self.done = true;
        }
        result
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<T> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("done", &self.done).finish()
    }
}
