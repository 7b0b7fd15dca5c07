//! Stream/future combinators: `map_future`, `concat`, `flatten_streams`,
//! `collect` (with the `AllOk`/`ToFutureChecked`/`StatusOrVec` collectors),
//! `on_destroy`, `continue_with`, `stream_from_future`, `stream_of`.
//!
//! None of these spawn tasks or acquire additional threads; each just
//! composes the `poll`/`poll_next` of its inputs.

use crate::future::Future;
use crate::poll::{Poll, PollContext};
use crate::stream::Stream;

/// For each item of `s`, runs `f(item)` producing a future and yields its
/// result. At most one mapping future is in flight at a time.
pub fn map_future<A, B>(
    mut s: Stream<A>,
    mut f: impl FnMut(A) -> Future<B> + Send + 'static,
) -> Stream<B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let mut pending: Option<Future<B>> = None;
    Stream::from_fn(move |cx: &mut PollContext<'_>| loop {
        if let Some(fut) = pending.as_mut() {
            match fut.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(b) => {
                    pending = None;
                    return Poll::Ready(Some(b));
                }
            }
        }
        match s.poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Ready(Some(a)) => pending = Some(f(a)),
        }
    })
}

/// Drains `s1` to `Done`, then polls `s2`. Pending propagates through
/// either half.
pub fn concat<T>(s1: Stream<T>, s2: Stream<T>) -> Stream<T>
where
    T: Send + 'static,
{
    let mut first = Some(s1);
    let mut second = s2;
    Stream::from_fn(move |cx: &mut PollContext<'_>| loop {
        if let Some(s) = first.as_mut() {
            match s.poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(v)) => return Poll::Ready(Some(v)),
                Poll::Ready(None) => {
                    first = None;
                    continue;
                }
            }
        }
        return second.poll_next(cx);
    })
}

/// Polls every non-done constituent stream on each call, in vector order.
/// Yields the first item found. Reports `Pending` only once every
/// constituent has either yielded nothing this pass or is already done,
/// with the union of their interest registered into `cx` (each substream
/// is polled against the very same handle sets, so registrations merge for
/// free). Reports `Done` only when all constituents report `Done`.
pub fn flatten_streams<T>(streams: Vec<Stream<T>>) -> Stream<T>
where
    T: Send + 'static,
{
    let mut streams = streams;
    Stream::from_fn(move |cx: &mut PollContext<'_>| {
        let mut all_done = true;
        for s in streams.iter_mut() {
            if s.is_done() {
                continue;
            }
            match s.poll_next(&mut cx.reborrow()) {
                Poll::Ready(Some(v)) => return Poll::Ready(Some(v)),
                Poll::Ready(None) => continue,
                Poll::Pending => all_done = false,
            }
        }
        if all_done {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    })
}

/// A `Stream<T>` that is already-`Done` but runs `f` when dropped. Used to
/// close a bound channel, or signal a processor interrupt, when upstream
/// tears down. `T` is never produced (the stream is immediately `Done`);
/// it is generic so the same destructor shape composes with `concat` next
/// to streams of any item type, not just `Stream<()>`.
pub fn on_destroy<T, F>(f: F) -> Stream<T>
where
    T: Send + 'static,
    F: FnOnce() + Send + 'static,
{
    Stream::new(OnDestroy {
        f: Some(f),
        _marker: std::marker::PhantomData,
    })
}

struct OnDestroy<T, F: FnOnce()> {
    f: Option<F>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, F: FnOnce()> Drop for OnDestroy<T, F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl<T, F> crate::stream::StreamImpl<T> for OnDestroy<T, F>
where
    T: Send,
    F: FnOnce() + Send,
{
    fn poll_next(&mut self, _cx: &mut PollContext<'_>) -> Poll<Option<T>> {
        Poll::Ready(None)
    }
}

/// After `f` completes with `v`, invokes `make(v)` which returns another
/// future, and becomes that future.
pub fn continue_with<A, B>(
    f: Future<A>,
    make: impl FnOnce(A) -> Future<B> + Send + 'static,
) -> Future<B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    enum Stage<A, B> {
        First(Future<A>),
        Second(Future<B>),
    }
    let mut stage = Stage::First(f);
    let mut make = Some(make);
    Future::from_fn(move |cx: &mut PollContext<'_>| loop {
        match &mut stage {
            Stage::First(fut) => match fut.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(a) => {
                    let make = make.take().expect("continue_with polled after completion");
                    stage = Stage::Second(make(a));
                    continue;
                }
            },
            Stage::Second(fut) => return fut.poll(cx),
        }
    })
}

/// A one-element stream whose single item is the future's value.
pub fn stream_from_future<T>(f: Future<T>) -> Stream<T>
where
    T: Send + 'static,
{
    enum St<T> {
        Waiting(Future<T>),
        Yielded,
    }
    let mut st = St::Waiting(f);
    Stream::from_fn(move |cx: &mut PollContext<'_>| match &mut st {
        St::Waiting(fut) => match fut.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(v) => {
                st = St::Yielded;
                Poll::Ready(Some(v))
            }
        },
        St::Yielded => Poll::Ready(None),
    })
}

/// A one-element stream yielding `value` then `Done`. Thin re-export of
/// [`Stream::of`] under the free-function name used elsewhere in this
/// crate.
pub fn stream_of<T>(value: T) -> Stream<T>
where
    T: Send + 'static,
{
    Stream::of(value)
}

/// Feeds every item of `s` to `collector`, producing a future of the
/// collector's result.
pub fn collect<T, C>(s: Stream<T>, collector: C) -> Future<C::Output>
where
    T: Send + 'static,
    C: Collector<T> + Send + 'static,
{
    let mut s = s;
    let mut collector = collector;
    Future::from_fn(move |cx: &mut PollContext<'_>| loop {
        match s.poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => return Poll::Ready(collector.finish()),
            Poll::Ready(Some(item)) => {
                if let Some(output) = collector.push(item) {
                    return Poll::Ready(output);
                }
            }
        }
    })
}

/// A fold over stream items. `push` returns `Some(output)` to
/// short-circuit before the stream is drained; otherwise `finish` is
/// called once the stream reports `Done`.
pub trait Collector<T> {
    type Output;
    fn push(&mut self, item: T) -> Option<Self::Output>;
    fn finish(&mut self) -> Self::Output;
}

/// Short-circuits `Ready(Err)` on the first non-ok item; otherwise
/// `Ready(Ok)` on `Done`.
#[derive(Default)]
pub struct AllOk<E> {
    _marker: std::marker::PhantomData<E>,
}

impl<E> AllOk<E> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E> Collector<Result<(), E>> for AllOk<E> {
    type Output = Result<(), E>;

    fn push(&mut self, item: Result<(), E>) -> Option<Self::Output> {
        match item {
            Ok(()) => None,
            Err(e) => Some(Err(e)),
        }
    }

    fn finish(&mut self) -> Self::Output {
        Ok(())
    }
}

/// Asserts exactly one item is produced and returns it.
#[derive(Default)]
pub struct ToFutureChecked<T> {
    item: Option<T>,
}

impl<T> ToFutureChecked<T> {
    pub fn new() -> Self {
        Self { item: None }
    }
}

impl<T> Collector<T> for ToFutureChecked<T> {
    type Output = T;

    fn push(&mut self, item: T) -> Option<Self::Output> {
        assert!(
            self.item.replace(item).is_none(),
            "ToFutureChecked stream produced more than one item"
        );
        None
    }

    fn finish(&mut self) -> Self::Output {
        self.item
            .take()
            .expect("ToFutureChecked stream completed without producing an item")
    }
}

/// Short-circuits on the first error; otherwise collects items into a
/// vector.
pub struct StatusOrVec<T, E> {
    items: Vec<T>,
    _marker: std::marker::PhantomData<E>,
}

impl<T, E> Default for StatusOrVec<T, E> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, E> StatusOrVec<T, E> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T, E> Collector<Result<T, E>> for StatusOrVec<T, E> {
    type Output = Result<Vec<T>, E>;

    fn push(&mut self, item: Result<T, E>) -> Option<Self::Output> {
        match item {
            Ok(v) => {
                self.items.push(v);
                None
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn finish(&mut self) -> Self::Output {
        Ok(std::mem::take(&mut self.items))
    }
}
