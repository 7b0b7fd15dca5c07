//! Bounded, single-producer-single-consumer queue with readable/writable
//! fd signaling.
//!
//! The buffer and the two readiness handles are updated together under one
//! lock so the "fd readability is edge-consistent with internal state"
//! invariant holds at every observable point — there is no window where a
//! reader could observe a stale handle. This keeps the two eventfds moving
//! in lockstep with the buffer, which a lock-free ring buffer alone
//! wouldn't give us.

use crate::eventfd::OwnedEventFd;
use crate::future::Future;
use crate::poll::{Handle, Poll};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::{error, fmt, io};

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A bounded FIFO with capacity >= 1, one writer and one reader.
pub struct Channel<T> {
    inner: Mutex<Inner<T>>,
    read_handle: OwnedEventFd,
    write_handle: OwnedEventFd,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> io::Result<Self> {
        assert!(capacity >= 1, "Channel capacity must be at least 1");
        let read_handle = OwnedEventFd::new()?;
        let write_handle = OwnedEventFd::new()?;
        // empty, open: read not ready, write ready (has capacity).
        write_handle.set()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            read_handle,
            write_handle,
        })
    }

    /// Becomes readable when the channel is non-empty OR closed.
    pub fn read_handle(&self) -> Handle {
        self.read_handle.as_raw_fd()
    }

    /// Becomes readable when the channel has free capacity OR closed.
    pub fn write_handle(&self) -> Handle {
        self.write_handle.as_raw_fd()
    }

    /// Attempt to enqueue `v` without blocking. On `Err(TrySendError::Full)`
    /// or `Err(TrySendError::Closed)`, `v` is returned to the caller
    /// untouched.
    pub fn write_nonblocking(&self, v: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TrySendError::Closed(v));
        }
        if inner.queue.len() >= inner.capacity {
            return Err(TrySendError::Full(v));
        }
        inner.queue.push_back(v);
        let _ = self.read_handle.set();
        if inner.queue.len() >= inner.capacity {
            let _ = self.write_handle.clear();
        }
        Ok(())
    }

    /// Attempt to dequeue without blocking.
    pub fn read_nonblocking(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.lock();
        match inner.queue.pop_front() {
            Some(v) => {
                // Freeing a slot always restores write-readiness,
                // regardless of whether the channel is closed.
                let _ = self.write_handle.set();
                if inner.queue.is_empty() && !inner.closed {
                    let _ = self.read_handle.clear();
                }
                Ok(v)
            }
            None => {
                if inner.closed {
                    Err(TryRecvError::Closed)
                } else {
                    Err(TryRecvError::Empty)
                }
            }
        }
    }

    /// Idempotent. Transitions both ends to "ready" permanently; buffered
    /// items remain readable until drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let _ = self.read_handle.set();
        let _ = self.write_handle.set();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A future that retries a non-blocking write until it succeeds, waiting
/// on the channel's write handle in between. Mirrors the source's
/// `WriteChannelFuture`: writing into a channel that has already been
/// closed by its own owning pipeline is a programming error, not a
/// recoverable condition, because the only writer side of one of these
/// channels is the spawn machinery that also owns the close.
pub fn write_channel_future<T>(channel: Arc<Channel<T>>, value: T) -> Future<()>
where
    T: Send + 'static,
{
    let mut slot = Some(value);
    Future::from_fn(move |cx| {
        let v = slot
            .take()
            .expect("write_channel_future polled after completion");
        match channel.write_nonblocking(v) {
            Ok(()) => Poll::Ready(()),
            Err(TrySendError::Full(v)) => {
                slot = Some(v);
                cx.register_interested(channel.write_handle());
                Poll::Pending
            }
            Err(TrySendError::Closed(_)) => {
                panic!("write_channel_future: channel closed while a write was in flight")
            }
        }
    })
}

/// A stream over a channel's reader side: yields items as they arrive,
/// `Done` once the channel is closed and drained. Mirrors the source's
/// `ReadChannelStream`.
pub fn read_channel_stream<T>(channel: Arc<Channel<T>>) -> Stream<T>
where
    T: Send + 'static,
{
    Stream::from_fn(move |cx| match channel.read_nonblocking() {
        Ok(v) => Poll::Ready(Some(v)),
        Err(TryRecvError::Empty) => {
            cx.register_interested(channel.read_handle());
            Poll::Pending
        }
        Err(TryRecvError::Closed) => Poll::Ready(None),
    })
}

#[derive(Debug)]
pub enum TrySendError<T> {
    /// The buffer is full; `is_closed == false`.
    Full(T),
    /// The channel is closed; `is_closed == true`.
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel is full"),
            TrySendError::Closed(_) => write!(f, "channel is closed"),
        }
    }
}

impl<T: fmt::Debug> error::Error for TrySendError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "channel is empty"),
            TryRecvError::Closed => write!(f, "channel is closed"),
        }
    }
}

impl error::Error for TryRecvError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_element_buffer() {
        let ch: Channel<i32> = Channel::new(1).unwrap();
        assert!(!ch.read_handle_ready());
        assert!(ch.write_handle_ready());

        ch.write_nonblocking(1).unwrap();
        assert!(ch.read_handle_ready());
        assert!(!ch.write_handle_ready());

        assert_eq!(ch.read_nonblocking().unwrap(), 1);
        assert!(!ch.read_handle_ready());
        assert!(ch.write_handle_ready());
    }

    #[test]
    fn multi_element_buffer() {
        let ch: Channel<i32> = Channel::new(2).unwrap();
        ch.write_nonblocking(1).unwrap();
        assert!(ch.read_handle_ready());
        assert!(ch.write_handle_ready());
        ch.write_nonblocking(2).unwrap();
        assert!(ch.read_handle_ready());
        assert!(!ch.write_handle_ready());

        assert_eq!(ch.read_nonblocking().unwrap(), 1);
        assert!(ch.write_handle_ready());
        assert_eq!(ch.read_nonblocking().unwrap(), 2);
        assert!(!ch.read_handle_ready());
    }

    #[test]
    fn close_empty_channel() {
        let ch: Channel<i32> = Channel::new(1).unwrap();
        ch.close();
        assert!(ch.read_handle_ready());
        assert!(ch.write_handle_ready());
        assert_eq!(ch.read_nonblocking().unwrap_err(), TryRecvError::Closed);
    }

    #[test]
    fn write_does_not_move_if_full() {
        let ch: Channel<Box<i32>> = Channel::new(1).unwrap();
        ch.write_nonblocking(Box::new(1)).unwrap();
        let v = Box::new(2);
        let err = ch.write_nonblocking(v).unwrap_err();
        assert!(!err.is_closed());
        // the caller gets the exact same value back, untouched.
        assert_eq!(*err.into_inner(), 2);
        assert_eq!(*ch.read_nonblocking().unwrap(), 1);
    }

    #[test]
    fn read_after_close() {
        let ch: Channel<i32> = Channel::new(2).unwrap();
        ch.write_nonblocking(1).unwrap();
        ch.close();
        assert_eq!(ch.read_nonblocking().unwrap(), 1);
        assert_eq!(ch.read_nonblocking().unwrap_err(), TryRecvError::Closed);
    }

    #[test]
    fn write_after_close() {
        let ch: Channel<i32> = Channel::new(1).unwrap();
        ch.close();
        let err = ch.write_nonblocking(7).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn empty_closed_channel() {
        let ch: Channel<i32> = Channel::new(4).unwrap();
        ch.close();
        assert!(ch.read_handle_ready());
        assert!(ch.write_handle_ready());
    }

    #[test]
    fn full_closed_channel() {
        let ch: Channel<i32> = Channel::new(1).unwrap();
        ch.write_nonblocking(1).unwrap();
        ch.close();
        assert!(ch.read_handle_ready());
        assert!(ch.write_handle_ready());
        assert_eq!(ch.read_nonblocking().unwrap(), 1);
        assert_eq!(ch.read_nonblocking().unwrap_err(), TryRecvError::Closed);
    }

    impl<T> Channel<T> {
        fn read_handle_ready(&self) -> bool {
            self.read_handle.is_ready()
        }
        fn write_handle_ready(&self) -> bool {
            self.write_handle.is_ready()
        }
    }
}
