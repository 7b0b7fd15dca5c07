//! Poll context and OS-handle sets.
//!
//! Every leaf future/stream in this crate suspends by registering a raw
//! file descriptor as "interested" and returning [`Poll::Pending`]; the
//! driver (see [`crate::spawn`]) asks the task runner to watch that
//! descriptor and re-polls once the runner reports it ready. There is no
//! [`std::task::Waker`] anywhere in this module — readiness is carried
//! explicitly as a pair of handle sets rather than an opaque wake callback,
//! which is what lets a single poll tree (e.g. `flatten_streams`) merge the
//! interest of many substreams without each one needing its own waker.

use std::collections::HashSet;
use std::os::fd::RawFd;

/// An opaque OS readiness primitive. Always a raw Unix file descriptor on
/// this target.
pub type Handle = RawFd;

/// A set of handles, cheaply shared by value where needed (poll trees pass
/// `HashSet<Handle>` instances around when merging interest across
/// substreams).
pub type HandleSet = HashSet<Handle>;

/// The outcome of a single `poll`/`poll_next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll<T> {
    /// The operation has not yet completed; at least one handle must have
    /// been registered into the context's interested set before returning
    /// this variant (see [`PollContext::register_interested`]).
    Pending,
    /// The future/stream produced `T`. For a future this means it must not
    /// be polled again; for a stream it means "next item" and polling may
    /// continue.
    Ready(T),
}

impl<T> Poll<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Poll::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Poll::Ready(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Poll<U> {
        match self {
            Poll::Pending => Poll::Pending,
            Poll::Ready(v) => Poll::Ready(f(v)),
        }
    }
}

/// A move-only, borrow-only view threaded through a single poll call.
///
/// `interested` is the write side: a leaf registers any handle whose
/// readiness would let it make progress. `ready` is the read side: handles
/// the task runner has reported as ready since the previous poll. A
/// `PollContext` never outlives the poll call that constructed it.
pub struct PollContext<'a> {
    interested: &'a mut HandleSet,
    ready: &'a HandleSet,
}

impl<'a> PollContext<'a> {
    pub fn new(interested: &'a mut HandleSet, ready: &'a HandleSet) -> Self {
        Self { interested, ready }
    }

    /// Register a single handle as interesting. Idempotent.
    pub fn register_interested(&mut self, handle: Handle) {
        self.interested.insert(handle);
    }

    /// Bulk-register a set of handles as interesting. Idempotent.
    pub fn register_all_interested(&mut self, handles: impl IntoIterator<Item = Handle>) {
        self.interested.extend(handles);
    }

    /// The read-only set of handles the runner reported ready for this poll.
    pub fn ready_handles(&self) -> &HandleSet {
        self.ready
    }

    pub fn is_ready(&self, handle: Handle) -> bool {
        self.ready.contains(&handle)
    }

    /// Shorten the borrow so the same underlying handle sets can be handed
    /// to several sub-polls in sequence (used by `flatten_streams`, which
    /// polls every constituent stream against the *same* interested/ready
    /// sets so their registrations naturally union).
    pub fn reborrow(&mut self) -> PollContext<'_> {
        PollContext {
            interested: self.interested,
            ready: self.ready,
        }
    }
}
