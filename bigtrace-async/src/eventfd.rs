//! RAII wrapper around a Linux `eventfd(2)` used purely as a readiness
//! signal (never as a counter transport) — the `read_handle`/`write_handle`
//! of [`crate::channel::Channel`].
//!
//! A small owned-handle type with `set`/`clear`/`is_ready`, built on the
//! cheapest level-triggered notification primitive Linux offers.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// An eventfd used in "semaphore-less" level-triggered mode: any non-zero
/// counter value means "ready"; `set` makes it ready, `clear` makes it not
/// ready. We never rely on the exact counter value, only on whether a read
/// of it would block.
pub struct OwnedEventFd(OwnedFd);

impl OwnedEventFd {
    /// Create a new eventfd, initially not-ready.
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd(2) with EFD_NONBLOCK returns an owned fd or -1.
        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a valid, just-created, uniquely-owned fd.
        Ok(Self(unsafe { OwnedFd::from_raw_fd(raw) }))
    }

    /// Make the handle ready (idempotent: setting an already-ready handle
    /// is a no-op as far as observers are concerned).
    pub fn set(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match n {
            n if n == std::mem::size_of::<u64>() as isize => Ok(()),
            _ => {
                let err = io::Error::last_os_error();
                // EAGAIN means the counter is already saturated/non-zero,
                // i.e. already ready: not an error for our purposes.
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => Ok(()),
                    _ => Err(err),
                }
            }
        }
    }

    /// Make the handle not-ready.
    pub fn clear(&self) -> io::Result<()> {
        let mut buf: u64 = 0;
        let n = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match n {
            n if n == std::mem::size_of::<u64>() as isize => Ok(()),
            _ => {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    // EAGAIN means the counter was already zero, i.e.
                    // already not-ready: not an error.
                    Some(libc::EAGAIN) => Ok(()),
                    _ => Err(err),
                }
            }
        }
    }

    /// Non-blocking readiness check via `poll(2)` with a zero timeout.
    pub fn is_ready(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.0.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd as *mut _, 1, 0) };
        n > 0 && (pfd.revents & libc::POLLIN) != 0
    }
}

impl AsRawFd for OwnedEventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl std::fmt::Debug for OwnedEventFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedEventFd")
            .field("fd", &self.0.as_raw_fd())
            .finish()
    }
}
