//! The task runner seam, plus a reference, Linux-only implementation.
//!
//! [`TaskRunner`] is the external collaborator this crate's core is
//! deliberately decoupled from — the spawner and periodic-task helper only
//! ever call `post_task`/`post_delayed_task`/`add_handle_watch`/
//! `remove_handle_watch` through this trait. Embedders with their own
//! reactor (tokio, a custom event loop) implement the trait themselves;
//! [`LocalTaskRunner`] exists so this crate is runnable and testable
//! standalone, giving a concrete poll(2)-backed implementation of
//! "something that calls back later".

use crate::poll::Handle;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send>;

/// Operations the async core needs from an external runner.
pub trait TaskRunner: Send + Sync {
    /// Enqueue `task` to run on the runner thread, FIFO with respect to
    /// other posted tasks.
    fn post_task(&self, task: Task);

    /// Enqueue `task` to run on the runner thread no sooner than `delay`
    /// from now.
    fn post_delayed_task(&self, task: Task, delay: Duration);

    /// Watch `handle` for readiness; `callback` fires at most once, the
    /// next time the runner observes `handle` ready, and the watch is
    /// then automatically removed (callers re-register if they still
    /// care).
    fn add_handle_watch(&self, handle: Handle, callback: Task);

    /// Remove a watch registered via `add_handle_watch`. A no-op if the
    /// handle isn't currently watched (e.g. its callback already fired).
    fn remove_handle_watch(&self, handle: Handle);
}

struct DelayedTask {
    due: Instant,
    task: Task,
}

#[derive(Default)]
struct State {
    tasks: VecDeque<Task>,
    watches: HashMap<Handle, Task>,
    delayed: Vec<DelayedTask>,
}

/// A single-threaded, `poll(2)`-backed reference [`TaskRunner`].
///
/// Not a general-purpose reactor: it exists to drive this crate's own
/// future/stream machinery in tests and small standalone programs. Real
/// deployments are expected to bridge to whatever reactor already owns the
/// process's event loop.
pub struct LocalTaskRunner {
    state: parking_lot::Mutex<State>,
}

impl LocalTaskRunner {
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(State::default()),
        }
    }

    /// Run posted tasks and fire ready handle watches until there is
    /// nothing left that can make progress *right now* (no further
    /// progress is possible without waiting on a handle or a delayed
    /// task's deadline).
    pub fn run_until_idle(&self) {
        loop {
            self.drain_tasks();
            if self.promote_due_delayed() {
                continue;
            }
            let handles = self.watched_handles();
            if handles.is_empty() {
                return;
            }
            let ready = poll_ready(&handles, 0);
            if ready.is_empty() {
                return;
            }
            self.fire_watches(&ready);
        }
    }

    /// Like [`Self::run_until_idle`] but blocks (using `poll(2)` with a
    /// real timeout) when idle and there is still a watched handle or a
    /// pending delayed task, instead of returning early. Returns once
    /// `is_done` reports true or there is truly nothing left to wait on.
    pub fn run_until(&self, mut is_done: impl FnMut() -> bool) {
        loop {
            self.run_until_idle();
            if is_done() {
                return;
            }
            let handles = self.watched_handles();
            let timeout_ms = self.next_delayed_timeout_ms();
            if handles.is_empty() {
                match timeout_ms {
                    Some(ms) => {
                        std::thread::sleep(Duration::from_millis(ms as u64));
                        continue;
                    }
                    None => {
                        warn!("LocalTaskRunner idle with no pending work but caller still waiting");
                        return;
                    }
                }
            }
            let ready = poll_ready(&handles, timeout_ms.unwrap_or(-1));
            self.fire_watches(&ready);
        }
    }

    fn drain_tasks(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                state.tasks.pop_front()
            };
            match task {
                Some(t) => t(),
                None => break,
            }
        }
    }

    /// Moves any delayed tasks whose deadline has passed into the FIFO
    /// queue. Returns `true` if at least one was promoted.
    fn promote_due_delayed(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut promoted = false;
        let mut remaining = Vec::with_capacity(state.delayed.len());
        for dt in state.delayed.drain(..) {
            if dt.due <= now {
                state.tasks.push_back(dt.task);
                promoted = true;
            } else {
                remaining.push(dt);
            }
        }
        state.delayed = remaining;
        promoted
    }

    fn next_delayed_timeout_ms(&self) -> Option<i32> {
        let state = self.state.lock();
        state
            .delayed
            .iter()
            .map(|dt| dt.due.saturating_duration_since(Instant::now()))
            .min()
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
    }

    fn watched_handles(&self) -> Vec<Handle> {
        self.state.lock().watches.keys().copied().collect()
    }

    fn fire_watches(&self, ready: &[Handle]) {
        for handle in ready {
            let callback = self.state.lock().watches.remove(handle);
            if let Some(cb) = callback {
                debug!(?handle, "handle watch fired");
                cb();
            }
        }
    }
}

impl Default for LocalTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for LocalTaskRunner {
    fn post_task(&self, task: Task) {
        self.state.lock().tasks.push_back(task);
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        self.state.lock().delayed.push(DelayedTask {
            due: Instant::now() + delay,
            task,
        });
    }

    fn add_handle_watch(&self, handle: Handle, callback: Task) {
        self.state.lock().watches.insert(handle, callback);
    }

    fn remove_handle_watch(&self, handle: Handle) {
        self.state.lock().watches.remove(&handle);
    }
}

fn poll_ready(handles: &[Handle], timeout_ms: i32) -> Vec<Handle> {
    if handles.is_empty() {
        return Vec::new();
    }
    let mut pfds: Vec<libc::pollfd> = handles
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
    if n <= 0 {
        return Vec::new();
    }
    pfds.iter()
        .filter(|p| p.revents & libc::POLLIN != 0)
        .map(|p| p.fd)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventfd::OwnedEventFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn posted_tasks_run_fifo() {
        let runner = LocalTaskRunner::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            runner.post_task(Box::new(move || order.lock().push(i)));
        }
        runner.run_until_idle();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn handle_watch_fires_once() {
        let runner = LocalTaskRunner::new();
        let fd = OwnedEventFd::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            runner.add_handle_watch(fd.as_raw_fd_for_test(), Box::new(move || {
                fired.store(true, Ordering::SeqCst);
            }));
        }
        runner.run_until_idle();
        assert!(!fired.load(Ordering::SeqCst));
        fd.set().unwrap();
        runner.run_until_idle();
        assert!(fired.load(Ordering::SeqCst));
    }

    impl OwnedEventFd {
        fn as_raw_fd_for_test(&self) -> Handle {
            use std::os::fd::AsRawFd;
            self.as_raw_fd()
        }
    }
}
