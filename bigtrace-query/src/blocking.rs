//! Background blocking-work thread pool. The core only requires
//! `post_task`; `post_cancellable` additionally wires a best-effort
//! interrupt hook for `TraceProcessorWrapper`.

use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub type BlockingTask = Box<dyn FnOnce() + Send>;

pub const DEFAULT_BLOCKING_POOL_THREADS: usize = 4;

/// Returned by [`BlockingPool::post_cancellable`]. Calling `cancel()` runs
/// the registered `on_cancel` hook at most once — immediately if the task
/// has not started yet, or concurrently with an already-running task as an
/// interrupt signal (the pool does not forcibly terminate worker threads;
/// it is the task's job to observe the interrupt and stop promptly).
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    on_cancel: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(f) = self.on_cancel.lock().take() {
            f();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// External collaborator contract: a place to run blocking work off the
/// task-runner thread.
pub trait BlockingPool: Send + Sync {
    fn post_task(&self, task: BlockingTask);

    fn post_cancellable(
        &self,
        task: BlockingTask,
        on_cancel: Box<dyn FnOnce() + Send>,
    ) -> CancelToken;
}

/// A minimal real thread pool: fixed worker count, unbounded work queue.
/// Workers exit once the pool (and every clone of its sender) is dropped.
pub struct FixedThreadPool {
    sender: crossbeam::channel::Sender<BlockingTask>,
}

impl FixedThreadPool {
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<BlockingTask>();
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("bigtrace-blocking-{i}"))
                .spawn(move || {
                    for task in receiver {
                        task();
                    }
                })
                .map(drop)
                .unwrap_or_else(|e| debug!(error = %e, "failed to spawn blocking pool worker"));
        }
        Self { sender }
    }
}

impl Default for FixedThreadPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKING_POOL_THREADS)
    }
}

impl BlockingPool for FixedThreadPool {
    fn post_task(&self, task: BlockingTask) {
        if self.sender.send(task).is_err() {
            debug!("blocking pool task dropped: no worker threads left");
        }
    }

    fn post_cancellable(
        &self,
        task: BlockingTask,
        on_cancel: Box<dyn FnOnce() + Send>,
    ) -> CancelToken {
        let cancelled = Arc::new(AtomicBool::new(false));
        let on_cancel_slot = Arc::new(Mutex::new(Some(on_cancel)));
        let token = CancelToken {
            cancelled: cancelled.clone(),
            on_cancel: on_cancel_slot.clone(),
        };
        let job: BlockingTask = Box::new(move || {
            if cancelled.load(Ordering::SeqCst) {
                if let Some(f) = on_cancel_slot.lock().take() {
                    f();
                }
                return;
            }
            task();
        });
        self.post_task(job);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_posted_task() {
        let pool = FixedThreadPool::new(1);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        pool.post_task(Box::new(move || flag.store(true, Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_dispatch_runs_on_cancel_instead() {
        let pool = FixedThreadPool::new(0);
        let ran = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let ran_task = ran.clone();
        let cancelled_hook = cancelled.clone();
        let token = pool.post_cancellable(
            Box::new(move || {
                ran_task.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move || {
                cancelled_hook.fetch_add(1, Ordering::SeqCst);
            }),
        );
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
