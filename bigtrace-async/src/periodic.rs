//! Periodic-task helper: runs a task on the task runner, then reschedules
//! itself every `period`. Keeps an "in-flight handle `Option`" to avoid
//! overlapping runs when one tick's spawned work is still in flight when
//! the next tick comes due.

use crate::combinators::continue_with;
use crate::future::Future;
use crate::runner::TaskRunner;
use crate::spawn::{spawn_future, SpawnHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct State {
    in_flight: Option<SpawnHandle>,
    stopped: bool,
}

struct Inner {
    runner: Arc<dyn TaskRunner>,
    period: Duration,
    make_task: Box<dyn Fn() -> Future<()> + Send + Sync>,
    state: Mutex<State>,
}

/// A recurring task. Dropping this handle does not stop the schedule —
/// call [`PeriodicTask::stop`] explicitly, the same way the spec's helper
/// separates `start`/`stop` from the handle's lifetime.
pub struct PeriodicTask {
    inner: Arc<Inner>,
}

impl PeriodicTask {
    /// Runs `make_task()` on `runner`, then reschedules itself every
    /// `period`. If `start_first_immediately`, the first run happens
    /// synchronously-via-post (no initial delay) rather than waiting one
    /// full period.
    pub fn start(
        runner: Arc<dyn TaskRunner>,
        period: Duration,
        start_first_immediately: bool,
        make_task: impl Fn() -> Future<()> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(Inner {
            runner,
            period,
            make_task: Box::new(make_task),
            state: Mutex::new(State {
                in_flight: None,
                stopped: false,
            }),
        });
        if start_first_immediately {
            let first = inner.clone();
            let runner = inner.runner.clone();
            runner.post_task(Box::new(move || run_tick(first)));
        } else {
            schedule_next(inner.clone());
        }
        Self { inner }
    }

    /// Cancels any pending reschedule and drops an in-flight spawn, if
    /// any.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        state.in_flight = None;
    }
}

fn run_tick(inner: Arc<Inner>) {
    {
        let state = inner.state.lock();
        if state.stopped {
            return;
        }
        if state.in_flight.is_some() {
            debug!("periodic task still in flight, skipping this tick");
            drop(state);
            schedule_next(inner);
            return;
        }
    }

    let task = (inner.make_task)();
    let clear_flag_inner = inner.clone();
    let wrapped = continue_with(task, move |()| {
        clear_flag_inner.state.lock().in_flight = None;
        Future::ready(())
    });
    let handle = spawn_future(inner.runner.clone(), wrapped);
    inner.state.lock().in_flight = Some(handle);
    schedule_next(inner);
}

fn schedule_next(inner: Arc<Inner>) {
    let period = inner.period;
    let runner = inner.runner.clone();
    runner.post_delayed_task(Box::new(move || run_tick(inner)), period);
}
