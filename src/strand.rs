//! Serialized execution contexts ("strands") and periodic timers built on
//! top of them.
//!
//! `spec.md` §5 models every component's callbacks as running on a single
//! process-wide serialized executor, with distinct subsystems (e.g. the
//! process monitor vs. the coordinator) allowed their own private strand.
//! The specification's own design notes (§9) say a correct implementation
//! "may model each strand as a single consumer thread draining a task
//! queue" -- that is exactly what [`Strand`] is: one worker thread per
//! strand, fed by an unbounded `crossbeam_channel`, the same channel crate
//! used for cross-thread handoff elsewhere in this kind of system (see
//! `DESIGN.md`).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::Sender;

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

struct StrandInner {
    sender: Sender<Task>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

/// A handle to a serialized execution context. Cheap to clone; all clones
/// share the same worker thread and task queue, so callbacks dispatched
/// from any clone never overlap each other.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    /// Spawns the strand's worker thread, named `name` for easier
    /// diagnostics (visible in thread dumps and panic messages).
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for task in receiver.iter() {
                    match task {
                        Task::Run(f) => f(),
                        Task::Stop => break,
                    }
                }
            })
            .expect("failed to spawn strand worker thread");
        Strand {
            inner: Arc::new(StrandInner {
                sender,
                join: Mutex::new(Some(join)),
            }),
        }
    }

    /// Queues `f` to run on the strand's worker thread. Never blocks the
    /// caller and never runs `f` inline. If the strand has already been
    /// stopped the task is dropped and a warning is logged -- this is a
    /// peer/environment condition (the strand shutting down under us), not
    /// a programmer error.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        if self.inner.sender.send(Task::Run(Box::new(f))).is_err() {
            log::warn!("dispatch onto a stopped strand was dropped");
        }
    }

    /// Stops the worker thread once it has drained any tasks already
    /// queued ahead of the stop request, and waits for it to exit.
    /// Idempotent: calling `stop` on an already-stopped strand is a no-op.
    pub fn stop(&self) {
        let _ = self.inner.sender.send(Task::Stop);
        if let Some(join) = self.inner.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

/// Completion status delivered to a [`PeriodicTimer`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The timer reached its expiration normally.
    Fired,
    /// The timer was stopped; this is the final callback invocation for
    /// this handle and must be treated as a no-op by the callback.
    Cancelled,
}

struct TimerState {
    strand: Strand,
    period: Duration,
    callback: Mutex<Box<dyn FnMut(TimerEvent) + Send>>,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
}

impl TimerState {
    fn deliver(&self, event: TimerEvent) {
        let mut callback = self.callback.lock().unwrap();
        (callback)(event);
    }
}

/// A periodic callback scheduled on a [`Strand`].
///
/// Each expiration re-arms itself for the next `period` automatically; the
/// only way to stop the recurrence is [`PeriodicTimer::stop`]. At most one
/// invocation of the callback is ever active at a time for a given handle,
/// because every invocation is dispatched onto the same strand.
pub struct PeriodicTimer {
    state: Arc<TimerState>,
    started: AtomicBool,
    scheduler: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PeriodicTimer {
    /// Builds a timer handle. The timer does not run until [`Self::start`]
    /// is called.
    pub fn new(
        strand: Strand,
        period: Duration,
        callback: impl FnMut(TimerEvent) + Send + 'static,
    ) -> Self {
        PeriodicTimer {
            state: Arc::new(TimerState {
                strand,
                period,
                callback: Mutex::new(Box::new(callback)),
                stopped: Mutex::new(false),
                stopped_cv: Condvar::new(),
            }),
            started: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        }
    }

    /// Arms the first expiration, `period` from now. Calling `start` more
    /// than once on the same handle has no additional effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let join = thread::spawn(move || Self::run_schedule_loop(state));
        *self.scheduler.lock().unwrap() = Some(join);
    }

    fn run_schedule_loop(state: Arc<TimerState>) {
        loop {
            let guard = state.stopped.lock().unwrap();
            if *guard {
                break;
            }
            let (guard, _timeout) = state.stopped_cv.wait_timeout(guard, state.period).unwrap();
            let stopped_now = *guard;
            drop(guard);
            if stopped_now {
                break;
            }
            let state_for_task = Arc::clone(&state);
            state.strand.dispatch(move || {
                // Re-check right before delivery: a stop() that raced with
                // the wait_timeout above must still downgrade this firing
                // to Cancelled rather than letting it through as Fired.
                let stopped_now = *state_for_task.stopped.lock().unwrap();
                let event = if stopped_now {
                    TimerEvent::Cancelled
                } else {
                    TimerEvent::Fired
                };
                state_for_task.deliver(event);
            });
        }
        let state_for_final = Arc::clone(&state);
        state.strand.dispatch(move || {
            state_for_final.deliver(TimerEvent::Cancelled);
        });
    }

    /// Cancels any pending expiration. Idempotent. The in-flight or next
    /// scheduled callback invocation (if any) still runs, but observes
    /// [`TimerEvent::Cancelled`] instead of [`TimerEvent::Fired`].
    pub fn stop(&self) {
        let mut guard = self.state.stopped.lock().unwrap();
        *guard = true;
        self.state.stopped_cv.notify_all();
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
        if let Some(join) = self.scheduler.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn dispatched_tasks_run_in_order_and_never_overlap() {
        let strand = Strand::new("test-strand");
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            strand.dispatch(move || tx.send(i).unwrap());
        }
        drop(tx);
        let received: Vec<i32> = rx.iter().collect();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
        strand.stop();
    }

    #[test]
    fn timer_fires_then_reports_cancelled_on_stop() {
        let strand = Strand::new("timer-strand");
        let (tx, rx) = mpsc::channel();
        let timer = PeriodicTimer::new(strand.clone(), Duration::from_millis(20), move |event| {
            tx.send(event).unwrap();
        });
        timer.start();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, TimerEvent::Fired);

        timer.stop();
        // Drain until we see the terminal Cancelled event; no Fired may
        // follow it.
        let mut saw_cancelled = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(200)) {
            if event == TimerEvent::Cancelled {
                saw_cancelled = true;
                break;
            }
        }
        assert!(saw_cancelled);
        drop(timer);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        strand.stop();
    }
}
