//! Polls a set of OS process ids and reports when one of them has exited.
//!
//! Grounded in `ProcessMonitorLinux.h` from the original sources: a
//! `boost::asio::strand`-owned `std::set<pid_t>`, mutated only via
//! `dispatch`, polled by a `steady_timer`. This module is the same shape,
//! built on [`crate::strand::Strand`] and [`crate::strand::PeriodicTimer`]
//! instead of `asio`.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::strand::{PeriodicTimer, Strand, TimerEvent};

/// A process id. `i32` matches POSIX `pid_t`; on Windows this is the
/// process id returned by `GetProcessId`.
pub type Pid = i32;

/// Whether a probed pid is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Dead,
    /// The probe itself failed for a reason other than "no such process"
    /// (e.g. a transient OS error). The pid stays monitored and is retried
    /// on the next tick, per `spec.md` §4.2.
    Indeterminate,
}

#[cfg(unix)]
fn probe(pid: Pid) -> Liveness {
    use nix::{
        errno::Errno,
        sys::signal::{self, Signal},
        unistd::Pid as NixPid,
    };
    // signal 0 performs no actual signalling, only existence/permission
    // checks -- the standard POSIX way to ask "does this pid exist".
    match signal::kill(NixPid::from_raw(pid), Option::<Signal>::None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(_other) => Liveness::Indeterminate,
    }
}

#[cfg(not(unix))]
fn probe(_pid: Pid) -> Liveness {
    // No portable process-existence probe is wired up for non-Unix targets
    // in this crate; treat as indeterminate so the pid is retried rather
    // than spuriously evicted. See DESIGN.md.
    Liveness::Indeterminate
}

struct State {
    monitored: Mutex<HashSet<Pid>>,
    on_exit: Box<dyn Fn(Pid) + Send + Sync>,
}

/// Monitors a dynamic set of pids, invoking a callback once per pid exit.
pub struct ProcessMonitor {
    strand: Strand,
    state: Arc<State>,
    timer: PeriodicTimer,
}

impl ProcessMonitor {
    pub fn new(
        strand: Strand,
        poll_period: Duration,
        on_exit: impl Fn(Pid) + Send + Sync + 'static,
    ) -> Self {
        let state = Arc::new(State {
            monitored: Mutex::new(HashSet::new()),
            on_exit: Box::new(on_exit),
        });

        let timer_state = Arc::clone(&state);
        let timer_strand = strand.clone();
        let timer = PeriodicTimer::new(timer_strand, poll_period, move |event| {
            if event == TimerEvent::Fired {
                Self::poll_once(&timer_state);
            }
        });
        timer.start();

        ProcessMonitor {
            strand,
            state,
            timer,
        }
    }

    fn poll_once(state: &Arc<State>) {
        // Collect the dead pids first so we don't hold the lock across the
        // user callback -- `on_exit` may itself want to touch other crate
        // state that also locks through the strand, and strand callbacks
        // never overlap themselves, but we still avoid the extra
        // reentrancy risk of calling out to user code under a private lock.
        let dead: Vec<Pid> = {
            let monitored = state.monitored.lock().unwrap();
            monitored
                .iter()
                .copied()
                .filter(|&pid| probe(pid) == Liveness::Dead)
                .collect()
        };
        for pid in dead {
            (state.on_exit)(pid);
            state.monitored.lock().unwrap().remove(&pid);
        }
    }

    /// Starts monitoring `pid`. Thread-safe; the actual set mutation is
    /// dispatched onto the monitor's strand.
    pub fn start_monitoring(&self, pid: Pid) {
        let state = Arc::clone(&self.state);
        self.strand.dispatch(move || {
            state.monitored.lock().unwrap().insert(pid);
        });
    }

    /// Stops monitoring `pid`. Thread-safe, dispatched onto the strand.
    pub fn stop_monitoring(&self, pid: Pid) {
        let state = Arc::clone(&self.state);
        self.strand.dispatch(move || {
            state.monitored.lock().unwrap().remove(&pid);
        });
    }

    /// Stops the polling timer. Any callback already in flight still
    /// completes; no further polls happen afterwards.
    pub fn stop(&self) {
        self.timer.stop();
    }
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    use std::process::Command;
    use std::sync::mpsc;

    use super::*;

    #[test]
    #[cfg(unix)]
    fn detects_exit_of_a_monitored_pid() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 0.05"])
            .spawn()
            .expect("failed to spawn test child process");
        let pid = child.id() as Pid;

        let (tx, rx) = mpsc::channel();
        let strand = Strand::new("process-monitor-test");
        let monitor = ProcessMonitor::new(strand.clone(), Duration::from_millis(20), move |p| {
            tx.send(p).unwrap();
        });
        monitor.start_monitoring(pid);

        let _ = child.wait();
        let seen = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seen, pid);

        monitor.stop();
        strand.stop();
    }

    #[test]
    #[cfg(unix)]
    fn probing_a_pid_that_never_existed_reports_dead() {
        // i32::MAX is never a real pid on any POSIX system we target.
        assert_eq!(probe(i32::MAX), Liveness::Dead);
    }
}
