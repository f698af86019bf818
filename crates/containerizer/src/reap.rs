//! Bounded-escalation process reaping: give a child 10 seconds to exit on
//! its own, then SIGTERM and one more second, then SIGKILL.
//!
//! Ports `deimos.containerizer.watch_process`, which does this with a
//! `threading.Thread(target=p.wait)` joined with a timeout. `std::process::
//! Child::wait` has no timeout variant, so this polls `waitpid(..., WNOHANG)`
//! instead of spawning a joiner thread -- same escalation shape, no extra
//! thread.

use std::time::{Duration, Instant};

use log::{info, warn};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(10);
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Reap the process at `pid`, escalating from patience to SIGTERM to
/// SIGKILL. `label` is only used for logging. Swallows "no such process"
/// (the child may have already been reaped elsewhere) and any other error
/// polling for it, since a reap failure must never fail the verb that called
/// it (SPEC_FULL.md §4.7.1 step 15).
pub fn reap_with_escalation(pid: Pid, label: &str) {
    if poll_until(pid, TERM_GRACE) {
        return;
    }
    info!("{} (pid {}) still running after {:?}, sending SIGTERM", label, pid, TERM_GRACE);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        warn!("failed to send SIGTERM to {} (pid {}): {}", label, pid, e);
    }
    if poll_until(pid, KILL_GRACE) {
        return;
    }
    warn!("{} (pid {}) still running after SIGTERM, sending SIGKILL", label, pid);
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        warn!("failed to send SIGKILL to {} (pid {}): {}", label, pid, e);
    }
    let _ = waitpid(pid, None);
}

/// Poll `waitpid(pid, WNOHANG)` until the process exits or `budget` elapses.
/// Returns `true` if it exited within the budget.
fn poll_until(pid: Pid, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return true,
            Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => return true,
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}
