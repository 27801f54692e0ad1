//! Forked debugger child bookkeeping.
//!
//! The parent retains the list of live forked-debugger PIDs so that
//! shutdown can terminate them and the reaper can account for them.

use std::sync::Mutex;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

static FORKED_CHILDREN: Lazy<Mutex<Vec<i32>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn with_children<R>(f: impl FnOnce(&mut Vec<i32>) -> R) -> R {
    let mut guard = match FORKED_CHILDREN.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

/// Records a freshly forked debugger child.
pub fn register(pid: i32) {
    with_children(|children| children.push(pid));
    debug!(pid, "forked debugger child registered");
}

/// Forgets a reaped child. Returns whether the PID was known.
pub fn remove(pid: i32) -> bool {
    with_children(|children| {
        let before = children.len();
        children.retain(|&p| p != pid);
        before != children.len()
    })
}

/// Number of live forked debugger children.
pub fn pending_count() -> usize {
    with_children(|children| children.len())
}

/// Terminates every live child and reaps it. Used at server shutdown.
pub fn kill_all() {
    let pids = with_children(std::mem::take);
    for pid in pids {
        let target = Pid::from_raw(pid);
        if let Err(err) = kill(target, Signal::SIGKILL) {
            warn!(pid, %err, "failed to kill forked debugger child");
            continue;
        }
        let _ = waitpid(target, None);
        debug!(pid, "forked debugger child terminated");
    }
}
