//! Shared execution state for cooperative cancellation.
//!
//! Every running script owns one [`RunState`]. The dispatcher holds a
//! clone so that `SCRIPT KILL` / `FUNCTION KILL` can flip it to
//! [`ExecutionState::Killed`] while the engine is running; engines are
//! required to poll it at safe points (at least on sleep primitives and at
//! loop iteration boundaries) and return promptly when they observe the
//! kill.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Indicates the status of a script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionState {
    /// The script is currently running.
    Executing = 0,
    /// Termination was requested; the engine must stop at its next safe point.
    Killed = 1,
    /// The run completed (successfully or with an error).
    Finished = 2,
}

impl ExecutionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ExecutionState::Executing,
            1 => ExecutionState::Killed,
            _ => ExecutionState::Finished,
        }
    }
}

/// Cloneable handle to the execution state shared between the dispatcher
/// and the engine running a script.
#[derive(Debug, Clone)]
pub struct RunState {
    inner: Arc<AtomicU8>,
}

impl RunState {
    /// Creates a fresh handle in the [`ExecutionState::Executing`] state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(ExecutionState::Executing as u8)),
        }
    }

    /// Reads the current state.
    pub fn load(&self) -> ExecutionState {
        ExecutionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Requests termination. Only an `Executing` run can be killed; returns
    /// `true` when the transition happened.
    pub fn kill(&self) -> bool {
        self.inner
            .compare_exchange(
                ExecutionState::Executing as u8,
                ExecutionState::Killed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the run finished.
    pub fn finish(&self) {
        self.inner
            .store(ExecutionState::Finished as u8, Ordering::Release);
    }

    /// Returns `true` when termination has been requested.
    pub fn is_killed(&self) -> bool {
        self.load() == ExecutionState::Killed
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_transition() {
        let state = RunState::new();
        assert_eq!(state.load(), ExecutionState::Executing);

        assert!(state.kill());
        assert!(state.is_killed());

        // A second kill is a no-op.
        assert!(!state.kill());
    }

    #[test]
    fn test_finished_run_cannot_be_killed() {
        let state = RunState::new();
        state.finish();
        assert!(!state.kill());
        assert_eq!(state.load(), ExecutionState::Finished);
    }

    #[test]
    fn test_clones_share_state() {
        let state = RunState::new();
        let other = state.clone();
        assert!(other.kill());
        assert!(state.is_killed());
    }
}
