//! The scripting-engine contract.
//!
//! Every language back-end plugs into the registry behind this trait. The
//! registry wraps each method call in a [`CallScope`] that installs the
//! engine's invocation context in a thread-local before the back-end runs
//! and clears it afterwards, on all exit paths. Interpreter-internal
//! callbacks (a `server.call` binding, a function-registration hook) reach
//! the server only through that scope.

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_core::{CommandRunner, ReplyValue, RunState};

use crate::error::ScriptingResult;
use crate::flags::{CommandFlags, ScriptFlags};

/// Distinguishes EVAL-style invocation from FCALL-style (library)
/// invocation. `All` is only meaningful for memory introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    /// Ad-hoc scripts admitted through EVAL / SCRIPT LOAD.
    Eval,
    /// Named library functions admitted through FUNCTION LOAD.
    Function,
    /// Both, for memory reporting.
    All,
}

/// A ready-to-invoke artifact produced by an engine's compile step.
///
/// The payload is opaque to everything but the engine that produced it; a
/// compiled function is only ever handed back to that engine.
pub struct CompiledFunction {
    /// Function name; required for library functions, absent for EVAL.
    pub name: Option<String>,
    /// Optional human description.
    pub description: Option<String>,
    /// Engine-owned payload.
    pub payload: Box<dyn Any + Send>,
    /// Script flags parsed at admission.
    pub flags: ScriptFlags,
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Memory attributed to an engine, per subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMemoryInfo {
    /// Bytes used by compiled scripts / loaded libraries.
    pub used_memory: usize,
    /// Fixed overhead of the engine itself.
    pub engine_memory_overhead: usize,
}

/// A runner shared with interpreter-internal callbacks for the duration of
/// one script run.
pub type SharedRunner = Arc<Mutex<dyn CommandRunner + Send>>;

/// The per-run server runtime context handed to [`ScriptingEngine::call`].
#[derive(Clone)]
pub struct RunCtx {
    /// Shared execution state polled by the engine at safe points.
    pub state: RunState,
    /// Which subsystem is invoking.
    pub subsystem: Subsystem,
    /// Effective command flags after folding the script's declaration.
    pub flags: CommandFlags,
    /// The run was requested through a read-only command variant.
    pub read_only: bool,
    /// Command execution seam bound to the engine's caller identity.
    pub runner: SharedRunner,
    dirty: Arc<AtomicBool>,
}

impl RunCtx {
    /// Creates a run context.
    pub fn new(
        state: RunState,
        subsystem: Subsystem,
        flags: CommandFlags,
        read_only: bool,
        runner: SharedRunner,
    ) -> Self {
        Self {
            state,
            subsystem,
            flags,
            read_only,
            runner,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Records that the script performed a write. Called by the server's
    /// command runner; a dirty script can no longer be killed.
    pub fn mark_write(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether the script has written to the dataset.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// A self-contained deferred-reset closure returned by
/// [`ScriptingEngine::reset_eval_env`].
pub type EnvReset = ember_core::TeardownJob;

/// The capability set every scripting back-end must implement.
pub trait ScriptingEngine {
    /// Compiles `code` for the given subsystem.
    ///
    /// For [`Subsystem::Eval`] the result contains exactly one element.
    /// For [`Subsystem::Function`] the back-end may produce zero or more
    /// named functions; `timeout` bounds the load step and the engine must
    /// abort with an error on expiry.
    fn compile(
        &mut self,
        subsystem: Subsystem,
        code: &str,
        timeout: Duration,
    ) -> ScriptingResult<Vec<CompiledFunction>>;

    /// Releases one compiled function.
    fn free_function(&mut self, subsystem: Subsystem, function: CompiledFunction);

    /// Runs a compiled function. The returned reply (or error) is
    /// materialized through the active caller context by the dispatcher.
    fn call(
        &mut self,
        run: &mut RunCtx,
        function: &CompiledFunction,
        subsystem: Subsystem,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> ScriptingResult<ReplyValue>;

    /// Bytes attributed to one compiled function.
    fn function_memory_overhead(&self, function: &CompiledFunction) -> usize;

    /// Discards all EVAL-compiled state.
    ///
    /// When `async_teardown` is set, returns a self-contained reset closure
    /// to run on the lazy-free worker; the engine must leave a functional
    /// replacement environment in place before returning. Otherwise the
    /// reset completes synchronously and nothing is returned.
    fn reset_eval_env(&mut self, async_teardown: bool) -> Option<EnvReset>;

    /// Memory introspection per subsystem.
    fn memory_info(&self, subsystem: Subsystem) -> EngineMemoryInfo;
}

/// Snapshot of the invocation context installed around engine calls.
#[derive(Clone)]
pub struct CallContext {
    /// Execution state of the current run.
    pub state: RunState,
    /// Runner bound to the engine's caller identity.
    pub runner: SharedRunner,
    /// Effective flags of the current run.
    pub flags: CommandFlags,
    /// Read-only run.
    pub read_only: bool,
    /// Dirty marker shared with the run context.
    dirty: Arc<AtomicBool>,
}

impl CallContext {
    /// Records a dataset write through the scope.
    pub fn mark_write(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

thread_local! {
    static CALL_SCOPE: RefCell<Vec<CallContext>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard installing the invocation context for the duration of an
/// engine method call. Nested scopes stack; the guard pops its own frame
/// on drop, on all exit paths including panics.
pub struct CallScope {
    _private: (),
}

impl CallScope {
    /// Installs `run`'s context as the current invocation context.
    pub fn enter(run: &RunCtx) -> Self {
        CALL_SCOPE.with(|scope| {
            scope.borrow_mut().push(CallContext {
                state: run.state.clone(),
                runner: run.runner.clone(),
                flags: run.flags,
                read_only: run.read_only,
                dirty: run.dirty.clone(),
            });
        });
        Self { _private: () }
    }

    /// Snapshot of the innermost installed context, if any.
    pub fn current() -> Option<CallContext> {
        CALL_SCOPE.with(|scope| scope.borrow().last().cloned())
    }

    /// The execution state of the innermost run, if any.
    pub fn current_state() -> Option<RunState> {
        Self::current().map(|ctx| ctx.state)
    }

    /// Runs `f` with the innermost runner, if a scope is installed.
    pub fn with_runner<R>(f: impl FnOnce(&mut dyn CommandRunner) -> R) -> Option<R> {
        let ctx = Self::current()?;
        let mut runner = match ctx.runner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(f(&mut *runner))
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        CALL_SCOPE.with(|scope| {
            scope.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ReplyValue;

    struct EchoRunner;

    impl CommandRunner for EchoRunner {
        fn execute(&mut self, argv: &[Vec<u8>]) -> ReplyValue {
            ReplyValue::Integer(argv.len() as i64)
        }
    }

    fn run_ctx() -> RunCtx {
        RunCtx::new(
            RunState::new(),
            Subsystem::Eval,
            CommandFlags::eval_base(),
            false,
            Arc::new(Mutex::new(EchoRunner)),
        )
    }

    #[test]
    fn test_scope_installs_and_clears() {
        assert!(CallScope::current().is_none());
        let run = run_ctx();
        {
            let _scope = CallScope::enter(&run);
            assert!(CallScope::current().is_some());
            let reply = CallScope::with_runner(|runner| runner.execute(&[b"PING".to_vec()]));
            assert_eq!(reply, Some(ReplyValue::Integer(1)));
        }
        assert!(CallScope::current().is_none());
    }

    #[test]
    fn test_nested_scopes_stack() {
        let outer = run_ctx();
        let inner = run_ctx();
        let _outer_scope = CallScope::enter(&outer);
        {
            let _inner_scope = CallScope::enter(&inner);
            let state = CallScope::current_state().unwrap();
            state.kill();
            assert!(inner.state.is_killed());
            assert!(!outer.state.is_killed());
        }
        // Inner frame popped; the outer context is visible again.
        assert!(CallScope::current_state().is_some());
    }

    #[test]
    fn test_dirty_marker_propagates_to_run_ctx() {
        let run = run_ctx();
        let _scope = CallScope::enter(&run);
        CallScope::current().unwrap().mark_write();
        assert!(run.is_dirty());
    }
}
