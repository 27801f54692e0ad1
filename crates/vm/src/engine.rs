//! The hello engine: the scripting-engine contract over the minimal VM.

use std::time::{Duration, Instant};

use ember_core::ReplyValue;
use ember_scripting::{
    CompiledFunction, EngineMemoryInfo, EnvReset, RunCtx, ScriptFlags, ScriptingEngine,
    ScriptingError, ScriptingResult, Subsystem,
};
use tracing::debug;

use crate::instruction::Instruction;
use crate::limits::HelloLimits;
use crate::program::{self, HelloProgram};
use crate::stack::EvalStack;

/// Name the engine registers under.
pub const ENGINE_NAME: &str = "hello";

/// How often `SLEEP` polls the shared execution state.
const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default, Clone, Copy)]
struct SideAccounting {
    live_functions: usize,
    used_memory: usize,
}

/// The minimal stack-VM back-end.
pub struct HelloEngine {
    limits: HelloLimits,
    /// The last program compiled for the FUNCTION subsystem. Replaced
    /// wholesale on recompile; compiled functions carry their own copies.
    program: Option<HelloProgram>,
    eval: SideAccounting,
    function: SideAccounting,
}

impl HelloEngine {
    /// Creates an engine with the default limits.
    pub fn new() -> Self {
        Self::with_limits(HelloLimits::default())
    }

    /// Creates an engine with custom limits.
    pub fn with_limits(limits: HelloLimits) -> Self {
        Self {
            limits,
            program: None,
            eval: SideAccounting::default(),
            function: SideAccounting::default(),
        }
    }

    fn side_mut(&mut self, subsystem: Subsystem) -> &mut SideAccounting {
        match subsystem {
            Subsystem::Function => &mut self.function,
            _ => &mut self.eval,
        }
    }

    fn execute(
        &self,
        run: &mut RunCtx,
        function: &crate::program::HelloFunction,
        args: &[Vec<u8>],
    ) -> ScriptingResult<u32> {
        let mut stack = EvalStack::new(self.limits.max_stack);
        for instruction in &function.instructions {
            match instruction {
                Instruction::ConstI(value) => stack.push(*value)?,
                Instruction::Args(index) => {
                    let raw = args.get(*index as usize).ok_or_else(|| {
                        ScriptingError::runtime(format!(
                            "ARGS index {index} out of range ({} arguments)",
                            args.len()
                        ))
                    })?;
                    let value = std::str::from_utf8(raw)
                        .ok()
                        .and_then(|text| text.parse::<u32>().ok())
                        .ok_or_else(|| {
                            ScriptingError::runtime(format!(
                                "argument {index} is not an unsigned integer"
                            ))
                        })?;
                    stack.push(value)?;
                }
                Instruction::Sleep => {
                    let seconds = stack.pop()?;
                    let deadline = Instant::now() + Duration::from_secs(u64::from(seconds));
                    while Instant::now() < deadline {
                        if run.state.is_killed() {
                            return Err(ScriptingError::killed_eval());
                        }
                        std::thread::sleep(SLEEP_POLL_INTERVAL);
                    }
                }
                Instruction::Return => return stack.pop(),
            }
        }
        Err(ScriptingError::runtime(format!(
            "function {} ended without RETURN",
            function.name
        )))
    }
}

impl Default for HelloEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptingEngine for HelloEngine {
    fn compile(
        &mut self,
        subsystem: Subsystem,
        code: &str,
        _timeout: Duration,
    ) -> ScriptingResult<Vec<CompiledFunction>> {
        let parsed = program::parse(code, &self.limits)?;
        if subsystem == Subsystem::Eval && parsed.functions.len() != 1 {
            return Err(ScriptingError::compile(format!(
                "EVAL scripts must define exactly one function, got {}",
                parsed.functions.len()
            )));
        }

        if subsystem == Subsystem::Function {
            // Recompiling replaces the engine-side program wholesale; the
            // previously handed-out functions are released one by one
            // through free_function by their owners.
            if self.program.is_some() {
                debug!("hello engine: resetting program before recompile");
            }
            self.program = Some(parsed.clone());
        }

        let side = self.side_mut(subsystem);
        let mut compiled = Vec::with_capacity(parsed.functions.len());
        for function in parsed.functions {
            let bytes = function.name.len()
                + function.instructions.len() * std::mem::size_of::<Instruction>();
            side.live_functions += 1;
            side.used_memory += bytes;
            compiled.push(CompiledFunction {
                name: Some(function.name.clone()),
                description: None,
                payload: Box::new(function),
                flags: ScriptFlags::empty(),
            });
        }
        Ok(compiled)
    }

    fn free_function(&mut self, subsystem: Subsystem, function: CompiledFunction) {
        if let Some(parsed) = function.payload.downcast_ref::<crate::program::HelloFunction>() {
            let bytes =
                parsed.name.len() + parsed.instructions.len() * std::mem::size_of::<Instruction>();
            let side = self.side_mut(subsystem);
            side.live_functions = side.live_functions.saturating_sub(1);
            side.used_memory = side.used_memory.saturating_sub(bytes);
        }
    }

    fn call(
        &mut self,
        run: &mut RunCtx,
        function: &CompiledFunction,
        _subsystem: Subsystem,
        _keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> ScriptingResult<ReplyValue> {
        let parsed = function
            .payload
            .downcast_ref::<crate::program::HelloFunction>()
            .ok_or_else(|| {
                ScriptingError::runtime("compiled function does not belong to the hello engine")
            })?;
        let value = self.execute(run, parsed, args)?;
        Ok(ReplyValue::Integer(i64::from(value)))
    }

    fn function_memory_overhead(&self, function: &CompiledFunction) -> usize {
        function
            .payload
            .downcast_ref::<crate::program::HelloFunction>()
            .map(|parsed| {
                std::mem::size_of::<crate::program::HelloFunction>()
                    + parsed.name.len()
                    + parsed.instructions.len() * std::mem::size_of::<Instruction>()
            })
            .unwrap_or(0)
    }

    fn reset_eval_env(&mut self, async_teardown: bool) -> Option<EnvReset> {
        let discarded = std::mem::take(&mut self.eval);
        if async_teardown {
            Some(Box::new(move || {
                drop(discarded);
            }))
        } else {
            None
        }
    }

    fn memory_info(&self, subsystem: Subsystem) -> EngineMemoryInfo {
        let used_memory = match subsystem {
            Subsystem::Eval => self.eval.used_memory,
            Subsystem::Function => self.function.used_memory,
            Subsystem::All => self.eval.used_memory + self.function.used_memory,
        };
        EngineMemoryInfo {
            used_memory,
            engine_memory_overhead: std::mem::size_of::<Self>()
                + self
                    .program
                    .as_ref()
                    .map(|program| program.byte_size())
                    .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{CommandRunner, RunState};
    use ember_scripting::CommandFlags;
    use std::sync::{Arc, Mutex};

    struct NullRunner;

    impl CommandRunner for NullRunner {
        fn execute(&mut self, _argv: &[Vec<u8>]) -> ReplyValue {
            ReplyValue::Null
        }
    }

    fn run_ctx() -> RunCtx {
        RunCtx::new(
            RunState::new(),
            Subsystem::Eval,
            CommandFlags::eval_base(),
            false,
            Arc::new(Mutex::new(NullRunner)),
        )
    }

    fn compile_one(engine: &mut HelloEngine, code: &str) -> CompiledFunction {
        engine
            .compile(Subsystem::Eval, code, Duration::from_millis(500))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_const_return() {
        let mut engine = HelloEngine::new();
        let function = compile_one(&mut engine, "FUNCTION f CONSTI 42 RETURN");
        let mut run = run_ctx();
        let reply = engine
            .call(&mut run, &function, Subsystem::Eval, &[], &[])
            .unwrap();
        assert_eq!(reply, ReplyValue::Integer(42));
    }

    #[test]
    fn test_args_instruction() {
        let mut engine = HelloEngine::new();
        let function = compile_one(&mut engine, "FUNCTION f ARGS 0 RETURN");
        let mut run = run_ctx();
        let reply = engine
            .call(&mut run, &function, Subsystem::Eval, &[], &[b"7".to_vec()])
            .unwrap();
        assert_eq!(reply, ReplyValue::Integer(7));

        let err = engine
            .call(&mut run, &function, Subsystem::Eval, &[], &[])
            .unwrap_err();
        assert!(matches!(err, ScriptingError::Runtime { .. }));

        let err = engine
            .call(&mut run, &function, Subsystem::Eval, &[], &[b"x".to_vec()])
            .unwrap_err();
        assert!(matches!(err, ScriptingError::Runtime { .. }));
    }

    #[test]
    fn test_eval_requires_single_function() {
        let mut engine = HelloEngine::new();
        let err = engine
            .compile(
                Subsystem::Eval,
                "FUNCTION a RETURN FUNCTION b RETURN",
                Duration::from_millis(500),
            )
            .unwrap_err();
        assert!(matches!(err, ScriptingError::Compile { .. }));
    }

    #[test]
    fn test_function_subsystem_multiple_blocks() {
        let mut engine = HelloEngine::new();
        let functions = engine
            .compile(
                Subsystem::Function,
                "FUNCTION a CONSTI 1 RETURN FUNCTION b CONSTI 2 RETURN",
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name.as_deref(), Some("a"));
        assert_eq!(functions[1].name.as_deref(), Some("b"));
    }

    #[test]
    fn test_recompile_resets_program() {
        let mut engine = HelloEngine::new();
        let first = engine
            .compile(
                Subsystem::Function,
                "FUNCTION a CONSTI 1 RETURN",
                Duration::from_millis(500),
            )
            .unwrap();
        for function in first {
            engine.free_function(Subsystem::Function, function);
        }
        let second = engine
            .compile(
                Subsystem::Function,
                "FUNCTION b CONSTI 2 RETURN",
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(engine.function.live_functions, 1);
    }

    #[test]
    fn test_sleep_exits_promptly_on_kill() {
        let mut engine = HelloEngine::new();
        let function = compile_one(&mut engine, "FUNCTION f CONSTI 5 SLEEP CONSTI 0 RETURN");
        let mut run = run_ctx();
        let state = run.state.clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            state.kill();
            Instant::now()
        });

        let started = Instant::now();
        let err = engine
            .call(&mut run, &function, Subsystem::Eval, &[], &[])
            .unwrap_err();
        let returned = Instant::now();
        assert!(matches!(err, ScriptingError::Killed { .. }));

        let kill_time = killer.join().unwrap();
        // The poll interval is 1ms; allow generous scheduler jitter.
        assert!(returned.duration_since(kill_time) < Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stack_overflow_reported() {
        let mut engine = HelloEngine::with_limits(HelloLimits {
            max_functions: 16,
            max_instructions: 256,
            max_stack: 2,
        });
        let function = compile_one(&mut engine, "FUNCTION f CONSTI 1 CONSTI 2 CONSTI 3 RETURN");
        let mut run = run_ctx();
        let err = engine
            .call(&mut run, &function, Subsystem::Eval, &[], &[])
            .unwrap_err();
        assert!(matches!(err, ScriptingError::Runtime { .. }));
    }

    #[test]
    fn test_memory_info_tracks_sides() {
        let mut engine = HelloEngine::new();
        let function = compile_one(&mut engine, "FUNCTION f CONSTI 1 RETURN");
        assert!(engine.memory_info(Subsystem::Eval).used_memory > 0);
        assert_eq!(engine.memory_info(Subsystem::Function).used_memory, 0);
        assert!(engine.function_memory_overhead(&function) > 0);

        engine.free_function(Subsystem::Eval, function);
        assert_eq!(engine.memory_info(Subsystem::Eval).used_memory, 0);
    }

    #[test]
    fn test_reset_eval_env_modes() {
        let mut engine = HelloEngine::new();
        let _function = compile_one(&mut engine, "FUNCTION f CONSTI 1 RETURN");
        assert!(engine.reset_eval_env(false).is_none());
        assert_eq!(engine.memory_info(Subsystem::Eval).used_memory, 0);

        let _function = compile_one(&mut engine, "FUNCTION g CONSTI 1 RETURN");
        let reset = engine.reset_eval_env(true);
        assert!(reset.is_some());
        assert_eq!(engine.memory_info(Subsystem::Eval).used_memory, 0);
        if let Some(reset) = reset {
            reset();
        }
    }
}
