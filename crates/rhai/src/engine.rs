//! The rhai-backed scripting engine.
//!
//! Two interpreter instances are kept side by side: `eval_rt` runs ad-hoc
//! EVAL scripts (with the debugging hook installed), `lib_rt` runs
//! FUNCTION libraries. Resetting the EVAL environment swaps out the
//! EVAL-side script registry and never disturbs loaded libraries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_core::ReplyValue;
use ember_scripting::debugger::{self, DebugTarget, LineAction};
use ember_scripting::{
    CallScope, CompiledFunction, EngineMemoryInfo, EnvReset, RunCtx, ScriptFlags,
    ScriptingEngine, ScriptingError, ScriptingResult, Subsystem,
};
use rhai::debugger::{DebuggerCommand, DebuggerEvent};
use rhai::{Array, Dynamic, Engine, EvalAltResult, EvalContext, FnPtr, Scope, AST};
use tracing::debug;

use crate::convert::{dynamic_to_debug, dynamic_to_reply};
use crate::server_api::{
    self, LoadContext, ABORT_TOKEN, KILL_TOKEN, LOAD_TIMEOUT_TOKEN,
};

/// Name the engine registers under; also the built-in default engine.
pub const ENGINE_NAME: &str = "rhai";

/// EVAL payload: a handle into the engine-private script registry.
struct EvalScript {
    id: u64,
    ast: Arc<AST>,
    src_bytes: usize,
}

/// FUNCTION payload: the library AST plus the registered callback.
struct LibFunction {
    ast: Arc<AST>,
    callback: FnPtr,
    src_bytes: usize,
}

/// The rhai back-end.
pub struct RhaiScriptEngine {
    eval_rt: Engine,
    lib_rt: Engine,
    /// Interpreter-private registry of EVAL-compiled routines.
    eval_scripts: HashMap<u64, (Arc<AST>, usize)>,
    next_script_id: u64,
    function_count: usize,
    function_bytes: usize,
}

fn build_engine(debug_hooks: bool) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(128, 128);
    engine.set_max_call_levels(64);
    engine.disable_symbol("eval");
    engine.on_progress(server_api::progress_hook);
    engine.register_static_module("server", server_api::server_module().into());
    if debug_hooks {
        engine.register_debugger(
            |_, dbg| dbg,
            |mut context, event, _node, _source, pos| {
                if !debugger::session_active() || server_api::fragment_guard_active() {
                    return Ok(DebuggerCommand::Continue);
                }
                match event {
                    DebuggerEvent::Start | DebuggerEvent::Step => {}
                    DebuggerEvent::End => return Ok(DebuggerCommand::Continue),
                    _ => return Ok(DebuggerCommand::Next),
                }
                let Some(line) = pos.line() else {
                    return Ok(DebuggerCommand::Next);
                };
                let mut target = RhaiTarget {
                    context: &mut context,
                };
                match debugger::debug_line_hook(&mut target, line as u32) {
                    LineAction::Continue => Ok(DebuggerCommand::Next),
                    LineAction::Abort => Err(EvalAltResult::ErrorTerminated(
                        Dynamic::from(ABORT_TOKEN.to_string()),
                        pos,
                    )
                    .into()),
                }
            },
        );
    }
    engine
}

/// Debugger introspection over the live evaluation context.
struct RhaiTarget<'r, 'a, 's, 'ps, 'g, 'c, 't> {
    context: &'r mut EvalContext<'a, 's, 'ps, 'g, 'c, 't>,
}

impl DebugTarget for RhaiTarget<'_, '_, '_, '_, '_, '_, '_> {
    fn locals(&mut self, name: Option<&str>) -> Vec<(String, debugger::printer::DebugValue)> {
        self.context
            .scope()
            .iter()
            .filter(|(var, _, _)| name.map_or(true, |want| *var == want))
            .map(|(var, _, value)| (var.to_string(), dynamic_to_debug(&value)))
            .collect()
    }

    fn eval_fragment(&mut self, code: &str) -> Result<debugger::printer::DebugValue, String> {
        let _guard = server_api::FragmentGuard::enter();
        let engine = self.context.engine();
        engine
            .eval_with_scope::<Dynamic>(self.context.scope_mut(), code)
            .map(|value| dynamic_to_debug(&value))
            .map_err(|err| err.to_string())
    }

    fn backtrace(&mut self) -> Vec<String> {
        let frames: Vec<String> = self
            .context
            .global_runtime_state()
            .debugger()
            .call_stack()
            .iter()
            .rev()
            .map(|frame| format!("in {frame}"))
            .collect();
        if frames.is_empty() {
            vec!["in top-level chunk".to_string()]
        } else {
            frames
        }
    }

    fn server_command(&mut self, argv: &[Vec<u8>]) -> ReplyValue {
        CallScope::with_runner(|runner| runner.execute(argv))
            .unwrap_or_else(|| ReplyValue::Error("ERR no active script caller".to_string()))
    }
}

fn bytes_to_array(values: &[Vec<u8>]) -> Array {
    values
        .iter()
        .map(|raw| Dynamic::from(String::from_utf8_lossy(raw).into_owned()))
        .collect()
}

fn terminated_token(err: &EvalAltResult) -> Option<String> {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => Some(token.to_string()),
        _ => None,
    }
}

fn map_runtime_err(err: Box<EvalAltResult>) -> ScriptingError {
    match terminated_token(&err).as_deref() {
        Some(KILL_TOKEN) => ScriptingError::killed_eval(),
        Some(ABORT_TOKEN) => ScriptingError::runtime("Script aborted for user request."),
        _ => ScriptingError::runtime(format!("user_script: {err}")),
    }
}

impl RhaiScriptEngine {
    /// Creates the engine with hardened interpreter settings.
    pub fn new() -> Self {
        Self {
            eval_rt: build_engine(true),
            lib_rt: build_engine(false),
            eval_scripts: HashMap::new(),
            next_script_id: 1,
            function_count: 0,
            function_bytes: 0,
        }
    }

    fn compile_eval(&mut self, code: &str) -> ScriptingResult<Vec<CompiledFunction>> {
        let ast = self
            .eval_rt
            .compile(code)
            .map_err(|err| ScriptingError::compile(err.to_string()))?;
        let ast = Arc::new(ast);
        let id = self.next_script_id;
        self.next_script_id += 1;
        self.eval_scripts.insert(id, (ast.clone(), code.len()));
        Ok(vec![CompiledFunction {
            name: None,
            description: None,
            payload: Box::new(EvalScript {
                id,
                ast,
                src_bytes: code.len(),
            }),
            flags: ScriptFlags::empty(),
        }])
    }

    fn compile_library(
        &mut self,
        code: &str,
        timeout: Duration,
    ) -> ScriptingResult<Vec<CompiledFunction>> {
        let ast = self
            .lib_rt
            .compile(code)
            .map_err(|err| ScriptingError::compile(err.to_string()))?;

        // Run the top level under the load budget; the only permitted
        // side effect is server::register_function.
        let load = LoadContext::open(Instant::now() + timeout);
        let result = self
            .lib_rt
            .eval_ast_with_scope::<Dynamic>(&mut Scope::new(), &ast);
        let registrations = load.finish();

        if let Err(err) = result {
            if terminated_token(&err).as_deref() == Some(LOAD_TIMEOUT_TOKEN) {
                return Err(ScriptingError::LoadTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            return Err(ScriptingError::runtime(format!("user_script: {err}")));
        }
        if registrations.is_empty() {
            return Err(ScriptingError::NoFunctionsRegistered);
        }

        let ast = Arc::new(ast);
        let mut compiled = Vec::with_capacity(registrations.len());
        for pending in registrations {
            self.function_count += 1;
            self.function_bytes += code.len();
            compiled.push(CompiledFunction {
                name: Some(pending.name),
                description: pending.description,
                payload: Box::new(LibFunction {
                    ast: ast.clone(),
                    callback: pending.callback,
                    src_bytes: code.len(),
                }),
                flags: pending.flags,
            });
        }
        Ok(compiled)
    }
}

impl Default for RhaiScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptingEngine for RhaiScriptEngine {
    fn compile(
        &mut self,
        subsystem: Subsystem,
        code: &str,
        timeout: Duration,
    ) -> ScriptingResult<Vec<CompiledFunction>> {
        match subsystem {
            Subsystem::Eval => self.compile_eval(code),
            Subsystem::Function => self.compile_library(code, timeout),
            Subsystem::All => Err(ScriptingError::invalid_arguments(
                "compile requires the EVAL or FUNCTION subsystem",
            )),
        }
    }

    fn free_function(&mut self, _subsystem: Subsystem, function: CompiledFunction) {
        if let Some(script) = function.payload.downcast_ref::<EvalScript>() {
            self.eval_scripts.remove(&script.id);
        } else if let Some(lib) = function.payload.downcast_ref::<LibFunction>() {
            self.function_count = self.function_count.saturating_sub(1);
            self.function_bytes = self.function_bytes.saturating_sub(lib.src_bytes);
        }
    }

    fn call(
        &mut self,
        run: &mut RunCtx,
        function: &CompiledFunction,
        subsystem: Subsystem,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> ScriptingResult<ReplyValue> {
        // The registry installs the scope as well; this inner frame keeps
        // the engine correct when driven directly.
        let _scope = CallScope::enter(run);
        match subsystem {
            Subsystem::Eval => {
                let script = function.payload.downcast_ref::<EvalScript>().ok_or_else(|| {
                    ScriptingError::runtime("compiled function does not belong to this engine")
                })?;
                let mut scope = Scope::new();
                scope.push("KEYS", bytes_to_array(keys));
                scope.push("ARGV", bytes_to_array(args));
                self.eval_rt
                    .eval_ast_with_scope::<Dynamic>(&mut scope, &script.ast)
                    .map(|value| dynamic_to_reply(&value))
                    .map_err(map_runtime_err)
            }
            Subsystem::Function => {
                let lib = function.payload.downcast_ref::<LibFunction>().ok_or_else(|| {
                    ScriptingError::runtime("compiled function does not belong to this engine")
                })?;
                let keys_array = bytes_to_array(keys);
                let args_array = bytes_to_array(args);
                lib.callback
                    .call::<Dynamic>(&self.lib_rt, &lib.ast, (keys_array, args_array))
                    .map(|value| dynamic_to_reply(&value))
                    .map_err(map_runtime_err)
            }
            Subsystem::All => Err(ScriptingError::runtime(
                "call requires the EVAL or FUNCTION subsystem",
            )),
        }
    }

    fn function_memory_overhead(&self, function: &CompiledFunction) -> usize {
        if let Some(script) = function.payload.downcast_ref::<EvalScript>() {
            std::mem::size_of::<EvalScript>() + script.src_bytes
        } else if let Some(lib) = function.payload.downcast_ref::<LibFunction>() {
            std::mem::size_of::<LibFunction>() + lib.src_bytes
        } else {
            0
        }
    }

    fn reset_eval_env(&mut self, async_teardown: bool) -> Option<EnvReset> {
        let discarded = std::mem::take(&mut self.eval_scripts);
        debug!(scripts = discarded.len(), "rhai EVAL environment reset");
        if async_teardown {
            Some(Box::new(move || {
                drop(discarded);
            }))
        } else {
            None
        }
    }

    fn memory_info(&self, subsystem: Subsystem) -> EngineMemoryInfo {
        let eval_bytes: usize = self
            .eval_scripts
            .values()
            .map(|(_, src_bytes)| src_bytes)
            .sum();
        let used_memory = match subsystem {
            Subsystem::Eval => eval_bytes,
            Subsystem::Function => self.function_bytes,
            Subsystem::All => eval_bytes + self.function_bytes,
        };
        EngineMemoryInfo {
            used_memory,
            engine_memory_overhead: std::mem::size_of::<Self>()
                + 2 * std::mem::size_of::<Engine>(),
        }
    }
}
