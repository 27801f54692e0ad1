//! The `server` module exposed to scripts.
//!
//! Scripts reach the data store through `server::call` / `server::pcall`
//! under the engine's caller identity, installed by the registry's call
//! scope. `server::register_function` is only honored during a FUNCTION
//! LOAD; `server::breakpoint` and `server::debug` are inert when no debug
//! session is active.

use std::cell::{Cell, RefCell};
use std::time::Instant;

use ember_scripting::debugger;
use ember_scripting::{CallScope, ScriptFlags};
use rhai::{Dynamic, EvalAltResult, FnPtr, Map, Module, Position};

use crate::convert::{dynamic_to_cmd_arg, dynamic_to_debug, reply_to_dynamic};

/// A function registration collected while a library loads.
pub struct PendingFunction {
    /// Required function name.
    pub name: String,
    /// Optional human description.
    pub description: Option<String>,
    /// The script callback invoked by FCALL.
    pub callback: FnPtr,
    /// Declared function flags.
    pub flags: ScriptFlags,
}

thread_local! {
    static LOAD_CTX: RefCell<Option<Vec<PendingFunction>>> = const { RefCell::new(None) };
    static LOAD_DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
    static FRAGMENT_GUARD: Cell<bool> = const { Cell::new(false) };
}

/// Progress-hook token observed when the shared execution state flips to
/// killed.
pub const KILL_TOKEN: &str = "EMBER-KILLED";
/// Progress-hook token observed when a library load exceeds its budget.
pub const LOAD_TIMEOUT_TOKEN: &str = "EMBER-LOAD-TIMEOUT";
/// Termination token produced when the debugger aborts the script.
pub const ABORT_TOKEN: &str = "EMBER-DEBUG-ABORT";

/// Opens the load context for one FUNCTION LOAD, arming the deadline.
/// Closing the guard yields the collected registrations.
pub struct LoadContext {
    _private: (),
}

impl LoadContext {
    /// Opens the scope.
    pub fn open(deadline: Instant) -> Self {
        LOAD_CTX.with(|ctx| *ctx.borrow_mut() = Some(Vec::new()));
        LOAD_DEADLINE.set(Some(deadline));
        Self { _private: () }
    }

    /// Closes the scope and returns what the library registered.
    pub fn finish(self) -> Vec<PendingFunction> {
        LOAD_DEADLINE.set(None);
        LOAD_CTX.with(|ctx| ctx.borrow_mut().take()).unwrap_or_default()
    }
}

impl Drop for LoadContext {
    fn drop(&mut self) {
        LOAD_DEADLINE.set(None);
        LOAD_CTX.with(|ctx| ctx.borrow_mut().take());
    }
}

/// Whether a debugger-prompt fragment evaluation is in progress. The
/// debugging hook must stay out of the way while one runs.
pub fn fragment_guard_active() -> bool {
    FRAGMENT_GUARD.get()
}

/// RAII guard marking a debugger-prompt fragment evaluation.
pub struct FragmentGuard {
    _private: (),
}

impl FragmentGuard {
    /// Arms the guard.
    pub fn enter() -> Self {
        FRAGMENT_GUARD.set(true);
        Self { _private: () }
    }
}

impl Drop for FragmentGuard {
    fn drop(&mut self) {
        FRAGMENT_GUARD.set(false);
    }
}

/// The progress hook shared by both interpreter instances: polls the
/// shared execution state for cancellation and the load deadline during
/// FUNCTION LOAD.
pub fn progress_hook(_operations: u64) -> Option<Dynamic> {
    if let Some(state) = CallScope::current_state() {
        if state.is_killed() {
            return Some(Dynamic::from(KILL_TOKEN.to_string()));
        }
    }
    if let Some(deadline) = LOAD_DEADLINE.get() {
        if Instant::now() >= deadline {
            return Some(Dynamic::from(LOAD_TIMEOUT_TOKEN.to_string()));
        }
    }
    None
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

fn server_call(args: Vec<Dynamic>, raise_errors: bool) -> Result<Dynamic, Box<EvalAltResult>> {
    let mut argv = Vec::with_capacity(args.len());
    for arg in &args {
        argv.push(dynamic_to_cmd_arg(arg).map_err(runtime_error)?);
    }
    let reply = CallScope::with_runner(|runner| runner.execute(&argv))
        .ok_or_else(|| runtime_error("server.call is only available while a script runs"))?;
    if raise_errors {
        if let ember_core::ReplyValue::Error(message) = &reply {
            return Err(runtime_error(message.clone()));
        }
    }
    Ok(reply_to_dynamic(&reply))
}

fn register_function_map(definition: Map) -> Result<(), Box<EvalAltResult>> {
    let name = definition
        .get("name")
        .filter(|value| value.is_string())
        .map(|value| value.to_string())
        .ok_or_else(|| runtime_error("register_function: missing function name"))?;
    let callback = definition
        .get("callback")
        .cloned()
        .and_then(|value| value.try_cast::<FnPtr>())
        .ok_or_else(|| runtime_error("register_function: missing callback"))?;
    let description = definition
        .get("description")
        .filter(|value| value.is_string())
        .map(|value| value.to_string());

    let mut flags = ScriptFlags::empty();
    if let Some(list) = definition.get("flags") {
        let tokens = list
            .clone()
            .into_array()
            .map_err(|_| runtime_error("register_function: flags must be an array"))?;
        for token in tokens {
            let token = token.to_string();
            flags |= ScriptFlags::parse_token(&token)
                .map_err(|err| runtime_error(err.to_string()))?;
        }
    }

    push_registration(PendingFunction {
        name,
        description,
        callback,
        flags,
    })
}

fn push_registration(pending: PendingFunction) -> Result<(), Box<EvalAltResult>> {
    LOAD_CTX.with(|ctx| {
        let mut borrow = ctx.borrow_mut();
        match borrow.as_mut() {
            Some(collected) => {
                collected.push(pending);
                Ok(())
            }
            None => Err(runtime_error(
                "register_function can only be called during FUNCTION LOAD",
            )),
        }
    })
}

/// Builds the `server` module registered on both interpreter instances.
pub fn server_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("call", |a: Dynamic| server_call(vec![a], true));
    module.set_native_fn("call", |a: Dynamic, b: Dynamic| server_call(vec![a, b], true));
    module.set_native_fn("call", |a: Dynamic, b: Dynamic, c: Dynamic| {
        server_call(vec![a, b, c], true)
    });
    module.set_native_fn("call", |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
        server_call(vec![a, b, c, d], true)
    });
    module.set_native_fn(
        "call",
        |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic| {
            server_call(vec![a, b, c, d, e], true)
        },
    );

    module.set_native_fn("pcall", |a: Dynamic| server_call(vec![a], false));
    module.set_native_fn("pcall", |a: Dynamic, b: Dynamic| {
        server_call(vec![a, b], false)
    });
    module.set_native_fn("pcall", |a: Dynamic, b: Dynamic, c: Dynamic| {
        server_call(vec![a, b, c], false)
    });
    module.set_native_fn("pcall", |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
        server_call(vec![a, b, c, d], false)
    });
    module.set_native_fn(
        "pcall",
        |a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic| {
            server_call(vec![a, b, c, d, e], false)
        },
    );

    // One-shot break on the next executable line; inert while no debug
    // session is active.
    module.set_native_fn("breakpoint", || -> Result<bool, Box<EvalAltResult>> {
        Ok(debugger::script_breakpoint())
    });

    module.set_native_fn("debug", |value: Dynamic| -> Result<(), Box<EvalAltResult>> {
        debugger::script_debug_log(dynamic_to_debug(&value));
        Ok(())
    });

    module.set_native_fn("register_function", register_function_map);
    module.set_native_fn("register_function", |name: Dynamic, callback: FnPtr| {
        let name = if name.is_string() {
            name.to_string()
        } else {
            return Err(runtime_error("register_function: missing function name"));
        };
        push_registration(PendingFunction {
            name,
            description: None,
            callback,
            flags: ScriptFlags::empty(),
        })
    });

    module.set_native_fn(
        "status_reply",
        |message: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            let mut map = Map::new();
            map.insert("ok".into(), message);
            Ok(Dynamic::from_map(map))
        },
    );
    module.set_native_fn(
        "error_reply",
        |message: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            let mut map = Map::new();
            map.insert("err".into(), message);
            Ok(Dynamic::from_map(map))
        },
    );

    module
}
