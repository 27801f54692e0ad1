//! Execution dispatcher.
//!
//! Translates EVAL / EVALSHA / SCRIPT / FCALL / FUNCTION command shapes
//! into engine calls through the registry, drives the EVAL cache, folds
//! script flags into command flags for pre-execution policy checks, and
//! owns the running-script bookkeeping used by SCRIPT KILL.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ember_core::{digest, LazyFree, ReplyValue, RunState, TeardownJob};
use tracing::{debug, info};

use crate::cache::ScriptCache;
use crate::config::ScriptingConfig;
use crate::debugger::{self, DebugConnection, SessionStart};
use crate::engine::{RunCtx, ScriptingEngine, SharedRunner, Subsystem};
use crate::error::{ScriptingError, ScriptingResult};
use crate::flags::{fold_flags, CommandFlags, ScriptFlags};
use crate::library::FunctionLibrary;
use crate::registry::{EngineRegistry, ModuleHandle};
use crate::shebang;

/// Per-client script debug mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// Debugging disabled.
    #[default]
    No,
    /// Debug in the server process; mutations persist.
    Sync,
    /// Debug in a forked child; mutations are discarded.
    Forked,
}

/// Bookkeeping for the script currently on the main thread.
struct RunningScript {
    digest: Option<String>,
    function_call: bool,
    run: RunCtx,
    start: Instant,
}

/// Cloneable handle other clients use to kill the running script.
#[derive(Clone)]
pub struct ScriptKillHandle {
    running: Arc<Mutex<Option<RunningScript>>>,
}

impl ScriptKillHandle {
    /// Requests termination of the running script.
    pub fn kill(&self) -> ScriptingResult<ReplyValue> {
        let guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(running) = guard.as_ref() else {
            return Err(ScriptingError::NotBusy);
        };
        if running.run.is_dirty() {
            return Err(ScriptingError::Unkillable);
        }
        running.run.state.kill();
        info!(
            digest = running.digest.as_deref().unwrap_or("<function>"),
            elapsed_ms = running.start.elapsed().as_millis() as u64,
            "script kill requested"
        );
        Ok(ReplyValue::ok())
    }
}

/// Counters surfaced to INFO-style reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptingStats {
    /// Scripts compiled (EVAL admissions and SCRIPT LOAD).
    pub compiled_scripts: u64,
    /// EVAL-family calls dispatched.
    pub script_calls: u64,
    /// FCALL-family calls dispatched.
    pub function_calls: u64,
    /// LRU evictions from the EVAL cache.
    pub evicted_scripts: u64,
    /// Best-effort cache memory, in bytes.
    pub cache_memory_used: usize,
}

/// Outcome of an EVAL routed through the debugger.
#[derive(Debug, PartialEq, Eq)]
pub enum DebugSessionOutcome {
    /// Forked mode: the parent detached; `child` runs the session.
    Detached {
        /// PID of the forked session child.
        child: i32,
    },
    /// The session ran here and the final reply went out on the debug
    /// connection.
    Completed,
}

/// The scripting subsystem facade.
pub struct ScriptingSubsystem {
    config: ScriptingConfig,
    registry: EngineRegistry,
    cache: ScriptCache,
    library: FunctionLibrary,
    lazyfree: Arc<dyn LazyFree>,
    stats: ScriptingStats,
    running: Arc<Mutex<Option<RunningScript>>>,
    debug_mode: DebugMode,
    readonly_replica: bool,
    cluster_enabled: bool,
}

impl ScriptingSubsystem {
    /// Creates the subsystem.
    pub fn new(config: ScriptingConfig, lazyfree: Arc<dyn LazyFree>) -> Self {
        let cache = ScriptCache::new(config.max_cached_scripts);
        Self {
            config,
            registry: EngineRegistry::new(),
            cache,
            library: FunctionLibrary::new(),
            lazyfree,
            stats: ScriptingStats::default(),
            running: Arc::new(Mutex::new(None)),
            debug_mode: DebugMode::No,
            readonly_replica: false,
            cluster_enabled: false,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ScriptingConfig {
        &self.config
    }

    /// The engine registry.
    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// The EVAL cache.
    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    /// The named-function catalog.
    pub fn library(&self) -> &FunctionLibrary {
        &self.library
    }

    /// Marks this instance as a read-only replica.
    pub fn set_readonly_replica(&mut self, readonly: bool) {
        self.readonly_replica = readonly;
    }

    /// Marks this instance as running in cluster mode.
    pub fn set_cluster_enabled(&mut self, enabled: bool) {
        self.cluster_enabled = enabled;
    }

    /// The armed per-client debug mode.
    pub fn debug_mode(&self) -> DebugMode {
        self.debug_mode
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ScriptingStats {
        let mut stats = self.stats;
        stats.evicted_scripts = self.cache.evicted_scripts();
        stats.cache_memory_used = self.cache.memory_used();
        stats
    }

    /// Handle through which SCRIPT KILL / FUNCTION KILL reach the running
    /// script from another client.
    pub fn kill_handle(&self) -> ScriptKillHandle {
        ScriptKillHandle {
            running: self.running.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Engine lifecycle
    // ---------------------------------------------------------------------

    /// Installs an engine.
    pub fn register_engine(
        &mut self,
        name: &str,
        module: Option<ModuleHandle>,
        engine: Box<dyn ScriptingEngine>,
    ) -> ScriptingResult<()> {
        self.registry.register(name, module, engine)
    }

    /// Removes an engine. Refused while any cached script references it.
    /// The engine's library functions are dropped first, released through
    /// the engine itself.
    pub fn unregister_engine(&mut self, name: &str) -> ScriptingResult<()> {
        let key = name.to_ascii_lowercase();
        if self.cache.references_engine(&key) {
            return Err(ScriptingError::engine_busy(
                name,
                "cached scripts still reference it",
            ));
        }
        let functions = self.library.take_engine_functions(&key);
        if !functions.is_empty() {
            self.registry.with_engine(&key, |engine| {
                for function in functions {
                    engine.free_function(Subsystem::Function, function);
                }
            })?;
        }
        self.registry.unregister(name)
    }

    // ---------------------------------------------------------------------
    // EVAL family
    // ---------------------------------------------------------------------

    /// `EVAL body numkeys key… arg…`
    pub fn dispatch_eval(&mut self, runner: SharedRunner, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.eval_inner(runner, argv, false);
        self.reply_of(result)
    }

    /// `EVAL_RO body numkeys key… arg…`
    pub fn dispatch_eval_ro(&mut self, runner: SharedRunner, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.eval_inner(runner, argv, true);
        self.reply_of(result)
    }

    /// `EVALSHA digest numkeys key… arg…`
    pub fn dispatch_evalsha(&mut self, runner: SharedRunner, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.evalsha_inner(runner, argv, false);
        self.reply_of(result)
    }

    /// `EVALSHA_RO digest numkeys key… arg…`
    pub fn dispatch_evalsha_ro(&mut self, runner: SharedRunner, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.evalsha_inner(runner, argv, true);
        self.reply_of(result)
    }

    fn eval_inner(
        &mut self,
        runner: SharedRunner,
        argv: &[Vec<u8>],
        read_only: bool,
    ) -> ScriptingResult<ReplyValue> {
        let (body, numkeys) = eval_shape(argv)?;
        let sha = digest::sha1_hex(body.as_bytes());
        if self.cache.contains(&sha) {
            self.cache.touch(&sha);
        } else {
            self.admit(body, &sha, true)?;
        }
        let (keys, args) = split_keys(argv, numkeys);
        self.run_cached(&sha, runner, keys, args, read_only)
    }

    fn evalsha_inner(
        &mut self,
        runner: SharedRunner,
        argv: &[Vec<u8>],
        read_only: bool,
    ) -> ScriptingResult<ReplyValue> {
        let (raw, numkeys) = eval_shape(argv)?;
        // Any digest that does not normalize to 40 hex characters cannot
        // match a script; reject before touching the cache.
        let sha = digest::normalize_digest(raw).ok_or(ScriptingError::NoScript)?;
        if !self.cache.contains(&sha) {
            return Err(ScriptingError::NoScript);
        }
        self.cache.touch(&sha);
        let (keys, args) = split_keys(argv, numkeys);
        self.run_cached(&sha, runner, keys, args, read_only)
    }

    /// Compiles and admits one script body under `sha`.
    fn admit(&mut self, body: &str, sha: &str, track: bool) -> ScriptingResult<()> {
        let parsed = shebang::parse(body, &self.config.default_engine)?;
        let engine_key = parsed.engine.to_ascii_lowercase();
        if !self.registry.contains(&engine_key) {
            return Err(ScriptingError::unknown_engine(&parsed.engine));
        }
        let code = parsed.body(body);
        let timeout = Duration::from_millis(self.config.function_load_timeout_ms);
        let mut functions = self
            .registry
            .with_engine(&engine_key, |engine| {
                engine.compile(Subsystem::Eval, code, timeout)
            })??;
        assert_eq!(
            functions.len(),
            1,
            "engine '{engine_key}' broke the EVAL compile contract ({} functions)",
            functions.len()
        );
        let mut function = functions.remove(0);
        function.flags = parsed.flags;

        let evicted = self.cache.insert(
            sha.to_string(),
            body.to_string(),
            engine_key,
            function,
            parsed.flags,
            track,
        );
        self.stats.compiled_scripts += 1;
        for (victim_sha, entry) in evicted {
            debug!(digest = %victim_sha, "releasing evicted script");
            let owner = entry.engine().to_string();
            let function = entry.into_function();
            let _ = self.registry.with_engine(&owner, |engine| {
                engine.free_function(Subsystem::Eval, function);
            });
        }
        Ok(())
    }

    fn run_cached(
        &mut self,
        sha: &str,
        runner: SharedRunner,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
        read_only: bool,
    ) -> ScriptingResult<ReplyValue> {
        self.is_busy()?;
        let entry = self.cache.get(sha).ok_or(ScriptingError::NoScript)?;
        let script_flags = entry.flags();
        let owner = entry.engine().to_string();

        let base = if read_only {
            CommandFlags::eval_ro_base()
        } else {
            CommandFlags::eval_base()
        };
        if read_only
            && !script_flags.contains(ScriptFlags::EVAL_COMPAT_MODE)
            && !script_flags.declares_no_writes()
        {
            return Err(ScriptingError::WriteOnReadOnlyCommand);
        }
        let folded = fold_flags(base, script_flags);
        self.check_policy(folded)?;

        let state = RunState::new();
        let mut run = RunCtx::new(
            state.clone(),
            Subsystem::Eval,
            folded,
            !folded.contains(CommandFlags::WRITE),
            runner,
        );
        self.begin_run(Some(sha.to_string()), false, run.clone());
        self.stats.script_calls += 1;

        let result = match self.cache.get(sha) {
            None => Err(ScriptingError::NoScript),
            Some(entry) => {
                let function = entry.function();
                let scope_ctx = run.clone();
                self.registry
                    .with_engine_scoped(&owner, &scope_ctx, |engine| {
                        engine.call(&mut run, function, Subsystem::Eval, keys, args)
                    })
                    .and_then(|inner| inner)
            }
        };
        self.finish_run(state, false, result)
    }

    // ---------------------------------------------------------------------
    // SCRIPT subcommands
    // ---------------------------------------------------------------------

    /// `SCRIPT LOAD|EXISTS|FLUSH|KILL|DEBUG|SHOW …`
    pub fn dispatch_script(&mut self, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.script_inner(argv);
        self.reply_of(result)
    }

    fn script_inner(&mut self, argv: &[Vec<u8>]) -> ScriptingResult<ReplyValue> {
        let sub = argv
            .get(1)
            .map(|raw| String::from_utf8_lossy(raw).to_ascii_lowercase())
            .ok_or_else(|| {
                ScriptingError::invalid_arguments("wrong number of arguments for 'script' command")
            })?;
        match sub.as_str() {
            "load" => {
                let body = utf8_body(argv.get(2).ok_or_else(|| {
                    ScriptingError::invalid_arguments("SCRIPT LOAD needs a script body")
                })?)?;
                self.script_load(body)
            }
            "exists" => {
                let replies = argv[2..]
                    .iter()
                    .map(|raw| {
                        let known = std::str::from_utf8(raw)
                            .ok()
                            .and_then(digest::normalize_digest)
                            .map(|sha| self.cache.contains(&sha))
                            .unwrap_or(false);
                        ReplyValue::Integer(known as i64)
                    })
                    .collect();
                Ok(ReplyValue::Array(replies))
            }
            "flush" => {
                let async_teardown = match argv.get(2) {
                    None => self.config.lazyfree_user_flush,
                    Some(raw) => match String::from_utf8_lossy(raw).to_ascii_lowercase().as_str() {
                        "async" => true,
                        "sync" => false,
                        _ => {
                            return Err(ScriptingError::invalid_arguments(
                                "SCRIPT FLUSH only supports SYNC|ASYNC option",
                            ))
                        }
                    },
                };
                self.flush(async_teardown);
                Ok(ReplyValue::ok())
            }
            "kill" => self.kill_handle().kill(),
            "debug" => {
                let mode = argv
                    .get(2)
                    .map(|raw| String::from_utf8_lossy(raw).to_ascii_lowercase())
                    .ok_or_else(|| {
                        ScriptingError::invalid_arguments("SCRIPT DEBUG needs YES|SYNC|NO")
                    })?;
                self.debug_mode = match mode.as_str() {
                    "yes" => DebugMode::Forked,
                    "sync" => DebugMode::Sync,
                    "no" => DebugMode::No,
                    _ => {
                        return Err(ScriptingError::invalid_arguments(
                            "Use SCRIPT DEBUG YES/SYNC/NO",
                        ))
                    }
                };
                Ok(ReplyValue::ok())
            }
            "show" => {
                let sha = argv
                    .get(2)
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .and_then(digest::normalize_digest)
                    .ok_or(ScriptingError::NoScript)?;
                match self.cache.get(&sha) {
                    Some(entry) => Ok(ReplyValue::bulk(entry.body())),
                    None => Err(ScriptingError::NoScript),
                }
            }
            other => Err(ScriptingError::invalid_arguments(format!(
                "Unknown SCRIPT subcommand or wrong number of arguments for '{other}'"
            ))),
        }
    }

    fn script_load(&mut self, body: &str) -> ScriptingResult<ReplyValue> {
        let sha = digest::sha1_hex(body.as_bytes());
        if self.cache.contains(&sha) {
            // Re-admission through SCRIPT LOAD pins the entry forever.
            self.cache.promote(&sha);
        } else {
            self.admit(body, &sha, false)?;
        }
        Ok(ReplyValue::bulk(&sha))
    }

    /// Discards the whole EVAL cache and resets every engine's EVAL
    /// environment, inline or through the lazy-free worker.
    pub fn flush(&mut self, async_teardown: bool) {
        let (entries, lru) = self.cache.take_all();
        info!(
            scripts = entries.len(),
            async_teardown, "flushing EVAL script cache"
        );
        if async_teardown {
            let resets = self.registry.reset_eval_envs(true);
            let job: TeardownJob = Box::new(move || {
                drop(entries);
                drop(lru);
                for reset in resets {
                    reset();
                }
            });
            self.lazyfree.enqueue(job);
        } else {
            for entry in entries {
                let owner = entry.engine().to_string();
                let function = entry.into_function();
                let _ = self.registry.with_engine(&owner, |engine| {
                    engine.free_function(Subsystem::Eval, function);
                });
            }
            drop(lru);
            let resets = self.registry.reset_eval_envs(false);
            debug_assert!(resets.is_empty(), "sync reset returned deferred closures");
        }
    }

    /// Shutdown path: synchronous flush plus forked-child cleanup.
    pub fn shutdown(&mut self) {
        self.flush(false);
        debugger::children::kill_all();
    }

    // ---------------------------------------------------------------------
    // FCALL / FUNCTION
    // ---------------------------------------------------------------------

    /// `FCALL name numkeys key… arg…`
    pub fn dispatch_fcall(&mut self, runner: SharedRunner, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.fcall_inner(runner, argv, false);
        self.reply_of(result)
    }

    /// `FCALL_RO name numkeys key… arg…`
    pub fn dispatch_fcall_ro(&mut self, runner: SharedRunner, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.fcall_inner(runner, argv, true);
        self.reply_of(result)
    }

    fn fcall_inner(
        &mut self,
        runner: SharedRunner,
        argv: &[Vec<u8>],
        read_only: bool,
    ) -> ScriptingResult<ReplyValue> {
        let (name, numkeys) = eval_shape(argv)?;
        self.is_busy()?;
        let (function_flags, owner) = {
            let lf = self
                .library
                .get(name)
                .ok_or_else(|| ScriptingError::FunctionNotFound {
                    name: name.to_string(),
                })?;
            (lf.function().flags, lf.engine().to_string())
        };

        if read_only && !function_flags.declares_no_writes() {
            return Err(ScriptingError::WriteOnReadOnlyCommand);
        }
        let base = if read_only {
            CommandFlags::eval_ro_base()
        } else {
            CommandFlags::eval_base()
        };
        let folded = fold_flags(base, function_flags);
        self.check_policy(folded)?;

        let (keys, args) = split_keys(argv, numkeys);
        let state = RunState::new();
        let mut run = RunCtx::new(
            state.clone(),
            Subsystem::Function,
            folded,
            !folded.contains(CommandFlags::WRITE),
            runner,
        );
        self.begin_run(None, true, run.clone());
        self.stats.function_calls += 1;

        let result = match self.library.get(name) {
            None => Err(ScriptingError::FunctionNotFound {
                name: name.to_string(),
            }),
            Some(lf) => {
                let function = lf.function();
                let scope_ctx = run.clone();
                self.registry
                    .with_engine_scoped(&owner, &scope_ctx, |engine| {
                        engine.call(&mut run, function, Subsystem::Function, keys, args)
                    })
                    .and_then(|inner| inner)
            }
        };
        self.finish_run(state, true, result)
    }

    /// `FUNCTION LOAD|KILL …`
    pub fn dispatch_function(&mut self, argv: &[Vec<u8>]) -> ReplyValue {
        let result = self.function_inner(argv);
        self.reply_of(result)
    }

    fn function_inner(&mut self, argv: &[Vec<u8>]) -> ScriptingResult<ReplyValue> {
        let sub = argv
            .get(1)
            .map(|raw| String::from_utf8_lossy(raw).to_ascii_lowercase())
            .ok_or_else(|| {
                ScriptingError::invalid_arguments(
                    "wrong number of arguments for 'function' command",
                )
            })?;
        match sub.as_str() {
            "load" => {
                let body = utf8_body(argv.get(2).ok_or_else(|| {
                    ScriptingError::invalid_arguments("FUNCTION LOAD needs a library body")
                })?)?;
                self.function_load(body)
            }
            "kill" => self.kill_handle().kill(),
            other => Err(ScriptingError::invalid_arguments(format!(
                "Unknown FUNCTION subcommand or wrong number of arguments for '{other}'"
            ))),
        }
    }

    fn function_load(&mut self, body: &str) -> ScriptingResult<ReplyValue> {
        let parsed = shebang::parse(body, &self.config.default_engine)?;
        let engine_key = parsed.engine.to_ascii_lowercase();
        if !self.registry.contains(&engine_key) {
            return Err(ScriptingError::unknown_engine(&parsed.engine));
        }
        let code = parsed.body(body);
        let timeout = Duration::from_millis(self.config.function_load_timeout_ms);
        let mut functions = self
            .registry
            .with_engine(&engine_key, |engine| {
                engine.compile(Subsystem::Function, code, timeout)
            })??;
        for function in &mut functions {
            function.flags |= parsed.flags;
        }
        match self.library.admit(&engine_key, functions) {
            Ok(names) => {
                self.stats.compiled_scripts += 1;
                Ok(ReplyValue::Array(
                    names.into_iter().map(ReplyValue::bulk).collect(),
                ))
            }
            Err((err, rejected)) => {
                let _ = self.registry.with_engine(&engine_key, |engine| {
                    for function in rejected {
                        engine.free_function(Subsystem::Function, function);
                    }
                });
                Err(err)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Debugger routing
    // ---------------------------------------------------------------------

    /// Runs an EVAL under the armed debug mode, driving the session over
    /// `conn`. The final reply is delivered on the debug connection; in
    /// forked mode the parent detaches immediately.
    pub fn debug_eval(
        &mut self,
        runner: SharedRunner,
        argv: &[Vec<u8>],
        conn: Box<dyn DebugConnection>,
    ) -> ScriptingResult<DebugSessionOutcome> {
        let mode = self.debug_mode;
        if mode == DebugMode::No {
            return Err(ScriptingError::policy(
                "SCRIPT DEBUG must be armed before debugging an EVAL",
            ));
        }
        let (body, _numkeys) = eval_shape(argv)?;
        let parsed = shebang::parse(body, &self.config.default_engine)?;
        let source = parsed.body(body).to_string();
        let fork_session = mode == DebugMode::Forked;
        // Debug mode arms exactly one session.
        self.debug_mode = DebugMode::No;

        let start = debugger::with_debugger(|dbg| {
            dbg.start_session(
                conn,
                &source,
                fork_session,
                self.config.debug_reply_maxlen,
            )
        })?;
        match start {
            SessionStart::Parent { child } => Ok(DebugSessionOutcome::Detached { child }),
            SessionStart::Child | SessionStart::Sync => {
                let reply = match self.eval_inner(runner, argv, false) {
                    Ok(reply) => reply,
                    Err(err) => err.to_reply(),
                };
                // The forked child exits inside end_session.
                debugger::with_debugger(|dbg| dbg.end_session(Some(&reply)));
                Ok(DebugSessionOutcome::Completed)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn is_busy(&self) -> ScriptingResult<()> {
        let guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return Err(ScriptingError::Busy);
        }
        Ok(())
    }

    fn begin_run(&mut self, sha: Option<String>, function_call: bool, run: RunCtx) {
        let mut guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(RunningScript {
            digest: sha,
            function_call,
            run,
            start: Instant::now(),
        });
    }

    fn finish_run(
        &mut self,
        state: RunState,
        function_call: bool,
        result: ScriptingResult<ReplyValue>,
    ) -> ScriptingResult<ReplyValue> {
        let killed = state.is_killed();
        state.finish();
        let mut guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
        drop(guard);

        if killed {
            return Err(ScriptingError::Killed {
                function_kill: function_call,
            });
        }
        match result {
            Err(ScriptingError::Killed { .. }) => Err(ScriptingError::Killed {
                function_kill: function_call,
            }),
            other => other,
        }
    }

    fn check_policy(&self, folded: CommandFlags) -> ScriptingResult<()> {
        if folded.contains(CommandFlags::WRITE) && self.readonly_replica {
            return Err(ScriptingError::ReadOnlyReplica);
        }
        if folded.contains(CommandFlags::NO_CLUSTER) && self.cluster_enabled {
            return Err(ScriptingError::policy(
                "Can not run script on cluster, 'no-cluster' flag is set.",
            ));
        }
        Ok(())
    }

    fn reply_of(&self, result: ScriptingResult<ReplyValue>) -> ReplyValue {
        match result {
            Ok(reply) => reply,
            Err(err) => {
                debug!(category = err.category(), %err, "script command failed");
                err.to_reply()
            }
        }
    }
}

impl Drop for ScriptingSubsystem {
    fn drop(&mut self) {
        if !self.cache.is_empty() {
            self.flush(false);
        }
    }
}

fn utf8_body(raw: &[u8]) -> ScriptingResult<&str> {
    std::str::from_utf8(raw)
        .map_err(|_| ScriptingError::compile("script body is not valid UTF-8"))
}

/// Validates the common `<cmd> <subject> <numkeys> key… arg…` shape and
/// returns the subject plus the key count.
fn eval_shape(argv: &[Vec<u8>]) -> ScriptingResult<(&str, usize)> {
    if argv.len() < 3 {
        return Err(ScriptingError::invalid_arguments(
            "wrong number of arguments",
        ));
    }
    let subject = utf8_body(&argv[1])?;
    let numkeys: i64 = std::str::from_utf8(&argv[2])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| ScriptingError::invalid_numkeys("value is not an integer or out of range"))?;
    if numkeys < 0 {
        return Err(ScriptingError::invalid_numkeys(
            "Number of keys can't be negative",
        ));
    }
    let numkeys = numkeys as usize;
    if numkeys > argv.len() - 3 {
        return Err(ScriptingError::invalid_numkeys(
            "Number of keys can't be greater than number of args",
        ));
    }
    Ok((subject, numkeys))
}

fn split_keys(argv: &[Vec<u8>], numkeys: usize) -> (&[Vec<u8>], &[Vec<u8>]) {
    let keys = &argv[3..3 + numkeys];
    let args = &argv[3 + numkeys..];
    (keys, args)
}
