//! Engine registry.
//!
//! Holds the mapping from engine name to engine descriptor, accounts the
//! aggregate memory overhead reported by engines, and mediates every call
//! into a back-end. Names are case-insensitive and unique. The registry is
//! only modified at module load/unload time; all engine use must quiesce
//! before an engine is unregistered.

use std::collections::HashMap;

use ember_core::CallerIdentity;
use tracing::{debug, warn};

use crate::engine::{CallScope, EngineMemoryInfo, EnvReset, RunCtx, ScriptingEngine, Subsystem};
use crate::error::{ScriptingError, ScriptingResult};

/// Version of the engine registration ABI. Modules built against a
/// different version are rejected at registration.
pub const ENGINE_ABI_VERSION: u32 = 1;

/// Non-owning reference to the module that registered an engine. Absent
/// for built-in engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    name: String,
    abi_version: u32,
}

impl ModuleHandle {
    /// Creates a handle naming the owning module, built against the
    /// current ABI.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            abi_version: ENGINE_ABI_VERSION,
        }
    }

    /// Creates a handle carrying the ABI version the module was built
    /// against.
    pub fn with_abi_version<S: Into<String>>(name: S, abi_version: u32) -> Self {
        Self {
            name: name.into(),
            abi_version,
        }
    }

    /// The module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ABI version the module was built against.
    pub fn abi_version(&self) -> u32 {
        self.abi_version
    }
}

/// A registered engine: the back-end, its identity and its accounting.
pub struct EngineDescriptor {
    name: String,
    module: Option<ModuleHandle>,
    caller: CallerIdentity,
    reported_overhead: usize,
    engine: Box<dyn ScriptingEngine>,
}

impl EngineDescriptor {
    /// The registration name (original casing preserved).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning module, if any.
    pub fn module(&self) -> Option<&ModuleHandle> {
        self.module.as_ref()
    }

    /// The engine's dedicated internal caller identity.
    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    /// The memory overhead the engine reported at registration.
    pub fn reported_overhead(&self) -> usize {
        self.reported_overhead
    }
}

/// Process-wide engine manager state.
pub struct EngineRegistry {
    engines: HashMap<String, EngineDescriptor>,
    total_overhead: usize,
    registering: bool,
    next_caller_id: u64,
}

impl EngineRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
            total_overhead: 0,
            registering: false,
            next_caller_id: 1,
        }
    }

    /// Registers an engine under `name`.
    ///
    /// Fails on a case-insensitive name collision. Captures the engine's
    /// self-reported memory overhead into the global total and creates the
    /// engine's caller identity.
    pub fn register(
        &mut self,
        name: &str,
        module: Option<ModuleHandle>,
        engine: Box<dyn ScriptingEngine>,
    ) -> ScriptingResult<()> {
        if let Some(module) = &module {
            if module.abi_version() != ENGINE_ABI_VERSION {
                return Err(ScriptingError::invalid_arguments(format!(
                    "module '{}' was built against engine ABI v{}, expected v{ENGINE_ABI_VERSION}",
                    module.name(),
                    module.abi_version(),
                )));
            }
        }
        let key = name.to_ascii_lowercase();
        if self.engines.contains_key(&key) {
            return Err(ScriptingError::engine_exists(name));
        }

        self.registering = true;
        let overhead = engine
            .memory_info(Subsystem::All)
            .engine_memory_overhead;
        let caller = CallerIdentity::for_engine(self.next_caller_id, &key);
        self.next_caller_id += 1;

        self.engines.insert(
            key,
            EngineDescriptor {
                name: name.to_string(),
                module,
                caller,
                reported_overhead: overhead,
                engine,
            },
        );
        self.total_overhead += overhead;
        self.registering = false;

        debug!(engine = name, overhead, "scripting engine registered");
        Ok(())
    }

    /// Unregisters an engine, detaching its caller identity and releasing
    /// the descriptor. The caller must have dropped the engine's library
    /// functions beforehand and quiesced all other use.
    pub fn unregister(&mut self, name: &str) -> ScriptingResult<()> {
        if self.registering {
            return Err(ScriptingError::engine_busy(
                name,
                "registration in progress",
            ));
        }
        let key = name.to_ascii_lowercase();
        match self.engines.remove(&key) {
            Some(descriptor) => {
                self.total_overhead = self
                    .total_overhead
                    .saturating_sub(descriptor.reported_overhead);
                debug!(engine = name, "scripting engine unregistered");
                Ok(())
            }
            None => Err(ScriptingError::unknown_engine(name)),
        }
    }

    /// Case-insensitive lookup.
    pub fn find(&self, name: &str) -> Option<&EngineDescriptor> {
        self.engines.get(&name.to_ascii_lowercase())
    }

    /// Whether an engine is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Runs `f` against the named engine. Used for methods that execute
    /// with no active server-side caller (compile, introspection, free).
    pub fn with_engine<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut dyn ScriptingEngine) -> R,
    ) -> ScriptingResult<R> {
        let key = name.to_ascii_lowercase();
        let descriptor = self
            .engines
            .get_mut(&key)
            .ok_or_else(|| ScriptingError::unknown_engine(name))?;
        Ok(f(descriptor.engine.as_mut()))
    }

    /// Runs `f` against the named engine with `run`'s invocation context
    /// installed for the duration of the call. The scope is torn down on
    /// all exit paths; this is the only sanctioned way to reach a back-end
    /// on behalf of a caller.
    pub fn with_engine_scoped<R>(
        &mut self,
        name: &str,
        run: &RunCtx,
        f: impl FnOnce(&mut dyn ScriptingEngine) -> R,
    ) -> ScriptingResult<R> {
        let key = name.to_ascii_lowercase();
        let descriptor = self
            .engines
            .get_mut(&key)
            .ok_or_else(|| ScriptingError::unknown_engine(name))?;
        let _scope = CallScope::enter(run);
        Ok(f(descriptor.engine.as_mut()))
    }

    /// Iterates over all engines. Order is unspecified but stable across a
    /// single call.
    pub fn for_each(&self, mut f: impl FnMut(&EngineDescriptor)) {
        for descriptor in self.engines.values() {
            f(descriptor);
        }
    }

    /// Asks every engine to reset its EVAL environment, collecting any
    /// deferred-reset closures.
    pub fn reset_eval_envs(&mut self, async_teardown: bool) -> Vec<EnvReset> {
        let mut resets = Vec::new();
        for descriptor in self.engines.values_mut() {
            if let Some(reset) = descriptor.engine.reset_eval_env(async_teardown) {
                resets.push(reset);
            }
        }
        resets
    }

    /// Aggregate memory info across all engines for one subsystem.
    pub fn memory_info(&self, subsystem: Subsystem) -> EngineMemoryInfo {
        let mut total = EngineMemoryInfo::default();
        for descriptor in self.engines.values() {
            let info = descriptor.engine.memory_info(subsystem);
            total.used_memory += info.used_memory;
            total.engine_memory_overhead += info.engine_memory_overhead;
        }
        total
    }

    /// Sum of the overheads captured at registration time.
    pub fn total_memory_overhead(&self) -> usize {
        self.total_overhead
    }

    /// Number of registered engines.
    pub fn count(&self) -> usize {
        self.engines.len()
    }

    /// Approximate bytes used by the manager structures themselves.
    pub fn manager_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .engines
                .iter()
                .map(|(key, descriptor)| {
                    key.len()
                        + descriptor.name.len()
                        + std::mem::size_of::<EngineDescriptor>()
                })
                .sum::<usize>()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        if !self.engines.is_empty() {
            warn!(
                engines = self.engines.len(),
                "engine registry dropped with engines still installed"
            );
        }
    }
}
