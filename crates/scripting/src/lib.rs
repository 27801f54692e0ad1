//! # Ember Scripting
//!
//! The scripting subsystem of the Ember in-memory data store.
//!
//! User-submitted scripts are compiled by pluggable language back-ends,
//! cached under their SHA-1 content digests, and executed in response to
//! EVAL / EVALSHA / FCALL command shapes. The pieces:
//!
//! - **Engine registry and contract** ([`registry`], [`engine`]): distinct
//!   back-ends install behind one capability set; the registry mediates
//!   every call and installs the invocation context around it.
//! - **EVAL cache** ([`cache`]): content-addressable storage with an LRU
//!   residency list, synchronous or lazy-free deferred teardown.
//! - **Dispatcher** ([`dispatcher`]): command-shape handlers, shebang and
//!   flag folding, policy checks, cancellation bookkeeping.
//! - **Debugger** ([`debugger`]): a line-level single-step debugger that
//!   runs forked sessions so interactive debugging cannot block the
//!   server.
//!
//! Engines come from sibling crates (`ember-vm` provides the minimal
//! stack VM, `ember-rhai` the full interpreter back-end) or from modules
//! through [`dispatcher::ScriptingSubsystem::register_engine`].

/// EVAL script cache with LRU residency
pub mod cache;
/// Configuration and limits
pub mod config;
/// Line-level single-step debugger
pub mod debugger;
/// Command dispatch and the subsystem facade
pub mod dispatcher;
/// The engine contract and invocation scope
pub mod engine;
/// Scripting error types
pub mod error;
/// Script and command flags plus folding rules
pub mod flags;
/// Named-function catalog for FCALL
pub mod library;
/// Engine registry and descriptors
pub mod registry;
/// Shebang parsing
pub mod shebang;

pub use cache::{CacheEntry, ScriptCache};
pub use config::ScriptingConfig;
pub use dispatcher::{
    DebugMode, DebugSessionOutcome, ScriptKillHandle, ScriptingStats, ScriptingSubsystem,
};
pub use engine::{
    CallScope, CompiledFunction, EngineMemoryInfo, EnvReset, RunCtx, ScriptingEngine,
    SharedRunner, Subsystem,
};
pub use error::{ScriptingError, ScriptingResult};
pub use flags::{fold_flags, CommandFlags, ScriptFlags};
pub use library::FunctionLibrary;
pub use registry::{EngineDescriptor, EngineRegistry, ModuleHandle, ENGINE_ABI_VERSION};
pub use shebang::Shebang;
