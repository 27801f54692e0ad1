//! # Ember Rhai
//!
//! The full interpreter back-end for the Ember scripting subsystem,
//! built on [rhai](https://rhai.rs).
//!
//! Two interpreter instances are maintained per engine: one for ad-hoc
//! EVAL scripts and one for named-function libraries, so resetting the
//! EVAL environment never disturbs loaded libraries. Scripts see a
//! `server` module with `call`/`pcall` command bindings, the
//! `register_function` hook used during FUNCTION LOAD, and
//! `breakpoint`/`debug` bindings that are inert unless a debug session is
//! active:
//!
//! ```text
//! #!rhai flags=no-writes
//! let value = server::call("GET", KEYS[0]);
//! value
//! ```
//!
//! Cooperative cancellation and the FUNCTION LOAD time budget both ride
//! on the interpreter's progress hook; the line-level debugger rides on
//! its debugging interface.

/// Value conversions between rhai and the server
pub mod convert;
/// The rhai-backed scripting engine
pub mod engine;
/// The `server` module exposed to scripts
pub mod server_api;

pub use engine::{RhaiScriptEngine, ENGINE_NAME};
