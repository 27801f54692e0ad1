//! # Ember Core
//!
//! Shared primitives for the Ember in-memory data store.
//!
//! This crate carries the types that cross subsystem boundaries: the reply
//! value tree produced by commands and scripts, the caller identity and
//! command-execution seam used by embedded interpreters, the shared
//! execution-state handle used for cooperative cancellation, script digest
//! helpers, and the hand-off boundary to the lazy-free background worker.

/// Command-execution seam and caller identities for embedded interpreters
pub mod caller;
/// Script body digests (SHA-1, 40 lowercase hex characters)
pub mod digest;
/// Core error types and result handling
pub mod error;
/// Hand-off boundary to the lazy-free background worker
pub mod lazyfree;
/// Reply value tree shared by commands and scripts
pub mod reply;
/// Shared execution state for cooperative cancellation
pub mod state;

pub use caller::{CallerIdentity, CommandRunner};
pub use digest::{is_valid_digest, normalize_digest, sha1_hex};
pub use error::{CoreError, CoreResult};
pub use lazyfree::{InlineLazyFree, LazyFree, LazyFreeWorker, TeardownJob};
pub use reply::ReplyValue;
pub use state::{ExecutionState, RunState};
