//! Scripting subsystem configuration and limits.

use serde::{Deserialize, Serialize};

/// Bound of the EVAL-cache LRU residency list.
pub const MAX_CACHED_SCRIPTS: usize = 500;

/// Maximum number of debugger breakpoints per session.
pub const MAX_BREAKPOINTS: usize = 64;

/// Default time budget for a FUNCTION LOAD compile step, in milliseconds.
pub const FUNCTION_LOAD_TIMEOUT_MS: u64 = 500;

/// Default per-reply truncation cap in debugger output.
pub const DEBUG_DEFAULT_MAXLEN: usize = 256;

/// Smallest honored non-zero truncation cap; lower requests are coerced up.
pub const DEBUG_MIN_MAXLEN: usize = 60;

/// Send timeout for synchronous debugger sessions, in seconds.
pub const DEBUG_SEND_TIMEOUT_SECS: u64 = 5;

/// Inbound debugger buffer cap; growth past this aborts the session.
pub const DEBUG_MAX_INPUT_BUF: usize = 1024 * 1024;

/// Maximum elements in one inbound debugger command array.
pub const DEBUG_MAX_ARGS: usize = 1024;

/// Maximum length of one inbound debugger bulk string.
pub const DEBUG_MAX_ARG_LEN: usize = 1024;

/// Tunable scripting settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Engine selected when a script carries no shebang.
    pub default_engine: String,
    /// Bound of the EVAL-cache LRU residency list.
    pub max_cached_scripts: usize,
    /// FUNCTION LOAD time budget in milliseconds.
    pub function_load_timeout_ms: u64,
    /// Whether SCRIPT FLUSH defaults to asynchronous teardown.
    pub lazyfree_user_flush: bool,
    /// Default debugger reply truncation cap.
    pub debug_reply_maxlen: usize,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            default_engine: "rhai".to_string(),
            max_cached_scripts: MAX_CACHED_SCRIPTS,
            function_load_timeout_ms: FUNCTION_LOAD_TIMEOUT_MS,
            lazyfree_user_flush: false,
            debug_reply_maxlen: DEBUG_DEFAULT_MAXLEN,
        }
    }
}
