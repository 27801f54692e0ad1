//! Error types for the scripting subsystem.
//!
//! Every recoverable failure in the subsystem is one of these variants and
//! maps to a single client-facing error line through [`ScriptingError::to_reply`].
//! Internal invariant violations are never represented here; those abort the
//! process with a diagnostic.

use ember_core::ReplyValue;
use thiserror::Error;

/// Scripting subsystem errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptingError {
    /// Script failed to compile (malformed shebang, unknown engine token,
    /// engine compile error)
    #[error("Compile error: {message}")]
    Compile { message: String },

    /// No engine registered under the requested name
    #[error("Unknown scripting engine: {name}")]
    UnknownEngine { name: String },

    /// Engine name collision at registration
    #[error("Engine already registered: {name}")]
    EngineExists { name: String },

    /// Engine cannot be released while still referenced
    #[error("Engine busy: {name}, reason: {reason}")]
    EngineBusy { name: String, reason: String },

    /// EVALSHA digest not present in the cache
    #[error("No matching script for digest")]
    NoScript,

    /// Malformed numkeys argument
    #[error("Invalid key count: {message}")]
    InvalidNumKeys { message: String },

    /// Generic argument arity/shape error
    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    /// Rejected by pre-execution policy checks (combined flags)
    #[error("Policy violation: {message}")]
    Policy { message: String },

    /// Write attempted on a read-only instance
    #[error("Write rejected on read-only replica")]
    ReadOnlyReplica,

    /// A `*_RO` command was used with a script that may write
    #[error("Script with write capability invoked through a read-only command")]
    WriteOnReadOnlyCommand,

    /// Error raised by the engine while running a function
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Script terminated through SCRIPT KILL / FUNCTION KILL
    #[error("Script killed (function_kill: {function_kill})")]
    Killed { function_kill: bool },

    /// The server is already busy running a script
    #[error("Busy running a script")]
    Busy,

    /// SCRIPT KILL with no script in execution
    #[error("No script in execution")]
    NotBusy,

    /// Running script already wrote to the dataset and cannot be killed
    #[error("Script performed writes and cannot be killed")]
    Unkillable,

    /// FUNCTION LOAD exceeded its time budget
    #[error("Function load timed out after {timeout_ms}ms")]
    LoadTimeout { timeout_ms: u64 },

    /// FUNCTION LOAD registered no functions
    #[error("No functions registered")]
    NoFunctionsRegistered,

    /// Function name collision in the library
    #[error("Function already exists: {name}")]
    FunctionExists { name: String },

    /// FCALL against an unknown function
    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    /// Debugger wire-protocol failure
    #[error("Debug protocol error: {message}")]
    Protocol { message: String },

    /// I/O error (debugger connection, fork)
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl ScriptingError {
    /// Create a new compile error
    pub fn compile<S: Into<String>>(message: S) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    /// Create a new unknown engine error
    pub fn unknown_engine<S: Into<String>>(name: S) -> Self {
        Self::UnknownEngine { name: name.into() }
    }

    /// Create a new engine exists error
    pub fn engine_exists<S: Into<String>>(name: S) -> Self {
        Self::EngineExists { name: name.into() }
    }

    /// Create a new engine busy error
    pub fn engine_busy<S: Into<String>>(name: S, reason: S) -> Self {
        Self::EngineBusy {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new invalid numkeys error
    pub fn invalid_numkeys<S: Into<String>>(message: S) -> Self {
        Self::InvalidNumKeys {
            message: message.into(),
        }
    }

    /// Create a new invalid arguments error
    pub fn invalid_arguments<S: Into<String>>(message: S) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    /// Create a new policy error
    pub fn policy<S: Into<String>>(message: S) -> Self {
        Self::Policy {
            message: message.into(),
        }
    }

    /// Create a new runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a new kill error for the EVAL flavor
    pub fn killed_eval() -> Self {
        Self::Killed {
            function_kill: false,
        }
    }

    /// Create a new kill error for the FCALL flavor
    pub fn killed_function() -> Self {
        Self::Killed {
            function_kill: true,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Whether the failure happened before the engine ever ran the script.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            ScriptingError::Compile { .. }
                | ScriptingError::UnknownEngine { .. }
                | ScriptingError::NoScript
                | ScriptingError::InvalidNumKeys { .. }
                | ScriptingError::InvalidArguments { .. }
                | ScriptingError::Policy { .. }
                | ScriptingError::ReadOnlyReplica
                | ScriptingError::WriteOnReadOnlyCommand
        )
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            ScriptingError::Compile { .. } | ScriptingError::UnknownEngine { .. } => "compile",
            ScriptingError::NoScript => "missing-script",
            ScriptingError::InvalidNumKeys { .. } | ScriptingError::InvalidArguments { .. } => {
                "arity"
            }
            ScriptingError::Policy { .. }
            | ScriptingError::ReadOnlyReplica
            | ScriptingError::WriteOnReadOnlyCommand => "policy",
            ScriptingError::Runtime { .. } => "runtime",
            ScriptingError::Killed { .. } | ScriptingError::Unkillable => "kill",
            ScriptingError::Busy | ScriptingError::NotBusy => "busy",
            ScriptingError::LoadTimeout { .. } => "load-timeout",
            ScriptingError::NoFunctionsRegistered
            | ScriptingError::FunctionExists { .. }
            | ScriptingError::FunctionNotFound { .. } => "library",
            ScriptingError::EngineExists { .. } | ScriptingError::EngineBusy { .. } => "registry",
            ScriptingError::Protocol { .. } => "protocol",
            ScriptingError::Io { .. } => "io",
        }
    }

    /// The exact client-facing error reply for this failure.
    pub fn to_reply(&self) -> ReplyValue {
        let line = match self {
            ScriptingError::Compile { message } => {
                format!("ERR Error compiling script: {message}")
            }
            ScriptingError::UnknownEngine { name } => {
                format!("ERR Unknown scripting engine '{name}'")
            }
            ScriptingError::EngineExists { name } => {
                format!("ERR Scripting engine '{name}' is already registered")
            }
            ScriptingError::EngineBusy { name, reason } => {
                format!("ERR Scripting engine '{name}' is busy: {reason}")
            }
            ScriptingError::NoScript => {
                "NOSCRIPT No matching script. Please use EVAL.".to_string()
            }
            ScriptingError::InvalidNumKeys { message } => format!("ERR {message}"),
            ScriptingError::InvalidArguments { message } => format!("ERR {message}"),
            ScriptingError::Policy { message } => format!("ERR {message}"),
            ScriptingError::ReadOnlyReplica => {
                "READONLY You can't write against a read only replica.".to_string()
            }
            ScriptingError::WriteOnReadOnlyCommand => {
                "ERR Can not execute a script with write flag using *_ro command.".to_string()
            }
            ScriptingError::Runtime { message } => format!("ERR {message}"),
            ScriptingError::Killed { function_kill } => {
                if *function_kill {
                    "ERR Script killed by user with FUNCTION KILL.".to_string()
                } else {
                    "ERR Script killed by user with SCRIPT KILL.".to_string()
                }
            }
            ScriptingError::Busy => {
                "BUSY Ember is busy running a script. \
                 You can only call SCRIPT KILL or SHUTDOWN NOSAVE."
                    .to_string()
            }
            ScriptingError::NotBusy => "NOTBUSY No scripts in execution right now.".to_string(),
            ScriptingError::Unkillable => {
                "UNKILLABLE Sorry the script already executed write commands against the \
                 dataset. You can either wait the script termination or kill the server \
                 in a hard way using the SHUTDOWN NOSAVE command."
                    .to_string()
            }
            ScriptingError::LoadTimeout { timeout_ms } => {
                format!("ERR Function load timed out after {timeout_ms}ms; no functions registered")
            }
            ScriptingError::NoFunctionsRegistered => {
                "ERR No functions registered".to_string()
            }
            ScriptingError::FunctionExists { name } => {
                format!("ERR Function '{name}' already exists")
            }
            ScriptingError::FunctionNotFound { name } => {
                format!("ERR Function not found: {name}")
            }
            ScriptingError::Protocol { message } => format!("ERR Protocol error: {message}"),
            ScriptingError::Io { message } => format!("ERR I/O error: {message}"),
        };
        ReplyValue::Error(line)
    }
}

/// Result type for scripting operations
pub type ScriptingResult<T> = std::result::Result<T, ScriptingError>;

impl From<std::io::Error> for ScriptingError {
    fn from(error: std::io::Error) -> Self {
        ScriptingError::io(error.to_string())
    }
}

impl From<ember_core::CoreError> for ScriptingError {
    fn from(error: ember_core::CoreError) -> Self {
        ScriptingError::io(error.to_string())
    }
}
