//! Shebang parsing.
//!
//! A script body may begin with `#!<engine-name>[ flags=flag1,flag2,...]`
//! on its first line. The engine name selects the back-end; `flags=` is
//! the only accepted option. The shebang line is stripped before the body
//! reaches the engine. A body without a shebang selects the built-in
//! default engine and runs in eval-compat mode.

use crate::error::{ScriptingError, ScriptingResult};
use crate::flags::ScriptFlags;

/// Shebang marker bytes.
pub const SHEBANG_PREFIX: &str = "#!";

/// Result of parsing a script body's shebang line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shebang {
    /// Engine selected by the directive (or the default engine).
    pub engine: String,
    /// Declared script flags; `EVAL_COMPAT_MODE` when no shebang was present.
    pub flags: ScriptFlags,
    /// Byte offset of the first body character after the stripped shebang.
    pub body_offset: usize,
}

impl Shebang {
    /// The script body with the shebang line stripped.
    pub fn body<'a>(&self, script: &'a str) -> &'a str {
        &script[self.body_offset..]
    }
}

/// Parses the optional shebang line of `script`.
pub fn parse(script: &str, default_engine: &str) -> ScriptingResult<Shebang> {
    if !script.starts_with(SHEBANG_PREFIX) {
        return Ok(Shebang {
            engine: default_engine.to_string(),
            flags: ScriptFlags::EVAL_COMPAT_MODE,
            body_offset: 0,
        });
    }

    let newline = script.find('\n').ok_or_else(|| {
        ScriptingError::compile("Missing newline at the end of the shebang line")
    })?;
    let line = script[SHEBANG_PREFIX.len()..newline].trim_end_matches('\r');

    let mut parts = line.split_whitespace();
    let engine = parts
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ScriptingError::compile("Missing engine name in script shebang"))?;

    let mut flags = ScriptFlags::empty();
    for option in parts {
        let Some(list) = option.strip_prefix("flags=") else {
            return Err(ScriptingError::compile(format!(
                "Unknown shebang option: {option}"
            )));
        };
        for token in list.split(',').filter(|token| !token.is_empty()) {
            flags |= ScriptFlags::parse_token(token)?;
        }
    }

    Ok(Shebang {
        engine: engine.to_string(),
        flags,
        body_offset: newline + 1,
    })
}
