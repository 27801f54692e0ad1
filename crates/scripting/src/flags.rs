//! Script and command flags.
//!
//! Script flags are a closed vocabulary declared in the shebang line;
//! command flags are the base execution attributes of EVAL-family
//! commands. Before a script runs, the two are folded into the effective
//! command flags that drive cluster/admission checks.

use bitflags::bitflags;

use crate::error::{ScriptingError, ScriptingResult};

bitflags! {
    /// Flags a script declares about itself.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ScriptFlags: u8 {
        /// `read-only`: the script promises not to modify the dataset.
        const READ_ONLY = 1 << 0;
        /// `no-writes`: same promise as `read-only`, kept as a distinct
        /// token for declaration fidelity.
        const NO_WRITES = 1 << 1;
        /// `allow-stale`: the script may run on a stale replica.
        const ALLOW_STALE = 1 << 2;
        /// `allow-cross-slot-keys`: keys may span hash slots.
        const ALLOW_CROSS_SLOT = 1 << 3;
        /// `no-cluster`: the script refuses to run in cluster mode.
        const NO_CLUSTER = 1 << 4;
        /// Internal: the script carried no shebang and keeps the invoking
        /// command's base flags unchanged. Not declarable.
        const EVAL_COMPAT_MODE = 1 << 5;
    }
}

impl ScriptFlags {
    /// Parses one declarable flag token from the shebang vocabulary.
    pub fn parse_token(token: &str) -> ScriptingResult<ScriptFlags> {
        match token {
            "read-only" => Ok(ScriptFlags::READ_ONLY),
            "no-writes" => Ok(ScriptFlags::NO_WRITES),
            "allow-stale" => Ok(ScriptFlags::ALLOW_STALE),
            "allow-cross-slot-keys" => Ok(ScriptFlags::ALLOW_CROSS_SLOT),
            "no-cluster" => Ok(ScriptFlags::NO_CLUSTER),
            _ => Err(ScriptingError::compile(format!(
                "Unexpected flag in script shebang: {token}"
            ))),
        }
    }

    /// The declarable tokens present in this set, in vocabulary order.
    pub fn tokens(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(ScriptFlags::READ_ONLY) {
            out.push("read-only");
        }
        if self.contains(ScriptFlags::NO_WRITES) {
            out.push("no-writes");
        }
        if self.contains(ScriptFlags::ALLOW_STALE) {
            out.push("allow-stale");
        }
        if self.contains(ScriptFlags::ALLOW_CROSS_SLOT) {
            out.push("allow-cross-slot-keys");
        }
        if self.contains(ScriptFlags::NO_CLUSTER) {
            out.push("no-cluster");
        }
        out
    }

    /// Whether the script promises not to write.
    pub fn declares_no_writes(self) -> bool {
        self.intersects(ScriptFlags::READ_ONLY | ScriptFlags::NO_WRITES)
    }
}

bitflags! {
    /// Effective execution attributes of an EVAL-family command.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        /// The command may modify the dataset.
        const WRITE = 1 << 0;
        /// The command may run against a stale replica.
        const ALLOW_STALE = 1 << 1;
        /// Keys may span hash slots.
        const ALLOW_CROSS_SLOT = 1 << 2;
        /// Refuse to run in cluster mode.
        const NO_CLUSTER = 1 << 3;
    }
}

impl CommandFlags {
    /// Base flags of `EVAL` / `EVALSHA` / `FCALL`.
    pub fn eval_base() -> Self {
        CommandFlags::WRITE
    }

    /// Base flags of the `*_RO` command variants.
    pub fn eval_ro_base() -> Self {
        CommandFlags::empty()
    }
}

/// Folds a script's declared flags into the command's base flags.
///
/// A compat-mode script (no shebang) keeps the base flags unchanged.
/// Otherwise the script's declaration replaces the script-relevant subset:
/// write capability, staleness, cross-slot and cluster admission.
pub fn fold_flags(base: CommandFlags, script: ScriptFlags) -> CommandFlags {
    if script.contains(ScriptFlags::EVAL_COMPAT_MODE) {
        return base;
    }

    let mut folded = CommandFlags::empty();
    if base.contains(CommandFlags::WRITE) && !script.declares_no_writes() {
        folded |= CommandFlags::WRITE;
    }
    if script.contains(ScriptFlags::ALLOW_STALE) {
        folded |= CommandFlags::ALLOW_STALE;
    }
    if script.contains(ScriptFlags::ALLOW_CROSS_SLOT) {
        folded |= CommandFlags::ALLOW_CROSS_SLOT;
    }
    if script.contains(ScriptFlags::NO_CLUSTER) {
        folded |= CommandFlags::NO_CLUSTER;
    }
    folded
}
