//! Line-level single-step script debugger.
//!
//! The debugger sits between a client that armed `SCRIPT DEBUG` and the
//! interpreter running its script. In forked mode the process forks at
//! session start: the child executes the script against a throwaway copy
//! of the dataset while the parent detaches immediately; in sync mode the
//! session runs in the server process and blocks it. Engines drive the
//! debugger through [`debug_line_hook`], called before every executable
//! line, and expose introspection through [`DebugTarget`].
//!
//! The singleton is confined to the main thread (or to a forked child,
//! which owns its whole address space), so it lives in a thread-local.

/// Forked child bookkeeping
pub mod children;
/// Value rendering for debugger output
pub mod printer;
/// Tolerant inbound parser and outbound framing
pub mod protocol;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use ember_core::ReplyValue;
use nix::unistd::{fork, ForkResult};
use tracing::{debug, warn};

use crate::config::{
    DEBUG_MAX_INPUT_BUF, DEBUG_MIN_MAXLEN, DEBUG_SEND_TIMEOUT_SECS, MAX_BREAKPOINTS,
};
use crate::error::{ScriptingError, ScriptingResult};
use printer::{render, DebugValue};
use protocol::{parse_command, ParseOutcome, END_SESSION_FRAME};

/// Byte stream between the debugger and its client.
pub trait DebugConnection: Send {
    /// Reads some bytes, blocking until at least one is available.
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Writes the whole buffer.
    fn write_all_bytes(&mut self, data: &[u8]) -> std::io::Result<()>;
    /// Applies a send timeout for the session duration.
    fn set_send_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl DebugConnection for TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf)
    }

    fn write_all_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_all(data)
    }

    fn set_send_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_write_timeout(timeout)
    }
}

/// Engine-side introspection surface used by prompt commands.
pub trait DebugTarget {
    /// Local variables of the current frame; with a name, only that
    /// variable (`KEYS`/`ARGV` resolve as globals).
    fn locals(&mut self, name: Option<&str>) -> Vec<(String, DebugValue)>;
    /// Evaluates a code fragment in a new call frame.
    fn eval_fragment(&mut self, code: &str) -> Result<DebugValue, String>;
    /// Backtrace of user-script frames, outermost last.
    fn backtrace(&mut self) -> Vec<String>;
    /// Executes a server command through the script's command binding.
    fn server_command(&mut self, argv: &[Vec<u8>]) -> ReplyValue;
}

/// How a debug session begins, as seen by the dispatcher.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionStart {
    /// Forked: the parent recorded `child` and must not run the script.
    Parent {
        /// PID of the forked child.
        child: i32,
    },
    /// Forked: this process is the child and must run the script.
    Child,
    /// Synchronous session in the server process.
    Sync,
}

/// What the engine should do after a line hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    /// Keep executing.
    Continue,
    /// Terminate script execution with an error.
    Abort,
}

const HELP: &[&str] = &[
    "Ember script debugger help:",
    "[h]elp               Show this help.",
    "[s]tep               Run current line and stop again.",
    "[n]ext               Alias for step.",
    "[c]ontinue           Run till next breakpoint.",
    "[l]ist               List source code around the current line.",
    "[l]ist [line]        List source code around [line].",
    "[l]ist [line] [ctx]  Show [ctx] lines before and after [line].",
    "[w]hole              List all source code.",
    "[p]rint              Show all the local variables.",
    "[p]rint <var>        Show the value of the specified variable.",
    "                     Can also show global vars KEYS and ARGV.",
    "[b]reak              Show all breakpoints.",
    "[b]reak <line>       Add a breakpoint to the specified line.",
    "[b]reak -<line>      Remove breakpoint from the specified line.",
    "[b]reak 0            Remove all breakpoints.",
    "[t]race              Show a backtrace.",
    "[e]val <code>        Execute some code in a different call frame.",
    "[r]edis <cmd>        Execute a server command.",
    "[v]alkey <cmd>       Alias for redis.",
    "[m]axlen [len]       Trim logged replies and values at <len> bytes.",
    "[a]bort              Stop the execution of the script.",
];

/// The debugger singleton state.
pub struct ScriptDebugger {
    conn: Option<Box<dyn DebugConnection>>,
    active: bool,
    forked: bool,
    logs: Vec<String>,
    breakpoints: Vec<u32>,
    step: bool,
    break_on_next: bool,
    source: Vec<String>,
    current_line: u32,
    cbuf: Vec<u8>,
    maxlen: usize,
}

impl ScriptDebugger {
    /// Creates an idle debugger.
    pub fn new() -> Self {
        Self {
            conn: None,
            active: false,
            forked: false,
            logs: Vec::new(),
            breakpoints: Vec::new(),
            step: false,
            break_on_next: false,
            source: Vec::new(),
            current_line: 0,
            cbuf: Vec::new(),
            maxlen: crate::config::DEBUG_DEFAULT_MAXLEN,
        }
    }

    /// Whether a session is running in this process.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Whether the running session is a forked one.
    pub fn forked(&self) -> bool {
        self.forked
    }

    /// The line the session is stopped at.
    pub fn current_line(&self) -> u32 {
        self.current_line
    }

    /// Starts a session over `conn` for the given script source (as
    /// handed to the engine, shebang stripped).
    ///
    /// In forked mode the parent registers the child PID, drops its copy
    /// of the connection and stays idle; the child keeps the connection
    /// and becomes the active debugger. Session fields reset here.
    pub fn start_session(
        &mut self,
        mut conn: Box<dyn DebugConnection>,
        source: &str,
        fork_session: bool,
        maxlen: usize,
    ) -> ScriptingResult<SessionStart> {
        self.logs.clear();
        self.breakpoints.clear();
        self.cbuf.clear();
        self.step = true;
        self.break_on_next = false;
        self.current_line = 0;
        self.maxlen = maxlen;
        self.source = source.lines().map(|line| line.to_string()).collect();

        if fork_session {
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    children::register(child.as_raw());
                    drop(conn);
                    self.active = false;
                    debug!(child = child.as_raw(), "forked debugger session started");
                    return Ok(SessionStart::Parent {
                        child: child.as_raw(),
                    });
                }
                Ok(ForkResult::Child) => {
                    if let Err(err) =
                        conn.set_send_timeout(Some(Duration::from_secs(DEBUG_SEND_TIMEOUT_SECS)))
                    {
                        warn!(%err, "failed to set debugger send timeout");
                    }
                    self.conn = Some(conn);
                    self.active = true;
                    self.forked = true;
                    return Ok(SessionStart::Child);
                }
                Err(err) => {
                    return Err(ScriptingError::io(format!("fork failed: {err}")));
                }
            }
        }

        if let Err(err) =
            conn.set_send_timeout(Some(Duration::from_secs(DEBUG_SEND_TIMEOUT_SECS)))
        {
            warn!(%err, "failed to set debugger send timeout");
        }
        self.conn = Some(conn);
        self.active = true;
        self.forked = false;
        Ok(SessionStart::Sync)
    }

    /// Ends the session: flushes pending logs, sends the final reply and
    /// the `<endsession>` sentinel, then exits the forked child or closes
    /// the connection in sync mode.
    pub fn end_session(&mut self, final_reply: Option<&ReplyValue>) {
        let _ = self.flush_logs();
        if let Some(conn) = self.conn.as_mut() {
            if let Some(reply) = final_reply {
                let mut frame = Vec::new();
                reply.resp_encode(&mut frame);
                let _ = conn.write_all_bytes(&frame);
            }
            let _ = conn.write_all_bytes(END_SESSION_FRAME);
        }
        let was_forked = self.forked;
        self.conn = None;
        self.active = false;
        self.forked = false;
        if was_forked {
            // The child inherited the whole server state; its mutations die
            // with it here.
            std::process::exit(0);
        }
    }

    /// Drops the session after a connection or protocol failure.
    pub fn fail_session(&mut self, reason: &str) {
        warn!(reason, "debugger session aborted");
        self.conn = None;
        self.active = false;
    }

    /// Appends one log line, truncated to the session reply cap.
    pub fn log(&mut self, line: String) {
        let line = self.apply_maxlen(line);
        self.logs.push(line);
    }

    fn apply_maxlen(&self, line: String) -> String {
        if self.maxlen == 0 || line.len() <= self.maxlen {
            return line;
        }
        let mut cut = self.maxlen;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{} ...", &line[..cut])
    }

    /// Gets or sets the per-reply truncation cap. Zero disables the cap;
    /// requests between 1 and 59 are coerced to 60.
    pub fn set_maxlen(&mut self, len: usize) {
        self.maxlen = match len {
            0 => 0,
            1..=59 => DEBUG_MIN_MAXLEN,
            other => other,
        };
    }

    /// The current truncation cap.
    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    /// Adds a breakpoint. Returns `false` when the line is not an
    /// executable source line or the breakpoint budget is exhausted.
    pub fn add_breakpoint(&mut self, line: u32) -> bool {
        if !self.is_executable_line(line) || self.breakpoints.len() >= MAX_BREAKPOINTS {
            return false;
        }
        if !self.breakpoints.contains(&line) {
            self.breakpoints.push(line);
            self.breakpoints.sort_unstable();
        }
        true
    }

    /// Removes a breakpoint. Returns whether it existed.
    pub fn remove_breakpoint(&mut self, line: u32) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|&l| l != line);
        before != self.breakpoints.len()
    }

    /// Drops all breakpoints.
    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    /// Predicate: is there a breakpoint at this line?
    pub fn has_breakpoint(&self, line: u32) -> bool {
        self.breakpoints.contains(&line)
    }

    /// Predicate: is step mode enabled (including a pending
    /// `server.breakpoint()` request)?
    pub fn step_enabled(&self) -> bool {
        self.step || self.break_on_next
    }

    /// One-shot break requested from inside the script. Inert when no
    /// session is active; returns whether it armed.
    pub fn break_on_next_line(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.break_on_next = true;
        true
    }

    fn is_executable_line(&self, line: u32) -> bool {
        if line == 0 {
            return false;
        }
        self.source
            .get(line as usize - 1)
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    fn log_source_line(&mut self, lnum: u32) {
        let Some(text) = self.source.get(lnum as usize - 1).cloned() else {
            return;
        };
        let arrow = if lnum == self.current_line { "->" } else { "  " };
        let mark = if self.has_breakpoint(lnum) { "#" } else { " " };
        self.log(format!("{arrow}{mark}{lnum:<4}{text}"));
    }

    fn log_list(&mut self, around: u32, context: u32) {
        let total = self.source.len() as u32;
        if total == 0 {
            return;
        }
        let from = around.saturating_sub(context).max(1);
        let to = around.saturating_add(context).min(total);
        for lnum in from..=to {
            self.log_source_line(lnum);
        }
    }

    fn log_whole(&mut self) {
        for lnum in 1..=self.source.len() as u32 {
            self.log_source_line(lnum);
        }
    }

    fn log_breakpoints(&mut self) {
        if self.breakpoints.is_empty() {
            self.log("No breakpoints set.".to_string());
            return;
        }
        for line in self.breakpoints.clone() {
            self.log_source_line(line);
        }
    }

    /// Sends the buffered logs as one multi-bulk frame and clears them.
    pub fn flush_logs(&mut self) -> ScriptingResult<()> {
        let Some(conn) = self.conn.as_mut() else {
            self.logs.clear();
            return Ok(());
        };
        let mut frame = Vec::new();
        protocol::encode_log_frame(&self.logs, &mut frame);
        self.logs.clear();
        conn.write_all_bytes(&frame)
            .map_err(|err| ScriptingError::io(err.to_string()))
    }

    /// Reads one inbound command, growing the buffer as needed. Malformed
    /// input and buffer overgrowth are session-fatal.
    pub fn read_command(&mut self) -> ScriptingResult<Vec<Vec<u8>>> {
        loop {
            match parse_command(&self.cbuf) {
                ParseOutcome::Complete { argv, consumed } => {
                    self.cbuf.drain(..consumed);
                    return Ok(argv);
                }
                ParseOutcome::Corrupt(reason) => {
                    return Err(ScriptingError::protocol(reason));
                }
                ParseOutcome::Incomplete => {
                    if self.cbuf.len() > DEBUG_MAX_INPUT_BUF {
                        return Err(ScriptingError::protocol(
                            "max client buffer reached",
                        ));
                    }
                    let conn = self
                        .conn
                        .as_mut()
                        .ok_or_else(|| ScriptingError::io("no debugger connection"))?;
                    let mut chunk = [0u8; 1024];
                    let n = conn
                        .read_some(&mut chunk)
                        .map_err(|err| ScriptingError::io(err.to_string()))?;
                    if n == 0 {
                        return Err(ScriptingError::io("debugger connection closed"));
                    }
                    self.cbuf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

impl Default for ScriptDebugger {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static DEBUGGER: RefCell<ScriptDebugger> = RefCell::new(ScriptDebugger::new());
}

/// Runs `f` against this thread's debugger singleton.
///
/// Callers must not re-enter from inside `f`; the line hook below keeps
/// its borrows short so engine callbacks can use this freely.
pub fn with_debugger<R>(f: impl FnOnce(&mut ScriptDebugger) -> R) -> R {
    DEBUGGER.with(|debugger| f(&mut debugger.borrow_mut()))
}

/// Whether a debug session is active on this thread.
pub fn session_active() -> bool {
    with_debugger(|debugger| debugger.active())
}

/// `server.breakpoint()` binding: requests a stop on the next executable
/// line. Inert without an active session.
pub fn script_breakpoint() -> bool {
    with_debugger(|debugger| debugger.break_on_next_line())
}

/// `server.debug(value)` binding: logs a value from inside the script.
/// Inert without an active session.
pub fn script_debug_log(value: DebugValue) {
    with_debugger(|debugger| {
        if debugger.active() {
            let rendered = render(&value);
            debugger.log(format!("<debug> {rendered}"));
        }
    });
}

enum PromptCmd {
    Help,
    Step,
    Resume,
    List { line: Option<u32>, context: Option<u32> },
    Whole,
    Print { var: Option<String> },
    Break { specs: Vec<i64> },
    Trace,
    Eval { code: String },
    Server { argv: Vec<Vec<u8>> },
    MaxLen { len: Option<usize> },
    Abort,
    Empty,
    Unknown(String),
}

fn parse_prompt_command(argv: &[Vec<u8>]) -> PromptCmd {
    let Some(first) = argv.first() else {
        return PromptCmd::Empty;
    };
    let cmd = String::from_utf8_lossy(first).to_ascii_lowercase();
    let int_arg = |index: usize| -> Option<i64> {
        argv.get(index)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|text| text.parse::<i64>().ok())
    };
    match cmd.as_str() {
        "h" | "help" => PromptCmd::Help,
        "s" | "step" | "n" | "next" => PromptCmd::Step,
        "c" | "continue" => PromptCmd::Resume,
        "l" | "list" => PromptCmd::List {
            line: int_arg(1).and_then(|n| u32::try_from(n).ok()),
            context: int_arg(2).and_then(|n| u32::try_from(n).ok()),
        },
        "w" | "whole" => PromptCmd::Whole,
        "p" | "print" => PromptCmd::Print {
            var: argv
                .get(1)
                .map(|raw| String::from_utf8_lossy(raw).into_owned()),
        },
        "b" | "break" => PromptCmd::Break {
            specs: (1..argv.len()).filter_map(int_arg).collect(),
        },
        "t" | "trace" => PromptCmd::Trace,
        "e" | "eval" => PromptCmd::Eval {
            code: argv[1..]
                .iter()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        },
        "r" | "redis" | "v" | "valkey" => PromptCmd::Server {
            argv: argv[1..].to_vec(),
        },
        "m" | "maxlen" => PromptCmd::MaxLen {
            len: int_arg(1).and_then(|n| usize::try_from(n).ok()),
        },
        "a" | "abort" => PromptCmd::Abort,
        other => PromptCmd::Unknown(other.to_string()),
    }
}

/// The per-line hook engines call before executing each source line.
///
/// Stops when a breakpoint matches, step mode is on, or the script armed
/// `server.breakpoint()`. While stopped, drives the interactive prompt
/// until the client resumes, steps, or aborts.
pub fn debug_line_hook(target: &mut dyn DebugTarget, line: u32) -> LineAction {
    let stopped = with_debugger(|debugger| {
        if !debugger.active() {
            return false;
        }
        debugger.current_line = line;
        let breakpoint = debugger.has_breakpoint(line);
        if !(debugger.step || debugger.break_on_next || breakpoint) {
            return false;
        }
        let reason = if breakpoint {
            "break point"
        } else if debugger.break_on_next {
            "server.breakpoint()"
        } else {
            "step over"
        };
        debugger.step = false;
        debugger.break_on_next = false;
        debugger.log(format!("* Stopped at {line}, stop reason = {reason}"));
        debugger.log_source_line(line);
        true
    });
    if !stopped {
        return LineAction::Continue;
    }
    if !flush_or_fail() {
        return LineAction::Abort;
    }

    loop {
        let argv = match with_debugger(|debugger| debugger.read_command()) {
            Ok(argv) => argv,
            Err(err) => {
                with_debugger(|debugger| debugger.fail_session(&err.to_string()));
                return LineAction::Abort;
            }
        };
        match parse_prompt_command(&argv) {
            PromptCmd::Step => {
                with_debugger(|debugger| debugger.step = true);
                return LineAction::Continue;
            }
            PromptCmd::Resume => {
                return LineAction::Continue;
            }
            PromptCmd::Abort => {
                with_debugger(|debugger| debugger.log("(aborting)".to_string()));
                let _ = flush_or_fail();
                return LineAction::Abort;
            }
            PromptCmd::Help => {
                with_debugger(|debugger| {
                    for line in HELP {
                        debugger.log((*line).to_string());
                    }
                });
            }
            PromptCmd::List { line: at, context } => {
                with_debugger(|debugger| {
                    let around = at.unwrap_or(debugger.current_line);
                    debugger.log_list(around, context.unwrap_or(5));
                });
            }
            PromptCmd::Whole => {
                with_debugger(|debugger| debugger.log_whole());
            }
            PromptCmd::Break { specs } => {
                with_debugger(|debugger| {
                    if specs.is_empty() {
                        debugger.log_breakpoints();
                        return;
                    }
                    for spec in specs {
                        if spec == 0 {
                            debugger.clear_breakpoints();
                            debugger.log("All breakpoints removed.".to_string());
                        } else if spec < 0 {
                            let line = (-spec) as u32;
                            if debugger.remove_breakpoint(line) {
                                debugger.log(format!("Breakpoint removed from line {line}."));
                            } else {
                                debugger.log("<error> No breakpoint at this line.".to_string());
                            }
                        } else if debugger.add_breakpoint(spec as u32) {
                            debugger.log_source_line(spec as u32);
                        } else {
                            debugger.log(
                                "<error> Invalid or unbreakable line, or too many breakpoints."
                                    .to_string(),
                            );
                        }
                    }
                });
            }
            PromptCmd::Print { var } => {
                let values = target.locals(var.as_deref());
                with_debugger(|debugger| {
                    if values.is_empty() {
                        debugger.log("No such variable.".to_string());
                    }
                    for (name, value) in values {
                        let rendered = render(&value);
                        debugger.log(format!("<value> {name} = {rendered}"));
                    }
                });
            }
            PromptCmd::Trace => {
                let frames = target.backtrace();
                with_debugger(|debugger| {
                    debugger.log("<backtrace>".to_string());
                    for frame in frames {
                        debugger.log(frame);
                    }
                });
            }
            PromptCmd::Eval { code } => {
                let result = target.eval_fragment(&code);
                with_debugger(|debugger| match result {
                    Ok(value) => {
                        let rendered = render(&value);
                        debugger.log(format!("<retval> {rendered}"));
                    }
                    Err(message) => debugger.log(format!("<error> {message}")),
                });
            }
            PromptCmd::Server { argv } => {
                if argv.is_empty() {
                    with_debugger(|debugger| {
                        debugger.log("<error> Missing command to execute.".to_string());
                    });
                } else {
                    let echo = argv
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<Vec<_>>()
                        .join(" ");
                    let reply = target.server_command(&argv);
                    with_debugger(|debugger| {
                        debugger.log(format!("<server> {echo}"));
                        let rendered = render(&DebugValue::from(&reply));
                        debugger.log(format!("<reply> {rendered}"));
                    });
                }
            }
            PromptCmd::MaxLen { len } => {
                with_debugger(|debugger| {
                    if let Some(len) = len {
                        debugger.set_maxlen(len);
                    }
                    let current = debugger.maxlen();
                    if current == 0 {
                        debugger.log("<maxlen> unlimited".to_string());
                    } else {
                        debugger.log(format!("<maxlen> {current}"));
                    }
                });
            }
            PromptCmd::Empty => {}
            PromptCmd::Unknown(cmd) => {
                with_debugger(|debugger| {
                    debugger.log(format!(
                        "<error> Unknown debugger command '{cmd}', try 'help'."
                    ));
                });
            }
        }
        if !flush_or_fail() {
            return LineAction::Abort;
        }
    }
}

fn flush_or_fail() -> bool {
    with_debugger(|debugger| match debugger.flush_logs() {
        Ok(()) => true,
        Err(err) => {
            debugger.fail_session(&err.to_string());
            false
        }
    })
}
