//! End-to-end scenarios driving the rhai engine through the dispatcher,
//! including interactive debug sessions.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_core::{digest, CommandRunner, InlineLazyFree, ReplyValue};
use ember_rhai::{RhaiScriptEngine, ENGINE_NAME};
use ember_scripting::debugger::{children, DebugConnection};
use ember_scripting::{
    DebugSessionOutcome, ScriptingConfig, ScriptingSubsystem, SharedRunner,
};

struct RecordingRunner {
    commands: Vec<Vec<Vec<u8>>>,
    reply: ReplyValue,
}

impl CommandRunner for RecordingRunner {
    fn execute(&mut self, argv: &[Vec<u8>]) -> ReplyValue {
        self.commands.push(argv.to_vec());
        self.reply.clone()
    }
}

fn runner_with(reply: ReplyValue) -> (SharedRunner, Arc<Mutex<RecordingRunner>>) {
    let recording = Arc::new(Mutex::new(RecordingRunner {
        commands: Vec::new(),
        reply,
    }));
    let shared: SharedRunner = recording.clone();
    (shared, recording)
}

fn runner() -> SharedRunner {
    runner_with(ReplyValue::Null).0
}

fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

fn subsystem() -> ScriptingSubsystem {
    let config = ScriptingConfig {
        default_engine: ENGINE_NAME.to_string(),
        ..ScriptingConfig::default()
    };
    let mut subsystem = ScriptingSubsystem::new(config, Arc::new(InlineLazyFree));
    subsystem
        .register_engine(ENGINE_NAME, None, Box::new(RhaiScriptEngine::new()))
        .unwrap();
    subsystem
}

/// Scripted in-memory debug connection for synchronous sessions.
struct ScriptedConn {
    inbound: VecDeque<Vec<u8>>,
    outbound: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedConn {
    fn new(commands: &[&[&str]]) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let mut inbound = VecDeque::new();
        for parts in commands {
            let mut frame = format!("*{}\r\n", parts.len()).into_bytes();
            for part in *parts {
                frame.extend_from_slice(format!("${}\r\n{part}\r\n", part.len()).as_bytes());
            }
            inbound.push_back(frame);
        }
        let outbound = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inbound,
                outbound: outbound.clone(),
            },
            outbound,
        )
    }
}

impl DebugConnection for ScriptedConn {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.inbound.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            None => Ok(0),
        }
    }

    fn write_all_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.outbound.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn set_send_timeout(&mut self, _timeout: Option<Duration>) -> std::io::Result<()> {
        Ok(())
    }
}

fn output_string(outbound: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&outbound.lock().unwrap()).into_owned()
}

#[test]
fn eval_returns_script_value() {
    let mut subsystem = subsystem();
    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", "#!rhai\n1 + 1", "0"]));
    assert_eq!(reply, ReplyValue::Integer(2));

    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", "\"ok\"", "0"]));
    assert_eq!(reply, ReplyValue::bulk("ok"));

    // The second script is now cached under its digest.
    let sha = digest::sha1_hex(b"\"ok\"");
    let exists = subsystem.dispatch_script(&argv(&["SCRIPT", "EXISTS", &sha]));
    assert_eq!(exists, ReplyValue::Array(vec![ReplyValue::Integer(1)]));
}

#[test]
fn scripts_reach_the_server_through_their_caller() {
    let mut subsystem = subsystem();
    let (runner, recording) = runner_with(ReplyValue::Integer(3));
    let script = "server::call(\"INCRBY\", KEYS[0], ARGV[0])";
    let reply = subsystem.dispatch_eval(
        runner,
        &argv(&["EVAL", script, "1", "counter", "3"]),
    );
    assert_eq!(reply, ReplyValue::Integer(3));
    let commands = &recording.lock().unwrap().commands;
    assert_eq!(
        commands[0],
        vec![b"INCRBY".to_vec(), b"counter".to_vec(), b"3".to_vec()]
    );
}

#[test]
fn function_load_and_fcall_round_trip() {
    let mut subsystem = subsystem();
    let library = r#"#!rhai flags=no-writes
server::register_function(#{
    name: "myfunc",
    callback: |keys, args| args[0].parse_int() + 1,
});
"#;
    let loaded = subsystem.dispatch_function(&argv(&["FUNCTION", "LOAD", library]));
    assert_eq!(loaded, ReplyValue::Array(vec![ReplyValue::bulk("myfunc")]));

    let reply = subsystem.dispatch_fcall(runner(), &argv(&["FCALL", "myfunc", "0", "41"]));
    assert_eq!(reply, ReplyValue::Integer(42));
}

#[test]
fn function_load_timeout_registers_nothing() {
    let config = ScriptingConfig {
        default_engine: ENGINE_NAME.to_string(),
        function_load_timeout_ms: 100,
        ..ScriptingConfig::default()
    };
    let mut subsystem = ScriptingSubsystem::new(config, Arc::new(InlineLazyFree));
    subsystem
        .register_engine(ENGINE_NAME, None, Box::new(RhaiScriptEngine::new()))
        .unwrap();

    let reply =
        subsystem.dispatch_function(&argv(&["FUNCTION", "LOAD", "#!rhai\nwhile true { }"]));
    assert!(
        matches!(&reply, ReplyValue::Error(message) if message.contains("timed out")),
        "unexpected reply: {reply:?}"
    );
    assert_eq!(subsystem.library().count(), 0);
}

#[test]
fn script_kill_interrupts_busy_loop() {
    let mut subsystem = subsystem();
    let handle = subsystem.kill_handle();
    let killer = std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(20));
        match handle.kill() {
            Err(ember_scripting::ScriptingError::NotBusy) => continue,
            other => return other,
        }
    });
    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", "while true { }", "0"]));
    assert_eq!(
        reply,
        ReplyValue::Error("ERR Script killed by user with SCRIPT KILL.".to_string())
    );
    killer.join().unwrap().unwrap();
}

#[test]
fn sync_debug_session_steps_and_prints() {
    let mut subsystem = subsystem();
    subsystem.dispatch_script(&argv(&["SCRIPT", "DEBUG", "SYNC"]));

    let script = "let x = 7;\nx + 1";
    let (conn, outbound) = ScriptedConn::new(&[&["s"], &["p", "x"], &["c"]]);
    let outcome = subsystem
        .debug_eval(runner(), &argv(&["EVAL", script, "0"]), Box::new(conn))
        .unwrap();
    assert_eq!(outcome, DebugSessionOutcome::Completed);

    let output = output_string(&outbound);
    assert!(output.contains("Stopped at 1"), "output: {output}");
    assert!(output.contains("<value> x = (integer) 7"), "output: {output}");
    assert!(output.contains(":8\r\n"), "output: {output}");
    assert!(output.ends_with("+<endsession>\r\n"), "output: {output}");

    // One session per arming.
    assert_eq!(subsystem.debug_mode(), ember_scripting::DebugMode::No);
}

#[test]
fn debug_session_eval_fragment_and_server_command() {
    let mut subsystem = subsystem();
    subsystem.dispatch_script(&argv(&["SCRIPT", "DEBUG", "SYNC"]));

    let (runner, _recording) = runner_with(ReplyValue::Integer(7));
    let (conn, outbound) = ScriptedConn::new(&[&["e", "21", "*", "2"], &["r", "GET", "k"], &["c"]]);
    subsystem
        .debug_eval(runner, &argv(&["EVAL", "1 + 2", "0"]), Box::new(conn))
        .unwrap();

    let output = output_string(&outbound);
    assert!(output.contains("<retval> (integer) 42"), "output: {output}");
    assert!(output.contains("<reply> (integer) 7"), "output: {output}");
    assert!(output.contains(":3\r\n"), "output: {output}");
}

#[test]
fn script_breakpoint_stops_on_next_line() {
    let mut subsystem = subsystem();
    subsystem.dispatch_script(&argv(&["SCRIPT", "DEBUG", "SYNC"]));

    let script = "let a = 1;\nserver::breakpoint();\nlet b = 2;\na + b";
    let (conn, outbound) = ScriptedConn::new(&[&["c"], &["c"]]);
    subsystem
        .debug_eval(runner(), &argv(&["EVAL", script, "0"]), Box::new(conn))
        .unwrap();

    let output = output_string(&outbound);
    assert!(
        output.contains("stop reason = server.breakpoint()"),
        "output: {output}"
    );
    assert!(output.contains(":3\r\n"), "output: {output}");
}

#[test]
fn server_debug_logs_are_flushed() {
    let mut subsystem = subsystem();
    subsystem.dispatch_script(&argv(&["SCRIPT", "DEBUG", "SYNC"]));

    let (conn, outbound) = ScriptedConn::new(&[&["c"]]);
    subsystem
        .debug_eval(
            runner(),
            &argv(&["EVAL", "server::debug(42);\n1", "0"]),
            Box::new(conn),
        )
        .unwrap();

    let output = output_string(&outbound);
    assert!(output.contains("<debug> (integer) 42"), "output: {output}");
}

#[test]
fn aborted_debug_session_reports_error() {
    let mut subsystem = subsystem();
    subsystem.dispatch_script(&argv(&["SCRIPT", "DEBUG", "SYNC"]));

    let (conn, outbound) = ScriptedConn::new(&[&["a"]]);
    subsystem
        .debug_eval(runner(), &argv(&["EVAL", "1 + 2", "0"]), Box::new(conn))
        .unwrap();

    let output = output_string(&outbound);
    assert!(
        output.contains("Script aborted for user request"),
        "output: {output}"
    );
    assert!(output.ends_with("+<endsession>\r\n"), "output: {output}");
}

#[test]
fn forked_debug_session_detaches_parent() {
    let mut subsystem = subsystem();
    subsystem.dispatch_script(&argv(&["SCRIPT", "DEBUG", "YES"]));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    let (session_side, _) = listener.accept().unwrap();

    let outcome = subsystem
        .debug_eval(
            runner(),
            &argv(&["EVAL", "1 + 2", "0"]),
            Box::new(session_side),
        )
        .unwrap();
    let DebugSessionOutcome::Detached { child } = outcome else {
        panic!("expected a detached parent, got {outcome:?}");
    };
    assert!(child > 0);
    assert!(children::pending_count() >= 1);

    // Drive the child session from the client end: step, then continue.
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"*1\r\n$1\r\ns\r\n*1\r\n$1\r\nc\r\n").unwrap();

    let mut output = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                output.extend_from_slice(&chunk[..n]);
                if output.windows(14).any(|w| w == b"+<endsession>\r") {
                    break;
                }
            }
            Err(err) => panic!("debug client read failed: {err}"),
        }
    }
    let output = String::from_utf8_lossy(&output).into_owned();
    assert!(output.contains("Stopped at 1"), "output: {output}");
    assert!(output.contains(":3\r\n"), "output: {output}");
    assert!(output.contains("<endsession>"), "output: {output}");

    // The child exits on its own; reap it.
    children::kill_all();
    assert_eq!(children::pending_count(), 0);
}
