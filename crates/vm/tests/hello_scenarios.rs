//! End-to-end scenarios driving the hello engine through the dispatcher.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ember_core::{digest, CommandRunner, InlineLazyFree, ReplyValue};
use ember_scripting::{ScriptingConfig, ScriptingSubsystem, SharedRunner};
use ember_vm::{HelloEngine, ENGINE_NAME};

struct NullRunner;

impl CommandRunner for NullRunner {
    fn execute(&mut self, _argv: &[Vec<u8>]) -> ReplyValue {
        ReplyValue::Null
    }
}

fn runner() -> SharedRunner {
    Arc::new(Mutex::new(NullRunner))
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
        .register_engine(ENGINE_NAME, None, Box::new(HelloEngine::new()))
        .unwrap();
    subsystem
}

#[test]
fn fcall_passes_script_arguments() {
    let mut subsystem = subsystem();
    let body = "#!hello flags=no-writes\nFUNCTION foo ARGS 0 RETURN";
    let loaded = subsystem.dispatch_function(&argv(&["FUNCTION", "LOAD", body]));
    assert_eq!(loaded, ReplyValue::Array(vec![ReplyValue::bulk("foo")]));

    let reply = subsystem.dispatch_fcall(runner(), &argv(&["FCALL", "foo", "0", "7"]));
    assert_eq!(reply, ReplyValue::Integer(7));
}

#[test]
fn eval_with_explicit_engine_tag() {
    let mut subsystem = subsystem();
    let body = "#!hello\nFUNCTION f CONSTI 41 RETURN";
    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", body, "0"]));
    assert_eq!(reply, ReplyValue::Integer(41));

    // The digest now resolves through SCRIPT EXISTS and EVALSHA.
    let sha = digest::sha1_hex(body.as_bytes());
    let exists = subsystem.dispatch_script(&argv(&["SCRIPT", "EXISTS", &sha]));
    assert_eq!(exists, ReplyValue::Array(vec![ReplyValue::Integer(1)]));
    let reply = subsystem.dispatch_evalsha(runner(), &argv(&["EVALSHA", &sha, "0"]));
    assert_eq!(reply, ReplyValue::Integer(41));
}

#[test]
fn script_kill_interrupts_sleep_within_poll_interval() {
    let mut subsystem = subsystem();
    let handle = subsystem.kill_handle();
    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        loop {
            match handle.kill() {
                Err(ember_scripting::ScriptingError::NotBusy) => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                kill_reply => return (Instant::now(), kill_reply),
            }
        }
    });

    let body = "#!hello\nFUNCTION baz CONSTI 5 SLEEP CONSTI 0 RETURN";
    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", body, "0"]));
    let returned = Instant::now();
    assert_eq!(
        reply,
        ReplyValue::Error("ERR Script killed by user with SCRIPT KILL.".to_string())
    );

    let (kill_time, kill_reply) = killer.join().unwrap();
    assert_eq!(kill_reply.unwrap(), ReplyValue::ok());
    // SLEEP polls every millisecond; allow scheduler jitter on top.
    assert!(returned.duration_since(kill_time) < Duration::from_millis(50));
}

#[test]
fn lru_eviction_keeps_loaded_scripts() {
    let mut subsystem = subsystem();

    let loaded_body = "#!hello\nFUNCTION keep CONSTI 9 RETURN";
    let loaded = subsystem.dispatch_script(&argv(&["SCRIPT", "LOAD", loaded_body]));
    let ReplyValue::Bulk(sha_l) = loaded else {
        panic!("expected digest reply");
    };
    let sha_l = String::from_utf8(sha_l).unwrap();

    // 500 distinct EVAL admissions fill the LRU list exactly.
    let eval_body = |n: u32| format!("#!hello\nFUNCTION f CONSTI {n} RETURN");
    for n in 1..=500 {
        let body = eval_body(n);
        let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", &body, "0"]));
        assert_eq!(reply, ReplyValue::Integer(n as i64));
    }
    assert_eq!(subsystem.cache().lru_len(), 500);
    assert_eq!(subsystem.stats().evicted_scripts, 0);

    // The 501st admission evicts exactly the oldest tracked entry.
    let body = eval_body(501);
    subsystem.dispatch_eval(runner(), &argv(&["EVAL", &body, "0"]));
    assert_eq!(subsystem.cache().lru_len(), 500);
    assert_eq!(subsystem.stats().evicted_scripts, 1);

    let sha_e1 = digest::sha1_hex(eval_body(1).as_bytes());
    let sha_e2 = digest::sha1_hex(eval_body(2).as_bytes());
    let sha_e501 = digest::sha1_hex(eval_body(501).as_bytes());
    let exists = subsystem.dispatch_script(&argv(&[
        "SCRIPT", "EXISTS", &sha_l, &sha_e1, &sha_e2, &sha_e501,
    ]));
    assert_eq!(
        exists,
        ReplyValue::Array(vec![
            ReplyValue::Integer(1),
            ReplyValue::Integer(0),
            ReplyValue::Integer(1),
            ReplyValue::Integer(1),
        ])
    );
    subsystem.cache().check_invariants();
}

#[test]
fn script_show_returns_exact_body() {
    let mut subsystem = subsystem();
    let body = "#!hello\nFUNCTION f CONSTI 1 RETURN";
    let loaded = subsystem.dispatch_script(&argv(&["SCRIPT", "LOAD", body]));
    let ReplyValue::Bulk(sha) = loaded else {
        panic!("expected digest reply");
    };
    let sha = String::from_utf8(sha).unwrap();

    let shown = subsystem.dispatch_script(&argv(&["SCRIPT", "SHOW", &sha]));
    assert_eq!(shown, ReplyValue::bulk(body));

    let missing = subsystem.dispatch_script(&argv(&[
        "SCRIPT",
        "SHOW",
        "da39a3ee5e6b4b0d3255bfef95601890afd80709",
    ]));
    assert_eq!(
        missing,
        ReplyValue::Error("NOSCRIPT No matching script. Please use EVAL.".to_string())
    );
}

#[test]
fn flush_resets_engine_eval_memory() {
    let mut subsystem = subsystem();
    let body = "#!hello\nFUNCTION f CONSTI 1 RETURN";
    subsystem.dispatch_eval(runner(), &argv(&["EVAL", body, "0"]));
    assert!(
        subsystem
            .registry()
            .memory_info(ember_scripting::Subsystem::Eval)
            .used_memory
            > 0
    );

    subsystem.dispatch_script(&argv(&["SCRIPT", "FLUSH", "SYNC"]));
    assert_eq!(subsystem.cache().len(), 0);
    assert_eq!(
        subsystem
            .registry()
            .memory_info(ember_scripting::Subsystem::Eval)
            .used_memory,
        0
    );
}

#[test]
fn no_writes_scripts_run_on_readonly_replica() {
    let mut subsystem = subsystem();
    subsystem.set_readonly_replica(true);

    let declared = "#!hello flags=no-writes\nFUNCTION f CONSTI 3 RETURN";
    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", declared, "0"]));
    assert_eq!(reply, ReplyValue::Integer(3));

    let compat = "FUNCTION f CONSTI 3 RETURN";
    let reply = subsystem.dispatch_eval(runner(), &argv(&["EVAL", compat, "0"]));
    assert_eq!(
        reply,
        ReplyValue::Error("READONLY You can't write against a read only replica.".to_string())
    );
}
