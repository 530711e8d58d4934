//! End-to-end interpreter tests over loaded JSON scripts.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vega_script::{ScriptError, TaskInterpreter};

#[tokio::test]
async fn linear_script_variables_arithmetic() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "linear",
            json!([
                {"type": "assign", "variable": "x", "value": 5},
                {"type": "assign", "variable": "y", "value": {"$add": ["$x", 7]}},
                {"type": "return", "value": "$y"}
            ]),
        )
        .expect("load");

    interpreter.run("linear").await.expect("run");

    assert_eq!(interpreter.get_variable("y"), Some(json!(12)));
    assert_eq!(interpreter.get_variable("__return_value__"), Some(json!(12)));
}

#[tokio::test]
async fn while_loop_counts_down() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "countdown",
            json!([
                {"type": "assign", "variable": "x", "value": 3},
                {"type": "while", "condition": {"$gt": ["$x", 0]}, "steps": [
                    {"type": "print", "message": "x is $x"},
                    {"type": "assign", "variable": "x", "value": {"$sub": ["$x", 1]}}
                ]}
            ]),
        )
        .expect("load");

    interpreter.run("countdown").await.expect("run");
    assert_eq!(interpreter.get_variable("x"), Some(json!(0)));
}

#[tokio::test]
async fn try_catch_typed_match_and_finally() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .register_function("bad_fn", |_| {
            Err(ScriptError::InvalidArgument("bad".to_string()))
        })
        .expect("register");
    interpreter
        .load_script(
            "guarded",
            json!([
                {"type": "try",
                 "try": [{"type": "call", "function": "bad_fn", "params": {}}],
                 "catch": [
                     {"type": "invalid_argument", "steps": [
                         {"type": "assign", "variable": "caught", "value": true}
                     ]}
                 ],
                 "finally": [
                     {"type": "assign", "variable": "ran", "value": true}
                 ]}
            ]),
        )
        .expect("load");

    interpreter.run("guarded").await.expect("run");
    assert_eq!(interpreter.get_variable("caught"), Some(json!(true)));
    assert_eq!(interpreter.get_variable("ran"), Some(json!(true)));
}

#[tokio::test]
async fn unmatched_catch_type_rethrows() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "unmatched",
            json!([
                {"type": "try",
                 "try": [{"type": "throw", "exception_type": "out_of_range", "message": "x"}],
                 "catch": [{"type": "runtime_error", "steps": []}],
                 "finally": [{"type": "assign", "variable": "ran", "value": true}]}
            ]),
        )
        .expect("load");

    let err = interpreter.run("unmatched").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::OutOfRange(_)));
    assert_eq!(interpreter.get_variable("ran"), Some(json!(true)));
}

#[tokio::test]
async fn retry_with_exponential_backoff() {
    let interpreter = TaskInterpreter::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    interpreter
        .register_function("flaky_fn", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ScriptError::Runtime("transient".to_string()))
            } else {
                Ok(Value::Null)
            }
        })
        .expect("register");
    interpreter
        .load_script(
            "persistent",
            json!([
                {"type": "retry", "retries": 3, "delay": 10,
                 "exponential_backoff": true,
                 "steps": [{"type": "call", "function": "flaky_fn", "params": {}}]}
            ]),
        )
        .expect("load");

    let started = Instant::now();
    interpreter.run("persistent").await.expect("run");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn retry_exhaustion_rethrows() {
    let interpreter = TaskInterpreter::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    interpreter
        .register_function("always_fails", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ScriptError::Runtime("down".to_string()))
        })
        .expect("register");
    interpreter
        .load_script(
            "doomed",
            json!([
                {"type": "retry", "retries": 2, "delay": 1,
                 "steps": [{"type": "call", "function": "always_fails", "params": {}}]}
            ]),
        )
        .expect("load");

    let err = interpreter.run("doomed").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::Runtime(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn event_rendezvous_between_scripts() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "listener",
            json!([
                {"type": "listen_event", "event_names": ["ready"], "channel": "c",
                 "timeout": 1000,
                 "steps": [
                     {"type": "assign", "variable": "got", "value": true},
                     {"type": "assign", "variable": "payload", "value": "$__event_data__"}
                 ]}
            ]),
        )
        .expect("load");

    let worker = interpreter.execute("listener");
    tokio::time::sleep(Duration::from_millis(50)).await;
    interpreter.broadcast_event("ready", "c", json!({"k": 1}));

    worker.await.expect("join").expect("run");
    assert_eq!(interpreter.get_variable("got"), Some(json!(true)));
    assert_eq!(interpreter.get_variable("payload"), Some(json!({"k": 1})));
}

#[tokio::test]
async fn event_delivery_is_fifo_per_key() {
    let interpreter = TaskInterpreter::new();
    interpreter.broadcast_event("tick", "default", json!(1));
    interpreter.broadcast_event("tick", "default", json!(2));
    interpreter
        .load_script(
            "drain",
            json!([
                {"type": "listen_event", "event_names": ["tick"], "timeout": 100,
                 "steps": [{"type": "assign", "variable": "p1", "value": "$__event_data__"}]},
                {"type": "listen_event", "event_names": ["tick"], "timeout": 100,
                 "steps": [{"type": "assign", "variable": "p2", "value": "$__event_data__"}]}
            ]),
        )
        .expect("load");

    interpreter.run("drain").await.expect("run");
    assert_eq!(interpreter.get_variable("p1"), Some(json!(1)));
    assert_eq!(interpreter.get_variable("p2"), Some(json!(2)));
}

#[tokio::test]
async fn listen_event_timeout_is_not_an_error() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "patient",
            json!([
                {"type": "listen_event", "event_names": ["never"], "timeout": 50,
                 "steps": [{"type": "assign", "variable": "heard", "value": true}]},
                {"type": "assign", "variable": "after", "value": true}
            ]),
        )
        .expect("load");

    interpreter.run("patient").await.expect("run");
    assert_eq!(interpreter.get_variable("heard"), None);
    assert_eq!(interpreter.get_variable("after"), Some(json!(true)));
}

#[tokio::test]
async fn goto_and_labels() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "looper",
            json!([
                {"type": "assign", "variable": "x", "value": 0},
                {"type": "message", "label": "start"},
                {"type": "assign", "variable": "x", "value": {"$add": ["$x", 1]}},
                {"type": "condition", "condition": {"$eq": ["$x", 3]},
                 "true": {"type": "goto", "label": "end"},
                 "false": {"type": "goto", "label": "start"}},
                {"type": "message", "label": "end"}
            ]),
        )
        .expect("load");

    interpreter.run("looper").await.expect("run");
    assert_eq!(interpreter.get_variable("x"), Some(json!(3)));
}

#[tokio::test]
async fn runaway_goto_is_bounded() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "runaway",
            json!([
                {"type": "message", "label": "top"},
                {"type": "goto", "label": "top"}
            ]),
        )
        .expect("load");

    let err = interpreter.run("runaway").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::GotoDepthExceeded(_)));
}

#[tokio::test]
async fn goto_to_missing_label_fails() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script("lost", json!([{"type": "goto", "label": "nowhere"}]))
        .expect("load");

    let err = interpreter.run("lost").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::UnknownLabel(_)));
}

#[tokio::test]
async fn switch_selects_first_match_then_default() {
    let interpreter = TaskInterpreter::new();
    interpreter.set_variable("mode", json!(7)).expect("set");
    interpreter
        .load_script(
            "chooser",
            json!([
                {"type": "switch", "variable": "mode", "cases": [
                    {"case": 7, "steps": [
                        {"type": "assign", "variable": "picked", "value": "seven"}
                    ]},
                    {"case": 8, "steps": [
                        {"type": "assign", "variable": "picked", "value": "eight"}
                    ]}
                ],
                "default": {"steps": [
                    {"type": "assign", "variable": "picked", "value": "other"}
                ]}}
            ]),
        )
        .expect("load");

    interpreter.run("chooser").await.expect("run");
    assert_eq!(interpreter.get_variable("picked"), Some(json!("seven")));

    interpreter.set_variable("mode", json!(99)).expect("set");
    interpreter.run("chooser").await.expect("run");
    assert_eq!(interpreter.get_variable("picked"), Some(json!("other")));
}

#[tokio::test]
async fn parallel_join_runs_every_child() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "fanout",
            json!([
                {"type": "parallel", "steps": [
                    {"type": "assign", "variable": "a", "value": 1},
                    {"type": "parallel", "steps": [
                        {"type": "assign", "variable": "b", "value": 2},
                        {"type": "assign", "variable": "c", "value": 3}
                    ]}
                ]}
            ]),
        )
        .expect("load");

    interpreter.run("fanout").await.expect("run");
    assert_eq!(interpreter.get_variable("a"), Some(json!(1)));
    assert_eq!(interpreter.get_variable("b"), Some(json!(2)));
    assert_eq!(interpreter.get_variable("c"), Some(json!(3)));
}

#[tokio::test]
async fn parallel_propagates_child_fault_after_join() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "fanout_fail",
            json!([
                {"type": "parallel", "steps": [
                    {"type": "assign", "variable": "ok_child", "value": true},
                    {"type": "throw", "exception_type": "runtime_error", "message": "boom"}
                ]}
            ]),
        )
        .expect("load");

    let err = interpreter.run("fanout_fail").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::Runtime(_)));
    assert_eq!(interpreter.get_variable("ok_child"), Some(json!(true)));
}

#[tokio::test]
async fn function_def_closure_with_defaults() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "adder",
            json!([
                {"type": "function_def", "name": "add_pair",
                 "params": ["a", "b"],
                 "default_values": {"b": 10},
                 "steps": [
                     {"type": "return", "value": {"$add": ["$a", "$b"]}}
                 ]},
                {"type": "call", "function": "add_pair", "params": {"a": 5},
                 "result": "with_default"},
                {"type": "call", "function": "add_pair", "params": {"a": 3, "b": 4},
                 "result": "explicit"}
            ]),
        )
        .expect("load");

    interpreter.run("adder").await.expect("run");
    assert_eq!(interpreter.get_variable("with_default"), Some(json!(15)));
    assert_eq!(interpreter.get_variable("explicit"), Some(json!(7)));
}

#[tokio::test]
async fn closure_snapshot_is_by_value() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "capture",
            json!([
                {"type": "assign", "variable": "base", "value": 100},
                {"type": "function_def", "name": "offset",
                 "params": ["d"],
                 "steps": [{"type": "return", "value": {"$add": ["$base", "$d"]}}]},
                // Redefining base after capture must not affect the closure.
                {"type": "assign", "variable": "base", "value": 999},
                {"type": "call", "function": "offset", "params": {"d": 1},
                 "result": "seen"}
            ]),
        )
        .expect("load");

    interpreter.run("capture").await.expect("run");
    assert_eq!(interpreter.get_variable("seen"), Some(json!(101)));
    // The captured binding is restored after the call.
    assert_eq!(interpreter.get_variable("base"), Some(json!(999)));
}

#[tokio::test]
async fn recursive_function_def() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "factorial",
            json!([
                {"type": "function_def", "name": "factorial",
                 "params": ["n"],
                 "steps": [
                     {"type": "condition", "condition": {"$lt": ["$n", 2]},
                      "true": {"type": "return", "value": 1}},
                     {"type": "assign", "variable": "n_minus_1",
                      "value": {"$sub": ["$n", 1]}},
                     {"type": "call", "function": "factorial",
                      "params": {"n": "$n_minus_1"}, "result": "sub_result"},
                     {"type": "return", "value": {"$mul": ["$n", "$sub_result"]}}
                 ]},
                {"type": "call", "function": "factorial", "params": {"n": 5},
                 "result": "factorial_result"}
            ]),
        )
        .expect("load");

    interpreter.run("factorial").await.expect("run");
    assert_eq!(
        interpreter.get_variable("factorial_result"),
        Some(json!(120))
    );
}

#[tokio::test]
async fn scope_shadows_and_restores() {
    let interpreter = TaskInterpreter::new();
    interpreter.set_variable("shared", json!(1)).expect("set");
    interpreter
        .load_script(
            "scoped",
            json!([
                {"type": "scope",
                 "variables": {"local_var": 42, "shared": 5},
                 "steps": [
                     {"type": "assign", "variable": "local_var",
                      "value": {"$add": ["$local_var", 1]}},
                     {"type": "assign", "variable": "inside",
                      "value": "$shared"}
                 ],
                 "cleanup": [
                     {"type": "assign", "variable": "cleaned", "value": true}
                 ]}
            ]),
        )
        .expect("load");

    interpreter.run("scoped").await.expect("run");
    // Declared-only variables vanish on exit; shadowed ones revert.
    assert_eq!(interpreter.get_variable("local_var"), None);
    assert_eq!(interpreter.get_variable("shared"), Some(json!(1)));
    assert_eq!(interpreter.get_variable("inside"), Some(json!(5)));
    assert_eq!(interpreter.get_variable("cleaned"), Some(json!(true)));
}

#[tokio::test]
async fn scope_runs_on_error_and_rethrows() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "scoped_fault",
            json!([
                {"type": "scope",
                 "variables": {"tmp": 1},
                 "steps": [
                     {"type": "throw", "exception_type": "runtime_error", "message": "x"}
                 ],
                 "on_error": [
                     {"type": "assign", "variable": "handled", "value": true}
                 ],
                 "cleanup": [
                     {"type": "assign", "variable": "cleaned", "value": true}
                 ]}
            ]),
        )
        .expect("load");

    let err = interpreter.run("scoped_fault").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::Runtime(_)));
    assert_eq!(interpreter.get_variable("handled"), Some(json!(true)));
    assert_eq!(interpreter.get_variable("cleaned"), Some(json!(true)));
    assert_eq!(interpreter.get_variable("tmp"), None);
}

#[tokio::test]
async fn nested_script_shares_state() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "inner",
            json!([{"type": "assign", "variable": "from_inner", "value": 7}]),
        )
        .expect("load");
    interpreter
        .load_script(
            "outer",
            json!([
                {"type": "nested_script", "script": "inner"},
                {"type": "assign", "variable": "total",
                 "value": {"$add": ["$from_inner", 1]}}
            ]),
        )
        .expect("load");

    interpreter.run("outer").await.expect("run");
    assert_eq!(interpreter.get_variable("total"), Some(json!(8)));
}

#[tokio::test]
async fn import_executes_auto_execute_scripts() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "scriptA",
            json!({
                "header": {"name": "Initialization", "version": "1.0.1",
                           "auto_execute": true},
                "steps": [
                    {"type": "assign", "variable": "initialized", "value": true},
                    {"type": "assign", "variable": "a", "value": 100}
                ]
            }),
        )
        .expect("load");
    interpreter
        .load_script(
            "scriptB",
            json!([
                {"type": "import", "script": "scriptA"},
                {"type": "assign", "variable": "b", "value": {"$": "a + 1"}}
            ]),
        )
        .expect("load");

    interpreter.run("scriptB").await.expect("run");
    assert_eq!(interpreter.get_variable("a"), Some(json!(100)));
    assert_eq!(interpreter.get_variable("b"), Some(json!(101)));
}

#[tokio::test]
async fn import_from_file_with_namespace() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("calib.json"),
        serde_json::to_string(&json!({
            "header": {"auto_execute": true},
            "steps": [{"type": "assign", "variable": "dark_frames", "value": 20}]
        }))
        .expect("serialize"),
    )
    .expect("write script");

    let interpreter = TaskInterpreter::new();
    interpreter.set_task_dir(dir.path());
    interpreter
        .load_script(
            "session",
            json!([
                {"type": "import", "script": "calib", "fromFile": true,
                 "namespace": "night1"}
            ]),
        )
        .expect("load");

    interpreter.run("session").await.expect("run");
    assert!(interpreter.has_script("night1::calib"));
    assert_eq!(interpreter.get_variable("dark_frames"), Some(json!(20)));
}

#[tokio::test]
async fn schedule_inline_delays_steps() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "delayed",
            json!([
                {"type": "schedule", "delay": 50, "steps": [
                    {"type": "assign", "variable": "done", "value": true}
                ]}
            ]),
        )
        .expect("load");

    let started = Instant::now();
    interpreter.run("delayed").await.expect("run");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(interpreter.get_variable("done"), Some(json!(true)));
}

#[tokio::test]
async fn stop_interrupts_long_delay() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "sleeper",
            json!([
                {"type": "delay", "milliseconds": 60000},
                {"type": "assign", "variable": "finished", "value": true}
            ]),
        )
        .expect("load");

    let worker = interpreter.execute("sleeper");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    interpreter.stop();
    worker.await.expect("join").expect("run");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(interpreter.get_variable("finished"), None);
    assert!(!interpreter.is_running());
    interpreter.reset_stop();
}

#[tokio::test]
async fn stop_during_try_still_runs_finally() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "guarded_sleeper",
            json!([
                {"type": "try",
                 "try": [{"type": "delay", "milliseconds": 60000}],
                 "finally": [
                     {"type": "assign", "variable": "cleaned", "value": true}
                 ]},
                {"type": "assign", "variable": "after_try", "value": true}
            ]),
        )
        .expect("load");

    let worker = interpreter.execute("guarded_sleeper");
    tokio::time::sleep(Duration::from_millis(50)).await;
    interpreter.stop();
    worker.await.expect("join").expect("run");

    // Cleanup ran; the step after the try did not.
    assert_eq!(interpreter.get_variable("cleaned"), Some(json!(true)));
    assert_eq!(interpreter.get_variable("after_try"), None);
    interpreter.reset_stop();
}

#[tokio::test]
async fn exception_handler_consumes_fault() {
    let interpreter = TaskInterpreter::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    interpreter.register_exception_handler("fragile", move |fault| {
        assert_eq!(fault.kind(), "runtime_error");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    interpreter
        .load_script(
            "fragile",
            json!([{"type": "throw", "exception_type": "runtime_error",
                    "message": "device lost"}]),
        )
        .expect("load");

    interpreter.run("fragile").await.expect("handler consumes fault");
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn assignment_type_mismatch_faults() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "mismatch",
            json!([
                {"type": "assign", "variable": "x", "value": 5},
                {"type": "assign", "variable": "x", "value": "text"}
            ]),
        )
        .expect("load");

    let err = interpreter.run("mismatch").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::TypeMismatch { .. }));
}

#[tokio::test]
async fn unknown_step_type_faults() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script("weird", json!([{"type": "teleport"}]))
        .expect("load");

    let err = interpreter.run("weird").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::UnknownStep(t) if t == "teleport"));
}

#[tokio::test]
async fn unknown_throw_type_is_invalid_script() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "bad_throw",
            json!([{"type": "throw", "exception_type": "quantum_error"}]),
        )
        .expect("load");

    let err = interpreter.run("bad_throw").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::InvalidScript(_)));
}

#[tokio::test]
async fn loop_with_break_and_continue() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "bounded",
            json!([
                {"type": "assign", "variable": "sum", "value": 0},
                {"type": "assign", "variable": "i", "value": 0},
                {"type": "loop", "loop_iterations": 10, "steps": [
                    {"type": "assign", "variable": "i", "value": {"$add": ["$i", 1]}},
                    {"type": "condition", "condition": {"$eq": ["$i", 3]},
                     "true": {"type": "continue"}},
                    {"type": "condition", "condition": {"$gt": ["$i", 5]},
                     "true": {"type": "break"}},
                    {"type": "assign", "variable": "sum", "value": {"$add": ["$sum", "$i"]}}
                ]}
            ]),
        )
        .expect("load");

    interpreter.run("bounded").await.expect("run");
    // i = 1,2,4,5 contribute; 3 skipped; 6 breaks.
    assert_eq!(interpreter.get_variable("sum"), Some(json!(12)));
}

#[tokio::test]
async fn missing_script_is_a_fault() {
    let interpreter = TaskInterpreter::new();
    let err = interpreter.run("ghost").await.expect_err("should fail");
    assert!(matches!(err, ScriptError::ScriptNotFound(_)));
}

#[tokio::test]
async fn call_binds_result_with_inferred_type() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .register_function("multiply", |params| {
            let a = params.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = params.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a * b))
        })
        .expect("register");
    interpreter
        .load_script(
            "product",
            json!([
                {"type": "assign", "variable": "x", "value": 5},
                {"type": "assign", "variable": "y", "value": 10},
                {"type": "call", "function": "multiply",
                 "params": {"a": "$x", "b": "$y"}, "result": "product"},
                {"type": "print", "message": "The product of x and y is $product"}
            ]),
        )
        .expect("load");

    interpreter.run("product").await.expect("run");
    assert_eq!(interpreter.get_variable("product"), Some(json!(50)));
}

#[tokio::test]
async fn async_step_does_not_block() {
    let interpreter = TaskInterpreter::new();
    interpreter
        .load_script(
            "background",
            json!([
                {"type": "async", "steps": [
                    {"type": "delay", "milliseconds": 30},
                    {"type": "broadcast_event", "event_name": "bg_done"}
                ]},
                {"type": "assign", "variable": "main_done", "value": true},
                {"type": "listen_event", "event_names": ["bg_done"], "timeout": 2000,
                 "steps": [{"type": "assign", "variable": "observed", "value": true}]}
            ]),
        )
        .expect("load");

    interpreter.run("background").await.expect("run");
    assert_eq!(interpreter.get_variable("main_done"), Some(json!(true)));
    assert_eq!(interpreter.get_variable("observed"), Some(json!(true)));
}
