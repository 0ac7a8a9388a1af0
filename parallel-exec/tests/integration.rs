//! End-to-end tests that spawn the real worker binary.
//!
//! Each test builds its own [`ProcessManager`] with an isolated status-store
//! root and a registry populated the same way
//! `parallel-exec-worker/src/main.rs` populates its own, so the parent and
//! child agree on what names resolve to which callables.

use std::path::PathBuf;

use indexmap::IndexMap;
use parallel_exec::{
    CancellationToken, ExecError, Job, JobError, Outcome, ParallelConfig, ProcessManager,
    RegistrySerializer, StatusStore, TaskRegistry,
};

/// Locate the compiled `parallel-exec-worker` binary next to this test
/// binary, the way `cargo test` lays out a workspace's target directory.
fn worker_binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    let name = if cfg!(windows) {
        "parallel-exec-worker.exe"
    } else {
        "parallel-exec-worker"
    };
    p.push(name);
    p
}

struct Harness {
    _tmp: tempfile::TempDir,
    manager: ProcessManager,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ParallelConfig::default())
    }

    fn with_config(mut config: ParallelConfig) -> Self {
        // SAFETY: test-only, serialized by Rust's default single-threaded
        // test harness per process; no other thread reads this var here.
        unsafe {
            std::env::set_var("PARALLEL_EXEC_WORKER_BIN", worker_binary());
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        config.logging.enabled = true;
        let store = StatusStore::new(tmp.path()).expect("status store");
        let registry = registry();
        let manager = ProcessManager::new(config, Some(store), Box::new(RegistrySerializer::new(registry)));
        Harness { _tmp: tmp, manager }
    }
}

fn registry() -> TaskRegistry {
    let registry = TaskRegistry::new();
    registry.register("echo", |ctx| Ok(ctx));
    registry.register("sleep_then_return", |ctx| {
        let seconds = ctx.get("seconds").and_then(|v| v.as_u64()).unwrap_or(0);
        std::thread::sleep(std::time::Duration::from_secs(seconds));
        Ok(ctx.get("value").cloned().unwrap_or(serde_json::Value::Null))
    });
    registry.register("fail_with_message", |ctx| {
        let message = ctx
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("task failed")
            .to_string();
        Err(JobError::new(message))
    });
    registry.register("print_ticks_then_done", |ctx| {
        let ticks = ctx.get("ticks").and_then(|v| v.as_u64()).unwrap_or(1);
        for _ in 0..ticks {
            println!("tick");
        }
        Ok(serde_json::json!("done"))
    });
    registry
}

#[test]
fn streamed_echo_round_trips_context() {
    let harness = Harness::new();
    let job = Job::new("echo", serde_json::json!({"hello": "world"}));
    let handle = harness.manager.spawn_streamed(&job, 10).expect("spawn");
    let output = handle.get_result(10).expect("result");
    assert_eq!(output.result, serde_json::json!({"hello": "world"}));
    assert!(!output.result_serialized);
}

#[test]
fn streamed_failure_reports_job_error_class() {
    let harness = Harness::new();
    let job = Job::new(
        "fail_with_message",
        serde_json::json!({"message": "boom"}),
    );
    let handle = harness.manager.spawn_streamed(&job, 10).expect("spawn");
    let err = handle.get_result(10).expect_err("should fail");
    match err {
        ExecError::TaskFailed {
            class,
            message,
            parent_call_site,
            ..
        } => {
            assert_eq!(class, "JobError");
            assert_eq!(message, "boom");
            // Captured via #[track_caller] at the `spawn_streamed` call two
            // lines up in this same test function, not some internal frame.
            assert!(
                parent_call_site.contains("integration.rs"),
                "unexpected call site: {parent_call_site}"
            );
        }
        other => panic!("unexpected error variant: {other:?}"),
    }
}

#[test]
fn streamed_task_exceeding_timeout_is_reported_as_timed_out() {
    let harness = Harness::new();
    let job = Job::new(
        "sleep_then_return",
        serde_json::json!({"seconds": 5, "value": "late"}),
    );
    let handle = harness.manager.spawn_streamed(&job, 1).expect("spawn");
    let err = handle.get_result(1).expect_err("should time out");
    assert!(matches!(err, ExecError::TaskTimedOut { .. }));
}

#[test]
fn background_task_is_observable_through_status_store() {
    let harness = Harness::new();
    let job = Job::new("echo", serde_json::json!("fire and forget"));
    let bg = harness.manager.spawn_background(&job, 10).expect("spawn");
    let task_id = bg.task_id().clone();

    let store = StatusStore::open_default(Some(harness._tmp.path())).unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let record = store.get(&task_id).expect("record present");
        if record.status.is_terminal() {
            assert_eq!(record.status, parallel_exec::TaskStatus::Completed);
            assert_eq!(record.result, Some(serde_json::json!("fire and forget")));
            assert_eq!(record.pid, Some(bg.pid()));
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("background task never reached a terminal state");
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

#[test]
fn nesting_ceiling_is_propagated_to_the_child_worker() {
    // SAFETY: test-only env mutation, isolated by the single-threaded runner.
    unsafe {
        std::env::set_var("NEST_LEVEL", "2");
    }
    let mut config = ParallelConfig::default();
    config.max_nesting_level = 2;
    let harness = Harness::with_config(config);
    let job = Job::new("echo", serde_json::Value::Null);
    let result = harness.manager.spawn_streamed(&job, 5);
    unsafe {
        std::env::remove_var("NEST_LEVEL");
    }
    assert!(matches!(
        result,
        Err(ExecError::NestingExceeded { level: 2, max: 2 })
    ));
}

#[test]
fn pool_run_settled_captures_every_outcome_in_input_order() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let mut tasks = IndexMap::new();
    tasks.insert("first", Job::new("echo", serde_json::json!(1)));
    tasks.insert(
        "second",
        Job::new("fail_with_message", serde_json::json!({"message": "nope"})),
    );
    tasks.insert("third", Job::new("echo", serde_json::json!(3)));

    let results =
        parallel_exec::pool::run_settled(&harness.manager, tasks, 2, 10, &cancel).expect("settled");

    let keys: Vec<&&str> = results.keys().collect();
    assert_eq!(keys, vec![&"first", &"second", &"third"]);

    assert!(matches!(results["first"], Outcome::Fulfilled(ref v) if *v == serde_json::json!(1)));
    assert!(matches!(results["second"], Outcome::Rejected(_)));
    assert!(matches!(results["third"], Outcome::Fulfilled(ref v) if *v == serde_json::json!(3)));
}

#[test]
fn streamed_output_is_captured_and_does_not_corrupt_the_result() {
    // The callable writes raw text straight to its own stdout ten times
    // before returning a value. If the worker didn't redirect that into
    // OUTPUT events, these writes would interleave with the JSON-line
    // protocol and corrupt it; instead the captured text ends up in
    // `buffered_output` on the terminal record and the result decodes fine.
    let harness = Harness::new();
    let job = Job::new("print_ticks_then_done", serde_json::json!({"ticks": 10}));
    let handle = harness.manager.spawn_streamed(&job, 10).expect("spawn");
    let task_id = handle.task_id().clone();
    let output = handle.get_result(10).expect("result");
    assert_eq!(output.result, serde_json::json!("done"));

    let store = StatusStore::open_default(Some(harness._tmp.path())).unwrap();
    let expected = "tick\n".repeat(10);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let record = store.get(&task_id).expect("record present");
        if record.buffered_output.as_deref() == Some(expected.as_str()) {
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("buffered_output never matched captured ticks: {:?}", record.buffered_output);
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
}

#[test]
fn pool_run_fails_fast_on_first_rejection() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let mut tasks = IndexMap::new();
    tasks.insert(
        "bad",
        Job::new("fail_with_message", serde_json::json!({"message": "stop"})),
    );
    tasks.insert(
        "slow",
        Job::new("sleep_then_return", serde_json::json!({"seconds": 5})),
    );

    let result = parallel_exec::pool::run(&harness.manager, tasks, 2, 10, &cancel);
    assert!(result.is_err());
}
