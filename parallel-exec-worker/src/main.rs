//! Internal worker entry point.
//!
//! Invoked by the process manager with no arguments; reads exactly one task
//! payload from stdin, runs it, and exits. Accepts no flags — the worker's
//! entire input is the payload line on stdin.
//!
//! The function registry here is illustrative: it registers the handful of
//! callables exercised by this crate's own integration tests. A host
//! embedding `parallel_exec` ships its own worker binary that registers the
//! functions its application actually defines, built identically to whatever
//! registry the spawning process populated.

use parallel_exec::job::TaskRegistry;

fn main() {
    parallel_exec::init_tracing(verbosity_from_env(), None);
    let registry = build_registry();
    let code = parallel_exec::run_worker(registry);
    std::process::exit(code);
}

fn verbosity_from_env() -> u8 {
    std::env::var("PARALLEL_EXEC_VERBOSE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn build_registry() -> TaskRegistry {
    let registry = TaskRegistry::new();

    registry.register("echo", |ctx| Ok(ctx));

    registry.register("sleep_then_return", |ctx| {
        let seconds = ctx
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        std::thread::sleep(std::time::Duration::from_secs(seconds));
        Ok(ctx.get("value").cloned().unwrap_or(serde_json::Value::Null))
    });

    registry.register("fail_with_message", |ctx| {
        let message = ctx
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("task failed")
            .to_string();
        Err(parallel_exec::JobError::new(message))
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
