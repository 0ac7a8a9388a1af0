//! parallel-exec — run callables in worker processes with streaming output,
//! bounded concurrency, timeouts, and fork-bomb-safe nesting.
//!
//! Callback serialization, host bootstrap discovery, and the logging
//! destination are external collaborators: this crate consumes a
//! [`job::Serializer`] and a [`config::ParallelConfig`] rather than owning
//! either concern itself.

pub mod background;
pub mod config;
pub mod error;
pub mod handle;
pub mod id;
pub mod job;
pub mod manager;
pub mod pool;
pub mod schema;
pub mod store;
pub mod time;
pub mod worker;

pub use background::BackgroundProcess;
pub use config::ParallelConfig;
pub use error::{ExecError, ExecResult};
pub use handle::{ProcessHandle, TaskOutput};
pub use id::TaskId;
pub use job::{Job, JobError, RegistrySerializer, Serializer, TaskRegistry};
pub use manager::ProcessManager;
pub use pool::{CancelReason, CancellationToken, Outcome};
pub use schema::{CallbackType, TaskPayload, TaskRecord, TaskStatus, WorkerEvent};
pub use store::{StatusStore, StoreSummary};
pub use worker::run_worker;

/// Initialize process-wide tracing to stderr, honoring `RUST_LOG` if set and
/// falling back to the level implied by `verbosity` (0 = warn, 1 = info,
/// 2 = debug, 3+ = trace). When `log_directory` is set, a rolling daily file
/// sink is layered in alongside stderr.
///
/// Safe to call once per process; a second call is a no-op (the underlying
/// global subscriber can only be installed once).
pub fn init_tracing(verbosity: u8, log_directory: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    if let Some(dir) = log_directory {
        let file_appender = tracing_appender::rolling::daily(dir, "parallel-exec.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leaking the guard is deliberate: it must live for the process
        // lifetime to keep flushing, and init_tracing is called at most once.
        std::mem::forget(guard);
        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
    }
}
