//! Typed error surface for `parallel_exec`.
//!
//! Internal plumbing (file I/O, JSON parsing, OS process errors) propagates
//! via `anyhow::Result`. At the public API boundary those errors are folded
//! into [`ExecError`] so callers can match on the failure kind by name
//! instead of string-matching a message.

use thiserror::Error;

/// Error kinds surfaced by the core, one per distinct failure mode callers
/// need to branch on.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("serialize-failed: {0}")]
    SerializeFailed(String),

    #[error("spawn-failed: {0}")]
    SpawnFailed(String),

    #[error("worker-missing: {0}")]
    WorkerMissing(String),

    #[error("payload-too-large: {0} bytes exceeds limit")]
    PayloadTooLarge(usize),

    #[error("nesting-exceeded: NEST_LEVEL would reach {level}, max is {max}")]
    NestingExceeded { level: u32, max: u32 },

    #[error("rate-limited: {spawned} spawns already observed in the current window (limit {limit})")]
    RateLimited { spawned: u32, limit: u32 },

    /// The worker raised while running the callable. Carries the
    /// reconstructed exception shape: class name, message, the parent's
    /// call-site (where `spawn_streamed`/`spawn_background` was called, not
    /// the worker's own unknowable internal location), and the worker's own
    /// trace appended as a labelled block.
    #[error("task-failed at {parent_call_site}: {class}: {message}\n--- WORKER TRACE ---\n{stack_trace}")]
    TaskFailed {
        class: String,
        message: String,
        code: Option<i64>,
        file: Option<String>,
        line: Option<u32>,
        stack_trace: String,
        parent_call_site: String,
    },

    #[error("task-timed-out: task exceeded {timeout_seconds}s")]
    TaskTimedOut { timeout_seconds: u64 },

    #[error("pool-timed-out: pool exceeded {timeout_secs}s")]
    PoolTimedOut { timeout_secs: u64 },

    #[error("pool-cancelled")]
    PoolCancelled,

    #[error("stream-ended-unexpectedly: worker for task {task_id} exited without a terminal event")]
    StreamEndedUnexpectedly { task_id: String },

    #[error("corrupted-status: status file corrupted for task {task_id}")]
    CorruptedStatus { task_id: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ExecResult<T> = Result<T, ExecError>;
