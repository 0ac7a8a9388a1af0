//! Builds the child command, wires up pipes, writes the task payload, and
//! hands back a live handle. The manager decides policy; this module only
//! knows how to get a worker process on the ground.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::config::ParallelConfig;
use crate::error::{ExecError, ExecResult};
use crate::handle::ProcessHandle;
use crate::id::TaskId;
use crate::job::{Job, Serializer};
use crate::schema::TaskPayload;
use crate::store::StatusStore;

/// Payload bodies over roughly 8 MiB are refused outright; a legitimate
/// context argument has no business being this large, and writing it would
/// risk filling the child's stdin pipe buffer before it starts reading.
const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnKind {
    Streamed,
    Background,
}

/// Resolve the worker binary: an explicit override first (mainly for
/// tests and non-standard installs), then a binary named
/// `parallel-exec-worker` next to the current executable, then a PATH
/// lookup.
pub fn resolve_worker_binary() -> ExecResult<PathBuf> {
    if let Ok(path) = std::env::var("PARALLEL_EXEC_WORKER_BIN") {
        if !path.is_empty() {
            let path = PathBuf::from(path);
            if path.is_file() {
                return Ok(path);
            }
            return Err(ExecError::WorkerMissing(format!(
                "PARALLEL_EXEC_WORKER_BIN points at {} which does not exist",
                path.display()
            )));
        }
    }

    let worker_name = if cfg!(windows) {
        "parallel-exec-worker.exe"
    } else {
        "parallel-exec-worker"
    };

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let candidate = dir.join(worker_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(worker_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(ExecError::WorkerMissing(format!(
        "could not locate {worker_name} next to the current executable or on PATH"
    )))
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    task_id: &TaskId,
    job: &Job,
    serializer: &dyn Serializer,
    timeout_seconds: u64,
    config: &ParallelConfig,
    store: Option<&StatusStore>,
    kind: SpawnKind,
    envs: &[(String, String)],
    call_site: String,
) -> ExecResult<ProcessHandle> {
    let worker_bin = resolve_worker_binary()?;

    let serialized_callback = serializer.serialize(job)?;

    let status_file = store.map(|s| {
        s.root()
            .join(format!("{}.json", task_id.as_str()))
            .display()
            .to_string()
    });

    let payload = TaskPayload {
        task_id: task_id.as_str().to_string(),
        status_file: status_file.clone(),
        serialized_callback,
        context: Some(job.context.clone()),
        autoload_path: String::new(),
        framework_bootstrap: config.bootstrap.file.clone(),
        framework_init_code: config.bootstrap.init_code.clone().unwrap_or_default(),
        logging_enabled: config.logging.enabled,
        timeout_seconds: timeout_seconds.clamp(1, 86_400),
        memory_limit: config.background_process.memory_limit.clone(),
    };

    let mut payload_bytes = serde_json::to_vec(&payload)?;
    if payload_bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(ExecError::PayloadTooLarge(payload_bytes.len()));
    }
    payload_bytes.push(b'\n');

    let mut cmd = Command::new(&worker_bin);
    cmd.stdin(Stdio::piped());
    match kind {
        SpawnKind::Streamed => {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        SpawnKind::Background => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(format!("{}: {e}", worker_bin.display())))?;

    let pid = child.id();

    {
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| ExecError::SpawnFailed("worker stdin not piped".to_string()))?;
        if let Err(e) = stdin.write_all(&payload_bytes) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecError::SpawnFailed(format!(
                "failed writing task payload to worker stdin: {e}"
            )));
        }
    }
    // Background tasks close stdin immediately after the payload line;
    // streamed tasks keep it open (attached to `child`) so the worker never
    // observes a premature EOF, even though it never reads again.
    if kind == SpawnKind::Background {
        child.stdin.take();
    }

    Ok(ProcessHandle::new(
        task_id.clone(),
        pid,
        child,
        status_file,
        store.cloned(),
        config.logging.enabled,
        call_site,
    ))
}
