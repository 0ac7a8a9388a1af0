//! Child-side entry point: read one task payload from stdin, run exactly one
//! callable, emit one JSON event per line on stdout, then exit. A worker
//! process is never reused across tasks.
//!
//! This module is generic over the function registry so that any binary can
//! become a worker by calling [`run_worker`] with its own
//! [`TaskRegistry`](crate::job::TaskRegistry) populated identically to the
//! registry the spawning process used when it built the task.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::job::{RegistrySerializer, Serializer, TaskRegistry};
use crate::schema::{TaskPayload, TaskRecord, TaskStatus, WorkerEvent};
use crate::time::now_rfc3339;

const STDIN_READ_TIMEOUT: Duration = Duration::from_secs(5);

const NEST_LEVEL_VAR: &str = "NEST_LEVEL";
const MAX_NESTING_LEVEL_VAR: &str = "MAX_NESTING_LEVEL";
const BACKGROUND_VAR: &str = "BACKGROUND";

/// Substring the Windows fallback path watches for in captured output to
/// detect a PHP-style inline timeout notice before a signal ever fires. Kept
/// as a textual detector here too, since output capture is the one mechanism
/// this worker shares with that source behavior regardless of platform.
const INLINE_TIMEOUT_MARKER: &str = "maximum execution time";

/// Exit code reported by a worker that hit its wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code for a protocol-level or bootstrap failure (bad payload, missing
/// registry entry, stdin timeout, nesting guard tripped).
pub const EXIT_PROTOCOL_FAILURE: i32 = 1;

/// Serializes writes of protocol event lines onto a duplicate of the
/// process's original fd 1, independent of whatever the callable's own
/// stdout writes are doing at the time (those are re-routed through
/// [`OutputCapture`] instead). The duplicate is taken once, before
/// [`OutputCapture`] ever redirects fd 1 into its capture pipe — writing
/// through `std::io::stdout()` instead would chase that redirection and
/// send every OUTPUT event the capture reader emits straight back into the
/// pipe it is itself reading from.
struct ProtocolWriter {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl ProtocolWriter {
    #[cfg(unix)]
    fn to_stdout() -> Self {
        use std::os::unix::io::FromRawFd;

        let fd = unsafe { libc::dup(1) };
        let sink: Box<dyn Write + Send> = if fd >= 0 {
            Box::new(unsafe { std::fs::File::from_raw_fd(fd) })
        } else {
            warn!("failed to duplicate stdout fd for protocol writer; falling back to std::io::stdout");
            Box::new(std::io::stdout())
        };
        ProtocolWriter {
            sink: Mutex::new(sink),
        }
    }

    #[cfg(not(unix))]
    fn to_stdout() -> Self {
        ProtocolWriter {
            sink: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    fn emit(&self, event: &WorkerEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut sink = self.sink.lock().expect("protocol writer lock poisoned");
            let _ = writeln!(sink, "{line}");
            let _ = sink.flush();
        } else {
            warn!("failed to encode worker event");
        }
    }
}

/// Runs the worker control flow to completion and returns the process exit
/// code the binary should use. Never panics out to the caller: any error
/// while reading/parsing the payload is reported on stderr and folded into
/// the returned code.
pub fn run_worker(registry: TaskRegistry) -> i32 {
    // SAFETY: worker process owns its whole environment at this point; no
    // other thread has started yet.
    unsafe {
        std::env::set_var(BACKGROUND_VAR, "1");
    }

    let level: u32 = std::env::var(NEST_LEVEL_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let max: u32 = std::env::var(MAX_NESTING_LEVEL_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    if level > max {
        eprintln!("fatal: nesting level {level} exceeds max nesting level {max}");
        return EXIT_PROTOCOL_FAILURE;
    }

    let payload = match read_payload() {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("fatal: {e}");
            return EXIT_PROTOCOL_FAILURE;
        }
    };

    if let Some(bootstrap) = &payload.framework_bootstrap {
        debug!(bootstrap, "framework bootstrap path supplied (opaque to worker)");
    }
    debug!(memory_limit = %payload.memory_limit, "advisory memory limit (not enforced)");

    if payload.logging_enabled {
        if let Some(path) = &payload.status_file {
            write_received_status(path, &payload.task_id, std::process::id());
        }
    }

    let writer = Arc::new(ProtocolWriter::to_stdout());

    let done = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(
        payload.timeout_seconds,
        Arc::clone(&done),
        Arc::clone(&writer),
        payload.status_file.clone(),
        payload.task_id.clone(),
    );

    let serializer = RegistrySerializer::new(registry.clone());
    let job = match serializer.deserialize(
        &payload.serialized_callback,
        payload.context.clone().unwrap_or(serde_json::Value::Null),
    ) {
        Ok(job) => job,
        Err(e) => {
            done.store(true, Ordering::SeqCst);
            emit_error(&writer, &payload, "DeserializeError", &e.to_string(), None, String::new(), String::new());
            let _ = watchdog.join();
            return EXIT_PROTOCOL_FAILURE;
        }
    };

    let Some(task_fn) = registry.get(&job.name) else {
        done.store(true, Ordering::SeqCst);
        emit_error(
            &writer,
            &payload,
            "DeserializeError",
            &format!("no callable registered under name {:?}", job.name),
            None,
            String::new(),
            String::new(),
        );
        let _ = watchdog.join();
        return EXIT_PROTOCOL_FAILURE;
    };

    writer.emit(&WorkerEvent::Running);
    if payload.logging_enabled {
        if let Some(path) = &payload.status_file {
            write_status_transition(path, &payload.task_id, TaskStatus::Running);
        }
    }

    // Every write the callable makes to its own stdout is re-routed: each
    // chunk becomes an OUTPUT event (streamed straight through to the
    // parent's own stdout by the handle) and is accumulated for
    // `buffered_output` on the terminal status record.
    let capture = OutputCapture::start(Arc::clone(&writer), Arc::clone(&done));

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task_fn(job.context)));

    done.store(true, Ordering::SeqCst);
    let buffered_output = capture.finish();

    let exit_code = match outcome {
        Ok(Ok(value)) => {
            emit_completed(&writer, &payload, value, buffered_output);
            0
        }
        Ok(Err(job_err)) => {
            emit_error(
                &writer,
                &payload,
                &job_err.class,
                &job_err.message,
                job_err.code,
                String::new(),
                buffered_output,
            );
            EXIT_PROTOCOL_FAILURE
        }
        Err(panic_payload) => {
            let message = panic_message(&panic_payload);
            emit_error(&writer, &payload, "Panic", &message, None, String::new(), buffered_output);
            EXIT_PROTOCOL_FAILURE
        }
    };

    let _ = watchdog.join();
    std::io::stdout().flush().ok();
    exit_code
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked with a non-string payload".to_string()
    }
}

fn read_payload() -> anyhow::Result<TaskPayload> {
    let (tx, rx) = mpsc::channel::<std::io::Result<String>>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        let result = stdin.lock().read_line(&mut line).map(|_| line);
        let _ = tx.send(result);
    });

    let line = rx
        .recv_timeout(STDIN_READ_TIMEOUT)
        .map_err(|_| anyhow::anyhow!("timed out waiting for task payload on stdin"))??;

    if line.trim().is_empty() {
        anyhow::bail!("empty task payload on stdin");
    }

    let payload: TaskPayload = serde_json::from_str(line.trim_end())?;
    Ok(payload)
}

/// Redirects the process's real stdout (fd 1) to a pipe for the lifetime of
/// the callable's invocation, so that any raw write the callable makes
/// (`println!`, a library writing progress to stdout, ...) is captured
/// instead of corrupting the JSON-line event stream. Protocol events
/// continue to flow through the [`ProtocolWriter`]'s duplicated fd.
///
/// POSIX only: Windows has no cheap non-blocking equivalent here, and the
/// worker side of the Windows fallback path (status-file polling) does not
/// depend on live OUTPUT events the way the POSIX streamed path does, so
/// capture is simply skipped there — the callable's stdout writes go to the
/// real console instead of being captured, a documented limitation rather
/// than an attempt at parity.
struct OutputCapture {
    #[cfg(unix)]
    inner: Option<UnixCapture>,
}

#[cfg(unix)]
struct UnixCapture {
    saved_stdout_fd: std::os::unix::io::RawFd,
    reader: std::thread::JoinHandle<String>,
}

impl OutputCapture {
    #[cfg(unix)]
    fn start(writer: Arc<ProtocolWriter>, done: Arc<AtomicBool>) -> Self {
        use std::os::unix::io::FromRawFd;

        let saved_stdout_fd = unsafe { libc::dup(1) };
        if saved_stdout_fd < 0 {
            warn!("failed to duplicate stdout fd; output capture disabled");
            return OutputCapture { inner: None };
        }

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            warn!("failed to create output-capture pipe; output capture disabled");
            unsafe { libc::close(saved_stdout_fd) };
            return OutputCapture { inner: None };
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        if unsafe { libc::dup2(write_fd, 1) } < 0 {
            warn!("failed to redirect stdout into capture pipe; output capture disabled");
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
                libc::close(saved_stdout_fd);
            }
            return OutputCapture { inner: None };
        }
        // fd 1 now refers to the same pipe as write_fd; this extra handle is
        // no longer needed and must close so the reader can observe EOF once
        // `finish` restores the real stdout.
        unsafe { libc::close(write_fd) };

        let reader = std::thread::spawn(move || {
            let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
            let mut buffered = String::new();
            let mut buf = [0u8; 4096];
            loop {
                use std::io::Read;
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if chunk.contains(INLINE_TIMEOUT_MARKER) && !done.load(Ordering::SeqCst) {
                            writer.emit(&WorkerEvent::Timeout {
                                message: chunk.clone(),
                            });
                        } else {
                            writer.emit(&WorkerEvent::Output {
                                output: chunk.clone(),
                            });
                        }
                        buffered.push_str(&chunk);
                    }
                    Err(_) => break,
                }
            }
            buffered
        });

        OutputCapture {
            inner: Some(UnixCapture {
                saved_stdout_fd,
                reader,
            }),
        }
    }

    #[cfg(not(unix))]
    fn start(_writer: Arc<ProtocolWriter>, _done: Arc<AtomicBool>) -> Self {
        OutputCapture {}
    }

    /// Restores the real stdout and returns everything the callable wrote
    /// while captured.
    #[cfg(unix)]
    fn finish(self) -> String {
        let Some(inner) = self.inner else {
            return String::new();
        };
        // Putting the saved fd back onto 1 closes the pipe's last write end,
        // which lets the reader thread's `read` return 0 (EOF).
        unsafe {
            libc::dup2(inner.saved_stdout_fd, 1);
            libc::close(inner.saved_stdout_fd);
        }
        inner.reader.join().unwrap_or_default()
    }

    #[cfg(not(unix))]
    fn finish(self) -> String {
        String::new()
    }
}

fn spawn_watchdog(
    timeout_seconds: u64,
    done: Arc<AtomicBool>,
    writer: Arc<ProtocolWriter>,
    status_file: Option<String>,
    task_id: String,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(timeout_seconds.max(1));
        let poll = Duration::from_millis(100);
        loop {
            if done.load(Ordering::SeqCst) {
                return;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(poll);
        }
        if done.load(Ordering::SeqCst) {
            return;
        }
        let message = format!("task exceeded {timeout_seconds}s ({INLINE_TIMEOUT_MARKER})");
        writer.emit(&WorkerEvent::Timeout {
            message: message.clone(),
        });
        if let Some(path) = &status_file {
            write_terminal_status(path, &task_id, TaskStatus::Timeout, Some(message));
        }
        std::process::exit(EXIT_TIMEOUT);
    })
}

fn emit_completed(writer: &ProtocolWriter, payload: &TaskPayload, value: serde_json::Value, buffered_output: String) {
    writer.emit(&WorkerEvent::Completed {
        result: value.clone(),
        result_serialized: false,
    });
    if let Some(path) = &payload.status_file {
        if payload.logging_enabled {
            write_completed_status(path, &payload.task_id, value, buffered_output);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_error(
    writer: &ProtocolWriter,
    payload: &TaskPayload,
    class: &str,
    message: &str,
    code: Option<i64>,
    stack_trace: String,
    buffered_output: String,
) {
    writer.emit(&WorkerEvent::Error {
        class: class.to_string(),
        message: message.to_string(),
        code,
        file: None,
        line: None,
        stack_trace: stack_trace.clone(),
    });
    if let Some(path) = &payload.status_file {
        if payload.logging_enabled {
            write_error_status(path, &payload.task_id, class, message, &stack_trace, buffered_output);
        }
    }
}

/// Persists the `RECEIVED` transition, stamping `pid` the moment the worker
/// has its payload in hand — per the data model, `pid` is set exactly once
/// here and never changes afterward.
fn write_received_status(path: &str, task_id: &str, pid: u32) {
    let mut record = load_or_default(path, task_id);
    if record.status.is_terminal() {
        return;
    }
    record.status = TaskStatus::Received;
    record.pid = Some(pid);
    record.updated_at = now_rfc3339();
    let _ = write_record(path, &record);
}

/// Persists a non-terminal status transition (`RUNNING`) so a caller polling
/// the status store directly (rather than reading the streamed protocol)
/// can observe progress before a terminal state lands.
fn write_status_transition(path: &str, task_id: &str, status: TaskStatus) {
    let mut record = load_or_default(path, task_id);
    if record.status.is_terminal() {
        return;
    }
    record.status = status;
    record.updated_at = now_rfc3339();
    let _ = write_record(path, &record);
}

fn write_terminal_status(path: &str, task_id: &str, status: TaskStatus, message: Option<String>) {
    let mut record = load_or_default(path, task_id);
    record.status = status;
    record.message = message;
    record.updated_at = now_rfc3339();
    let _ = write_record(path, &record);
}

fn write_completed_status(path: &str, task_id: &str, value: serde_json::Value, buffered_output: String) {
    let mut record = load_or_default(path, task_id);
    record.status = TaskStatus::Completed;
    record.result = Some(value);
    record.result_serialized = Some(false);
    if !buffered_output.is_empty() {
        record.buffered_output = Some(buffered_output);
    }
    record.updated_at = now_rfc3339();
    record.duration = duration_since_created(&record);
    record.memory_peak = peak_rss_bytes();
    let _ = write_record(path, &record);
}

/// Best-effort peak resident set size of this worker process, via
/// `getrusage(RUSAGE_SELF)`. `ru_maxrss` is kilobytes on Linux and bytes on
/// macOS/BSD; the `*1024` below is only correct on Linux, the platform this
/// worker is chiefly developed against. Treated the same way spec.md treats
/// `memory_limit`: an advisory, best-effort figure rather than a guarantee.
#[cfg(target_os = "linux")]
fn peak_rss_bytes() -> Option<u64> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    u64::try_from(usage.ru_maxrss).ok().map(|kb| kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn peak_rss_bytes() -> Option<u64> {
    None
}

fn write_error_status(
    path: &str,
    task_id: &str,
    class: &str,
    message: &str,
    stack_trace: &str,
    buffered_output: String,
) {
    let mut record = load_or_default(path, task_id);
    record.status = TaskStatus::Error;
    record.error = Some(message.to_string());
    record.class = Some(class.to_string());
    record.stack_trace = Some(stack_trace.to_string());
    if !buffered_output.is_empty() {
        record.buffered_output = Some(buffered_output);
    }
    record.updated_at = now_rfc3339();
    record.duration = duration_since_created(&record);
    record.memory_peak = peak_rss_bytes();
    let _ = write_record(path, &record);
}

fn duration_since_created(record: &TaskRecord) -> Option<f64> {
    let created = crate::store::parse_epoch_secs(&record.created_at)?;
    let updated = crate::store::parse_epoch_secs(&record.updated_at)?;
    Some(updated.saturating_sub(created) as f64)
}

fn load_or_default(path: &str, task_id: &str) -> TaskRecord {
    std::fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<TaskRecord>(&raw).ok())
        .unwrap_or_else(|| {
            TaskRecord::pending(&crate::id::TaskId::from(task_id.to_string()), crate::schema::CallbackType::Function, 0)
        })
}

fn write_record(path: &str, record: &TaskRecord) -> std::io::Result<()> {
    let contents = serde_json::to_string_pretty(record)?;
    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_extracts_str_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
    }

    #[test]
    fn panic_message_extracts_string_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(&*payload), "boom");
    }

    #[test]
    fn panic_message_falls_back_for_unknown_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(42i32);
        assert_eq!(panic_message(&*payload), "callable panicked with a non-string payload");
    }
}
