//! Parent-side representation of one live streamed child: reads worker
//! events off a pipe, passes OUTPUT straight through to the parent's own
//! stdout, and resolves once a terminal event (or EOF) arrives.

use std::io::{BufRead, BufReader, Write};
use std::process::Child;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{ExecError, ExecResult};
use crate::id::TaskId;
use crate::schema::{TaskStatus, WorkerEvent};
use crate::store::StatusStore;
use crate::time::now_rfc3339;

/// Successful outcome of a streamed task.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub result: serde_json::Value,
    pub result_serialized: bool,
}

enum ReaderMessage {
    Event(WorkerEvent),
    Eof,
}

pub struct ProcessHandle {
    task_id: TaskId,
    pid: u32,
    child: Mutex<Option<Child>>,
    events_rx: Mutex<Option<mpsc::Receiver<ReaderMessage>>>,
    reader_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    status_file: Option<String>,
    store: Option<StatusStore>,
    logging_enabled: bool,
    /// `file:line` of the `spawn_streamed`/`spawn_background` call site that
    /// produced this handle, captured via `#[track_caller]` at the manager.
    /// Stitched into a [`crate::error::ExecError::TaskFailed`] so a caller
    /// sees where *they* called into this crate, not an internal frame.
    call_site: String,
}

impl ProcessHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: TaskId,
        pid: u32,
        mut child: Child,
        status_file: Option<String>,
        store: Option<StatusStore>,
        logging_enabled: bool,
        call_site: String,
    ) -> Self {
        let events_rx = child.stdout.take().map(|stdout| {
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => {
                            match serde_json::from_str::<WorkerEvent>(&line) {
                                Ok(event) => {
                                    if tx.send(ReaderMessage::Event(event)).is_err() {
                                        break;
                                    }
                                }
                                Err(_) => {
                                    // Unknown/malformed line: readers must ignore
                                    // unrecognized event shapes rather than fail.
                                    continue;
                                }
                            }
                        }
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
                let _ = tx.send(ReaderMessage::Eof);
            });
            rx
        });

        // Drain stderr on a best-effort background thread so the child never
        // blocks writing diagnostics into a full pipe buffer.
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    warn!(worker_stderr = %line);
                }
            });
        }

        ProcessHandle {
            task_id,
            pid,
            child: Mutex::new(Some(child)),
            events_rx: Mutex::new(events_rx),
            reader_thread: Mutex::new(None),
            status_file,
            store,
            logging_enabled,
            call_site,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock().expect("handle child lock poisoned");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Block until the worker reaches a terminal event or `timeout_seconds`
    /// elapses, whichever comes first.
    pub fn get_result(&self, timeout_seconds: u64) -> ExecResult<TaskOutput> {
        let deadline = Instant::now() + Duration::from_secs(timeout_seconds.max(1));
        let rx = self
            .events_rx
            .lock()
            .expect("handle rx lock poisoned")
            .take();
        let Some(rx) = rx else {
            return Err(ExecError::StreamEndedUnexpectedly {
                task_id: self.task_id.as_str().to_string(),
            });
        };

        let outcome = loop {
            let now = Instant::now();
            if now >= deadline {
                break Err(ExecError::TaskTimedOut { timeout_seconds });
            }
            let remaining = deadline - now;
            match rx.recv_timeout(remaining) {
                Ok(ReaderMessage::Event(WorkerEvent::Running)) => continue,
                Ok(ReaderMessage::Event(WorkerEvent::Output { output })) => {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(output.as_bytes());
                    let _ = stdout.flush();
                }
                Ok(ReaderMessage::Event(WorkerEvent::Completed {
                    result,
                    result_serialized,
                })) => {
                    break Ok(TaskOutput {
                        result,
                        result_serialized,
                    });
                }
                Ok(ReaderMessage::Event(WorkerEvent::Error {
                    class,
                    message,
                    code,
                    file,
                    line,
                    stack_trace,
                })) => {
                    break Err(ExecError::TaskFailed {
                        class,
                        message,
                        code,
                        file,
                        line,
                        stack_trace,
                        parent_call_site: self.call_site.clone(),
                    });
                }
                Ok(ReaderMessage::Event(WorkerEvent::Timeout { message })) => {
                    warn!(task_id = %self.task_id, %message, "worker self-reported timeout");
                    break Err(ExecError::TaskTimedOut { timeout_seconds });
                }
                Ok(ReaderMessage::Eof) => {
                    break Err(ExecError::StreamEndedUnexpectedly {
                        task_id: self.task_id.as_str().to_string(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    break Err(ExecError::TaskTimedOut { timeout_seconds });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(ExecError::StreamEndedUnexpectedly {
                        task_id: self.task_id.as_str().to_string(),
                    });
                }
            }
        };

        match &outcome {
            Ok(_) => self.reap(),
            Err(ExecError::TaskTimedOut { .. }) => {
                self.terminate()?;
                self.mark_terminal(TaskStatus::Timeout, "task timed out");
            }
            Err(_) => {
                self.reap();
            }
        }
        outcome
    }

    /// Force-kill the child and (best-effort) its descendants. Idempotent.
    pub fn terminate(&self) -> ExecResult<()> {
        let still_running = self.is_running();
        if !still_running {
            return Ok(());
        }

        #[cfg(unix)]
        {
            unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) };
            // Best-effort: reach any descendants the worker may have spawned.
            let _ = std::process::Command::new("pkill")
                .args(["-9", "-P", &self.pid.to_string()])
                .status();
        }
        #[cfg(windows)]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &self.pid.to_string()])
                .status();
        }

        self.reap();
        self.mark_terminal(TaskStatus::Cancelled, "terminated by caller");
        Ok(())
    }

    fn reap(&self) {
        let mut guard = self.child.lock().expect("handle child lock poisoned");
        if let Some(mut child) = guard.take() {
            let _ = child.wait();
        }
        if let Some(thread) = self.reader_thread.lock().expect("reader thread lock poisoned").take() {
            let _ = thread.join();
        }
    }

    fn mark_terminal(&self, status: TaskStatus, message: &str) {
        let (Some(store), true) = (&self.store, self.logging_enabled) else {
            return;
        };
        if let Ok(mut record) = store.get(&self.task_id) {
            if record.status.is_terminal() {
                return;
            }
            record.status = status;
            record.message = Some(message.to_string());
            record.updated_at = now_rfc3339();
            let _ = store.update(&record);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.terminate();
        } else {
            self.reap();
        }
        if let Some(status_file) = &self.status_file {
            if !self.logging_enabled {
                let path = std::path::Path::new(status_file);
                if path.starts_with(std::env::temp_dir()) {
                    let _ = std::fs::remove_file(path);
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::remove_dir(parent);
                    }
                }
            }
        }
    }
}
