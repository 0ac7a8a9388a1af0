//! Wire and on-disk JSON shapes shared by the manager, the handle, the
//! status store, and the worker binary. Field names favor stability of the
//! on-disk/wire shape across readers and writers that run as different
//! processes, potentially built at different times.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// `PENDING -> RECEIVED -> RUNNING -> {COMPLETED|ERROR|TIMEOUT|CANCELLED}`,
/// with `SPAWN_ERROR` as a parent-observed terminal state when the child
/// never started. Terminal states never transition out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Received,
    Running,
    Completed,
    Error,
    Timeout,
    Cancelled,
    SpawnError,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Error
                | TaskStatus::Timeout
                | TaskStatus::Cancelled
                | TaskStatus::SpawnError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackType {
    Function,
    Method,
    Closure,
    CallableObject,
}

/// Persisted per-task record. Fields that must always be present (serialized
/// as explicit `null` rather than omitted) use plain `Option<T>`; fields that
/// only appear for a specific terminal state use `skip_serializing_if` so
/// e.g. a COMPLETED record never grows an `error` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    pub pid: Option<u32>,
    pub timestamp: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memory_peak: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub callback_type: Option<CallbackType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub buffered_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result_serialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack_trace: Option<String>,
}

impl TaskRecord {
    pub fn pending(task_id: &TaskId, callback_type: CallbackType, context_size: u64) -> Self {
        let now = crate::time::now_rfc3339();
        TaskRecord {
            task_id: task_id.as_str().to_string(),
            status: TaskStatus::Pending,
            message: None,
            pid: None,
            timestamp: now.clone(),
            created_at: now.clone(),
            updated_at: now,
            duration: None,
            memory_usage: None,
            memory_peak: None,
            callback_type: Some(callback_type),
            context_size: Some(context_size),
            buffered_output: None,
            result: None,
            result_serialized: None,
            error: None,
            class: None,
            file: None,
            line: None,
            stack_trace: None,
        }
    }
}

/// Task payload written to the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: String,
    pub status_file: Option<String>,
    pub serialized_callback: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<serde_json::Value>,
    pub autoload_path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub framework_bootstrap: Option<String>,
    #[serde(default)]
    pub framework_init_code: String,
    pub logging_enabled: bool,
    pub timeout_seconds: u64,
    pub memory_limit: String,
}

/// One JSON object per line on the worker's stdout. Unknown event types
/// must be ignored by readers, not treated as fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum WorkerEvent {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "OUTPUT")]
    Output { output: String },
    #[serde(rename = "COMPLETED")]
    Completed {
        result: serde_json::Value,
        result_serialized: bool,
    },
    #[serde(rename = "ERROR")]
    Error {
        class: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        code: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        line: Option<u32>,
        stack_trace: String,
    },
    #[serde(rename = "TIMEOUT")]
    Timeout { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_screaming_snake_case() {
        let s = serde_json::to_string(&TaskStatus::SpawnError).unwrap();
        assert_eq!(s, "\"SPAWN_ERROR\"");
        let back: TaskStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, TaskStatus::SpawnError);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn worker_event_output_shape() {
        let ev = WorkerEvent::Output {
            output: "tick\n".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["status"], "OUTPUT");
        assert_eq!(v["output"], "tick\n");
    }

    #[test]
    fn worker_event_completed_shape() {
        let ev = WorkerEvent::Completed {
            result: serde_json::json!(42),
            result_serialized: false,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["status"], "COMPLETED");
        assert_eq!(v["result"], 42);
        assert_eq!(v["result_serialized"], false);
    }
}
