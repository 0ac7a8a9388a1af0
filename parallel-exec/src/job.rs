//! The pluggable callable/context serialization boundary.
//!
//! Callback serialization is treated as an external collaborator: the core
//! consumes a serialize/deserialize interface rather than owning callable
//! representation itself. This module defines that interface
//! ([`Serializer`]) plus one concrete, always-available strategy — a
//! named-function registry, transmitting a callable's symbol rather than its
//! code. Host applications that need closures or bound methods provide their
//! own [`Serializer`] implementation; this crate does not attempt to emulate
//! dynamic-language reflection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};
use crate::schema::CallbackType;

/// A unit of work: a named callable plus a JSON context argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl Job {
    pub fn new(name: impl Into<String>, context: serde_json::Value) -> Self {
        Job {
            name: name.into(),
            context,
        }
    }
}

/// The `serialize(fn) -> bytes` / `deserialize(bytes) -> fn` interface the
/// core treats as opaque. `serialize` encodes only the callable — the
/// context argument travels alongside it in the task payload's own `context`
/// field — and runs in the parent before spawning. `deserialize` runs in the
/// worker, recombining the encoded callable with the context read back off
/// the payload.
pub trait Serializer: Send + Sync {
    fn serialize(&self, job: &Job) -> ExecResult<String>;
    fn deserialize(&self, encoded: &str, context: serde_json::Value) -> ExecResult<Job>;
    /// The callback-type classification stored on the TaskRecord; a registry
    /// serializer only ever has named functions, but a host `Serializer`
    /// backing closures/methods would report those here.
    fn callback_type(&self, _job: &Job) -> CallbackType {
        CallbackType::Function
    }
}

/// A function registered under a name so it can be invoked from a worker
/// process. The worker process is a fresh instance of the host binary, so
/// the registry must be populated identically in both the spawning process
/// and the worker — typically by calling the same `register_*` setup code
/// at startup in both.
pub type TaskFn = Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, JobError> + Send + Sync>;

/// Error raised by a registered callable. Carries enough detail to populate
/// an ERROR worker event and the reconstructed [`ExecError::TaskFailed`].
#[derive(Debug, Clone)]
pub struct JobError {
    pub class: String,
    pub message: String,
    pub code: Option<i64>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        JobError {
            class: "JobError".to_string(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_class(class: impl Into<String>, message: impl Into<String>) -> Self {
        JobError {
            class: class.into(),
            message: message.into(),
            code: None,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for JobError {}

/// A process-wide, name-indexed table of callables. Registered once at
/// startup (in both the spawning process and the worker binary, since the
/// worker is a separate `exec()` of the same host), looked up by the
/// [`RegistrySerializer`] at deserialize time.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<String, TaskFn>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        f: impl Fn(serde_json::Value) -> Result<serde_json::Value, JobError> + Send + Sync + 'static,
    ) {
        self.inner
            .write()
            .expect("task registry lock poisoned")
            .insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.inner
            .read()
            .expect("task registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("task registry lock poisoned")
            .contains_key(name)
    }
}

/// Default [`Serializer`]: the job is JSON (name + context), which is itself
/// the transport-ready "serialized_callback" string — no further encoding is
/// needed because the registry lookup happens by name in the worker, not by
/// deserializing executable code.
pub struct RegistrySerializer {
    registry: TaskRegistry,
}

impl RegistrySerializer {
    pub fn new(registry: TaskRegistry) -> Self {
        RegistrySerializer { registry }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }
}

impl Serializer for RegistrySerializer {
    fn serialize(&self, job: &Job) -> ExecResult<String> {
        if !self.registry.contains(&job.name) {
            return Err(ExecError::SerializeFailed(format!(
                "no callable registered under name {:?}",
                job.name
            )));
        }
        Ok(job.name.clone())
    }

    fn deserialize(&self, encoded: &str, context: serde_json::Value) -> ExecResult<Job> {
        if !self.registry.contains(encoded) {
            return Err(ExecError::SerializeFailed(format!(
                "no callable registered under name {:?}",
                encoded
            )));
        }
        Ok(Job::new(encoded, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip() {
        let registry = TaskRegistry::new();
        registry.register("double", |ctx| {
            let n = ctx.as_i64().ok_or_else(|| JobError::new("not a number"))?;
            Ok(serde_json::json!(n * 2))
        });
        let ser = RegistrySerializer::new(registry.clone());
        let job = Job::new("double", serde_json::json!(21));
        let encoded = ser.serialize(&job).unwrap();
        let decoded = ser.deserialize(&encoded, job.context.clone()).unwrap();
        let f = registry.get(&decoded.name).unwrap();
        let result = f(decoded.context).unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn serialize_fails_for_unregistered_name() {
        let registry = TaskRegistry::new();
        let ser = RegistrySerializer::new(registry);
        let job = Job::new("missing", serde_json::Value::Null);
        assert!(matches!(
            ser.serialize(&job),
            Err(ExecError::SerializeFailed(_))
        ));
    }
}
