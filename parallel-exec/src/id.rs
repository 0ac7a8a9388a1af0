//! Task identifiers.
//!
//! Format: `defer_YYYYMMDD_HHMMSS_<hex-unique>` — monotonic-ish but not a
//! strict ordering key. The hex suffix borrows uniqueness from a freshly
//! generated ULID rather than hand-rolling a counter/PID/random mix.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::now_compact_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh, globally-unique task id.
    pub fn new() -> Self {
        let ts = now_compact_timestamp();
        let unique = Ulid::new().to_string().to_lowercase();
        // Keep only the trailing randomness segment of the ULID (the leading
        // characters encode the timestamp we already captured above).
        let hex_unique: String = unique.chars().rev().take(10).collect::<String>();
        let hex_unique: String = hex_unique.chars().rev().collect();
        TaskId(format!("defer_{ts}_{hex_unique}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
