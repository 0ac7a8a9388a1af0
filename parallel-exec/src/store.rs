//! Status store: one JSON record per task, persisted to disk so that a
//! parent process, a worker process, and a later inspection call can all
//! observe the same task's lifecycle without sharing memory.
//!
//! Resolution order for the store root:
//!   1. an explicit root passed by the caller
//!   2. the `PARALLEL_EXEC_ROOT` environment variable
//!   3. `$XDG_DATA_HOME/parallel-exec/tasks`
//!   4. `~/.local/share/parallel-exec/tasks` (platform data dir on Windows)

use std::path::{Path, PathBuf};

use directories::BaseDirs;

use crate::error::{ExecError, ExecResult};
use crate::id::TaskId;
use crate::schema::{TaskRecord, TaskStatus};

/// Resolve the tasks root directory following the priority chain.
pub fn resolve_root(explicit_root: Option<&Path>) -> PathBuf {
    if let Some(root) = explicit_root {
        return root.to_path_buf();
    }

    if let Ok(root) = std::env::var("PARALLEL_EXEC_ROOT") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("parallel-exec").join("tasks");
        }
    }

    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("parallel-exec").join("tasks");
    }

    PathBuf::from("~/.local/share/parallel-exec/tasks")
}

/// Handle to the on-disk status store rooted at a single directory, one
/// `<task_id>.json` file per task.
#[derive(Debug, Clone)]
pub struct StatusStore {
    root: PathBuf,
}

impl StatusStore {
    pub fn new(root: impl Into<PathBuf>) -> ExecResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(StatusStore { root })
    }

    pub fn open_default(explicit_root: Option<&Path>) -> ExecResult<Self> {
        Self::new(resolve_root(explicit_root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(format!("{}.json", task_id.as_str()))
    }

    /// Create the initial PENDING record for a freshly allocated task id.
    pub fn create_initial(&self, record: &TaskRecord) -> ExecResult<()> {
        let path = self.record_path(&TaskId::from(record.task_id.clone()));
        self.write_atomic(&path, record)
    }

    /// Overwrite the record for a task, typically called by the parent as it
    /// observes worker events, or by the worker itself before it exits.
    pub fn update(&self, record: &TaskRecord) -> ExecResult<()> {
        let path = self.record_path(&TaskId::from(record.task_id.clone()));
        self.write_atomic(&path, record)
    }

    fn write_atomic(&self, path: &Path, record: &TaskRecord) -> ExecResult<()> {
        let contents = serde_json::to_string_pretty(record)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn get(&self, task_id: &TaskId) -> ExecResult<TaskRecord> {
        let path = self.record_path(task_id);
        let raw = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::TaskNotFound(task_id.as_str().to_string())
            } else {
                ExecError::Io(e)
            }
        })?;
        serde_json::from_slice(&raw).map_err(|_| ExecError::CorruptedStatus {
            task_id: task_id.as_str().to_string(),
        })
    }

    /// List every task record currently in the store, most recently created
    /// first. Corrupted records are skipped rather than failing the whole
    /// listing.
    pub fn list_all(&self) -> ExecResult<Vec<TaskRecord>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(raw) = std::fs::read(&path) {
                if let Ok(record) = serde_json::from_slice::<TaskRecord>(&raw) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Counts per status plus min/avg/max `duration` and peak/avg
    /// `memory_usage` across every record currently in the store.
    pub fn summarize(&self) -> ExecResult<StoreSummary> {
        let mut summary = StoreSummary::default();
        let mut durations: Vec<f64> = Vec::new();
        let mut memory_samples: Vec<u64> = Vec::new();
        for record in self.list_all()? {
            match record.status {
                TaskStatus::Pending | TaskStatus::Received => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Error | TaskStatus::SpawnError => summary.failed += 1,
                TaskStatus::Timeout => summary.timed_out += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
            if let Some(d) = record.duration {
                durations.push(d);
            }
            if let Some(m) = record.memory_usage {
                memory_samples.push(m);
            }
        }

        if !durations.is_empty() {
            let sum: f64 = durations.iter().sum();
            summary.duration_min = durations.iter().cloned().fold(f64::INFINITY, f64::min);
            summary.duration_max = durations.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            summary.duration_avg = sum / durations.len() as f64;
        }
        if !memory_samples.is_empty() {
            let sum: u64 = memory_samples.iter().sum();
            summary.memory_peak = memory_samples.iter().copied().max().unwrap_or(0);
            summary.memory_avg = sum as f64 / memory_samples.len() as f64;
        }

        Ok(summary)
    }

    /// Remove terminal-state records older than `max_age_secs`. Returns the
    /// number of records removed. Non-terminal records are never removed,
    /// even if old, since that would erase evidence of a stuck task.
    ///
    /// When `temp_files_dir` is given, any `defer_*.tmp` entry found there is
    /// also removed unconditionally — these are leftover atomic-write
    /// temporaries from a worker or parent that died mid-write, not live
    /// records, so no age check applies to them.
    pub fn cleanup(&self, max_age_secs: u64, temp_files_dir: Option<&Path>) -> ExecResult<usize> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut removed = 0;
        for record in self.list_all()? {
            if !record.status.is_terminal() {
                continue;
            }
            let updated = parse_epoch_secs(&record.updated_at).unwrap_or(now);
            if now.saturating_sub(updated) >= max_age_secs {
                let path = self.record_path(&TaskId::from(record.task_id.clone()));
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }

        if let Some(dir) = temp_files_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with("defer_") && name.ends_with(".tmp") {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }

        Ok(removed)
    }
}

/// Best-effort parse of an RFC3339 `YYYY-MM-DDTHH:MM:SSZ` timestamp back to
/// Unix seconds. Used by [`StatusStore::cleanup`]'s age comparison and, via
/// `pub(crate)`, by the worker's own `duration` computation when it writes a
/// terminal status record.
pub(crate) fn parse_epoch_secs(rfc3339: &str) -> Option<u64> {
    let bytes = rfc3339.as_bytes();
    if bytes.len() < 19 {
        return None;
    }
    let year: u64 = rfc3339.get(0..4)?.parse().ok()?;
    let month: u64 = rfc3339.get(5..7)?.parse().ok()?;
    let day: u64 = rfc3339.get(8..10)?.parse().ok()?;
    let hour: u64 = rfc3339.get(11..13)?.parse().ok()?;
    let min: u64 = rfc3339.get(14..16)?.parse().ok()?;
    let sec: u64 = rfc3339.get(17..19)?.parse().ok()?;

    let mut days: u64 = 0;
    for y in 1970..year {
        days += if is_leap(y) { 366 } else { 365 };
    }
    let leap = is_leap(year);
    let month_days: [u64; 12] = [31, if leap { 29 } else { 28 }, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    for m in 0..(month.saturating_sub(1) as usize) {
        days += month_days[m];
    }
    days += day.saturating_sub(1);

    Some(((days * 24 + hour) * 60 + min) * 60 + sec)
}

fn is_leap(year: u64) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreSummary {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub duration_min: f64,
    pub duration_avg: f64,
    pub duration_max: f64,
    pub memory_avg: f64,
    pub memory_peak: u64,
}

impl Default for StoreSummary {
    fn default() -> Self {
        StoreSummary {
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            duration_min: 0.0,
            duration_avg: 0.0,
            duration_max: 0.0,
            memory_avg: 0.0,
            memory_peak: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CallbackType;

    fn temp_store() -> (tempfile::TempDir, StatusStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn resolve_root_explicit_wins() {
        let root = resolve_root(Some(Path::new("/tmp/explicit-root")));
        assert_eq!(root, PathBuf::from("/tmp/explicit-root"));
    }

    #[test]
    fn create_then_get_round_trips() {
        let (_dir, store) = temp_store();
        let id = TaskId::new();
        let record = TaskRecord::pending(&id, CallbackType::Function, 12);
        store.create_initial(&record).unwrap();
        let fetched = store.get(&id).unwrap();
        assert_eq!(fetched.task_id, record.task_id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[test]
    fn get_missing_task_is_not_found() {
        let (_dir, store) = temp_store();
        let id = TaskId::new();
        assert!(matches!(store.get(&id), Err(ExecError::TaskNotFound(_))));
    }

    #[test]
    fn update_overwrites_status() {
        let (_dir, store) = temp_store();
        let id = TaskId::new();
        let mut record = TaskRecord::pending(&id, CallbackType::Function, 0);
        store.create_initial(&record).unwrap();
        record.status = TaskStatus::Running;
        record.pid = Some(4242);
        store.update(&record).unwrap();
        let fetched = store.get(&id).unwrap();
        assert_eq!(fetched.status, TaskStatus::Running);
        assert_eq!(fetched.pid, Some(4242));
    }

    #[test]
    fn list_all_and_summarize() {
        let (_dir, store) = temp_store();
        for status in [TaskStatus::Running, TaskStatus::Completed, TaskStatus::Error] {
            let id = TaskId::new();
            let mut record = TaskRecord::pending(&id, CallbackType::Function, 0);
            record.status = status;
            store.create_initial(&record).unwrap();
        }
        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 3);
        let summary = store.summarize().unwrap();
        assert_eq!(summary.running, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn cleanup_removes_only_old_terminal_records() {
        let (_dir, store) = temp_store();

        let stale_id = TaskId::new();
        let mut stale = TaskRecord::pending(&stale_id, CallbackType::Function, 0);
        stale.status = TaskStatus::Completed;
        stale.updated_at = "2000-01-01T00:00:00Z".to_string();
        store.create_initial(&stale).unwrap();

        let fresh_id = TaskId::new();
        let mut fresh = TaskRecord::pending(&fresh_id, CallbackType::Function, 0);
        fresh.status = TaskStatus::Completed;
        store.create_initial(&fresh).unwrap();

        let running_id = TaskId::new();
        let mut running = TaskRecord::pending(&running_id, CallbackType::Function, 0);
        running.status = TaskStatus::Running;
        running.updated_at = "2000-01-01T00:00:00Z".to_string();
        store.create_initial(&running).unwrap();

        let removed = store.cleanup(3600, None).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&stale_id).is_err());
        assert!(store.get(&fresh_id).is_ok());
        assert!(store.get(&running_id).is_ok());
    }

    #[test]
    fn cleanup_also_sweeps_temp_files_dir() {
        let (_dir, store) = temp_store();
        let tmp_dir = tempfile::tempdir().unwrap();
        let leftover = tmp_dir.path().join("defer_20240101_000000_abc123.tmp");
        std::fs::write(&leftover, "partial").unwrap();
        let unrelated = tmp_dir.path().join("other.tmp");
        std::fs::write(&unrelated, "keep").unwrap();

        store.cleanup(3600, Some(tmp_dir.path())).unwrap();

        assert!(!leftover.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn summarize_computes_duration_and_memory_stats() {
        let (_dir, store) = temp_store();
        for (duration, memory) in [(1.0, 100u64), (3.0, 300u64), (2.0, 200u64)] {
            let id = TaskId::new();
            let mut record = TaskRecord::pending(&id, CallbackType::Function, 0);
            record.status = TaskStatus::Completed;
            record.duration = Some(duration);
            record.memory_usage = Some(memory);
            store.create_initial(&record).unwrap();
        }
        let summary = store.summarize().unwrap();
        assert_eq!(summary.duration_min, 1.0);
        assert_eq!(summary.duration_max, 3.0);
        assert_eq!(summary.duration_avg, 2.0);
        assert_eq!(summary.memory_peak, 300);
        assert_eq!(summary.memory_avg, 200.0);
    }
}
