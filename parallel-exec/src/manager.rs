//! Central factory for worker processes: the one place nesting-depth and
//! spawn-rate policy are enforced before a child ever touches the OS.

use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use tracing::{debug, info};

use crate::background::BackgroundProcess;
use crate::config::ParallelConfig;
use crate::error::{ExecError, ExecResult};
use crate::handle::ProcessHandle;
use crate::id::TaskId;
use crate::job::{Job, Serializer};
use crate::schema::{CallbackType, TaskRecord};
use crate::spawn::{self, SpawnKind};
use crate::store::StatusStore;

const NEST_LEVEL_VAR: &str = "NEST_LEVEL";
const MAX_NESTING_LEVEL_VAR: &str = "MAX_NESTING_LEVEL";
const BACKGROUND_VAR: &str = "BACKGROUND";

/// Rolling one-second spawn-rate window. Reset, not decayed: once ≥1.0s has
/// elapsed since the last reset, the counter drops back to zero rather than
/// aging out individual spawns.
struct RateLimiter {
    window_start: Instant,
    spawned_in_window: u32,
}

impl RateLimiter {
    fn new() -> Self {
        RateLimiter {
            window_start: Instant::now(),
            spawned_in_window: 0,
        }
    }

    fn try_acquire(&mut self, limit: u32) -> Result<(), u32> {
        if self.window_start.elapsed().as_secs_f64() >= 1.0 {
            self.window_start = Instant::now();
            self.spawned_in_window = 0;
        }
        if self.spawned_in_window >= limit {
            return Err(self.spawned_in_window);
        }
        self.spawned_in_window += 1;
        Ok(())
    }
}

/// Process-wide worker factory. Accessible as a global singleton via
/// [`ProcessManager::global`], but also directly constructible so tests and
/// embedding hosts can inject their own configuration and status store.
pub struct ProcessManager {
    config: ParallelConfig,
    store: Option<StatusStore>,
    serializer: Box<dyn Serializer>,
    rate_limiter: Mutex<RateLimiter>,
}

static GLOBAL: OnceLock<Mutex<Option<ProcessManager>>> = OnceLock::new();

impl ProcessManager {
    pub fn new(
        config: ParallelConfig,
        store: Option<StatusStore>,
        serializer: Box<dyn Serializer>,
    ) -> Self {
        ProcessManager {
            config,
            store,
            serializer,
            rate_limiter: Mutex::new(RateLimiter::new()),
        }
    }

    fn global_cell() -> &'static Mutex<Option<ProcessManager>> {
        GLOBAL.get_or_init(|| Mutex::new(None))
    }

    /// Install `manager` as the process-wide singleton, replacing any prior
    /// instance. Intended for host startup and for test setup/teardown.
    pub fn install(manager: ProcessManager) {
        *Self::global_cell().lock().expect("manager lock poisoned") = Some(manager);
    }

    /// Drop the installed singleton, if any. Tests that install their own
    /// manager should call this during teardown so later tests don't
    /// inherit stale rate-limiter state.
    pub fn reset() {
        *Self::global_cell().lock().expect("manager lock poisoned") = None;
    }

    pub fn with_global<R>(f: impl FnOnce(&ProcessManager) -> R) -> ExecResult<R> {
        let guard = Self::global_cell().lock().expect("manager lock poisoned");
        match guard.as_ref() {
            Some(manager) => Ok(f(manager)),
            None => Err(ExecError::Other(anyhow::anyhow!(
                "process manager not installed; call ProcessManager::install first"
            ))),
        }
    }

    fn effective_max_nesting(&self) -> u32 {
        self.config.max_nesting_level.clamp(1, 10)
    }

    fn check_nesting(&self) -> ExecResult<u32> {
        let current: u32 = std::env::var(NEST_LEVEL_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let max = self.effective_max_nesting();
        if current >= max {
            return Err(ExecError::NestingExceeded {
                level: current,
                max,
            });
        }
        Ok(current)
    }

    fn check_rate_limit(&self) -> ExecResult<()> {
        let limit = self.config.background_process.spawn_limit_per_second;
        let mut limiter = self.rate_limiter.lock().expect("rate limiter poisoned");
        limiter.try_acquire(limit).map_err(|spawned| ExecError::RateLimited { spawned, limit })
    }

    /// Spawn a streamed task and return a handle the caller awaits once.
    ///
    /// `#[track_caller]` so that a failure reconstructed later in
    /// [`ProcessHandle::get_result`] can report *this* call site, matching
    /// the requirement that a worker error's parent-side trace point at the
    /// user-level spawn call rather than somewhere inside this crate.
    #[track_caller]
    pub fn spawn_streamed(&self, job: &Job, timeout_seconds: u64) -> ExecResult<ProcessHandle> {
        let call_site = caller_location();
        let current_level = self.check_nesting()?;
        let max = self.effective_max_nesting();

        let task_id = TaskId::new();
        let callback_type = self.serializer.callback_type(job);

        if let Some(store) = &self.store {
            if self.config.logging.enabled {
                let record = TaskRecord::pending(&task_id, callback_type, job_context_size(job));
                store.create_initial(&record)?;
            }
        }

        let envs = child_envs(current_level + 1, max);
        let handle = spawn::spawn(
            &task_id,
            job,
            self.serializer.as_ref(),
            timeout_seconds,
            &self.config,
            self.store.as_ref(),
            SpawnKind::Streamed,
            &envs,
            call_site,
        )?;
        info!(task_id = %task_id, "spawned streamed task");
        Ok(handle)
    }

    /// Spawn a fire-and-forget task observable only through the status store.
    #[track_caller]
    pub fn spawn_background(&self, job: &Job, timeout_seconds: u64) -> ExecResult<BackgroundProcess> {
        let call_site = caller_location();
        let current_level = self.check_nesting()?;
        let max = self.effective_max_nesting();
        self.check_rate_limit()?;

        let task_id = TaskId::new();
        let callback_type = self.serializer.callback_type(job);

        if let Some(store) = &self.store {
            if self.config.logging.enabled {
                let record = TaskRecord::pending(&task_id, callback_type, job_context_size(job));
                store.create_initial(&record)?;
            }
        }

        let envs = child_envs(current_level + 1, max);
        let handle = spawn::spawn(
            &task_id,
            job,
            self.serializer.as_ref(),
            timeout_seconds,
            &self.config,
            self.store.as_ref(),
            SpawnKind::Background,
            &envs,
            call_site,
        )?;
        debug!(task_id = %task_id, "spawned background task");
        Ok(BackgroundProcess::from_handle(handle))
    }
}

#[track_caller]
fn caller_location() -> String {
    let loc = std::panic::Location::caller();
    format!("{}:{}", loc.file(), loc.line())
}

fn child_envs(next_level: u32, max: u32) -> Vec<(String, String)> {
    vec![
        (BACKGROUND_VAR.to_string(), "1".to_string()),
        (NEST_LEVEL_VAR.to_string(), next_level.to_string()),
        (MAX_NESTING_LEVEL_VAR.to_string(), max.to_string()),
    ]
}

fn job_context_size(job: &Job) -> u64 {
    serde_json::to_vec(&job.context).map(|v| v.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RegistrySerializer;
    use crate::job::TaskRegistry;

    fn make_manager(max_nesting: u32, spawn_limit: u32) -> ProcessManager {
        let mut config = ParallelConfig::default();
        config.max_nesting_level = max_nesting;
        config.background_process.spawn_limit_per_second = spawn_limit;
        let registry = TaskRegistry::new();
        registry.register("noop", |_ctx| Ok(serde_json::Value::Null));
        ProcessManager::new(config, None, Box::new(RegistrySerializer::new(registry)))
    }

    #[test]
    fn nesting_ceiling_blocks_spawn_at_limit() {
        // SAFETY: test-only env mutation; this test does not run spawn itself
        // concurrently with others touching NEST_LEVEL.
        unsafe {
            std::env::set_var(NEST_LEVEL_VAR, "2");
        }
        let manager = make_manager(2, 50);
        let job = Job::new("noop", serde_json::Value::Null);
        let result = manager.spawn_streamed(&job, 5);
        unsafe {
            std::env::remove_var(NEST_LEVEL_VAR);
        }
        assert!(matches!(
            result,
            Err(ExecError::NestingExceeded { level: 2, max: 2 })
        ));
    }

    #[test]
    fn rate_limiter_blocks_after_limit_reached() {
        let manager = make_manager(5, 2);
        assert!(manager.check_rate_limit().is_ok());
        assert!(manager.check_rate_limit().is_ok());
        assert!(matches!(
            manager.check_rate_limit(),
            Err(ExecError::RateLimited { spawned: 2, limit: 2 })
        ));
    }

    #[test]
    fn rate_limiter_resets_after_window() {
        let mut limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.try_acquire(3).unwrap();
        }
        assert!(limiter.try_acquire(3).is_err());
        limiter.window_start = Instant::now() - std::time::Duration::from_millis(1100);
        assert!(limiter.try_acquire(3).is_ok());
    }
}
