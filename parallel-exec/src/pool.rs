//! Bounded-concurrency scheduler over a keyed set of tasks.
//!
//! Keys are preserved end-to-end — the returned map has the same keyset and
//! iteration order as the input, independent of completion order, which is
//! why this is built on [`indexmap::IndexMap`] rather than a hash map.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;

use crate::error::{ExecError, ExecResult};
use crate::handle::{ProcessHandle, TaskOutput};
use crate::job::Job;
use crate::manager::ProcessManager;

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Per-task outcome for [`run_settled`] — never short-circuits the whole
/// pool the way a rejection from [`run`] does.
#[derive(Debug)]
pub enum Outcome {
    Fulfilled(serde_json::Value),
    Rejected(ExecError),
}

/// Why a [`CancellationToken`] fired, so `run_settled` can label the
/// outcomes of tasks still queued or running at the moment of cancellation
/// as `Rejected("cancelled")` or `Rejected("timeout")` as appropriate,
/// rather than a single generic reason regardless of cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    Timeout,
}

/// Shared cancellation flag. Cloning shares the same underlying flag, so a
/// caller can hold one end and race it against a timer while the pool's own
/// coordinator thread checks the other end each refill cycle.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>, Arc<Mutex<Option<CancelReason>>>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)), Arc::new(Mutex::new(None)))
    }

    pub fn cancel(&self) {
        self.cancel_with_reason(CancelReason::Cancelled);
    }

    pub fn cancel_with_reason(&self, reason: CancelReason) {
        *self.1.lock().expect("cancellation reason lock poisoned") = Some(reason);
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.1.lock().expect("cancellation reason lock poisoned")
    }
}

/// Runs `tasks` to completion (or the first failure), rejecting the whole
/// pool as soon as one task fails — the rest of `running` is terminated and
/// `queued` is dropped.
pub fn run<K>(
    manager: &ProcessManager,
    tasks: IndexMap<K, Job>,
    max_concurrency: usize,
    timeout_seconds: u64,
    cancel: &CancellationToken,
) -> ExecResult<IndexMap<K, serde_json::Value>>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    let settled = execute(manager, tasks, max_concurrency, timeout_seconds, cancel, true)?;
    let mut out = IndexMap::with_capacity(settled.len());
    for (key, outcome) in settled {
        match outcome {
            Outcome::Fulfilled(value) => {
                out.insert(key, value);
            }
            Outcome::Rejected(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Runs `tasks` to completion, capturing every outcome instead of
/// short-circuiting on the first failure. Only cancellation (caller-driven,
/// via `cancel`) stops it early.
pub fn run_settled<K>(
    manager: &ProcessManager,
    tasks: IndexMap<K, Job>,
    max_concurrency: usize,
    timeout_seconds: u64,
    cancel: &CancellationToken,
) -> ExecResult<IndexMap<K, Outcome>>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    execute(manager, tasks, max_concurrency, timeout_seconds, cancel, false)
}

/// Composes a pool-wide wall-clock timeout around [`run`], the way callers
/// are expected to per the bounded-concurrency contract: the pool itself has
/// no notion of an overall deadline, only `cancel()`.
pub fn run_with_timeout<K>(
    manager: &ProcessManager,
    tasks: IndexMap<K, Job>,
    max_concurrency: usize,
    timeout_seconds: u64,
    pool_timeout_seconds: u64,
) -> ExecResult<IndexMap<K, serde_json::Value>>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    let cancel = CancellationToken::new();
    let timer_cancel = cancel.clone();
    let done = Arc::new(AtomicBool::new(false));
    let timer_done = Arc::clone(&done);
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(pool_timeout_seconds));
        if !timer_done.load(Ordering::SeqCst) {
            timer_cancel.cancel_with_reason(CancelReason::Timeout);
        }
    });

    let result = run(manager, tasks, max_concurrency, timeout_seconds, &cancel);
    done.store(true, Ordering::SeqCst);
    let _ = timer.join();

    match result {
        Err(ExecError::PoolCancelled) if cancel.is_cancelled() => Err(ExecError::PoolTimedOut {
            timeout_secs: pool_timeout_seconds,
        }),
        Err(ExecError::PoolTimedOut { .. }) => Err(ExecError::PoolTimedOut {
            timeout_secs: pool_timeout_seconds,
        }),
        other => other,
    }
}

/// Composes a pool-wide wall-clock timeout around [`run_settled`]. Unlike
/// [`run_with_timeout`], the caller always gets a full settled map back:
/// tasks still queued or running when the timer fires are labelled
/// `Rejected` with [`ExecError::PoolTimedOut`] rather than short-circuiting
/// the whole call.
pub fn run_settled_with_timeout<K>(
    manager: &ProcessManager,
    tasks: IndexMap<K, Job>,
    max_concurrency: usize,
    timeout_seconds: u64,
    pool_timeout_seconds: u64,
) -> ExecResult<IndexMap<K, Outcome>>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    let cancel = CancellationToken::new();
    let timer_cancel = cancel.clone();
    let done = Arc::new(AtomicBool::new(false));
    let timer_done = Arc::clone(&done);
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(pool_timeout_seconds));
        if !timer_done.load(Ordering::SeqCst) {
            timer_cancel.cancel_with_reason(CancelReason::Timeout);
        }
    });

    let mut result = run_settled(manager, tasks, max_concurrency, timeout_seconds, &cancel);
    done.store(true, Ordering::SeqCst);
    let _ = timer.join();

    // The coordinator only knows a wall-clock deadline fired, not *which*
    // deadline; stamp the real pool timeout onto every leftover entry it
    // labelled with the placeholder zero.
    if cancel.reason() == Some(CancelReason::Timeout) {
        if let Ok(settled) = &mut result {
            for outcome in settled.values_mut() {
                if let Outcome::Rejected(ExecError::PoolTimedOut { timeout_secs }) = outcome {
                    *timeout_secs = pool_timeout_seconds;
                }
            }
        }
    }
    result
}

fn execute<K>(
    manager: &ProcessManager,
    tasks: IndexMap<K, Job>,
    max_concurrency: usize,
    timeout_seconds: u64,
    cancel: &CancellationToken,
    fail_fast: bool,
) -> ExecResult<IndexMap<K, Outcome>>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    let max_concurrency = max_concurrency.max(1);
    let order: Vec<K> = tasks.keys().cloned().collect();
    let mut queue: VecDeque<(K, Job)> = tasks.into_iter().collect();

    let mut results: HashMap<K, Outcome> = HashMap::with_capacity(order.len());
    let mut running: HashMap<K, Arc<ProcessHandle>> = HashMap::new();
    let mut first_failure: Option<ExecError> = None;
    let mut remaining = order.len();

    let (tx, rx) = mpsc::channel::<(K, ExecResult<TaskOutput>)>();

    while remaining > 0 {
        if cancel.is_cancelled() {
            break;
        }

        while running.len() < max_concurrency && !queue.is_empty() {
            let (key, job) = queue.pop_front().expect("queue non-empty");
            match manager.spawn_streamed(&job, timeout_seconds) {
                Ok(handle) => {
                    let handle = Arc::new(handle);
                    running.insert(key.clone(), Arc::clone(&handle));
                    let tx = tx.clone();
                    let key_for_thread = key.clone();
                    std::thread::spawn(move || {
                        let res = handle.get_result(timeout_seconds);
                        let _ = tx.send((key_for_thread, res));
                    });
                }
                Err(e) => {
                    remaining -= 1;
                    if fail_fast {
                        first_failure.get_or_insert(e);
                        cancel.cancel();
                    } else {
                        results.insert(key, Outcome::Rejected(e));
                    }
                }
            }
        }

        if running.is_empty() {
            if queue.is_empty() {
                break;
            }
            continue;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok((key, res)) => {
                running.remove(&key);
                remaining -= 1;
                match res {
                    Ok(output) => {
                        results.insert(key, Outcome::Fulfilled(output.result));
                    }
                    Err(e) => {
                        if fail_fast {
                            first_failure.get_or_insert(e);
                            cancel.cancel();
                        } else {
                            results.insert(key, Outcome::Rejected(e));
                        }
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if cancel.is_cancelled() {
        for (_, handle) in running.drain() {
            let _ = handle.terminate();
        }
        // Best-effort drain of in-flight completions so their waiter threads
        // don't outlive this call trying to send on a receiver nobody reads.
        while let Ok((key, res)) = rx.recv_timeout(Duration::from_secs(2)) {
            results
                .entry(key)
                .or_insert_with(|| match res {
                    Ok(output) => Outcome::Fulfilled(output.result),
                    Err(e) => Outcome::Rejected(e),
                });
        }
        let remainder_error = || match cancel.reason() {
            Some(CancelReason::Timeout) => ExecError::PoolTimedOut { timeout_secs: 0 },
            _ => ExecError::PoolCancelled,
        };
        for (key, _job) in queue.drain(..) {
            results.entry(key).or_insert_with(|| Outcome::Rejected(remainder_error()));
        }
        for key in &order {
            results
                .entry(key.clone())
                .or_insert_with(|| Outcome::Rejected(remainder_error()));
        }
    }

    if fail_fast {
        if let Some(e) = first_failure {
            return Err(e);
        }
    }

    let mut ordered = IndexMap::with_capacity(order.len());
    for key in order {
        if let Some(outcome) = results.remove(&key) {
            ordered.insert(key, outcome);
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParallelConfig;
    use crate::job::{RegistrySerializer, TaskRegistry};

    fn manager_with(registry: TaskRegistry) -> ProcessManager {
        ProcessManager::new(ParallelConfig::default(), None, Box::new(RegistrySerializer::new(registry)))
    }

    #[test]
    fn spawn_failure_is_reported_without_spawning_worker() {
        // No worker binary is resolvable in a unit-test sandbox, so every
        // spawn attempt fails with WorkerMissing/SpawnFailed — this
        // exercises the refill error path without needing a real process.
        let registry = TaskRegistry::new();
        registry.register("noop", |_| Ok(serde_json::Value::Null));
        let manager = manager_with(registry);

        unsafe {
            std::env::set_var("PARALLEL_EXEC_WORKER_BIN", "/nonexistent/parallel-exec-worker");
        }
        let mut tasks = IndexMap::new();
        tasks.insert("a", Job::new("noop", serde_json::Value::Null));
        let cancel = CancellationToken::new();
        let result = run(&manager, tasks, 2, 5, &cancel);
        unsafe {
            std::env::remove_var("PARALLEL_EXEC_WORKER_BIN");
        }
        assert!(result.is_err());
    }

    #[test]
    fn cancellation_token_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_reason_defaults_to_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(token.reason(), None);
        token.cancel();
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn cancel_with_reason_reports_timeout() {
        let token = CancellationToken::new();
        token.cancel_with_reason(CancelReason::Timeout);
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }
}
