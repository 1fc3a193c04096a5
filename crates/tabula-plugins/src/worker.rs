//! Bounded worker pool with cooperative cancellation
//!
//! Each batch runs at most `min(units, max_workers)` units at once.
//! [`WorkerPool::cancel`] follows a four-step protocol:
//! 1. stop submitting new units
//! 2. discard units that are queued but not started
//! 3. wait up to the grace period for in-flight units
//! 4. if any remain, abort them and install a fresh pool
//!
//! Step 4 is best-effort. Aborting only takes effect at an `.await`, so a
//! unit blocked in synchronous code keeps its thread until it returns.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tabula_core::config::WorkersConfig;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One independent piece of work
pub type WorkUnit = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed(Value),
    Failed(String),
    /// Cancelled before it started
    Discarded,
    /// Forcibly stopped while in flight
    Aborted,
}

/// Results of one batch, in submission order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub outcomes: Vec<UnitOutcome>,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Completed(_)))
            .count()
    }
}

/// What [`WorkerPool::cancel`] observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    pub completed: usize,
    pub discarded: usize,
    /// Units still running when the grace period ran out
    pub outstanding: usize,
    pub forced_reset: bool,
}

#[derive(Default)]
struct Tracker {
    /// Spawned and not yet finished or discarded
    pending: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    discarded: AtomicUsize,
    idle: Notify,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl Tracker {
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the pending count however the unit ends, including abort
struct PendingGuard(Arc<Tracker>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct RunningGuard(Arc<Tracker>);

impl RunningGuard {
    fn enter(tracker: &Arc<Tracker>) -> Self {
        tracker.running.fetch_add(1, Ordering::AcqRel);
        Self(tracker.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Generation {
    token: CancellationToken,
    tracker: Arc<Tracker>,
}

impl Generation {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            tracker: Arc::new(Tracker::default()),
        })
    }
}

pub struct WorkerPool {
    max_workers: usize,
    grace: Duration,
    current: Mutex<Arc<Generation>>,
    resets: AtomicU64,
}

impl WorkerPool {
    pub fn new(max_workers: usize, grace: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            grace,
            current: Mutex::new(Generation::new()),
            resets: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &WorkersConfig) -> Self {
        Self::new(
            config.max_workers,
            Duration::from_millis(config.cancel_grace_ms),
        )
    }

    /// Concurrency used for a batch of `units`
    pub fn concurrency_for(&self, units: usize) -> usize {
        units.clamp(1, self.max_workers)
    }

    /// Number of forced resets so far
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Whether a cancellation is in effect for the current generation
    pub fn is_cancelled(&self) -> bool {
        self.generation().token.is_cancelled()
    }

    fn generation(&self) -> Arc<Generation> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every unit and collect outcomes in submission order
    pub async fn run(&self, units: Vec<WorkUnit>) -> BatchOutcome {
        let generation = self.generation();
        let tracker = generation.tracker.clone();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_for(units.len())));

        let mut outcomes = vec![UnitOutcome::Discarded; units.len()];
        let mut task_index = HashMap::with_capacity(units.len());
        let mut set = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            if generation.token.is_cancelled() {
                tracker.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            tracker.pending.fetch_add(1, Ordering::AcqRel);
            let pending = PendingGuard(tracker.clone());
            let token = generation.token.clone();
            let semaphore = semaphore.clone();
            let tracker = tracker.clone();

            let handle = set.spawn(async move {
                let _pending = pending;
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    tracker.discarded.fetch_add(1, Ordering::Relaxed);
                    return UnitOutcome::Discarded;
                };
                if token.is_cancelled() {
                    tracker.discarded.fetch_add(1, Ordering::Relaxed);
                    return UnitOutcome::Discarded;
                }

                let _running = RunningGuard::enter(&tracker);
                let outcome = match unit.await {
                    Ok(value) => UnitOutcome::Completed(value),
                    Err(e) => UnitOutcome::Failed(format!("{e:#}")),
                };
                tracker.completed.fetch_add(1, Ordering::Relaxed);
                outcome
            });

            task_index.insert(handle.id(), index);
            generation
                .tracker
                .aborts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(&index) = task_index.get(&id) {
                        outcomes[index] = outcome;
                    }
                }
                Err(e) => {
                    let Some(&index) = task_index.get(&e.id()) else {
                        continue;
                    };
                    outcomes[index] = if e.is_cancelled() {
                        UnitOutcome::Aborted
                    } else {
                        UnitOutcome::Failed(format!("worker panicked: {e}"))
                    };
                }
            }
        }

        generation
            .tracker
            .aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !task_index.contains_key(&h.id()));

        let cancelled = generation.token.is_cancelled();
        debug!(units = outcomes.len(), cancelled, "Worker batch finished");
        BatchOutcome {
            outcomes,
            cancelled,
        }
    }

    /// Cancel all work in the current generation, then install a fresh one
    pub async fn cancel(&self) -> CancelReport {
        let generation = self.generation();
        generation.token.cancel();

        let tracker = &generation.tracker;
        let drained = tokio::time::timeout(self.grace, tracker.wait_idle())
            .await
            .is_ok();

        let outstanding = tracker.running.load(Ordering::Acquire);
        let forced_reset = !drained;
        if forced_reset {
            let handles: Vec<AbortHandle> = tracker
                .aborts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for handle in &handles {
                handle.abort();
            }
            self.resets.fetch_add(1, Ordering::Relaxed);
            warn!(
                outstanding,
                grace_ms = self.grace.as_millis() as u64,
                "Work still in flight after grace period, resetting worker pool"
            );
        }

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Generation::new();

        let report = CancelReport {
            completed: tracker.completed.load(Ordering::Relaxed),
            discarded: tracker.discarded.load(Ordering::Relaxed),
            outstanding: if forced_reset { outstanding } else { 0 },
            forced_reset,
        };
        info!(
            completed = report.completed,
            discarded = report.discarded,
            forced_reset,
            "Worker pool cancelled"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit<F>(f: F) -> WorkUnit
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Box::pin(f)
    }

    #[tokio::test]
    async fn test_results_keep_submission_order() {
        let pool = WorkerPool::new(2, Duration::from_millis(100));
        let units = (0..5u64)
            .map(|i| {
                unit(async move {
                    tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                    Ok(json!(i))
                })
            })
            .collect();

        let batch = pool.run(units).await;
        assert!(!batch.cancelled);
        assert_eq!(
            batch.outcomes,
            (0..5u64).map(|i| UnitOutcome::Completed(json!(i))).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(3, Duration::from_millis(100));
        assert_eq!(pool.concurrency_for(1), 1);
        assert_eq!(pool.concurrency_for(10), 3);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let units = (0..10)
            .map(|_| {
                let current = current.clone();
                let peak = peak.clone();
                unit(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                })
            })
            .collect();

        assert_eq!(pool.run(units).await.completed(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_failures_are_reported_per_unit() {
        let pool = WorkerPool::new(2, Duration::from_millis(100));
        let batch = pool
            .run(vec![
                unit(async { Ok(json!(1)) }),
                unit(async { anyhow::bail!("bad partition") }),
            ])
            .await;
        assert_eq!(batch.outcomes[0], UnitOutcome::Completed(json!(1)));
        assert!(matches!(&batch.outcomes[1], UnitOutcome::Failed(msg) if msg.contains("bad partition")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_queued_and_waits_for_in_flight() {
        let pool = Arc::new(WorkerPool::new(1, Duration::from_secs(5)));
        let units = (0..4u64)
            .map(|i| {
                unit(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!(i))
                })
            })
            .collect();

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(units).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = pool.cancel().await;
        assert!(!report.forced_reset);
        assert_eq!(report.completed, 1);
        assert_eq!(report.discarded, 3);

        let batch = runner.await.expect("runner");
        assert!(batch.cancelled);
        assert_eq!(batch.outcomes[0], UnitOutcome::Completed(json!(0)));
        assert!(batch.outcomes[1..].iter().all(|o| *o == UnitOutcome::Discarded));
        assert!(!pool.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_forces_reset_after_grace() {
        let pool = Arc::new(WorkerPool::new(2, Duration::from_millis(50)));
        let units = vec![unit(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        })];

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run(units).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = pool.cancel().await;
        assert!(report.forced_reset);
        assert_eq!(report.outstanding, 1);
        assert_eq!(pool.resets(), 1);

        let batch = runner.await.expect("runner");
        assert_eq!(batch.outcomes, vec![UnitOutcome::Aborted]);

        // A fresh generation accepts new work.
        let batch = pool.run(vec![unit(async { Ok(json!("again")) })]).await;
        assert_eq!(batch.outcomes, vec![UnitOutcome::Completed(json!("again"))]);
    }
}
