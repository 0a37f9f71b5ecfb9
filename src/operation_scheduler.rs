use crate::config::SchedulerConfig;
use crate::lock_mgr::{LockErrorCode, LockManager};
use crate::operation::{Operation, TxId};
use anyhow::{anyhow, Context, Result};
use rand::seq::index::sample;
use rand::Rng;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ScheduleReport {
    pub committed: u64,
    pub deadlocks: u64,
    pub timeouts: u64,
    pub retries: u64,
    /// Operations abandoned after exhausting their retries.
    pub given_up: u64,
}

impl AddAssign for ScheduleReport {
    fn add_assign(&mut self, other: Self) {
        self.committed += other.committed;
        self.deadlocks += other.deadlocks;
        self.timeouts += other.timeouts;
        self.retries += other.retries;
        self.given_up += other.given_up;
    }
}

/// Drives concurrent transactions through a shared [`LockManager`]. Each
/// transaction locks a few random entities in random order, so deadlocks
/// happen and have to be retried.
#[derive(Debug)]
pub struct OperationScheduler {
    config: SchedulerConfig,
    manager: Arc<LockManager<TxId>>,
    next_tx: AtomicU64,
}

impl OperationScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(LockManager::new(config.lock_manager_config()));
        Ok(Self {
            config,
            manager,
            next_tx: AtomicU64::new(1),
        })
    }

    pub fn manager(&self) -> &Arc<LockManager<TxId>> {
        &self.manager
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn next_tx_id(&self) -> TxId {
        TxId(self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    pub fn new_operation<R: Rng>(&self, rng: &mut R) -> Operation {
        let resources = sample(rng, self.config.resources, self.config.locks_per_operation)
            .into_iter()
            .map(Operation::entity_id)
            .collect();
        Operation::new(resources)
    }

    /// Run `op` to completion, retrying with a fresh transaction id whenever
    /// a lock is refused with a retryable error.
    pub fn run_operation<R: Rng>(
        &self,
        op: &Operation,
        rng: &mut R,
        report: &mut ScheduleReport,
    ) -> Result<()> {
        for attempt in 0..=self.config.max_retries {
            let tx = self.next_tx_id();
            match self.lock_all(tx, op) {
                Ok(()) => {
                    self.manager.release_all(&tx);
                    report.committed += 1;
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    self.manager.release_all(&tx);
                    match err {
                        LockErrorCode::Deadlock(_) => report.deadlocks += 1,
                        _ => report.timeouts += 1,
                    }
                    if attempt == self.config.max_retries {
                        break;
                    }
                    report.retries += 1;
                    let backoff = self.backoff(attempt, rng);
                    debug!(%tx, attempt, ?backoff, error = %err, "retrying operation");
                    std::thread::sleep(backoff);
                }
                Err(err) => {
                    self.manager.release_all(&tx);
                    return Err(anyhow!(err))
                        .with_context(|| format!("operation {:?} failed", op.resources));
                }
            }
        }
        warn!(resources = ?op.resources, "operation given up after retries");
        report.given_up += 1;
        Ok(())
    }

    fn lock_all(&self, tx: TxId, op: &Operation) -> Result<(), LockErrorCode<TxId>> {
        for rid in op.resources.iter() {
            self.manager.acquire(&tx, rid)?;
        }
        Ok(())
    }

    fn backoff<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        let base = self.config.retry_backoff;
        if base.is_zero() {
            return base;
        }
        let exp = base.saturating_mul(1 << attempt.min(10));
        let jitter = rng.gen_range(0..=base.as_micros() as u64);
        exp + Duration::from_micros(jitter)
    }

    /// Spawn `workers` blocking tasks, each running `operations_per_worker`
    /// operations, and sum up their outcomes.
    pub async fn schedule_with_task(self: Arc<Self>) -> Result<ScheduleReport> {
        let mut join_handlers = vec![];
        for worker_num in 0..self.config.workers {
            let scheduler = self.clone();
            let join_handler = tokio::task::spawn_blocking(move || -> Result<ScheduleReport> {
                let mut rng = rand::thread_rng();
                let mut report = ScheduleReport::default();
                for _ in 0..scheduler.config.operations_per_worker {
                    let op = scheduler.new_operation(&mut rng);
                    scheduler.run_operation(&op, &mut rng, &mut report)?;
                }
                debug!(worker_num, ?report, "worker finished");
                Ok(report)
            });
            join_handlers.push(join_handler);
        }

        let mut total = ScheduleReport::default();
        for joined in futures::future::join_all(join_handlers).await {
            total += joined.context("worker panicked")??;
        }
        info!(
            committed = total.committed,
            deadlocks = total.deadlocks,
            timeouts = total.timeouts,
            retries = total.retries,
            given_up = total.given_up,
            "schedule finished"
        );
        Ok(total)
    }
}
