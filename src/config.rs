use std::time::Duration;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LockManagerConfig {
    /// How long `acquire` blocks before giving up.
    pub default_timeout: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockManagerConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub operations_per_worker: usize,
    /// Size of the entity pool operations draw from.
    pub resources: usize,
    pub locks_per_operation: usize,
    pub lock_timeout: Duration,
    /// Attempts after the first one before an operation is given up.
    pub max_retries: usize,
    /// Base backoff, doubled on every retry.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            operations_per_worker: 1000,
            resources: 16,
            locks_per_operation: 3,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_retries: 8,
            retry_backoff: Duration::from_millis(1),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_operations_per_worker(mut self, operations: usize) -> Self {
        self.operations_per_worker = operations;
        self
    }

    pub fn with_resources(mut self, resources: usize) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_locks_per_operation(mut self, locks: usize) -> Self {
        self.locks_per_operation = locks;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.workers > 0, "workers must be > 0");
        anyhow::ensure!(self.resources > 0, "resources must be > 0");
        anyhow::ensure!(
            self.locks_per_operation > 0 && self.locks_per_operation <= self.resources,
            "locks_per_operation must be in 1..={} but was {}",
            self.resources,
            self.locks_per_operation
        );
        Ok(())
    }

    pub fn lock_manager_config(&self) -> LockManagerConfig {
        LockManagerConfig::default().with_default_timeout(self.lock_timeout)
    }
}
