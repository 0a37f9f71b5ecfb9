use anyhow::Result;
use clap::Parser;
use r_deadlock::operation_scheduler::OperationScheduler;
use r_deadlock::SchedulerConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run concurrent transactions that lock random entities in random order and
/// report how many deadlocks were detected and retried.
#[derive(Parser, Debug)]
#[command(name = "r_deadlock", version, about)]
struct Args {
    /// Concurrent worker threads
    #[arg(short, long, default_value_t = 4, env = "R_DEADLOCK_WORKERS")]
    workers: usize,

    /// Operations each worker runs
    #[arg(short, long, default_value_t = 1000, env = "R_DEADLOCK_OPERATIONS")]
    operations: usize,

    /// Number of entities operations draw from
    #[arg(short, long, default_value_t = 16, env = "R_DEADLOCK_RESOURCES")]
    resources: usize,

    /// Entities locked per operation
    #[arg(short, long, default_value_t = 3, env = "R_DEADLOCK_LOCKS_PER_OP")]
    locks_per_op: usize,

    /// Lock wait timeout in milliseconds
    #[arg(long, default_value_t = 500, env = "R_DEADLOCK_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: u64,

    /// Retries per operation after a deadlock or timeout
    #[arg(long, default_value_t = 8, env = "R_DEADLOCK_MAX_RETRIES")]
    max_retries: usize,

    /// Base retry backoff in microseconds
    #[arg(long, default_value_t = 1000, env = "R_DEADLOCK_BACKOFF_US")]
    backoff_us: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "R_DEADLOCK_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_workers(self.workers)
            .with_operations_per_worker(self.operations)
            .with_resources(self.resources)
            .with_locks_per_operation(self.locks_per_op)
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_max_retries(self.max_retries)
            .with_retry_backoff(Duration::from_micros(self.backoff_us))
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("r_deadlock={}", args.log_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[tokio::main(flavor = "multi_thread", worker_threads = 6)]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = args.scheduler_config();
    info!(?config, "starting workload");
    let scheduler = Arc::new(OperationScheduler::new(config)?);
    let report = scheduler.clone().schedule_with_task().await?;

    let stats = scheduler.manager().detector().stats();
    println!(
        "committed={} deadlocks={} timeouts={} retries={} given_up={} checks={}",
        report.committed,
        report.deadlocks,
        report.timeouts,
        report.retries,
        report.given_up,
        stats.checks()
    );
    Ok(())
}
