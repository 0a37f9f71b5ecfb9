//! In-process deadlock detection for pessimistic resource locking.
//!
//! [`DeadlockDetector`] keeps the wait-for graph and refuses a wait that would
//! close a cycle. [`LockManager`] is an entity lock manager built on it, and
//! [`OperationScheduler`] drives concurrent transactions through that manager.

pub mod config;
pub mod dead_lock_detector;
pub mod lock;
pub mod lock_mgr;
pub mod operation;
pub mod operation_scheduler;
pub mod resource;

pub use config::{LockManagerConfig, SchedulerConfig};
pub use dead_lock_detector::{
    DeadlockDetector, DeadlockError, DeadlockStats, WaitForSnapshot, WaitGuard, WaitTable,
};
pub use lock::{EntityLock, Lock, ResourceId};
pub use lock_mgr::{LockDetector, LockErrorCode, LockManager};
pub use operation::{Operation, TxId};
pub use operation_scheduler::{OperationScheduler, ScheduleReport};
pub use resource::{Holder, Resource};
