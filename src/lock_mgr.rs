use crate::config::LockManagerConfig;
use crate::dead_lock_detector::{DeadlockDetector, DeadlockError};
use crate::lock::{EntityLock, Lock, ResourceId};
use crate::resource::Holder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

const FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub type LockDetector<H> = DeadlockDetector<Arc<EntityLock<H>>>;

#[derive(Error, Debug)]
pub enum LockErrorCode<H: Holder> {
    #[error(transparent)]
    Deadlock(#[from] DeadlockError<Arc<EntityLock<H>>>),
    #[error("Timed out after {waited:?} acquiring RES_ID {rid} for {holder:?}")]
    Timeout {
        holder: H,
        rid: ResourceId,
        waited: Duration,
    },
    #[error("No lock held on RES_ID {rid} by {holder:?}")]
    NoLockHeld { holder: H, rid: ResourceId },
}

impl<H: Holder> LockErrorCode<H> {
    /// Whether the caller should roll back and may try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            LockErrorCode::Deadlock(err) => err.is_retryable(),
            LockErrorCode::Timeout { .. } => true,
            LockErrorCode::NoLockHeld { .. } => false,
        }
    }
}

#[derive(Debug)]
struct LockTable<H> {
    resource_table: HashMap<ResourceId, Arc<EntityLock<H>>>,
    holder_table: HashMap<H, Vec<ResourceId>>,
}

impl<H: Holder> LockTable<H> {
    fn new() -> Self {
        Self {
            resource_table: HashMap::new(),
            holder_table: HashMap::new(),
        }
    }

    /// Look up (or create) the lock for `rid` and pin it so it survives until
    /// the caller unpins.
    fn pin(&mut self, rid: &str) -> Arc<EntityLock<H>> {
        let entity = self
            .resource_table
            .entry(rid.to_string())
            .or_insert_with(|| Arc::new(EntityLock::new(rid.to_string())))
            .clone();
        entity.state().pinned += 1;
        entity
    }

    fn unpin(&mut self, entity: &EntityLock<H>) {
        entity.state().pinned -= 1;
        self.evict_if_idle(entity.id());
    }

    /// Drop the lock for `rid` if nobody owns or is about to use it.
    fn evict_if_idle(&mut self, rid: &str) {
        let idle = match self.resource_table.get(rid) {
            Some(entity) => {
                let state = entity.state();
                state.owner.is_none() && state.pinned == 0
            }
            None => false,
        };
        if idle {
            self.resource_table.remove(rid);
        }
    }

    fn record_held(&mut self, holder: &H, rid: &str) {
        let held = self.holder_table.entry(holder.clone()).or_default();
        if !held.iter().any(|r| r == rid) {
            held.push(rid.to_string());
        }
    }

    fn forget_held(&mut self, holder: &H, rid: &str) {
        if let Some(held) = self.holder_table.get_mut(holder) {
            held.retain(|r| r != rid);
            if held.is_empty() {
                self.holder_table.remove(holder);
            }
        }
    }
}

/// Pessimistic entity locking for concurrent transactions.
///
/// Before blocking on a lock owned by someone else, the requesting holder is
/// registered with the deadlock detector; the edge is removed again once the
/// lock is granted or the wait is abandoned.
pub struct LockManager<H: Holder> {
    config: LockManagerConfig,
    detector: Arc<LockDetector<H>>,
    lock_table: Mutex<LockTable<H>>,
}

impl<H: Holder> fmt::Debug for LockManager<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("locks", &self.lock_count())
            .field("detector", &self.detector)
            .finish()
    }
}

impl<H: Holder> Default for LockManager<H> {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl<H: Holder> LockManager<H> {
    pub fn new(config: LockManagerConfig) -> Self {
        Self::with_detector(config, Arc::new(DeadlockDetector::new()))
    }

    pub fn with_detector(config: LockManagerConfig, detector: Arc<LockDetector<H>>) -> Self {
        Self {
            config,
            detector,
            lock_table: Mutex::new(LockTable::new()),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<LockDetector<H>> {
        &self.detector
    }

    pub fn acquire(&self, holder: &H, rid: &str) -> Result<Lock<H>, LockErrorCode<H>> {
        self.try_acquire(holder, rid, self.config.default_timeout)
    }

    /// Acquire `rid` for `holder`, blocking for at most `timeout`.
    ///
    /// Reentrant: a holder that already owns `rid` is granted immediately.
    pub fn try_acquire(
        &self,
        holder: &H,
        rid: &str,
        timeout: Duration,
    ) -> Result<Lock<H>, LockErrorCode<H>> {
        let start = Instant::now();
        let entity = self.lock_table.lock().pin(rid);
        let deadline = start.checked_add(timeout).unwrap_or_else(|| start + FOREVER);
        let granted = self.wait_for_grant(holder, &entity, start, deadline);

        let mut table = self.lock_table.lock();
        table.unpin(&entity);
        let depth = granted?;
        table.record_held(holder, rid);
        drop(table);
        let lock = Lock {
            holder: holder.clone(),
            rid: rid.to_string(),
            depth,
            waited: start.elapsed(),
        };
        debug!(holder = ?lock.holder, rid, depth, waited = ?lock.waited, "lock granted");
        Ok(lock)
    }

    fn wait_for_grant(
        &self,
        holder: &H,
        entity: &Arc<EntityLock<H>>,
        start: Instant,
        deadline: Instant,
    ) -> Result<usize, LockErrorCode<H>> {
        {
            let mut state = entity.state();
            if state.try_grant(holder) {
                return Ok(state.depth);
            }
        }

        loop {
            // The detector reads ownership through the entity's state lock, so
            // it must never run while that lock is held here.
            if let Err(err) = self.detector.detect_deadlock(holder.clone(), entity.clone()) {
                self.detector.remove_waiting(holder);
                return Err(LockErrorCode::Deadlock(err));
            }
            let timed_out = {
                let mut state = entity.state();
                if state.grantable(holder) {
                    false
                } else {
                    trace!(?holder, rid = entity.id(), "waiting for lock");
                    !entity.wait_until(&mut state, deadline)
                }
            };

            // The edge has to be gone before ownership can move to `holder`:
            // `holder -> entity` with `holder` as owner reads as a cycle to
            // any concurrent walk. The next round registers it again.
            self.detector.remove_waiting(holder);
            let mut state = entity.state();
            if state.try_grant(holder) {
                return Ok(state.depth);
            }
            if timed_out {
                return Err(LockErrorCode::Timeout {
                    holder: holder.clone(),
                    rid: entity.id().to_string(),
                    waited: start.elapsed(),
                });
            }
        }
    }

    /// Release one level of `holder`'s lock on `rid`.
    pub fn release(&self, holder: &H, rid: &str) -> Result<(), LockErrorCode<H>> {
        let mut table = self.lock_table.lock();
        let remaining = table
            .resource_table
            .get(rid)
            .and_then(|entity| entity.unlock(holder));
        match remaining {
            None => Err(LockErrorCode::NoLockHeld {
                holder: holder.clone(),
                rid: rid.to_string(),
            }),
            Some(0) => {
                table.forget_held(holder, rid);
                table.evict_if_idle(rid);
                debug!(?holder, rid, "lock released");
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Release everything `holder` owns, as at the end of a transaction, and
    /// drop any wait edge it left behind. Returns the number of locks freed.
    pub fn release_all(&self, holder: &H) -> usize {
        let mut table = self.lock_table.lock();
        let held = table.holder_table.remove(holder).unwrap_or_default();
        for rid in held.iter() {
            if let Some(entity) = table.resource_table.get(rid) {
                entity.unlock_all(holder);
            }
            table.evict_if_idle(rid);
        }
        drop(table);
        self.detector.remove_waiting(holder);
        debug!(?holder, released = held.len(), "released all locks");
        held.len()
    }

    pub fn holder_of(&self, rid: &str) -> Option<H> {
        let entity = self.lock_table.lock().resource_table.get(rid).cloned();
        entity.and_then(|e| e.owner())
    }

    pub fn locks_held(&self, holder: &H) -> Vec<ResourceId> {
        self.lock_table
            .lock()
            .holder_table
            .get(holder)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of entity locks currently tracked.
    pub fn lock_count(&self) -> usize {
        self.lock_table.lock().resource_table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    fn manager() -> Arc<LockManager<u64>> {
        Arc::new(LockManager::new(
            LockManagerConfig::default().with_default_timeout(Duration::from_secs(5)),
        ))
    }

    fn wait_until_waiting(mgr: &LockManager<u64>, holder: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !mgr.detector().is_waiting(&holder) {
            assert!(Instant::now() < deadline, "holder {} never started waiting", holder);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    pub fn test_lock_unlock() {
        let mgr = manager();
        let lock = mgr.acquire(&1, "1,2,3").unwrap();
        assert_eq!(1, lock.depth);
        assert!(!lock.is_reentrant());
        assert_eq!(Some(1), mgr.holder_of("1,2,3"));
        assert!(mgr.release(&1, "1,2,3").is_ok());
        assert_eq!(None, mgr.holder_of("1,2,3"));
        assert_eq!(0, mgr.lock_count());
    }

    #[test]
    pub fn test_reentrant_acquire() {
        let mgr = manager();
        mgr.acquire(&1, "a").unwrap();
        let again = mgr.acquire(&1, "a").unwrap();
        assert!(again.is_reentrant());
        assert_eq!(vec!["a".to_string()], mgr.locks_held(&1));

        mgr.release(&1, "a").unwrap();
        assert_eq!(Some(1), mgr.holder_of("a"));
        mgr.release(&1, "a").unwrap();
        assert_eq!(None, mgr.holder_of("a"));
        assert!(mgr.locks_held(&1).is_empty());
    }

    #[test]
    pub fn test_release_not_held() {
        let mgr = manager();
        mgr.acquire(&1, "a").unwrap();
        let err = mgr.release(&2, "a").unwrap_err();
        assert!(matches!(err, LockErrorCode::NoLockHeld { holder: 2, .. }));
        assert!(!err.is_retryable());
        assert!(mgr.release(&1, "missing").is_err());
    }

    #[test]
    pub fn test_timeout_removes_wait_edge() {
        let mgr = manager();
        mgr.acquire(&1, "a").unwrap();
        let err = mgr.try_acquire(&2, "a", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LockErrorCode::Timeout { holder: 2, .. }));
        assert!(err.is_retryable());
        assert!(!mgr.detector().is_waiting(&2));
        assert_eq!(Some(1), mgr.holder_of("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    pub async fn test_wait_lock_state() {
        let mgr = manager();
        mgr.acquire(&1, "1,2,3").unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::task::spawn_blocking(move || {
                mgr.try_acquire(&2, "1,2,3", Duration::from_secs(5))
            })
        };
        let waiting = {
            let mgr = mgr.clone();
            tokio::task::spawn_blocking(move || wait_until_waiting(&mgr, 2))
        };
        waiting.await.unwrap();
        assert!(mgr.release(&1, "1,2,3").is_ok());

        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(2, lock.holder);
        assert!(!mgr.detector().is_waiting(&2));
    }

    #[test]
    pub fn test_deadlock_between_two_threads() {
        let mgr = manager();
        mgr.acquire(&1, "a").unwrap();
        mgr.acquire(&2, "b").unwrap();

        let blocked = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.acquire(&1, "b"))
        };
        wait_until_waiting(&mgr, 1);

        let err = mgr.acquire(&2, "a").unwrap_err();
        match &err {
            LockErrorCode::Deadlock(deadlock) => {
                assert_eq!(2, deadlock.holder);
                assert_eq!(2, deadlock.closing_holder);
                assert_eq!(vec![2, 1], deadlock.cycle_members());
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
        assert!(err.is_retryable());
        assert!(!mgr.detector().is_waiting(&2));

        assert_eq!(1, mgr.release_all(&2));
        let lock = blocked.join().unwrap().unwrap();
        assert_eq!("b", lock.rid);
        assert_eq!(2, mgr.release_all(&1));
        assert_eq!(0, mgr.lock_count());
    }

    #[test]
    pub fn test_release_all_clears_state() {
        let mgr = manager();
        mgr.acquire(&7, "a").unwrap();
        mgr.acquire(&7, "a").unwrap();
        mgr.acquire(&7, "b").unwrap();
        mgr.detector().add_waiting(7, mgr_entity(&mgr, "b"));
        assert_eq!(2, mgr.release_all(&7));
        assert!(mgr.locks_held(&7).is_empty());
        assert!(!mgr.detector().is_waiting(&7));
        assert_eq!(0, mgr.release_all(&7));
    }

    fn mgr_entity(mgr: &LockManager<u64>, rid: &str) -> Arc<EntityLock<u64>> {
        mgr.lock_table.lock().resource_table[rid].clone()
    }

    #[test]
    pub fn test_contended_counter() {
        let mgr = manager();
        let counter = Arc::new(Mutex::new(0_u64));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4_u64)
            .map(|holder| {
                let mgr = mgr.clone();
                let counter = counter.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        mgr.acquire(&holder, "counter").unwrap();
                        *counter.lock() += 1;
                        mgr.release(&holder, "counter").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(400, *counter.lock());
        assert_eq!(0, mgr.detector().waiting_count());
        assert_eq!(0, mgr.detector().stats().deadlocks_found());
    }

    #[test]
    pub fn test_single_lock_contention_reports_no_deadlock() {
        const ROUNDS: usize = 5_000;
        let mgr = manager();
        // 1 owns "w" for the whole test and fights 2 over "x"; 3 keeps asking
        // for "w", so its walk passes through 1 while 1 waits on or wins "x".
        mgr.acquire(&1, "w").unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let contenders: Vec<_> = [1_u64, 2]
            .into_iter()
            .map(|holder| {
                let mgr = mgr.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        match mgr.acquire(&holder, "x") {
                            Ok(_) => mgr.release(&holder, "x").unwrap(),
                            Err(LockErrorCode::Timeout { .. }) => {}
                            Err(err) => panic!("{} failed on x: {}", holder, err),
                        }
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        let observer = {
            let mgr = mgr.clone();
            std::thread::spawn(move || {
                let mut deadlocks = 0;
                for _ in 0..ROUNDS {
                    match mgr.try_acquire(&3, "w", Duration::ZERO) {
                        Err(LockErrorCode::Deadlock(_)) => deadlocks += 1,
                        Err(_) => {}
                        Ok(lock) => panic!("3 was granted {:?} held by 1", lock),
                    }
                }
                deadlocks
            })
        };

        let observed = observer.join().unwrap();
        done.store(true, Ordering::Relaxed);
        for handle in contenders {
            handle.join().unwrap();
        }
        assert_eq!(0, observed);
        assert_eq!(0, mgr.detector().stats().deadlocks_found());
        assert_eq!(0, mgr.detector().waiting_count());
        assert_eq!(Some(1), mgr.holder_of("w"));
    }
}
