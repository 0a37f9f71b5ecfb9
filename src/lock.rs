use crate::resource::{Holder, Resource};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::time::{Duration, Instant};

pub type ResourceId = String;

/// A granted lock as reported back to the caller.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Lock<H> {
    pub holder: H,
    pub rid: ResourceId,
    /// Reentrant depth after this grant; 1 for a first acquisition.
    pub depth: usize,
    pub waited: Duration,
}

impl<H> Lock<H> {
    pub fn is_reentrant(&self) -> bool {
        self.depth > 1
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct LockState<H> {
    pub owner: Option<H>,
    /// Reentrant acquisitions by `owner`.
    pub depth: usize,
    /// Callers that looked this lock up and have not finished with it yet.
    pub pinned: usize,
}

impl<H> Default for LockState<H> {
    fn default() -> Self {
        Self {
            owner: None,
            depth: 0,
            pinned: 0,
        }
    }
}

impl<H: Holder> LockState<H> {
    pub fn grantable(&self, holder: &H) -> bool {
        match &self.owner {
            None => true,
            Some(owner) => owner == holder,
        }
    }

    /// Grant if free or already owned by `holder`.
    pub fn try_grant(&mut self, holder: &H) -> bool {
        if !self.grantable(holder) {
            return false;
        }
        self.owner = Some(holder.clone());
        self.depth += 1;
        true
    }
}

/// Pessimistic, reentrant, exclusive lock on one entity.
pub struct EntityLock<H> {
    rid: ResourceId,
    state: Mutex<LockState<H>>,
    available: Condvar,
}

impl<H: Holder> EntityLock<H> {
    pub fn new(rid: ResourceId) -> Self {
        Self {
            rid,
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.rid
    }

    pub fn owner(&self) -> Option<H> {
        self.state.lock().owner.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, LockState<H>> {
        self.state.lock()
    }

    /// Block until notified or `deadline` passes. Returns false on timeout.
    pub(crate) fn wait_until(
        &self,
        state: &mut MutexGuard<'_, LockState<H>>,
        deadline: Instant,
    ) -> bool {
        !self.available.wait_until(state, deadline).timed_out()
    }

    /// Drop one level of `holder`'s ownership, waking waiters once the lock is
    /// free. Returns the remaining depth, or `None` if `holder` is not the owner.
    pub(crate) fn unlock(&self, holder: &H) -> Option<usize> {
        let mut state = self.state.lock();
        if state.owner.as_ref() != Some(holder) {
            return None;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.available.notify_all();
        }
        Some(state.depth)
    }

    /// Release every level of `holder`'s ownership.
    pub(crate) fn unlock_all(&self, holder: &H) -> bool {
        let mut state = self.state.lock();
        if state.owner.as_ref() != Some(holder) {
            return false;
        }
        state.depth = 0;
        state.owner = None;
        self.available.notify_all();
        true
    }
}

impl<H: Holder> Resource for EntityLock<H> {
    type Holder = H;

    fn current_holder(&self) -> Option<H> {
        self.owner()
    }
}

impl<H> fmt::Debug for EntityLock<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rid)
    }
}
