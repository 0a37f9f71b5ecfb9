//! Wait-for graph bookkeeping and cycle detection.
//!
//! The detector records at most one "is waiting for" edge per holder:
//!
//! ```text
//! t1 -> r1 (held by t2)
//! t2 -> r2 (held by t1)      t1 -> t2 -> t1: deadlock
//! ```
//!
//! Holder to holder edges are derived on the fly by asking each resource for
//! its current owner, so the table never has to be told when ownership moves.
//! Registration and traversal run under one mutex; splitting them would let
//! two waiters each miss the edge that closes their cycle.

use crate::resource::{Holder, Resource};
use parking_lot::Mutex;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Holder -> the single resource it is blocked on.
pub type WaitTable<R> = HashMap<<R as Resource>::Holder, R>;

/// A circular wait found while registering `holder -> resource`.
///
/// Always retryable: the caller should roll back what it holds and may
/// resubmit the operation under its own backoff policy.
#[derive(Error, Debug, Clone)]
#[error(
    "Deadlock detected: lock on {resource:?} could not be granted to {holder:?} \
     (cycle {cycle}); the operation was aborted and may be retried"
)]
pub struct DeadlockError<R: Resource> {
    pub holder: R::Holder,
    pub resource: R,
    /// Resource whose owner closed the cycle.
    pub closing_resource: R,
    /// The already-visited holder the walk ran into.
    pub closing_holder: R::Holder,
    /// Each visited holder with the resource it waits on, starting at `holder`.
    pub chain: Vec<(R::Holder, R)>,
    /// Rendered chain, see [`cycle_description`](Self::cycle_description).
    pub cycle: String,
    pub retryable: bool,
}

impl<R: Resource> DeadlockError<R> {
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// `t2 -> r2 -> t1 -> r1 -> t2`
    pub fn cycle_description(&self) -> &str {
        &self.cycle
    }

    /// Holders that take part in the circular wait itself. When the walk ran
    /// into a pre-existing cycle this does not include `holder`.
    pub fn cycle_members(&self) -> Vec<R::Holder> {
        let start = self
            .chain
            .iter()
            .position(|(h, _)| *h == self.closing_holder)
            .unwrap_or(0);
        self.chain[start..].iter().map(|(h, _)| h.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct DeadlockStats {
    pub checks: AtomicU64,
    pub deadlocks_found: AtomicU64,
    pub waits_removed: AtomicU64,
}

impl DeadlockStats {
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn deadlocks_found(&self) -> u64 {
        self.deadlocks_found.load(Ordering::Relaxed)
    }

    pub fn waits_removed(&self) -> u64 {
        self.waits_removed.load(Ordering::Relaxed)
    }
}

/// Process-wide coordinator for the wait-for graph. Construct one per lock
/// manager and share it behind an `Arc`.
pub struct DeadlockDetector<R: Resource> {
    wait_table: Mutex<WaitTable<R>>,
    stats: DeadlockStats,
}

impl<R> DeadlockDetector<R>
where
    R: Resource + Clone,
{
    pub fn new() -> Self {
        Self {
            wait_table: Mutex::new(HashMap::new()),
            stats: DeadlockStats::default(),
        }
    }

    /// Record that `holder` is about to block on `resource`, replacing any
    /// earlier entry for the same holder.
    pub fn add_waiting(&self, holder: R::Holder, resource: R) {
        debug!(?holder, ?resource, "add waiting");
        self.wait_table.lock().insert(holder, resource);
    }

    /// Forget the wait edge of `holder`. No-op when there is none.
    pub fn remove_waiting(&self, holder: &R::Holder) {
        if self.wait_table.lock().remove(holder).is_some() {
            self.stats.waits_removed.fetch_add(1, Ordering::Relaxed);
            debug!(?holder, "remove waiting");
        }
    }

    /// Register `holder -> resource` and fail if that closes a cycle.
    ///
    /// The edge stays registered on failure; removing it is part of the
    /// caller's abort path.
    pub fn detect_deadlock(
        &self,
        holder: R::Holder,
        resource: R,
    ) -> Result<(), DeadlockError<R>> {
        let mut table = self.wait_table.lock();
        table.insert(holder.clone(), resource.clone());
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        match find_cycle(&table, holder, resource) {
            None => Ok(()),
            Some(err) => {
                drop(table);
                self.stats.deadlocks_found.fetch_add(1, Ordering::Relaxed);
                warn!(
                    holder = ?err.holder,
                    resource = ?err.resource,
                    cycle = %err.cycle,
                    "deadlock detected"
                );
                Err(err)
            }
        }
    }

    /// Like [`detect_deadlock`](Self::detect_deadlock), but hands back a guard
    /// that removes the wait edge when dropped.
    pub fn wait_for(
        &self,
        holder: R::Holder,
        resource: R,
    ) -> Result<WaitGuard<'_, R>, DeadlockError<R>> {
        self.detect_deadlock(holder.clone(), resource)?;
        Ok(WaitGuard {
            detector: self,
            holder,
        })
    }

    pub fn waiting_for(&self, holder: &R::Holder) -> Option<R> {
        self.wait_table.lock().get(holder).cloned()
    }

    pub fn is_waiting(&self, holder: &R::Holder) -> bool {
        self.wait_table.lock().contains_key(holder)
    }

    pub fn waiting_count(&self) -> usize {
        self.wait_table.lock().len()
    }

    /// Derived holder -> holder graph as seen at one instant.
    pub fn snapshot(&self) -> WaitForSnapshot<R::Holder> {
        let table = self.wait_table.lock();
        let mut snapshot = WaitForSnapshot::default();
        for (waiter, resource) in table.iter() {
            let from = snapshot.node(waiter.clone());
            if let Some(owner) = resource.current_holder() {
                let to = snapshot.node(owner);
                snapshot.graph.add_edge(from, to, ());
            }
        }
        snapshot
    }

    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }
}

impl<R> Default for DeadlockDetector<R>
where
    R: Resource + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for DeadlockDetector<R>
where
    R: Resource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("waiting", &self.wait_table.lock().len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Follow "waits for the owner of my resource" from `holder` until the chain
/// ends or revisits a holder. Out-degree is at most one, so a plain walk
/// finds every reachable cycle.
fn find_cycle<R>(table: &WaitTable<R>, holder: R::Holder, resource: R) -> Option<DeadlockError<R>>
where
    R: Resource + Clone,
{
    let mut visited = HashSet::new();
    visited.insert(holder.clone());
    let mut current = resource.current_holder();
    let mut chain = vec![(holder.clone(), resource.clone())];

    while let Some(owner) = current {
        if visited.contains(&owner) {
            let closing_resource = chain
                .last()
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| resource.clone());
            let cycle = describe_cycle::<R>(&chain, &owner);
            return Some(DeadlockError {
                holder,
                resource,
                closing_resource,
                closing_holder: owner,
                chain,
                cycle,
                retryable: true,
            });
        }
        visited.insert(owner.clone());
        let waiting_for = table.get(&owner)?;
        current = waiting_for.current_holder();
        chain.push((owner, waiting_for.clone()));
    }
    None
}

fn describe_cycle<R: Resource>(chain: &[(R::Holder, R)], closing_holder: &R::Holder) -> String {
    let mut desc = String::new();
    for (holder, resource) in chain {
        desc.push_str(&format!("{:?} -> {:?} -> ", holder, resource));
    }
    desc.push_str(&format!("{:?}", closing_holder));
    desc
}

/// Removes its holder's wait edge on drop.
pub struct WaitGuard<'a, R>
where
    R: Resource + Clone,
{
    detector: &'a DeadlockDetector<R>,
    holder: R::Holder,
}

impl<'a, R> WaitGuard<'a, R>
where
    R: Resource + Clone,
{
    pub fn holder(&self) -> &R::Holder {
        &self.holder
    }
}

impl<'a, R> Drop for WaitGuard<'a, R>
where
    R: Resource + Clone,
{
    fn drop(&mut self) {
        self.detector.remove_waiting(&self.holder);
    }
}

/// Copy of the derived wait-for graph.
#[derive(Debug, Clone)]
pub struct WaitForSnapshot<H: Holder> {
    graph: DiGraph<H, ()>,
    index: HashMap<H, NodeIndex>,
}

impl<H: Holder> Default for WaitForSnapshot<H> {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }
}

impl<H: Holder> WaitForSnapshot<H> {
    fn node(&mut self, holder: H) -> NodeIndex {
        if let Some(idx) = self.index.get(&holder) {
            return *idx;
        }
        let idx = self.graph.add_node(holder.clone());
        self.index.insert(holder, idx);
        idx
    }

    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Owner of the resource `holder` waits on, if it is held.
    pub fn waits_on(&self, holder: &H) -> Option<&H> {
        let idx = self.index.get(holder)?;
        self.graph
            .neighbors(*idx)
            .next()
            .map(|next| &self.graph[next])
    }

    pub fn graph(&self) -> &DiGraph<H, ()> {
        &self.graph
    }
}
