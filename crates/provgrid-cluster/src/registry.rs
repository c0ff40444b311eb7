//! Compute node registry: tracks known nodes and their capability snapshots.
//!
//! Readers get an `Arc<ClusterSnapshot>` that never changes underneath
//! them. Every mutation builds a fresh snapshot and swaps it in, so a
//! selector working from one snapshot sees a consistent node list.
//!
//! Nodes that stop reporting for longer than the dead timeout are reaped;
//! the orchestrator then fails the instances they hosted.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use provgrid_state::{NodeId, NodeSnapshot, epoch_millis};

use crate::error::ClusterResult;

/// Status of a node as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Ready,
    Draining,
    /// No report within the dead timeout; pending reaping.
    Dead,
}

/// Registry-side view of one node.
#[derive(Debug, Clone)]
pub struct Member {
    pub snapshot: NodeSnapshot,
    /// Last report, epoch milliseconds.
    pub last_seen: u64,
    /// Drained by an operator; survives capability refreshes.
    pub cordoned: bool,
    pub status: MemberStatus,
}

/// Immutable point-in-time view handed to the selector.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Bumped on every change.
    pub generation: u64,
    /// Nodes sorted by ID.
    pub nodes: Vec<NodeSnapshot>,
}

impl ClusterSnapshot {
    pub fn node(&self, id: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    snapshot: NodeSnapshot,
    last_seen: u64,
    cordoned: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: BTreeMap<NodeId, Entry>,
    published: Arc<ClusterSnapshot>,
}

impl RegistryInner {
    fn republish(&mut self) {
        let nodes = self
            .entries
            .values()
            .map(|e| {
                let mut node = e.snapshot.clone();
                node.draining |= e.cordoned;
                node
            })
            .collect();
        self.published = Arc::new(ClusterSnapshot {
            generation: self.published.generation + 1,
            nodes,
        });
    }
}

/// Shared registry of compute nodes.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    /// Dead node detection threshold.
    dead_timeout: Duration,
    /// Bumped whenever placement room grows.
    capacity: Arc<watch::Sender<u64>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            dead_timeout: Duration::from_secs(30),
            capacity: Arc::new(watch::channel(0).0),
        }
    }

    /// Set the dead node detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn dead_timeout(&self) -> Duration {
        self.dead_timeout
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes whenever a node joins, is undrained or reports more free
    /// slots than before.
    pub fn capacity_changes(&self) -> watch::Receiver<u64> {
        self.capacity.subscribe()
    }

    fn capacity_grew(&self) {
        self.capacity.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Record a node report, seen now. Returns `true` if the node is new.
    pub fn publish(&self, node: NodeSnapshot) -> bool {
        self.publish_at(node, epoch_millis())
    }

    /// Record a node report carrying its own observation time.
    ///
    /// A report with a non-finite load is dropped.
    pub fn publish_at(&self, node: NodeSnapshot, seen_at: u64) -> bool {
        if !node.load.is_finite() {
            warn!(node_id = %node.id, load = node.load, "node report with non-finite load ignored");
            return false;
        }
        let mut inner = self.write();
        let node_id = node.id.clone();
        let mut grew = false;
        let joined = match inner.entries.get_mut(&node_id) {
            Some(entry) => {
                grew = node.free_slots() > entry.snapshot.free_slots()
                    || (entry.snapshot.draining && !node.draining);
                entry.snapshot = node;
                entry.last_seen = entry.last_seen.max(seen_at);
                false
            }
            None => {
                inner.entries.insert(
                    node_id.clone(),
                    Entry {
                        snapshot: node,
                        last_seen: seen_at,
                        cordoned: false,
                    },
                );
                true
            }
        };
        inner.republish();
        drop(inner);

        if joined || grew {
            self.capacity_grew();
        }
        if joined {
            info!(%node_id, "compute node registered");
        } else {
            debug!(%node_id, "capability snapshot refreshed");
        }
        joined
    }

    /// Refresh last-seen without changing capabilities.
    pub fn heartbeat(&self, node_id: &str) -> bool {
        let mut inner = self.write();
        match inner.entries.get_mut(node_id) {
            Some(entry) => {
                entry.last_seen = epoch_millis();
                true
            }
            None => {
                warn!(%node_id, "heartbeat from unknown node");
                false
            }
        }
    }

    /// Stop placing new instances on a node.
    pub fn drain(&self, node_id: &str) -> bool {
        self.set_cordon(node_id, true)
    }

    /// Allow placements on a previously drained node again.
    pub fn undrain(&self, node_id: &str) -> bool {
        self.set_cordon(node_id, false)
    }

    fn set_cordon(&self, node_id: &str, cordoned: bool) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.entries.get_mut(node_id) else {
            return false;
        };
        let lifted = entry.cordoned && !cordoned;
        entry.cordoned = cordoned;
        inner.republish();
        drop(inner);
        if lifted {
            self.capacity_grew();
        }
        info!(%node_id, cordoned, "node drain state changed");
        true
    }

    /// Remove a node. Returns `true` if it was known.
    pub fn remove(&self, node_id: &str) -> bool {
        let mut inner = self.write();
        let existed = inner.entries.remove(node_id).is_some();
        if existed {
            inner.republish();
            info!(%node_id, "compute node removed");
        }
        existed
    }

    /// Claim `slots` on a node if it still has room and accepts placements.
    ///
    /// This is the commit point for a selection made from an older
    /// snapshot. The claim lasts until the next capability report for
    /// the node or a matching [`release_slots`](Self::release_slots).
    pub fn reserve_slots(&self, node_id: &str, slots: u32) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.entries.get_mut(node_id) else {
            return false;
        };
        if entry.cordoned || entry.snapshot.draining || entry.snapshot.free_slots() < slots {
            return false;
        }
        entry.snapshot.used_slots += slots;
        inner.republish();
        true
    }

    /// Return slots claimed with [`reserve_slots`](Self::reserve_slots).
    pub fn release_slots(&self, node_id: &str, slots: u32) {
        let mut inner = self.write();
        if let Some(entry) = inner.entries.get_mut(node_id) {
            entry.snapshot.used_slots = entry.snapshot.used_slots.saturating_sub(slots);
            inner.republish();
        }
    }

    /// The most recent snapshot. Never blocks on a refresh.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.read().published)
    }

    /// All nodes with their status, by ID.
    pub fn members(&self) -> Vec<Member> {
        self.members_at(epoch_millis())
    }

    fn members_at(&self, now: u64) -> Vec<Member> {
        let timeout = self.dead_timeout.as_millis() as u64;
        self.read()
            .entries
            .values()
            .map(|e| {
                let status = if now.saturating_sub(e.last_seen) > timeout {
                    MemberStatus::Dead
                } else if e.cordoned || e.snapshot.draining {
                    MemberStatus::Draining
                } else {
                    MemberStatus::Ready
                };
                Member {
                    snapshot: e.snapshot.clone(),
                    last_seen: e.last_seen,
                    cordoned: e.cordoned,
                    status,
                }
            })
            .collect()
    }

    /// Count of nodes that currently accept placements.
    pub fn ready_count(&self) -> usize {
        self.members()
            .iter()
            .filter(|m| m.status == MemberStatus::Ready)
            .count()
    }

    /// Detect and remove dead nodes.
    ///
    /// Returns the IDs of nodes that were removed.
    pub fn reap_dead(&self) -> Vec<NodeId> {
        self.reap_dead_at(epoch_millis())
    }

    /// [`reap_dead`](Self::reap_dead) against an explicit clock.
    pub fn reap_dead_at(&self, now: u64) -> Vec<NodeId> {
        let timeout = self.dead_timeout.as_millis() as u64;
        let mut inner = self.write();
        let dead: Vec<NodeId> = inner
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        if !dead.is_empty() {
            for node_id in &dead {
                inner.entries.remove(node_id);
                warn!(%node_id, "reaped dead node");
            }
            inner.republish();
        }
        dead
    }
}

/// Future returned by a [`CapabilityFeed`] poll.
pub type FeedFuture = Pin<Box<dyn Future<Output = ClusterResult<Vec<NodeSnapshot>>> + Send>>;

/// External source of node capability snapshots.
pub trait CapabilityFeed: Send + Sync {
    fn poll(&self) -> FeedFuture;
}

/// Poll `feed` every `interval` and publish what it returns.
///
/// A failed poll is logged and the registry keeps its previous snapshot.
pub async fn run_refresh(
    registry: NodeRegistry,
    feed: Arc<dyn CapabilityFeed>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match feed.poll().await {
                    Ok(nodes) => {
                        let count = nodes.len();
                        for node in nodes {
                            registry.publish(node);
                        }
                        debug!(count, "capability feed refreshed");
                    }
                    Err(e) => warn!(error = %e, "capability feed poll failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("capability refresh loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;

    fn node(id: &str, total: u32, used: u32) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            capabilities: Default::default(),
            load: 0.2,
            total_slots: total,
            used_slots: used,
            draining: false,
        }
    }

    #[test]
    fn publish_registers_and_refreshes() {
        let reg = NodeRegistry::new();
        assert!(reg.publish(node("n1", 4, 0)));
        assert!(!reg.publish(node("n1", 4, 2)));

        let snap = reg.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.node("n1").map(|n| n.used_slots), Some(2));
    }

    #[test]
    fn snapshot_is_not_mutated_in_place() {
        let reg = NodeRegistry::new();
        reg.publish(node("n1", 4, 0));
        let before = reg.snapshot();

        reg.publish(node("n2", 4, 0));
        let after = reg.snapshot();

        assert_eq!(before.nodes.len(), 1);
        assert_eq!(after.nodes.len(), 2);
        assert!(after.generation > before.generation);
    }

    #[test]
    fn nodes_sorted_by_id() {
        let reg = NodeRegistry::new();
        reg.publish(node("n3", 4, 0));
        reg.publish(node("n1", 4, 0));
        reg.publish(node("n2", 4, 0));

        let ids: Vec<String> = reg.snapshot().nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["n1", "n2", "n3"]);
    }

    #[test]
    fn drain_survives_refresh() {
        let reg = NodeRegistry::new();
        reg.publish(node("n1", 4, 0));
        assert!(reg.drain("n1"));
        reg.publish(node("n1", 4, 0));

        assert!(reg.snapshot().node("n1").is_some_and(|n| n.draining));
        assert_eq!(reg.members()[0].status, MemberStatus::Draining);

        assert!(reg.undrain("n1"));
        assert!(reg.snapshot().node("n1").is_some_and(|n| !n.draining));
        assert!(!reg.drain("unknown"));
    }

    #[test]
    fn reserve_respects_free_slots() {
        let reg = NodeRegistry::new();
        reg.publish(node("n1", 2, 1));

        assert!(reg.reserve_slots("n1", 1));
        assert!(!reg.reserve_slots("n1", 1));
        assert_eq!(reg.snapshot().node("n1").map(|n| n.free_slots()), Some(0));

        reg.release_slots("n1", 1);
        assert!(reg.reserve_slots("n1", 1));
        assert!(!reg.reserve_slots("missing", 1));
    }

    #[test]
    fn reserve_refused_on_drained_node() {
        let reg = NodeRegistry::new();
        reg.publish(node("n1", 4, 0));
        reg.drain("n1");
        assert!(!reg.reserve_slots("n1", 1));
    }

    #[test]
    fn dead_node_detection() {
        let reg = NodeRegistry::new().with_dead_timeout(Duration::from_secs(30));
        reg.publish_at(node("old", 4, 0), 1_000);
        reg.publish(node("fresh", 4, 0));

        let members = reg.members();
        let old = members.iter().find(|m| m.snapshot.id == "old").unwrap();
        assert_eq!(old.status, MemberStatus::Dead);
        assert_eq!(reg.ready_count(), 1);
    }

    #[test]
    fn reap_dead_nodes() {
        let reg = NodeRegistry::new().with_dead_timeout(Duration::from_secs(5));
        reg.publish_at(node("n1", 4, 0), 10_000);
        reg.publish_at(node("n2", 4, 0), 14_000);

        assert!(reg.reap_dead_at(14_000).is_empty());
        assert_eq!(reg.reap_dead_at(16_000), vec!["n1".to_string()]);
        assert_eq!(reg.snapshot().nodes.len(), 1);
        assert!(!reg.remove("n1"));
        assert!(reg.remove("n2"));
    }

    #[test]
    fn non_finite_load_is_rejected() {
        let reg = NodeRegistry::new();
        let mut bad = node("n1", 4, 0);
        bad.load = f64::NAN;
        assert!(!reg.publish(bad.clone()));
        bad.load = f64::INFINITY;
        assert!(!reg.publish(bad));
        assert!(reg.snapshot().nodes.is_empty());

        reg.publish(node("n1", 4, 0));
        let mut refresh = node("n1", 4, 3);
        refresh.load = f64::NAN;
        reg.publish(refresh);
        assert_eq!(reg.snapshot().node("n1").map(|n| n.used_slots), Some(0));
    }

    #[test]
    fn capacity_changes_follow_growth_only() {
        let reg = NodeRegistry::new();
        let mut rx = reg.capacity_changes();

        reg.publish(node("n1", 4, 2));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Less room is not a capacity change.
        reg.publish(node("n1", 4, 3));
        assert!(!rx.has_changed().unwrap());

        reg.publish(node("n1", 4, 1));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        reg.drain("n1");
        assert!(!rx.has_changed().unwrap());
        reg.undrain("n1");
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Slot bookkeeping is not a report of new room.
        assert!(reg.reserve_slots("n1", 1));
        reg.release_slots("n1", 1);
        assert!(!rx.has_changed().unwrap());
    }

    struct FixedFeed(Vec<NodeSnapshot>);

    impl CapabilityFeed for FixedFeed {
        fn poll(&self) -> FeedFuture {
            let nodes = self.0.clone();
            Box::pin(async move { Ok(nodes) })
        }
    }

    struct BrokenFeed;

    impl CapabilityFeed for BrokenFeed {
        fn poll(&self) -> FeedFuture {
            Box::pin(async { Err(ClusterError::Feed("unreachable".to_string())) })
        }
    }

    #[tokio::test]
    async fn refresh_loop_publishes_feed() {
        let reg = NodeRegistry::new();
        let (tx, rx) = watch::channel(false);
        let feed = Arc::new(FixedFeed(vec![node("n1", 4, 0), node("n2", 8, 0)]));

        let handle = tokio::spawn(run_refresh(reg.clone(), feed, Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(reg.snapshot().nodes.len(), 2);
    }

    #[tokio::test]
    async fn refresh_loop_survives_feed_errors() {
        let reg = NodeRegistry::new();
        reg.publish(node("n1", 4, 0));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_refresh(
            reg.clone(),
            Arc::new(BrokenFeed),
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(reg.snapshot().nodes.len(), 1);
    }
}
