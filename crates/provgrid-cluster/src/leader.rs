//! Single-writer gate.
//!
//! Exactly one orchestrator replica holds the ownership token. Every
//! provisioning or scaling write runs under a [`WriteGuard`]; a standby
//! replica gets [`ClusterError::NotLeader`] and runs the same code path
//! read-only. Demotion waits for in-flight guarded writes to finish, so
//! no write started under a term lands after that term ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedRwLockReadGuard, RwLock, watch};
use tracing::info;

use crate::error::{ClusterError, ClusterResult};

/// Current role of this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader { term: u64 },
    Standby,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }
}

struct GateInner {
    replica_id: String,
    role: watch::Sender<Role>,
    /// Writers hold it shared; role changes take it exclusively.
    writes: Arc<RwLock<()>>,
    term: AtomicU64,
}

/// Proof that the holder may mutate shared state under `term`.
pub struct WriteGuard {
    _permit: OwnedRwLockReadGuard<()>,
    pub term: u64,
}

impl std::fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteGuard").field("term", &self.term).finish()
    }
}

/// Role flag plus write guard for leader-only execution.
#[derive(Clone)]
pub struct LeaderGate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for LeaderGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderGate")
            .field("replica_id", &self.inner.replica_id)
            .field("role", &self.role())
            .finish()
    }
}

impl LeaderGate {
    /// Create a gate, starting as leader (term 1) or standby.
    pub fn new(replica_id: impl Into<String>, leader: bool) -> Self {
        let term = u64::from(leader);
        let role = if leader {
            Role::Leader { term }
        } else {
            Role::Standby
        };
        let (tx, _rx) = watch::channel(role);
        Self {
            inner: Arc::new(GateInner {
                replica_id: replica_id.into(),
                role: tx,
                writes: Arc::new(RwLock::new(())),
                term: AtomicU64::new(term),
            }),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.inner.replica_id
    }

    pub fn role(&self) -> Role {
        *self.inner.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role().is_leader()
    }

    /// Watch role changes.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.inner.role.subscribe()
    }

    /// Take the ownership token. Returns the new term.
    ///
    /// Promoting a replica that already leads keeps the current term.
    pub async fn promote(&self) -> u64 {
        let _exclusive = self.inner.writes.write().await;
        if let Role::Leader { term } = self.role() {
            return term;
        }
        let term = self.inner.term.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.role.send_replace(Role::Leader { term });
        info!(replica = %self.inner.replica_id, term, "promoted to leader");
        term
    }

    /// Give up the token after in-flight writes complete.
    pub async fn demote(&self) {
        let _exclusive = self.inner.writes.write().await;
        if self.role().is_leader() {
            self.inner.role.send_replace(Role::Standby);
            info!(replica = %self.inner.replica_id, "demoted to standby");
        }
    }

    /// Acquire write permission, or fail on a standby replica.
    pub async fn write(&self) -> ClusterResult<WriteGuard> {
        let permit = Arc::clone(&self.inner.writes).read_owned().await;
        match self.role() {
            Role::Leader { term } => Ok(WriteGuard {
                _permit: permit,
                term,
            }),
            Role::Standby => Err(ClusterError::NotLeader {
                replica: self.inner.replica_id.clone(),
            }),
        }
    }
}
