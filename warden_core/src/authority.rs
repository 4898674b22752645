//! The External Authority Bridge.
//!
//! A separately-owned subsystem keeps its own protection table keyed by
//! domain object id and enforces it independently (e.g. refusing to start an
//! engagement). Warden mirrors every protection into it on a best-effort
//! basis: failures are logged and swallowed, and `resync_all` is the
//! correction mechanism.
//!
//! Differences between API generations of the authority live behind
//! [`AuthorityBridge`]; pick one implementation at construction time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use warden_env::{ActorId, DomainObjectId};

/// Authority call failures
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Authority unavailable")]
    Unavailable,

    #[error("Authority rejected call: {0}")]
    Rejected(String),

    #[error("Incompatible authority API: {0}")]
    Incompatible(String),
}

/// Calls made into the external authority.
pub trait AuthorityBridge: Send + Sync {
    /// Announce (or refresh) a protection.
    fn sync(&self, id: DomainObjectId, expire_at_ms: i64, owner: Option<ActorId>) -> Result<(), BridgeError>;

    /// Withdraw a protection.
    fn clear(&self, id: DomainObjectId) -> Result<(), BridgeError>;
}

/// Optional bridge with swallow-and-log semantics.
#[derive(Clone, Default)]
pub struct BridgeHandle {
    inner: Option<Arc<dyn AuthorityBridge>>,
}

impl BridgeHandle {
    pub fn new(bridge: Option<Arc<dyn AuthorityBridge>>) -> Self {
        Self { inner: bridge }
    }

    /// No authority present; enforcement stays local.
    pub fn absent() -> Self {
        Self { inner: None }
    }

    pub fn is_present(&self) -> bool {
        self.inner.is_some()
    }

    pub fn sync(&self, id: DomainObjectId, expire_at_ms: i64, owner: Option<ActorId>) {
        let Some(bridge) = &self.inner else { return };
        if let Err(e) = bridge.sync(id, expire_at_ms, owner) {
            debug!("Authority sync failed for {}: {}", id, e);
        }
    }

    pub fn clear(&self, id: DomainObjectId) {
        let Some(bridge) = &self.inner else { return };
        if let Err(e) = bridge.clear(id) {
            debug!("Authority clear failed for {}: {}", id, e);
        }
    }
}

// ============================================================================
// IN-PROCESS AUTHORITY
// ============================================================================

/// Entry in the authority's own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorityEntry {
    pub expire_at_ms: i64,
    pub owner: Option<ActorId>,
}

/// An authority living in the same process.
///
/// Enforces its own copy of the table with the same owner rules and can be
/// switched offline to exercise degraded mode.
#[derive(Default)]
pub struct AuthorityTable {
    table: parking_lot::Mutex<HashMap<DomainObjectId, AuthorityEntry>>,
    offline: AtomicBool,
    syncs: AtomicU64,
    clears: parking_lot::Mutex<Vec<DomainObjectId>>,
}

impl AuthorityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the authority going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn entry(&self, id: &DomainObjectId) -> Option<AuthorityEntry> {
        self.table.lock().get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the authority would refuse `actor` engaging `id` at `now_ms`.
    pub fn blocks(&self, id: &DomainObjectId, actor: ActorId, now_ms: i64) -> bool {
        match self.entry(id) {
            Some(e) if e.expire_at_ms >= now_ms => e.owner != Some(actor),
            _ => false,
        }
    }

    /// Successful sync calls so far.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Every id cleared so far, in call order.
    pub fn cleared(&self) -> Vec<DomainObjectId> {
        self.clears.lock().clone()
    }

    pub fn was_cleared(&self, id: &DomainObjectId) -> bool {
        self.clears.lock().contains(id)
    }
}

impl AuthorityBridge for AuthorityTable {
    fn sync(&self, id: DomainObjectId, expire_at_ms: i64, owner: Option<ActorId>) -> Result<(), BridgeError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(BridgeError::Unavailable);
        }
        self.table.lock().insert(id, AuthorityEntry { expire_at_ms, owner });
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear(&self, id: DomainObjectId) -> Result<(), BridgeError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(BridgeError::Unavailable);
        }
        self.table.lock().remove(&id);
        self.clears.lock().push(id);
        Ok(())
    }
}

/// Adapter for authority builds whose API predates owner-aware protection.
///
/// Owners are dropped, so the authority enforces a public protection.
pub struct OwnerlessAuthority<B: AuthorityBridge> {
    inner: B,
}

impl<B: AuthorityBridge> OwnerlessAuthority<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B: AuthorityBridge> AuthorityBridge for OwnerlessAuthority<B> {
    fn sync(&self, id: DomainObjectId, expire_at_ms: i64, _owner: Option<ActorId>) -> Result<(), BridgeError> {
        self.inner.sync(id, expire_at_ms, None)
    }

    fn clear(&self, id: DomainObjectId) -> Result<(), BridgeError> {
        self.inner.clear(id)
    }
}
