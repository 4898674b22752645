//! The Tracking Cache.
//!
//! Two in-memory indices answer "is this entity protected, and for whom?":
//!
//! - `entities`: live entity handle -> protection record
//! - `domains`: stable domain object id -> expiry and owner
//! - `links`: domain object id -> the one entity currently carrying it
//!
//! A domain object is protected through at most one entity record. Tracking
//! it on a new entity (say, after the old one unloaded and came back under a
//! new handle) retires the previous record, and only the linked entity may
//! clear the domain's store row and authority entry.
//!
//! Every mutation fans out to the authority bridge, the durable store and
//! the entity's own mark, so a restart (or a lost process) can be rebuilt by
//! [`ProtectionCache::resync_all`](crate::reconcile).
//!
//! Expiry is strict: a record whose `expire_at_ms` is before `now` is never
//! used for a decision. Expired records are evicted lazily on read and by
//! [`ProtectionCache::sweep`], with at most one eviction per record.

use crate::authority::BridgeHandle;
use crate::config::{deadline_ms, ProtectionConfig};
use crate::host::{Actor, ActorNotifier, EntityHost, ProtectionMark};
use crate::store::{DurableStore, PersistedProtection, StoreError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};
use warden_env::{ActorId, DomainObjectId, EntityId, WardenContext};

// ============================================================================
// RECORDS
// ============================================================================

/// Protection of a live entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionRecord {
    pub entity_id: EntityId,

    /// Stable identity, if known at track time
    pub domain_object_id: Option<DomainObjectId>,

    /// Absolute expiry (epoch ms)
    pub expire_at_ms: i64,

    /// `None` means public protection (nobody may interact)
    pub owner: Option<ActorId>,
}

impl ProtectionRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at_ms < now_ms
    }
}

/// Protection of a domain object, independent of any live entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainProtection {
    pub expire_at_ms: i64,
    pub owner: Option<ActorId>,
}

impl DomainProtection {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at_ms < now_ms
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub denied: bool,
}

impl Decision {
    pub const ALLOW: Decision = Decision { denied: false };
    pub const DENY: Decision = Decision { denied: true };
}

/// A protection removed because it ran out.
///
/// Emitted exactly once per record, by whichever eviction path won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredProtection {
    pub entity_id: Option<EntityId>,
    pub domain_object_id: Option<DomainObjectId>,
    pub owner: Option<ActorId>,
    pub expire_at_ms: i64,
}

// ============================================================================
// CACHE
// ============================================================================

/// Protection state keyed both by entity handle and domain object id.
pub struct ProtectionCache<Ctx: WardenContext> {
    pub(crate) ctx: Arc<Ctx>,
    pub(crate) config: RwLock<ProtectionConfig>,
    pub(crate) entities: DashMap<EntityId, ProtectionRecord>,
    pub(crate) domains: DashMap<DomainObjectId, DomainProtection>,
    pub(crate) links: DashMap<DomainObjectId, EntityId>,
    pub(crate) store: Arc<DurableStore>,
    pub(crate) bridge: BridgeHandle,
    pub(crate) host: Arc<dyn EntityHost>,

    /// Last denial message sent to each actor (epoch ms)
    message_sent: DashMap<ActorId, i64>,
}

impl<Ctx: WardenContext> ProtectionCache<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        config: ProtectionConfig,
        store: Arc<DurableStore>,
        bridge: BridgeHandle,
        host: Arc<dyn EntityHost>,
    ) -> Self {
        Self {
            ctx,
            config: RwLock::new(config),
            entities: DashMap::new(),
            domains: DashMap::new(),
            links: DashMap::new(),
            store,
            bridge,
            host,
            message_sent: DashMap::new(),
        }
    }

    pub fn config(&self) -> ProtectionConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Existing records keep their expiry.
    pub fn set_config(&self, config: ProtectionConfig) {
        *self.config.write() = config;
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn now_ms(&self) -> i64 {
        self.ctx.epoch_millis()
    }

    /// Protect an entity, a domain object, or both.
    ///
    /// Does nothing if neither id is given. Re-tracking replaces the previous
    /// record and restarts its expiry.
    pub fn track(
        &self,
        entity: Option<EntityId>,
        owner: Option<ActorId>,
        duration_secs: i64,
        domain: Option<DomainObjectId>,
    ) {
        if entity.is_none() && domain.is_none() {
            return;
        }

        let expire_at_ms = deadline_ms(self.now_ms(), duration_secs);

        if let Some(did) = domain {
            self.domains.insert(did, DomainProtection { expire_at_ms, owner });
            self.bridge.sync(did, expire_at_ms, owner);
            self.store.upsert(did, PersistedProtection { expire_at_ms, owner });
        }

        let Some(eid) = entity else { return };

        // An entity re-tracked without a domain keeps its previous link
        let previous = self.entities.get(&eid).and_then(|r| r.domain_object_id);
        let domain_link = domain.or(previous);
        if let Some(old) = previous.filter(|old| Some(*old) != domain_link) {
            self.links.remove_if(&old, |_, e| *e == eid);
        }
        if let Some(did) = domain_link {
            self.bind(did, eid);
        }
        self.entities.insert(
            eid,
            ProtectionRecord {
                entity_id: eid,
                domain_object_id: domain_link,
                expire_at_ms,
                owner,
            },
        );

        if self.host.is_live(eid) {
            self.host.write_mark(eid, ProtectionMark::new(owner, expire_at_ms, domain_link));
            self.host.set_engagement_lock(eid, owner.is_none());
        }

        debug!(
            "Tracked {} (domain {:?}, owner {:?}) until {}",
            eid, domain_link, owner, expire_at_ms
        );
    }

    /// True if the entity currently has an unexpired protection.
    ///
    /// Falls back to the entity's mark when the index has no record, which
    /// covers entities that were loaded before the last restart.
    pub fn is_tracked(&self, entity: EntityId) -> bool {
        self.lookup(entity, self.now_ms()).is_some()
    }

    /// The unexpired record of an entity, if any.
    pub fn protection_of(&self, entity: EntityId) -> Option<ProtectionRecord> {
        self.lookup(entity, self.now_ms())
    }

    /// Domain index entry, expired or not.
    pub fn domain_protection(&self, id: &DomainObjectId) -> Option<DomainProtection> {
        self.domains.get(id).map(|d| *d)
    }

    /// Is `actor` refused interaction with `entity`?
    pub fn decide(&self, entity: EntityId, actor: &Actor) -> Decision {
        if !self.config.read().enabled {
            return Decision::ALLOW;
        }
        if actor.capabilities.bypasses_protection() {
            return Decision::ALLOW;
        }
        match self.lookup(entity, self.now_ms()) {
            None => Decision::ALLOW,
            Some(rec) if rec.owner == Some(actor.id) => Decision::ALLOW,
            Some(_) => Decision::DENY,
        }
    }

    /// Remove every trace of an entity's protection. Idempotent.
    pub fn untrack(&self, entity: EntityId) {
        let removed = self.entities.remove(&entity).map(|(_, r)| r);
        let mark = self.host.read_mark(entity);
        if removed.is_none() && mark.is_none() {
            return;
        }

        let domain = removed
            .and_then(|r| r.domain_object_id)
            .or_else(|| mark.as_ref().and_then(|m| parse_domain(m)));
        if let Some(did) = domain.filter(|d| self.release(*d, entity)) {
            self.domains.remove(&did);
            self.bridge.clear(did);
            self.store.remove(&did);
        }

        self.host.set_engagement_lock(entity, false);
        self.host.clear_mark(entity);
        debug!("Untracked {}", entity);
    }

    /// Evict everything that expired before `now_ms`.
    ///
    /// The returned events are the caller's to act on (highlight off,
    /// broadcast); records evicted concurrently by a lazy read are not
    /// reported twice.
    pub fn sweep(&self, now_ms: i64) -> Vec<ExpiredProtection> {
        let mut expired = Vec::new();

        // Collect first: removing while iterating would deadlock the shard
        let stale: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|r| r.is_expired(now_ms))
            .map(|r| *r.key())
            .collect();
        for eid in stale {
            if let Some(event) = self.expire_entity(eid, now_ms) {
                expired.push(event);
            }
        }

        let stale: Vec<DomainObjectId> = self
            .domains
            .iter()
            .filter(|d| d.is_expired(now_ms))
            .map(|d| *d.key())
            .collect();
        for did in stale {
            if let Some((_, d)) = self.domains.remove_if(&did, |_, d| d.is_expired(now_ms)) {
                self.links.remove(&did);
                self.bridge.clear(did);
                self.store.remove(&did);
                expired.push(ExpiredProtection {
                    entity_id: None,
                    domain_object_id: Some(did),
                    owner: d.owner,
                    expire_at_ms: d.expire_at_ms,
                });
            }
        }

        if !expired.is_empty() {
            debug!("Sweep evicted {} protections", expired.len());
        }
        expired
    }

    /// Send `message` unless this actor was notified within the cooldown.
    ///
    /// Returns true if the message went out.
    pub fn notify_once(&self, actor: ActorId, message: &str, notifier: &dyn ActorNotifier) -> bool {
        let now = self.now_ms();
        let cooldown = self.config.read().message_cooldown_ms;
        {
            let mut last = self.message_sent.entry(actor).or_insert(i64::MIN);
            if now.saturating_sub(*last) < cooldown {
                return false;
            }
            *last = now;
        }
        notifier.notify(actor, message);
        true
    }

    /// Write pending store mutations now.
    pub fn flush(&self) -> Result<bool, StoreError> {
        self.store.flush()
    }

    /// Entities currently indexed, expired or not.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Domain objects currently indexed, expired or not.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    fn lookup(&self, entity: EntityId, now_ms: i64) -> Option<ProtectionRecord> {
        let cached = self.entities.get(&entity).map(|r| *r);
        match cached {
            Some(rec) if rec.is_expired(now_ms) => {
                self.expire_entity(entity, now_ms);
                None
            }
            Some(rec) => Some(rec),
            None => self.lookup_mark(entity, now_ms),
        }
    }

    /// Rebuild an index entry from the entity's own mark.
    fn lookup_mark(&self, entity: EntityId, now_ms: i64) -> Option<ProtectionRecord> {
        let mark = self.host.read_mark(entity)?;
        if !mark.is_tracked() {
            return None;
        }
        if mark.expire < now_ms {
            self.untrack(entity);
            return None;
        }

        let domain = parse_domain(&mark);
        if let Some(did) = domain {
            // Another entity took this domain object over while we were away
            if *self.links.entry(did).or_insert(entity) != entity {
                self.retire(entity);
                return None;
            }
        }

        let rec = ProtectionRecord {
            entity_id: entity,
            domain_object_id: domain,
            expire_at_ms: mark.expire,
            owner: parse_owner(&mark),
        };
        self.entities.insert(entity, rec);
        Some(rec)
    }

    /// Make `entity` the sole carrier of `did`, retiring any previous one.
    pub(crate) fn bind(&self, did: DomainObjectId, entity: EntityId) {
        let Some(prev) = self.links.insert(did, entity).filter(|p| *p != entity) else {
            return;
        };
        self.entities.remove_if(&prev, |_, r| r.domain_object_id == Some(did));
        if self.host.read_mark(prev).as_ref().and_then(parse_domain) == Some(did) {
            self.retire(prev);
        }
        debug!("Domain {} moved from {} to {}", did, prev, entity);
    }

    /// Drop `entity`'s link to `did`. True if `entity` was the domain's
    /// carrier (or nothing was), so the domain is the caller's to clear.
    fn release(&self, did: DomainObjectId, entity: EntityId) -> bool {
        self.links.remove_if(&did, |_, e| *e == entity).is_some() || !self.links.contains_key(&did)
    }

    /// Strip the host-side protection of an entity that no longer has a record.
    pub(crate) fn retire(&self, entity: EntityId) {
        self.host.set_engagement_lock(entity, false);
        self.host.set_highlight(entity, false);
        self.host.clear_mark(entity);
    }

    /// Exactly-once eviction of an expired entity record.
    fn expire_entity(&self, entity: EntityId, now_ms: i64) -> Option<ExpiredProtection> {
        let (_, rec) = self.entities.remove_if(&entity, |_, r| r.is_expired(now_ms))?;

        if let Some(did) = rec.domain_object_id.filter(|d| self.release(*d, entity)) {
            // A newer protection of the same domain object survives
            if self.domains.remove_if(&did, |_, d| d.is_expired(now_ms)).is_some() {
                self.bridge.clear(did);
                self.store.remove(&did);
            }
        }

        self.host.set_engagement_lock(entity, false);
        self.host.clear_mark(entity);

        Some(ExpiredProtection {
            entity_id: Some(entity),
            domain_object_id: rec.domain_object_id,
            owner: rec.owner,
            expire_at_ms: rec.expire_at_ms,
        })
    }
}

/// Owner id stored in a mark. Malformed ids read as public protection.
pub(crate) fn parse_owner(mark: &ProtectionMark) -> Option<ActorId> {
    let raw = mark.owner.as_deref()?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("Ignoring malformed owner id in mark: {:?}", raw);
            None
        }
    }
}

pub(crate) fn parse_domain(mark: &ProtectionMark) -> Option<DomainObjectId> {
    let raw = mark.domain_object_id.as_deref()?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("Ignoring malformed domain object id in mark: {:?}", raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityBridge, AuthorityTable};
    use crate::config::MAX_DURATION_SECONDS;
    use crate::host::{Capabilities, WorldPos};
    use crate::test_support::{ManualClock, MemoryHost, RecordingNotifier};

    struct Fixture {
        clock: Arc<ManualClock>,
        host: Arc<MemoryHost>,
        authority: Arc<AuthorityTable>,
        cache: ProtectionCache<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let host = MemoryHost::shared();
        let authority = AuthorityTable::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));
        let cache = ProtectionCache::new(
            clock.clone(),
            ProtectionConfig::default(),
            store,
            BridgeHandle::new(Some(authority.clone() as Arc<dyn AuthorityBridge>)),
            host.clone(),
        );
        Fixture {
            clock,
            host,
            authority,
            cache,
            _dir: dir,
        }
    }

    fn spawn(f: &Fixture, seed: u64) -> (EntityId, DomainObjectId) {
        let e = EntityId::from_seed(seed);
        let d = DomainObjectId::from_seed(seed);
        f.host.spawn_entity(e, Some(d), WorldPos::new("world", 0.0, 64.0, 0.0));
        (e, d)
    }

    #[test]
    fn test_owner_exclusivity() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let p1 = Actor::new(ActorId::from_seed(1));
        let p2 = Actor::new(ActorId::from_seed(2));

        f.cache.track(Some(e1), Some(p1.id), 600, Some(d1));

        assert!(f.cache.decide(e1, &p2).denied);
        assert!(!f.cache.decide(e1, &p1).denied);
        assert_eq!(f.cache.store().get(&d1).unwrap().owner, Some(p1.id));
        assert_eq!(f.authority.entry(&d1).unwrap().owner, Some(p1.id));
        assert!(!f.host.entity(e1).unwrap().locked);
    }

    #[test]
    fn test_public_protection_denies_everyone_and_locks() {
        let f = fixture();
        let (e1, _) = spawn(&f, 1);
        f.cache.track(Some(e1), None, 600, None);

        assert!(f.cache.decide(e1, &Actor::new(ActorId::from_seed(1))).denied);
        assert!(f.host.entity(e1).unwrap().locked);
    }

    #[test]
    fn test_bypass_and_disabled_allow() {
        let f = fixture();
        let (e1, _) = spawn(&f, 1);
        f.cache.track(Some(e1), Some(ActorId::from_seed(1)), 600, None);

        let admin = Actor::new(ActorId::from_seed(2)).with_capabilities(Capabilities {
            admin: true,
            ..Default::default()
        });
        assert!(!f.cache.decide(e1, &admin).denied);

        let mut cfg = f.cache.config();
        cfg.enabled = false;
        f.cache.set_config(cfg);
        assert!(!f.cache.decide(e1, &Actor::new(ActorId::from_seed(2))).denied);
    }

    #[test]
    fn test_untracked_entity_is_allowed() {
        let f = fixture();
        let (e1, _) = spawn(&f, 1);
        assert!(!f.cache.decide(e1, &Actor::new(ActorId::from_seed(9))).denied);
        assert!(!f.cache.is_tracked(e1));
    }

    #[test]
    fn test_track_without_ids_is_noop() {
        let f = fixture();
        f.cache.track(None, Some(ActorId::from_seed(1)), 600, None);
        assert_eq!(f.cache.entity_count(), 0);
        assert_eq!(f.cache.domain_count(), 0);
        assert!(f.cache.store().is_empty());
    }

    #[test]
    fn test_expiry_is_strict_and_lazy() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        f.cache.track(Some(e1), Some(ActorId::from_seed(1)), 600, Some(d1));

        // Exactly at expiry the record still holds
        f.clock.advance(600_000);
        assert!(f.cache.is_tracked(e1));

        f.clock.advance(1);
        assert!(!f.cache.is_tracked(e1));
        assert!(!f.cache.decide(e1, &Actor::new(ActorId::from_seed(2))).denied);
        assert!(f.authority.was_cleared(&d1));
        assert!(!f.cache.store().contains(&d1));
        assert!(f.host.entity(e1).unwrap().mark.is_none());
    }

    #[test]
    fn test_sweep_reports_each_expiry_once() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        f.cache.track(Some(e1), None, 10, Some(d1));
        f.cache.track(None, None, 10, Some(DomainObjectId::from_seed(2)));

        f.clock.advance(11_000);
        let now = f.cache.now_ms();
        let first = f.cache.sweep(now);
        let second = f.cache.sweep(now);

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(f.cache.entity_count(), 0);
        assert_eq!(f.cache.domain_count(), 0);
        assert!(!f.host.entity(e1).unwrap().locked);
    }

    #[test]
    fn test_lazy_eviction_preempts_sweep() {
        let f = fixture();
        let (e1, _) = spawn(&f, 1);
        f.cache.track(Some(e1), None, 10, None);

        f.clock.advance(11_000);
        assert!(!f.cache.is_tracked(e1));
        assert!(f.cache.sweep(f.cache.now_ms()).is_empty());
    }

    #[test]
    fn test_untrack_is_idempotent() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        f.cache.track(Some(e1), None, 600, Some(d1));

        f.cache.untrack(e1);
        f.cache.untrack(e1);

        assert!(!f.cache.is_tracked(e1));
        assert_eq!(f.authority.cleared(), vec![d1]);
        assert!(!f.host.entity(e1).unwrap().locked);
    }

    #[test]
    fn test_retrack_replaces_owner_and_expiry() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let p1 = ActorId::from_seed(1);
        let p2 = ActorId::from_seed(2);
        f.cache.track(Some(e1), Some(p1), 10, Some(d1));
        f.clock.advance(5_000);
        f.cache.track(Some(e1), Some(p2), 10, None);

        let rec = f.cache.protection_of(e1).unwrap();
        assert_eq!(rec.owner, Some(p2));
        assert_eq!(rec.domain_object_id, Some(d1));
        assert_eq!(rec.expire_at_ms, f.cache.now_ms() + 10_000);
    }

    #[test]
    fn test_domain_moves_to_newest_entity() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let e2 = EntityId::from_seed(2);
        f.host.spawn_entity(e2, Some(d1), WorldPos::new("world", 3.0, 64.0, 0.0));
        let p1 = ActorId::from_seed(7);
        let p2 = ActorId::from_seed(8);

        f.cache.track(Some(e1), Some(p1), 600, Some(d1));
        f.cache.track(Some(e2), Some(p2), 600, Some(d1));

        assert_eq!(f.cache.entity_count(), 1);
        assert!(!f.cache.is_tracked(e1));
        assert!(f.host.entity(e1).unwrap().mark.is_none());

        // The retired entity no longer speaks for the domain object
        f.cache.untrack(e1);
        assert!(f.cache.is_tracked(e2));
        assert_eq!(f.authority.entry(&d1).unwrap().owner, Some(p2));
        assert_eq!(f.cache.store().get(&d1).unwrap().owner, Some(p2));
    }

    #[test]
    fn test_stale_mark_does_not_reclaim_domain() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let e2 = EntityId::from_seed(2);
        f.host.spawn_entity(e2, Some(d1), WorldPos::new("world", 3.0, 64.0, 0.0));
        let p1 = ActorId::from_seed(7);
        let p2 = ActorId::from_seed(8);
        f.cache.track(Some(e2), Some(p2), 600, Some(d1));

        // e1 was unloaded when the domain moved, so its mark survived
        let stale = ProtectionMark::new(Some(p1), f.cache.now_ms() + 60_000, Some(d1));
        f.host.write_mark(e1, stale.clone());
        assert!(!f.cache.is_tracked(e1));
        assert!(f.host.entity(e1).unwrap().mark.is_none());

        f.host.write_mark(e1, stale);
        f.cache.untrack(e1);
        assert!(f.cache.is_tracked(e2));
        assert!(f.cache.store().contains(&d1));
        assert!(f.authority.entry(&d1).is_some());
    }

    #[test]
    fn test_expiry_of_retired_entity_keeps_domain() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let e2 = EntityId::from_seed(2);
        f.host.spawn_entity(e2, Some(d1), WorldPos::new("world", 3.0, 64.0, 0.0));
        f.cache.track(Some(e1), None, 10, Some(d1));
        f.cache.track(Some(e2), None, 600, Some(d1));

        f.clock.advance(11_000);
        assert!(f.cache.sweep(f.cache.now_ms()).is_empty());
        assert!(f.cache.is_tracked(e2));
        assert!(f.cache.store().contains(&d1));
        assert!(!f.authority.was_cleared(&d1));
    }

    #[test]
    fn test_huge_duration_saturates() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let start = f.cache.now_ms();

        f.cache.track(Some(e1), None, i64::MAX / 100, Some(d1));

        let rec = f.cache.protection_of(e1).unwrap();
        assert_eq!(rec.expire_at_ms, start + MAX_DURATION_SECONDS * 1000);
        f.clock.advance(86_400_000);
        assert!(f.cache.is_tracked(e1));
    }

    #[test]
    fn test_mark_fallback_after_index_loss() {
        let f = fixture();
        let (e1, d1) = spawn(&f, 1);
        let owner = ActorId::from_seed(1);
        f.host
            .write_mark(e1, ProtectionMark::new(Some(owner), f.cache.now_ms() + 60_000, Some(d1)));

        let rec = f.cache.protection_of(e1).unwrap();
        assert_eq!(rec.owner, Some(owner));
        assert_eq!(rec.domain_object_id, Some(d1));
        assert_eq!(f.cache.entity_count(), 1);
    }

    #[test]
    fn test_malformed_mark_owner_reads_as_public() {
        let f = fixture();
        let (e1, _) = spawn(&f, 1);
        let mut mark = ProtectionMark::new(None, f.cache.now_ms() + 60_000, None);
        mark.owner = Some("not-a-uuid".to_string());
        f.host.write_mark(e1, mark);

        assert!(f.cache.decide(e1, &Actor::new(ActorId::from_seed(1))).denied);
    }

    #[test]
    fn test_notify_once_respects_cooldown() {
        let f = fixture();
        let notifier = RecordingNotifier::shared();
        let actor = ActorId::from_seed(1);

        assert!(f.cache.notify_once(actor, "denied", notifier.as_ref()));
        f.clock.advance(500);
        assert!(!f.cache.notify_once(actor, "denied", notifier.as_ref()));
        f.clock.advance(800);
        assert!(f.cache.notify_once(actor, "denied", notifier.as_ref()));
        assert_eq!(notifier.direct_count(), 2);
    }

    #[test]
    fn test_concurrent_sweeps_evict_once() {
        let f = Arc::new(fixture());
        for seed in 0..64 {
            let (e, _) = spawn(&f, seed);
            f.cache.track(Some(e), None, 1, None);
        }
        f.clock.advance(2_000);
        let now = f.cache.now_ms();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || f.cache.sweep(now).len())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, 64);
    }
}
