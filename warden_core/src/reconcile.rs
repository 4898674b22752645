//! The Reconciler.
//!
//! Rebuilds the in-memory indices after a restart or reload from the two
//! sources that outlive the process: the durable store and the marks on live
//! entities. The authority is re-synced along the way, so a bridge call that
//! failed earlier is corrected here.

use crate::host::ProtectionMark;
use crate::store::PersistedProtection;
use crate::tracking::{parse_domain, parse_owner, DomainProtection, ProtectionCache, ProtectionRecord};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};
use warden_env::{DomainObjectId, EntityId, WardenContext};

/// What a resync pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Store records loaded back into the domain index
    pub restored_domains: usize,

    /// Store records deleted because they had expired
    pub purged_domains: usize,

    /// Live entities re-indexed from their marks
    pub restored_entities: usize,

    /// Live entities whose mark had expired, or whose domain object is
    /// carried by a newer entity
    pub purged_entities: usize,
}

impl<Ctx: WardenContext> ProtectionCache<Ctx> {
    /// Rebuild both indices from the store and live entity marks.
    ///
    /// Idempotent: a second pass over the same state changes nothing but
    /// re-sends the same authority syncs.
    pub fn resync_all(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        if !self.config.read().enabled {
            debug!("Protection disabled, skipping resync");
            return report;
        }

        let now = self.now_ms();
        let seen = self.resync_store(now, &mut report);
        self.resync_marks(now, &seen, &mut report);

        info!(
            "🔄 Resync: {} domains restored, {} purged; {} entities restored, {} purged",
            report.restored_domains, report.purged_domains, report.restored_entities, report.purged_entities
        );
        report
    }

    fn resync_store(&self, now: i64, report: &mut ResyncReport) -> HashSet<DomainObjectId> {
        let mut seen = HashSet::new();
        for (did, rec) in self.store.records() {
            // The store pass treats a record at its exact expiry as gone
            if rec.expire_at_ms <= now {
                self.store.remove(&did);
                self.domains.remove(&did);
                report.purged_domains += 1;
                continue;
            }
            self.domains.insert(
                did,
                DomainProtection {
                    expire_at_ms: rec.expire_at_ms,
                    owner: rec.owner,
                },
            );
            self.bridge.sync(did, rec.expire_at_ms, rec.owner);
            seen.insert(did);
            report.restored_domains += 1;
        }
        seen
    }

    fn resync_marks(&self, now: i64, seen: &HashSet<DomainObjectId>, report: &mut ResyncReport) {
        // Newest first, so a domain object carried by two marks keeps the later one
        let mut marked = self.host.marked_entities();
        marked.sort_by_key(|(_, m)| std::cmp::Reverse(m.expire));
        for (eid, mark) in marked {
            if !mark.is_tracked() {
                continue;
            }
            // Same boundary as the store pass
            if mark.expire <= now {
                self.untrack(eid);
                report.purged_entities += 1;
                continue;
            }
            if self.restore_from_mark(eid, &mark, seen) {
                report.restored_entities += 1;
            } else {
                report.purged_entities += 1;
            }
        }
    }

    /// Index one marked entity. False if a newer entity carries its domain.
    fn restore_from_mark(&self, eid: EntityId, mark: &ProtectionMark, seen: &HashSet<DomainObjectId>) -> bool {
        let owner = parse_owner(mark);
        let domain = parse_domain(mark).or_else(|| self.host.domain_object_of(eid));

        if let Some(did) = domain {
            let carrier = self.links.get(&did).map(|e| *e).filter(|e| *e != eid);
            let superseded = carrier
                .and_then(|c| self.entities.get(&c).map(|r| r.expire_at_ms))
                .is_some_and(|expire| expire >= mark.expire);
            if superseded {
                debug!("Mark on {} superseded for domain {}", eid, did);
                self.retire(eid);
                return false;
            }
            self.bind(did, eid);
        }

        self.entities.insert(
            eid,
            ProtectionRecord {
                entity_id: eid,
                domain_object_id: domain,
                expire_at_ms: mark.expire,
                owner,
            },
        );

        if let Some(did) = domain.filter(|d| !seen.contains(d)) {
            self.domains.insert(
                did,
                DomainProtection {
                    expire_at_ms: mark.expire,
                    owner,
                },
            );
            self.bridge.sync(did, mark.expire, owner);
            self.store.upsert(
                did,
                PersistedProtection {
                    expire_at_ms: mark.expire,
                    owner,
                },
            );
        }

        self.host.set_engagement_lock(eid, owner.is_none());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityBridge, AuthorityTable, BridgeHandle};
    use crate::config::ProtectionConfig;
    use crate::host::{EntityHost, WorldPos};
    use crate::store::DurableStore;
    use crate::test_support::{ManualClock, MemoryHost};
    use std::sync::Arc;
    use warden_env::ActorId;

    fn cache_over(
        store: Arc<DurableStore>,
        clock: Arc<ManualClock>,
        host: Arc<MemoryHost>,
        authority: Arc<AuthorityTable>,
    ) -> ProtectionCache<ManualClock> {
        ProtectionCache::new(
            clock,
            ProtectionConfig::default(),
            store,
            BridgeHandle::new(Some(authority as Arc<dyn AuthorityBridge>)),
            host,
        )
    }

    #[test]
    fn test_store_records_converge() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let host = MemoryHost::shared();
        let authority = AuthorityTable::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));

        let a = DomainObjectId::from_seed(1);
        let b = DomainObjectId::from_seed(2);
        let now = clock.millis();
        store.upsert(a, PersistedProtection { expire_at_ms: now + 1000, owner: None });
        store.upsert(b, PersistedProtection { expire_at_ms: now - 1000, owner: None });

        let cache = cache_over(store.clone(), clock, host, authority.clone());
        let report = cache.resync_all();

        assert_eq!(report.restored_domains, 1);
        assert_eq!(report.purged_domains, 1);
        assert_eq!(cache.domain_protection(&a).unwrap().expire_at_ms, now + 1000);
        assert!(cache.domain_protection(&b).is_none());
        assert!(!store.contains(&b));
        assert!(authority.entry(&a).is_some());
        assert!(authority.entry(&b).is_none());
    }

    #[test]
    fn test_exact_expiry_is_purged_by_store_pass() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));
        let a = DomainObjectId::from_seed(1);
        store.upsert(a, PersistedProtection { expire_at_ms: clock.millis(), owner: None });

        let cache = cache_over(store.clone(), clock, MemoryHost::shared(), AuthorityTable::shared());
        assert_eq!(cache.resync_all().purged_domains, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_marks_restore_entities_and_backfill_store() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let host = MemoryHost::shared();
        let authority = AuthorityTable::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));

        let live = EntityId::from_seed(1);
        let stale = EntityId::from_seed(2);
        let d1 = DomainObjectId::from_seed(1);
        let owner = ActorId::from_seed(7);
        host.spawn_entity(live, Some(d1), WorldPos::new("world", 0.0, 64.0, 0.0));
        host.spawn_entity(stale, None, WorldPos::new("world", 5.0, 64.0, 5.0));

        // Domain id missing from the mark: recovered from the entity itself
        host.write_mark(live, ProtectionMark::new(Some(owner), clock.millis() + 30_000, None));
        host.write_mark(stale, ProtectionMark::new(None, clock.millis() - 1, None));

        let cache = cache_over(store.clone(), clock, host.clone(), authority.clone());
        let report = cache.resync_all();

        assert_eq!(report.restored_entities, 1);
        assert_eq!(report.purged_entities, 1);
        assert_eq!(cache.protection_of(live).unwrap().domain_object_id, Some(d1));
        assert_eq!(store.get(&d1).unwrap().owner, Some(owner));
        assert_eq!(authority.entry(&d1).unwrap().owner, Some(owner));
        assert!(host.entity(stale).unwrap().mark.is_none());
        assert!(!host.entity(live).unwrap().locked);
    }

    #[test]
    fn test_exact_expiry_mark_is_not_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let host = MemoryHost::shared();
        let authority = AuthorityTable::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));
        let e1 = EntityId::from_seed(1);
        let d1 = DomainObjectId::from_seed(1);
        let now = clock.millis();
        store.upsert(d1, PersistedProtection { expire_at_ms: now, owner: None });
        host.spawn_entity(e1, Some(d1), WorldPos::new("world", 0.0, 64.0, 0.0));
        host.write_mark(e1, ProtectionMark::new(None, now, Some(d1)));

        let cache = cache_over(store.clone(), clock, host.clone(), authority.clone());
        let report = cache.resync_all();

        assert_eq!(report.purged_domains, 1);
        assert_eq!(report.purged_entities, 1);
        assert!(!store.contains(&d1));
        assert!(authority.entry(&d1).is_none());
        assert!(host.entity(e1).unwrap().mark.is_none());
    }

    #[test]
    fn test_two_marks_for_one_domain_keep_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let host = MemoryHost::shared();
        let authority = AuthorityTable::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));
        let old = EntityId::from_seed(1);
        let new = EntityId::from_seed(2);
        let d1 = DomainObjectId::from_seed(1);
        let p1 = ActorId::from_seed(7);
        let p2 = ActorId::from_seed(8);
        let now = clock.millis();
        host.spawn_entity(old, Some(d1), WorldPos::new("world", 0.0, 64.0, 0.0));
        host.spawn_entity(new, Some(d1), WorldPos::new("world", 4.0, 64.0, 0.0));
        host.write_mark(old, ProtectionMark::new(Some(p1), now + 10_000, Some(d1)));
        host.write_mark(new, ProtectionMark::new(Some(p2), now + 30_000, Some(d1)));

        let cache = cache_over(store.clone(), clock, host.clone(), authority.clone());
        let report = cache.resync_all();

        assert_eq!(report.restored_entities, 1);
        assert_eq!(report.purged_entities, 1);
        assert_eq!(cache.entity_count(), 1);
        assert!(host.entity(old).unwrap().mark.is_none());
        assert_eq!(store.get(&d1).unwrap().owner, Some(p2));
        assert_eq!(authority.entry(&d1).unwrap().owner, Some(p2));

        cache.untrack(old);
        assert!(cache.is_tracked(new));
        assert!(store.contains(&d1));
    }

    #[test]
    fn test_resync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let host = MemoryHost::shared();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));
        let e1 = EntityId::from_seed(1);
        let d1 = DomainObjectId::from_seed(1);
        host.spawn_entity(e1, Some(d1), WorldPos::new("world", 0.0, 64.0, 0.0));
        host.write_mark(e1, ProtectionMark::new(None, clock.millis() + 30_000, Some(d1)));

        let cache = cache_over(store.clone(), clock, host, AuthorityTable::shared());
        cache.resync_all();
        let second = cache.resync_all();

        assert_eq!(second.purged_domains, 0);
        assert_eq!(second.restored_domains, 1);
        assert_eq!(cache.entity_count(), 1);
        assert_eq!(cache.domain_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_disabled_protection_skips_resync() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::json_file(dir.path().join("cache.json")));
        store.upsert(
            DomainObjectId::from_seed(1),
            PersistedProtection { expire_at_ms: 0, owner: None },
        );
        let cache = cache_over(store.clone(), ManualClock::shared(), MemoryHost::shared(), AuthorityTable::shared());
        let mut cfg = cache.config();
        cfg.enabled = false;
        cache.set_config(cfg);

        assert_eq!(cache.resync_all(), ResyncReport::default());
        assert_eq!(store.len(), 1);
    }
}
