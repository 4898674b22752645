//! Service runtime: wires the tracking cache and relocation gate to the
//! host's events and runs the background tasks.
//!
//! # Background tasks
//!
//! - **sweep**: every `protection.sweep_interval_ms`, evict expired
//!   protections, switch their highlight off and announce the expiry
//! - **flush**: wait for a store mutation, let the debounce window pass,
//!   write once
//!
//! Both stop when [`WardenService::shutdown`] fires the watch channel.
//!
//! The flush itself is synchronous: the file write and rename (or the sled
//! flush) block the runtime thread polling the flush task until they return.
//! Event handlers never wait on it. Hosts on a single-threaded runtime should
//! keep `store.flush_delay_ms` large enough that those stalls stay rare.

use crate::authority::{AuthorityBridge, BridgeHandle};
use crate::config::WardenConfig;
use crate::host::{Actor, ActorNotifier, EntityHost, Terrain, WorldPos};
use crate::reconcile::ResyncReport;
use crate::relocation::{CostPolicy, RelocationGate};
use crate::store::{DurableStore, StoreError};
use crate::tracking::ProtectionCache;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use warden_env::{ActorId, DomainObjectId, EntityId, WardenContext};

// ============================================================================
// EVENTS
// ============================================================================

/// A domain object appeared in the world.
#[derive(Debug, Clone)]
pub struct SpawnEvent {
    /// Entity handle announced with the spawn, if the producer knows it
    pub transient_id: Option<EntityId>,

    pub domain_object_id: DomainObjectId,

    pub location: WorldPos,

    /// Display label used in announcements
    pub label: String,
}

/// Whether the host should cancel the event it reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOutcome {
    pub cancelled: bool,
}

impl EventOutcome {
    pub const ALLOWED: EventOutcome = EventOutcome { cancelled: false };
    pub const CANCELLED: EventOutcome = EventOutcome { cancelled: true };
}

/// What to say when a resolved spawn's protection ends.
#[derive(Debug, Clone)]
struct SpawnNotice {
    label: String,
    location: WorldPos,
}

/// Everything the service needs from its host.
#[derive(Clone)]
pub struct HostBindings {
    pub entities: Arc<dyn EntityHost>,
    pub terrain: Arc<dyn Terrain>,
    pub notifier: Arc<dyn ActorNotifier>,
    pub charger: Option<Arc<dyn CostPolicy>>,
    pub authority: Option<Arc<dyn AuthorityBridge>>,
}

// ============================================================================
// SERVICE
// ============================================================================

/// The assembled protection service.
pub struct WardenService<Ctx: WardenContext> {
    ctx: Arc<Ctx>,
    config: RwLock<WardenConfig>,
    cache: ProtectionCache<Ctx>,
    gate: RelocationGate<Ctx>,
    host: Arc<dyn EntityHost>,
    notifier: Arc<dyn ActorNotifier>,

    /// Resolved spawns still waiting for their expiry announcement
    notices: DashMap<EntityId, SpawnNotice>,

    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<Ctx: WardenContext> WardenService<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: WardenConfig, store: Arc<DurableStore>, bindings: HostBindings) -> Self {
        let config = config.sanitized();
        let cache = ProtectionCache::new(
            ctx.clone(),
            config.protection.clone(),
            store,
            BridgeHandle::new(bindings.authority),
            bindings.entities.clone(),
        );
        let gate = RelocationGate::new(
            ctx.clone(),
            config.relocation.clone(),
            bindings.charger,
            bindings.terrain,
            bindings.entities.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx,
            config: RwLock::new(config),
            cache,
            gate,
            host: bindings.entities,
            notifier: bindings.notifier,
            notices: DashMap::new(),
            started: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn cache(&self) -> &ProtectionCache<Ctx> {
        &self.cache
    }

    pub fn gate(&self) -> &RelocationGate<Ctx> {
        &self.gate
    }

    pub fn config(&self) -> WardenConfig {
        self.config.read().clone()
    }

    /// Spawn the sweep loop and the flush worker. A second call is ignored.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let svc = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        self.ctx.spawn("protection-sweep", async move {
            loop {
                let interval = Duration::from_millis(svc.cache.config().sweep_interval_ms);
                tokio::select! {
                    _ = svc.ctx.sleep(interval) => {
                        svc.sweep_once();
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("Sweep loop stopped");
        });

        let svc = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        self.ctx.spawn("store-flush", async move {
            loop {
                tokio::select! {
                    _ = svc.cache.store().wait_dirty() => {}
                    _ = stop.changed() => break,
                }
                let delay = Duration::from_millis(svc.config.read().store.flush_delay_ms);
                svc.ctx.sleep(delay).await;
                if let Err(e) = svc.cache.flush() {
                    warn!("Protection store flush failed: {}", e);
                }
            }
            debug!("Flush worker stopped");
        });

        info!("🛡️ Warden started (seed {})", self.ctx.seed());
    }

    /// Stop background tasks and write pending store changes.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        let _ = self.shutdown.send(true);
        self.cache.flush()?;
        info!("Warden stopped");
        Ok(())
    }

    /// Swap in a new configuration and rebuild state from durable sources.
    pub fn reload(&self, config: WardenConfig) -> ResyncReport {
        let config = config.sanitized();
        self.cache.set_config(config.protection.clone());
        self.gate.set_config(config.relocation.clone());
        *self.config.write() = config;
        self.cache.resync_all()
    }

    /// One sweep pass. Returns the number of expiry announcements made.
    pub fn sweep_once(&self) -> usize {
        let now = self.cache.now_ms();
        let mut ended: HashSet<EntityId> = self
            .cache
            .sweep(now)
            .into_iter()
            .filter_map(|e| e.entity_id)
            .collect();

        // Protections evicted lazily by a read never reach the sweep
        let pending: Vec<EntityId> = self.notices.iter().map(|n| *n.key()).collect();
        for eid in pending {
            if self.cache.protection_of(eid).is_none() {
                ended.insert(eid);
            }
        }

        let mut announced = 0;
        for eid in ended {
            self.host.set_highlight(eid, false);
            if let Some((_, notice)) = self.notices.remove(&eid) {
                let template = self.config.read().messages.protection_expired.clone();
                self.notifier.broadcast(&render(&template, &notice));
                announced += 1;
            }
        }
        announced
    }

    // ------------------------------------------------------------------------
    // spawn handling
    // ------------------------------------------------------------------------

    /// Announce a spawn: remember its location, protect its domain object
    /// right away and keep trying to find the entity in the background.
    pub fn on_spawn(self: &Arc<Self>, event: SpawnEvent) {
        let cfg = self.config();
        let (x, y, z) = event.location.block();

        if cfg.relocation.enabled {
            self.gate
                .track_location(&event.location.world, x, y, z, cfg.protection.duration_seconds);
        }
        if !cfg.protection.enabled {
            return;
        }

        let owner = self.host.nearest_actor(&event.location);
        self.cache.track(
            None,
            owner,
            cfg.protection.duration_seconds,
            Some(event.domain_object_id),
        );
        if cfg.debug {
            info!(
                "Announced {} @{} {} {} {} (domain {}, owner {:?})",
                event.label, event.location.world, x, y, z, event.domain_object_id, owner
            );
        }

        let svc = Arc::clone(self);
        self.ctx.spawn("resolve-spawn", async move {
            svc.resolve_and_protect(event, owner).await;
        });
    }

    /// Bounded retry until the spawned entity shows up, then protect it.
    pub async fn resolve_and_protect(&self, event: SpawnEvent, owner: Option<ActorId>) -> Option<EntityId> {
        let (attempts, interval, duration) = {
            let cfg = self.config.read();
            (
                cfg.protection.resolve_attempts.max(1),
                Duration::from_millis(cfg.protection.resolve_interval_ms),
                cfg.protection.duration_seconds,
            )
        };

        for attempt in 1..=attempts {
            let found = self
                .host
                .resolve_spawned(event.domain_object_id, event.transient_id, &event.location);
            if let Some(eid) = found {
                self.cache
                    .track(Some(eid), owner, duration, Some(event.domain_object_id));
                self.host.set_highlight(eid, true);
                self.notices.insert(
                    eid,
                    SpawnNotice {
                        label: event.label.clone(),
                        location: event.location.clone(),
                    },
                );
                debug!("Protected {} after {} attempt(s)", event.label, attempt);
                return Some(eid);
            }
            if attempt < attempts {
                self.ctx.sleep(interval).await;
            }
        }

        warn!(
            "Failed to resolve spawned entity for {} ({}) near {:?}",
            event.label,
            event.domain_object_id,
            event.location.block()
        );
        None
    }

    // ------------------------------------------------------------------------
    // interaction handlers
    // ------------------------------------------------------------------------

    /// Direct damage. Non-actor damage goes through `on_environment_damage`.
    pub fn on_attack(&self, victim: EntityId, attacker: Option<&Actor>) -> EventOutcome {
        let (enabled, deny, message) = self.deny_settings(|c| (c.protection.deny.attack, c.messages.denied_attack.clone()));
        if !enabled || !deny {
            return EventOutcome::ALLOWED;
        }
        match attacker {
            Some(actor) => self.deny_actor(victim, actor, &message),
            None => EventOutcome::ALLOWED,
        }
    }

    /// Any damage to a tracked entity is cancelled, whoever the source.
    pub fn on_environment_damage(&self, victim: EntityId) -> EventOutcome {
        if !self.cache.config().enabled || !self.cache.is_tracked(victim) {
            return EventOutcome::ALLOWED;
        }
        EventOutcome::CANCELLED
    }

    pub fn on_interact(&self, target: EntityId, actor: &Actor) -> EventOutcome {
        let (enabled, deny, message) =
            self.deny_settings(|c| (c.protection.deny.interact, c.messages.denied_interact.clone()));
        if !enabled || !deny {
            return EventOutcome::ALLOWED;
        }
        self.deny_actor(target, actor, &message)
    }

    /// Projectiles from non-actors (dispensers, mobs) never hit a tracked
    /// entity.
    pub fn on_projectile_hit(&self, target: EntityId, shooter: Option<&Actor>) -> EventOutcome {
        let (enabled, _, message) = self.deny_settings(|c| ((), c.messages.denied_interact.clone()));
        if !enabled || !self.cache.is_tracked(target) {
            return EventOutcome::ALLOWED;
        }
        match shooter {
            Some(actor) => self.deny_actor(target, actor, &message),
            None => EventOutcome::CANCELLED,
        }
    }

    pub fn on_fish(&self, caught: EntityId, actor: &Actor) -> EventOutcome {
        let (enabled, deny, message) = self.deny_settings(|c| (c.protection.deny.fish, c.messages.denied_fish.clone()));
        if !enabled || !deny {
            return EventOutcome::ALLOWED;
        }
        self.deny_actor(caught, actor, &message)
    }

    fn deny_settings<T, F>(&self, pick: F) -> (bool, T, String)
    where
        F: FnOnce(&WardenConfig) -> (T, String),
    {
        let cfg = self.config.read();
        let (value, message) = pick(&cfg);
        (cfg.protection.enabled, value, message)
    }

    fn deny_actor(&self, target: EntityId, actor: &Actor, message: &str) -> EventOutcome {
        if !self.cache.decide(target, actor).denied {
            return EventOutcome::ALLOWED;
        }
        self.cache.notify_once(actor.id, message, self.notifier.as_ref());
        EventOutcome::CANCELLED
    }
}

fn render(template: &str, notice: &SpawnNotice) -> String {
    let (x, y, z) = notice.location.block();
    template
        .replace("{label}", &notice.label)
        .replace("{world}", &notice.location.world)
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string())
        .replace("{z}", &z.to_string())
}
