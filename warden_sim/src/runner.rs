//! Scenario runner - executes the warden scenarios against a simulated host.
//!
//! Every scenario boots a real `WardenService` over `SimWorld` on a
//! single-threaded tokio runtime. Virtual time only moves when the harness
//! ticks; after each tick the harness yields so resolver tasks and the
//! background loops catch up before anything is checked.

use crate::context::SimContext;
use crate::scenarios::ScenarioId;
use crate::world::{SimBank, SimChat, SimConfig, SimDisk, SimWorld, WORLD};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_core::{
    Actor, AuthorityBridge, AuthorityTable, Capabilities, CostPolicy, DurableStore, EntityHost, HostBindings,
    ProtectionRecord, RelocationDenied, SpawnEvent, StoreError, Terrain, WardenConfig, WardenService, WorldPos,
};
use warden_env::{ActorId, DomainObjectId, EntityId, WardenContext};

/// Display labels handed out to spawns, round robin.
const LABELS: [&str; 6] = ["Pikachu", "Eevee", "Bulbasaur", "Charmander", "Squirtle", "Gible"];

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Protections (or tracked locations) still live at the end
    pub final_protected_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_protected_count: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioMetrics {
    /// Spawn events announced
    pub spawns: u64,

    /// Spawns whose entity was found and protected
    pub resolved: u64,

    /// Interaction decisions checked against ground truth
    pub decisions: u64,

    /// Decisions that cancelled the event
    pub denials: u64,

    /// Checks that disagreed with ground truth
    pub violations: u64,

    /// Expiry announcements broadcast
    pub expirations: u64,

    /// Completed store writes
    pub store_writes: u64,

    /// Relocations granted
    pub relocations: u64,

    /// Relocation fees collected
    pub charges: u64,
}

/// Runs warden scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of actors
    num_actors: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Maximum duration in seconds
    max_duration_secs: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_actors: usize) -> Self {
        Self {
            seed,
            num_actors,
            tick_rate_hz: 20,
            max_duration_secs: 30.0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt,
            Err(e) => return ScenarioResult::failed(scenario, self.seed, format!("runtime: {}", e)),
        };

        let outcome = runtime.block_on(async {
            match scenario {
                ScenarioId::OwnerRush => self.run_owner_rush().await,
                ScenarioId::ExpiryWave => self.run_expiry_wave().await,
                ScenarioId::ColdRestart => self.run_cold_restart().await,
                ScenarioId::LocationFlood => self.run_location_flood().await,
                ScenarioId::RelocationRush => self.run_relocation_rush().await,
                ScenarioId::AuthorityOutage => self.run_authority_outage().await,
                ScenarioId::FlushStorm => self.run_flush_storm().await,
            }
        });

        outcome.unwrap_or_else(|e| ScenarioResult::failed(scenario, self.seed, format!("store: {}", e)))
    }

    fn target_ticks(&self) -> u64 {
        ((self.max_duration_secs * self.tick_rate_hz as f64) as u64).max(1)
    }

    fn harness(&self) -> Result<Harness, StoreError> {
        Harness::new(self.seed, self.num_actors, self.tick_rate_hz)
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        h: &Harness,
        protected: usize,
        checks: Violations,
        mut metrics: ScenarioMetrics,
    ) -> ScenarioResult {
        metrics.violations = checks.count;
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: checks.count == 0,
            total_ticks: h.ticks,
            final_time_secs: h.ctx.now().as_secs_f64(),
            final_protected_count: protected,
            failure_reason: checks.reason(),
            metrics,
        }
    }

    /// WDN-001: OwnerRush - owner exclusivity under load.
    ///
    /// Spawns keep coming while every actor tries every kind of interaction
    /// on everything already protected. Admins interleave.
    ///
    /// **Assertion**: each decision matches ground truth (the nearest actor at
    /// spawn time owns it) and the authority's own table agrees.
    async fn run_owner_rush(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-001: OwnerRush - owner exclusivity under load");

        let mut h = self.harness()?;
        let svc = h.boot(WardenConfig::default());
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();
        let mut spawned: Vec<Spawned> = Vec::new();
        let admin = Capabilities {
            admin: true,
            ..Default::default()
        };

        for tick in 0..self.target_ticks() {
            if tick % 5 == 0 && spawned.len() < 64 {
                spawned.push(h.spawn(&svc));
                metrics.spawns += 1;
            }
            h.tick().await;
            metrics.resolved += h.observe(&mut spawned, &mut checks);

            let protected: Vec<usize> = (0..spawned.len())
                .filter(|&i| spawned[i].expire_at_ms.is_some())
                .collect();
            if protected.is_empty() {
                continue;
            }

            for _ in 0..4 {
                let (pick, kind, as_admin) = h.ctx.with_rng(|r| {
                    (r.gen_range(0..protected.len()), r.gen_range(0..4u8), r.gen_bool(0.1))
                });
                let Some(attacker) = h.world.random_actor() else { break };
                let actor = if as_admin {
                    Actor::new(attacker).with_capabilities(admin)
                } else {
                    Actor::new(attacker)
                };
                let s = &spawned[protected[pick]];
                let Some(entity) = s.entity else { continue };

                let now = h.now_ms();
                let expected = expected_denial(s, &actor, now);
                let cancelled = engage(&svc, entity, &actor, kind);
                metrics.decisions += 1;
                if cancelled {
                    metrics.denials += 1;
                }
                checks.check(cancelled == expected, || {
                    format!("{} engaging {}: cancelled={} expected={}", attacker, s.event.label, cancelled, expected)
                });

                if !as_admin {
                    let blocks = h.authority.blocks(&s.event.domain_object_id, attacker, now);
                    checks.check(blocks == expected, || {
                        format!("authority disagrees on {}: blocks={} expected={}", s.event.label, blocks, expected)
                    });
                }
            }

            if tick % 100 == 0 {
                debug!(
                    "  t={:.1}s | spawns={} | protected={} | denials={}",
                    h.ctx.now().as_secs_f64(),
                    metrics.spawns,
                    svc.cache().entity_count(),
                    metrics.denials
                );
            }
        }

        checks.check(metrics.decisions > 0, || "no decisions were made".to_string());
        info!(
            "OwnerRush: {} decisions, {} denials, {} violations",
            metrics.decisions, metrics.denials, checks.count
        );

        let protected = svc.cache().entity_count();
        Ok(self.finish(ScenarioId::OwnerRush, &h, protected, checks, metrics))
    }

    /// WDN-002: ExpiryWave - short protections running out in waves.
    ///
    /// 5-second protections, spawns during the first half of the run, a
    /// manual sweep every tick and random interactions racing it.
    ///
    /// **Assertion**: nothing is denied past its expiry, every resolved spawn
    /// is announced exactly once, and all indices drain to empty.
    async fn run_expiry_wave(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-002: ExpiryWave - protections expiring in waves");

        let mut h = self.harness()?;
        let svc = h.boot(WardenConfig::default().with_protection_duration(5));
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();
        let mut spawned: Vec<Spawned> = Vec::new();

        let target_ticks = self.target_ticks();
        // Long enough for the last spawn to resolve and expire
        let drain_ticks = h.ticks_for(8.0);

        for tick in 0..target_ticks + drain_ticks {
            if tick < target_ticks / 2 && tick % 10 == 0 {
                spawned.push(h.spawn(&svc));
                metrics.spawns += 1;
            }
            h.tick().await;
            metrics.resolved += h.observe(&mut spawned, &mut checks);

            // Interactions first: a lazy eviction must not steal the announcement
            let observed: Vec<usize> = (0..spawned.len())
                .filter(|&i| spawned[i].expire_at_ms.is_some())
                .collect();
            for _ in 0..3 {
                if observed.is_empty() {
                    break;
                }
                let pick = h.ctx.with_rng(|r| r.gen_range(0..observed.len()));
                let Some(attacker) = h.world.random_actor() else { break };
                let s = &spawned[observed[pick]];
                let Some(entity) = s.entity else { continue };

                let actor = Actor::new(attacker);
                let now = h.now_ms();
                let expected = expected_denial(s, &actor, now);
                let cancelled = svc.on_attack(entity, Some(&actor)).cancelled;
                metrics.decisions += 1;
                if cancelled {
                    metrics.denials += 1;
                }
                checks.check(cancelled == expected, || {
                    format!(
                        "{} at t={}ms: cancelled={} expected={} (expires {:?})",
                        s.event.label, now, cancelled, expected, s.expire_at_ms
                    )
                });
            }

            metrics.expirations += svc.sweep_once() as u64;
        }

        metrics.expirations += svc.sweep_once() as u64;
        checks.check(metrics.expirations == metrics.resolved, || {
            format!("{} announcements for {} resolved spawns", metrics.expirations, metrics.resolved)
        });
        checks.check(h.chat.broadcasts().len() as u64 == metrics.expirations, || {
            "broadcast count differs from announcements".to_string()
        });
        checks.check(svc.cache().entity_count() == 0, || {
            format!("{} entity records left", svc.cache().entity_count())
        });
        checks.check(svc.cache().domain_count() == 0, || {
            format!("{} domain records left", svc.cache().domain_count())
        });
        checks.check(svc.cache().store().is_empty(), || "store not drained".to_string());
        checks.check(h.authority.is_empty(), || format!("{} authority entries left", h.authority.len()));
        for s in &spawned {
            let Some(e) = s.entity.and_then(|e| h.world.entity(e)) else { continue };
            checks.check(e.mark.is_none() && !e.highlighted && !e.locked, || {
                format!("{} still carries protection state", s.event.label)
            });
        }

        info!(
            "ExpiryWave: {} resolved, {} announced, {} denials",
            metrics.resolved, metrics.expirations, metrics.denials
        );
        Ok(self.finish(ScenarioId::ExpiryWave, &h, 0, checks, metrics))
    }

    /// WDN-003: ColdRestart - crash with protections in flight.
    ///
    /// Fixed timeline: 10-second protections spawned over six seconds, the
    /// process dies at nine, stays down four, then boots and resyncs.
    ///
    /// **Assertion**: live protections come back with the same owner and
    /// expiry; expired ones are gone from memory, marks and store.
    async fn run_cold_restart(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-003: ColdRestart - restart and resync");

        let mut h = self.harness()?;
        let config = WardenConfig::default().with_protection_duration(10);
        let svc = h.boot(config.clone());
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();
        let mut spawned: Vec<Spawned> = Vec::new();

        for tick in 0..h.ticks_for(6.0) {
            if tick % 4 == 0 {
                spawned.push(h.spawn(&svc));
                metrics.spawns += 1;
            }
            h.tick().await;
            metrics.resolved += h.observe(&mut spawned, &mut checks);
        }
        h.run_for(3.0).await;
        metrics.resolved += h.observe(&mut spawned, &mut checks);

        let before: Vec<ProtectionRecord> = spawned
            .iter()
            .filter_map(|s| s.entity)
            .filter_map(|e| svc.cache().protection_of(e))
            .collect();
        let marked = h.world.marked_entities().len();

        // The debounced write landed just before the crash
        svc.cache().flush()?;
        metrics.store_writes += svc.cache().store().write_count();
        drop(svc);
        info!("💥 Crash at t={:.1}s with {} live protections", h.ctx.now().as_secs_f64(), before.len());

        h.run_for(4.0).await;

        let svc = h.boot(config.clone());
        let report = svc.reload(config);
        let now = h.now_ms();

        checks.check(report.restored_entities + report.purged_entities == marked, || {
            format!("resync saw {:?}, {} entities were marked", report, marked)
        });

        let mut restored = 0;
        let mut purged = 0;
        for rec in &before {
            let after = svc.cache().protection_of(rec.entity_id);
            let domain = rec.domain_object_id;
            if rec.expire_at_ms > now {
                restored += 1;
                checks.check(after == Some(*rec), || {
                    format!("{} restored as {:?}, was {:?}", rec.entity_id, after, rec)
                });
                let persisted = domain.and_then(|d| svc.cache().store().get(&d));
                checks.check(persisted.map(|p| p.expire_at_ms) == Some(rec.expire_at_ms), || {
                    format!("store lost {:?}", domain)
                });

                // Ownership still holds after the restart
                if let Some(intruder) = h.world.actors().into_iter().find(|a| Some(*a) != rec.owner) {
                    let cancelled = svc.on_attack(rec.entity_id, Some(&Actor::new(intruder))).cancelled;
                    metrics.decisions += 1;
                    if cancelled {
                        metrics.denials += 1;
                    }
                    checks.check(cancelled, || format!("{} unprotected after restart", rec.entity_id));
                }
            } else if rec.expire_at_ms < now {
                purged += 1;
                let mark = h.world.entity(rec.entity_id).and_then(|e| e.mark);
                checks.check(after.is_none() && mark.is_none(), || {
                    format!("expired {} survived the restart", rec.entity_id)
                });
                checks.check(!domain.is_some_and(|d| svc.cache().store().contains(&d)), || {
                    format!("expired {:?} still persisted", domain)
                });
            }
        }
        checks.check(restored > 0 && purged > 0, || {
            format!("timeline produced {} restored and {} purged", restored, purged)
        });

        info!("ColdRestart: {} restored, {} purged ({:?})", restored, purged, report);
        let protected = svc.cache().entity_count();
        Ok(self.finish(ScenarioId::ColdRestart, &h, protected, checks, metrics))
    }

    /// WDN-004: LocationFlood - 5000 announced positions, cap 4096.
    ///
    /// One in ten announcements lives for a second only.
    ///
    /// **Assertion**: the table never exceeds its cap, expired positions
    /// are never admitted, and eviction takes the soonest expiry.
    async fn run_location_flood(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-004: LocationFlood - bounded location cache");

        const INSERTS: u64 = 5000;

        let mut h = self.harness()?;
        let mut config = WardenConfig::default();
        config.relocation.economy.enabled = false;
        let svc = h.boot(config);
        let gate = svc.gate();
        let cap = gate.config().location_cap;
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();

        let world = h.world.clone();
        let position = move |n: u64| {
            let x = (n % 100) as i32 * 3 - 150;
            let z = (n / 100) as i32 * 3 - 75;
            (x, world.surface_y(x, z) + 1, z)
        };

        let target_ticks = self.target_ticks();
        let per_tick = INSERTS.div_ceil(target_ticks);
        let mut inserted = 0u64;
        let mut max_len = 0usize;

        while inserted < INSERTS {
            for _ in 0..per_tick {
                if inserted == INSERTS {
                    break;
                }
                let (x, y, z) = position(inserted);
                let ttl = if inserted % 10 == 0 { 1 } else { 600 };
                gate.track_location(WORLD, x, y, z, ttl);
                inserted += 1;

                let len = gate.locations().len();
                max_len = max_len.max(len);
                checks.check(len <= cap, || format!("location table at {} with cap {}", len, cap));
            }
            h.tick().await;
        }

        // Let every short-lived announcement run out
        h.run_for(1.5).await;

        let (x, y, z) = position(0);
        checks.check(!gate.is_tracked_location(WORLD, x, y, z), || {
            "expired location still admitted".to_string()
        });

        if let Some(actor) = h.world.random_actor() {
            let actor = Actor::new(actor);

            // Oldest long-lived entry had the soonest expiry once the short ones were gone
            let (x, y, z) = position(1);
            let oldest = gate.request_relocation(&actor, &WorldPos::new(WORLD, x as f64, y as f64, z as f64));
            checks.check(matches!(oldest, Err(RelocationDenied::NotTracked)), || {
                format!("oldest location not evicted: {:?}", oldest)
            });

            let (x, y, z) = position(INSERTS - 1);
            match gate.request_relocation(&actor, &WorldPos::new(WORLD, x as f64, y as f64, z as f64)) {
                Ok(landing) => {
                    metrics.relocations += 1;
                    checks.check(is_safe_landing(&h.world, &landing), || {
                        format!("unsafe landing {:?}", landing)
                    });
                }
                Err(e) => checks.check(false, || format!("newest location refused: {}", e)),
            }
        }

        info!("LocationFlood: {} inserts, peak {} entries (cap {})", inserted, max_len, cap);
        let live = gate.locations().live_len(h.now_ms());
        Ok(self.finish(ScenarioId::LocationFlood, &h, live, checks, metrics))
    }

    /// WDN-005: RelocationRush - cooldown and fee under contention.
    ///
    /// Actors start with thin wallets and request relocations to announced
    /// spawns (or straight onto the spawned entity) at random.
    ///
    /// **Assertion**: no grant inside the cooldown, no grant without funds,
    /// a refused charge leaves the cooldown untouched, and fees collected
    /// equal relocations granted.
    async fn run_relocation_rush(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-005: RelocationRush - cooldown and fee");

        let mut h = self.harness()?;
        let config = WardenConfig::default();
        let cost = config.relocation.economy.cost;
        let cooldown_secs = config.relocation.cooldown_seconds;
        let cooldown_ms = cooldown_secs * 1000;
        let svc = h.boot(config);
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();
        let mut spawned: Vec<Spawned> = Vec::new();

        let actors = h.world.actors();
        for a in &actors {
            let funds = h.ctx.with_rng(|r| r.gen_range(0..=5u32)) as f64 * cost;
            h.bank.deposit(*a, funds);
        }
        for _ in 0..16 {
            spawned.push(h.spawn(&svc));
            metrics.spawns += 1;
        }
        h.run_for(3.0).await;
        metrics.resolved += h.observe(&mut spawned, &mut checks);

        let mut last_granted: HashMap<ActorId, i64> = HashMap::new();
        let request = |actor: &Actor, target: &Spawned, onto_entity: bool| match (onto_entity, target.entity) {
            (true, Some(e)) => svc.gate().request_relocation_to_entity(actor, e),
            _ => svc.gate().request_relocation(actor, &target.event.location),
        };

        for _ in 0..self.target_ticks() {
            h.tick().await;

            for a in &actors {
                let (go, pick, onto_entity, top_up) = h.ctx.with_rng(|r| {
                    (r.gen_bool(0.15), r.gen_range(0..spawned.len()), r.gen_bool(0.2), r.gen_bool(0.5))
                });
                if !go {
                    continue;
                }
                let actor = Actor::new(*a);
                let target = &spawned[pick];
                let now = h.now_ms();
                let balance = h.bank.balance(*a);
                let cooled = last_granted.get(a).map_or(true, |t| now - t >= cooldown_ms);

                match request(&actor, target, onto_entity) {
                    Ok(landing) => {
                        metrics.relocations += 1;
                        checks.check(cooled, || format!("{} relocated inside the cooldown", a));
                        checks.check(balance >= cost, || format!("{} relocated with {} in the bank", a, balance));
                        checks.check((h.bank.balance(*a) - (balance - cost)).abs() < 1e-9, || {
                            format!("{} charged the wrong amount", a)
                        });
                        checks.check(is_safe_landing(&h.world, &landing), || {
                            format!("unsafe landing {:?}", landing)
                        });
                        last_granted.insert(*a, now);
                    }
                    Err(RelocationDenied::CooldownActive { remaining_secs }) => {
                        checks.check(!cooled, || format!("{} refused for cooldown after it ran out", a));
                        checks.check((1..=cooldown_secs).contains(&remaining_secs), || {
                            format!("remaining cooldown {}s out of range", remaining_secs)
                        });
                    }
                    Err(RelocationDenied::InsufficientFunds { .. }) => {
                        checks.check(cooled && balance < cost, || {
                            format!("{} refused for funds with {} in the bank", a, balance)
                        });
                        if top_up {
                            // The refused charge must not have started a cooldown
                            h.bank.deposit(*a, cost);
                            let retry = request(&actor, target, onto_entity);
                            checks.check(retry.is_ok(), || {
                                format!("{} still refused after topping up: {:?}", a, retry)
                            });
                            if retry.is_ok() {
                                metrics.relocations += 1;
                                last_granted.insert(*a, now);
                            }
                        }
                    }
                    Err(other) => checks.check(false, || format!("{} refused unexpectedly: {}", a, other)),
                }
            }
        }

        metrics.charges = h.bank.charge_count();
        checks.check(metrics.charges == metrics.relocations, || {
            format!("{} fees for {} relocations", metrics.charges, metrics.relocations)
        });

        info!(
            "RelocationRush: {} relocations, {} charges",
            metrics.relocations, metrics.charges
        );
        let protected = svc.cache().entity_count();
        Ok(self.finish(ScenarioId::RelocationRush, &h, protected, checks, metrics))
    }

    /// WDN-006: AuthorityOutage - enforcement while the authority is gone.
    ///
    /// **Assertion**: local decisions stay correct during the outage, the
    /// authority learns nothing while offline, and one reload afterwards
    /// makes its table match the domain index exactly.
    async fn run_authority_outage(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-006: AuthorityOutage - degraded mode and convergence");

        let mut h = self.harness()?;
        let svc = h.boot(WardenConfig::default());
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();
        let mut spawned: Vec<Spawned> = Vec::new();

        h.authority.set_offline(true);
        warn!("📴 Authority offline");

        let target_ticks = self.target_ticks();
        for tick in 0..target_ticks {
            if tick < target_ticks / 2 && tick % 5 == 0 {
                spawned.push(h.spawn(&svc));
                metrics.spawns += 1;
            }
            h.tick().await;
            metrics.resolved += h.observe(&mut spawned, &mut checks);

            for s in spawned.iter().filter(|s| s.expire_at_ms.is_some()) {
                let Some(entity) = s.entity else { continue };
                let Some(attacker) = h.world.random_actor() else { break };
                let actor = Actor::new(attacker);
                let expected = expected_denial(s, &actor, h.now_ms());
                let cancelled = svc.on_interact(entity, &actor).cancelled;
                metrics.decisions += 1;
                if cancelled {
                    metrics.denials += 1;
                }
                checks.check(cancelled == expected, || {
                    format!("local decision on {} wrong during outage", s.event.label)
                });
            }
        }
        checks.check(h.authority.is_empty(), || "offline authority accepted syncs".to_string());

        h.authority.set_offline(false);
        info!("📶 Authority back, reloading");
        let report = svc.reload(WardenConfig::default());

        let domains = svc.cache().domain_count();
        checks.check(h.authority.len() == domains, || {
            format!("authority holds {} entries, index holds {}", h.authority.len(), domains)
        });
        checks.check(report.restored_domains == domains, || {
            format!("resync restored {} of {} domains", report.restored_domains, domains)
        });
        for s in &spawned {
            let id = s.event.domain_object_id;
            let local = svc.cache().domain_protection(&id);
            let remote = h.authority.entry(&id);
            let agree = match (local, remote) {
                (Some(l), Some(r)) => l.expire_at_ms == r.expire_at_ms && l.owner == r.owner,
                (None, None) => true,
                _ => false,
            };
            checks.check(agree, || format!("{}: index {:?}, authority {:?}", s.event.label, local, remote));
        }

        info!("AuthorityOutage: {} domains converged ({:?})", domains, report);
        let protected = svc.cache().entity_count();
        Ok(self.finish(ScenarioId::AuthorityOutage, &h, protected, checks, metrics))
    }

    /// WDN-007: FlushStorm - spawn bursts against the background tasks.
    ///
    /// Fixed timeline: 5-second protections, bursts of 40 spawns at 0s, 3s
    /// and 15s, background sweep and flush worker running throughout.
    ///
    /// **Assertion**: writes coalesce (fewer writes than spawns), the
    /// background sweep announces every expired spawn, shutdown persists
    /// exactly the live index, and nothing is written after shutdown.
    async fn run_flush_storm(&self) -> Result<ScenarioResult, StoreError> {
        info!("WDN-007: FlushStorm - coalesced writes and background sweep");

        let mut h = self.harness()?;
        let svc = h.boot(WardenConfig::default().with_protection_duration(5));
        svc.start();
        let mut metrics = ScenarioMetrics::default();
        let mut checks = Violations::default();
        let mut spawned: Vec<Spawned> = Vec::new();

        let bursts = [h.ticks_for(0.0), h.ticks_for(3.0), h.ticks_for(15.0)];
        let mut resolved_before_last_burst = 0;

        for tick in 0..h.ticks_for(16.0) {
            if bursts.contains(&tick) {
                if tick == bursts[2] {
                    resolved_before_last_burst = metrics.resolved;
                }
                for _ in 0..40 {
                    spawned.push(h.spawn(&svc));
                    metrics.spawns += 1;
                }
            }
            h.tick().await;
            metrics.resolved += h.observe(&mut spawned, &mut checks);
        }

        metrics.expirations = h.chat.broadcasts().len() as u64;
        checks.check(metrics.expirations == resolved_before_last_burst, || {
            format!(
                "background sweep announced {} of {} expired spawns",
                metrics.expirations, resolved_before_last_burst
            )
        });
        checks.check(svc.sweep_once() == 0, || "background sweep left expired protections".to_string());

        let store = svc.cache().store().clone();
        svc.shutdown()?;
        metrics.store_writes = store.write_count();
        checks.check(metrics.store_writes >= 1, || "nothing was written".to_string());
        checks.check(metrics.store_writes < metrics.spawns, || {
            format!("{} writes for {} spawns", metrics.store_writes, metrics.spawns)
        });

        let reopened = DurableStore::new(Box::new(h.disk.clone()));
        let domains = svc.cache().domain_count();
        checks.check(reopened.len() == domains && domains > 0, || {
            format!("disk holds {} records, index holds {}", reopened.len(), domains)
        });
        for (id, rec) in reopened.records() {
            let live = svc.cache().domain_protection(&id);
            checks.check(live.map(|d| d.expire_at_ms) == Some(rec.expire_at_ms), || {
                format!("disk record {} disagrees with index {:?}", id, live)
            });
        }

        // Stopped workers stay stopped
        h.run_for(0.5).await;
        let writes = store.write_count();
        svc.cache().track(None, None, 600, Some(DomainObjectId::from_seed(u64::MAX)));
        h.run_for(0.5).await;
        checks.check(store.write_count() == writes && store.is_dirty(), || {
            "flush worker wrote after shutdown".to_string()
        });

        info!(
            "FlushStorm: {} spawns, {} writes, {} announcements",
            metrics.spawns, metrics.store_writes, metrics.expirations
        );
        let protected = svc.cache().entity_count();
        Ok(self.finish(ScenarioId::FlushStorm, &h, protected, checks, metrics))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// One simulated world plus the host services around it.
///
/// Outlives any single service instance, so a scenario can crash and boot
/// the service again over the same world and disk.
struct Harness {
    ctx: Arc<SimContext>,
    world: Arc<SimWorld>,
    chat: Arc<SimChat>,
    bank: Arc<SimBank>,
    authority: Arc<AuthorityTable>,
    disk: SimDisk,
    tick_rate_hz: u32,
    ticks: u64,
    spawn_count: usize,
}

impl Harness {
    fn new(seed: u64, num_actors: usize, tick_rate_hz: u32) -> Result<Self, StoreError> {
        let ctx = SimContext::shared(seed);
        let config = SimConfig {
            seed,
            num_actors,
            ..Default::default()
        };
        Ok(Self {
            world: SimWorld::shared(config, ctx.clone()),
            ctx,
            chat: SimChat::shared(),
            bank: SimBank::shared(),
            authority: AuthorityTable::shared(),
            disk: SimDisk::new()?,
            tick_rate_hz: tick_rate_hz.max(1),
            ticks: 0,
            spawn_count: 0,
        })
    }

    /// Boot a fresh service process over the shared world and disk.
    fn boot(&self, config: WardenConfig) -> Arc<WardenService<SimContext>> {
        let store = Arc::new(DurableStore::new(Box::new(self.disk.clone())));
        let bindings = HostBindings {
            entities: self.world.clone(),
            terrain: self.world.clone(),
            notifier: self.chat.clone(),
            charger: Some(self.bank.clone() as Arc<dyn CostPolicy>),
            authority: Some(self.authority.clone() as Arc<dyn AuthorityBridge>),
        };
        Arc::new(WardenService::new(self.ctx.clone(), config, store, bindings))
    }

    fn now_ms(&self) -> i64 {
        self.ctx.epoch_millis()
    }

    fn ticks_for(&self, secs: f64) -> u64 {
        (secs * self.tick_rate_hz as f64).ceil() as u64
    }

    async fn tick(&mut self) {
        self.ctx
            .advance_time(Duration::from_secs_f64(1.0 / self.tick_rate_hz as f64));
        self.ticks += 1;
        settle().await;
    }

    async fn run_for(&mut self, secs: f64) {
        for _ in 0..self.ticks_for(secs) {
            self.tick().await;
        }
    }

    /// Announce a random spawn and record who should own it.
    fn spawn(&mut self, svc: &Arc<WardenService<SimContext>>) -> Spawned {
        let label = LABELS[self.spawn_count % LABELS.len()];
        self.spawn_count += 1;

        let (event, entity) = self.world.spawn_random(label);
        let owner = self.world.nearest_actor(&event.location);
        svc.on_spawn(event.clone());
        Spawned {
            event,
            entity,
            owner,
            expire_at_ms: None,
        }
    }

    /// Pick up spawns protected since the last call. Returns how many.
    fn observe(&self, spawned: &mut [Spawned], checks: &mut Violations) -> u64 {
        let mut found = 0;
        for s in spawned.iter_mut().filter(|s| s.expire_at_ms.is_none()) {
            let Some(mark) = s.entity.and_then(|e| self.world.entity(e)).and_then(|e| e.mark) else {
                continue;
            };
            let owner = s.owner.map(|o| o.to_string());
            checks.check(mark.owner == owner, || {
                format!("{} owned by {:?}, nearest actor was {:?}", s.event.label, mark.owner, owner)
            });
            s.expire_at_ms = Some(mark.expire);
            found += 1;
        }
        found
    }
}

/// Let every runnable task take a few turns.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Ground truth for one spawn.
struct Spawned {
    event: SpawnEvent,
    entity: Option<EntityId>,

    /// Nearest actor at spawn time
    owner: Option<ActorId>,

    /// Read back from the mark once the entity was protected
    expire_at_ms: Option<i64>,
}

/// Collected check failures of one run.
#[derive(Default)]
struct Violations {
    first: Option<String>,
    count: u64,
}

impl Violations {
    fn check(&mut self, ok: bool, what: impl FnOnce() -> String) {
        if ok {
            return;
        }
        self.count += 1;
        if self.first.is_none() {
            let message = what();
            warn!("Violation: {}", message);
            self.first = Some(message);
        }
    }

    fn reason(&self) -> Option<String> {
        let first = self.first.as_ref()?;
        Some(match self.count {
            1 => first.clone(),
            n => format!("{} (+{} more)", first, n - 1),
        })
    }
}

fn expected_denial(s: &Spawned, actor: &Actor, now_ms: i64) -> bool {
    let Some(expire_at_ms) = s.expire_at_ms else {
        return false;
    };
    !actor.capabilities.bypasses_protection() && expire_at_ms >= now_ms && s.owner != Some(actor.id)
}

/// Route an engagement through one of the host event handlers.
fn engage(svc: &WardenService<SimContext>, entity: EntityId, actor: &Actor, kind: u8) -> bool {
    let outcome = match kind % 4 {
        0 => svc.on_attack(entity, Some(actor)),
        1 => svc.on_interact(entity, actor),
        2 => svc.on_fish(entity, actor),
        _ => svc.on_projectile_hit(entity, Some(actor)),
    };
    outcome.cancelled
}

fn is_safe_landing(world: &SimWorld, landing: &WorldPos) -> bool {
    let (x, y, z) = landing.block();
    world.is_solid(&landing.world, x, y - 1, z)
        && world.is_passable(&landing.world, x, y, z)
        && world.is_passable(&landing.world, x, y + 1, z)
}
