//! The Location Cache and Relocation Gate.
//!
//! Spawn locations are remembered for a while so actors can be relocated to
//! them. A relocation passes several gates in order:
//!
//! 1. relocation enabled
//! 2. destination previously announced (unless the actor may go anywhere)
//! 3. per-actor cooldown
//! 4. fee, charged through an optional [`CostPolicy`]
//!
//! and then lands on the nearest safe block above the requested height.

use crate::config::{deadline_ms, RelocationConfig, MAX_DURATION_SECONDS};
use crate::host::{Actor, EntityHost, Terrain, WorldPos};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use warden_env::{ActorId, EntityId, WardenContext};

/// Where a relocated actor ends up (column centre, feet height).
pub type LandingPoint = WorldPos;

/// Reasons a relocation is refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelocationDenied {
    #[error("Relocation is disabled")]
    Disabled,

    #[error("Unknown world: {0}")]
    UnknownWorld(String),

    #[error("Destination is not a tracked spawn location")]
    NotTracked,

    #[error("Relocation on cooldown for {remaining_secs}s")]
    CooldownActive { remaining_secs: i64 },

    #[error("Cannot afford relocation fee of {cost}")]
    InsufficientFunds { cost: f64 },

    #[error("Target entity not found")]
    EntityNotFound,
}

/// Charges relocation fees.
pub trait CostPolicy: Send + Sync {
    /// Withdraw `amount` from `actor`. False if the actor cannot pay.
    fn try_charge(&self, actor: ActorId, amount: f64) -> bool;
}

// ============================================================================
// LOCATION CACHE
// ============================================================================

type LocationKey = (String, i32, i32, i32);

/// Bounded table of recently announced block positions.
pub struct LocationCache {
    entries: DashMap<LocationKey, i64>,
    cap: AtomicUsize,

    /// Serializes inserts of new keys so the cap holds under contention
    overflow: Mutex<()>,
}

impl LocationCache {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: DashMap::new(),
            cap: AtomicUsize::new(cap.max(1)),
            overflow: Mutex::new(()),
        }
    }

    pub fn set_cap(&self, cap: usize) {
        self.cap.store(cap.max(1), Ordering::Relaxed);
    }

    /// Remember a block position until `now_ms + ttl_secs`.
    ///
    /// If the table is full, expired entries are swept first; if that frees
    /// nothing, the entry closest to expiry makes room.
    pub fn track(&self, world: &str, x: i32, y: i32, z: i32, ttl_secs: i64, now_ms: i64) {
        let key = (world.to_string(), x, y, z);
        let expire_at_ms = deadline_ms(now_ms, ttl_secs);

        if let Some(mut existing) = self.entries.get_mut(&key) {
            *existing = expire_at_ms;
            return;
        }

        let _guard = self.overflow.lock();
        let cap = self.cap.load(Ordering::Relaxed);
        if self.entries.len() >= cap {
            self.sweep(now_ms);
        }
        while self.entries.len() >= cap {
            let soonest = self
                .entries
                .iter()
                .min_by_key(|e| *e.value())
                .map(|e| e.key().clone());
            match soonest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
        self.entries.insert(key, expire_at_ms);
    }

    /// True if the position is tracked and unexpired. Evicts on expiry.
    pub fn is_tracked(&self, world: &str, x: i32, y: i32, z: i32, now_ms: i64) -> bool {
        let key = (world.to_string(), x, y, z);
        let expire_at_ms = match self.entries.get(&key) {
            Some(e) => *e,
            None => return false,
        };
        if expire_at_ms < now_ms {
            self.entries.remove_if(&key, |_, e| *e < now_ms);
            return false;
        }
        true
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| *e >= now_ms);
        before.saturating_sub(self.entries.len())
    }

    /// Unexpired entries.
    pub fn live_len(&self, now_ms: i64) -> usize {
        self.entries.iter().filter(|e| *e.value() >= now_ms).count()
    }

    /// Stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// SAFE LANDING
// ============================================================================

/// Find where an actor can stand in column (`x`, `z`) at or just above
/// `start_y`.
///
/// A spot needs a solid block under the feet and two passable blocks for
/// feet and head. Scans at most six blocks up, then falls back to standing
/// on the highest solid block of the column.
pub fn find_safe_landing(terrain: &dyn Terrain, world: &str, x: i32, z: i32, start_y: i32) -> LandingPoint {
    let top = terrain.max_height(world) - 2;
    let start = start_y.max(terrain.min_height(world) + 1).min(top);
    let end = (start + 6).min(top);

    let landing_y = (start..=end)
        .find(|&y| {
            terrain.is_solid(world, x, y - 1, z)
                && terrain.is_passable(world, x, y, z)
                && terrain.is_passable(world, x, y + 1, z)
        })
        .unwrap_or_else(|| terrain.highest_solid_y(world, x, z) + 1);

    WorldPos::new(world, x as f64 + 0.5, landing_y as f64, z as f64 + 0.5)
}

// ============================================================================
// RELOCATION GATE
// ============================================================================

/// Decides whether an actor may relocate, and where they land.
pub struct RelocationGate<Ctx: WardenContext> {
    ctx: Arc<Ctx>,
    config: RwLock<RelocationConfig>,
    locations: LocationCache,

    /// Last successful charge per actor (epoch ms)
    last_charged: DashMap<ActorId, i64>,

    charger: Option<Arc<dyn CostPolicy>>,
    terrain: Arc<dyn Terrain>,
    host: Arc<dyn EntityHost>,
}

impl<Ctx: WardenContext> RelocationGate<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        config: RelocationConfig,
        charger: Option<Arc<dyn CostPolicy>>,
        terrain: Arc<dyn Terrain>,
        host: Arc<dyn EntityHost>,
    ) -> Self {
        Self {
            ctx,
            locations: LocationCache::new(config.location_cap),
            config: RwLock::new(config),
            last_charged: DashMap::new(),
            charger,
            terrain,
            host,
        }
    }

    pub fn config(&self) -> RelocationConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: RelocationConfig) {
        self.locations.set_cap(config.location_cap);
        *self.config.write() = config;
    }

    pub fn locations(&self) -> &LocationCache {
        &self.locations
    }

    pub fn track_location(&self, world: &str, x: i32, y: i32, z: i32, ttl_secs: i64) {
        self.locations.track(world, x, y, z, ttl_secs, self.ctx.epoch_millis());
    }

    pub fn is_tracked_location(&self, world: &str, x: i32, y: i32, z: i32) -> bool {
        self.locations.is_tracked(world, x, y, z, self.ctx.epoch_millis())
    }

    /// Relocate `actor` to a previously announced position.
    pub fn request_relocation(&self, actor: &Actor, destination: &WorldPos) -> Result<LandingPoint, RelocationDenied> {
        let cfg = self.config();
        if !cfg.enabled {
            return Err(RelocationDenied::Disabled);
        }
        if !self.terrain.has_world(&destination.world) {
            return Err(RelocationDenied::UnknownWorld(destination.world.clone()));
        }

        let (x, y, z) = destination.block();
        let bypass = actor.capabilities.relocate_bypass;
        if cfg.tracked_only && !bypass && !self.is_tracked_location(&destination.world, x, y, z) {
            return Err(RelocationDenied::NotTracked);
        }
        if !bypass {
            self.admit(actor, &cfg)?;
        }

        let landing = find_safe_landing(self.terrain.as_ref(), &destination.world, x, z, y);
        debug!("Relocating {} to {:?}", actor.id, landing);
        Ok(landing)
    }

    /// Relocate `actor` to stand just above a live entity.
    ///
    /// The entity is looked up before anything is charged.
    pub fn request_relocation_to_entity(&self, actor: &Actor, entity: EntityId) -> Result<LandingPoint, RelocationDenied> {
        let cfg = self.config();
        if !cfg.enabled {
            return Err(RelocationDenied::Disabled);
        }
        let pos = self.host.position(entity).ok_or(RelocationDenied::EntityNotFound)?;
        if !actor.capabilities.relocate_bypass {
            self.admit(actor, &cfg)?;
        }

        let (x, y, z) = pos.block();
        Ok(find_safe_landing(self.terrain.as_ref(), &pos.world, x, z, y + 1))
    }

    /// Cooldown and fee. The cooldown only restarts once the fee is paid.
    ///
    /// The charger runs under this actor's entry lock and must not call back
    /// into the gate.
    fn admit(&self, actor: &Actor, cfg: &RelocationConfig) -> Result<(), RelocationDenied> {
        let now = self.ctx.epoch_millis();
        let cooldown_ms = cfg.cooldown_seconds.clamp(0, MAX_DURATION_SECONDS) * 1000;

        let mut last = self.last_charged.entry(actor.id).or_insert(i64::MIN);
        let elapsed = now.saturating_sub(*last);
        if elapsed < cooldown_ms {
            let remaining_ms = cooldown_ms - elapsed;
            return Err(RelocationDenied::CooldownActive {
                remaining_secs: (remaining_ms + 999) / 1000,
            });
        }

        if cfg.economy.enabled && !actor.capabilities.relocate_free {
            if let Some(charger) = &self.charger {
                if !charger.try_charge(actor.id, cfg.economy.cost) {
                    return Err(RelocationDenied::InsufficientFunds { cost: cfg.economy.cost });
                }
            }
        }

        *last = now;
        Ok(())
    }
}
