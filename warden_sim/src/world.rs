//! SimWorld - the simulated host the protection service runs against.
//!
//! Stands in for the game server: entities carrying marks, actors walking
//! around, a seeded height map, chat, an economy and a disk that survives
//! a simulated process restart.

use crate::context::SimContext;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warden_core::store::{ProtectionTable, SledBackend, StoreBackend, StoreError};
use warden_core::{ActorNotifier, CostPolicy, EntityHost, ProtectionMark, SpawnEvent, Terrain, WorldPos};
use warden_env::{ActorId, DomainObjectId, EntityId};

/// The only world the simulation knows.
pub const WORLD: &str = "world";

/// Configuration for a simulated world.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of actors placed in the world
    pub num_actors: usize,

    /// Spawns and actors are placed within this many blocks of the origin
    pub world_radius: f64,

    /// Upper bound on how many resolution polls a spawn stays invisible
    pub max_spawn_lag_polls: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_actors: 6,
            world_radius: 256.0,
            max_spawn_lag_polls: 8,
        }
    }
}

/// Entity as the host sees it.
#[derive(Debug, Clone)]
pub struct SimEntity {
    pub domain: DomainObjectId,
    pub pos: WorldPos,
    pub mark: Option<ProtectionMark>,
    pub locked: bool,
    pub highlighted: bool,

    /// Resolution polls left before the host reports this entity
    lag_polls: u32,
}

/// The SimWorld - container for every host-side fact.
pub struct SimWorld {
    pub config: SimConfig,
    context: Arc<SimContext>,
    entities: Mutex<BTreeMap<EntityId, SimEntity>>,
    actors: Mutex<Vec<(ActorId, WorldPos)>>,
    next_id: AtomicU64,
}

impl SimWorld {
    /// Creates a world and places `config.num_actors` actors in it.
    pub fn new(config: SimConfig, context: Arc<SimContext>) -> Self {
        let world = Self {
            config,
            context,
            entities: Mutex::new(BTreeMap::new()),
            actors: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        };
        for i in 0..world.config.num_actors {
            let pos = world.random_pos();
            world.actors.lock().push((ActorId::from_seed(i as u64 + 1), pos));
        }
        world
    }

    pub fn shared(config: SimConfig, context: Arc<SimContext>) -> Arc<Self> {
        Arc::new(Self::new(config, context))
    }

    fn random_pos(&self) -> WorldPos {
        let r = self.config.world_radius;
        let (x, z) = self
            .context
            .with_rng(|rng| (rng.gen_range(-r..r), rng.gen_range(-r..r)));
        let y = self.surface_y(x.floor() as i32, z.floor() as i32) as f64 + 1.0;
        WorldPos::new(WORLD, x, y, z)
    }

    /// Spawn a fresh domain object somewhere random.
    ///
    /// The entity becomes resolvable after a random number of polls. One
    /// spawn in twenty never shows up (despawned before it could be found).
    pub fn spawn_random(&self, label: &str) -> (SpawnEvent, Option<EntityId>) {
        let max_lag = self.config.max_spawn_lag_polls;
        let lag = self
            .context
            .with_rng(|rng| (!rng.gen_bool(0.05)).then(|| rng.gen_range(0..=max_lag)));
        self.spawn_at(self.random_pos(), label, lag)
    }

    /// Spawn at a fixed position. `None` lag: the entity never appears.
    pub fn spawn_at(&self, pos: WorldPos, label: &str, lag_polls: Option<u32>) -> (SpawnEvent, Option<EntityId>) {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let domain = DomainObjectId::from_seed(self.config.seed.wrapping_mul(1_000_003).wrapping_add(n));
        let event = SpawnEvent {
            transient_id: None,
            domain_object_id: domain,
            location: pos.clone(),
            label: label.to_string(),
        };

        let Some(lag_polls) = lag_polls else {
            return (event, None);
        };
        let entity = EntityId::from_seed(self.config.seed.wrapping_mul(7_919).wrapping_add(n));
        self.entities.lock().insert(
            entity,
            SimEntity {
                domain,
                pos,
                mark: None,
                locked: false,
                highlighted: false,
                lag_polls,
            },
        );
        (event, Some(entity))
    }

    pub fn entity(&self, id: EntityId) -> Option<SimEntity> {
        self.entities.lock().get(&id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn actors(&self) -> Vec<ActorId> {
        self.actors.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn random_actor(&self) -> Option<ActorId> {
        let actors = self.actors.lock();
        if actors.is_empty() {
            return None;
        }
        let i = self.context.with_rng(|rng| rng.gen_range(0..actors.len()));
        Some(actors[i].0)
    }

    /// Column surface height, fixed per seed.
    pub fn surface_y(&self, x: i32, z: i32) -> i32 {
        let h = mix(self.config.seed ^ ((x as u64) << 32) ^ (z as u32 as u64));
        60 + (h % 8) as i32
    }
}

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

impl EntityHost for SimWorld {
    fn is_live(&self, entity: EntityId) -> bool {
        self.entities.lock().contains_key(&entity)
    }

    fn position(&self, entity: EntityId) -> Option<WorldPos> {
        self.entities.lock().get(&entity).map(|e| e.pos.clone())
    }

    fn read_mark(&self, entity: EntityId) -> Option<ProtectionMark> {
        self.entities.lock().get(&entity).and_then(|e| e.mark.clone())
    }

    fn write_mark(&self, entity: EntityId, mark: ProtectionMark) {
        if let Some(e) = self.entities.lock().get_mut(&entity) {
            e.mark = Some(mark);
        }
    }

    fn clear_mark(&self, entity: EntityId) {
        if let Some(e) = self.entities.lock().get_mut(&entity) {
            e.mark = None;
        }
    }

    fn marked_entities(&self) -> Vec<(EntityId, ProtectionMark)> {
        self.entities
            .lock()
            .iter()
            .filter_map(|(id, e)| e.mark.clone().map(|m| (*id, m)))
            .collect()
    }

    fn set_engagement_lock(&self, entity: EntityId, locked: bool) {
        if let Some(e) = self.entities.lock().get_mut(&entity) {
            e.locked = locked;
        }
    }

    fn set_highlight(&self, entity: EntityId, on: bool) {
        if let Some(e) = self.entities.lock().get_mut(&entity) {
            e.highlighted = on;
        }
    }

    fn domain_object_of(&self, entity: EntityId) -> Option<DomainObjectId> {
        self.entities.lock().get(&entity).map(|e| e.domain)
    }

    fn resolve_spawned(&self, domain: DomainObjectId, hint: Option<EntityId>, _near: &WorldPos) -> Option<EntityId> {
        let mut entities = self.entities.lock();
        let found = match hint {
            Some(h) if entities.contains_key(&h) => Some(h),
            _ => entities.iter().find(|(_, e)| e.domain == domain).map(|(id, _)| *id),
        }?;
        let e = entities.get_mut(&found)?;
        if e.lag_polls > 0 {
            e.lag_polls -= 1;
            return None;
        }
        Some(found)
    }

    fn nearest_actor(&self, pos: &WorldPos) -> Option<ActorId> {
        let dist = |p: &WorldPos| (p.x - pos.x).powi(2) + (p.y - pos.y).powi(2) + (p.z - pos.z).powi(2);
        self.actors
            .lock()
            .iter()
            .filter(|(_, p)| p.world == pos.world)
            .min_by(|a, b| dist(&a.1).total_cmp(&dist(&b.1)))
            .map(|(id, _)| *id)
    }
}

impl Terrain for SimWorld {
    fn has_world(&self, world: &str) -> bool {
        world == WORLD
    }

    fn min_height(&self, _world: &str) -> i32 {
        -64
    }

    fn max_height(&self, _world: &str) -> i32 {
        320
    }

    fn is_solid(&self, _world: &str, x: i32, y: i32, z: i32) -> bool {
        y <= self.surface_y(x, z)
    }

    fn is_passable(&self, world: &str, x: i32, y: i32, z: i32) -> bool {
        !self.is_solid(world, x, y, z)
    }

    fn highest_solid_y(&self, _world: &str, x: i32, z: i32) -> i32 {
        self.surface_y(x, z)
    }
}

// ============================================================================
// CHAT, ECONOMY, DISK
// ============================================================================

/// Captures every message the service sends.
#[derive(Default)]
pub struct SimChat {
    direct: Mutex<Vec<(ActorId, String)>>,
    broadcasts: Mutex<Vec<String>>,
}

impl SimChat {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn direct_count(&self) -> usize {
        self.direct.lock().len()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().clone()
    }
}

impl ActorNotifier for SimChat {
    fn notify(&self, actor: ActorId, message: &str) {
        self.direct.lock().push((actor, message.to_string()));
    }

    fn broadcast(&self, message: &str) {
        self.broadcasts.lock().push(message.to_string());
    }
}

/// Actor balances.
#[derive(Default)]
pub struct SimBank {
    balances: Mutex<HashMap<ActorId, f64>>,
    charges: AtomicU64,
}

impl SimBank {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deposit(&self, actor: ActorId, amount: f64) {
        *self.balances.lock().entry(actor).or_insert(0.0) += amount;
    }

    pub fn balance(&self, actor: ActorId) -> f64 {
        self.balances.lock().get(&actor).copied().unwrap_or(0.0)
    }

    pub fn charge_count(&self) -> u64 {
        self.charges.load(Ordering::Relaxed)
    }
}

impl CostPolicy for SimBank {
    fn try_charge(&self, actor: ActorId, amount: f64) -> bool {
        let mut balances = self.balances.lock();
        match balances.get_mut(&actor) {
            Some(b) if *b >= amount => {
                *b -= amount;
                self.charges.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }
}

/// Storage that outlives a simulated process.
///
/// Each service instance wraps it in a fresh `DurableStore`, so a restart
/// loses every in-memory mirror but keeps what was flushed.
#[derive(Clone)]
pub struct SimDisk {
    inner: Arc<SledBackend>,
}

impl SimDisk {
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            inner: Arc::new(SledBackend::open_temporary()?),
        })
    }
}

impl StoreBackend for SimDisk {
    fn load(&self) -> Result<ProtectionTable, StoreError> {
        self.inner.load()
    }

    fn save(&self, table: &ProtectionTable) -> Result<(), StoreError> {
        self.inner.save(table)
    }
}
