//! In-memory host and manual clock shared by the unit tests.

use crate::host::{ActorNotifier, EntityHost, ProtectionMark, Terrain, WorldPos};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use warden_env::{ActorId, DomainObjectId, EntityId, WardenContext};

/// 2024-01-01T00:00:00Z
pub const EPOCH_2024_MS: i64 = 1_704_067_200_000;

/// Wall clock that only moves when told to.
pub struct ManualClock {
    start: i64,
    millis: AtomicI64,
}

impl ManualClock {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            start: EPOCH_2024_MS,
            millis: AtomicI64::new(EPOCH_2024_MS),
        })
    }

    pub fn advance(&self, ms: i64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WardenContext for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis((self.millis() - self.start) as u64)
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.millis() as u64)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as i64);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone)]
pub struct HostEntity {
    pub pos: WorldPos,
    pub domain: Option<DomainObjectId>,
    pub mark: Option<ProtectionMark>,
    pub locked: bool,
    pub highlighted: bool,
}

/// Flat world: everything at or below `floor_y` is solid.
pub struct MemoryHost {
    pub floor_y: i32,
    entities: parking_lot::Mutex<HashMap<EntityId, HostEntity>>,
    actors: parking_lot::Mutex<Vec<(ActorId, WorldPos)>>,
    solid: parking_lot::Mutex<HashSet<(i32, i32, i32)>>,
    hidden_polls: parking_lot::Mutex<HashMap<DomainObjectId, u32>>,
}

impl MemoryHost {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            floor_y: 63,
            entities: parking_lot::Mutex::new(HashMap::new()),
            actors: parking_lot::Mutex::new(Vec::new()),
            solid: parking_lot::Mutex::new(HashSet::new()),
            hidden_polls: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn_entity(&self, id: EntityId, domain: Option<DomainObjectId>, pos: WorldPos) {
        self.entities.lock().insert(
            id,
            HostEntity {
                pos,
                domain,
                mark: None,
                locked: false,
                highlighted: false,
            },
        );
    }

    pub fn entity(&self, id: EntityId) -> Option<HostEntity> {
        self.entities.lock().get(&id).cloned()
    }

    pub fn place_actor(&self, id: ActorId, pos: WorldPos) {
        self.actors.lock().push((id, pos));
    }

    pub fn add_solid(&self, x: i32, y: i32, z: i32) {
        self.solid.lock().insert((x, y, z));
    }

    /// The next `polls` resolution attempts for `domain` find nothing.
    pub fn hide_for(&self, domain: DomainObjectId, polls: u32) {
        self.hidden_polls.lock().insert(domain, polls);
    }
}

impl EntityHost for MemoryHost {
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
        self.entities.lock().get(&entity).and_then(|e| e.domain)
    }

    fn resolve_spawned(
        &self,
        domain: DomainObjectId,
        hint: Option<EntityId>,
        _near: &WorldPos,
    ) -> Option<EntityId> {
        {
            let mut hidden = self.hidden_polls.lock();
            if let Some(left) = hidden.get_mut(&domain) {
                if *left > 0 {
                    *left -= 1;
                    return None;
                }
            }
        }
        let entities = self.entities.lock();
        if let Some(h) = hint.filter(|h| entities.contains_key(h)) {
            return Some(h);
        }
        entities
            .iter()
            .find(|(_, e)| e.domain == Some(domain))
            .map(|(id, _)| *id)
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

impl Terrain for MemoryHost {
    fn has_world(&self, world: &str) -> bool {
        world == "world"
    }

    fn min_height(&self, _world: &str) -> i32 {
        -64
    }

    fn max_height(&self, _world: &str) -> i32 {
        320
    }

    fn is_solid(&self, _world: &str, x: i32, y: i32, z: i32) -> bool {
        y <= self.floor_y || self.solid.lock().contains(&(x, y, z))
    }

    fn is_passable(&self, world: &str, x: i32, y: i32, z: i32) -> bool {
        !self.is_solid(world, x, y, z)
    }

    fn highest_solid_y(&self, _world: &str, x: i32, z: i32) -> i32 {
        self.solid
            .lock()
            .iter()
            .filter(|(sx, _, sz)| *sx == x && *sz == z)
            .map(|(_, y, _)| *y)
            .max()
            .unwrap_or(self.floor_y)
            .max(self.floor_y)
    }
}

/// Records every message instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    pub direct: parking_lot::Mutex<Vec<(ActorId, String)>>,
    pub broadcasts: parking_lot::Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn direct_count(&self) -> usize {
        self.direct.lock().len()
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().len()
    }
}

impl ActorNotifier for RecordingNotifier {
    fn notify(&self, actor: ActorId, message: &str) {
        self.direct.lock().push((actor, message.to_string()));
    }

    fn broadcast(&self, message: &str) {
        self.broadcasts.lock().push(message.to_string());
    }
}
