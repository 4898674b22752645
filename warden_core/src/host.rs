//! Interfaces to the hosting world.
//!
//! Warden never reaches into engine internals. Everything it needs from the
//! world (entity metadata, highlight toggles, terrain queries, the actor
//! closest to a spawn) goes through the traits in this module.

use serde::{Deserialize, Serialize};
use warden_env::{ActorId, DomainObjectId, EntityId};

// ============================================================================
// ACTORS
// ============================================================================

/// Capabilities an actor holds, resolved by the caller's permission system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Ignore protections entirely
    pub protect_bypass: bool,

    /// Administrative actor (also ignores protections)
    pub admin: bool,

    /// Relocate anywhere without cooldown or fee
    pub relocate_bypass: bool,

    /// Relocations are never charged
    pub relocate_free: bool,
}

impl Capabilities {
    /// True if protections do not apply to this actor.
    pub fn bypasses_protection(&self) -> bool {
        self.protect_bypass || self.admin
    }
}

/// An actor attempting an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: ActorId,
    pub capabilities: Capabilities,
}

impl Actor {
    /// Creates an actor without any capabilities.
    pub fn new(id: ActorId) -> Self {
        Self {
            id,
            capabilities: Capabilities::default(),
        }
    }

    /// Builder: attach capabilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

// ============================================================================
// POSITIONS
// ============================================================================

/// A precise position inside a named world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WorldPos {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    /// Integer block coordinates containing this position.
    pub fn block(&self) -> (i32, i32, i32) {
        (
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }
}

// ============================================================================
// OUT-OF-BAND ENTITY MARKS
// ============================================================================

/// The four metadata flags written on a live entity at track time.
///
/// Strings are kept raw: the metadata outlives process memory and may have
/// been written by an older build, so parsing happens on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionMark {
    /// 1 when the entity is tracked
    pub tracked: u8,

    /// Owner actor id, absent for public protection
    pub owner: Option<String>,

    /// Absolute expiry in epoch milliseconds
    pub expire: i64,

    /// Stable domain object id, if known at track time
    pub domain_object_id: Option<String>,
}

impl ProtectionMark {
    pub fn new(owner: Option<ActorId>, expire: i64, domain: Option<DomainObjectId>) -> Self {
        Self {
            tracked: 1,
            owner: owner.map(|o| o.to_string()),
            expire,
            domain_object_id: domain.map(|d| d.to_string()),
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked == 1
    }
}

// ============================================================================
// HOST TRAITS
// ============================================================================

/// Access to live entities of the hosting world.
///
/// Implementations must be cheap: these calls happen on the tick thread.
pub trait EntityHost: Send + Sync {
    /// True if the entity is currently loaded.
    fn is_live(&self, entity: EntityId) -> bool;

    /// Current position of a live entity.
    fn position(&self, entity: EntityId) -> Option<WorldPos>;

    /// Read the protection mark of a live entity.
    fn read_mark(&self, entity: EntityId) -> Option<ProtectionMark>;

    /// Write the protection mark. No-op if the entity is not live.
    fn write_mark(&self, entity: EntityId, mark: ProtectionMark);

    /// Remove the protection mark. No-op if absent.
    fn clear_mark(&self, entity: EntityId);

    /// Every live entity currently carrying a mark.
    fn marked_entities(&self) -> Vec<(EntityId, ProtectionMark)>;

    /// Host-side flag that hard-blocks engagement for everyone.
    fn set_engagement_lock(&self, entity: EntityId, locked: bool);

    /// Visual highlight of a protected entity.
    fn set_highlight(&self, entity: EntityId, on: bool);

    /// The domain object an entity represents, read from the entity itself.
    fn domain_object_of(&self, entity: EntityId) -> Option<DomainObjectId>;

    /// Find the live entity for a freshly spawned domain object.
    ///
    /// `hint` is the entity handle announced with the spawn, if any.
    fn resolve_spawned(
        &self,
        domain: DomainObjectId,
        hint: Option<EntityId>,
        near: &WorldPos,
    ) -> Option<EntityId>;

    /// Actor closest to a position in the same world.
    fn nearest_actor(&self, pos: &WorldPos) -> Option<ActorId>;
}

/// Delivery of actor-facing messages (rendering is the caller's concern).
pub trait ActorNotifier: Send + Sync {
    fn notify(&self, actor: ActorId, message: &str);

    fn broadcast(&self, message: &str);
}

/// Block-level terrain queries used by the landing search.
pub trait Terrain: Send + Sync {
    /// True if the world exists.
    fn has_world(&self, world: &str) -> bool;

    /// Lowest buildable y (inclusive).
    fn min_height(&self, world: &str) -> i32;

    /// Build limit (exclusive).
    fn max_height(&self, world: &str) -> i32;

    fn is_solid(&self, world: &str, x: i32, y: i32, z: i32) -> bool;

    fn is_passable(&self, world: &str, x: i32, y: i32, z: i32) -> bool;

    /// y of the highest solid block in a column.
    fn highest_solid_y(&self, world: &str, x: i32, z: i32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_floors_negative_coordinates() {
        let pos = WorldPos::new("world", -0.5, 64.9, 10.0);
        assert_eq!(pos.block(), (-1, 64, 10));
    }

    #[test]
    fn test_mark_serializes_ids_as_strings() {
        let owner = ActorId::from_seed(1);
        let mark = ProtectionMark::new(Some(owner), 42, None);
        assert!(mark.is_tracked());
        assert_eq!(mark.owner.as_deref(), Some(owner.to_string().as_str()));
        assert!(mark.domain_object_id.is_none());
    }

    #[test]
    fn test_admin_bypasses_protection() {
        let caps = Capabilities {
            admin: true,
            ..Default::default()
        };
        assert!(caps.bypasses_protection());
        assert!(!Capabilities::default().bypasses_protection());
    }
}
