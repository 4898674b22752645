//! Identifier types shared by every Warden crate.
//!
//! All three identifier spaces are UUID-backed but deliberately distinct
//! types: an entity handle must never be confused with the stable domain
//! object it represents, nor with the actor interacting with it.

use crate::error::EnvError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Creates a deterministic id from a seed (for simulation).
            pub fn from_seed(seed: u64) -> Self {
                let mut bytes = [0u8; 16];
                bytes[0..8].copy_from_slice(&seed.to_le_bytes());
                bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
                Self(Uuid::from_bytes(bytes))
            }

            /// Returns the inner UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = EnvError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| EnvError::invalid_id(s))
            }
        }
    };
}

uuid_id!(
    /// Session-scoped handle of a live in-world entity.
    ///
    /// Becomes meaningless once the entity unloads.
    EntityId
);

uuid_id!(
    /// Stable identifier of the protected subject, valid across entity
    /// reload/unload. This is the key of the durable store and of the
    /// external authority's table.
    DomainObjectId
);

uuid_id!(
    /// Identifier of an actor (a player or other principal).
    ActorId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_seed_is_deterministic() {
        assert_eq!(EntityId::from_seed(7), EntityId::from_seed(7));
        assert_ne!(EntityId::from_seed(7), EntityId::from_seed(8));
    }

    #[test]
    fn test_parse_roundtrip_and_rejects_garbage() {
        let id = DomainObjectId::from_seed(3);
        let parsed: DomainObjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let err = "not-a-uuid".parse::<ActorId>();
        assert!(matches!(err, Err(EnvError::InvalidId(_))));
    }
}
