//! Warden Core - spawn protection and relocation gating
//!
//! Newly spawned domain objects get a short, owner-scoped protection:
//! only the nearest actor at spawn time may engage them until the
//! protection expires. The library solves three problems a naive
//! in-memory flag cannot:
//! 1. **Restart Problem**: protections survive the process via the durable
//!    store and marks written on the entities themselves (`reconcile`)
//! 2. **Split Enforcement Problem**: an external authority enforcing its own
//!    table is kept in sync on a best-effort basis (`authority`)
//! 3. **Unbounded Growth Problem**: expiry is lazy on read plus a periodic
//!    sweep, and the location table is capped (`tracking`, `relocation`)

pub mod authority;
pub mod config;
pub mod host;
pub mod reconcile;
pub mod relocation;
pub mod runtime;
pub mod store;
pub mod tracking;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use authority::{AuthorityBridge, AuthorityTable, BridgeError, BridgeHandle, OwnerlessAuthority};
pub use config::{ConfigError, WardenConfig};
pub use host::{Actor, ActorNotifier, Capabilities, EntityHost, ProtectionMark, Terrain, WorldPos};
pub use reconcile::ResyncReport;
pub use relocation::{find_safe_landing, CostPolicy, LandingPoint, LocationCache, RelocationDenied, RelocationGate};
pub use runtime::{EventOutcome, HostBindings, SpawnEvent, WardenService};
pub use store::{DurableStore, PersistedProtection, StoreError};
pub use tracking::{Decision, ExpiredProtection, ProtectionCache, ProtectionRecord};
