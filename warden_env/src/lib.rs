//! Warden Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Warden
//! protection engines to run in both **Production** (tokio) and
//! **Simulation** (virtual clock) environments.
//!
//! # Core Concept
//!
//! Every protection decision is a function of the wall clock. For
//! deterministic testing we intercept all time sources:
//! - Wall clock (`epoch_millis()`) for expiry timestamps
//! - Monotonic time (`now()`) for internal measurement
//! - Suspension (`sleep()`) for retry loops, sweeps and debounced flushes
//!
//! # Example
//!
//! ```ignore
//! use warden_env::WardenContext;
//!
//! async fn sweep_loop<Ctx: WardenContext>(ctx: &Ctx, cache: &ProtectionCache) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(2)).await;
//!         cache.sweep(ctx.epoch_millis());
//!     }
//! }
//! ```

mod context;
mod types;
mod error;
mod tokio_impl;

pub use context::WardenContext;
pub use types::{ActorId, DomainObjectId, EntityId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
