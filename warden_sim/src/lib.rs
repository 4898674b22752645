//! Warden Deterministic Simulation Testing (DST) Harness
//!
//! A controlled environment where the whole protection service runs
//! deterministically against a simulated game host.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock that only the harness advances; sleeps park
//!   until it passes their deadline
//! - **Host**: entity lookup lag, actor placement and terrain all derive
//!   from the seed
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                      │
//! │   ┌──────────────────────────────────────────────┐     │
//! │   │ current-thread tokio runtime + SimContext    │     │
//! │   └──────────────────────────────────────────────┘     │
//! │        │                          │                    │
//! │  ┌─────▼─────────┐        ┌───────▼────────┐           │
//! │  │ WardenService │◄──────►│    SimWorld    │           │
//! │  │ cache + gate  │ events │ entities/marks │           │
//! │  └─────┬─────────┘        └────────────────┘           │
//! │        │                                               │
//! │  ┌─────▼──────────┐  ┌──────────┐  ┌─────────────┐     │
//! │  │ AuthorityTable │  │ SimDisk  │  │ SimChat/Bank│     │
//! │  └────────────────┘  └──────────┘  └─────────────┘     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use warden_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 6)
//!     .with_duration(10.0)
//!     .run(ScenarioId::ColdRestart);
//! assert!(result.passed);
//! ```

mod context;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimBank, SimChat, SimConfig, SimDisk, SimEntity, SimWorld, WORLD};
