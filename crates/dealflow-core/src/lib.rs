//! Dealflow stage transition engine
//!
//! Moves deals through pipeline stages and keeps the audit trail honest.
//!
//! # Core Concepts
//!
//! - [`DealStageMachine`]: validates moves, derives status, auto-enrolls
//!   closed deals in follow-on pipelines, appends stage history
//! - [`DealOrderingIndex`]: explicit board order inside one stage
//! - [`DealLocks`]: one writer per deal at a time
//! - [`DealflowConfig`]: auto-spawn rules, cache, checksum key, analytics
//!
//! # Example
//!
//! ```rust,ignore
//! use dealflow_core::{Dealflow, DealflowConfig, MoveStage};
//!
//! let app = Dealflow::in_memory(DealflowConfig::default(), Arc::new(SystemClock))?;
//! let deal = app.machine.create_deal(NewDeal::titled("Acme"), &actor).await?;
//! let deal = app.machine
//!     .move_stage(deal.id, MoveStage::new(dealer.id, investigation.id), &actor)
//!     .await?;
//! ```

#![warn(unreachable_pub)]

mod config;
mod engine;
mod error;
mod locks;
mod machine;
mod ordering;

pub use config::{AutoSpawnRule, ConfigError, DealflowConfig, LedgerConfig};
pub use engine::Dealflow;
pub use error::DealError;
pub use locks::{DealGuard, DealLocks};
pub use machine::{DealStageMachine, MoveStage};
pub use ordering::DealOrderingIndex;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
