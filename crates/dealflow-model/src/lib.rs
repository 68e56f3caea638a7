//! Dealflow domain model
//!
//! Plain data types shared by the catalog and the stage machine, plus the
//! contracts for the collaborators they depend on:
//!
//! - [`EntityStore`]: generic CRUD; [`InMemoryStore`] is bundled
//! - [`CapabilityCheck`]: yes/no permission answer
//! - [`ActivitySink`]: fire-and-forget domain events

#![warn(unreachable_pub)]

mod deal;
mod ids;
mod pipeline;
mod ports;
mod store;

pub use deal::{Deal, DealStatus, NewDeal, StageHistoryEntry};
pub use ids::{DealId, PipelineId, StageId};
pub use pipeline::{Pipeline, PipelineWithStages, Stage};
pub use ports::{
    Action, Activity, ActivityError, ActivityKind, ActivitySink, Actor, AllowAll,
    CapabilityCheck, NoopActivitySink,
};
pub use store::{Entity, EntityStore, InMemoryStore, StoreError};
