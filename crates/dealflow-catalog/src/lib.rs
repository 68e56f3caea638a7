//! Dealflow pipeline catalog
//!
//! Owns [`Pipeline`](dealflow_model::Pipeline) and
//! [`Stage`](dealflow_model::Stage) definitions: ordering, organization-type
//! applicability, closing/lost flags and WIP limits. Reads are cached; every
//! administrative edit is written to the history ledger.

#![warn(unreachable_pub)]

mod cache;
mod catalog;
mod error;

pub use cache::{CatalogConfig, PipelineCache};
pub use catalog::{
    NewPipeline, NewStage, PipelineCatalog, PipelineUpdate, StageLoad, StageUpdate,
};
pub use error::CatalogError;
