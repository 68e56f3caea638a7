//! Catalog errors

use dealflow_ledger::LedgerError;
use dealflow_model::{PipelineId, StageId, StoreError};

/// Pipeline catalog error
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Unknown pipeline
    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineId),

    /// Unknown stage, or a stage of another pipeline
    #[error("stage {stage_id} not found{}", .pipeline_id.map(|p| format!(" in pipeline {p}")).unwrap_or_default())]
    StageNotFound {
        /// Requested stage
        stage_id: StageId,
        /// Pipeline it was looked up in, if any
        pipeline_id: Option<PipelineId>,
    },

    /// Stage still holds deals
    #[error("stage {stage_id} still holds {deals} deal(s)")]
    StageHasActiveDeals {
        /// Stage that was to be deleted
        stage_id: StageId,
        /// Deals currently in it
        deals: usize,
    },

    /// Reorder permutation does not match the pipeline's stages
    #[error("stage set for pipeline {pipeline_id} does not match: expected {expected} stages, got {given}")]
    InvalidStageSet {
        /// Pipeline being reordered
        pipeline_id: PipelineId,
        /// Stages the pipeline has
        expected: usize,
        /// Ids supplied
        given: usize,
    },

    /// A stage cannot be both closing and lost
    #[error("stage '{name}' cannot be both closing and lost")]
    ConflictingStageFlags {
        /// Stage name
        name: String,
    },

    /// Rejected input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Entity store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Ledger append failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl CatalogError {
    /// Whether a referenced pipeline or stage was missing
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PipelineNotFound(_) | Self::StageNotFound { .. })
            || matches!(self, Self::Store(e) if e.is_not_found())
    }

    /// Stage-not-found within a pipeline
    #[must_use]
    pub fn stage_in(stage_id: StageId, pipeline_id: PipelineId) -> Self {
        Self::StageNotFound {
            stage_id,
            pipeline_id: Some(pipeline_id),
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Ledger(LedgerError::from(err))
    }
}
