//! Stage machine errors

use dealflow_catalog::CatalogError;
use dealflow_ledger::{EntityType, LedgerError};
use dealflow_model::{Action, DealId, PipelineId, StageId, StoreError};

/// Deal stage machine error
#[derive(Debug, thiserror::Error)]
pub enum DealError {
    /// Unknown deal
    #[error("deal {0} not found")]
    DealNotFound(DealId),

    /// Entering a lost stage, or setting LOST, without a reason
    #[error("a loss reason is required to mark deal {deal_id} as lost")]
    LossReasonRequired {
        /// Deal being moved
        deal_id: DealId,
        /// Lost stage targeted, if the request was a move
        stage_id: Option<StageId>,
    },

    /// Capability check said no
    #[error("{actor} may not {action:?} {entity_type}")]
    PermissionDenied {
        /// Acting user
        actor: String,
        /// Attempted action
        action: Action,
        /// Entity kind
        entity_type: EntityType,
    },

    /// Operation needs a membership the deal does not have
    #[error("deal {deal_id} is not in pipeline {pipeline_id}")]
    NotInPipeline {
        /// Deal
        deal_id: DealId,
        /// Pipeline
        pipeline_id: PipelineId,
    },

    /// Rejected input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Pipeline or stage lookup failed
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Entity store failure, never retried here
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Ledger append failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl DealError {
    /// Whether a deal, pipeline or stage was missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::DealNotFound(_) => true,
            Self::Catalog(e) => e.is_not_found(),
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Whether the caller may retry unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Catalog(CatalogError::Store(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DealError {
    fn from(err: serde_json::Error) -> Self {
        Self::Ledger(LedgerError::from(err))
    }
}
