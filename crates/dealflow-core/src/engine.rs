//! In-process wiring of ledger, catalog and stage machine

use crate::config::{ConfigError, DealflowConfig};
use crate::machine::DealStageMachine;
use dealflow_catalog::PipelineCatalog;
use dealflow_ledger::{Clock, HistoryLedger, LedgerAnalytics, ReconstructionEngine};
use dealflow_model::{Deal, InMemoryStore, Pipeline, Stage};
use std::sync::Arc;

/// One ledger shared by a catalog and a stage machine over in-memory stores
#[derive(Debug)]
pub struct Dealflow {
    /// Configuration the parts were built from
    pub config: DealflowConfig,
    /// Shared history ledger
    pub ledger: Arc<HistoryLedger>,
    /// Pipeline catalog
    pub catalog: Arc<PipelineCatalog>,
    /// Deal store
    pub deals: Arc<InMemoryStore<Deal>>,
    /// Stage machine
    pub machine: DealStageMachine,
}

impl Dealflow {
    /// Fresh ledger and empty stores
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub fn in_memory(config: DealflowConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let ledger = Arc::new(HistoryLedger::with_parts(config.ledger.checksummer()?, clock));
        Ok(Self::with_ledger(config, ledger))
    }

    /// Empty stores around an existing ledger
    #[must_use]
    pub fn with_ledger(config: DealflowConfig, ledger: Arc<HistoryLedger>) -> Self {
        let deals = Arc::new(InMemoryStore::<Deal>::new());
        let catalog = Arc::new(PipelineCatalog::new(
            Arc::new(InMemoryStore::<Pipeline>::new()),
            Arc::new(InMemoryStore::<Stage>::new()),
            deals.clone(),
            ledger.clone(),
            &config.catalog,
        ));
        let machine = DealStageMachine::new(deals.clone(), catalog.clone(), ledger.clone())
            .with_auto_spawn(config.auto_spawn.clone());
        Self {
            config,
            ledger,
            catalog,
            deals,
            machine,
        }
    }

    /// Point-in-time views over the ledger
    #[must_use]
    pub fn reconstruction(&self) -> ReconstructionEngine {
        ReconstructionEngine::new(self.ledger.clone())
    }

    /// Statistics over the ledger
    #[must_use]
    pub fn analytics(&self) -> LedgerAnalytics {
        LedgerAnalytics::new(self.ledger.clone())
    }
}
