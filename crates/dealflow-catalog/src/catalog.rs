//! Pipeline and stage administration
//!
//! Reads go through [`PipelineCache`]. Edits are serialized by an admin
//! lock, written to the entity stores, recorded in the history ledger and
//! then invalidate the cache. Callers that place deals into stages hold the
//! same lock shared (see [`PipelineCatalog::pin_definitions`]), so no stage
//! disappears between their validation and their commit.

use crate::cache::{CatalogConfig, PipelineCache};
use crate::error::CatalogError;
use dealflow_ledger::{
    diff, to_document, Document, EntityType, HistoryLedger, LogOptions, Operation,
};
use dealflow_model::{
    Actor, Deal, EntityStore, Pipeline, PipelineId, PipelineWithStages, Stage, StageId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Input for [`PipelineCatalog::create_pipeline`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPipeline {
    /// Name
    pub name: String,
    /// Organization types it applies to
    pub org_types: BTreeSet<String>,
    /// Make it the default pipeline
    pub is_default: bool,
}

impl NewPipeline {
    /// Pipeline with just a name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial pipeline edit; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineUpdate {
    /// New name
    pub name: Option<String>,
    /// Replacement org-type set
    pub org_types: Option<BTreeSet<String>>,
    /// New default flag
    pub is_default: Option<bool>,
}

/// Input for [`PipelineCatalog::create_stage`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStage {
    /// Name
    pub name: String,
    /// Explicit order; defaults to one past the current maximum
    pub order: Option<u32>,
    /// Closing stage
    pub is_closing: bool,
    /// Lost stage
    pub is_lost: bool,
    /// Advisory WIP limit
    pub wip_limit: Option<u32>,
    /// SLA target in hours
    pub sla_hours: Option<u32>,
}

impl NewStage {
    /// Plain stage appended at the end
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Place at an explicit order
    #[must_use]
    pub fn at(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    /// Mark as closing
    #[must_use]
    pub fn closing(mut self) -> Self {
        self.is_closing = true;
        self
    }

    /// Mark as lost
    #[must_use]
    pub fn lost(mut self) -> Self {
        self.is_lost = true;
        self
    }

    /// Set a WIP limit
    #[must_use]
    pub fn wip_limit(mut self, limit: u32) -> Self {
        self.wip_limit = Some(limit);
        self
    }
}

/// Partial stage edit; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageUpdate {
    /// New name
    pub name: Option<String>,
    /// New closing flag
    pub is_closing: Option<bool>,
    /// New lost flag
    pub is_lost: Option<bool>,
    /// New WIP limit (`Some(None)` clears it)
    pub wip_limit: Option<Option<u32>>,
    /// New SLA (`Some(None)` clears it)
    pub sla_hours: Option<Option<u32>>,
}

/// Occupancy of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLoad {
    /// Stage
    pub stage_id: StageId,
    /// Stage name
    pub name: String,
    /// Deals currently in the stage
    pub deals: usize,
    /// Configured limit
    pub wip_limit: Option<u32>,
}

impl StageLoad {
    /// Occupancy above the limit
    #[must_use]
    pub fn over_limit(&self) -> bool {
        self.wip_limit
            .is_some_and(|limit| self.deals > limit as usize)
    }
}

/// Owner of pipeline and stage definitions
#[derive(Debug)]
pub struct PipelineCatalog {
    pipelines: Arc<dyn EntityStore<Pipeline>>,
    stages: Arc<dyn EntityStore<Stage>>,
    deals: Arc<dyn EntityStore<Deal>>,
    ledger: Arc<HistoryLedger>,
    cache: PipelineCache,
    admin: RwLock<()>,
}

impl PipelineCatalog {
    /// Catalog over the given stores
    ///
    /// The deal store is only read, to check stage occupancy.
    #[must_use]
    pub fn new(
        pipelines: Arc<dyn EntityStore<Pipeline>>,
        stages: Arc<dyn EntityStore<Stage>>,
        deals: Arc<dyn EntityStore<Deal>>,
        ledger: Arc<HistoryLedger>,
        config: &CatalogConfig,
    ) -> Self {
        Self {
            pipelines,
            stages,
            deals,
            ledger,
            cache: PipelineCache::new(config),
            admin: RwLock::new(()),
        }
    }

    /// The ledger edits are recorded in
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.ledger
    }

    /// Hold off catalog edits until the guard is dropped
    ///
    /// Do not call catalog edit methods while holding it.
    pub async fn pin_definitions(&self) -> RwLockReadGuard<'_, ()> {
        self.admin.read().await
    }

    // ---- reads ---------------------------------------------------------

    /// Pipeline by id
    ///
    /// # Errors
    /// Returns [`CatalogError::PipelineNotFound`] if unknown
    pub async fn get(&self, id: PipelineId) -> Result<Pipeline, CatalogError> {
        Ok(self.get_with_stages(id).await?.pipeline.clone())
    }

    /// Stages of a pipeline sorted by order
    ///
    /// # Errors
    /// Returns [`CatalogError::PipelineNotFound`] if unknown
    pub async fn get_stages(&self, id: PipelineId) -> Result<Vec<Stage>, CatalogError> {
        Ok(self.get_with_stages(id).await?.stages.clone())
    }

    /// Pipeline and its sorted stages, served from cache when possible
    ///
    /// # Errors
    /// Returns [`CatalogError::PipelineNotFound`] if unknown
    pub async fn get_with_stages(
        &self,
        id: PipelineId,
    ) -> Result<Arc<PipelineWithStages>, CatalogError> {
        self.cache
            .try_get_or_load(id, || self.load_with_stages(id))
            .await
    }

    async fn load_with_stages(&self, id: PipelineId) -> Result<PipelineWithStages, CatalogError> {
        let pipeline = self
            .pipelines
            .get(id)
            .await?
            .ok_or(CatalogError::PipelineNotFound(id))?;
        let stages = self.stages_of(id).await?;
        tracing::debug!(pipeline = %id, stages = stages.len(), "Loaded pipeline");
        Ok(PipelineWithStages { pipeline, stages })
    }

    async fn stages_of(&self, id: PipelineId) -> Result<Vec<Stage>, CatalogError> {
        let mut stages = self
            .stages
            .list(&|s: &Stage| s.pipeline_id == id)
            .await?;
        stages.sort_by_key(|s| s.order);
        Ok(stages)
    }

    /// Every pipeline, in creation order
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>, CatalogError> {
        Ok(self.pipelines.list(&|_: &Pipeline| true).await?)
    }

    /// Pipelines applicable to an organization type
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn list_for_org_type(&self, org_type: &str) -> Result<Vec<Pipeline>, CatalogError> {
        let org_type = org_type.to_string();
        Ok(self
            .pipelines
            .list(&move |p: &Pipeline| p.applies_to(&org_type))
            .await?)
    }

    /// The default pipeline, if one is flagged
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn default_pipeline(&self) -> Result<Option<Pipeline>, CatalogError> {
        Ok(self
            .pipelines
            .list(&|p: &Pipeline| p.is_default)
            .await?
            .into_iter()
            .next())
    }

    /// Pipeline by name, ignoring ASCII case
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Pipeline>, CatalogError> {
        let name = name.trim().to_string();
        Ok(self
            .pipelines
            .list(&move |p: &Pipeline| p.name.eq_ignore_ascii_case(&name))
            .await?
            .into_iter()
            .next())
    }

    /// Stage by id
    ///
    /// # Errors
    /// Returns [`CatalogError::StageNotFound`] if unknown
    pub async fn get_stage(&self, id: StageId) -> Result<Stage, CatalogError> {
        self.stages.get(id).await?.ok_or(CatalogError::StageNotFound {
            stage_id: id,
            pipeline_id: None,
        })
    }

    /// Entry stage (lowest order) of a pipeline, `None` if it has no stages
    ///
    /// # Errors
    /// Returns [`CatalogError::PipelineNotFound`] if unknown
    pub async fn first_stage(&self, id: PipelineId) -> Result<Option<Stage>, CatalogError> {
        Ok(self.get_with_stages(id).await?.first_stage().cloned())
    }

    /// Per-stage occupancy against WIP limits
    ///
    /// Advisory only; moves are never blocked by a limit.
    ///
    /// # Errors
    /// Returns [`CatalogError::PipelineNotFound`] if unknown
    pub async fn wip_report(&self, id: PipelineId) -> Result<Vec<StageLoad>, CatalogError> {
        let view = self.get_with_stages(id).await?;
        let deals = self
            .deals
            .list(&move |d: &Deal| d.is_in_pipeline(id))
            .await?;
        Ok(view
            .stages
            .iter()
            .map(|stage| StageLoad {
                stage_id: stage.id,
                name: stage.name.clone(),
                deals: deals
                    .iter()
                    .filter(|d| d.stage_in(id) == Some(stage.id))
                    .count(),
                wip_limit: stage.wip_limit,
            })
            .collect())
    }

    // ---- pipeline edits ------------------------------------------------

    /// Create a pipeline with no stages
    ///
    /// # Errors
    /// Returns [`CatalogError::InvalidInput`] for a blank name
    #[tracing::instrument(skip(self, input, actor), fields(name = %input.name))]
    pub async fn create_pipeline(
        &self,
        input: NewPipeline,
        actor: &Actor,
    ) -> Result<Pipeline, CatalogError> {
        let name = non_blank(&input.name, "pipeline name")?;
        let _admin = self.admin.write().await;

        let mut pipeline = Pipeline::new(name, self.ledger.clock().now());
        pipeline.org_types = input.org_types;
        pipeline.is_default = input.is_default;
        if pipeline.is_default {
            self.clear_default(None, actor).await?;
        }

        let pipeline = self.pipelines.create(pipeline).await?;
        self.record_create(EntityType::PIPELINE, pipeline.id, &pipeline, actor)?;
        tracing::info!(pipeline = %pipeline.id, "Pipeline created");
        Ok(pipeline)
    }

    /// Edit name, org types or default flag
    ///
    /// # Errors
    /// Returns [`CatalogError::PipelineNotFound`] if unknown
    #[tracing::instrument(skip(self, update, actor), fields(pipeline = %id))]
    pub async fn update_pipeline(
        &self,
        id: PipelineId,
        update: PipelineUpdate,
        actor: &Actor,
    ) -> Result<Pipeline, CatalogError> {
        let _admin = self.admin.write().await;
        let before = self
            .pipelines
            .get(id)
            .await?
            .ok_or(CatalogError::PipelineNotFound(id))?;

        let mut after = before.clone();
        if let Some(name) = &update.name {
            after.name = non_blank(name, "pipeline name")?;
        }
        if let Some(org_types) = update.org_types {
            after.org_types = org_types;
        }
        if let Some(is_default) = update.is_default {
            if is_default && !before.is_default {
                self.clear_default(Some(id), actor).await?;
            }
            after.is_default = is_default;
        }
        after.updated_at = self.ledger.clock().now();

        let after = self.pipelines.update(after).await?;
        self.record_update(EntityType::PIPELINE, id, &before, &after, actor)?;
        self.cache.invalidate(&id).await;
        tracing::info!("Pipeline updated");
        Ok(after)
    }

    async fn clear_default(
        &self,
        keep: Option<PipelineId>,
        actor: &Actor,
    ) -> Result<(), CatalogError> {
        let flagged = self
            .pipelines
            .list(&move |p: &Pipeline| p.is_default && Some(p.id) != keep)
            .await?;
        for before in flagged {
            let mut after = before.clone();
            after.is_default = false;
            after.updated_at = self.ledger.clock().now();
            let after = self.pipelines.update(after).await?;
            self.record_update(EntityType::PIPELINE, after.id, &before, &after, actor)?;
            self.cache.invalidate(&after.id).await;
        }
        Ok(())
    }

    // ---- stage edits ---------------------------------------------------

    /// Add a stage to a pipeline
    ///
    /// Without an explicit order the stage goes one past the highest
    /// existing order. An explicit order already in use shifts that stage
    /// and every later one up by one.
    ///
    /// # Errors
    /// Returns [`CatalogError::ConflictingStageFlags`] for closing+lost,
    /// [`CatalogError::PipelineNotFound`] if the pipeline is unknown
    #[tracing::instrument(skip(self, input, actor), fields(pipeline = %pipeline_id, stage = %input.name))]
    pub async fn create_stage(
        &self,
        pipeline_id: PipelineId,
        input: NewStage,
        actor: &Actor,
    ) -> Result<Stage, CatalogError> {
        let name = non_blank(&input.name, "stage name")?;
        check_flags(&name, input.is_closing, input.is_lost)?;
        let _admin = self.admin.write().await;

        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .await?
            .ok_or(CatalogError::PipelineNotFound(pipeline_id))?;
        let existing = self.stages_of(pipeline_id).await?;
        let now = self.ledger.clock().now();

        let order = match input.order {
            Some(order) => {
                if existing.iter().any(|s| s.order == order) {
                    for stage in existing.iter().filter(|s| s.order >= order) {
                        let mut shifted = stage.clone();
                        shifted.order += 1;
                        shifted.updated_at = now;
                        let shifted = self.stages.update(shifted).await?;
                        self.record_update(EntityType::STAGE, shifted.id, stage, &shifted, actor)?;
                    }
                }
                order
            }
            None => existing.iter().map(|s| s.order + 1).max().unwrap_or(0),
        };

        let stage = self
            .stages
            .create(Stage {
                id: StageId::new(),
                pipeline_id,
                name,
                order,
                is_closing: input.is_closing,
                is_lost: input.is_lost,
                wip_limit: input.wip_limit,
                sla_hours: input.sla_hours,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.record_create(EntityType::STAGE, stage.id, &stage, actor)?;

        self.resync_stage_ids(pipeline, actor).await?;
        tracing::info!(stage_id = %stage.id, order, "Stage created");
        Ok(stage)
    }

    /// Edit a stage's name, flags, WIP limit or SLA
    ///
    /// # Errors
    /// Returns [`CatalogError::ConflictingStageFlags`] if the result would be
    /// closing and lost, [`CatalogError::StageNotFound`] if unknown
    #[tracing::instrument(skip(self, update, actor), fields(stage = %id))]
    pub async fn update_stage(
        &self,
        id: StageId,
        update: StageUpdate,
        actor: &Actor,
    ) -> Result<Stage, CatalogError> {
        let _admin = self.admin.write().await;
        let before = self.get_stage(id).await?;

        let mut after = before.clone();
        if let Some(name) = &update.name {
            after.name = non_blank(name, "stage name")?;
        }
        if let Some(is_closing) = update.is_closing {
            after.is_closing = is_closing;
        }
        if let Some(is_lost) = update.is_lost {
            after.is_lost = is_lost;
        }
        if let Some(wip_limit) = update.wip_limit {
            after.wip_limit = wip_limit;
        }
        if let Some(sla_hours) = update.sla_hours {
            after.sla_hours = sla_hours;
        }
        check_flags(&after.name, after.is_closing, after.is_lost)?;
        after.updated_at = self.ledger.clock().now();

        let after = self.stages.update(after).await?;
        self.record_update(EntityType::STAGE, id, &before, &after, actor)?;
        self.cache.invalidate(&after.pipeline_id).await;
        tracing::info!("Stage updated");
        Ok(after)
    }

    /// Delete an empty stage
    ///
    /// Remaining stages keep their order values.
    ///
    /// # Errors
    /// Returns [`CatalogError::StageHasActiveDeals`] if any deal is in it
    #[tracing::instrument(skip(self, actor), fields(stage = %id))]
    pub async fn delete_stage(&self, id: StageId, actor: &Actor) -> Result<(), CatalogError> {
        let _admin = self.admin.write().await;
        let stage = self.get_stage(id).await?;

        let pipeline_id = stage.pipeline_id;
        let occupied = self
            .deals
            .list(&move |d: &Deal| d.stage_in(pipeline_id) == Some(id))
            .await?
            .len();
        if occupied > 0 {
            return Err(CatalogError::StageHasActiveDeals {
                stage_id: id,
                deals: occupied,
            });
        }

        self.stages.remove(id).await?;
        self.ledger.log_entry(
            EntityType::STAGE,
            id.to_string(),
            Operation::Delete,
            actor.id.clone(),
            LogOptions::new().with_before(to_document(&stage)?),
        )?;

        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .await?
            .ok_or(CatalogError::PipelineNotFound(pipeline_id))?;
        self.resync_stage_ids(pipeline, actor).await?;
        tracing::info!(pipeline = %pipeline_id, "Stage deleted");
        Ok(())
    }

    /// Rewrite stage orders to `0..n` following `order`
    ///
    /// # Errors
    /// Returns [`CatalogError::InvalidStageSet`] unless `order` holds every
    /// stage of the pipeline exactly once
    #[tracing::instrument(skip(self, order, actor), fields(pipeline = %pipeline_id))]
    pub async fn reorder_stages(
        &self,
        pipeline_id: PipelineId,
        order: &[StageId],
        actor: &Actor,
    ) -> Result<Vec<Stage>, CatalogError> {
        let _admin = self.admin.write().await;
        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .await?
            .ok_or(CatalogError::PipelineNotFound(pipeline_id))?;
        let existing = self.stages_of(pipeline_id).await?;

        let wanted: HashSet<StageId> = order.iter().copied().collect();
        let have: HashSet<StageId> = existing.iter().map(|s| s.id).collect();
        if wanted.len() != order.len() || wanted != have {
            return Err(CatalogError::InvalidStageSet {
                pipeline_id,
                expected: existing.len(),
                given: order.len(),
            });
        }

        let now = self.ledger.clock().now();
        let mut reordered = Vec::with_capacity(order.len());
        for (position, stage_id) in (0u32..).zip(order) {
            let Some(before) = existing.iter().find(|s| s.id == *stage_id) else {
                continue;
            };
            if before.order == position {
                reordered.push(before.clone());
                continue;
            }
            let mut after = before.clone();
            after.order = position;
            after.updated_at = now;
            let after = self.stages.update(after).await?;
            self.record_update(EntityType::STAGE, after.id, before, &after, actor)?;
            reordered.push(after);
        }

        self.resync_stage_ids(pipeline, actor).await?;
        tracing::info!(stages = reordered.len(), "Stages reordered");
        Ok(reordered)
    }

    /// Bring `pipeline.stage_ids` in line with the stored stage orders
    async fn resync_stage_ids(&self, before: Pipeline, actor: &Actor) -> Result<(), CatalogError> {
        let stage_ids: Vec<StageId> = self
            .stages_of(before.id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if stage_ids != before.stage_ids {
            let mut after = before.clone();
            after.stage_ids = stage_ids;
            after.updated_at = self.ledger.clock().now();
            let after = self.pipelines.update(after).await?;
            self.record_update(EntityType::PIPELINE, after.id, &before, &after, actor)?;
        }
        self.cache.invalidate(&before.id).await;
        Ok(())
    }

    // ---- ledger --------------------------------------------------------

    fn record_create<T: Serialize>(
        &self,
        entity_type: EntityType,
        id: impl ToString,
        entity: &T,
        actor: &Actor,
    ) -> Result<(), CatalogError> {
        self.ledger.log_entry(
            entity_type,
            id.to_string(),
            Operation::Create,
            actor.id.clone(),
            LogOptions::new().with_after(to_document(entity)?),
        )?;
        Ok(())
    }

    fn record_update<T: Serialize>(
        &self,
        entity_type: EntityType,
        id: impl ToString,
        before: &T,
        after: &T,
        actor: &Actor,
    ) -> Result<(), CatalogError> {
        let before = to_document(before)?;
        let after = to_document(after)?;
        self.ledger.log_entry(
            entity_type,
            id.to_string(),
            Operation::Update,
            actor.id.clone(),
            LogOptions::new()
                .with_changed_fields(changed_fields(&before, &after))
                .with_before(before)
                .with_after(after),
        )?;
        Ok(())
    }
}

fn changed_fields(before: &Document, after: &Document) -> Vec<String> {
    diff(before, after)
        .iter()
        .map(|c| c.field().to_string())
        .collect()
}

fn non_blank(value: &str, what: &str) -> Result<String, CatalogError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::InvalidInput(format!("{what} is empty")));
    }
    Ok(trimmed.to_string())
}

fn check_flags(name: &str, is_closing: bool, is_lost: bool) -> Result<(), CatalogError> {
    if is_closing && is_lost {
        return Err(CatalogError::ConflictingStageFlags {
            name: name.to_string(),
        });
    }
    Ok(())
}
