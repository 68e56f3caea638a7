//! Deal stage transitions
//!
//! [`DealStageMachine::move_stage`] validates a target (pipeline, stage),
//! appends to the deal's stage history, derives the new status, enrolls the
//! deal in a follow-on pipeline when a closing stage matches an auto-spawn
//! rule, repositions it on the board if asked, records the change in the
//! history ledger and finally emits activity events.
//!
//! Each mutation runs under the deal's lock. All validation happens before
//! anything is written, so a failed call leaves the deal untouched.

use crate::config::AutoSpawnRule;
use crate::error::DealError;
use crate::locks::DealLocks;
use crate::ordering::DealOrderingIndex;
use dealflow_catalog::{CatalogError, PipelineCatalog};
use dealflow_ledger::{
    diff, to_document, EntityType, EntryMetadata, HistoryLedger, LogOptions, Operation,
};
use dealflow_model::{
    Action, Activity, ActivityKind, ActivitySink, Actor, AllowAll, CapabilityCheck, Deal,
    DealId, DealStatus, EntityStore, NewDeal, NoopActivitySink, Pipeline, PipelineId,
    StageHistoryEntry, StageId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Target of [`DealStageMachine::move_stage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveStage {
    /// Pipeline to move within (or enter)
    pub pipeline_id: PipelineId,
    /// Stage to enter
    pub to_stage_id: StageId,
    /// Free text stored on the history entry
    pub note: Option<String>,
    /// Required when the stage is a lost stage
    pub loss_reason: Option<String>,
    /// Position inside the destination stage's board column
    pub target_index: Option<usize>,
}

impl MoveStage {
    /// Move into a stage
    #[must_use]
    pub fn new(pipeline_id: PipelineId, to_stage_id: StageId) -> Self {
        Self {
            pipeline_id,
            to_stage_id,
            note: None,
            loss_reason: None,
            target_index: None,
        }
    }

    /// Attach a note
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Supply a loss reason
    #[must_use]
    pub fn with_loss_reason(mut self, reason: impl Into<String>) -> Self {
        self.loss_reason = Some(reason.into());
        self
    }

    /// Place at a board position
    #[must_use]
    pub fn at_index(mut self, index: usize) -> Self {
        self.target_index = Some(index);
        self
    }
}

struct FollowOn {
    pipeline: Pipeline,
    stage_id: StageId,
}

/// Orchestrates deal stage membership, status and history
#[derive(Debug)]
pub struct DealStageMachine {
    deals: Arc<dyn EntityStore<Deal>>,
    catalog: Arc<PipelineCatalog>,
    ledger: Arc<HistoryLedger>,
    ordering: DealOrderingIndex,
    locks: DealLocks,
    capabilities: Arc<dyn CapabilityCheck>,
    activity: Arc<dyn ActivitySink>,
    auto_spawn: Vec<AutoSpawnRule>,
}

impl DealStageMachine {
    /// Machine with permissive capabilities, no activity sink and no
    /// auto-spawn rules
    #[must_use]
    pub fn new(
        deals: Arc<dyn EntityStore<Deal>>,
        catalog: Arc<PipelineCatalog>,
        ledger: Arc<HistoryLedger>,
    ) -> Self {
        Self {
            deals,
            catalog,
            ledger,
            ordering: DealOrderingIndex::new(),
            locks: DealLocks::new(),
            capabilities: Arc::new(AllowAll),
            activity: Arc::new(NoopActivitySink),
            auto_spawn: Vec::new(),
        }
    }

    /// Use a capability check
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityCheck>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Use an activity sink
    #[must_use]
    pub fn with_activity_sink(mut self, activity: Arc<dyn ActivitySink>) -> Self {
        self.activity = activity;
        self
    }

    /// Use auto-spawn rules
    #[must_use]
    pub fn with_auto_spawn(mut self, rules: Vec<AutoSpawnRule>) -> Self {
        self.auto_spawn = rules;
        self
    }

    /// The catalog stages are validated against
    #[inline]
    #[must_use]
    pub fn catalog(&self) -> &Arc<PipelineCatalog> {
        &self.catalog
    }

    /// The ledger transitions are recorded in
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.ledger
    }

    /// The board ordering index
    #[inline]
    #[must_use]
    pub fn ordering(&self) -> &DealOrderingIndex {
        &self.ordering
    }

    // ---- reads ---------------------------------------------------------

    /// Deal by id
    ///
    /// # Errors
    /// Returns [`DealError::DealNotFound`] if unknown
    pub async fn get(&self, id: DealId) -> Result<Deal, DealError> {
        self.deals.get(id).await?.ok_or(DealError::DealNotFound(id))
    }

    /// Deals with membership in a pipeline, optionally in one stage
    ///
    /// Linear scan over all deals, in store order.
    ///
    /// # Errors
    /// Returns error if the store fails
    pub async fn get_by_pipeline_and_stage(
        &self,
        pipeline_id: PipelineId,
        stage_id: Option<StageId>,
    ) -> Result<Vec<Deal>, DealError> {
        let deals = self
            .deals
            .list(&move |d: &Deal| match stage_id {
                Some(stage_id) => d.stage_in(pipeline_id) == Some(stage_id),
                None => d.is_in_pipeline(pipeline_id),
            })
            .await?;
        tracing::debug!(pipeline = %pipeline_id, count = deals.len(), "Listed deals");
        Ok(deals)
    }

    /// One board column in display order
    ///
    /// # Errors
    /// Returns a catalog error if the stage is not part of the pipeline
    pub async fn board(
        &self,
        pipeline_id: PipelineId,
        stage_id: StageId,
    ) -> Result<Vec<Deal>, DealError> {
        let view = self.catalog.get_with_stages(pipeline_id).await?;
        if view.stage(stage_id).is_none() {
            return Err(CatalogError::stage_in(stage_id, pipeline_id).into());
        }
        let bucket = self
            .get_by_pipeline_and_stage(pipeline_id, Some(stage_id))
            .await?;
        Ok(self.ordering.arrange(pipeline_id, bucket))
    }

    /// A deal's stage history, oldest first, optionally for one pipeline
    ///
    /// # Errors
    /// Returns [`DealError::DealNotFound`] if unknown
    pub async fn stage_history(
        &self,
        deal_id: DealId,
        pipeline_id: Option<PipelineId>,
    ) -> Result<Vec<StageHistoryEntry>, DealError> {
        let deal = self.get(deal_id).await?;
        Ok(match pipeline_id {
            Some(pipeline_id) => deal.history_in(pipeline_id).cloned().collect(),
            None => deal.stage_history,
        })
    }

    // ---- mutations -----------------------------------------------------

    /// Create an open deal with no pipeline membership
    ///
    /// # Errors
    /// Returns [`DealError::InvalidInput`] for a blank title,
    /// [`DealError::PermissionDenied`] if the actor may not create deals
    #[tracing::instrument(skip(self, input, actor), fields(actor = %actor))]
    pub async fn create_deal(&self, input: NewDeal, actor: &Actor) -> Result<Deal, DealError> {
        self.authorize(actor, Action::Create, None)?;
        if input.title.trim().is_empty() {
            return Err(DealError::InvalidInput("deal title is empty".into()));
        }

        let deal = Deal::new(input, self.ledger.clock().now());
        let entry = LogOptions::new().with_after(to_document(&deal)?);
        let deal = self.deals.create(deal).await?;
        self.append(deal.id, Operation::Create, actor, entry);
        tracing::info!(deal = %deal.id, "Deal created");

        self.emit(Activity::new(
            EntityType::DEAL,
            deal.id.to_string(),
            ActivityKind::DealCreated,
            format!("Deal '{}' created", deal.title),
        ))
        .await;
        Ok(deal)
    }

    /// Create a deal and place it in a pipeline
    ///
    /// Enters `stage_id`, or the pipeline's first stage when `None`.
    ///
    /// # Errors
    /// Returns the errors of [`create_deal`](Self::create_deal) and
    /// [`move_stage`](Self::move_stage); a missing stage is checked before
    /// the deal is created
    pub async fn create_deal_in(
        &self,
        input: NewDeal,
        pipeline_id: PipelineId,
        stage_id: Option<StageId>,
        actor: &Actor,
    ) -> Result<Deal, DealError> {
        let view = self.catalog.get_with_stages(pipeline_id).await?;
        let stage_id = match stage_id {
            Some(id) => view
                .stage(id)
                .map(|s| s.id)
                .ok_or(CatalogError::stage_in(id, pipeline_id))?,
            None => view
                .first_stage()
                .map(|s| s.id)
                .ok_or_else(|| {
                    CatalogError::InvalidInput(format!("pipeline {pipeline_id} has no stages"))
                })?,
        };
        let deal = self.create_deal(input, actor).await?;
        self.move_stage(deal.id, MoveStage::new(pipeline_id, stage_id), actor)
            .await
    }

    /// Move a deal into a stage
    ///
    /// Appends one history entry, or two when a closing stage triggers an
    /// auto-spawn into a follow-on pipeline the deal is not yet in. A
    /// closing stage sets WON; a lost stage sets LOST and requires a loss
    /// reason. Moves are never deduplicated.
    ///
    /// # Errors
    /// Returns [`DealError::DealNotFound`], a catalog not-found error,
    /// [`DealError::LossReasonRequired`] or [`DealError::PermissionDenied`];
    /// the deal is unchanged in every case
    #[tracing::instrument(
        skip(self, request, actor),
        fields(pipeline = %request.pipeline_id, stage = %request.to_stage_id, actor = %actor)
    )]
    pub async fn move_stage(
        &self,
        deal_id: DealId,
        request: MoveStage,
        actor: &Actor,
    ) -> Result<Deal, DealError> {
        self.authorize(actor, Action::Update, Some(deal_id))?;
        let guard = self.locks.lock(deal_id).await;
        let definitions = self.catalog.pin_definitions().await;

        let mut deal = self.get(deal_id).await?;
        let view = self.catalog.get_with_stages(request.pipeline_id).await?;
        if view.stage(request.to_stage_id).is_none() {
            return Err(CatalogError::stage_in(request.to_stage_id, request.pipeline_id).into());
        }
        let stage = self.catalog.get_stage(request.to_stage_id).await?;
        if stage.pipeline_id != view.pipeline.id {
            return Err(CatalogError::stage_in(stage.id, view.pipeline.id).into());
        }
        let loss_reason = if stage.is_lost {
            Some(
                non_blank(request.loss_reason.as_deref()).ok_or(DealError::LossReasonRequired {
                    deal_id,
                    stage_id: Some(stage.id),
                })?,
            )
        } else {
            None
        };
        let follow_on = if stage.is_closing {
            self.plan_follow_on(&view.pipeline, &deal).await
        } else {
            Vec::new()
        };

        let before = deal.clone();
        let now = self.ledger.clock().now();
        let from_stage_id = deal.stage_in(view.pipeline.id);
        deal.enter_stage(
            view.pipeline.id,
            stage.id,
            now,
            Some(actor.id.clone()),
            request.note.clone(),
            false,
        );

        let mut events = vec![Activity::new(
            EntityType::DEAL,
            deal_id.to_string(),
            ActivityKind::StageMoved,
            format!("Moved to {} in {}", stage.name, view.pipeline.name),
        )
        .with("pipeline_id", view.pipeline.id.to_string())
        .with("from_stage_id", from_stage_id.map(|id| id.to_string()))
        .with("to_stage_id", stage.id.to_string())];

        if stage.is_closing {
            deal.status = DealStatus::Won;
            deal.loss_reason = None;
            deal.closed_at = Some(deal.updated_at);
            events.push(
                Activity::new(
                    EntityType::DEAL,
                    deal_id.to_string(),
                    ActivityKind::DealWon,
                    format!("Won in {}", view.pipeline.name),
                )
                .with("pipeline_id", view.pipeline.id.to_string()),
            );
            for target in follow_on {
                deal.enter_stage(
                    target.pipeline.id,
                    target.stage_id,
                    now,
                    Some(actor.id.clone()),
                    Some(format!("Auto-enrolled after closing in {}", view.pipeline.name)),
                    true,
                );
                tracing::info!(follow_on = %target.pipeline.id, "Deal auto-enrolled");
                events.push(
                    Activity::new(
                        EntityType::DEAL,
                        deal_id.to_string(),
                        ActivityKind::AutoEnrolled,
                        format!("Auto-enrolled in {}", target.pipeline.name),
                    )
                    .with("pipeline_id", target.pipeline.id.to_string())
                    .with("stage_id", target.stage_id.to_string()),
                );
            }
        } else if let Some(reason) = loss_reason {
            deal.status = DealStatus::Lost;
            deal.closed_at = Some(deal.updated_at);
            events.push(
                Activity::new(
                    EntityType::DEAL,
                    deal_id.to_string(),
                    ActivityKind::DealLost,
                    format!("Lost in {}: {reason}", view.pipeline.name),
                )
                .with("pipeline_id", view.pipeline.id.to_string())
                .with("reason", reason.clone()),
            );
            deal.loss_reason = Some(reason);
        }

        // Everything fallible happens before the store write
        let bucket = match request.target_index {
            Some(_) => {
                let mut bucket = self
                    .get_by_pipeline_and_stage(view.pipeline.id, Some(stage.id))
                    .await?;
                bucket.retain(|d| d.id != deal_id);
                bucket.push(deal.clone());
                Some(bucket)
            }
            None => None,
        };
        let metadata = deal.loss_reason.clone().filter(|_| stage.is_lost).map(EntryMetadata::reason);
        let entry = update_entry(&before, &deal, metadata)?;

        let deal = self.deals.update(deal).await?;
        self.append(deal_id, Operation::Update, actor, entry);
        if let (Some(index), Some(bucket)) = (request.target_index, bucket) {
            self.ordering
                .reposition(view.pipeline.id, bucket, deal_id, index, now);
        }
        drop(definitions);
        drop(guard);

        tracing::info!(
            deal = %deal_id,
            status = %deal.status,
            history = deal.stage_history.len(),
            "Deal moved"
        );
        for event in events {
            self.emit(event).await;
        }
        Ok(deal)
    }

    /// Reposition a deal inside its current board column
    ///
    /// Only the position changes; the deal stays in its stage.
    ///
    /// # Errors
    /// Returns [`DealError::NotInPipeline`] if the deal has no membership there
    #[tracing::instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn reorder(
        &self,
        deal_id: DealId,
        pipeline_id: PipelineId,
        target_index: usize,
        actor: &Actor,
    ) -> Result<Vec<DealId>, DealError> {
        self.authorize(actor, Action::Update, Some(deal_id))?;
        let _guard = self.locks.lock(deal_id).await;

        let deal = self.get(deal_id).await?;
        let stage_id = deal
            .stage_in(pipeline_id)
            .ok_or(DealError::NotInPipeline { deal_id, pipeline_id })?;
        let bucket = self
            .get_by_pipeline_and_stage(pipeline_id, Some(stage_id))
            .await?;
        Ok(self.ordering.reposition(
            pipeline_id,
            bucket,
            deal_id,
            target_index,
            self.ledger.clock().now(),
        ))
    }

    /// Set a deal's status directly, e.g. to reopen or put on hold
    ///
    /// LOST requires a reason. OPEN and ON_HOLD clear the close time and
    /// loss reason. Pipeline membership is not touched.
    ///
    /// # Errors
    /// Returns [`DealError::LossReasonRequired`] for LOST without a reason
    #[tracing::instrument(skip(self, reason, actor), fields(actor = %actor))]
    pub async fn set_status(
        &self,
        deal_id: DealId,
        status: DealStatus,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<Deal, DealError> {
        self.authorize(actor, Action::Update, Some(deal_id))?;
        let reason = non_blank(reason.as_deref());
        if status == DealStatus::Lost && reason.is_none() {
            return Err(DealError::LossReasonRequired {
                deal_id,
                stage_id: None,
            });
        }
        let guard = self.locks.lock(deal_id).await;

        let mut deal = self.get(deal_id).await?;
        let before = deal.clone();
        let now = self.ledger.clock().now().max(deal.updated_at);
        deal.status = status;
        deal.updated_at = now;
        match status {
            DealStatus::Lost => {
                deal.loss_reason.clone_from(&reason);
                deal.closed_at = Some(now);
            }
            DealStatus::Won | DealStatus::Abandoned => {
                deal.loss_reason = None;
                deal.closed_at = Some(now);
            }
            DealStatus::Open | DealStatus::OnHold => {
                deal.loss_reason = None;
                deal.closed_at = None;
            }
        }

        let entry = update_entry(&before, &deal, reason.clone().map(EntryMetadata::reason))?;
        let deal = self.deals.update(deal).await?;
        self.append(deal_id, Operation::Update, actor, entry);
        drop(guard);
        tracing::info!(deal = %deal_id, from = %before.status, to = %status, "Deal status set");

        let kind = match status {
            DealStatus::Won => Some(ActivityKind::DealWon),
            DealStatus::Lost => Some(ActivityKind::DealLost),
            _ => None,
        };
        if let Some(kind) = kind {
            let mut event = Activity::new(
                EntityType::DEAL,
                deal_id.to_string(),
                kind,
                format!("Marked {status}"),
            );
            if let Some(reason) = reason {
                event = event.with("reason", reason);
            }
            self.emit(event).await;
        }
        Ok(deal)
    }

    /// Drop a deal's membership in one pipeline; its history is kept
    ///
    /// # Errors
    /// Returns [`DealError::NotInPipeline`] if there is no such membership
    #[tracing::instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn remove_from_pipeline(
        &self,
        deal_id: DealId,
        pipeline_id: PipelineId,
        actor: &Actor,
    ) -> Result<Deal, DealError> {
        self.authorize(actor, Action::Update, Some(deal_id))?;
        let _guard = self.locks.lock(deal_id).await;

        let mut deal = self.get(deal_id).await?;
        let before = deal.clone();
        if deal.memberships.remove(&pipeline_id).is_none() {
            return Err(DealError::NotInPipeline { deal_id, pipeline_id });
        }
        deal.updated_at = self.ledger.clock().now().max(deal.updated_at);

        let entry = update_entry(&before, &deal, None)?;
        let deal = self.deals.update(deal).await?;
        self.append(deal_id, Operation::Update, actor, entry);
        self.ordering.forget(pipeline_id, deal_id);
        tracing::info!(deal = %deal_id, pipeline = %pipeline_id, "Deal removed from pipeline");
        Ok(deal)
    }

    // ---- helpers -------------------------------------------------------

    fn authorize(
        &self,
        actor: &Actor,
        action: Action,
        deal_id: Option<DealId>,
    ) -> Result<(), DealError> {
        if actor.id.trim().is_empty() {
            return Err(DealError::InvalidInput("actor id is empty".into()));
        }
        let entity_id = deal_id.map(|id| id.to_string());
        if self
            .capabilities
            .can_perform(actor, &EntityType::DEAL, action, entity_id.as_deref())
        {
            Ok(())
        } else {
            tracing::debug!(actor = %actor, ?action, "Capability check denied");
            Err(DealError::PermissionDenied {
                actor: actor.id.clone(),
                action,
                entity_type: EntityType::DEAL,
            })
        }
    }

    /// Follow-on pipelines a closing move in `pipeline` enrolls the deal in
    ///
    /// Best effort: anything missing is logged and skipped.
    async fn plan_follow_on(&self, pipeline: &Pipeline, deal: &Deal) -> Vec<FollowOn> {
        let mut targets: Vec<FollowOn> = Vec::new();
        for rule in self.auto_spawn.iter().filter(|r| r.applies_to(&pipeline.name)) {
            let follow = match self.catalog.find_by_name(&rule.follow_on_pipeline).await {
                Ok(Some(follow)) => follow,
                Ok(None) => {
                    tracing::warn!(
                        follow_on = %rule.follow_on_pipeline,
                        "Follow-on pipeline not found, skipping auto-enroll"
                    );
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%error, "Follow-on lookup failed, skipping auto-enroll");
                    continue;
                }
            };
            if follow.id == pipeline.id
                || deal.is_in_pipeline(follow.id)
                || targets.iter().any(|t| t.pipeline.id == follow.id)
            {
                tracing::debug!(follow_on = %follow.id, "Already enrolled, skipping auto-enroll");
                continue;
            }
            match self.catalog.first_stage(follow.id).await {
                Ok(Some(stage)) => targets.push(FollowOn {
                    pipeline: follow,
                    stage_id: stage.id,
                }),
                Ok(None) => tracing::warn!(
                    follow_on = %follow.id,
                    "Follow-on pipeline has no stages, skipping auto-enroll"
                ),
                Err(error) => {
                    tracing::warn!(%error, "Follow-on stage lookup failed, skipping auto-enroll");
                }
            }
        }
        targets
    }

    /// Record a change to a deal that is already stored
    ///
    /// Entity and actor ids are checked up front, so the ledger has no
    /// grounds to reject the entry; a failure is logged, not returned, since
    /// the change itself is committed.
    fn append(&self, deal_id: DealId, operation: Operation, actor: &Actor, entry: LogOptions) {
        if let Err(error) = self.ledger.log_entry(
            EntityType::DEAL,
            deal_id.to_string(),
            operation,
            actor.id.clone(),
            entry,
        ) {
            tracing::error!(deal = %deal_id, %error, "Ledger rejected a committed deal change");
        }
    }

    async fn emit(&self, activity: Activity) {
        let kind = activity.kind;
        if let Err(error) = self.activity.record(activity).await {
            tracing::warn!(%error, %kind, "Activity sink failed, continuing");
        }
    }
}

/// Ledger options for an UPDATE from `before` to `after`
fn update_entry(
    before: &Deal,
    after: &Deal,
    metadata: Option<EntryMetadata>,
) -> Result<LogOptions, DealError> {
    let before = to_document(before)?;
    let after = to_document(after)?;
    let changed: Vec<String> = diff(&before, &after)
        .iter()
        .map(|c| c.field().to_string())
        .collect();
    let mut options = LogOptions::new()
        .with_changed_fields(changed)
        .with_before(before)
        .with_after(after);
    if let Some(metadata) = metadata {
        options = options.with_metadata(metadata);
    }
    Ok(options)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DealflowConfig;
    use crate::engine::Dealflow;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use dealflow_catalog::{NewPipeline, NewStage};
    use dealflow_ledger::{HistoryQuery, ManualClock};
    use dealflow_model::{ActivityError, Stage};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<ActivityKind>>,
        fail: bool,
    }

    #[async_trait]
    impl ActivitySink for Recorder {
        async fn record(&self, activity: Activity) -> Result<(), ActivityError> {
            self.seen.lock().push(activity.kind);
            if self.fail {
                return Err(ActivityError("timeline offline".into()));
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct ReadOnly;

    impl CapabilityCheck for ReadOnly {
        fn can_perform(&self, _: &Actor, _: &EntityType, action: Action, _: Option<&str>) -> bool {
            action == Action::Read
        }
    }

    struct Setup {
        app: Dealflow,
        clock: Arc<ManualClock>,
        actor: Actor,
        pipeline: PipelineId,
        lead: Stage,
        won: Stage,
        lost: Stage,
    }

    async fn setup() -> Setup {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap(),
        ));
        let app = Dealflow::in_memory(DealflowConfig::default(), clock.clone()).unwrap();
        let actor = Actor::new("rep-1");
        let pipeline = app
            .catalog
            .create_pipeline(NewPipeline::named("Sales"), &actor)
            .await
            .unwrap()
            .id;
        let lead = app
            .catalog
            .create_stage(pipeline, NewStage::named("Lead"), &actor)
            .await
            .unwrap();
        let won = app
            .catalog
            .create_stage(pipeline, NewStage::named("Won").closing(), &actor)
            .await
            .unwrap();
        let lost = app
            .catalog
            .create_stage(pipeline, NewStage::named("Lost").lost(), &actor)
            .await
            .unwrap();
        Setup {
            app,
            clock,
            actor,
            pipeline,
            lead,
            won,
            lost,
        }
    }

    impl Setup {
        async fn deal(&self, title: &str) -> Deal {
            self.clock.advance(Duration::minutes(1));
            self.app
                .machine
                .create_deal_in(NewDeal::titled(title), self.pipeline, None, &self.actor)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn first_entry_has_no_from_stage() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        assert_eq!(deal.stage_history.len(), 1);
        assert_eq!(deal.stage_history[0].from_stage_id, None);
        assert_eq!(deal.stage_in(s.pipeline), Some(s.lead.id));
        assert_eq!(deal.status, DealStatus::Open);
    }

    #[tokio::test]
    async fn lost_without_reason_changes_nothing() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        let ledger_len = s.app.ledger.len();

        for reason in [None, Some("   ")] {
            let mut request = MoveStage::new(s.pipeline, s.lost.id);
            request.loss_reason = reason.map(str::to_string);
            let err = s
                .app
                .machine
                .move_stage(deal.id, request, &s.actor)
                .await
                .unwrap_err();
            assert!(matches!(err, DealError::LossReasonRequired { .. }));
        }

        assert_eq!(s.app.machine.get(deal.id).await.unwrap(), deal);
        assert_eq!(s.app.ledger.len(), ledger_len);
    }

    #[tokio::test]
    async fn closing_stage_wins_and_records_ledger_update() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        let deal = s
            .app
            .machine
            .move_stage(deal.id, MoveStage::new(s.pipeline, s.won.id), &s.actor)
            .await
            .unwrap();
        assert_eq!(deal.status, DealStatus::Won);
        assert!(deal.closed_at.is_some());

        let latest = s
            .app
            .ledger
            .get_history(&HistoryQuery::for_entity(EntityType::DEAL, deal.id.to_string()).limit(1));
        assert_eq!(latest[0].operation, Operation::Update);
        let changed = latest[0].changed_fields.clone().unwrap();
        assert!(changed.contains(&"status".to_string()));
        assert!(changed.contains(&"memberships".to_string()));
        assert_eq!(latest[0].after.as_ref().unwrap()["status"], "WON");
        assert_eq!(latest[0].before.as_ref().unwrap()["status"], "OPEN");
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let s = setup().await;
        let deal = s.deal("Acme").await;

        let err = s
            .app
            .machine
            .move_stage(DealId::new(), MoveStage::new(s.pipeline, s.lead.id), &s.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::DealNotFound(_)));

        let err = s
            .app
            .machine
            .move_stage(deal.id, MoveStage::new(PipelineId::new(), s.lead.id), &s.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::Catalog(CatalogError::PipelineNotFound(_))));

        let err = s
            .app
            .machine
            .move_stage(deal.id, MoveStage::new(s.pipeline, StageId::new()), &s.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::Catalog(CatalogError::StageNotFound { .. })));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn capability_check_guards_mutations() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let app = Dealflow::in_memory(DealflowConfig::default(), clock).unwrap();
        let machine = DealStageMachine::new(app.deals.clone(), app.catalog.clone(), app.ledger.clone())
            .with_capabilities(Arc::new(ReadOnly));
        let err = machine
            .create_deal(NewDeal::titled("Acme"), &Actor::new("viewer"))
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::PermissionDenied { action: Action::Create, .. }));
        assert!(app.ledger.is_empty());
    }

    #[tokio::test]
    async fn failing_activity_sink_does_not_fail_move() {
        let s = setup().await;
        let sink = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let machine = DealStageMachine::new(
            s.app.deals.clone(),
            s.app.catalog.clone(),
            s.app.ledger.clone(),
        )
        .with_activity_sink(sink.clone());
        let deal = s.deal("Acme").await;

        let moved = machine
            .move_stage(
                deal.id,
                MoveStage::new(s.pipeline, s.lost.id).with_loss_reason("PRICE"),
                &s.actor,
            )
            .await
            .unwrap();
        assert_eq!(moved.status, DealStatus::Lost);
        assert_eq!(
            *sink.seen.lock(),
            vec![ActivityKind::StageMoved, ActivityKind::DealLost]
        );
    }

    #[tokio::test]
    async fn set_status_reopens_and_requires_reason_for_lost() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        let machine = &s.app.machine;

        let err = machine
            .set_status(deal.id, DealStatus::Lost, None, &s.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::LossReasonRequired { stage_id: None, .. }));

        let lost = machine
            .set_status(deal.id, DealStatus::Lost, Some("BUDGET".into()), &s.actor)
            .await
            .unwrap();
        assert_eq!(lost.loss_reason.as_deref(), Some("BUDGET"));
        assert!(lost.closed_at.is_some());

        let reopened = machine
            .set_status(deal.id, DealStatus::Open, None, &s.actor)
            .await
            .unwrap();
        assert_eq!(reopened.status, DealStatus::Open);
        assert_eq!(reopened.loss_reason, None);
        assert_eq!(reopened.closed_at, None);
        assert_eq!(reopened.stage_history, deal.stage_history);
    }

    #[tokio::test]
    async fn remove_from_pipeline_keeps_history() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        let machine = &s.app.machine;

        let removed = machine
            .remove_from_pipeline(deal.id, s.pipeline, &s.actor)
            .await
            .unwrap();
        assert!(removed.memberships.is_empty());
        assert_eq!(removed.stage_history.len(), 1);

        let err = machine
            .remove_from_pipeline(deal.id, s.pipeline, &s.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::NotInPipeline { .. }));
        assert!(machine
            .get_by_pipeline_and_stage(s.pipeline, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn board_order_follows_reorder_and_move_index() {
        let s = setup().await;
        let a = s.deal("a").await;
        let b = s.deal("b").await;
        let c = s.deal("c").await;
        let machine = &s.app.machine;

        let titles = |deals: Vec<Deal>| deals.into_iter().map(|d| d.title).collect::<Vec<_>>();
        assert_eq!(titles(machine.board(s.pipeline, s.lead.id).await.unwrap()), ["a", "b", "c"]);

        machine.reorder(c.id, s.pipeline, 0, &s.actor).await.unwrap();
        assert_eq!(titles(machine.board(s.pipeline, s.lead.id).await.unwrap()), ["c", "a", "b"]);

        machine.reorder(c.id, s.pipeline, 99, &s.actor).await.unwrap();
        assert_eq!(titles(machine.board(s.pipeline, s.lead.id).await.unwrap()), ["a", "b", "c"]);

        machine
            .move_stage(a.id, MoveStage::new(s.pipeline, s.won.id), &s.actor)
            .await
            .unwrap();
        machine
            .move_stage(b.id, MoveStage::new(s.pipeline, s.won.id).at_index(0), &s.actor)
            .await
            .unwrap();
        assert_eq!(titles(machine.board(s.pipeline, s.won.id).await.unwrap()), ["b", "a"]);
        assert_eq!(titles(machine.board(s.pipeline, s.lead.id).await.unwrap()), ["c"]);
    }

    #[tokio::test]
    async fn stage_history_filters_by_pipeline() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        s.app
            .machine
            .move_stage(deal.id, MoveStage::new(s.pipeline, s.lead.id).with_note("again"), &s.actor)
            .await
            .unwrap();
        let history = s.app.machine.stage_history(deal.id, Some(s.pipeline)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].note.as_deref(), Some("again"));
        assert_eq!(history[1].from_stage_id, Some(s.lead.id));
        assert!(s
            .app
            .machine
            .stage_history(deal.id, Some(PipelineId::new()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn deal_locks_are_freed_after_each_mutation() {
        let s = setup().await;
        let machine = &s.app.machine;
        let deal = s.deal("Acme").await;
        assert!(machine.locks.is_empty());

        machine
            .move_stage(deal.id, MoveStage::new(s.pipeline, s.won.id), &s.actor)
            .await
            .unwrap();
        machine.reorder(deal.id, s.pipeline, 0, &s.actor).await.unwrap();
        machine
            .set_status(deal.id, DealStatus::Open, None, &s.actor)
            .await
            .unwrap();
        machine
            .remove_from_pipeline(deal.id, s.pipeline, &s.actor)
            .await
            .unwrap();
        let err = machine
            .move_stage(deal.id, MoveStage::new(s.pipeline, s.lost.id), &s.actor)
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::LossReasonRequired { .. }));
        assert!(machine.locks.is_empty());
    }

    #[tokio::test]
    async fn deleted_stage_rejects_moves() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        s.app.catalog.get_with_stages(s.pipeline).await.unwrap();
        s.app.catalog.delete_stage(s.lost.id, &s.actor).await.unwrap();

        let err = s
            .app
            .machine
            .move_stage(
                deal.id,
                MoveStage::new(s.pipeline, s.lost.id).with_loss_reason("PRICE"),
                &s.actor,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let stored = s.app.machine.get(deal.id).await.unwrap();
        assert_eq!(stored.stage_in(s.pipeline), Some(s.lead.id));
    }

    #[tokio::test]
    async fn blank_actor_is_rejected_before_any_write() {
        let s = setup().await;
        let deal = s.deal("Acme").await;
        let entries = s.app.ledger.len();

        let err = s
            .app
            .machine
            .move_stage(deal.id, MoveStage::new(s.pipeline, s.won.id), &Actor::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::InvalidInput(_)));
        assert_eq!(s.app.ledger.len(), entries);
        assert_eq!(s.app.machine.get(deal.id).await.unwrap(), deal);
    }
}
