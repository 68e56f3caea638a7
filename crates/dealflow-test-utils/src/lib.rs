//! Testing utilities for the dealflow workspace
//!
//! Shared fixtures, fake collaborators and the Dealer/Integration scenario.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dealflow_catalog::{NewPipeline, NewStage};
use dealflow_core::{DealStageMachine, Dealflow, DealflowConfig};
use dealflow_ledger::EntityType;
use dealflow_model::{
    Action, Activity, ActivityError, ActivityKind, ActivitySink, Actor, CapabilityCheck, Deal,
    NewDeal, Pipeline, Stage,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub use dealflow_ledger::ManualClock;

/// Keeps every activity it receives
#[derive(Debug, Default)]
pub struct RecordingActivitySink {
    recorded: Mutex<Vec<Activity>>,
}

impl RecordingActivitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Activity> {
        self.recorded.lock().clone()
    }

    pub fn kinds(&self) -> Vec<ActivityKind> {
        self.recorded.lock().iter().map(|a| a.kind).collect()
    }
}

#[async_trait]
impl ActivitySink for RecordingActivitySink {
    async fn record(&self, activity: Activity) -> Result<(), ActivityError> {
        self.recorded.lock().push(activity);
        Ok(())
    }
}

/// Rejects every activity
#[derive(Debug, Default)]
pub struct FailingActivitySink {
    attempts: Mutex<usize>,
}

impl FailingActivitySink {
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl ActivitySink for FailingActivitySink {
    async fn record(&self, _activity: Activity) -> Result<(), ActivityError> {
        *self.attempts.lock() += 1;
        Err(ActivityError("sink unavailable".into()))
    }
}

/// Denies everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl CapabilityCheck for DenyAll {
    fn can_perform(&self, _: &Actor, _: &EntityType, _: Action, _: Option<&str>) -> bool {
        false
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap()
}

/// In-memory app on a manual clock
pub struct Fixture {
    pub app: Dealflow,
    pub clock: Arc<ManualClock>,
    pub actor: Actor,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(DealflowConfig::default())
    }

    pub fn with_config(config: DealflowConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let app = Dealflow::in_memory(config, clock.clone()).unwrap();
        Self {
            app,
            clock,
            actor: Actor::new("rep-1"),
        }
    }

    /// Advance the clock by `minutes`
    pub fn tick(&self, minutes: i64) -> DateTime<Utc> {
        self.clock.advance(Duration::minutes(minutes))
    }

    /// Second machine over the same stores and ledger with other collaborators
    pub fn machine_with(
        &self,
        activity: Arc<dyn ActivitySink>,
        capabilities: Arc<dyn CapabilityCheck>,
    ) -> DealStageMachine {
        DealStageMachine::new(
            self.app.deals.clone(),
            self.app.catalog.clone(),
            self.app.ledger.clone(),
        )
        .with_auto_spawn(self.app.config.auto_spawn.clone())
        .with_activity_sink(activity)
        .with_capabilities(capabilities)
    }

    pub async fn pipeline(&self, name: &str, stages: &[NewStage]) -> (Pipeline, Vec<Stage>) {
        let pipeline = self
            .app
            .catalog
            .create_pipeline(NewPipeline::named(name), &self.actor)
            .await
            .unwrap();
        let mut created = Vec::new();
        for stage in stages {
            created.push(
                self.app
                    .catalog
                    .create_stage(pipeline.id, stage.clone(), &self.actor)
                    .await
                    .unwrap(),
            );
        }
        let pipeline = self.app.catalog.get(pipeline.id).await.unwrap();
        (pipeline, created)
    }

    pub async fn deal(&self, title: &str) -> Deal {
        self.tick(1);
        self.app
            .machine
            .create_deal(NewDeal::titled(title), &self.actor)
            .await
            .unwrap()
    }

    /// Dealer [Investigation(0), Lost(5, lost), Won(9, closing)] and
    /// Integration [Start(0)]
    pub async fn dealer_scenario(&self) -> DealerScenario {
        let (dealer, stages) = self
            .pipeline(
                "Dealer",
                &[
                    NewStage::named("Investigation").at(0),
                    NewStage::named("Lost").at(5).lost(),
                    NewStage::named("Won").at(9).closing(),
                ],
            )
            .await;
        let (integration, follow) = self
            .pipeline("Integration", &[NewStage::named("Start").at(0)])
            .await;
        DealerScenario {
            dealer,
            investigation: stages[0].clone(),
            lost: stages[1].clone(),
            won: stages[2].clone(),
            integration,
            start: follow[0].clone(),
        }
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct DealerScenario {
    pub dealer: Pipeline,
    pub investigation: Stage,
    pub lost: Stage,
    pub won: Stage,
    pub integration: Pipeline,
    pub start: Stage,
}
