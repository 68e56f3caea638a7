//! Deals and their stage history
//!
//! A deal may sit in several pipelines at once, one stage per pipeline.
//! Every transition is appended to the deal's own history and never edited.

use crate::ids::{DealId, PipelineId, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Commercial outcome of a deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    /// Being worked
    #[default]
    Open,
    /// Closed successfully
    Won,
    /// Closed unsuccessfully, with a reason
    Lost,
    /// Paused
    OnHold,
    /// Dropped without a decision
    Abandoned,
}

impl DealStatus {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::OnHold => "ON_HOLD",
            Self::Abandoned => "ABANDONED",
        }
    }

    /// Won, lost or abandoned
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Won | Self::Lost | Self::Abandoned)
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "OPEN" => Ok(Self::Open),
            "WON" => Ok(Self::Won),
            "LOST" => Ok(Self::Lost),
            "ON_HOLD" => Ok(Self::OnHold),
            "ABANDONED" => Ok(Self::Abandoned),
            other => Err(format!("unknown deal status: {other}")),
        }
    }
}

/// One recorded stage transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    /// Deal that moved
    pub deal_id: DealId,
    /// Pipeline the move happened in
    pub pipeline_id: PipelineId,
    /// Previous stage; `None` on first entry into the pipeline
    pub from_stage_id: Option<StageId>,
    /// Stage entered
    pub to_stage_id: StageId,
    /// When
    pub moved_at: DateTime<Utc>,
    /// Who
    pub moved_by: Option<String>,
    /// Free text
    pub note: Option<String>,
    /// Written by an automatic rule rather than a caller
    #[serde(default)]
    pub automatic: bool,
}

/// Input for creating a deal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewDeal {
    /// Title
    pub title: String,
    /// Owning organization, if known
    pub organization_id: Option<String>,
    /// Estimated value
    pub value: Option<f64>,
    /// Responsible user
    pub owner_id: Option<String>,
}

impl NewDeal {
    /// Deal with just a title
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// A CRM opportunity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    /// Identifier
    pub id: DealId,
    /// Title
    pub title: String,
    /// Owning organization
    pub organization_id: Option<String>,
    /// Estimated value
    pub value: Option<f64>,
    /// Responsible user
    pub owner_id: Option<String>,
    /// Commercial status
    pub status: DealStatus,
    /// Current stage in each pipeline the deal belongs to
    pub memberships: BTreeMap<PipelineId, StageId>,
    /// Every transition, oldest first
    pub stage_history: Vec<StageHistoryEntry>,
    /// Set when the deal is lost
    pub loss_reason: Option<String>,
    /// Set when the deal is won or lost
    pub closed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    /// Open deal with no pipeline membership
    #[must_use]
    pub fn new(input: NewDeal, now: DateTime<Utc>) -> Self {
        Self {
            id: DealId::new(),
            title: input.title,
            organization_id: input.organization_id,
            value: input.value,
            owner_id: input.owner_id,
            status: DealStatus::Open,
            memberships: BTreeMap::new(),
            stage_history: Vec::new(),
            loss_reason: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current stage in a pipeline
    #[inline]
    #[must_use]
    pub fn stage_in(&self, pipeline_id: PipelineId) -> Option<StageId> {
        self.memberships.get(&pipeline_id).copied()
    }

    /// Whether the deal belongs to a pipeline
    #[inline]
    #[must_use]
    pub fn is_in_pipeline(&self, pipeline_id: PipelineId) -> bool {
        self.memberships.contains_key(&pipeline_id)
    }

    /// History entries of one pipeline, oldest first
    pub fn history_in(&self, pipeline_id: PipelineId) -> impl Iterator<Item = &StageHistoryEntry> {
        self.stage_history
            .iter()
            .filter(move |h| h.pipeline_id == pipeline_id)
    }

    /// Record a move into `to_stage_id` and return the appended entry
    ///
    /// The from-stage is the current membership in that pipeline. The
    /// timestamp is raised to the previous entry's if `now` is earlier, so
    /// history stays non-decreasing in time.
    pub fn enter_stage(
        &mut self,
        pipeline_id: PipelineId,
        to_stage_id: StageId,
        now: DateTime<Utc>,
        moved_by: Option<String>,
        note: Option<String>,
        automatic: bool,
    ) -> &StageHistoryEntry {
        let moved_at = self
            .stage_history
            .last()
            .map_or(now, |last| now.max(last.moved_at));
        let from_stage_id = self.memberships.insert(pipeline_id, to_stage_id);
        self.updated_at = moved_at;
        self.stage_history.push(StageHistoryEntry {
            deal_id: self.id,
            pipeline_id,
            from_stage_id,
            to_stage_id,
            moved_at,
            moved_by,
            note,
            automatic,
        });
        &self.stage_history[self.stage_history.len() - 1]
    }
}
