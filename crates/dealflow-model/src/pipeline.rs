//! Pipelines and their stages

use crate::ids::{PipelineId, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named, ordered sequence of stages for one business process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Identifier
    pub id: PipelineId,
    /// Display name, also the key auto-spawn rules match on
    pub name: String,
    /// Stage ids in order
    pub stage_ids: Vec<StageId>,
    /// Organization-type tags this pipeline applies to; empty means all
    pub org_types: BTreeSet<String>,
    /// Offered when no pipeline is chosen explicitly
    pub is_default: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last administrative edit
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// New pipeline with no stages
    #[must_use]
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: PipelineId::new(),
            name: name.into(),
            stage_ids: Vec::new(),
            org_types: BTreeSet::new(),
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the pipeline applies to an organization type
    #[must_use]
    pub fn applies_to(&self, org_type: &str) -> bool {
        self.org_types.is_empty() || self.org_types.contains(org_type)
    }
}

/// One step of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Identifier
    pub id: StageId,
    /// Owning pipeline
    pub pipeline_id: PipelineId,
    /// Display name
    pub name: String,
    /// Zero-based position, contiguous within the pipeline
    pub order: u32,
    /// Successful terminal stage: entering it wins the deal
    pub is_closing: bool,
    /// Unsuccessful terminal stage: entering it needs a loss reason
    pub is_lost: bool,
    /// Advisory work-in-progress limit
    pub wip_limit: Option<u32>,
    /// Target time in stage, in hours
    pub sla_hours: Option<u32>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last administrative edit
    pub updated_at: DateTime<Utc>,
}

impl Stage {
    /// Closing or lost
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.is_closing || self.is_lost
    }
}

/// A pipeline together with its stages sorted by order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineWithStages {
    /// The pipeline
    pub pipeline: Pipeline,
    /// Stages, ascending by order
    pub stages: Vec<Stage>,
}

impl PipelineWithStages {
    /// Stage of this pipeline by id
    #[must_use]
    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Entry stage (lowest order)
    #[must_use]
    pub fn first_stage(&self) -> Option<&Stage> {
        self.stages.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(pipeline: &Pipeline, name: &str, order: u32) -> Stage {
        Stage {
            id: StageId::new(),
            pipeline_id: pipeline.id,
            name: name.into(),
            order,
            is_closing: false,
            is_lost: false,
            wip_limit: None,
            sla_hours: None,
            created_at: pipeline.created_at,
            updated_at: pipeline.created_at,
        }
    }

    #[test]
    fn empty_org_types_apply_everywhere() {
        let mut pipeline = Pipeline::new("Dealer", Utc::now());
        assert!(pipeline.applies_to("dealer"));
        pipeline.org_types.insert("agency".into());
        assert!(!pipeline.applies_to("dealer"));
        assert!(pipeline.applies_to("agency"));
    }

    #[test]
    fn lookup_and_first_stage() {
        let pipeline = Pipeline::new("Dealer", Utc::now());
        let a = stage(&pipeline, "Investigation", 0);
        let b = stage(&pipeline, "Won", 1);
        let view = PipelineWithStages {
            pipeline,
            stages: vec![a.clone(), b.clone()],
        };
        assert_eq!(view.first_stage(), Some(&a));
        assert_eq!(view.stage(b.id), Some(&b));
        assert!(view.stage(StageId::new()).is_none());
    }
}
