//! Collaborators the engine calls out to
//!
//! Permissions are computed elsewhere and consumed as a yes/no answer.
//! Activity recording is fire-and-forget: callers log a failed `record`
//! and carry on.

use async_trait::async_trait;
use dealflow_ledger::{Document, EntityType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who is performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// User id as recorded in history
    pub id: String,
}

impl Actor {
    /// Actor with the given id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Automatic rules and maintenance tasks
    #[must_use]
    pub fn system() -> Self {
        Self::new("system")
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Operation a capability check is asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create
    Create,
    /// Read
    Read,
    /// Update
    Update,
    /// Delete
    Delete,
}

/// Yes/no permission answer
pub trait CapabilityCheck: fmt::Debug + Send + Sync {
    /// Whether `actor` may perform `action` on the entity
    fn can_perform(
        &self,
        actor: &Actor,
        entity_type: &EntityType,
        action: Action,
        entity_id: Option<&str>,
    ) -> bool;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn can_perform(&self, _: &Actor, _: &EntityType, _: Action, _: Option<&str>) -> bool {
        true
    }
}

/// Domain event kinds sent to the activity sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A deal was created
    DealCreated,
    /// A deal changed stage
    StageMoved,
    /// A deal entered a closing stage
    DealWon,
    /// A deal entered a lost stage
    DealLost,
    /// A deal was enrolled in a follow-on pipeline automatically
    AutoEnrolled,
}

impl ActivityKind {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DealCreated => "deal_created",
            Self::StageMoved => "stage_moved",
            Self::DealWon => "deal_won",
            Self::DealLost => "deal_lost",
            Self::AutoEnrolled => "auto_enrolled",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timeline event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Entity kind
    pub entity_type: EntityType,
    /// Entity id
    pub entity_id: String,
    /// Event kind
    pub kind: ActivityKind,
    /// Human readable summary
    pub description: String,
    /// Extra structured context
    pub metadata: Document,
}

impl Activity {
    /// Activity with empty metadata
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        kind: ActivityKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            kind,
            description: description.into(),
            metadata: Document::new(),
        }
    }

    /// Attach one metadata field
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Activity sink failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("activity sink failed: {0}")]
pub struct ActivityError(pub String);

/// Receiver of domain events
#[async_trait]
pub trait ActivitySink: fmt::Debug + Send + Sync {
    /// Record one event
    async fn record(&self, activity: Activity) -> Result<(), ActivityError>;
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivitySink;

#[async_trait]
impl ActivitySink for NoopActivitySink {
    async fn record(&self, _activity: Activity) -> Result<(), ActivityError> {
        Ok(())
    }
}
