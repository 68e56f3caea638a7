//! Point-in-time reconstruction
//!
//! Folding rules, oldest entry first:
//! - CREATE sets the state to its after snapshot
//! - UPDATE shallow-merges its after snapshot into the state
//! - DELETE removes the state; nothing exists until a RESTORE
//! - RESTORE sets the state to its after snapshot, or to the last state
//!   seen before the delete when it carries none

use crate::document::{diff, shallow_merge, Document, FieldChange};
use crate::entry::{EntityType, HistoryEntry, Operation};
use crate::ledger::{HistoryLedger, HistoryQuery};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
enum Working {
    Absent,
    Present(Document),
    Deleted { last: Option<Document> },
}

/// Fold chronologically ordered entries of one entity into its state
#[must_use]
pub fn fold_entries(entries: &[HistoryEntry]) -> Option<Document> {
    let mut state = Working::Absent;
    for entry in entries {
        state = match (state, entry.operation) {
            (_, Operation::Create) => Working::Present(entry.after.clone().unwrap_or_default()),
            (Working::Present(mut doc), Operation::Update) => {
                if let Some(after) = &entry.after {
                    shallow_merge(&mut doc, after);
                }
                Working::Present(doc)
            }
            (Working::Absent, Operation::Update) => {
                Working::Present(entry.after.clone().unwrap_or_default())
            }
            (deleted @ Working::Deleted { .. }, Operation::Update) => deleted,
            (Working::Present(doc), Operation::Delete) => Working::Deleted { last: Some(doc) },
            (Working::Absent, Operation::Delete) => Working::Deleted { last: None },
            (deleted @ Working::Deleted { .. }, Operation::Delete) => deleted,
            (prior, Operation::Restore) => {
                let fallback = match prior {
                    Working::Present(doc) => Some(doc),
                    Working::Deleted { last } => last,
                    Working::Absent => None,
                };
                Working::Present(entry.after.clone().or(fallback).unwrap_or_default())
            }
        };
    }
    match state {
        Working::Present(doc) => Some(doc),
        Working::Absent | Working::Deleted { .. } => None,
    }
}

/// Read-only views over the ledger for audit screens
#[derive(Debug, Clone)]
pub struct ReconstructionEngine {
    ledger: Arc<HistoryLedger>,
}

impl ReconstructionEngine {
    /// Wrap a shared ledger
    #[inline]
    #[must_use]
    pub fn new(ledger: Arc<HistoryLedger>) -> Self {
        Self { ledger }
    }

    /// Entity state as of `at`; `None` if not yet created or deleted by then
    #[must_use]
    pub fn state_at(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        at: DateTime<Utc>,
    ) -> Option<Document> {
        self.ledger.reconstruct_entity_at(entity_type, entity_id, at)
    }

    /// Newest-first entries of one entity
    #[must_use]
    pub fn audit_trail(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        limit: Option<usize>,
    ) -> Vec<HistoryEntry> {
        let mut query = HistoryQuery::for_entity(entity_type, entity_id);
        query.limit = limit;
        self.ledger.get_history(&query)
    }

    /// Newest-first entries across the whole ledger
    #[must_use]
    pub fn recent_activity(&self, limit: usize) -> Vec<HistoryEntry> {
        self.ledger.get_history(&HistoryQuery::new().limit(limit))
    }

    /// Field changes between the states at `from` and `to`
    ///
    /// A missing state on either side counts as an empty document.
    #[must_use]
    pub fn diff_between(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<FieldChange> {
        let before = self.state_at(entity_type, entity_id, from).unwrap_or_default();
        let after = self.state_at(entity_type, entity_id, to).unwrap_or_default();
        diff(&before, &after)
    }

    /// Ids of entities whose latest entry is a DELETE
    #[must_use]
    pub fn deleted_entities(&self, entity_type: &EntityType) -> Vec<String> {
        let entries = self
            .ledger
            .get_history(&HistoryQuery::new().of_type(entity_type.clone()));
        let mut latest: BTreeMap<&str, Operation> = BTreeMap::new();
        for entry in &entries {
            latest.entry(entry.entity_id.as_str()).or_insert(entry.operation);
        }
        latest
            .into_iter()
            .filter(|(_, op)| *op == Operation::Delete)
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksummer;
    use crate::clock::ManualClock;
    use crate::entry::LogOptions;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    struct Harness {
        ledger: Arc<HistoryLedger>,
        clock: Arc<ManualClock>,
        engine: ReconstructionEngine,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            ));
            let ledger = Arc::new(HistoryLedger::with_parts(Checksummer::unkeyed(), clock.clone()));
            let engine = ReconstructionEngine::new(ledger.clone());
            Self { ledger, clock, engine }
        }

        fn log(&self, op: Operation, after: Option<Value>) -> DateTime<Utc> {
            self.clock.advance(Duration::minutes(10));
            let mut options = LogOptions::new();
            if let Some(after) = after {
                options = options.with_after(doc(after));
            }
            self.ledger
                .log_entry(EntityType::DEAL, "d1", op, "u1", options)
                .unwrap()
                .timestamp
        }
    }

    #[test]
    fn before_first_entry_is_none() {
        let h = Harness::new();
        let created = h.log(Operation::Create, Some(json!({"title": "A"})));
        assert!(h.engine.state_at(&EntityType::DEAL, "d1", created - Duration::seconds(1)).is_none());
        assert!(h.engine.state_at(&EntityType::DEAL, "d1", created).is_some());
        assert!(h.engine.state_at(&EntityType::DEAL, "other", created).is_none());
    }

    #[test]
    fn create_then_updates_shallow_merge_in_order() {
        let h = Harness::new();
        h.log(Operation::Create, Some(json!({"title": "A", "value": 1, "owner": "x"})));
        h.log(Operation::Update, Some(json!({"value": 2, "status": "OPEN"})));
        let t = h.log(Operation::Update, Some(json!({"value": 3, "owner": "y"})));
        let state = h.engine.state_at(&EntityType::DEAL, "d1", t).unwrap();
        assert_eq!(
            Value::Object(state),
            json!({"title": "A", "value": 3, "owner": "y", "status": "OPEN"})
        );
    }

    #[test]
    fn delete_hides_state_until_restore() {
        let h = Harness::new();
        h.log(Operation::Create, Some(json!({"title": "A"})));
        let updated = h.log(Operation::Update, Some(json!({"value": 9})));
        let deleted = h.log(Operation::Delete, None);
        assert!(h.engine.state_at(&EntityType::DEAL, "d1", deleted).is_none());
        assert!(h
            .engine
            .state_at(&EntityType::DEAL, "d1", deleted + Duration::days(30))
            .is_none());
        assert!(h.engine.state_at(&EntityType::DEAL, "d1", updated).is_some());

        let restored = h.log(Operation::Restore, None);
        let state = h.engine.state_at(&EntityType::DEAL, "d1", restored).unwrap();
        assert_eq!(Value::Object(state), json!({"title": "A", "value": 9}));
        assert_eq!(h.engine.deleted_entities(&EntityType::DEAL), Vec::<String>::new());
    }

    #[test]
    fn restore_with_snapshot_replaces_state() {
        let h = Harness::new();
        h.log(Operation::Create, Some(json!({"title": "A"})));
        h.log(Operation::Delete, None);
        let t = h.log(Operation::Restore, Some(json!({"title": "B"})));
        let state = h.engine.state_at(&EntityType::DEAL, "d1", t).unwrap();
        assert_eq!(Value::Object(state), json!({"title": "B"}));
    }

    #[test]
    fn deleted_entities_tracks_latest_operation() {
        let h = Harness::new();
        h.log(Operation::Create, None);
        h.log(Operation::Delete, None);
        h.ledger
            .log_entry(EntityType::DEAL, "d2", Operation::Create, "u1", LogOptions::new())
            .unwrap();
        assert_eq!(h.engine.deleted_entities(&EntityType::DEAL), vec!["d1".to_string()]);
    }

    #[test]
    fn diff_between_two_instants() {
        let h = Harness::new();
        let t1 = h.log(Operation::Create, Some(json!({"title": "A", "value": 1})));
        let t2 = h.log(Operation::Update, Some(json!({"value": 2, "status": "WON"})));
        let changes = h.engine.diff_between(&EntityType::DEAL, "d1", t1, t2);
        assert_eq!(
            changes,
            vec![
                FieldChange::Added {
                    field: "status".into(),
                    value: json!("WON")
                },
                FieldChange::Changed {
                    field: "value".into(),
                    from: json!(1),
                    to: json!(2)
                },
            ]
        );
    }

    #[test]
    fn audit_trail_and_recent_activity_are_newest_first() {
        let h = Harness::new();
        h.log(Operation::Create, None);
        h.log(Operation::Update, None);
        h.log(Operation::Update, None);
        let trail = h.engine.audit_trail(EntityType::DEAL, "d1", Some(2));
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].sequence, 3);
        assert_eq!(h.engine.recent_activity(1)[0].sequence, 3);
    }
}
