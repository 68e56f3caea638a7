//! The append-only history ledger
//!
//! One [`HistoryLedger`] instance records every CREATE/UPDATE/DELETE/RESTORE
//! for every entity type. The hosting application owns it and hands an
//! `Arc` to each component that writes or reads history.
//!
//! Appends are serialized behind a write lock: sequence numbers are gap-free
//! and timestamps never go backwards. Readers clone a consistent snapshot
//! out of a read lock.

use crate::checksum::{Checksum, Checksummer};
use crate::clock::{Clock, SystemClock};
use crate::entry::{EntityType, EntryId, HistoryEntry, LogOptions, Operation};
use crate::error::LedgerError;
use crate::reconstruct;
use crate::document::Document;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Filter, sort and paginate ledger entries
///
/// Results are newest-first; offset/limit apply after filtering and sorting.
/// Both ends of the time range are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Only this entity type
    pub entity_type: Option<EntityType>,
    /// Only this entity id
    pub entity_id: Option<String>,
    /// Only this actor
    pub actor_id: Option<String>,
    /// Only this operation
    pub operation: Option<Operation>,
    /// Not before
    pub from: Option<DateTime<Utc>>,
    /// Not after
    pub to: Option<DateTime<Utc>>,
    /// Entries to skip
    pub offset: usize,
    /// Maximum entries returned
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Match everything
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of one entity
    #[must_use]
    pub fn for_entity(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to an entity type
    #[must_use]
    pub fn of_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    /// Restrict to an actor
    #[must_use]
    pub fn by_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Restrict to an operation
    #[must_use]
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Restrict to `[from, to]`
    #[must_use]
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Skip the first `offset` results
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Return at most `limit` results
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `entry` passes the filters (pagination not applied)
    #[must_use]
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        self.entity_type.as_ref().map_or(true, |t| &entry.entity_type == t)
            && self.entity_id.as_ref().map_or(true, |id| &entry.entity_id == id)
            && self.actor_id.as_ref().map_or(true, |a| &entry.actor_id == a)
            && self.operation.map_or(true, |op| entry.operation == op)
            && self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
    }
}

/// One entry whose stored checksum disagrees with its recomputed checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    /// Offending entry
    pub entry_id: EntryId,
    /// Its sequence number
    pub sequence: u64,
    /// Checksum found on the entry
    pub stored: Checksum,
    /// Checksum the entry's fields produce
    pub recomputed: Checksum,
}

/// Result of [`HistoryLedger::verify_integrity`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Entries examined
    pub checked: usize,
    /// Entries found corrupted
    pub violations: Vec<IntegrityViolation>,
}

impl IntegrityReport {
    /// No corruption found
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Identifiers of corrupted entries
    #[must_use]
    pub fn corrupted_ids(&self) -> Vec<EntryId> {
        self.violations.iter().map(|v| v.entry_id).collect()
    }
}

/// Per-entity activity aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Entity type
    pub entity_type: EntityType,
    /// Entity id
    pub entity_id: String,
    /// All entries for the entity
    pub total_operations: usize,
    /// Entries per operation kind
    pub by_operation: BTreeMap<Operation, usize>,
    /// Most frequently changed fields, most frequent first (ties by name)
    pub most_changed_fields: Vec<(String, usize)>,
    /// Actor of the most recent entry
    pub last_changed_by: Option<String>,
    /// Time of the most recent entry
    pub last_changed_at: Option<DateTime<Utc>>,
}

/// How many fields [`ActivitySummary::most_changed_fields`] keeps
pub const TOP_CHANGED_FIELDS: usize = 5;

/// Global append-only history store
#[derive(Debug)]
pub struct HistoryLedger {
    entries: RwLock<Vec<HistoryEntry>>,
    checksummer: Checksummer,
    clock: Arc<dyn Clock>,
}

impl Default for HistoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLedger {
    /// Empty ledger, plain checksums, wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Checksummer::unkeyed(), Arc::new(SystemClock))
    }

    /// Empty ledger with explicit checksummer and clock
    #[must_use]
    pub fn with_parts(checksummer: Checksummer, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            checksummer,
            clock,
        }
    }

    /// Rebuild a ledger from persisted entries, keeping their stored checksums
    ///
    /// Entries are ordered by sequence. Corrupted checksums are accepted here
    /// and surface through [`verify_integrity`](Self::verify_integrity).
    ///
    /// # Errors
    /// Returns [`LedgerError::Malformed`] on duplicate or zero sequence numbers
    pub fn from_entries(
        mut entries: Vec<HistoryEntry>,
        checksummer: Checksummer,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        entries.sort_by_key(|e| e.sequence);
        for pair in entries.windows(2) {
            if pair[0].sequence == pair[1].sequence {
                return Err(LedgerError::Malformed(format!(
                    "duplicate sequence {}",
                    pair[0].sequence
                )));
            }
        }
        if entries.first().is_some_and(|e| e.sequence == 0) {
            return Err(LedgerError::Malformed("sequence numbers start at 1".into()));
        }
        tracing::debug!(count = entries.len(), "Loaded ledger entries");
        Ok(Self {
            entries: RwLock::new(entries),
            checksummer,
            clock,
        })
    }

    /// Parse a JSON export
    ///
    /// # Errors
    /// Returns error on malformed JSON or sequence numbers
    pub fn import_json(
        json: &str,
        checksummer: Checksummer,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        let entries: Vec<HistoryEntry> = serde_json::from_str(json)?;
        Self::from_entries(entries, checksummer, clock)
    }

    /// Serialize every entry, oldest first
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn export_json(&self) -> Result<String, LedgerError> {
        let guard = self.entries.read();
        Ok(serde_json::to_string_pretty(&*guard)?)
    }

    /// The checksummer this ledger signs and verifies with
    #[inline]
    #[must_use]
    pub fn checksummer(&self) -> &Checksummer {
        &self.checksummer
    }

    /// The clock entries are stamped with
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// No entries yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Consistent copy of all entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().clone()
    }

    /// Append a new entry and return it
    ///
    /// The timestamp is the clock's now, raised to the previous entry's
    /// timestamp if the clock went backwards.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidEntry`] for an empty entity or actor id
    pub fn log_entry(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        actor_id: impl Into<String>,
        options: LogOptions,
    ) -> Result<HistoryEntry, LedgerError> {
        let entity_id = entity_id.into();
        let actor_id = actor_id.into();
        if entity_id.trim().is_empty() {
            return Err(LedgerError::InvalidEntry("entity id is empty".into()));
        }
        if actor_id.trim().is_empty() {
            return Err(LedgerError::InvalidEntry("actor id is empty".into()));
        }

        let mut guard = self.entries.write();
        let now = self.clock.now();
        let (sequence, timestamp) = match guard.last() {
            Some(last) => (last.sequence + 1, now.max(last.timestamp)),
            None => (1, now),
        };

        let mut entry = HistoryEntry {
            id: EntryId::new(),
            sequence,
            entity_type,
            entity_id,
            operation,
            changed_fields: options.changed_fields,
            before: options.before,
            after: options.after,
            actor_id,
            timestamp,
            metadata: options.metadata,
            checksum: Checksum::new([0; 32]),
        };
        entry.checksum = entry.compute_checksum(&self.checksummer);
        guard.push(entry.clone());
        drop(guard);

        tracing::debug!(
            sequence,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            operation = %entry.operation,
            "Ledger entry appended"
        );
        Ok(entry)
    }

    /// Filtered, newest-first, paginated entries
    #[must_use]
    pub fn get_history(&self, query: &HistoryQuery) -> Vec<HistoryEntry> {
        let mut matched: Vec<HistoryEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        sort_newest_first(&mut matched);
        let page = matched.into_iter().skip(query.offset);
        match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }

    /// Count of entries passing the filters, ignoring pagination
    #[must_use]
    pub fn count(&self, query: &HistoryQuery) -> usize {
        self.entries.read().iter().filter(|e| query.matches(e)).count()
    }

    /// Recompute every checksum and report mismatches
    #[must_use]
    pub fn verify_integrity(&self) -> IntegrityReport {
        let guard = self.entries.read();
        let violations: Vec<IntegrityViolation> = guard
            .iter()
            .filter_map(|entry| {
                let recomputed = entry.compute_checksum(&self.checksummer);
                (recomputed != entry.checksum).then(|| IntegrityViolation {
                    entry_id: entry.id,
                    sequence: entry.sequence,
                    stored: entry.checksum,
                    recomputed,
                })
            })
            .collect();
        if !violations.is_empty() {
            tracing::warn!(
                corrupted = violations.len(),
                checked = guard.len(),
                "Ledger integrity violations detected"
            );
        }
        IntegrityReport {
            checked: guard.len(),
            violations,
        }
    }

    /// Check a single entry against this ledger's checksummer
    #[must_use]
    pub fn verify_entry(&self, entry: &HistoryEntry) -> bool {
        entry.verify(&self.checksummer)
    }

    /// State of an entity as of `at`, or `None` if it did not exist then
    #[must_use]
    pub fn reconstruct_entity_at(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        at: DateTime<Utc>,
    ) -> Option<Document> {
        let mut relevant: Vec<HistoryEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| {
                &e.entity_type == entity_type && e.entity_id == entity_id && e.timestamp <= at
            })
            .cloned()
            .collect();
        relevant.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });
        reconstruct::fold_entries(&relevant)
    }

    /// Operation counts, most-changed fields and last change for one entity
    #[must_use]
    pub fn activity_summary(&self, entity_type: &EntityType, entity_id: &str) -> ActivitySummary {
        let guard = self.entries.read();
        let mut by_operation = BTreeMap::new();
        let mut field_counts: HashMap<&str, usize> = HashMap::new();
        let mut total = 0;
        let mut last: Option<&HistoryEntry> = None;

        for entry in guard
            .iter()
            .filter(|e| &e.entity_type == entity_type && e.entity_id == entity_id)
        {
            total += 1;
            *by_operation.entry(entry.operation).or_insert(0) += 1;
            for field in entry.changed_fields.iter().flatten() {
                *field_counts.entry(field.as_str()).or_insert(0) += 1;
            }
            if last.map_or(true, |l| (entry.timestamp, entry.sequence) >= (l.timestamp, l.sequence)) {
                last = Some(entry);
            }
        }

        let mut most_changed: Vec<(String, usize)> = field_counts
            .into_iter()
            .map(|(field, count)| (field.to_string(), count))
            .collect();
        most_changed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_changed.truncate(TOP_CHANGED_FIELDS);

        ActivitySummary {
            entity_type: entity_type.clone(),
            entity_id: entity_id.to_string(),
            total_operations: total,
            by_operation,
            most_changed_fields: most_changed,
            last_changed_by: last.map(|e| e.actor_id.clone()),
            last_changed_at: last.map(|e| e.timestamp),
        }
    }
}

fn sort_newest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(b.sequence.cmp(&a.sequence))
    });
}
