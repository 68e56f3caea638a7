//! Ledger records
//!
//! A [`HistoryEntry`] is written once and never edited. Its checksum covers
//! the semantic fields only (entity type, entity id, operation, changed
//! fields, snapshots, actor, timestamp); identifiers, sequence numbers and
//! contextual metadata are outside the checksum.

use crate::checksum::{Checksum, Checksummer};
use crate::document::{write_canonical, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique entry identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Ulid);

impl EntryId {
    /// Generate new entry ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag naming the kind of entity an entry is about
///
/// Open-ended: the well-known CRM entity kinds are associated constants,
/// anything else goes through [`EntityType::new`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(Cow<'static, str>);

impl EntityType {
    /// Sales opportunity
    pub const DEAL: Self = Self(Cow::Borrowed("deal"));
    /// Pipeline definition
    pub const PIPELINE: Self = Self(Cow::Borrowed("pipeline"));
    /// Stage definition
    pub const STAGE: Self = Self(Cow::Borrowed("stage"));
    /// Contact person
    pub const CONTACT: Self = Self(Cow::Borrowed("contact"));
    /// Organization
    pub const ORGANIZATION: Self = Self(Cow::Borrowed("organization"));
    /// Task
    pub const TASK: Self = Self(Cow::Borrowed("task"));
    /// User account
    pub const USER: Self = Self(Cow::Borrowed("user"));

    /// Arbitrary entity type
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Tag as string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Kind of mutation an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Entity came into existence
    Create,
    /// Some fields changed
    Update,
    /// Entity removed
    Delete,
    /// Previously deleted entity brought back
    Restore,
}

impl Operation {
    /// All operations, in declaration order
    pub const ALL: [Operation; 4] = [Self::Create, Self::Update, Self::Delete, Self::Restore];

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Restore => "RESTORE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "RESTORE" => Ok(Self::Restore),
            _ => Err(format!("Invalid operation: {s}")),
        }
    }
}

/// Request context attached to an entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Caller address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Caller agent string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Why the change was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Anything else
    #[serde(default, skip_serializing_if = "Document::is_empty")]
    pub extra: Document,
}

impl EntryMetadata {
    /// Metadata carrying only a reason
    #[must_use]
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Optional parts of a new entry
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Names of fields that changed
    pub changed_fields: Option<Vec<String>>,
    /// Snapshot before the change
    pub before: Option<Document>,
    /// Snapshot after the change
    pub after: Option<Document>,
    /// Request context
    pub metadata: Option<EntryMetadata>,
}

impl LogOptions {
    /// Empty options
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With changed field names
    #[must_use]
    pub fn with_changed_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// With before snapshot
    #[must_use]
    pub fn with_before(mut self, before: Document) -> Self {
        self.before = Some(before);
        self
    }

    /// With after snapshot
    #[must_use]
    pub fn with_after(mut self, after: Document) -> Self {
        self.after = Some(after);
        self
    }

    /// With metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One immutable ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Entry identifier
    pub id: EntryId,
    /// Append position, gap-free from 1
    pub sequence: u64,
    /// Kind of entity
    pub entity_type: EntityType,
    /// Entity identifier
    pub entity_id: String,
    /// Mutation kind
    pub operation: Operation,
    /// Fields that changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
    /// Snapshot before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Document>,
    /// Snapshot after
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Document>,
    /// Who made the change
    pub actor_id: String,
    /// When
    pub timestamp: DateTime<Utc>,
    /// Request context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
    /// Digest of the semantic fields
    pub checksum: Checksum,
}

impl HistoryEntry {
    /// Canonical byte encoding of the checksummed fields
    ///
    /// Every field is length-prefixed; optional fields carry a presence byte.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        put_str(&mut out, self.entity_type.as_str());
        put_str(&mut out, &self.entity_id);
        put_str(&mut out, self.operation.as_str());
        match &self.changed_fields {
            Some(fields) => {
                out.push(1);
                out.extend_from_slice(&(fields.len() as u64).to_le_bytes());
                for field in fields {
                    put_str(&mut out, field);
                }
            }
            None => out.push(0),
        }
        put_document(&mut out, self.before.as_ref());
        put_document(&mut out, self.after.as_ref());
        put_str(&mut out, &self.actor_id);
        put_str(
            &mut out,
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        out
    }

    /// Checksum this entry should carry under `checksummer`
    #[must_use]
    pub fn compute_checksum(&self, checksummer: &Checksummer) -> Checksum {
        checksummer.digest(&self.canonical_bytes())
    }

    /// Whether the stored checksum matches the recomputed one
    #[must_use]
    pub fn verify(&self, checksummer: &Checksummer) -> bool {
        self.compute_checksum(checksummer) == self.checksum
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_document(out: &mut Vec<u8>, doc: Option<&Document>) {
    match doc {
        Some(doc) => {
            out.push(1);
            let mut encoded = Vec::new();
            write_canonical(&Value::Object(doc.clone()), &mut encoded);
            out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        None => out.push(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> HistoryEntry {
        let mut after = Document::new();
        after.insert("title".into(), json!("Fleet renewal"));
        let mut entry = HistoryEntry {
            id: EntryId::new(),
            sequence: 1,
            entity_type: EntityType::DEAL,
            entity_id: "deal-1".into(),
            operation: Operation::Create,
            changed_fields: None,
            before: None,
            after: Some(after),
            actor_id: "u-1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
            metadata: None,
            checksum: Checksum::new([0; 32]),
        };
        entry.checksum = entry.compute_checksum(&Checksummer::unkeyed());
        entry
    }

    #[test]
    fn checksum_ignores_id_sequence_and_metadata() {
        let c = Checksummer::unkeyed();
        let mut entry = sample();
        entry.id = EntryId::new();
        entry.sequence = 99;
        entry.metadata = Some(EntryMetadata::reason("import"));
        assert!(entry.verify(&c));
    }

    #[test]
    fn checksum_covers_semantic_fields() {
        let c = Checksummer::unkeyed();
        let mut entry = sample();
        entry.actor_id = "u-2".into();
        assert!(!entry.verify(&c));

        let mut entry = sample();
        entry.timestamp += chrono::Duration::nanoseconds(1);
        assert!(!entry.verify(&c));

        let mut entry = sample();
        entry.changed_fields = Some(vec![]);
        assert!(!entry.verify(&c));
    }

    #[test]
    fn entity_type_serializes_as_plain_string() {
        assert_eq!(serde_json::to_string(&EntityType::DEAL).unwrap(), "\"deal\"");
        let parsed: EntityType = serde_json::from_str("\"deal\"").unwrap();
        assert_eq!(parsed, EntityType::DEAL);
        assert_eq!(EntityType::from("invoice").as_str(), "invoice");
    }

    #[test]
    fn operation_round_trips_through_str() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert_eq!("restore".parse::<Operation>().unwrap(), Operation::Restore);
        assert!("MERGE".parse::<Operation>().is_err());
        assert_eq!(serde_json::to_string(&Operation::Delete).unwrap(), "\"DELETE\"");
    }
}
