//! Dealflow History Ledger
//!
//! Global, append-only record of every mutation to CRM entities.
//!
//! # Core Concepts
//!
//! - [`HistoryLedger`]: Append-only store, filtered queries, integrity checks
//! - [`HistoryEntry`]: One CREATE/UPDATE/DELETE/RESTORE record with a [`Checksum`]
//! - [`Checksummer`]: Plain or keyed Blake3 over an entry's canonical encoding
//! - [`ReconstructionEngine`]: Entity state as of any instant, audit trails
//! - [`LedgerAnalytics`]: Read-only statistics and suspicious-activity heuristics
//!
//! # Example
//!
//! ```rust,ignore
//! use dealflow_ledger::{EntityType, HistoryLedger, LogOptions, Operation};
//!
//! let ledger = HistoryLedger::new();
//! ledger.log_entry(EntityType::DEAL, "d-1", Operation::Create, "u-7", LogOptions::new())?;
//!
//! assert!(ledger.verify_integrity().is_clean());
//! ```

#![warn(unreachable_pub)]

pub mod analytics;
mod checksum;
pub mod clock;
mod document;
mod entry;
mod error;
mod ledger;
mod reconstruct;

pub use analytics::{AnalyticsConfig, LedgerAnalytics, SecurityStats, SuspiciousActivity};
pub use checksum::{Checksum, ChecksumError, ChecksumKey, Checksummer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use document::{diff, shallow_merge, to_document, Document, FieldChange};
pub use entry::{EntityType, EntryId, EntryMetadata, HistoryEntry, LogOptions, Operation};
pub use error::LedgerError;
pub use ledger::{
    ActivitySummary, HistoryLedger, HistoryQuery, IntegrityReport, IntegrityViolation,
    TOP_CHANGED_FIELDS,
};
pub use reconstruct::{fold_entries, ReconstructionEngine};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
