//! Read-only activity statistics over the ledger
//!
//! Nothing here writes to the ledger. All figures are computed from a
//! consistent snapshot taken when the method is called.

use crate::entry::{EntityType, EntryId, HistoryEntry, Operation};
use crate::ledger::{HistoryLedger, HistoryQuery};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Thresholds for suspicious-activity heuristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsConfig {
    /// More operations than this by one actor inside one window is a burst
    pub burst_threshold: usize,
    /// Burst window length in seconds
    pub burst_window_secs: i64,
    /// First business hour (UTC, inclusive)
    pub business_hours_start: u32,
    /// Last business hour (UTC, exclusive)
    pub business_hours_end: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            burst_threshold: 50,
            burst_window_secs: 300,
            business_hours_start: 8,
            business_hours_end: 18,
        }
    }
}

impl AnalyticsConfig {
    /// Whether `at` falls inside business hours
    #[must_use]
    pub fn is_business_hour(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        hour >= self.business_hours_start && hour < self.business_hours_end
    }

    /// Burst window, never shorter than one second
    #[must_use]
    pub fn burst_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.burst_window_secs.max(1))
    }
}

/// Security-relevant counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStats {
    /// DELETE entries
    pub deletes: usize,
    /// RESTORE entries
    pub restores: usize,
    /// Entries outside business hours
    pub after_hours_operations: usize,
    /// Distinct actors seen
    pub distinct_actors: usize,
}

/// A heuristic finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspiciousActivity {
    /// Too many operations by one actor in a short window
    Burst {
        /// Actor
        actor_id: String,
        /// Operations inside the window
        operations: usize,
        /// First operation of the window
        window_start: DateTime<Utc>,
        /// Last operation of the window
        window_end: DateTime<Utc>,
    },
    /// An operation outside business hours
    OutsideBusinessHours {
        /// Actor
        actor_id: String,
        /// Entry
        entry_id: EntryId,
        /// When it happened
        at: DateTime<Utc>,
    },
}

/// Aggregations for reporting screens
#[derive(Debug, Clone)]
pub struct LedgerAnalytics {
    ledger: Arc<HistoryLedger>,
    scope: HistoryQuery,
}

impl LedgerAnalytics {
    /// Analytics over the whole ledger
    #[must_use]
    pub fn new(ledger: Arc<HistoryLedger>) -> Self {
        Self {
            ledger,
            scope: HistoryQuery::new(),
        }
    }

    /// Restrict every figure to entries matching `scope` (pagination ignored)
    #[must_use]
    pub fn scoped(mut self, scope: HistoryQuery) -> Self {
        self.scope = HistoryQuery {
            offset: 0,
            limit: None,
            ..scope
        };
        self
    }

    fn snapshot(&self) -> Vec<HistoryEntry> {
        let mut entries = self.ledger.get_history(&self.scope);
        entries.reverse();
        entries
    }

    /// Entries per operation kind
    #[must_use]
    pub fn operation_breakdown(&self) -> BTreeMap<Operation, usize> {
        let mut out = BTreeMap::new();
        for entry in self.snapshot() {
            *out.entry(entry.operation).or_insert(0) += 1;
        }
        out
    }

    /// Entries per entity type
    #[must_use]
    pub fn activity_by_entity_type(&self) -> BTreeMap<EntityType, usize> {
        let mut out = BTreeMap::new();
        for entry in self.snapshot() {
            *out.entry(entry.entity_type).or_insert(0) += 1;
        }
        out
    }

    /// Entries per UTC calendar day
    #[must_use]
    pub fn activity_by_day(&self) -> BTreeMap<NaiveDate, usize> {
        let mut out = BTreeMap::new();
        for entry in self.snapshot() {
            *out.entry(entry.timestamp.date_naive()).or_insert(0) += 1;
        }
        out
    }

    /// Entries per UTC hour of day (0..24)
    #[must_use]
    pub fn activity_by_hour(&self) -> [usize; 24] {
        let mut out = [0usize; 24];
        for entry in self.snapshot() {
            out[entry.timestamp.hour() as usize] += 1;
        }
        out
    }

    /// The `n` most active actors, most active first (ties by id)
    #[must_use]
    pub fn top_actors(&self, n: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.snapshot() {
            *counts.entry(entry.actor_id).or_insert(0) += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Deletes, restores, after-hours operations and distinct actors
    #[must_use]
    pub fn security_stats(&self, config: &AnalyticsConfig) -> SecurityStats {
        let entries = self.snapshot();
        let actors: BTreeSet<&str> = entries.iter().map(|e| e.actor_id.as_str()).collect();
        SecurityStats {
            deletes: entries
                .iter()
                .filter(|e| e.operation == Operation::Delete)
                .count(),
            restores: entries
                .iter()
                .filter(|e| e.operation == Operation::Restore)
                .count(),
            after_hours_operations: entries
                .iter()
                .filter(|e| !config.is_business_hour(e.timestamp))
                .count(),
            distinct_actors: actors.len(),
        }
    }

    /// Burst and after-hours findings, bursts first, each group chronological
    ///
    /// Bursts use a sliding window per actor; overlapping windows collapse
    /// into a single finding covering the densest stretch found first.
    #[must_use]
    pub fn detect_suspicious(&self, config: &AnalyticsConfig) -> Vec<SuspiciousActivity> {
        let entries = self.snapshot();
        let mut by_actor: BTreeMap<&str, Vec<&HistoryEntry>> = BTreeMap::new();
        for entry in &entries {
            by_actor.entry(entry.actor_id.as_str()).or_default().push(entry);
        }

        let window = config.burst_window();
        let mut bursts = Vec::new();
        for (actor, actor_entries) in &by_actor {
            let mut start = 0;
            let mut end = 0;
            while end < actor_entries.len() {
                while actor_entries[end].timestamp - actor_entries[start].timestamp > window {
                    start += 1;
                }
                let count = end - start + 1;
                if count > config.burst_threshold {
                    // Extend to the full window, then resume after it
                    let mut last = end;
                    while last + 1 < actor_entries.len()
                        && actor_entries[last + 1].timestamp - actor_entries[start].timestamp
                            <= window
                    {
                        last += 1;
                    }
                    bursts.push(SuspiciousActivity::Burst {
                        actor_id: (*actor).to_string(),
                        operations: last - start + 1,
                        window_start: actor_entries[start].timestamp,
                        window_end: actor_entries[last].timestamp,
                    });
                    start = last + 1;
                    end = last + 1;
                    continue;
                }
                end += 1;
            }
        }

        let after_hours = entries
            .iter()
            .filter(|e| !config.is_business_hour(e.timestamp))
            .map(|e| SuspiciousActivity::OutsideBusinessHours {
                actor_id: e.actor_id.clone(),
                entry_id: e.id,
                at: e.timestamp,
            });

        if !bursts.is_empty() {
            tracing::warn!(bursts = bursts.len(), "Burst activity detected in ledger");
        }
        bursts.extend(after_hours);
        bursts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksummer;
    use crate::clock::ManualClock;
    use crate::entry::LogOptions;
    use chrono::{Duration, TimeZone};

    fn setup(start_hour: u32) -> (Arc<HistoryLedger>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 10, start_hour, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(HistoryLedger::with_parts(Checksummer::unkeyed(), clock.clone()));
        (ledger, clock)
    }

    fn log(ledger: &HistoryLedger, ty: EntityType, op: Operation, actor: &str) {
        ledger.log_entry(ty, "e1", op, actor, LogOptions::new()).unwrap();
    }

    #[test]
    fn breakdowns_count_entries() {
        let (ledger, clock) = setup(10);
        log(&ledger, EntityType::DEAL, Operation::Create, "a");
        log(&ledger, EntityType::DEAL, Operation::Update, "a");
        clock.advance(Duration::days(1));
        log(&ledger, EntityType::CONTACT, Operation::Delete, "b");

        let analytics = LedgerAnalytics::new(ledger);
        let ops = analytics.operation_breakdown();
        assert_eq!(ops[&Operation::Create], 1);
        assert_eq!(ops[&Operation::Delete], 1);
        assert!(!ops.contains_key(&Operation::Restore));

        let by_type = analytics.activity_by_entity_type();
        assert_eq!(by_type[&EntityType::DEAL], 2);

        let by_day: Vec<usize> = analytics.activity_by_day().into_values().collect();
        assert_eq!(by_day, vec![2, 1]);
        assert_eq!(analytics.activity_by_hour()[10], 3);
        assert_eq!(analytics.top_actors(1), vec![("a".to_string(), 2)]);
    }

    #[test]
    fn scoped_analytics_ignore_other_entries() {
        let (ledger, _) = setup(10);
        log(&ledger, EntityType::DEAL, Operation::Create, "a");
        log(&ledger, EntityType::CONTACT, Operation::Create, "b");
        let analytics = LedgerAnalytics::new(ledger)
            .scoped(HistoryQuery::new().of_type(EntityType::CONTACT).limit(0));
        assert_eq!(analytics.top_actors(10), vec![("b".to_string(), 1)]);
    }

    #[test]
    fn security_stats_flag_after_hours() {
        let (ledger, clock) = setup(7);
        log(&ledger, EntityType::DEAL, Operation::Delete, "a");
        clock.advance(Duration::hours(3));
        log(&ledger, EntityType::DEAL, Operation::Restore, "b");
        let stats = LedgerAnalytics::new(ledger).security_stats(&AnalyticsConfig::default());
        assert_eq!(
            stats,
            SecurityStats {
                deletes: 1,
                restores: 1,
                after_hours_operations: 1,
                distinct_actors: 2
            }
        );
    }

    #[test]
    fn burst_detection_reports_one_finding_per_burst() {
        let (ledger, clock) = setup(9);
        for _ in 0..6 {
            clock.advance(Duration::seconds(20));
            log(&ledger, EntityType::DEAL, Operation::Update, "bulk");
        }
        clock.advance(Duration::hours(2));
        log(&ledger, EntityType::DEAL, Operation::Update, "bulk");
        log(&ledger, EntityType::DEAL, Operation::Update, "calm");

        let config = AnalyticsConfig {
            burst_threshold: 4,
            ..AnalyticsConfig::default()
        };
        let findings = LedgerAnalytics::new(ledger).detect_suspicious(&config);
        assert_eq!(findings.len(), 1);
        match &findings[0] {
            SuspiciousActivity::Burst {
                actor_id,
                operations,
                ..
            } => {
                assert_eq!(actor_id, "bulk");
                assert_eq!(*operations, 6);
            }
            other => panic!("expected burst, got {other:?}"),
        }
    }

    #[test]
    fn outside_business_hours_findings() {
        let (ledger, clock) = setup(22);
        log(&ledger, EntityType::USER, Operation::Update, "night-owl");
        clock.advance(Duration::hours(12));
        log(&ledger, EntityType::USER, Operation::Update, "day");
        let findings = LedgerAnalytics::new(ledger).detect_suspicious(&AnalyticsConfig::default());
        assert_eq!(findings.len(), 1);
        assert!(matches!(
            &findings[0],
            SuspiciousActivity::OutsideBusinessHours { actor_id, .. } if actor_id == "night-owl"
        ));
    }

    #[test]
    fn non_positive_burst_window_falls_back_to_one_second() {
        let (ledger, clock) = setup(9);
        for _ in 0..3 {
            log(&ledger, EntityType::DEAL, Operation::Update, "bulk");
        }
        clock.advance(Duration::seconds(5));
        log(&ledger, EntityType::DEAL, Operation::Update, "bulk");
        let analytics = LedgerAnalytics::new(ledger);

        for burst_window_secs in [0, -5] {
            let config = AnalyticsConfig {
                burst_threshold: 2,
                burst_window_secs,
                ..AnalyticsConfig::default()
            };
            assert_eq!(config.burst_window(), Duration::seconds(1));
            let findings = analytics.detect_suspicious(&config);
            assert_eq!(findings.len(), 1);
            assert!(matches!(
                &findings[0],
                SuspiciousActivity::Burst { operations: 3, .. }
            ));
        }
    }
}
