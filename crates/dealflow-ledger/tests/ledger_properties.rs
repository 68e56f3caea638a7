use chrono::{Duration, TimeZone, Utc};
use dealflow_ledger::{
    Checksummer, Clock, Document, EntityType, HistoryLedger, LogOptions, ManualClock, Operation,
};
use proptest::prelude::*;
use serde_json::{Number, Value};
use std::sync::Arc;

fn arb_document() -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[a-e]", any::<i32>(), 0..5).prop_map(|fields| {
        fields
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    })
}

fn fresh() -> (Arc<HistoryLedger>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap(),
    ));
    let ledger = Arc::new(HistoryLedger::with_parts(Checksummer::unkeyed(), clock.clone()));
    (ledger, clock)
}

proptest! {
    #[test]
    fn prop_reconstruction_equals_sequential_merge(
        create in arb_document(),
        updates in prop::collection::vec(arb_document(), 0..6),
    ) {
        let (ledger, clock) = fresh();
        ledger.log_entry(
            EntityType::DEAL, "d1", Operation::Create, "u",
            LogOptions::new().with_after(create.clone()),
        ).unwrap();

        let mut expected = create;
        for update in &updates {
            clock.advance(Duration::seconds(5));
            ledger.log_entry(
                EntityType::DEAL, "d1", Operation::Update, "u",
                LogOptions::new().with_after(update.clone()),
            ).unwrap();
            for (k, v) in update {
                expected.insert(k.clone(), v.clone());
            }
        }

        let state = ledger.reconstruct_entity_at(&EntityType::DEAL, "d1", clock.now());
        prop_assert_eq!(state, Some(expected));
    }

    #[test]
    fn prop_any_tampered_entry_is_reported(
        count in 1usize..8,
        victim_seed in any::<usize>(),
        new_actor in "[a-z]{1,8}",
    ) {
        let (ledger, clock) = fresh();
        for i in 0..count {
            clock.advance(Duration::seconds(1));
            ledger.log_entry(
                EntityType::TASK, format!("t{i}"), Operation::Create, "origin",
                LogOptions::new(),
            ).unwrap();
        }
        prop_assert!(ledger.verify_integrity().is_clean());

        let victim = victim_seed % count;
        let mut entries = ledger.entries();
        prop_assume!(entries[victim].actor_id != new_actor);
        entries[victim].actor_id = new_actor;
        let expected = vec![entries[victim].id];

        let reloaded = HistoryLedger::from_entries(entries, Checksummer::unkeyed(), clock).unwrap();
        prop_assert_eq!(reloaded.verify_integrity().corrupted_ids(), expected);
    }

    #[test]
    fn prop_float_snapshots_survive_export_to_disk(
        values in prop::collection::vec(any::<f64>().prop_filter("finite", |v| v.is_finite()), 1..20),
    ) {
        let (ledger, clock) = fresh();
        for (i, value) in values.iter().enumerate() {
            clock.advance(Duration::seconds(1));
            let mut after = Document::new();
            after.insert("value".into(), Value::Number(Number::from_f64(*value).unwrap()));
            ledger.log_entry(
                EntityType::DEAL, format!("d{i}"), Operation::Update, "u",
                LogOptions::new().with_after(after),
            ).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, ledger.export_json().unwrap()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let loaded = HistoryLedger::import_json(&text, Checksummer::unkeyed(), clock).unwrap();

        prop_assert!(loaded.verify_integrity().is_clean());
        let reloaded: Vec<u64> = loaded
            .entries()
            .iter()
            .map(|e| e.after.as_ref().unwrap()["value"].as_f64().unwrap().to_bits())
            .collect();
        let original: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(reloaded, original);
    }
}
