use dealflow_catalog::{CatalogConfig, NewPipeline, NewStage, PipelineCatalog};
use dealflow_ledger::HistoryLedger;
use dealflow_model::{Actor, Deal, InMemoryStore, Pipeline, Stage, StageId};
use proptest::prelude::*;
use std::sync::Arc;

fn catalog() -> PipelineCatalog {
    PipelineCatalog::new(
        Arc::new(InMemoryStore::<Pipeline>::new()),
        Arc::new(InMemoryStore::<Stage>::new()),
        Arc::new(InMemoryStore::<Deal>::new()),
        Arc::new(HistoryLedger::new()),
        &CatalogConfig::default(),
    )
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn prop_reorder_follows_permutation(
        permutation in (1usize..7).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let (expected, actual) = block_on(async {
            let catalog = catalog();
            let admin = Actor::new("admin");
            let pipeline = catalog
                .create_pipeline(NewPipeline::named("P"), &admin)
                .await
                .unwrap();
            let mut ids = Vec::new();
            for i in 0..permutation.len() {
                let stage = catalog
                    .create_stage(pipeline.id, NewStage::named(format!("S{i}")), &admin)
                    .await
                    .unwrap();
                ids.push(stage.id);
            }

            let wanted: Vec<StageId> = permutation.iter().map(|&i| ids[i]).collect();
            catalog.reorder_stages(pipeline.id, &wanted, &admin).await.unwrap();

            let view = catalog.get_with_stages(pipeline.id).await.unwrap();
            let actual: Vec<(StageId, u32)> = view.stages.iter().map(|s| (s.id, s.order)).collect();
            let expected: Vec<(StageId, u32)> = wanted.into_iter().zip(0u32..).collect();
            prop_assert_eq!(&view.pipeline.stage_ids, &expected.iter().map(|(id, _)| *id).collect::<Vec<_>>());
            Ok((expected, actual))
        })?;
        prop_assert_eq!(expected, actual);
    }
}
