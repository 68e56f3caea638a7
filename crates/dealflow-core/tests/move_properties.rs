use dealflow_core::MoveStage;
use dealflow_model::DealStatus;
use dealflow_test_utils::Fixture;
use proptest::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_every_move_appends_history(moves in prop::collection::vec(0usize..3, 1..12)) {
        let outcome = block_on(async {
            let fx = Fixture::new();
            let s = fx.dealer_scenario().await;
            let mut deal = fx.deal("Acme").await;
            let mut steps = Vec::new();
            for choice in &moves {
                let (stage, request) = match choice {
                    0 => (&s.investigation, MoveStage::new(s.dealer.id, s.investigation.id)),
                    1 => (&s.lost, MoveStage::new(s.dealer.id, s.lost.id).with_loss_reason("PRICE")),
                    _ => (&s.won, MoveStage::new(s.dealer.id, s.won.id)),
                };
                let before = deal.stage_history.len();
                let was_enrolled = deal.is_in_pipeline(s.integration.id);
                fx.tick(5);
                deal = fx.app.machine.move_stage(deal.id, request, &fx.actor).await.unwrap();
                steps.push((
                    stage.clone(),
                    deal.stage_history.len() - before,
                    was_enrolled,
                    deal.status,
                    deal.stage_in(s.dealer.id),
                ));
            }
            let clean = fx.app.ledger.verify_integrity().is_clean();
            (steps, clean)
        });

        let (steps, clean) = outcome;
        prop_assert!(clean);
        for (stage, appended, was_enrolled, status, current) in steps {
            prop_assert_eq!(current, Some(stage.id));
            let spawned = stage.is_closing && !was_enrolled;
            prop_assert_eq!(appended, if spawned { 2 } else { 1 });
            if stage.is_closing {
                prop_assert_eq!(status, DealStatus::Won);
            }
            if stage.is_lost {
                prop_assert_eq!(status, DealStatus::Lost);
            }
        }
    }
}
