use chrono::{Duration, Utc};
use inventory_service::clock::{Clock, ManualClock};
use inventory_service::engine::*;
use inventory_service::models::{NewVariantStock, Reservation, ReservationStatus};
use inventory_service::store::MemoryStockStore;
use std::sync::Arc;
use uuid::Uuid;

async fn engine_with_stock(on_hand: i32) -> (Arc<ReservationEngine<MemoryStockStore>>, Arc<ManualClock>, Uuid) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = Arc::new(ReservationEngine::new(
        MemoryStockStore::new(),
        clock.clone(),
        EngineConfig::default(),
    ));
    let variant_id = Uuid::new_v4();
    engine
        .register_variant(NewVariantStock {
            variant_id,
            product_id: Uuid::new_v4(),
            sku: "SB-DUNK-PANDA-9".to_string(),
            quantity_on_hand: on_hand,
            low_stock_threshold: Some(2),
            is_active: true,
        })
        .await
        .unwrap();
    (engine, clock, variant_id)
}

fn expect_reserved(outcome: ReserveOutcome) -> Reservation {
    match outcome {
        ReserveOutcome::Reserved(r) => r,
        other => panic!("expected a reservation, got {:?}", other),
    }
}

async fn counters(engine: &ReservationEngine<MemoryStockStore>, variant_id: Uuid) -> (i32, i32, i32) {
    let s = engine.stock(variant_id).await.unwrap().unwrap();
    (s.quantity_on_hand, s.quantity_reserved, s.quantity_available)
}

#[tokio::test]
async fn checkout_scenario_end_to_end() {
    let (engine, _, variant_id) = engine_with_stock(10).await;

    let first = expect_reserved(engine.reserve(variant_id, 4, None, Some("cart-a".into())).await.unwrap());
    let second = expect_reserved(engine.reserve(variant_id, 6, None, Some("cart-b".into())).await.unwrap());
    assert_eq!(counters(&engine, variant_id).await, (10, 10, 0));

    assert_eq!(
        engine.reserve(variant_id, 1, None, None).await.unwrap(),
        ReserveOutcome::InsufficientStock { requested: 1, available: 0 }
    );

    let confirmed = engine.confirm(first.id, "order-1".into()).await.unwrap();
    assert!(matches!(confirmed, ConfirmOutcome::Confirmed { replayed: false, .. }));
    assert_eq!(counters(&engine, variant_id).await, (6, 6, 0));

    let released = engine.release(second.id, "payment_failed").await.unwrap();
    assert!(matches!(released, ReleaseOutcome::Released { replayed: false, .. }));
    assert_eq!(counters(&engine, variant_id).await, (6, 0, 6));

    assert!(engine.reconcile(variant_id).await.unwrap().unwrap().consistent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_oversell() {
    let (engine, _, variant_id) = engine_with_stock(3).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.reserve(variant_id, 2, None, None).await.unwrap() }));
    }

    let mut won = 0;
    for task in tasks {
        match task.await.unwrap() {
            ReserveOutcome::Reserved(_) => won += 1,
            ReserveOutcome::InsufficientStock { available, .. } => assert!(available < 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(counters(&engine, variant_id).await, (3, 2, 1));
}

#[tokio::test]
async fn confirm_is_idempotent() {
    let (engine, _, variant_id) = engine_with_stock(5).await;
    let r = expect_reserved(engine.reserve(variant_id, 2, None, None).await.unwrap());

    engine.confirm(r.id, "order-9".into()).await.unwrap();
    let replay = engine.confirm(r.id, "order-9".into()).await.unwrap();
    assert!(matches!(replay, ConfirmOutcome::Confirmed { replayed: true, .. }));
    assert_eq!(counters(&engine, variant_id).await, (3, 0, 3));

    let sales = engine
        .movements(variant_id, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.movement_type == "sale")
        .count();
    assert_eq!(sales, 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let (engine, _, variant_id) = engine_with_stock(5).await;
    let r = expect_reserved(engine.reserve(variant_id, 2, None, None).await.unwrap());

    engine.release(r.id, "payment_failed").await.unwrap();
    let replay = engine.release(r.id, "payment_failed").await.unwrap();
    assert!(matches!(replay, ReleaseOutcome::Released { replayed: true, .. }));
    assert_eq!(counters(&engine, variant_id).await, (5, 0, 5));

    // A released hold can no longer be sold.
    assert_eq!(
        engine.confirm(r.id, "order-1".into()).await.unwrap(),
        ConfirmOutcome::AlreadyTerminal(ReservationStatus::Released)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_and_release_race_has_one_winner() {
    for _ in 0..20 {
        let (engine, _, variant_id) = engine_with_stock(4).await;
        let r = expect_reserved(engine.reserve(variant_id, 3, None, None).await.unwrap());

        let confirm = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.confirm(r.id, "order-race".into()).await.unwrap() })
        };
        let release = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.release(r.id, "payment_failed").await.unwrap() })
        };
        let confirm = confirm.await.unwrap();
        let release = release.await.unwrap();

        let final_status = engine.reservation(r.id).await.unwrap().unwrap().status().unwrap();
        match final_status {
            ReservationStatus::Confirmed => {
                assert!(matches!(confirm, ConfirmOutcome::Confirmed { replayed: false, .. }));
                assert_eq!(release, ReleaseOutcome::AlreadyTerminal(ReservationStatus::Confirmed));
                assert_eq!(counters(&engine, variant_id).await, (1, 0, 1));
            }
            ReservationStatus::Released => {
                assert!(matches!(release, ReleaseOutcome::Released { replayed: false, .. }));
                assert_eq!(confirm, ConfirmOutcome::AlreadyTerminal(ReservationStatus::Released));
                assert_eq!(counters(&engine, variant_id).await, (4, 0, 4));
            }
            other => panic!("unexpected final status {}", other),
        }
    }
}

#[tokio::test]
async fn lapsed_holds_cannot_be_confirmed_and_are_swept() {
    let (engine, clock, variant_id) = engine_with_stock(5).await;
    let short = expect_reserved(engine.reserve(variant_id, 2, Some(5), None).await.unwrap());
    let long = expect_reserved(engine.reserve(variant_id, 1, Some(30), None).await.unwrap());

    clock.advance(Duration::minutes(5));
    assert_eq!(engine.confirm(short.id, "order-2".into()).await.unwrap(), ConfirmOutcome::Expired);
    // Still counted until the sweeper runs.
    assert_eq!(counters(&engine, variant_id).await, (5, 3, 2));
    assert_eq!(engine.status().await.unwrap().needs_cleanup_count, 1);

    let report = engine.sweep_expired(clock.now()).await.unwrap();
    assert_eq!(report, SweepReport { scanned: 1, expired: 1, skipped: 0, failed: 0 });
    assert_eq!(counters(&engine, variant_id).await, (5, 1, 4));

    let swept = engine.reservation(short.id).await.unwrap().unwrap();
    assert_eq!(swept.status().unwrap(), ReservationStatus::Expired);
    assert_eq!(swept.release_reason.as_deref(), Some("hold_expired"));

    // Second sweep finds nothing; the longer hold is untouched.
    assert_eq!(engine.sweep_expired(clock.now()).await.unwrap().scanned, 0);
    assert_eq!(
        engine.reservation(long.id).await.unwrap().unwrap().status().unwrap(),
        ReservationStatus::Active
    );

    // Releasing an expired hold is a no-op success.
    let replay = engine.release(short.id, "payment_failed").await.unwrap();
    assert!(matches!(replay, ReleaseOutcome::Released { replayed: true, .. }));
    assert!(engine.reconcile(variant_id).await.unwrap().unwrap().consistent);
}

#[tokio::test]
async fn every_counter_change_is_logged() {
    let (engine, _, variant_id) = engine_with_stock(8).await;
    let a = expect_reserved(engine.reserve(variant_id, 3, None, None).await.unwrap());
    let b = expect_reserved(engine.reserve(variant_id, 2, None, None).await.unwrap());
    engine.confirm(a.id, "order-3".into()).await.unwrap();
    engine.cancel(b.id).await.unwrap();

    let movements = engine.movements(variant_id, 10).await.unwrap();
    let kinds: Vec<&str> = movements.iter().map(|m| m.movement_type.as_str()).collect();
    assert_eq!(kinds, vec!["reservation_release", "sale", "reservation_hold", "reservation_hold"]);

    for m in &movements {
        assert_eq!(m.quantity_after - m.quantity_before, m.quantity_delta);
    }
    let sale = &movements[1];
    assert_eq!((sale.quantity_before, sale.quantity_after), (8, 5));
    assert_eq!(sale.reference_id.as_deref(), Some("order-3"));
    let cancel = &movements[0];
    assert_eq!(cancel.reference_id, Some(b.id.to_string()));
}

#[tokio::test]
async fn reserved_matches_active_holds_after_mixed_traffic() {
    let (engine, clock, variant_id) = engine_with_stock(20).await;
    let mut ids = Vec::new();
    for quantity in 1..=5 {
        ids.push(expect_reserved(engine.reserve(variant_id, quantity, Some(quantity as i64 * 2), None).await.unwrap()).id);
    }
    engine.confirm(ids[4], "order-x".into()).await.unwrap();
    engine.release(ids[0], "abandoned").await.unwrap();
    clock.advance(Duration::minutes(6));
    engine.sweep_expired(clock.now()).await.unwrap();

    let report = engine.reconcile(variant_id).await.unwrap().unwrap();
    assert!(report.consistent);
    assert_eq!(report.active_reserved, 4);
    assert_eq!(counters(&engine, variant_id).await, (15, 4, 11));
}

#[tokio::test]
async fn inactive_and_unknown_variants_are_refused() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = ReservationEngine::new(MemoryStockStore::new(), clock, EngineConfig::default());
    let variant_id = Uuid::new_v4();
    engine
        .register_variant(NewVariantStock {
            variant_id,
            product_id: Uuid::new_v4(),
            sku: "RETIRED-1".to_string(),
            quantity_on_hand: 10,
            low_stock_threshold: None,
            is_active: false,
        })
        .await
        .unwrap();

    assert_eq!(engine.reserve(variant_id, 1, None, None).await.unwrap(), ReserveOutcome::Inactive);
    assert_eq!(engine.reserve(Uuid::new_v4(), 1, None, None).await.unwrap(), ReserveOutcome::NotFound);
}
