//! End-to-end concurrency tests: many callers trading against one market
//! through the store's single-writer transaction discipline (§5). Mirrors
//! the teacher's top-level `integration_tests.rs` placement for flows that
//! span more than one module.

use forecast_exchange::engine::Engine;
use forecast_exchange::pricing::Side;
use forecast_exchange::store::Store;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

#[tokio::test]
async fn concurrent_buys_never_overdraw_a_balance() {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let engine = Arc::new(Engine::new(store.clone()));

    let mut user_ids = Vec::new();
    for i in 0..8 {
        let user = store.create_user(&format!("trader-{i}"), 50.0).await.unwrap();
        user_ids.push(user.id);
    }

    let market = store
        .create_market(
            "Concurrent market",
            None,
            "manual",
            None,
            user_ids[0],
            0.0,
            0.0,
            200.0,
            chrono::Utc::now() + chrono::Duration::days(1),
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for (i, user_id) in user_ids.iter().copied().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(i as u64);
            for _ in 0..20 {
                let side = if rng.gen_bool(0.5) { Side::Yes } else { Side::No };
                let amount = rng.gen_range(1.0..10.0);
                // Insufficient funds is an expected, non-fatal outcome once a
                // trader's balance runs low; any other error is a bug.
                match engine.execute_buy(user_id, market.id, side, amount).await {
                    Ok(_) => {}
                    Err(forecast_exchange::error::AppError::InsufficientFunds) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    for user_id in &user_ids {
        let user = store.get_user(*user_id).await.unwrap();
        assert!(user.balance >= -1e-9, "balance went negative: {}", user.balance);
    }

    let yes_positions = {
        let mut tx = store.begin().await.unwrap();
        store
            .list_positions_by_side(&mut tx, market.id, Side::Yes)
            .await
            .unwrap()
    };
    let no_positions = {
        let mut tx = store.begin().await.unwrap();
        store
            .list_positions_by_side(&mut tx, market.id, Side::No)
            .await
            .unwrap()
    };

    let total_yes_shares: f64 = yes_positions.iter().map(|p| p.shares).sum();
    let total_no_shares: f64 = no_positions.iter().map(|p| p.shares).sum();

    let reloaded_market = store.get_market(market.id).await.unwrap();
    assert!((reloaded_market.q_yes - total_yes_shares).abs() < 1e-6);
    assert!((reloaded_market.q_no - total_no_shares).abs() < 1e-6);
}

#[tokio::test]
async fn resolution_pays_winners_exactly_once() {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let engine = Engine::new(store.clone());

    let alice = store.create_user("alice", 1000.0).await.unwrap();
    let bob = store.create_user("bob", 1000.0).await.unwrap();

    let market = store
        .create_market(
            "Resolution payout",
            None,
            "manual",
            None,
            alice.id,
            0.0,
            0.0,
            100.0,
            chrono::Utc::now() - chrono::Duration::seconds(1),
        )
        .await
        .unwrap();

    engine
        .execute_buy(alice.id, market.id, Side::Yes, 30.0)
        .await
        .unwrap();
    engine
        .execute_buy(bob.id, market.id, Side::No, 20.0)
        .await
        .unwrap();

    let fetcher = Arc::new(forecast_exchange::datafetch::StubDataFetcher::ok(
        serde_json::json!({}),
    ));
    let resolver = forecast_exchange::resolver::Resolver::new(store.clone(), fetcher);

    let alice_before = store.get_user(alice.id).await.unwrap().balance;
    let bob_before = store.get_user(bob.id).await.unwrap().balance;

    let outcome = resolver
        .resolve(market.id, Some(Side::Yes), Some("test-harness"))
        .await
        .unwrap();
    assert_eq!(outcome.payouts.len(), 1);

    let alice_after = store.get_user(alice.id).await.unwrap().balance;
    let bob_after = store.get_user(bob.id).await.unwrap().balance;
    assert!(alice_after > alice_before);
    assert_eq!(bob_after, bob_before);

    let err = resolver
        .resolve(market.id, Some(Side::Yes), Some("test-harness"))
        .await
        .unwrap_err();
    assert!(matches!(err, forecast_exchange::error::AppError::AlreadyResolved));

    let alice_after_second_attempt = store.get_user(alice.id).await.unwrap().balance;
    assert_eq!(alice_after, alice_after_second_attempt);
}
