//! Query projections (C7): derived read-only views assembled from store
//! rows plus the pricing kernel. None of these touch a transaction; they
//! read committed state only (§5).

use serde::Serialize;

use crate::error::AppResult;
use crate::models::{Market, MarketStatus, PricePoint};
use crate::pricing::{self, Side};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct MarketView {
    #[serde(flatten)]
    pub market: Market,
    pub p_yes: f64,
    pub p_no: f64,
    pub volume: f64,
    pub price_history: Vec<PricePoint>,
}

/// Assemble a market's current prices, traded volume, and price history
/// (§4.7 `market_view`).
pub async fn market_view(store: &Store, market_id: i64) -> AppResult<MarketView> {
    let market = store.get_market(market_id).await?;
    let (p_yes, p_no) = pricing::spot_prices(market.inventory());
    let volume = store.sum_transaction_volume(market_id).await?;
    let price_history = store.list_price_history(market_id).await?;

    Ok(MarketView {
        market,
        p_yes,
        p_no,
        volume,
        price_history,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    pub market: i64,
    pub side: Side,
    pub shares: f64,
    pub avg_price: f64,
    pub current_price: f64,
    pub current_value: f64,
    pub cost_basis: f64,
    pub pnl: f64,
    pub potential_payout: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub user: i64,
    pub balance: f64,
    pub positions: Vec<PositionView>,
}

/// Enrich a user's held positions with live prices and PnL (§4.7 `portfolio`).
/// Per §9's decided resolution of the "losing positions after resolution"
/// open question: once a market is resolved, a position on the losing side
/// reports `current_value = 0` and `potential_payout = 0` rather than a
/// price derived from the market's frozen post-resolution inventory.
pub async fn portfolio(store: &Store, user_id: i64) -> AppResult<Portfolio> {
    let user = store.get_user(user_id).await?;
    let positions = store.list_positions_for_user(user_id).await?;

    let mut views = Vec::with_capacity(positions.len());
    for position in positions {
        let market = store.get_market(position.market).await?;
        let is_losing = market.status == MarketStatus::Resolved
            && market.outcome.is_some_and(|outcome| outcome != position.side);

        let current_price = pricing::spot_price(market.inventory(), position.side);
        let cost_basis = position.shares * position.avg_price;
        let (current_value, potential_payout) = if is_losing {
            (0.0, 0.0)
        } else {
            (position.shares * current_price, position.shares * 1.0)
        };

        views.push(PositionView {
            market: position.market,
            side: position.side,
            shares: position.shares,
            avg_price: position.avg_price,
            current_price,
            current_value,
            cost_basis,
            pnl: current_value - cost_basis,
            potential_payout,
        });
    }

    Ok(Portfolio {
        user: user_id,
        balance: user.balance,
        positions: views,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStats {
    pub market: i64,
    pub distinct_traders: i64,
    pub total_volume: f64,
    pub transaction_count: i64,
    pub position_holders: i64,
}

/// Aggregate trading activity for a market (§4.7 `market_stats`).
pub async fn market_stats(store: &Store, market_id: i64) -> AppResult<MarketStats> {
    let distinct_traders = store.count_distinct_traders(market_id).await?;
    let total_volume = store.sum_transaction_volume(market_id).await?;
    let transaction_count = store.count_transactions(market_id).await?;
    let position_holders = store.count_positions(market_id).await?;

    Ok(MarketStats {
        market: market_id,
        distinct_traders,
        total_volume,
        transaction_count,
        position_holders,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[tokio::test]
    async fn market_view_reports_prices_and_volume() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let user = store.create_user("alice", 100.0).await.unwrap();
        let market = store
            .create_market(
                "Will it rain",
                None,
                "manual",
                None,
                user.id,
                0.0,
                0.0,
                100.0,
                chrono::Utc::now() + chrono::Duration::days(1),
            )
            .await
            .unwrap();

        let engine = Engine::new(store.clone());
        engine
            .execute_buy(user.id, market.id, Side::Yes, 10.0)
            .await
            .unwrap();

        let view = market_view(&store, market.id).await.unwrap();
        assert!((view.p_yes - 0.5499).abs() < 1e-3);
        assert!((view.volume - 10.0).abs() < 1e-9);
        assert_eq!(view.price_history.len(), 1);
    }

    #[tokio::test]
    async fn portfolio_computes_pnl_from_current_price() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let user = store.create_user("alice", 100.0).await.unwrap();
        let market = store
            .create_market(
                "Will it rain",
                None,
                "manual",
                None,
                user.id,
                0.0,
                0.0,
                100.0,
                chrono::Utc::now() + chrono::Duration::days(1),
            )
            .await
            .unwrap();

        let engine = Engine::new(store.clone());
        engine
            .execute_buy(user.id, market.id, Side::Yes, 10.0)
            .await
            .unwrap();

        let p = portfolio(&store, user.id).await.unwrap();
        assert_eq!(p.positions.len(), 1);
        let pos = &p.positions[0];
        assert!((pos.cost_basis - 10.0).abs() < 1e-6);
        assert!((pos.current_value - pos.shares * pos.current_price).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_stats_counts_traders_and_transactions() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let user = store.create_user("alice", 100.0).await.unwrap();
        let market = store
            .create_market(
                "Will it rain",
                None,
                "manual",
                None,
                user.id,
                0.0,
                0.0,
                100.0,
                chrono::Utc::now() + chrono::Duration::days(1),
            )
            .await
            .unwrap();

        let engine = Engine::new(store.clone());
        engine
            .execute_buy(user.id, market.id, Side::Yes, 10.0)
            .await
            .unwrap();
        engine
            .execute_buy(user.id, market.id, Side::No, 5.0)
            .await
            .unwrap();

        let stats = market_stats(&store, market.id).await.unwrap();
        assert_eq!(stats.distinct_traders, 1);
        assert_eq!(stats.transaction_count, 2);
        assert_eq!(stats.position_holders, 2);
        assert!((stats.total_volume - 15.0).abs() < 1e-9);
    }
}
