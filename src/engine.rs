//! Trading engine (C3): quoting and trade execution against the store.

use serde::Serialize;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{Market, Position, TransactionType};
use crate::pricing::{self, Side};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub market: i64,
    pub side: Side,
    pub shares: f64,
    pub avg_price: f64,
    pub total_cash: f64,
    pub price_impact: f64,
    pub spot_before: f64,
    pub p_yes_after: f64,
    pub p_no_after: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub transaction_id: i64,
    pub shares: f64,
    pub price_per_share: f64,
    pub total_cost: f64,
    pub new_balance: f64,
    pub new_position: Option<Position>,
}

pub struct Engine {
    store: Store,
}

impl Engine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Quote a prospective trade without mutating any state (§4.3 `quote`).
    pub async fn quote(&self, market_id: i64, side: Side, action: TradeAction, amount: f64) -> AppResult<Quote> {
        if amount <= 0.0 {
            return Err(AppError::ValidationError("amount must be positive".into()));
        }
        let market = self.store.get_market(market_id).await?;
        if market.status != crate::models::MarketStatus::Open {
            return Err(AppError::MarketNotOpen);
        }
        let inv = market.inventory();

        match action {
            TradeAction::Buy => {
                let q = pricing::quote_buy(inv, side, amount).ok_or(AppError::DegenerateTrade)?;
                Ok(Quote {
                    market: market_id,
                    side,
                    shares: q.shares,
                    avg_price: q.avg_price,
                    total_cash: amount,
                    price_impact: q.price_impact,
                    spot_before: q.spot_before,
                    p_yes_after: q.p_yes_after,
                    p_no_after: q.p_no_after,
                })
            }
            TradeAction::Sell => {
                let q = pricing::quote_sell(inv, side, amount).ok_or(AppError::DegenerateTrade)?;
                Ok(Quote {
                    market: market_id,
                    side,
                    shares: amount,
                    avg_price: q.avg_price,
                    total_cash: q.proceeds,
                    price_impact: q.price_impact,
                    spot_before: q.spot_before,
                    p_yes_after: q.p_yes_after,
                    p_no_after: q.p_no_after,
                })
            }
        }
    }

    /// Execute a buy of `amount` cash worth of `side` shares (§4.3 `execute_buy`).
    pub async fn execute_buy(
        &self,
        user_id: i64,
        market_id: i64,
        side: Side,
        amount: f64,
    ) -> AppResult<TradeResult> {
        if amount <= 0.0 {
            return Err(AppError::ValidationError("amount must be positive".into()));
        }

        let mut tx = self.store.begin().await?;

        let market = self.store.load_market_for_trade(&mut tx, market_id).await?;
        let inv = market.inventory();

        let q = pricing::quote_buy(inv, side, amount).ok_or(AppError::DegenerateTrade)?;
        if q.shares <= 0.0 {
            return Err(AppError::DegenerateTrade);
        }

        let new_balance = self.store.debit_balance(&mut tx, user_id, amount).await?;

        let (new_q_yes, new_q_no) = apply_delta(inv.q_yes, inv.q_no, side, q.shares);
        self.store
            .update_market_inventory(&mut tx, market_id, new_q_yes, new_q_no)
            .await?;

        self.store
            .upsert_position(&mut tx, user_id, market_id, side, q.shares, amount)
            .await?;

        let transaction_id = self
            .store
            .append_transaction(
                &mut tx,
                user_id,
                market_id,
                side,
                TransactionType::Buy,
                q.shares,
                q.avg_price,
                amount,
            )
            .await?;

        self.store
            .append_price_point(&mut tx, market_id, q.p_yes_after, q.p_no_after)
            .await?;

        let new_position = self
            .store
            .get_position(&mut tx, user_id, market_id, side)
            .await?;

        tx.commit().await?;

        info!(market_id, user_id, side = side.as_str(), shares = q.shares, "buy executed");

        Ok(TradeResult {
            transaction_id,
            shares: q.shares,
            price_per_share: q.avg_price,
            total_cost: amount,
            new_balance,
            new_position,
        })
    }

    /// Execute a sell of `shares_to_sell` shares of `side` (§4.3 `execute_sell`).
    pub async fn execute_sell(
        &self,
        user_id: i64,
        market_id: i64,
        side: Side,
        shares_to_sell: f64,
    ) -> AppResult<TradeResult> {
        if shares_to_sell <= 0.0 {
            return Err(AppError::ValidationError("shares must be positive".into()));
        }

        let mut tx = self.store.begin().await?;

        let market = self.store.load_market_for_trade(&mut tx, market_id).await?;
        let position = self
            .store
            .get_position(&mut tx, user_id, market_id, side)
            .await?
            .ok_or(AppError::InsufficientShares)?;

        if position.shares < shares_to_sell {
            return Err(AppError::InsufficientShares);
        }

        let inv = market.inventory();
        let q = pricing::quote_sell(inv, side, shares_to_sell).ok_or(AppError::DegenerateTrade)?;

        let new_balance = self.store.credit_balance(&mut tx, user_id, q.proceeds).await?;

        let (new_q_yes, new_q_no) = apply_delta(inv.q_yes, inv.q_no, side, -shares_to_sell);
        self.store
            .update_market_inventory(&mut tx, market_id, new_q_yes, new_q_no)
            .await?;

        let remaining = position.shares - shares_to_sell;
        self.store
            .reduce_position(&mut tx, position.id, remaining)
            .await?;

        let transaction_id = self
            .store
            .append_transaction(
                &mut tx,
                user_id,
                market_id,
                side,
                TransactionType::Sell,
                shares_to_sell,
                q.avg_price,
                q.proceeds,
            )
            .await?;

        self.store
            .append_price_point(&mut tx, market_id, q.p_yes_after, q.p_no_after)
            .await?;

        let new_position = self
            .store
            .get_position(&mut tx, user_id, market_id, side)
            .await?;

        tx.commit().await?;

        info!(market_id, user_id, side = side.as_str(), shares = shares_to_sell, "sell executed");

        Ok(TradeResult {
            transaction_id,
            shares: shares_to_sell,
            price_per_share: q.avg_price,
            total_cost: q.proceeds,
            new_balance,
            new_position,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn apply_delta(q_yes: f64, q_no: f64, side: Side, delta: f64) -> (f64, f64) {
    match side {
        Side::Yes => (q_yes + delta, q_no),
        Side::No => (q_yes, q_no + delta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn test_engine() -> Engine {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        Engine::new(store)
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_state_unchanged() {
        let engine = test_engine().await;
        let user = engine.store().create_user("alice", 5.0).await.unwrap();
        let market = engine
            .store()
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

        let err = engine
            .execute_buy(user.id, market.id, Side::Yes, 10.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds));

        let reloaded = engine.store().get_user(user.id).await.unwrap();
        assert_eq!(reloaded.balance, 5.0);
    }

    #[tokio::test]
    async fn sell_unwind_returns_at_most_the_stake() {
        let engine = test_engine().await;
        let user = engine.store().create_user("bob", 1000.0).await.unwrap();
        let market = engine
            .store()
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

        let buy = engine
            .execute_buy(user.id, market.id, Side::Yes, 10.0)
            .await
            .unwrap();
        let sell = engine
            .execute_sell(user.id, market.id, Side::Yes, buy.shares)
            .await
            .unwrap();

        assert!(sell.total_cost <= 10.0 + 1e-6);
        let reloaded_user = engine.store().get_user(user.id).await.unwrap();
        assert!((reloaded_user.balance - (1000.0 - (10.0 - sell.total_cost))).abs() < 1e-6);
        assert!(sell.new_position.is_none());
    }
}
