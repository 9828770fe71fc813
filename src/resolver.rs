//! Resolver (C4): decide and commit a market's outcome.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::datafetch::DataFetcher;
use crate::error::{AppError, AppResult};
use crate::models::{Market, MarketStatus, Resolution};
use crate::pricing::{self, Side};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct Payout {
    pub user: i64,
    pub amount: f64,
}

#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub market: i64,
    pub outcome: Side,
    pub resolution: Resolution,
    pub payouts: Vec<Payout>,
}

pub struct Resolver {
    store: Store,
    fetcher: Arc<dyn DataFetcher>,
}

impl Resolver {
    pub fn new(store: Store, fetcher: Arc<dyn DataFetcher>) -> Self {
        Self { store, fetcher }
    }

    pub fn store_handle(&self) -> &Store {
        &self.store
    }

    /// Resolve `market_id`. `manual_outcome` overrides any configured
    /// source; `resolved_by` identifies the caller and must not be
    /// `"auto"` when `manual_outcome` is supplied (§4.4/§9).
    pub async fn resolve(
        &self,
        market_id: i64,
        manual_outcome: Option<Side>,
        resolved_by: Option<&str>,
    ) -> AppResult<ResolveOutcome> {
        let resolved_by = resolved_by.unwrap_or("auto");
        if manual_outcome.is_some() && resolved_by == "auto" {
            return Err(AppError::ValidationError(
                "manual outcome requires a resolved_by identity other than 'auto'".into(),
            ));
        }

        let market = self.store.get_market(market_id).await?;
        if market.status == MarketStatus::Resolved {
            return Err(AppError::AlreadyResolved);
        }

        let (outcome, source_response, calculation_steps, final_value) =
            self.determine_outcome(&market, manual_outcome).await;

        let mut tx = self.store.begin().await?;
        let now = Utc::now();

        self.store
            .insert_resolution(
                &mut tx,
                market_id,
                outcome,
                &market.source,
                &source_response,
                &calculation_steps,
                final_value.as_ref(),
                resolved_by,
            )
            .await?;

        self.store
            .mark_resolved(&mut tx, market_id, outcome, now)
            .await?;

        let winners = self
            .store
            .list_positions_by_side(&mut tx, market_id, outcome)
            .await?;

        let mut payouts = Vec::with_capacity(winners.len());
        for position in &winners {
            let amount = position.shares * 1.0;
            self.store
                .credit_position_holder(&mut tx, position.user, amount)
                .await?;
            payouts.push(Payout {
                user: position.user,
                amount,
            });
        }

        tx.commit().await?;

        let resolution = self.store.get_resolution(market_id).await?;

        info!(market_id, outcome = outcome.as_str(), payouts = payouts.len(), "market resolved");

        Ok(ResolveOutcome {
            market: market_id,
            outcome,
            resolution,
            payouts,
        })
    }

    /// Decide the outcome and build the proof blob, without touching the
    /// store. Manual override and manual-resolution markets never suspend;
    /// the oracle path suspends exactly once at `fetch`.
    async fn determine_outcome(
        &self,
        market: &Market,
        manual_outcome: Option<Side>,
    ) -> (Side, serde_json::Value, Vec<String>, Option<serde_json::Value>) {
        if let Some(outcome) = manual_outcome {
            return (
                outcome,
                json!({ "manual": true, "outcome": outcome.as_str() }),
                vec!["Market resolved manually".to_string()],
                None,
            );
        }

        if market.source == "manual" {
            return self.resolve_by_probability(market, None);
        }

        self.resolve_by_oracle(market).await
    }

    fn resolve_by_probability(
        &self,
        market: &Market,
        fallback_reason: Option<&str>,
    ) -> (Side, serde_json::Value, Vec<String>, Option<serde_json::Value>) {
        let p_yes = pricing::spot_price(market.inventory(), Side::Yes);
        let outcome = if p_yes > 0.5 { Side::Yes } else { Side::No };

        let mut response = json!({ "probability_path": true, "p_yes": p_yes });
        let mut steps = vec![format!("current p_yes = {p_yes:.6}")];

        if let Some(reason) = fallback_reason {
            response["fallback"] = json!(true);
            response["fetch_error"] = json!(reason);
            steps.insert(0, format!("fetch failed: {reason}"));
        }

        (outcome, response, steps, Some(json!(p_yes)))
    }

    async fn resolve_by_oracle(
        &self,
        market: &Market,
    ) -> (Side, serde_json::Value, Vec<String>, Option<serde_json::Value>) {
        let payload = match self.fetcher.fetch(&market.source).await {
            Ok(p) => p,
            Err(e) => {
                warn!(market_id = market.id, error = %e, "oracle fetch failed, falling back to probability path");
                return self.resolve_by_probability(market, Some(&e.to_string()));
            }
        };

        let Some(criteria) = &market.resolution_criteria else {
            warn!(market_id = market.id, "oracle market has no resolution criteria, falling back");
            return self.resolve_by_probability(market, Some("no resolution criteria configured"));
        };

        let actual = match crate::datafetch::extract(&payload, &criteria.path) {
            Ok(scalar) => scalar,
            Err(e) => {
                warn!(market_id = market.id, error = %e, "path missing in oracle payload, falling back");
                return self.resolve_by_probability(market, Some(&e.to_string()));
            }
        };

        let condition = match crate::datafetch::evaluate(&actual, criteria.operator, &criteria.value) {
            Ok(b) => b,
            Err(e) => {
                warn!(market_id = market.id, error = %e, "evaluation failed, falling back");
                return self.resolve_by_probability(market, Some(&e.to_string()));
            }
        };

        let outcome = if condition { Side::Yes } else { Side::No };
        let steps = vec![
            format!("fetched payload from {}", market.source),
            format!("extracted '{}' -> {:?}", criteria.path, actual),
            format!("evaluated {:?} {:?} {:?}", actual, criteria.operator, criteria.value),
            format!("concluded outcome = {}", outcome.as_str()),
        ];

        (
            outcome,
            json!({ "fetched": payload, "extracted": actual.as_string_coercion() }),
            steps,
            Some(json!(actual.as_string_coercion())),
        )
    }
}
