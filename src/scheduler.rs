//! Resolution scheduler (C5): a cooperative task that wakes on a fixed
//! period, resolves every due market, and logs failures per-market rather
//! than surfacing them. Modeled as `loop { sleep(period); resolve_due(); }`
//! per the design doc; tests drive `tick` directly instead of waiting on
//! real time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::resolver::Resolver;

pub struct Scheduler {
    resolver: Arc<Resolver>,
    period: Duration,
}

impl Scheduler {
    pub fn new(resolver: Arc<Resolver>, period: Duration) -> Self {
        Self { resolver, period }
    }

    /// Run one tick: resolve every due market, logging but not propagating
    /// per-market failures. Only a failure of the store write inside
    /// `resolve` itself (surfaced as `AppError::InternalError`) is treated as
    /// persistently stuck and flipped to `closed` so it stops being retried
    /// every tick; earlier failures (`NotFound`, `AlreadyResolved`, ...) are
    /// logged and left for the next tick rather than closed out.
    pub async fn tick(&self) {
        let due = match self.resolver.store_handle().list_markets_due(chrono::Utc::now()).await {
            Ok(markets) => markets,
            Err(e) => {
                error!(error = %e, "failed to list due markets, skipping tick");
                return;
            }
        };

        for market in due {
            match self.resolver.resolve(market.id, None, None).await {
                Ok(outcome) => {
                    info!(market_id = market.id, outcome = outcome.outcome.as_str(), "scheduled resolution succeeded");
                }
                Err(e @ AppError::InternalError(_)) => {
                    warn!(market_id = market.id, error = %e, "scheduled resolution hit a persistent store failure, closing market");
                    if let Err(close_err) = self.resolver.store_handle().mark_closed(market.id).await {
                        error!(market_id = market.id, error = %close_err, "failed to close persistently-stuck market");
                    }
                }
                Err(e) => {
                    warn!(market_id = market.id, error = %e, "scheduled resolution failed, will retry next tick");
                }
            }
        }
    }

    /// Spawn the tick loop as a background task. The returned sender, when
    /// dropped or sent `true`, causes the loop to finish its current tick
    /// and exit rather than starting another.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("scheduler shutting down after current tick");
                            break;
                        }
                    }
                }
            }
        });
        (handle, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafetch::StubDataFetcher;
    use crate::store::Store;

    #[tokio::test]
    async fn tick_resolves_manual_markets_past_close() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let user = store.create_user("alice", 100.0).await.unwrap();
        let market = store
            .create_market(
                "Past due",
                None,
                "manual",
                None,
                user.id,
                0.0,
                0.0,
                100.0,
                chrono::Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let fetcher = Arc::new(StubDataFetcher::ok(serde_json::json!({})));
        let resolver = Arc::new(Resolver::new(store.clone(), fetcher));
        let scheduler = Scheduler::new(resolver, Duration::from_secs(60));

        scheduler.tick().await;

        let reloaded = store.get_market(market.id).await.unwrap();
        assert_eq!(reloaded.status, crate::models::MarketStatus::Resolved);
    }
}
