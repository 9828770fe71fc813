// Import the things we need
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forecast_exchange::config::Config;
use forecast_exchange::datafetch::{DataFetcher, HttpDataFetcher};
use forecast_exchange::engine::{Engine, TradeAction};
use forecast_exchange::error::{AppError, AppResult};
use forecast_exchange::models::ResolutionCriteria;
use forecast_exchange::pricing::Side;
use forecast_exchange::queries;
use forecast_exchange::resolver::Resolver;
use forecast_exchange::scheduler::Scheduler;
use forecast_exchange::store::Store;

type ApiResult<T> = Result<Json<T>, AppError>;

#[derive(Clone)]
struct AppState {
    store: Store,
    engine: Arc<Engine>,
    resolver: Arc<Resolver>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)?;

    info!(url = %config.database_url(), "opening store");
    let store = Store::connect(&config.database_url()).await?;

    let fetcher: Arc<dyn DataFetcher> =
        Arc::new(HttpDataFetcher::new(Duration::from_secs(config.fetch_timeout_secs)));
    let engine = Arc::new(Engine::new(store.clone()));
    let resolver = Arc::new(Resolver::new(store.clone(), fetcher));

    if config.scheduler.enabled {
        let scheduler = Arc::new(Scheduler::new(
            resolver.clone(),
            Duration::from_secs(config.scheduler.period_secs),
        ));
        let (_handle, _shutdown) = scheduler.spawn();
        info!(period_secs = config.scheduler.period_secs, "resolution scheduler started");
    }

    let app_state = AppState {
        store,
        engine,
        resolver,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/users", post(create_user))
        .route("/users/:id/portfolio", get(get_portfolio))
        .route("/markets", get(list_markets).post(create_market))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/stats", get(get_market_stats))
        .route("/trade/quote", post(trade_quote))
        .route("/trade/buy", post(trade_buy))
        .route("/trade/sell", post(trade_sell))
        .route("/resolutions/:market/resolve", post(resolve_market))
        .route("/resolutions/:market", get(get_resolution))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!(%addr, "starting forecast-exchange");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "forecast-exchange" }))
}

// ---- Users -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    display_name: String,
    #[serde(default)]
    balance: f64,
}

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<Value> {
    if req.display_name.trim().is_empty() {
        return Err(AppError::ValidationError("display_name must not be empty".into()));
    }
    let user = state.store.create_user(&req.display_name, req.balance).await?;
    Ok(Json(json!(user)))
}

async fn get_portfolio(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Value> {
    let portfolio = queries::portfolio(&state.store, id).await?;
    Ok(Json(json!(portfolio)))
}

// ---- Markets -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateMarketRequest {
    title: String,
    category: Option<String>,
    source: String,
    resolution_criteria: Option<ResolutionCriteria>,
    creator: i64,
    b: f64,
    /// Target probability used to seed `(q_yes, q_no)` (§4.1); defaults to 0.5.
    #[serde(default = "default_target_probability")]
    target_probability: f64,
    closes_at: DateTime<Utc>,
}

fn default_target_probability() -> f64 {
    0.5
}

async fn create_market(
    State(state): State<AppState>,
    Json(req): Json<CreateMarketRequest>,
) -> ApiResult<Value> {
    if req.b <= 0.0 {
        return Err(AppError::ValidationError("b must be positive".into()));
    }
    let inv = forecast_exchange::pricing::initial_inventory(req.b, req.target_probability);
    let market = state
        .store
        .create_market(
            &req.title,
            req.category.as_deref(),
            &req.source,
            req.resolution_criteria.as_ref(),
            req.creator,
            inv.q_yes,
            inv.q_no,
            req.b,
            req.closes_at,
        )
        .await?;
    Ok(Json(json!(market)))
}

async fn list_markets(State(state): State<AppState>) -> ApiResult<Value> {
    let markets = state.store.list_markets().await?;
    Ok(Json(json!(markets)))
}

async fn get_market(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Value> {
    let view = queries::market_view(&state.store, id).await?;
    Ok(Json(json!(view)))
}

async fn get_market_stats(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Value> {
    let stats = queries::market_stats(&state.store, id).await?;
    Ok(Json(json!(stats)))
}

// ---- Trading -------------------------------------------------------------

fn parse_side(s: &str) -> AppResult<Side> {
    s.parse::<Side>().map_err(AppError::ValidationError)
}

#[derive(Debug, Deserialize)]
struct QuoteRequest {
    market: i64,
    side: String,
    action: String,
    amount: f64,
}

async fn trade_quote(
    State(state): State<AppState>,
    Json(req): Json<QuoteRequest>,
) -> ApiResult<Value> {
    let side = parse_side(&req.side)?;
    let action = match req.action.as_str() {
        "buy" => TradeAction::Buy,
        "sell" => TradeAction::Sell,
        other => return Err(AppError::ValidationError(format!("unknown action '{other}'"))),
    };
    let quote = state.engine.quote(req.market, side, action, req.amount).await?;
    Ok(Json(json!(quote)))
}

#[derive(Debug, Deserialize)]
struct BuyRequest {
    market: i64,
    user: i64,
    side: String,
    amount: f64,
}

async fn trade_buy(State(state): State<AppState>, Json(req): Json<BuyRequest>) -> ApiResult<Value> {
    let side = parse_side(&req.side)?;
    let result = state
        .engine
        .execute_buy(req.user, req.market, side, req.amount)
        .await?;
    Ok(Json(json!(result)))
}

#[derive(Debug, Deserialize)]
struct SellRequest {
    market: i64,
    user: i64,
    side: String,
    shares: f64,
}

async fn trade_sell(State(state): State<AppState>, Json(req): Json<SellRequest>) -> ApiResult<Value> {
    let side = parse_side(&req.side)?;
    let result = state
        .engine
        .execute_sell(req.user, req.market, side, req.shares)
        .await?;
    Ok(Json(json!(result)))
}

// ---- Resolutions -----------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ResolveRequest {
    outcome: Option<String>,
    resolved_by: Option<String>,
}

async fn resolve_market(
    State(state): State<AppState>,
    Path(market): Path<i64>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Value> {
    let manual_outcome = req.outcome.as_deref().map(parse_side).transpose()?;
    let outcome = state
        .resolver
        .resolve(market, manual_outcome, req.resolved_by.as_deref())
        .await?;
    Ok(Json(json!({
        "market": outcome.market,
        "outcome": outcome.outcome,
        "resolution": outcome.resolution,
        "payouts": outcome.payouts.iter().map(|p| json!({"user": p.user, "amount": p.amount})).collect::<Vec<_>>(),
    })))
}

async fn get_resolution(State(state): State<AppState>, Path(market): Path<i64>) -> ApiResult<Value> {
    let resolution = state.store.get_resolution(market).await?;
    Ok(Json(json!(resolution)))
}
