//! The core error surface. Every fallible operation in the store, trading
//! engine, and resolver returns one of these kinds; handlers in `main.rs`
//! translate them to the `{error, message}` HTTP body.

use axum::response::IntoResponse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("market is not open")]
    MarketNotOpen,

    #[error("market already resolved")]
    AlreadyResolved,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("insufficient shares")]
    InsufficientShares,

    #[error("trade would yield zero or negative shares/proceeds")]
    DegenerateTrade,

    #[error("data fetch failed: {0}")]
    FetchFailed(String),

    #[error("path '{0}' missing from fetched payload")]
    PathMissing(String),

    #[error("unknown comparison operator: {0}")]
    UnknownOperator(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl AppError {
    /// The `<Kind>` token used in the `{error: <Kind>, message: <human>}`
    /// HTTP error body (§6 of the design doc).
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "ValidationError",
            AppError::NotFound(_) => "NotFound",
            AppError::MarketNotOpen => "MarketNotOpen",
            AppError::AlreadyResolved => "AlreadyResolved",
            AppError::InsufficientFunds => "InsufficientFunds",
            AppError::InsufficientShares => "InsufficientShares",
            AppError::DegenerateTrade => "DegenerateTrade",
            AppError::FetchFailed(_) => "FetchFailed",
            AppError::PathMissing(_) => "PathMissing",
            AppError::UnknownOperator(_) => "UnknownOperator",
            AppError::InternalError(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MarketNotOpen | AppError::AlreadyResolved => StatusCode::CONFLICT,
            AppError::InsufficientFunds
            | AppError::InsufficientShares
            | AppError::DegenerateTrade => StatusCode::BAD_REQUEST,
            AppError::FetchFailed(_) | AppError::PathMissing(_) | AppError::UnknownOperator(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    /// `{error: <Kind>, message: <human>}` with the status from `status_code`
    /// (§6 of the design doc). `InternalError` details are logged but not
    /// echoed verbatim to the caller.
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = if matches!(self, AppError::InternalError(_)) {
            tracing::error!(error = %self, "internal error");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = axum::Json(serde_json::json!({
            "error": self.kind(),
            "message": message,
        }));
        (status, body).into_response()
    }
}
