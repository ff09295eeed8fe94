use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The single tagged error enum for the gateway. One variant per boundary error
/// code in the tool surface; everything fallible in the library returns
/// `Result<T, GatewayError>`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("syntax error: {0}")]
    SyntaxError(String),

    #[error("security violation: {0}")]
    SecViolation(String),

    #[error("database not allowed: {0}")]
    DbNotAllowed(String),

    #[error("too many concurrent queries for this caller")]
    TooManyConcurrent { retry_after_seconds: u64 },

    #[error("query too expensive: estimated cost {cost:.2} exceeds threshold {threshold:.2}")]
    QueryTooExpensive { cost: f64, threshold: f64 },

    #[error("hint injection failed: {0}")]
    HintInjectionFailed(String),

    #[error("payload too large: exceeded {0} MiB cap")]
    PayloadTooLarge(u64),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("circuit breaker open, database temporarily unavailable")]
    CircuitOpen,

    #[error("database error: {0}")]
    DbError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code, part of the external contract (spec §6).
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::SyntaxError(_) => "SYNTAX_ERROR",
            GatewayError::SecViolation(_) => "SEC_VIOLATION",
            GatewayError::DbNotAllowed(_) => "DB_NOT_ALLOWED",
            GatewayError::TooManyConcurrent { .. } => "TOO_MANY_CONCURRENT",
            GatewayError::QueryTooExpensive { .. } => "QUERY_TOO_EXPENSIVE",
            GatewayError::HintInjectionFailed(_) => "HINT_INJECTION_FAILED",
            GatewayError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            GatewayError::PoolExhausted => "POOL_EXHAUSTED",
            GatewayError::CircuitOpen => "CIRCUIT_OPEN",
            GatewayError::DbError(_) => "DB_ERROR",
            GatewayError::ConfigError(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::SyntaxError(_)
            | GatewayError::SecViolation(_)
            | GatewayError::DbNotAllowed(_) => StatusCode::BAD_REQUEST,
            GatewayError::QueryTooExpensive { .. } | GatewayError::HintInjectionFailed(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            },
            GatewayError::TooManyConcurrent { .. }
            | GatewayError::PoolExhausted
            | GatewayError::CircuitOpen
            | GatewayError::PayloadTooLarge(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DbError(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            GatewayError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            GatewayError::TooManyConcurrent { retry_after_seconds } => {
                Some(*retry_after_seconds)
            },
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::error!(code = self.code(), "{self}");
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code(),
            retry_after_seconds: self.retry_after_seconds(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
