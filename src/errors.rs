//! Error taxonomy — categories with defined semantics, not just type names.
//!
//! Each variant maps to an HTTP status for the control plane and carries
//! the retry/failover predicates the executor and account orchestrator
//! branch on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Input does not satisfy schema/invariants. Permanent, not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing/invalid credentials or token. Permanent for the account.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Rate limit, subscription limit, quota exhaustion. Transient at the
    /// account level.
    #[error("limit error: {0}")]
    LimitError(String),

    /// Network timeout, 5xx, bus unavailable, circuit open. Retried with
    /// backoff within an attempt budget.
    #[error("transient error: {0}")]
    Transient(String),

    /// Invariant violation (corrupt state, internal bug).
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("lease timeout after waiting for account session")]
    LeaseTimeout,

    #[error("all accounts are rate-limited or unavailable")]
    AllAccountsLimited,

    #[error("account capacity exceeded (M*K subscriptions)")]
    AccountCapacityExceeded,

    #[error("registry unavailable: initial load never completed")]
    RegistryUnavailable,

    #[error("circuit open, publish/call skipped")]
    CircuitOpen,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Transient errors (and limit errors for read-only ops) are worth
    /// retrying within the attempt budget.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_)
                | GatewayError::CircuitOpen
                | GatewayError::LeaseTimeout
                | GatewayError::LimitError(_)
        )
    }

    /// Drives C5 failover: only a limit error triggers switching accounts.
    pub fn is_limit_error(&self) -> bool {
        matches!(self, GatewayError::LimitError(_) | GatewayError::AllAccountsLimited)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::Validation(_) | GatewayError::Authorization(_))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Authorization(_) => StatusCode::UNAUTHORIZED,
            GatewayError::LimitError(_) | GatewayError::AllAccountsLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Transient(_)
            | GatewayError::CircuitOpen
            | GatewayError::RegistryUnavailable
            | GatewayError::LeaseTimeout => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AccountCapacityExceeded => StatusCode::CONFLICT,
            GatewayError::Fatal(_) | GatewayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Messages never leak credentials or internal paths.
        let body = json!({ "error": status.canonical_reason().unwrap_or("error"), "message": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
