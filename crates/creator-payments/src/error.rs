//! Payment Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Ledger, checkout and reconciliation errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    InvalidSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Event id was already claimed by an earlier delivery
    #[error("Duplicate webhook event: {0}")]
    DuplicateEvent(String),

    /// No credit of the requested kind left
    #[error("Insufficient {kind} credit for {email}")]
    InsufficientCredit { email: String, kind: String },

    /// Per-(viewer, target) cap for this action is exhausted
    #[error("Cap of {cap} {kind} actions reached for {target_id}")]
    CapReached {
        kind: String,
        target_id: String,
        cap: u32,
    },

    /// Checkout mode string not in the price table
    #[error("Unknown checkout mode: {0}")]
    UnknownMode(String),

    /// Request is missing a field or has a malformed one
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client-supplied amount outside the accepted range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Return path is not a local relative path
    #[error("Invalid return path: {0}")]
    InvalidReturnPath(String),

    /// Verification tier downgrade requested while a higher tier is active
    #[error("Downgrade rejected: {0}")]
    DowngradeRejected(String),

    /// Creator profile missing
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Stripe API error or timeout
    #[error("Payment processor unavailable: {0}")]
    DownstreamUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::DownstreamUnavailable(_) | PaymentError::Storage(_)
        )
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::InvalidSignature(_) => "INVALID_SIGNATURE",
            PaymentError::WebhookParse(_) => "WEBHOOK_PARSE",
            PaymentError::DuplicateEvent(_) => "DUPLICATE_EVENT",
            PaymentError::InsufficientCredit { .. } => "INSUFFICIENT_CREDIT",
            PaymentError::CapReached { .. } => "CAP_REACHED",
            PaymentError::UnknownMode(_) => "UNKNOWN_MODE",
            PaymentError::InvalidRequest(_) => "INVALID_REQUEST",
            PaymentError::InvalidAmount(_) => "INVALID_AMOUNT",
            PaymentError::InvalidReturnPath(_) => "INVALID_RETURN_PATH",
            PaymentError::DowngradeRejected(_) => "DOWNGRADE_REJECTED",
            PaymentError::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            PaymentError::DownstreamUnavailable(_) => "DOWNSTREAM_UNAVAILABLE",
            PaymentError::Config(_) => "CONFIG_ERROR",
            PaymentError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            PaymentError::InsufficientCredit { .. } => {
                "No credits left. You can pay by card instead."
            }
            PaymentError::CapReached { .. } => "You've reached the limit for this post.",
            PaymentError::UnknownMode(_) => "That purchase option is not available.",
            PaymentError::InvalidAmount(_) => "Please choose an amount between $1 and $500.",
            PaymentError::DowngradeRejected(_) => {
                "You already have a higher verification tier."
            }
            PaymentError::ProfileNotFound(_) => "Creator profile not found.",
            PaymentError::DownstreamUnavailable(_) => {
                "Payment processing failed. Please try again."
            }
            PaymentError::Config(_) => "Service configuration error.",
            _ => "An error occurred processing your request.",
        }
    }
}

#[cfg(feature = "axum-handlers")]
mod response {
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use serde::Serialize;

    use super::PaymentError;

    #[derive(Debug, Serialize)]
    struct ErrorBody<'a> {
        error: &'a str,
        code: &'static str,
    }

    impl PaymentError {
        /// HTTP status this error maps to
        pub fn status(&self) -> StatusCode {
            match self {
                PaymentError::InvalidSignature(_)
                | PaymentError::WebhookParse(_)
                | PaymentError::InsufficientCredit { .. }
                | PaymentError::UnknownMode(_)
                | PaymentError::InvalidRequest(_)
                | PaymentError::InvalidAmount(_)
                | PaymentError::InvalidReturnPath(_) => StatusCode::BAD_REQUEST,
                PaymentError::CapReached { .. } | PaymentError::DowngradeRejected(_) => {
                    StatusCode::CONFLICT
                }
                PaymentError::DuplicateEvent(_) => StatusCode::OK,
                PaymentError::ProfileNotFound(_) => StatusCode::NOT_FOUND,
                PaymentError::DownstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                PaymentError::Config(_) | PaymentError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
    }

    impl IntoResponse for PaymentError {
        fn into_response(self) -> Response {
            let status = self.status();
            if status.is_server_error() {
                tracing::error!(%status, error = %self, "Payment service error");
            } else {
                tracing::debug!(%status, error = %self, "Request rejected");
            }

            let body = ErrorBody {
                error: self.user_message(),
                code: self.code(),
            };
            (status, Json(body)).into_response()
        }
    }
}
