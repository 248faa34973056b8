//! Custom error types for the portal HTTP surface

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::booking::BookingError;
use crate::lifecycle::LifecycleError;

/// Custom error type for the portal HTTP surface
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or bad admin credentials
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Session not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    /// The card was declined; the guest may retry with another session
    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// MQTT or the payment processor is unreachable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The automation layer answered with something unusable
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Internal server error")]
    InternalServerError,
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InvalidInput(msg) => ApiError::BadRequest(msg),
            LifecycleError::NotFound => ApiError::NotFound,
            LifecycleError::Conflict { .. } | LifecycleError::InvalidState { .. } => {
                ApiError::Conflict(err.to_string())
            }
            LifecycleError::ProcessorDeclined(reason) => ApiError::PaymentDeclined(reason),
            LifecycleError::ProcessorUnavailable(reason) => ApiError::Unavailable(reason),
            LifecycleError::Bus(e) => ApiError::Unavailable(e.to_string()),
            LifecycleError::Store(e) => {
                error!("Store failure: {}", e);
                ApiError::InternalServerError
            }
        }
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::Busy => ApiError::TooManyRequests(err.to_string()),
            BookingError::Timeout(_) => ApiError::GatewayTimeout(err.to_string()),
            BookingError::Bus(e) => ApiError::Unavailable(e.to_string()),
            BookingError::InvalidResponse(msg) => ApiError::BadGateway(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentDeclined(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            ApiError::PaymentDeclined(reason) => Json(json!({
                "status": "card_error",
                "error": reason,
            })),
            _ => Json(json!({ "error": message })),
        };

        let mut response = (status, body).into_response();
        if matches!(self, ApiError::Unauthorized) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"EV Portal Admin\""),
            );
        }
        response
    }
}

/// Type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionState;
    use common::error::BusError;

    #[test]
    fn test_lifecycle_status_mapping() {
        let cases = [
            (LifecycleError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                LifecycleError::Conflict {
                    charger_id: "c1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (LifecycleError::ProcessorDeclined("no".into()), StatusCode::PAYMENT_REQUIRED),
            (
                LifecycleError::ProcessorUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (LifecycleError::NotFound, StatusCode::NOT_FOUND),
            (
                LifecycleError::InvalidState {
                    state: SessionState::Captured,
                    operation: "authorize",
                },
                StatusCode::CONFLICT,
            ),
            (LifecycleError::Bus(BusError::Disconnected), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_booking_status_mapping() {
        assert_eq!(
            ApiError::from(BookingError::Busy).into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(BookingError::Timeout(std::time::Duration::from_secs(1)))
                .into_response()
                .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(BookingError::InvalidResponse("bad".into()))
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_unauthorized_challenges_basic() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(
            response.headers()[header::WWW_AUTHENTICATE]
                .to_str()
                .unwrap()
                .starts_with("Basic")
        );
    }
}
