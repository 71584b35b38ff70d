/* src/error.rs */

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fancy_log::{LogLevel, log};
use serde_json::json;

#[derive(Debug)]
pub enum GatewayError {
    /// No configured route matched the request.
    RouteNotFound,
    /// Missing, malformed, or expired bearer token.
    Unauthorized(String),
    /// The route's token bucket is empty.
    TooManyRequests,
    /// Circuit open or no healthy instance for the named service.
    ServiceUnavailable(String),
    /// Downstream transport failure after all attempts.
    BadGateway(anyhow::Error),
    /// The downstream call exceeded the route's timeout.
    GatewayTimeout(String),
}

impl GatewayError {
    /// The HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Builds the JSON error body shared by every gateway rejection.
fn error_body(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
        "statusCode": status.as_u16(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            GatewayError::RouteNotFound => error_body(status, "No route found for this path"),
            GatewayError::Unauthorized(reason) => {
                log(
                    LogLevel::Warn,
                    &format!("Rejected unauthenticated request: {}", reason),
                );
                error_body(status, &reason)
            }
            GatewayError::TooManyRequests => {
                error_body(status, "Rate limit exceeded. Please slow down.")
            }
            GatewayError::ServiceUnavailable(service) => error_body(
                status,
                &format!(
                    "{} is currently unavailable. Please try again later.",
                    service
                ),
            ),
            GatewayError::BadGateway(e) => {
                log(LogLevel::Error, &format!("Upstream error: {}", e));
                error_body(status, "Upstream server error")
            }
            GatewayError::GatewayTimeout(service) => {
                log(
                    LogLevel::Error,
                    &format!("Upstream timeout while calling {}", service),
                );
                error_body(status, "Upstream server timed out")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_map_to_their_status() {
        assert_eq!(GatewayError::RouteNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::Unauthorized("expired".to_string()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::TooManyRequests.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::ServiceUnavailable("job-service".to_string()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::BadGateway(anyhow::anyhow!("connect refused")).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::GatewayTimeout("job-service".to_string()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn errors_format_for_test_assertions() {
        let rendered = format!("{:?}", GatewayError::Unauthorized("expired".to_string()));
        assert!(rendered.contains("Unauthorized"));
    }
}
