//! Error handling and JSON error responses for the front door

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway-level failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No rule matched the request
    NoRouteMatched,
    /// Failed to connect to the upstream target
    UpstreamConnectFailed,
    /// Upstream returned a transport-level error
    UpstreamError,
    /// Requested path escapes the configured document root
    PathForbidden,
    /// Requested file or directory does not exist
    NotFound,
    /// Internal front-door error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NoRouteMatched => StatusCode::NOT_FOUND,
            GatewayErrorCode::UpstreamConnectFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::PathForbidden => StatusCode::FORBIDDEN,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Frontdoor-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NoRouteMatched => "NO_ROUTE_MATCHED",
            GatewayErrorCode::UpstreamConnectFailed => "UPSTREAM_CONNECT_FAILED",
            GatewayErrorCode::UpstreamError => "UPSTREAM_ERROR",
            GatewayErrorCode::PathForbidden => "PATH_FORBIDDEN",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Frontdoor-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Frontdoor-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::NoRouteMatched.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayErrorCode::UpstreamConnectFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayErrorCode::PathForbidden.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            GatewayErrorCode::UpstreamConnectFailed,
            "connect to 127.0.0.1:3000 refused",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UPSTREAM_CONNECT_FAILED\""));
        assert!(json.contains("\"message\":\"connect to 127.0.0.1:3000 refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::NoRouteMatched, "no rule matched");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Frontdoor-Error").unwrap(),
            "NO_ROUTE_MATCHED"
        );
    }
}
