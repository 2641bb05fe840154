//! エラー型定義
//!
//! 統一エラー型（thiserror使用）
//!
//! # OpenAI互換エラーレスポンス
//!
//! `GatewayError`は`error_type()`と`status_code()`メソッドを提供し、
//! OpenAI互換のエラーレスポンスを生成できます。

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Virtual runner not found for the requested base path
    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    /// Virtual runner exists but is administratively disabled
    #[error("Runner is disabled: {0}")]
    RunnerDisabled(String),

    /// Endpoint not found
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(Uuid),

    /// Operation not permitted for this runner
    #[error("Operation not permitted: {0}")]
    Forbidden(String),

    /// No healthy endpoints available for the runner
    #[error("No healthy endpoints for runner: {0}")]
    NoHealthyEndpoint(String),

    /// All healthy endpoints are at their concurrency limit
    #[error("Capacity exceeded for runner: {0}")]
    CapacityExceeded(String),

    /// Upstream request timed out
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Upstream endpoint returned an error or was unreachable
    #[error("Backend error ({status:?}): {message}")]
    Backend {
        /// HTTP status returned by the endpoint, if any
        status: Option<u16>,
        /// Error detail (internal use only)
        message: String,
    },

    /// Upstream stream payload could not be parsed
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// Client disconnected before the response completed
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Repository error
    #[error("Repository error: {0}")]
    Repository(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns a safe error message for external clients.
    ///
    /// This method returns a generic error message that does not expose
    /// internal implementation details such as endpoint URLs or internal
    /// service names. Use this for HTTP responses to external clients.
    ///
    /// For debugging purposes, use the `Display` implementation (`to_string()`)
    /// which includes full error details - but only in server logs.
    pub fn external_message(&self) -> &'static str {
        match self {
            Self::Config(_) => "Request error",
            Self::Serialization(_) => "Request error",
            Self::Validation(_) => "Invalid request",
            Self::RunnerNotFound(_) => "Model runner not found",
            Self::RunnerDisabled(_) => "Model runner not found",
            Self::EndpointNotFound(_) => "Endpoint not found",
            Self::Forbidden(_) => "Operation not permitted",
            Self::NoHealthyEndpoint(_) => "No healthy endpoints available",
            Self::CapacityExceeded(_) => "All endpoints are busy",
            Self::Timeout(_) => "Request timeout",
            Self::Backend { .. } => "Backend service error",
            Self::ProtocolParse(_) => "Backend returned an invalid response",
            Self::Cancelled(_) => "Request cancelled",
            Self::Repository(_) => "Internal server error",
            Self::Internal(_) => "Internal server error",
        }
    }

    /// Returns the OpenAI-compatible error type string.
    ///
    /// # Error Types
    ///
    /// - `invalid_request_error`: Bad request parameters
    /// - `permission_error`: Authorization failures
    /// - `not_found_error`: Resource not found
    /// - `rate_limit_error`: Too many requests
    /// - `server_error`: Internal server errors
    /// - `service_unavailable`: Backend unavailable
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "invalid_request_error",
            Self::Serialization(_) => "invalid_request_error",
            Self::Validation(_) => "invalid_request_error",
            Self::RunnerNotFound(_) => "not_found_error",
            Self::RunnerDisabled(_) => "not_found_error",
            Self::EndpointNotFound(_) => "not_found_error",
            Self::Forbidden(_) => "permission_error",
            Self::NoHealthyEndpoint(_) => "service_unavailable",
            Self::CapacityExceeded(_) => "rate_limit_error",
            Self::Timeout(_) => "server_error",
            Self::Backend { .. } => "service_unavailable",
            Self::ProtocolParse(_) => "server_error",
            Self::Cancelled(_) => "invalid_request_error",
            Self::Repository(_) => "server_error",
            Self::Internal(_) => "server_error",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RunnerNotFound(_) => StatusCode::NOT_FOUND,
            Self::RunnerDisabled(_) => StatusCode::NOT_FOUND,
            Self::EndpointNotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NoHealthyEndpoint(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Backend { status, .. } => match status {
                // 4xx from the endpoint passes through unchanged
                Some(code) => {
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                None => StatusCode::BAD_GATEWAY,
            },
            Self::ProtocolParse(_) => StatusCode::BAD_GATEWAY,
            // 499 Client Closed Request (nginx convention)
            Self::Cancelled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true when a failover attempt against another endpoint
    /// is allowed for this error.
    ///
    /// Client-side errors (4xx) and cancellations are terminal: retrying
    /// another endpoint would only repeat the same failure.
    pub fn is_failover_eligible(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Backend { status, .. } => match status {
                Some(code) => *code >= 500,
                // Connection-level failure
                None => true,
            },
            _ => false,
        }
    }

    /// Converts this error to an OpenAI-compatible error response.
    pub fn to_openai_error(&self) -> OpenAIErrorResponse {
        OpenAIErrorResponse {
            error: OpenAIErrorDetail {
                message: self.external_message().to_string(),
                error_type: self.error_type().to_string(),
                code: Some(self.status_code().as_u16().to_string()),
            },
        }
    }
}

/// OpenAI互換エラーレスポンス
///
/// # Example
///
/// ```json
/// {
///   "error": {
///     "message": "No healthy endpoints available",
///     "type": "service_unavailable",
///     "code": "503"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIErrorResponse {
    /// The error details
    pub error: OpenAIErrorDetail,
}

/// OpenAIエラー詳細
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIErrorDetail {
    /// Human-readable error message
    pub message: String,
    /// Error type (e.g., "invalid_request_error", "server_error")
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error code (optional, typically HTTP status as string)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Result type alias (Gateway)
pub type GatewayResult<T> = Result<T, GatewayError>;
