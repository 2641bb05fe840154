//! APIエラーレスポンス変換
//!
//! `GatewayError`をOpenAI互換のJSONエラーレスポンスへ変換する。
//! 内部詳細はサーバーログにのみ出力し、クライアントへは汎用メッセージ
//! を返す。

use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::common::GatewayError;

/// Axum-facing wrapper turning gateway errors into HTTP responses.
pub struct AppError(pub GatewayError);

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, status = %status, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = %status, "request rejected");
        }
        (status, Json(self.0.to_openai_error())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_into_response_status() {
        let response = AppError(GatewayError::NoHealthyEndpoint("/x".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_into_response_capacity() {
        let response = AppError(GatewayError::CapacityExceeded("/x".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
