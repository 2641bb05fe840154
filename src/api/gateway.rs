//! ゲートウェイハンドラー
//!
//! フォールバックルートで全パスを受け、テナント解決・ボディ読込の後
//! ディスパッチャーへ委譲する。ストリーム応答はチャンク境界を保った
//! ままリレーする。

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::api::AppError;
use crate::common::GatewayError;
use crate::dispatch::{DispatchRequest, DispatchResponse, StreamFraming};
use crate::AppState;

// Streaming LLM requests carry prompts, not uploads.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Tenant header set by the fronting auth layer.
const TENANT_HEADER: &str = "x-tenant-id";

/// Catch-all handler: everything not matched by the state routes is a
/// virtual-base-path request.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let tenant_id = parts
        .headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string();
    let api_key = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let source_ip = client_ip(&parts);

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return AppError(GatewayError::Validation(
                "request body too large or unreadable".to_string(),
            ))
            .into_response()
        }
    };
    let body_value: Value = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(error) => {
                return AppError(GatewayError::Validation(format!(
                    "invalid JSON body: {}",
                    error
                )))
                .into_response()
            }
        }
    };

    let dispatch_request = DispatchRequest {
        tenant_id,
        path,
        source_ip,
        api_key,
        headers: parts.headers,
        body: body_value,
    };

    match state.dispatcher.dispatch(dispatch_request).await {
        Ok(DispatchResponse::Json { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (status, Json(body)).into_response()
        }
        Ok(DispatchResponse::Stream { framing, body }) => {
            let mut response = Response::new(Body::from_stream(body));
            let headers = response.headers_mut();
            headers.insert(
                CONTENT_TYPE,
                framing.content_type().parse().expect("static content type"),
            );
            if framing == StreamFraming::Sse {
                headers.insert(CACHE_CONTROL, "no-cache".parse().expect("static header"));
            }
            response
        }
        Err(error) => AppError(error).into_response(),
    }
}

/// Caller IP: `x-forwarded-for` first, then the socket peer address.
fn client_ip(parts: &axum::http::request::Parts) -> Option<String> {
    if let Some(forwarded) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}
