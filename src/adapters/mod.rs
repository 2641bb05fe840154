//! プロトコルアダプター
//!
//! 汎用オペレーション（補完・埋め込み・モデル一覧など）を各方言の
//! HTTP呼び出しに変換し、バッファ/ストリーム両方のレスポンスを
//! 統一内部表現（JSONチャンク列）にデコードする。
//!
//! ストリームはアダプター側のデコードタスクが有界チャネルへ送出し、
//! 受信側（リレー）がチャネルを閉じるとデコードタスクとバックエンド
//! 接続が即座に中断される。

pub mod ollama;
pub mod openai;

pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::common::{GatewayError, GatewayResult};
use crate::types::{Dialect, Endpoint, Operation};

/// Capacity of the decoder → relay channel. Small on purpose: it only
/// smooths bursts, backpressure falls through to the backend socket.
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Backend response in uniform internal representation.
#[derive(Debug)]
pub enum AdapterResponse {
    /// Fully buffered JSON body
    Buffered {
        /// Backend HTTP status
        status: u16,
        /// Deserialized body
        body: Value,
    },
    /// Streamed response, decoded chunk by chunk
    Stream {
        /// Backend HTTP status (always 2xx; failures surface as errors)
        status: u16,
        /// Decoded chunks in arrival order; closes on stream end
        chunks: mpsc::Receiver<GatewayResult<Value>>,
    },
}

/// Shared adapter contract implemented per dialect.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Dialect this adapter speaks.
    fn dialect(&self) -> Dialect;

    /// Invokes one operation against an endpoint.
    ///
    /// `streaming` requests chunked delivery where the operation
    /// supports it; the adapter injects the dialect's stream flag into
    /// the payload. `timeout` bounds the whole call including body
    /// delivery.
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        operation: Operation,
        payload: Value,
        streaming: bool,
        timeout: Duration,
    ) -> GatewayResult<AdapterResponse>;
}

/// Adapter pair, selected by endpoint dialect.
pub struct AdapterSet {
    ollama: OllamaAdapter,
    openai: OpenAIAdapter,
}

impl AdapterSet {
    /// Creates both adapters over a shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            ollama: OllamaAdapter::new(client.clone()),
            openai: OpenAIAdapter::new(client),
        }
    }

    /// Adapter for the given dialect.
    pub fn for_dialect(&self, dialect: Dialect) -> &dyn BackendAdapter {
        match dialect {
            Dialect::Ollama => &self.ollama,
            Dialect::OpenAI => &self.openai,
        }
    }
}

/// Sets the dialect's stream flag on a JSON object payload.
pub(crate) fn set_stream_flag(payload: &mut Value, streaming: bool) {
    if let Some(object) = payload.as_object_mut() {
        object.insert("stream".to_string(), Value::Bool(streaming));
    }
}

/// Maps a transport-level reqwest error onto the gateway taxonomy.
pub(crate) fn map_transport_error(error: reqwest::Error, endpoint: &Endpoint) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout(format!("request to {} timed out", endpoint.base_url()))
    } else {
        GatewayError::Backend {
            status: None,
            message: format!("request to {} failed: {}", endpoint.base_url(), error),
        }
    }
}

/// Converts a non-2xx backend response into a `Backend` error,
/// capturing a bounded slice of the body for logs.
pub(crate) async fn backend_error_from(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let mut detail = response.text().await.unwrap_or_default();
    let mut end = detail.len().min(512);
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    detail.truncate(end);
    GatewayError::Backend {
        status: Some(status),
        message: detail,
    }
}

/// Sends the request, applies auth, and splits 2xx from error responses.
pub(crate) async fn send_checked(
    builder: reqwest::RequestBuilder,
    endpoint: &Endpoint,
    timeout: Duration,
) -> GatewayResult<reqwest::Response> {
    let mut builder = builder.timeout(timeout);
    if let Some(api_key) = &endpoint.api_key {
        builder = builder.bearer_auth(api_key);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| map_transport_error(e, endpoint))?;

    if response.status().is_success() {
        Ok(response)
    } else {
        Err(backend_error_from(response).await)
    }
}

/// Buffers and deserializes a non-streaming response body.
pub(crate) async fn buffer_json(
    response: reqwest::Response,
    endpoint: &Endpoint,
) -> GatewayResult<AdapterResponse> {
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| map_transport_error(e, endpoint))?;
    let body: Value = serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::ProtocolParse(format!("invalid JSON body: {}", e)))?;
    Ok(AdapterResponse::Buffered { status, body })
}

/// Splits buffered bytes into complete lines, returning each with its
/// trailing `\r` removed. Incomplete trailing data stays in the buffer.
pub(crate) fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline_idx) = buffer.find('\n') {
        let line = buffer[..newline_idx].trim_end_matches('\r').to_string();
        buffer.drain(..=newline_idx);
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_stream_flag() {
        let mut payload = json!({"model": "llama3", "stream": true});
        set_stream_flag(&mut payload, false);
        assert_eq!(payload["stream"], json!(false));

        // Non-object payloads are left alone
        let mut payload = json!("scalar");
        set_stream_flag(&mut payload, true);
        assert_eq!(payload, json!("scalar"));
    }

    #[test]
    fn test_drain_lines() {
        let mut buffer = String::from("one\r\ntwo\npartial");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(buffer, "partial");

        buffer.push_str("\n");
        assert_eq!(drain_lines(&mut buffer), vec!["partial".to_string()]);
        assert!(buffer.is_empty());
    }
}
