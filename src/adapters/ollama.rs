//! Ollama方言アダプター
//!
//! `/api/chat` 等のJSON APIと、改行区切りJSON（NDJSON）ストリームを
//! 扱う。ストリームはパース済みチャンクの `done` フラグ、または
//! 接続クローズで終了する。

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::adapters::{
    buffer_json, drain_lines, map_transport_error, send_checked, set_stream_flag,
    AdapterResponse, BackendAdapter, STREAM_CHANNEL_CAPACITY,
};
use crate::common::GatewayResult;
use crate::types::{Dialect, Endpoint, Operation};

/// Ollama backend adapter.
pub struct OllamaAdapter {
    client: reqwest::Client,
}

impl OllamaAdapter {
    /// Creates an adapter over the shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn route(operation: Operation) -> (reqwest::Method, &'static str) {
        match operation {
            Operation::ChatCompletion => (reqwest::Method::POST, "/api/chat"),
            Operation::Completion => (reqwest::Method::POST, "/api/generate"),
            Operation::Embeddings => (reqwest::Method::POST, "/api/embed"),
            Operation::ListModels => (reqwest::Method::GET, "/api/tags"),
            Operation::PullModel => (reqwest::Method::POST, "/api/pull"),
            Operation::DeleteModel => (reqwest::Method::DELETE, "/api/delete"),
        }
    }
}

#[async_trait]
impl BackendAdapter for OllamaAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Ollama
    }

    async fn invoke(
        &self,
        endpoint: &Endpoint,
        operation: Operation,
        mut payload: Value,
        streaming: bool,
        timeout: Duration,
    ) -> GatewayResult<AdapterResponse> {
        let (method, path) = Self::route(operation);
        let url = format!("{}{}", endpoint.base_url(), path);

        let mut builder = self.client.request(method.clone(), &url);
        if method != reqwest::Method::GET {
            let streaming = streaming && operation.supports_streaming();
            set_stream_flag(&mut payload, streaming);
            builder = builder.json(&payload);
        }

        let response = send_checked(builder, endpoint, timeout).await?;

        if streaming && operation.supports_streaming() {
            let status = response.status().as_u16();
            let chunks = spawn_ndjson_decoder(response, endpoint.clone());
            Ok(AdapterResponse::Stream { status, chunks })
        } else if operation == Operation::DeleteModel {
            // Ollama answers delete with an empty 200 body
            let status = response.status().as_u16();
            Ok(AdapterResponse::Buffered {
                status,
                body: Value::Object(serde_json::Map::new()),
            })
        } else {
            buffer_json(response, endpoint).await
        }
    }
}

/// Decodes an NDJSON response into JSON chunks on a bounded channel.
///
/// Each non-blank line is parsed independently; a parse failure is
/// logged and the line skipped. The stream ends when a chunk reports
/// `done: true` or the connection closes. The task exits as soon as
/// the receiver is dropped, aborting the backend connection.
fn spawn_ndjson_decoder(
    response: reqwest::Response,
    endpoint: Endpoint,
) -> mpsc::Receiver<GatewayResult<Value>> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for line in drain_lines(&mut buffer) {
                        if let Some(value) = decode_ndjson_line(&line, &endpoint) {
                            let done =
                                value.get("done").and_then(Value::as_bool) == Some(true);
                            if tx.send(Ok(value)).await.is_err() {
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    let _ = tx
                        .send(Err(map_transport_error(error, &endpoint)))
                        .await;
                    return;
                }
            }
        }

        // Final line without a trailing newline
        if !buffer.is_empty() {
            let line = std::mem::take(&mut buffer);
            if let Some(value) = decode_ndjson_line(line.trim_end_matches('\r'), &endpoint) {
                let _ = tx.send(Ok(value)).await;
            }
        }
    });

    rx
}

fn decode_ndjson_line(line: &str, endpoint: &Endpoint) -> Option<Value> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(
                endpoint_id = %endpoint.id,
                error = %error,
                "skipping malformed NDJSON line"
            );
            None
        }
    }
}
