//! OpenAI方言アダプター
//!
//! `/v1/chat/completions` 等のJSON APIと、`data: ` フレーミング +
//! `[DONE]` センチネルのSSEストリームを扱う。

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::adapters::{
    buffer_json, drain_lines, map_transport_error, send_checked, set_stream_flag,
    AdapterResponse, BackendAdapter, STREAM_CHANNEL_CAPACITY,
};
use crate::common::{GatewayError, GatewayResult};
use crate::types::{Dialect, Endpoint, Operation};

/// OpenAI-compatible backend adapter.
pub struct OpenAIAdapter {
    client: reqwest::Client,
}

impl OpenAIAdapter {
    /// Creates an adapter over the shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn route(operation: Operation) -> GatewayResult<(reqwest::Method, &'static str)> {
        match operation {
            Operation::ChatCompletion => Ok((reqwest::Method::POST, "/v1/chat/completions")),
            Operation::Completion => Ok((reqwest::Method::POST, "/v1/completions")),
            Operation::Embeddings => Ok((reqwest::Method::POST, "/v1/embeddings")),
            Operation::ListModels => Ok((reqwest::Method::GET, "/v1/models")),
            Operation::PullModel | Operation::DeleteModel => Err(GatewayError::Validation(
                format!("operation {} is not supported by openai-dialect endpoints", operation),
            )),
        }
    }
}

#[async_trait]
impl BackendAdapter for OpenAIAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::OpenAI
    }

    async fn invoke(
        &self,
        endpoint: &Endpoint,
        operation: Operation,
        mut payload: Value,
        streaming: bool,
        timeout: Duration,
    ) -> GatewayResult<AdapterResponse> {
        let (method, path) = Self::route(operation)?;
        let url = format!("{}{}", endpoint.base_url(), path);

        let mut builder = self.client.request(method.clone(), &url);
        if method == reqwest::Method::POST {
            let streaming = streaming && operation.supports_streaming();
            set_stream_flag(&mut payload, streaming);
            builder = builder.json(&payload);
        }

        let response = send_checked(builder, endpoint, timeout).await?;

        if streaming && operation.supports_streaming() {
            let status = response.status().as_u16();
            let chunks = spawn_sse_decoder(response, endpoint.clone());
            Ok(AdapterResponse::Stream { status, chunks })
        } else {
            buffer_json(response, endpoint).await
        }
    }
}

/// Decodes an SSE response into JSON chunks on a bounded channel.
///
/// Lines without the `data: ` prefix are ignored; a `[DONE]` payload
/// ends the stream without emitting a chunk; unparseable payloads are
/// logged and skipped. The task exits as soon as the receiver is
/// dropped, aborting the backend connection.
fn spawn_sse_decoder(
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
                        match decode_sse_line(&line, &endpoint) {
                            SseLine::Chunk(value) => {
                                if tx.send(Ok(value)).await.is_err() {
                                    return;
                                }
                            }
                            SseLine::Done => return,
                            SseLine::Skip => {}
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

        // Any complete payload left without a trailing newline
        if !buffer.is_empty() {
            let line = std::mem::take(&mut buffer);
            if let SseLine::Chunk(value) = decode_sse_line(line.trim_end_matches('\r'), &endpoint)
            {
                let _ = tx.send(Ok(value)).await;
            }
        }
    });

    rx
}

enum SseLine {
    Chunk(Value),
    Done,
    Skip,
}

fn decode_sse_line(line: &str, endpoint: &Endpoint) -> SseLine {
    let Some(payload) = line.strip_prefix("data: ") else {
        return SseLine::Skip;
    };
    if payload.trim() == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str(payload) {
        Ok(value) => SseLine::Chunk(value),
        Err(error) => {
            tracing::warn!(
                endpoint_id = %endpoint.id,
                error = %error,
                "skipping malformed SSE chunk"
            );
            SseLine::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::types::HealthCheckConfig;

    fn endpoint_for(server: &MockServer, api_key: Option<&str>) -> Endpoint {
        let addr = server.address();
        Endpoint {
            id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            name: "openai-backend".to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
            dialect: Dialect::OpenAI,
            api_key: api_key.map(str::to_string),
            weight: 1,
            max_parallel_requests: 4,
            health_check: HealthCheckConfig::default(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<GatewayResult<Value>>) -> Vec<GatewayResult<Value>> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_buffered_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "Hello"}}]
            })))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(reqwest::Client::new());
        let endpoint = endpoint_for(&server, None);
        let response = adapter
            .invoke(
                &endpoint,
                Operation::ChatCompletion,
                json!({"model": "gpt", "messages": []}),
                false,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        match response {
            AdapterResponse::Buffered { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body["choices"][0]["message"]["content"], "Hello");
            }
            AdapterResponse::Stream { .. } => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn test_bearer_auth_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(reqwest::Client::new());
        let endpoint = endpoint_for(&server, Some("sk-test"));
        let response = adapter
            .invoke(
                &endpoint,
                Operation::ListModels,
                Value::Null,
                false,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(matches!(response, AdapterResponse::Buffered { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_sse_stream_decode() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(reqwest::Client::new());
        let endpoint = endpoint_for(&server, None);
        let response = adapter
            .invoke(
                &endpoint,
                Operation::ChatCompletion,
                json!({"model": "gpt", "messages": []}),
                true,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let AdapterResponse::Stream { chunks, .. } = response else {
            panic!("expected streamed response");
        };
        let chunks = collect(chunks).await;
        assert_eq!(chunks.len(), 1, "[DONE] must not emit a chunk");
        let value = chunks[0].as_ref().unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "Hi");
    }

    #[tokio::test]
    async fn test_sse_ignores_non_data_lines_and_bad_json() {
        let server = MockServer::start().await;
        let body = concat!(
            ": keepalive comment\n",
            "event: message\n",
            "data: {not json}\n",
            "data: {\"ok\":1}\n",
            "data: [DONE]\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(reqwest::Client::new());
        let endpoint = endpoint_for(&server, None);
        let AdapterResponse::Stream { chunks, .. } = adapter
            .invoke(
                &endpoint,
                Operation::Completion,
                json!({"model": "gpt", "prompt": "x"}),
                true,
                Duration::from_secs(5),
            )
            .await
            .unwrap()
        else {
            panic!("expected streamed response");
        };

        let chunks = collect(chunks).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap()["ok"], 1);
    }

    #[tokio::test]
    async fn test_backend_error_status_captured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let adapter = OpenAIAdapter::new(reqwest::Client::new());
        let endpoint = endpoint_for(&server, None);
        let error = adapter
            .invoke(
                &endpoint,
                Operation::ChatCompletion,
                json!({"model": "gpt"}),
                false,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        match error {
            GatewayError::Backend { status, message } => {
                assert_eq!(status, Some(500));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_model_management_unsupported() {
        let adapter = OpenAIAdapter::new(reqwest::Client::new());
        let server = MockServer::start().await;
        let endpoint = endpoint_for(&server, None);
        let error = adapter
            .invoke(
                &endpoint,
                Operation::PullModel,
                json!({"name": "llama3"}),
                false,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, GatewayError::Validation(_)));
    }
}
