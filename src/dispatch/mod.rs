//! ディスパッチャー
//!
//! リクエストごとに 解決 → 選択 → アドミッション → 転送 → 記録 を
//! 実行するオーケストレーター。バックエンド障害時は健全な残り候補への
//! 有界フェイルオーバーを行うが、ストリーム応答の最初のバイトを
//! 送出した後はフェイルオーバーしない（部分出力の重複防止）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::HeaderMap;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adapters::{AdapterResponse, AdapterSet};
use crate::affinity::SessionAffinityTable;
use crate::balancer::{Balancer, Candidate, RequestLease};
use crate::common::{GatewayError, GatewayResult};
use crate::health::HealthMonitor;
use crate::history::HistoryRecorder;
use crate::registry::RunnerRegistry;
use crate::types::{
    Operation, RequestHistoryEntry, SessionAffinityMode, VirtualModelRunner,
};

/// Wire framing of a streamed response to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// `data: ` framed server-sent events with a `[DONE]` sentinel
    Sse,
    /// Newline-delimited JSON
    Ndjson,
}

impl StreamFraming {
    /// Content type header value for this framing.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Sse => "text/event-stream",
            Self::Ndjson => "application/x-ndjson",
        }
    }
}

// Inbound operation suffixes. The suffix family also fixes the
// response framing the caller expects.
const SUFFIXES: &[(&str, Operation, StreamFraming)] = &[
    ("/v1/chat/completions", Operation::ChatCompletion, StreamFraming::Sse),
    ("/v1/completions", Operation::Completion, StreamFraming::Sse),
    ("/v1/embeddings", Operation::Embeddings, StreamFraming::Sse),
    ("/v1/models", Operation::ListModels, StreamFraming::Sse),
    ("/api/chat", Operation::ChatCompletion, StreamFraming::Ndjson),
    ("/api/generate", Operation::Completion, StreamFraming::Ndjson),
    ("/api/embed", Operation::Embeddings, StreamFraming::Ndjson),
    ("/api/tags", Operation::ListModels, StreamFraming::Ndjson),
    ("/api/pull", Operation::PullModel, StreamFraming::Ndjson),
    ("/api/delete", Operation::DeleteModel, StreamFraming::Ndjson),
];

/// Splits an inbound path into virtual base path, operation and framing.
pub fn parse_path(path: &str) -> Option<(&str, Operation, StreamFraming)> {
    for (suffix, operation, framing) in SUFFIXES {
        if let Some(base) = path.strip_suffix(suffix) {
            return Some((base, *operation, *framing));
        }
    }
    None
}

/// One inbound request, already tenant-resolved by the HTTP layer.
pub struct DispatchRequest {
    /// Tenant the request arrived for
    pub tenant_id: String,
    /// Full inbound path (base path + operation suffix)
    pub path: String,
    /// Caller's resolved IP, for source-IP affinity
    pub source_ip: Option<String>,
    /// Presented bearer token, for API-key affinity
    pub api_key: Option<String>,
    /// Request headers, for header affinity
    pub headers: HeaderMap,
    /// JSON request body (`Null` for body-less operations)
    pub body: Value,
}

/// Dispatch result handed to the HTTP layer.
pub enum DispatchResponse {
    /// Buffered JSON response
    Json {
        /// Status to return to the caller
        status: u16,
        /// Response body
        body: Value,
    },
    /// Streamed response; the stream owns the admitted lease and
    /// finalizes health/history state when it ends or is dropped
    Stream {
        /// Framing of the stream
        framing: StreamFraming,
        /// Encoded response frames
        body: BoxStream<'static, Result<Bytes, std::io::Error>>,
    },
}

/// リクエストオーケストレーター
pub struct Dispatcher {
    registry: RunnerRegistry,
    monitor: Arc<HealthMonitor>,
    balancer: Balancer,
    sessions: SessionAffinityTable,
    adapters: AdapterSet,
    recorder: HistoryRecorder,
}

impl Dispatcher {
    /// Wires the dispatcher over its collaborators.
    pub fn new(
        registry: RunnerRegistry,
        monitor: Arc<HealthMonitor>,
        balancer: Balancer,
        sessions: SessionAffinityTable,
        adapters: AdapterSet,
        recorder: HistoryRecorder,
    ) -> Self {
        Self {
            registry,
            monitor,
            balancer,
            sessions,
            adapters,
            recorder,
        }
    }

    /// Handles one inbound request end to end.
    pub async fn dispatch(&self, mut request: DispatchRequest) -> GatewayResult<DispatchResponse> {
        let (base_path, operation, framing) = parse_path(&request.path)
            .ok_or_else(|| GatewayError::RunnerNotFound(request.path.clone()))?;

        let runner = self
            .registry
            .find_runner(&request.tenant_id, base_path)
            .await?
            .ok_or_else(|| GatewayError::RunnerNotFound(base_path.to_string()))?;
        if !runner.active {
            return Err(GatewayError::RunnerDisabled(runner.base_path.clone()));
        }
        if !runner.permits(operation) {
            return Err(GatewayError::Forbidden(format!(
                "{} on {}",
                operation, runner.base_path
            )));
        }

        // Attached configurations fill body defaults in configured
        // order; the first to provide a field wins, and client-set
        // fields always take precedence.
        for configuration in self.registry.configurations_for(&runner).await? {
            configuration.apply(&mut request.body);
        }

        let order = self.candidate_order(&runner, &request).await?;
        let streaming = wants_streaming(&request.body, operation, framing);

        self.forward_with_failover(runner, operation, framing, request, order, streaming)
            .await
    }

    /// Builds the healthy candidate set and orders it for dispatch,
    /// consulting the affinity table first when enabled.
    async fn candidate_order(
        &self,
        runner: &VirtualModelRunner,
        request: &DispatchRequest,
    ) -> GatewayResult<Vec<Candidate>> {
        let endpoints = self.registry.endpoints_for(runner).await?;

        let mut candidates = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            // Endpoints added after startup are picked up lazily here
            let health = match self.monitor.handle(endpoint.id).await {
                Some(health) => health,
                None => {
                    self.monitor.watch(endpoint.clone()).await;
                    match self.monitor.handle(endpoint.id).await {
                        Some(health) => health,
                        None => continue,
                    }
                }
            };
            if health.is_healthy() {
                candidates.push(Candidate { endpoint, health });
            }
        }
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyEndpoint(runner.base_path.clone()));
        }

        if let Some(key) = derive_affinity_key(&runner.affinity, request) {
            if let Some(sticky_id) = self.sessions.lookup(runner, &key) {
                if let Some(position) =
                    candidates.iter().position(|c| c.endpoint.id == sticky_id)
                {
                    // Sticky endpoint first; the rest stays in configured
                    // order as the failover sequence. The round-robin
                    // cursor is not advanced for sticky dispatches.
                    let sticky = candidates.remove(position);
                    candidates.insert(0, sticky);
                    return Ok(candidates);
                }
                // Sticky endpoint is unhealthy or gone: fall through to
                // the balancer without deleting the entry.
            }
        }

        Ok(self.balancer.select_order(runner, candidates))
    }

    /// Steps 3-5 of the request state machine: admit, forward, and fail
    /// over among the remaining candidates.
    async fn forward_with_failover(
        &self,
        runner: VirtualModelRunner,
        operation: Operation,
        framing: StreamFraming,
        request: DispatchRequest,
        order: Vec<Candidate>,
        streaming: bool,
    ) -> GatewayResult<DispatchResponse> {
        let started_at = Utc::now();
        let started = Instant::now();
        let request_body_capped = self
            .recorder
            .cap_request_body(&request.body.to_string());
        let model = request
            .body
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        let affinity_key = derive_affinity_key(&runner.affinity, &request);
        let timeout = Duration::from_millis(runner.timeout_ms);

        let mut attempted_backend = false;
        let mut last_error: Option<GatewayError> = None;

        for candidate in order {
            let Some(lease) =
                RequestLease::acquire(self.monitor.as_ref().clone(), Arc::clone(&candidate.health))
            else {
                tracing::debug!(
                    endpoint_id = %candidate.endpoint.id,
                    runner = %runner.base_path,
                    "endpoint saturated, trying next candidate"
                );
                continue;
            };

            attempted_backend = true;
            let adapter = self.adapters.for_dialect(candidate.endpoint.dialect);
            let endpoint_id = candidate.endpoint.id;

            match adapter
                .invoke(
                    &candidate.endpoint,
                    operation,
                    request.body.clone(),
                    streaming,
                    timeout,
                )
                .await
            {
                Ok(AdapterResponse::Buffered { status, body }) => {
                    self.remember_affinity(&runner, affinity_key.as_deref(), endpoint_id);
                    lease.complete(true, None).await;
                    self.recorder.record(RequestHistoryEntry {
                        id: Uuid::new_v4(),
                        tenant_id: runner.tenant_id.clone(),
                        runner_id: runner.id,
                        endpoint_id: Some(endpoint_id),
                        model: model.clone(),
                        operation: operation.as_str().to_string(),
                        started_at,
                        completed_at: Some(Utc::now()),
                        request_body: request_body_capped.clone(),
                        response_body: self.recorder.cap_response_body(&body.to_string()),
                        status: Some(status),
                        latency_ms: Some(started.elapsed().as_millis() as u64),
                        streamed: false,
                    });
                    return Ok(DispatchResponse::Json { status, body });
                }
                Ok(AdapterResponse::Stream { chunks, .. }) => {
                    self.remember_affinity(&runner, affinity_key.as_deref(), endpoint_id);
                    let entry = RequestHistoryEntry {
                        id: Uuid::new_v4(),
                        tenant_id: runner.tenant_id.clone(),
                        runner_id: runner.id,
                        endpoint_id: Some(endpoint_id),
                        model: model.clone(),
                        operation: operation.as_str().to_string(),
                        started_at,
                        completed_at: None,
                        request_body: request_body_capped.clone(),
                        response_body: String::new(),
                        status: None,
                        latency_ms: None,
                        streamed: true,
                    };
                    let body = relay_stream(
                        chunks,
                        framing,
                        lease,
                        self.recorder.clone(),
                        entry,
                        started,
                    );
                    return Ok(DispatchResponse::Stream { framing, body });
                }
                Err(error) if error.is_failover_eligible() => {
                    tracing::warn!(
                        endpoint_id = %endpoint_id,
                        runner = %runner.base_path,
                        error = %error,
                        "backend call failed, attempting failover"
                    );
                    lease.complete(false, Some(error.to_string())).await;
                    last_error = Some(error);
                }
                Err(error) => {
                    // Terminal: 4xx passthrough or a local error. A 4xx
                    // means the endpoint answered, so it counts as a
                    // successful outcome for hysteresis.
                    let backend_answered =
                        matches!(&error, GatewayError::Backend { status: Some(_), .. });
                    if backend_answered {
                        lease.complete(true, None).await;
                    } else {
                        drop(lease);
                    }
                    self.recorder.record(RequestHistoryEntry {
                        id: Uuid::new_v4(),
                        tenant_id: runner.tenant_id.clone(),
                        runner_id: runner.id,
                        endpoint_id: Some(endpoint_id),
                        model: model.clone(),
                        operation: operation.as_str().to_string(),
                        started_at,
                        completed_at: Some(Utc::now()),
                        request_body: request_body_capped.clone(),
                        response_body: self.recorder.cap_response_body(&error.to_string()),
                        status: Some(error.status_code().as_u16()),
                        latency_ms: Some(started.elapsed().as_millis() as u64),
                        streamed: false,
                    });
                    return Err(error);
                }
            }
        }

        // All candidates were saturated without a single backend call
        if !attempted_backend {
            return Err(GatewayError::CapacityExceeded(runner.base_path.clone()));
        }

        let error = last_error
            .unwrap_or_else(|| GatewayError::NoHealthyEndpoint(runner.base_path.clone()));
        self.recorder.record(RequestHistoryEntry {
            id: Uuid::new_v4(),
            tenant_id: runner.tenant_id.clone(),
            runner_id: runner.id,
            endpoint_id: None,
            model,
            operation: operation.as_str().to_string(),
            started_at,
            completed_at: Some(Utc::now()),
            request_body: request_body_capped,
            response_body: self.recorder.cap_response_body(&error.to_string()),
            status: Some(error.status_code().as_u16()),
            latency_ms: Some(started.elapsed().as_millis() as u64),
            streamed: false,
        });
        Err(error)
    }

    fn remember_affinity(
        &self,
        runner: &VirtualModelRunner,
        key: Option<&str>,
        endpoint_id: Uuid,
    ) {
        let Some(key) = key else { return };
        match self.sessions.lookup(runner, key) {
            Some(existing) if existing == endpoint_id => self.sessions.touch(runner, key),
            _ => self.sessions.record(runner, key, endpoint_id),
        }
    }

    /// Session affinity table accessor (state API).
    pub fn sessions(&self) -> &SessionAffinityTable {
        &self.sessions
    }
}

/// Decides streamed delivery: an explicit `stream` field wins;
/// otherwise NDJSON-family operations default to streaming, matching
/// the Ollama wire convention, and SSE-family ones to buffered.
fn wants_streaming(body: &Value, operation: Operation, framing: StreamFraming) -> bool {
    if !operation.supports_streaming() {
        return false;
    }
    match body.get("stream").and_then(Value::as_bool) {
        Some(explicit) => explicit,
        None => framing == StreamFraming::Ndjson,
    }
}

/// Derives the affinity key for this request, if any.
fn derive_affinity_key(mode: &SessionAffinityMode, request: &DispatchRequest) -> Option<String> {
    match mode {
        SessionAffinityMode::None => None,
        SessionAffinityMode::SourceIp => request.source_ip.clone(),
        SessionAffinityMode::ApiKey => request.api_key.clone(),
        SessionAffinityMode::Header { name } => request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

fn encode_chunk(framing: StreamFraming, value: &Value) -> String {
    match framing {
        StreamFraming::Sse => format!("data: {}\n\n", value),
        StreamFraming::Ndjson => format!("{}\n", value),
    }
}

fn encode_error_marker(framing: StreamFraming, error: &GatewayError) -> String {
    let payload = serde_json::to_value(error.to_openai_error())
        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
    encode_chunk(framing, &payload)
}

enum RelayPhase {
    Streaming,
    Ending {
        success: bool,
        status: u16,
        error: Option<String>,
    },
}

/// Owns the lease and history entry across the life of a relayed
/// stream. If the caller disconnects mid-stream the guard's `Drop`
/// records the entry as cancelled; the lease's own `Drop` releases the
/// admitted slot without a health outcome.
struct RelayGuard {
    lease: Option<RequestLease>,
    recorder: HistoryRecorder,
    entry: Option<RequestHistoryEntry>,
    started: Instant,
}

impl RelayGuard {
    async fn finish(&mut self, success: bool, status: u16, error: Option<String>) {
        if let Some(lease) = self.lease.take() {
            lease.complete(success, error).await;
        }
        if let Some(mut entry) = self.entry.take() {
            entry.completed_at = Some(Utc::now());
            entry.status = Some(status);
            entry.latency_ms = Some(self.started.elapsed().as_millis() as u64);
            self.recorder.record(entry);
        }
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        // Caller disconnected before the stream finished
        if let Some(mut entry) = self.entry.take() {
            let cancelled =
                GatewayError::Cancelled("client disconnected mid-stream".to_string());
            entry.completed_at = Some(Utc::now());
            entry.status = Some(cancelled.status_code().as_u16());
            entry.latency_ms = Some(self.started.elapsed().as_millis() as u64);
            self.recorder.record(entry);
        }
    }
}

struct RelayState {
    chunks: mpsc::Receiver<GatewayResult<Value>>,
    framing: StreamFraming,
    guard: RelayGuard,
    response_acc: String,
    response_cap: usize,
    phase: RelayPhase,
}

/// Relays decoded chunks to the caller in the requested framing.
///
/// Chunk boundaries are preserved; a mid-stream backend error ends the
/// stream with an error marker frame instead of a silent truncation.
fn relay_stream(
    chunks: mpsc::Receiver<GatewayResult<Value>>,
    framing: StreamFraming,
    lease: RequestLease,
    recorder: HistoryRecorder,
    entry: RequestHistoryEntry,
    started: Instant,
) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
    let response_cap = recorder.max_response_body_bytes();
    let state = RelayState {
        chunks,
        framing,
        guard: RelayGuard {
            lease: Some(lease),
            recorder,
            entry: Some(entry),
            started,
        },
        response_acc: String::new(),
        response_cap,
        phase: RelayPhase::Streaming,
    };

    Box::pin(futures::stream::try_unfold(state, |mut state| async move {
        loop {
            match std::mem::replace(&mut state.phase, RelayPhase::Streaming) {
                RelayPhase::Streaming => match state.chunks.recv().await {
                    Some(Ok(value)) => {
                        let frame = encode_chunk(state.framing, &value);
                        accumulate(&mut state, &frame);
                        return Ok(Some((Bytes::from(frame), state)));
                    }
                    Some(Err(error)) => {
                        let frame = encode_error_marker(state.framing, &error);
                        accumulate(&mut state, &frame);
                        state.phase = RelayPhase::Ending {
                            success: false,
                            status: error.status_code().as_u16(),
                            error: Some(error.to_string()),
                        };
                        return Ok(Some((Bytes::from(frame), state)));
                    }
                    None => {
                        state.phase = RelayPhase::Ending {
                            success: true,
                            status: 200,
                            error: None,
                        };
                        if state.framing == StreamFraming::Sse {
                            let frame = "data: [DONE]\n\n".to_string();
                            return Ok(Some((Bytes::from(frame), state)));
                        }
                    }
                },
                RelayPhase::Ending {
                    success,
                    status,
                    error,
                } => {
                    if let Some(entry) = state.guard.entry.as_mut() {
                        entry.response_body = std::mem::take(&mut state.response_acc);
                    }
                    state.guard.finish(success, status, error).await;
                    return Ok(None);
                }
            }
        }
    }))
}

fn accumulate(state: &mut RelayState, frame: &str) {
    let remaining = state.response_cap.saturating_sub(state.response_acc.len());
    if remaining == 0 {
        return;
    }
    let take = frame.len().min(remaining);
    let mut end = take;
    while end > 0 && !frame.is_char_boundary(end) {
        end -= 1;
    }
    state.response_acc.push_str(&frame[..end]);
}
