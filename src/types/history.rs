//! リクエスト履歴エントリ

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One recorded dispatch, with byte-capped request/response bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHistoryEntry {
    /// Entry ID
    pub id: Uuid,
    /// Tenant that issued the request
    pub tenant_id: String,
    /// Runner that handled the request
    pub runner_id: Uuid,
    /// Endpoint that served the request, if one was admitted
    pub endpoint_id: Option<Uuid>,
    /// Model named in the request body, if any
    pub model: Option<String>,
    /// Operation name (`chat_completion`, `embeddings`, ...)
    pub operation: String,
    /// Request arrival time
    pub started_at: DateTime<Utc>,
    /// Completion time (response fully sent or request failed)
    pub completed_at: Option<DateTime<Utc>>,
    /// Request body, truncated to the configured cap
    pub request_body: String,
    /// Response body, truncated to the configured cap
    pub response_body: String,
    /// HTTP status returned to the caller
    pub status: Option<u16>,
    /// End-to-end latency in milliseconds
    pub latency_ms: Option<u64>,
    /// Whether the response was streamed
    pub streamed: bool,
}
