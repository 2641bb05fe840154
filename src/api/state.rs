//! 状態スナップショットAPI
//!
//! ダッシュボード等の外部ツール向けの読み取り専用ビュー。ヘルス
//! スナップショットはアトミックに取得され、ディスパッチをブロック
//! しない。

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppError;
use crate::health::HealthSnapshot;
use crate::AppState;

/// Cursor pagination query parameters.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    cursor: Option<String>,
    limit: Option<usize>,
}

/// Per-runner state view.
#[derive(Debug, Serialize)]
pub struct RunnerStateView {
    /// Runner ID
    pub id: Uuid,
    /// Virtual base path
    pub base_path: String,
    /// Whether the runner accepts traffic
    pub active: bool,
    /// Live session affinity entry count
    pub session_entries: usize,
    /// Creation time of the longest-pinned live session, if any
    pub oldest_session_created_at: Option<DateTime<Utc>>,
    /// Health of the runner's endpoints, in configured order
    pub endpoints: Vec<HealthSnapshot>,
}

/// Tenant-wide runner state list.
#[derive(Debug, Serialize)]
pub struct RunnerStateResponse {
    /// Runner views
    pub runners: Vec<RunnerStateView>,
    /// Cursor for the next page, if any
    pub next_cursor: Option<String>,
}

fn tenant_of(headers: &HeaderMap) -> String {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string()
}

/// GET /v0/state/endpoints — all endpoint health snapshots.
pub async fn endpoint_state(State(state): State<AppState>) -> Json<Vec<HealthSnapshot>> {
    Json(state.monitor.snapshots().await)
}

/// GET /v0/state/runners — tenant runners with endpoint health.
pub async fn runner_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<RunnerStateResponse>, AppError> {
    let tenant_id = tenant_of(&headers);
    let limit = query.limit.unwrap_or(50).min(200);
    let page = state
        .registry
        .list_runners(&tenant_id, query.cursor, limit)
        .await?;

    let mut runners = Vec::with_capacity(page.items.len());
    for runner in page.items {
        let mut endpoints = Vec::with_capacity(runner.endpoint_ids.len());
        for endpoint_id in &runner.endpoint_ids {
            if let Some(snapshot) = state.monitor.snapshot(*endpoint_id).await {
                endpoints.push(snapshot);
            }
        }
        runners.push(RunnerStateView {
            id: runner.id,
            base_path: runner.base_path,
            active: runner.active,
            session_entries: state.dispatcher.sessions().len(runner.id),
            oldest_session_created_at: state
                .dispatcher
                .sessions()
                .oldest_entry_created_at(runner.id),
            endpoints,
        });
    }

    Ok(Json(RunnerStateResponse {
        runners,
        next_cursor: page.next_cursor,
    }))
}
