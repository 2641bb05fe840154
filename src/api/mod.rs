//! REST APIモジュール
//!
//! ルーター構築。仮想ベースパス配下へのリクエストはすべて
//! フォールバックハンドラー経由でディスパッチャーへ渡す。

pub mod error;
pub mod gateway;
pub mod state;

pub use error::AppError;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Builds the gateway router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/state/endpoints", get(state::endpoint_state))
        .route("/v0/state/runners", get(state::runner_state))
        .fallback(gateway::handle)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Gateway process liveness probe.
async fn healthz() -> &'static str {
    "ok"
}
