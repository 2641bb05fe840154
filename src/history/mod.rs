//! リクエスト履歴レコーダー
//!
//! ディスパッチ結果をバイト上限付きで記録する。永続化はレスポンス経路
//! から切り離したfire-and-forgetで行い、保持期間を超えたエントリは
//! バックグラウンドのスイープで削除する。

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::time::MissedTickBehavior;

use crate::common::GatewayResult;
use crate::config::HistoryConfig;
use crate::repo::HistoryRepository;
use crate::types::RequestHistoryEntry;

/// Truncates to at most `max` bytes without splitting a UTF-8 character.
fn truncate_utf8(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Asynchronous history capture over the repository interface.
#[derive(Clone)]
pub struct HistoryRecorder {
    repo: Arc<dyn HistoryRepository>,
    config: HistoryConfig,
}

impl HistoryRecorder {
    /// Creates a recorder with the given repository and caps.
    pub fn new(repo: Arc<dyn HistoryRepository>, config: HistoryConfig) -> Self {
        Self { repo, config }
    }

    /// Caps a request body to `max_request_body_bytes`.
    pub fn cap_request_body(&self, body: &str) -> String {
        truncate_utf8(body, self.config.max_request_body_bytes)
    }

    /// Caps a response body to `max_response_body_bytes`.
    pub fn cap_response_body(&self, body: &str) -> String {
        truncate_utf8(body, self.config.max_response_body_bytes)
    }

    /// Configured response body cap in bytes.
    pub fn max_response_body_bytes(&self) -> usize {
        self.config.max_response_body_bytes
    }

    /// Persists an entry without blocking the response path.
    ///
    /// Persistence failures are logged and otherwise swallowed: losing
    /// a history row must never fail the request that produced it.
    pub fn record(&self, entry: RequestHistoryEntry) {
        let repo = Arc::clone(&self.repo);
        tokio::spawn(async move {
            let entry_id = entry.id;
            if let Err(error) = repo.save(entry).await {
                tracing::warn!(
                    entry_id = %entry_id,
                    error = %error,
                    "failed to persist request history entry"
                );
            }
        });
    }

    /// Runs one retention sweep, returning the number of entries removed.
    pub async fn sweep_once(&self) -> GatewayResult<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let removed = self.repo.delete_older_than(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, retention_days = self.config.retention_days, "history retention sweep completed");
        }
        Ok(removed)
    }

    /// Spawns the periodic retention sweep task.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recorder.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick cleans up entries left by a
            // previous run.
            loop {
                ticker.tick().await;
                if let Err(error) = recorder.sweep_once().await {
                    tracing::warn!(error = %error, "history retention sweep failed");
                }
            }
        })
    }
}
