//! 仮想モデルランナー定義
//!
//! テナントごとに仮想ベースパスを公開し、背後のエンドポイント群へ
//! ルーティングする設定レコード

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Operation;

/// Endpoint selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMode {
    /// Weighted round robin (default)
    RoundRobin,
    /// Weighted random pick
    Random,
    /// Active/standby: always the first healthy endpoint in configured order
    FirstAvailable,
}

impl Default for LoadBalancingMode {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// Sticky routing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SessionAffinityMode {
    /// No stickiness
    None,
    /// Key on the caller's resolved IP address
    SourceIp,
    /// Key on the presented bearer token / API key
    ApiKey,
    /// Key on the value of a configured request header
    Header {
        /// Header name examined on each request
        name: String,
    },
}

impl Default for SessionAffinityMode {
    fn default() -> Self {
        Self::None
    }
}

/// 仮想モデルランナー（VMR）
///
/// アクティブなランナーのBasePathはテナント内で一意。
/// ディスパッチごとにリポジトリから読み直されるため、
/// 管理側の同時更新は次のリクエストから反映される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualModelRunner {
    /// Runner ID
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Display name
    pub name: String,
    /// Virtual base path (e.g. `/team-a/llama`), no trailing slash
    pub base_path: String,
    /// Backend endpoints in configured order
    pub endpoint_ids: Vec<Uuid>,
    /// Attached configuration IDs, applied as request defaults in order
    #[serde(default)]
    pub config_ids: Vec<Uuid>,
    /// Endpoint selection policy
    #[serde(default)]
    pub load_balancing: LoadBalancingMode,
    /// Sticky routing policy
    #[serde(default)]
    pub affinity: SessionAffinityMode,
    /// Sliding session TTL in milliseconds
    #[serde(default = "VirtualModelRunner::default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Affinity table size bound for this runner
    #[serde(default = "VirtualModelRunner::default_session_max_entries")]
    pub session_max_entries: usize,
    /// Allow chat/text completions
    #[serde(default = "VirtualModelRunner::default_true")]
    pub allow_completions: bool,
    /// Allow embedding generation
    #[serde(default = "VirtualModelRunner::default_true")]
    pub allow_embeddings: bool,
    /// Allow model pull/delete
    #[serde(default)]
    pub allow_model_management: bool,
    /// Per-request deadline in milliseconds
    #[serde(default = "VirtualModelRunner::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Inactive runners are invisible to dispatch
    #[serde(default = "VirtualModelRunner::default_true")]
    pub active: bool,
}

impl VirtualModelRunner {
    fn default_session_timeout_ms() -> u64 {
        600_000
    }

    fn default_session_max_entries() -> usize {
        1000
    }

    fn default_timeout_ms() -> u64 {
        120_000
    }

    fn default_true() -> bool {
        true
    }

    /// Checks the per-operation permission flags.
    ///
    /// Listing models is always allowed: it exposes nothing the caller
    /// could not learn by issuing a completion.
    pub fn permits(&self, operation: Operation) -> bool {
        match operation {
            Operation::ChatCompletion | Operation::Completion => self.allow_completions,
            Operation::Embeddings => self.allow_embeddings,
            Operation::PullModel | Operation::DeleteModel => self.allow_model_management,
            Operation::ListModels => true,
        }
    }
}
