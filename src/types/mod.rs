//! 型定義モジュール

pub mod configuration;
pub mod endpoint;
pub mod history;
pub mod runner;

pub use configuration::Configuration;
pub use endpoint::{Dialect, Endpoint, HealthCheckConfig, HealthCheckMethod};
pub use history::RequestHistoryEntry;
pub use runner::{LoadBalancingMode, SessionAffinityMode, VirtualModelRunner};

use serde::{Deserialize, Serialize};

/// Generic gateway operation, independent of the backend dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Chat-style completion (messages in, message out)
    ChatCompletion,
    /// Plain text completion (prompt in, text out)
    Completion,
    /// Embedding vector generation
    Embeddings,
    /// Enumerate models served by the endpoint
    ListModels,
    /// Download a model onto the endpoint
    PullModel,
    /// Remove a model from the endpoint
    DeleteModel,
}

impl Operation {
    /// Returns true when this operation may produce a streamed response.
    pub fn supports_streaming(&self) -> bool {
        matches!(
            self,
            Self::ChatCompletion | Self::Completion | Self::PullModel
        )
    }

    /// Stable name used in logs and history records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletion => "chat_completion",
            Self::Completion => "completion",
            Self::Embeddings => "embeddings",
            Self::ListModels => "list_models",
            Self::PullModel => "pull_model",
            Self::DeleteModel => "delete_model",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
