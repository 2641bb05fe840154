//! エンドポイント定義
//!
//! 物理バックエンド（Ollama / OpenAI互換サーバー）の記述子

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire dialect spoken by a backend endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Ollama-style JSON/NDJSON API (`/api/chat`, `/api/generate`, ...)
    Ollama,
    /// OpenAI-style SSE/JSON API (`/v1/chat/completions`, ...)
    OpenAI,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::OpenAI => write!(f, "openai"),
        }
    }
}

/// Health check HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckMethod {
    /// HTTP GET
    Get,
    /// HTTP HEAD (cheaper, no response body)
    Head,
}

/// ヘルスチェック設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Path probed on the endpoint (e.g. `/api/tags`, `/v1/models`)
    pub path: String,
    /// HTTP method used for the probe
    #[serde(default = "HealthCheckConfig::default_method")]
    pub method: HealthCheckMethod,
    /// Probe interval in milliseconds
    #[serde(default = "HealthCheckConfig::default_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds
    #[serde(default = "HealthCheckConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Expected HTTP status code
    #[serde(default = "HealthCheckConfig::default_expected_status")]
    pub expected_status: u16,
    /// Consecutive failures before a healthy endpoint flips to unhealthy
    #[serde(default = "HealthCheckConfig::default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy endpoint flips to healthy
    #[serde(default = "HealthCheckConfig::default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl HealthCheckConfig {
    fn default_method() -> HealthCheckMethod {
        HealthCheckMethod::Get
    }

    fn default_interval_ms() -> u64 {
        5000
    }

    fn default_timeout_ms() -> u64 {
        2000
    }

    fn default_expected_status() -> u16 {
        200
    }

    fn default_unhealthy_threshold() -> u32 {
        3
    }

    fn default_healthy_threshold() -> u32 {
        2
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            method: Self::default_method(),
            interval_ms: Self::default_interval_ms(),
            timeout_ms: Self::default_timeout_ms(),
            expected_status: Self::default_expected_status(),
            unhealthy_threshold: Self::default_unhealthy_threshold(),
            healthy_threshold: Self::default_healthy_threshold(),
        }
    }
}

/// 物理エンドポイント記述子
///
/// レジストリが所有し、VMRからはIDで参照される（多対多）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint ID
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: String,
    /// Display name
    pub name: String,
    /// Backend hostname
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Use HTTPS when connecting
    #[serde(default)]
    pub tls: bool,
    /// Wire dialect
    pub dialect: Dialect,
    /// API key sent as a bearer token, if the backend requires one
    #[serde(default)]
    pub api_key: Option<String>,
    /// Selection weight (>= 1)
    #[serde(default = "Endpoint::default_weight")]
    pub weight: u32,
    /// Admission cap: maximum concurrent in-flight requests
    #[serde(default = "Endpoint::default_max_parallel")]
    pub max_parallel_requests: u32,
    /// Health check parameters
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl Endpoint {
    fn default_weight() -> u32 {
        1
    }

    fn default_max_parallel() -> u32 {
        4
    }

    /// Base URL of the backend (no trailing slash).
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Full URL of the health check probe.
    pub fn health_check_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_check.path)
    }

    /// Weight clamped to the >= 1 invariant.
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint() -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            name: "local-ollama".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11434,
            tls: false,
            dialect: Dialect::Ollama,
            api_key: None,
            weight: 1,
            max_parallel_requests: 4,
            health_check: HealthCheckConfig {
                path: "/api/tags".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_base_url() {
        let ep = sample_endpoint();
        assert_eq!(ep.base_url(), "http://127.0.0.1:11434");
        assert_eq!(ep.health_check_url(), "http://127.0.0.1:11434/api/tags");
    }

    #[test]
    fn test_base_url_tls() {
        let mut ep = sample_endpoint();
        ep.tls = true;
        ep.host = "api.example.com".to_string();
        ep.port = 443;
        assert_eq!(ep.base_url(), "https://api.example.com:443");
    }

    #[test]
    fn test_effective_weight_clamps_zero() {
        let mut ep = sample_endpoint();
        ep.weight = 0;
        assert_eq!(ep.effective_weight(), 1);
    }

    #[test]
    fn test_health_check_defaults() {
        let config: HealthCheckConfig =
            serde_yaml::from_str("path: /v1/models").expect("Failed to parse");
        assert_eq!(config.method, HealthCheckMethod::Get);
        assert_eq!(config.interval_ms, 5000);
        assert_eq!(config.expected_status, 200);
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.healthy_threshold, 2);
    }

    #[test]
    fn test_dialect_serialization() {
        assert_eq!(
            serde_json::to_string(&Dialect::Ollama).unwrap(),
            "\"ollama\""
        );
        assert_eq!(
            serde_json::to_string(&Dialect::OpenAI).unwrap(),
            "\"openai\""
        );
    }
}
