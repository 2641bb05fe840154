//! Configuration management via environment variables and seed file
//!
//! Runtime tunables come from `LLMGW_*` environment variables; the
//! initial set of endpoints and runners is loaded from a YAML seed file
//! and handed to the in-memory repositories at startup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::common::{GatewayError, GatewayResult};
use crate::types::{Configuration, Endpoint, VirtualModelRunner};

/// Get an environment variable, parsing to a specific type
///
/// Returns the default if the variable is unset or fails to parse.
pub fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable with a string default
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Request history configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Cap on captured request body bytes
    pub max_request_body_bytes: usize,
    /// Cap on captured response body bytes
    pub max_response_body_bytes: usize,
    /// Entries older than this are deleted by the sweep
    pub retention_days: i64,
    /// Interval between retention sweeps
    pub sweep_interval: Duration,
}

impl HistoryConfig {
    /// Load history configuration from environment variables.
    pub fn from_env() -> Self {
        let max_request_body_bytes =
            env_parse("LLMGW_HISTORY_MAX_REQUEST_BYTES", 16 * 1024usize);
        let max_response_body_bytes =
            env_parse("LLMGW_HISTORY_MAX_RESPONSE_BYTES", 64 * 1024usize);
        let retention_days = env_parse("LLMGW_HISTORY_RETENTION_DAYS", 7i64);
        let sweep_interval_secs = env_parse("LLMGW_HISTORY_SWEEP_INTERVAL_SECS", 3600u64);

        Self {
            max_request_body_bytes,
            max_response_body_bytes,
            retention_days,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_request_body_bytes: 16 * 1024,
            max_response_body_bytes: 64 * 1024,
            retention_days: 7,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address, e.g. `0.0.0.0:8080`
    pub listen_addr: String,
    /// Request history settings
    pub history: HistoryConfig,
}

impl GatewayConfig {
    /// Load gateway configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_or("LLMGW_LISTEN_ADDR", "0.0.0.0:8080"),
            history: HistoryConfig::from_env(),
        }
    }
}

/// YAMLシードファイル
///
/// 起動時にエンドポイントとランナーの初期セットを読み込む。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    /// Physical endpoints
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Virtual model runners
    #[serde(default)]
    pub runners: Vec<VirtualModelRunner>,
    /// Configuration mappings attachable to runners
    #[serde(default)]
    pub configurations: Vec<Configuration>,
}

/// Loads and validates a seed file.
///
/// Validation catches the configuration mistakes that would otherwise
/// surface as 404s at dispatch time: duplicate active base paths within
/// a tenant and runner references to endpoints that do not exist.
pub fn load_seed(path: &Path) -> GatewayResult<SeedFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    let seed: SeedFile = serde_yaml::from_str(&raw)
        .map_err(|e| GatewayError::Config(format!("failed to parse {}: {}", path.display(), e)))?;

    let mut seen_paths = std::collections::HashSet::new();
    for runner in &seed.runners {
        if runner.active && !seen_paths.insert((runner.tenant_id.clone(), runner.base_path.clone()))
        {
            return Err(GatewayError::Config(format!(
                "duplicate active base path {} in tenant {}",
                runner.base_path, runner.tenant_id
            )));
        }
        for endpoint_id in &runner.endpoint_ids {
            if !seed.endpoints.iter().any(|e| e.id == *endpoint_id) {
                return Err(GatewayError::Config(format!(
                    "runner {} references unknown endpoint {}",
                    runner.base_path, endpoint_id
                )));
            }
        }
        for config_id in &runner.config_ids {
            if !seed.configurations.iter().any(|c| c.id == *config_id) {
                return Err(GatewayError::Config(format!(
                    "runner {} references unknown configuration {}",
                    runner.base_path, config_id
                )));
            }
        }
    }

    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_env_parse_set() {
        std::env::set_var("LLMGW_TEST_PARSE", "42");
        let result: u64 = env_parse("LLMGW_TEST_PARSE", 7);
        assert_eq!(result, 42);
        std::env::remove_var("LLMGW_TEST_PARSE");
    }

    #[test]
    #[serial]
    fn test_env_parse_unset_or_invalid() {
        std::env::remove_var("LLMGW_TEST_PARSE2");
        let result: u64 = env_parse("LLMGW_TEST_PARSE2", 7);
        assert_eq!(result, 7);

        std::env::set_var("LLMGW_TEST_PARSE2", "not-a-number");
        let result: u64 = env_parse("LLMGW_TEST_PARSE2", 7);
        assert_eq!(result, 7);
        std::env::remove_var("LLMGW_TEST_PARSE2");
    }

    #[test]
    #[serial]
    fn test_history_config_defaults() {
        std::env::remove_var("LLMGW_HISTORY_MAX_REQUEST_BYTES");
        std::env::remove_var("LLMGW_HISTORY_MAX_RESPONSE_BYTES");
        std::env::remove_var("LLMGW_HISTORY_RETENTION_DAYS");
        std::env::remove_var("LLMGW_HISTORY_SWEEP_INTERVAL_SECS");

        let config = HistoryConfig::from_env();
        assert_eq!(config, HistoryConfig::default());
    }

    fn write_temp_seed(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("Failed to write seed");
        file
    }

    #[test]
    fn test_load_seed_valid() {
        let file = write_temp_seed(
            r#"
endpoints:
  - id: 7a0f64e5-9c1e-4a3c-86a4-7d4f6e2a1b09
    tenant_id: default
    name: local
    host: 127.0.0.1
    port: 11434
    dialect: ollama
    health_check:
      path: /api/tags
runners:
  - id: 0c9e2d41-5b7f-4f7e-b6a2-df80a4a1c22e
    tenant_id: default
    name: llama
    base_path: /team-a/llama
    endpoint_ids:
      - 7a0f64e5-9c1e-4a3c-86a4-7d4f6e2a1b09
"#,
        );

        let seed = load_seed(file.path()).expect("Failed to load seed");
        assert_eq!(seed.endpoints.len(), 1);
        assert_eq!(seed.runners.len(), 1);
        assert_eq!(seed.runners[0].base_path, "/team-a/llama");
    }

    #[test]
    fn test_load_seed_duplicate_base_path() {
        let file = write_temp_seed(
            r#"
runners:
  - id: 0c9e2d41-5b7f-4f7e-b6a2-df80a4a1c22e
    tenant_id: default
    name: a
    base_path: /x
    endpoint_ids: []
  - id: 1d8f3e52-6c80-4a8f-9db3-e091b5b2d33f
    tenant_id: default
    name: b
    base_path: /x
    endpoint_ids: []
"#,
        );

        let err = load_seed(file.path()).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_load_seed_unknown_endpoint() {
        let file = write_temp_seed(
            r#"
runners:
  - id: 0c9e2d41-5b7f-4f7e-b6a2-df80a4a1c22e
    tenant_id: default
    name: a
    base_path: /x
    endpoint_ids:
      - 7a0f64e5-9c1e-4a3c-86a4-7d4f6e2a1b09
"#,
        );

        let err = load_seed(file.path()).unwrap_err();
        assert!(err.to_string().contains("unknown endpoint"));
    }

    #[test]
    fn test_load_seed_unknown_configuration() {
        let file = write_temp_seed(
            r#"
runners:
  - id: 0c9e2d41-5b7f-4f7e-b6a2-df80a4a1c22e
    tenant_id: default
    name: a
    base_path: /x
    endpoint_ids: []
    config_ids:
      - 9b1e5f63-2d4a-4c8e-a750-c1f2d3e4b5a6
"#,
        );

        let err = load_seed(file.path()).unwrap_err();
        assert!(err.to_string().contains("unknown configuration"));
    }

    #[test]
    fn test_load_seed_with_configuration() {
        let file = write_temp_seed(
            r#"
configurations:
  - id: 9b1e5f63-2d4a-4c8e-a750-c1f2d3e4b5a6
    tenant_id: default
    name: defaults
    model: llama3
    parameters:
      temperature: 0.2
runners:
  - id: 0c9e2d41-5b7f-4f7e-b6a2-df80a4a1c22e
    tenant_id: default
    name: a
    base_path: /x
    endpoint_ids: []
    config_ids:
      - 9b1e5f63-2d4a-4c8e-a750-c1f2d3e4b5a6
"#,
        );

        let seed = load_seed(file.path()).expect("Failed to load seed");
        assert_eq!(seed.configurations.len(), 1);
        assert_eq!(seed.configurations[0].model.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_load_seed_missing_file() {
        let err = load_seed(Path::new("/nonexistent/seed.yaml")).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
