//! インメモリリポジトリ実装
//!
//! シードファイルから読み込んだレコードを保持する。テスト、および
//! SQL永続化層を持たないスタンドアロン運用で使用する。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::common::GatewayResult;
use crate::repo::{
    ConfigurationRepository, EndpointRepository, HistoryRepository, Page, RunnerRepository,
};
use crate::types::{Configuration, Endpoint, RequestHistoryEntry, VirtualModelRunner};

fn parse_cursor(cursor: Option<String>) -> usize {
    cursor.and_then(|c| c.parse().ok()).unwrap_or(0)
}

fn page_of<T: Clone>(items: &[T], offset: usize, limit: usize) -> Page<T> {
    let end = (offset + limit).min(items.len());
    let slice = if offset < items.len() {
        items[offset..end].to_vec()
    } else {
        Vec::new()
    };
    let next_cursor = if end < items.len() {
        Some(end.to_string())
    } else {
        None
    };
    Page {
        items: slice,
        next_cursor,
    }
}

/// In-memory runner repository
#[derive(Clone, Default)]
pub struct InMemoryRunnerRepository {
    runners: Arc<RwLock<HashMap<Uuid, VirtualModelRunner>>>,
}

impl InMemoryRunnerRepository {
    /// Creates an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository pre-populated with the given runners
    pub fn with_runners(runners: Vec<VirtualModelRunner>) -> Self {
        let map = runners.into_iter().map(|r| (r.id, r)).collect();
        Self {
            runners: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl RunnerRepository for InMemoryRunnerRepository {
    async fn create(&self, runner: VirtualModelRunner) -> GatewayResult<()> {
        self.runners.write().await.insert(runner.id, runner);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<VirtualModelRunner>> {
        Ok(self
            .runners
            .read()
            .await
            .get(&id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_base_path(
        &self,
        tenant_id: &str,
        base_path: &str,
    ) -> GatewayResult<Option<VirtualModelRunner>> {
        let runners = self.runners.read().await;
        let matches: Vec<&VirtualModelRunner> = runners
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.base_path == base_path)
            .collect();
        Ok(matches
            .iter()
            .find(|r| r.active)
            .or_else(|| matches.first())
            .map(|r| (*r).clone()))
    }

    async fn update(&self, runner: VirtualModelRunner) -> GatewayResult<()> {
        self.runners.write().await.insert(runner.id, runner);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, id: Uuid) -> GatewayResult<()> {
        let mut runners = self.runners.write().await;
        if runners.get(&id).map(|r| r.tenant_id == tenant_id) == Some(true) {
            runners.remove(&id);
        }
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<VirtualModelRunner>> {
        let runners = self.runners.read().await;
        let mut items: Vec<_> = runners
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.base_path.cmp(&b.base_path));
        Ok(page_of(&items, parse_cursor(cursor), limit))
    }
}

/// In-memory endpoint repository
#[derive(Clone, Default)]
pub struct InMemoryEndpointRepository {
    endpoints: Arc<RwLock<HashMap<Uuid, Endpoint>>>,
}

impl InMemoryEndpointRepository {
    /// Creates an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository pre-populated with the given endpoints
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        let map = endpoints.into_iter().map(|e| (e.id, e)).collect();
        Self {
            endpoints: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl EndpointRepository for InMemoryEndpointRepository {
    async fn create(&self, endpoint: Endpoint) -> GatewayResult<()> {
        self.endpoints.write().await.insert(endpoint.id, endpoint);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<Endpoint>> {
        Ok(self
            .endpoints
            .read()
            .await
            .get(&id)
            .filter(|e| e.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_many(&self, tenant_id: &str, ids: &[Uuid]) -> GatewayResult<Vec<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| endpoints.get(id))
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn update(&self, endpoint: Endpoint) -> GatewayResult<()> {
        self.endpoints.write().await.insert(endpoint.id, endpoint);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, id: Uuid) -> GatewayResult<()> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.get(&id).map(|e| e.tenant_id == tenant_id) == Some(true) {
            endpoints.remove(&id);
        }
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        let mut items: Vec<_> = endpoints
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(page_of(&items, parse_cursor(cursor), limit))
    }

    async fn list_all(&self) -> GatewayResult<Vec<Endpoint>> {
        Ok(self.endpoints.read().await.values().cloned().collect())
    }
}

/// In-memory configuration repository
#[derive(Clone, Default)]
pub struct InMemoryConfigurationRepository {
    configurations: Arc<RwLock<HashMap<Uuid, Configuration>>>,
}

impl InMemoryConfigurationRepository {
    /// Creates an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository pre-populated with the given configurations
    pub fn with_configurations(configurations: Vec<Configuration>) -> Self {
        let map = configurations.into_iter().map(|c| (c.id, c)).collect();
        Self {
            configurations: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl ConfigurationRepository for InMemoryConfigurationRepository {
    async fn create(&self, configuration: Configuration) -> GatewayResult<()> {
        self.configurations
            .write()
            .await
            .insert(configuration.id, configuration);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<Configuration>> {
        Ok(self
            .configurations
            .read()
            .await
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_many(&self, tenant_id: &str, ids: &[Uuid]) -> GatewayResult<Vec<Configuration>> {
        let configurations = self.configurations.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| configurations.get(id))
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn update(&self, configuration: Configuration) -> GatewayResult<()> {
        self.configurations
            .write()
            .await
            .insert(configuration.id, configuration);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, id: Uuid) -> GatewayResult<()> {
        let mut configurations = self.configurations.write().await;
        if configurations.get(&id).map(|c| c.tenant_id == tenant_id) == Some(true) {
            configurations.remove(&id);
        }
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<Configuration>> {
        let configurations = self.configurations.read().await;
        let mut items: Vec<_> = configurations
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(page_of(&items, parse_cursor(cursor), limit))
    }
}

/// In-memory request history repository
#[derive(Clone, Default)]
pub struct InMemoryHistoryRepository {
    entries: Arc<RwLock<HashMap<Uuid, RequestHistoryEntry>>>,
}

impl InMemoryHistoryRepository {
    /// Creates an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (test helper)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when no entries are stored
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl HistoryRepository for InMemoryHistoryRepository {
    async fn save(&self, entry: RequestHistoryEntry) -> GatewayResult<()> {
        self.entries.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<RequestHistoryEntry>> {
        let entries = self.entries.read().await;
        let mut items: Vec<_> = entries
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(page_of(&items, parse_cursor(cursor), limit))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> GatewayResult<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.started_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dialect, HealthCheckConfig, LoadBalancingMode, SessionAffinityMode};
    use chrono::Duration;

    fn endpoint(tenant: &str, name: &str) -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 11434,
            tls: false,
            dialect: Dialect::Ollama,
            api_key: None,
            weight: 1,
            max_parallel_requests: 4,
            health_check: HealthCheckConfig::default(),
        }
    }

    fn runner(tenant: &str, base_path: &str, active: bool) -> VirtualModelRunner {
        VirtualModelRunner {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            name: base_path.trim_start_matches('/').to_string(),
            base_path: base_path.to_string(),
            endpoint_ids: vec![],
            config_ids: vec![],
            load_balancing: LoadBalancingMode::RoundRobin,
            affinity: SessionAffinityMode::None,
            session_timeout_ms: 600_000,
            session_max_entries: 1000,
            allow_completions: true,
            allow_embeddings: true,
            allow_model_management: false,
            timeout_ms: 120_000,
            active,
        }
    }

    fn history_entry(tenant: &str, started_at: DateTime<Utc>) -> RequestHistoryEntry {
        RequestHistoryEntry {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            runner_id: Uuid::new_v4(),
            endpoint_id: None,
            model: None,
            operation: "chat_completion".to_string(),
            started_at,
            completed_at: Some(started_at),
            request_body: String::new(),
            response_body: String::new(),
            status: Some(200),
            latency_ms: Some(10),
            streamed: false,
        }
    }

    #[tokio::test]
    async fn test_find_by_base_path_surfaces_inactive() {
        let repo = InMemoryRunnerRepository::with_runners(vec![
            runner("default", "/a", false),
            runner("default", "/b", true),
        ]);

        let inactive = repo.find_by_base_path("default", "/a").await.unwrap();
        assert!(!inactive.expect("inactive runner should be found").active);
        assert!(repo
            .find_by_base_path("default", "/b")
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_by_base_path("default", "/missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_by_base_path_prefers_active() {
        let repo = InMemoryRunnerRepository::with_runners(vec![
            runner("default", "/x", false),
            runner("default", "/x", true),
        ]);

        let found = repo.find_by_base_path("default", "/x").await.unwrap();
        assert!(found.expect("runner should be found").active);
    }

    fn configuration(tenant: &str, name: &str) -> Configuration {
        Configuration {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            model: Some("llama3".to_string()),
            parameters: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_configuration_tenant_isolation() {
        let config = configuration("team-a", "defaults");
        let id = config.id;
        let repo = InMemoryConfigurationRepository::with_configurations(vec![config]);

        assert!(repo.get("team-a", id).await.unwrap().is_some());
        assert!(repo.get("team-b", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_configuration_get_many_preserves_order() {
        let c1 = configuration("default", "first");
        let c2 = configuration("default", "second");
        let (id1, id2) = (c1.id, c2.id);
        let repo = InMemoryConfigurationRepository::with_configurations(vec![c1, c2]);

        let got = repo
            .get_many("default", &[id2, Uuid::new_v4(), id1])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, id2);
        assert_eq!(got[1].id, id1);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let ep = endpoint("team-a", "ep1");
        let id = ep.id;
        let repo = InMemoryEndpointRepository::with_endpoints(vec![ep]);

        assert!(repo.get("team-a", id).await.unwrap().is_some());
        assert!(repo.get("team-b", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_many_preserves_order_and_skips_missing() {
        let ep1 = endpoint("default", "ep1");
        let ep2 = endpoint("default", "ep2");
        let (id1, id2) = (ep1.id, ep2.id);
        let repo = InMemoryEndpointRepository::with_endpoints(vec![ep1, ep2]);

        let got = repo
            .get_many("default", &[id2, Uuid::new_v4(), id1])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, id2);
        assert_eq!(got[1].id, id1);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let repo = InMemoryRunnerRepository::with_runners(vec![
            runner("default", "/a", true),
            runner("default", "/b", true),
            runner("default", "/c", true),
        ]);

        let page1 = repo.list("default", None, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.items[0].base_path, "/a");
        let cursor = page1.next_cursor.expect("expected a next cursor");

        let page2 = repo.list("default", Some(cursor), 2).await.unwrap();
        assert_eq!(page2.items.len(), 1);
        assert_eq!(page2.items[0].base_path, "/c");
        assert!(page2.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let repo = InMemoryHistoryRepository::new();
        let now = Utc::now();
        repo.save(history_entry("default", now - Duration::days(10)))
            .await
            .unwrap();
        repo.save(history_entry("default", now - Duration::days(1)))
            .await
            .unwrap();

        let removed = repo
            .delete_older_than(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.len().await, 1);

        // Sweep is idempotent
        let removed = repo
            .delete_older_than(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_history_list_newest_first() {
        let repo = InMemoryHistoryRepository::new();
        let now = Utc::now();
        repo.save(history_entry("default", now - Duration::hours(2)))
            .await
            .unwrap();
        repo.save(history_entry("default", now))
            .await
            .unwrap();

        let page = repo.list("default", None, 10).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].started_at > page.items[1].started_at);
    }
}
