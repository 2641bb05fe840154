//! リポジトリ抽象化
//!
//! テナントスコープのCRUDトレイト。永続化層は外部コラボレーターで、
//! ゲートウェイ本体はこのトレイト経由でのみ設定レコードを読む。

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::GatewayResult;
use crate::types::{Configuration, Endpoint, RequestHistoryEntry, VirtualModelRunner};

pub use memory::{
    InMemoryConfigurationRepository, InMemoryEndpointRepository, InMemoryHistoryRepository,
    InMemoryRunnerRepository,
};

/// One page of a cursor-paginated enumeration.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Opaque cursor for the next page, absent on the last page
    pub next_cursor: Option<String>,
}

/// 仮想モデルランナーリポジトリ
#[async_trait]
pub trait RunnerRepository: Send + Sync {
    /// Create a runner
    async fn create(&self, runner: VirtualModelRunner) -> GatewayResult<()>;

    /// Fetch a runner by ID
    async fn get(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<VirtualModelRunner>>;

    /// Fetch the runner registered under a base path.
    /// Prefers the active runner when an inactive one shares the path,
    /// so callers can distinguish disabled from missing.
    async fn find_by_base_path(
        &self,
        tenant_id: &str,
        base_path: &str,
    ) -> GatewayResult<Option<VirtualModelRunner>>;

    /// Replace a runner
    async fn update(&self, runner: VirtualModelRunner) -> GatewayResult<()>;

    /// Delete a runner
    async fn delete(&self, tenant_id: &str, id: Uuid) -> GatewayResult<()>;

    /// Enumerate runners for a tenant
    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<VirtualModelRunner>>;
}

/// エンドポイントリポジトリ
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// Create an endpoint
    async fn create(&self, endpoint: Endpoint) -> GatewayResult<()>;

    /// Fetch an endpoint by ID
    async fn get(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<Endpoint>>;

    /// Fetch several endpoints by ID, preserving input order.
    /// Missing IDs are skipped rather than erroring.
    async fn get_many(&self, tenant_id: &str, ids: &[Uuid]) -> GatewayResult<Vec<Endpoint>>;

    /// Replace an endpoint
    async fn update(&self, endpoint: Endpoint) -> GatewayResult<()>;

    /// Delete an endpoint
    async fn delete(&self, tenant_id: &str, id: Uuid) -> GatewayResult<()>;

    /// Enumerate endpoints for a tenant
    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<Endpoint>>;

    /// Bulk fetch across all tenants, used to bootstrap the health monitor
    async fn list_all(&self) -> GatewayResult<Vec<Endpoint>>;
}

/// 設定マッピングリポジトリ
#[async_trait]
pub trait ConfigurationRepository: Send + Sync {
    /// Create a configuration
    async fn create(&self, configuration: Configuration) -> GatewayResult<()>;

    /// Fetch a configuration by ID
    async fn get(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<Configuration>>;

    /// Fetch several configurations by ID, preserving input order.
    /// Missing IDs are skipped rather than erroring.
    async fn get_many(&self, tenant_id: &str, ids: &[Uuid]) -> GatewayResult<Vec<Configuration>>;

    /// Replace a configuration
    async fn update(&self, configuration: Configuration) -> GatewayResult<()>;

    /// Delete a configuration
    async fn delete(&self, tenant_id: &str, id: Uuid) -> GatewayResult<()>;

    /// Enumerate configurations for a tenant
    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<Configuration>>;
}

/// リクエスト履歴リポジトリ
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Persist an entry (insert or replace by ID)
    async fn save(&self, entry: RequestHistoryEntry) -> GatewayResult<()>;

    /// Enumerate entries for a tenant, newest first
    async fn list(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<Page<RequestHistoryEntry>>;

    /// Delete entries started before the cutoff; returns the count removed
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> GatewayResult<u64>;
}
