//! 仮想モデルランナーレジストリ
//!
//! リポジトリを束ね、ディスパッチごとにBasePath→ランナー→エンドポイント群
//! の解決を行う。レコードは毎回読み直すため、管理側の更新は即座に反映される。

use std::sync::Arc;

use uuid::Uuid;

use crate::common::GatewayResult;
use crate::repo::{ConfigurationRepository, EndpointRepository, RunnerRepository};
use crate::types::{Configuration, Endpoint, VirtualModelRunner};

/// Runner/endpoint resolution facade over the repositories.
#[derive(Clone)]
pub struct RunnerRegistry {
    runners: Arc<dyn RunnerRepository>,
    endpoints: Arc<dyn EndpointRepository>,
    configurations: Arc<dyn ConfigurationRepository>,
}

impl RunnerRegistry {
    /// Creates a registry over the given repositories.
    pub fn new(
        runners: Arc<dyn RunnerRepository>,
        endpoints: Arc<dyn EndpointRepository>,
        configurations: Arc<dyn ConfigurationRepository>,
    ) -> Self {
        Self {
            runners,
            endpoints,
            configurations,
        }
    }

    /// Looks up the runner registered under a base path, preferring the
    /// active one. The caller is responsible for rejecting inactive
    /// runners.
    pub async fn find_runner(
        &self,
        tenant_id: &str,
        base_path: &str,
    ) -> GatewayResult<Option<VirtualModelRunner>> {
        self.runners.find_by_base_path(tenant_id, base_path).await
    }

    /// Fetches a runner's endpoints in configured order.
    ///
    /// Endpoints deleted since the runner was last saved are silently
    /// dropped from the result.
    pub async fn endpoints_for(
        &self,
        runner: &VirtualModelRunner,
    ) -> GatewayResult<Vec<Endpoint>> {
        self.endpoints
            .get_many(&runner.tenant_id, &runner.endpoint_ids)
            .await
    }

    /// Fetches a runner's attached configurations in configured order.
    ///
    /// Configurations deleted since the runner was last saved are
    /// silently dropped, like endpoints.
    pub async fn configurations_for(
        &self,
        runner: &VirtualModelRunner,
    ) -> GatewayResult<Vec<Configuration>> {
        if runner.config_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.configurations
            .get_many(&runner.tenant_id, &runner.config_ids)
            .await
    }

    /// Fetches a single endpoint by ID.
    pub async fn endpoint(&self, tenant_id: &str, id: Uuid) -> GatewayResult<Option<Endpoint>> {
        self.endpoints.get(tenant_id, id).await
    }

    /// All endpoints across tenants, used to bootstrap the health monitor.
    pub async fn all_endpoints(&self) -> GatewayResult<Vec<Endpoint>> {
        self.endpoints.list_all().await
    }

    /// Enumerates a tenant's runners (state API).
    pub async fn list_runners(
        &self,
        tenant_id: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> GatewayResult<crate::repo::Page<VirtualModelRunner>> {
        self.runners.list(tenant_id, cursor, limit).await
    }
}
