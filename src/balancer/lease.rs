//! リクエストリース
//!
//! アドミッション済みスロットのドロップガード。どの経路で処理が
//! 終わっても（成功・失敗・キャンセル）in-flightカウンターを確実に
//! 解放する。

use std::sync::Arc;

use uuid::Uuid;

use crate::health::{EndpointHealth, HealthMonitor};

/// One admitted in-flight slot on an endpoint.
///
/// Dropping the lease releases the slot without reporting a health
/// outcome (used for cancellation). Call [`RequestLease::complete`] to
/// release the slot and feed the dispatch result into the hysteresis
/// counters.
pub struct RequestLease {
    health: Arc<EndpointHealth>,
    monitor: HealthMonitor,
    released: bool,
}

impl RequestLease {
    /// Tries to admit one request on the endpoint.
    ///
    /// Returns `None` when the endpoint is at its admission cap.
    pub fn acquire(monitor: HealthMonitor, health: Arc<EndpointHealth>) -> Option<Self> {
        if !health.try_acquire() {
            return None;
        }
        Some(Self {
            health,
            monitor,
            released: false,
        })
    }

    /// Endpoint this lease is held on.
    pub fn endpoint_id(&self) -> Uuid {
        self.health.endpoint_id
    }

    /// Releases the slot and reports the dispatch outcome.
    pub async fn complete(mut self, success: bool, error: Option<String>) {
        self.health.release();
        self.released = true;
        let endpoint_id = self.health.endpoint_id;
        self.monitor.record_outcome(endpoint_id, success, error).await;
    }
}

impl Drop for RequestLease {
    fn drop(&mut self) {
        if !self.released {
            self.health.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::test_support::health_for;
    use crate::types::{Dialect, Endpoint, HealthCheckConfig};

    fn endpoint() -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            name: "ep".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11434,
            tls: false,
            dialect: Dialect::Ollama,
            api_key: None,
            weight: 1,
            max_parallel_requests: 1,
            health_check: HealthCheckConfig {
                unhealthy_threshold: 1,
                healthy_threshold: 1,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let monitor = HealthMonitor::new(reqwest::Client::new());
        let health = health_for(&endpoint());

        let lease = RequestLease::acquire(monitor.clone(), Arc::clone(&health))
            .expect("first acquire must succeed");
        assert_eq!(health.in_flight(), 1);
        assert!(
            RequestLease::acquire(monitor, Arc::clone(&health)).is_none(),
            "cap of 1 must reject the second lease"
        );

        drop(lease);
        assert_eq!(health.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_complete_releases_once() {
        let monitor = HealthMonitor::new(reqwest::Client::new());
        let health = health_for(&endpoint());

        let lease = RequestLease::acquire(monitor, Arc::clone(&health)).unwrap();
        lease.complete(true, None).await;
        assert_eq!(health.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_complete_feeds_health_outcome() {
        let monitor = HealthMonitor::new(reqwest::Client::new());
        let ep = endpoint();
        monitor.watch(ep.clone()).await;
        let health = monitor.handle(ep.id).await.unwrap();

        let lease = RequestLease::acquire(monitor.clone(), health).unwrap();
        lease
            .complete(false, Some("backend 502".to_string()))
            .await;

        // unhealthy_threshold = 1
        assert!(!monitor.is_healthy(ep.id).await);
    }
}
