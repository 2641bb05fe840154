//! エンドポイントヘルスチェック
//!
//! エンドポイントごとに独立したプローブループを起動し、ヒステリシス
//! （連続成功/失敗のしきい値）で健全状態を遷移させる。ディスパッチの
//! 実トラフィック結果も同じカウンターに反映されるため、固定間隔の
//! プローブより速く劣化を検知できる。

mod monitor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::types::Endpoint;

/// Atomic snapshot of one endpoint's health state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Endpoint ID
    pub endpoint_id: Uuid,
    /// Current hysteresis state
    pub healthy: bool,
    /// Consecutive successful probes/outcomes
    pub consecutive_successes: u32,
    /// Consecutive failed probes/outcomes
    pub consecutive_failures: u32,
    /// Requests currently admitted to this endpoint
    pub in_flight: u32,
    /// Admission cap
    pub max_parallel: u32,
    /// Time of the most recent probe or live outcome
    pub last_check: Option<DateTime<Utc>>,
    /// Most recent failure detail
    pub last_error: Option<String>,
    /// Cumulative milliseconds spent healthy
    pub uptime_ms: u64,
    /// Cumulative milliseconds spent unhealthy
    pub downtime_ms: u64,
}

struct HealthInner {
    healthy: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    // Accumulated at each transition; the open interval since
    // last_transition is added when a snapshot is taken.
    last_transition: DateTime<Utc>,
    uptime_ms: u64,
    downtime_ms: u64,
}

/// Per-endpoint health state.
///
/// The hysteresis counters live behind a short-held std mutex shared by
/// the probe loop and the dispatcher's live-outcome feed; the in-flight
/// counter is a separate atomic so admission never touches the mutex.
pub struct EndpointHealth {
    /// Endpoint ID
    pub endpoint_id: Uuid,
    /// Selection weight (>= 1)
    pub weight: u32,
    /// Admission cap
    pub max_parallel: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    in_flight: AtomicU32,
    inner: Mutex<HealthInner>,
}

impl EndpointHealth {
    fn new(endpoint: &Endpoint) -> Self {
        Self {
            endpoint_id: endpoint.id,
            weight: endpoint.effective_weight(),
            max_parallel: endpoint.max_parallel_requests.max(1),
            unhealthy_threshold: endpoint.health_check.unhealthy_threshold.max(1),
            healthy_threshold: endpoint.health_check.healthy_threshold.max(1),
            in_flight: AtomicU32::new(0),
            // Optimistic start: an endpoint is assumed healthy until the
            // failure threshold is reached, so a fresh gateway can serve
            // traffic before the first probe completes.
            inner: Mutex::new(HealthInner {
                healthy: true,
                consecutive_successes: 0,
                consecutive_failures: 0,
                last_check: None,
                last_error: None,
                last_transition: Utc::now(),
                uptime_ms: 0,
                downtime_ms: 0,
            }),
        }
    }

    /// Records a successful probe or dispatch outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("health state lock poisoned");
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;
        inner.last_check = Some(Utc::now());
        if !inner.healthy && inner.consecutive_successes >= self.healthy_threshold {
            Self::transition(&mut inner, true);
            tracing::info!(
                endpoint_id = %self.endpoint_id,
                consecutive_successes = inner.consecutive_successes,
                "endpoint recovered, marking healthy"
            );
        }
    }

    /// Records a failed probe or dispatch outcome.
    pub fn record_failure(&self, error: impl Into<String>) {
        let error = error.into();
        let mut inner = self.inner.lock().expect("health state lock poisoned");
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_check = Some(Utc::now());
        inner.last_error = Some(error.clone());
        if inner.healthy && inner.consecutive_failures >= self.unhealthy_threshold {
            Self::transition(&mut inner, false);
            tracing::warn!(
                endpoint_id = %self.endpoint_id,
                consecutive_failures = inner.consecutive_failures,
                error = %error,
                "endpoint failure threshold reached, marking unhealthy"
            );
        }
    }

    fn transition(inner: &mut HealthInner, healthy: bool) {
        let now = Utc::now();
        let elapsed = (now - inner.last_transition).num_milliseconds().max(0) as u64;
        if inner.healthy {
            inner.uptime_ms += elapsed;
        } else {
            inner.downtime_ms += elapsed;
        }
        inner.healthy = healthy;
        inner.last_transition = now;
    }

    /// Current hysteresis state.
    pub fn is_healthy(&self) -> bool {
        self.inner.lock().expect("health state lock poisoned").healthy
    }

    /// Tries to admit one request. Returns false at the admission cap.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_parallel {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases one admitted slot.
    pub fn release(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "in-flight counter underflow");
    }

    /// Requests currently admitted.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Takes an atomic snapshot of the full state.
    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().expect("health state lock poisoned");
        let open_ms = (Utc::now() - inner.last_transition).num_milliseconds().max(0) as u64;
        let (uptime_ms, downtime_ms) = if inner.healthy {
            (inner.uptime_ms + open_ms, inner.downtime_ms)
        } else {
            (inner.uptime_ms, inner.downtime_ms + open_ms)
        };
        HealthSnapshot {
            endpoint_id: self.endpoint_id,
            healthy: inner.healthy,
            consecutive_successes: inner.consecutive_successes,
            consecutive_failures: inner.consecutive_failures,
            in_flight: self.in_flight(),
            max_parallel: self.max_parallel,
            last_check: inner.last_check,
            last_error: inner.last_error.clone(),
            uptime_ms,
            downtime_ms,
        }
    }
}

struct WatchedEndpoint {
    health: Arc<EndpointHealth>,
    stop: watch::Sender<bool>,
}

/// ヘルスモニター
///
/// 監視対象エンドポイントの登録・解除と、スナップショットの提供を行う。
#[derive(Clone)]
pub struct HealthMonitor {
    client: reqwest::Client,
    watched: Arc<RwLock<HashMap<Uuid, WatchedEndpoint>>>,
}

impl HealthMonitor {
    /// Creates a monitor using the given HTTP client for probes.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            watched: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Starts watching an endpoint, spawning its probe loop.
    ///
    /// Re-watching an already-watched endpoint replaces its probe task
    /// and resets its health state (the endpoint's config may have
    /// changed).
    pub async fn watch(&self, endpoint: Endpoint) {
        let health = Arc::new(EndpointHealth::new(&endpoint));
        let (stop_tx, stop_rx) = watch::channel(false);

        let previous = self.watched.write().await.insert(
            endpoint.id,
            WatchedEndpoint {
                health: Arc::clone(&health),
                stop: stop_tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }

        tracing::debug!(endpoint_id = %endpoint.id, url = %endpoint.health_check_url(), "starting health probe loop");
        tokio::spawn(monitor::probe_loop(
            self.client.clone(),
            endpoint,
            health,
            stop_rx,
        ));
    }

    /// Stops watching an endpoint and drops its state.
    pub async fn unwatch(&self, endpoint_id: Uuid) {
        if let Some(entry) = self.watched.write().await.remove(&endpoint_id) {
            let _ = entry.stop.send(true);
            tracing::debug!(endpoint_id = %endpoint_id, "stopped health probe loop");
        }
    }

    /// Starts watching every given endpoint. Used at startup.
    pub async fn bootstrap(&self, endpoints: Vec<Endpoint>) {
        for endpoint in endpoints {
            self.watch(endpoint).await;
        }
    }

    /// Shared handle to one endpoint's health state.
    pub async fn handle(&self, endpoint_id: Uuid) -> Option<Arc<EndpointHealth>> {
        self.watched
            .read()
            .await
            .get(&endpoint_id)
            .map(|e| Arc::clone(&e.health))
    }

    /// Whether an endpoint is currently healthy. Unknown endpoints are not.
    pub async fn is_healthy(&self, endpoint_id: Uuid) -> bool {
        match self.watched.read().await.get(&endpoint_id) {
            Some(entry) => entry.health.is_healthy(),
            None => false,
        }
    }

    /// Snapshot of one endpoint.
    pub async fn snapshot(&self, endpoint_id: Uuid) -> Option<HealthSnapshot> {
        self.watched
            .read()
            .await
            .get(&endpoint_id)
            .map(|e| e.health.snapshot())
    }

    /// Snapshots of all watched endpoints.
    pub async fn snapshots(&self) -> Vec<HealthSnapshot> {
        self.watched
            .read()
            .await
            .values()
            .map(|e| e.health.snapshot())
            .collect()
    }

    /// Live dispatch outcome feed.
    ///
    /// Shares the hysteresis counters with the probe loop, so endpoints
    /// failing under production traffic degrade faster than the probe
    /// interval alone would show.
    pub async fn record_outcome(&self, endpoint_id: Uuid, success: bool, error: Option<String>) {
        let handle = self.handle(endpoint_id).await;
        if let Some(health) = handle {
            if success {
                health.record_success();
            } else {
                health.record_failure(error.unwrap_or_else(|| "dispatch failed".to_string()));
            }
        }
    }
}
