//! プローブループ
//!
//! エンドポイントごとに1つ、tokioタスクとして動作する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::health::EndpointHealth;
use crate::types::{Endpoint, HealthCheckMethod};

// Probes faster than this would dominate the backend with checks.
const MIN_INTERVAL_MS: u64 = 100;

/// Timed probe loop for one endpoint. Exits when the stop channel fires.
pub(crate) async fn probe_loop(
    client: reqwest::Client,
    endpoint: Endpoint,
    health: Arc<EndpointHealth>,
    mut stop: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(endpoint.health_check.interval_ms.max(MIN_INTERVAL_MS));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match probe_once(&client, &endpoint).await {
                    Ok(()) => health.record_success(),
                    Err(error) => {
                        tracing::debug!(
                            endpoint_id = %endpoint.id,
                            url = %endpoint.health_check_url(),
                            error = %error,
                            "health probe failed"
                        );
                        health.record_failure(error);
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}

/// Issues a single probe and compares the status to the expected code.
async fn probe_once(client: &reqwest::Client, endpoint: &Endpoint) -> Result<(), String> {
    let url = endpoint.health_check_url();
    let request = match endpoint.health_check.method {
        HealthCheckMethod::Get => client.get(&url),
        HealthCheckMethod::Head => client.head(&url),
    };

    let response = request
        .timeout(Duration::from_millis(endpoint.health_check.timeout_ms))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                format!("health probe timed out after {}ms", endpoint.health_check.timeout_ms)
            } else {
                format!("health probe failed: {}", e)
            }
        })?;

    let status = response.status().as_u16();
    if status == endpoint.health_check.expected_status {
        Ok(())
    } else {
        Err(format!(
            "unexpected status {} (expected {})",
            status, endpoint.health_check.expected_status
        ))
    }
}
