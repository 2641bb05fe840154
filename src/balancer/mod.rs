//! ロードバランサー
//!
//! 健全な候補エンドポイント集合に対する選択関数。モードごとに
//! フェイルオーバー順序付きの候補列を返し、ディスパッチャーが
//! 先頭から順にアドミッションを試みる。

pub mod lease;

pub use lease::RequestLease;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use uuid::Uuid;

use crate::health::EndpointHealth;
use crate::types::{Endpoint, LoadBalancingMode, VirtualModelRunner};

/// One selectable endpoint: its descriptor plus live health handle.
#[derive(Clone)]
pub struct Candidate {
    /// Endpoint descriptor
    pub endpoint: Endpoint,
    /// Live health/admission state
    pub health: Arc<EndpointHealth>,
}

/// エンドポイント選択器
///
/// ラウンドロビンのカーソルはランナーごとに1つ。候補集合が呼び出し間で
/// 変わっても、総重量に対する剰余で自然にクランプされる。
#[derive(Clone, Default)]
pub struct Balancer {
    cursors: Arc<RwLock<HashMap<Uuid, Arc<AtomicUsize>>>>,
}

impl Balancer {
    /// Creates a balancer with no cursor state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders healthy candidates for dispatch.
    ///
    /// The first element is the preferred endpoint; the rest is the
    /// failover order. An empty input yields an empty order. The
    /// round-robin cursor advances exactly once per call.
    pub fn select_order(
        &self,
        runner: &VirtualModelRunner,
        candidates: Vec<Candidate>,
    ) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }

        match runner.load_balancing {
            LoadBalancingMode::RoundRobin => {
                let start = self.weighted_cursor_index(runner.id, &candidates);
                rotate(candidates, start)
            }
            LoadBalancingMode::Random => {
                let start = weighted_random_index(&candidates);
                rotate(candidates, start)
            }
            // Active/standby: always the configured order, no rotation
            LoadBalancingMode::FirstAvailable => candidates,
        }
    }

    /// Advances the runner's cursor and maps it onto the cumulative
    /// weight cycle of the current candidate set.
    fn weighted_cursor_index(&self, runner_id: Uuid, candidates: &[Candidate]) -> usize {
        let cursor = self.cursor_for(runner_id);
        let total: u64 = candidates
            .iter()
            .map(|c| c.health.weight.max(1) as u64)
            .sum();
        let position = (cursor.fetch_add(1, Ordering::AcqRel) as u64) % total;

        let mut accumulated = 0u64;
        for (index, candidate) in candidates.iter().enumerate() {
            accumulated += candidate.health.weight.max(1) as u64;
            if position < accumulated {
                return index;
            }
        }
        // Unreachable: position < total == final accumulated value
        candidates.len() - 1
    }

    fn cursor_for(&self, runner_id: Uuid) -> Arc<AtomicUsize> {
        if let Some(cursor) = self
            .cursors
            .read()
            .expect("cursor lock poisoned")
            .get(&runner_id)
        {
            return Arc::clone(cursor);
        }
        let mut cursors = self.cursors.write().expect("cursor lock poisoned");
        Arc::clone(
            cursors
                .entry(runner_id)
                .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
        )
    }

    /// Drops cursor state for a removed runner.
    pub fn forget(&self, runner_id: Uuid) {
        self.cursors
            .write()
            .expect("cursor lock poisoned")
            .remove(&runner_id);
    }
}

/// Weighted sample over the candidate weights.
fn weighted_random_index(candidates: &[Candidate]) -> usize {
    let total: u64 = candidates
        .iter()
        .map(|c| c.health.weight.max(1) as u64)
        .sum();
    let mut position = rand::thread_rng().gen_range(0..total);
    for (index, candidate) in candidates.iter().enumerate() {
        let weight = candidate.health.weight.max(1) as u64;
        if position < weight {
            return index;
        }
        position -= weight;
    }
    candidates.len() - 1
}

/// Rotates the candidate list so `start` comes first, preserving the
/// relative order of the rest as the failover sequence.
fn rotate(mut candidates: Vec<Candidate>, start: usize) -> Vec<Candidate> {
    let len = candidates.len().max(1);
    candidates.rotate_left(start % len);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dialect, HealthCheckConfig, SessionAffinityMode};
    use std::collections::HashMap as StdHashMap;

    fn endpoint_with_weight(name: &str, weight: u32) -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 11434,
            tls: false,
            dialect: Dialect::Ollama,
            api_key: None,
            weight,
            max_parallel_requests: 8,
            health_check: HealthCheckConfig::default(),
        }
    }

    fn candidate(name: &str, weight: u32) -> Candidate {
        let endpoint = endpoint_with_weight(name, weight);
        let monitor_state = crate::health::test_support::health_for(&endpoint);
        Candidate {
            endpoint,
            health: monitor_state,
        }
    }

    fn runner(mode: LoadBalancingMode) -> VirtualModelRunner {
        VirtualModelRunner {
            id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            name: "r".to_string(),
            base_path: "/r".to_string(),
            endpoint_ids: vec![],
            config_ids: vec![],
            load_balancing: mode,
            affinity: SessionAffinityMode::None,
            session_timeout_ms: 600_000,
            session_max_entries: 1000,
            allow_completions: true,
            allow_embeddings: true,
            allow_model_management: false,
            timeout_ms: 120_000,
            active: true,
        }
    }

    #[test]
    fn test_round_robin_weight_proportions() {
        let balancer = Balancer::new();
        let r = runner(LoadBalancingMode::RoundRobin);
        let a = candidate("a", 3);
        let b = candidate("b", 1);
        let candidates = vec![a.clone(), b.clone()];

        let mut counts: StdHashMap<String, usize> = StdHashMap::new();
        for _ in 0..400 {
            let order = balancer.select_order(&r, candidates.clone());
            *counts.entry(order[0].endpoint.name.clone()).or_default() += 1;
        }

        // Cumulative-weight cycle of length 4: a,a,a,b repeated
        assert_eq!(counts["a"], 300);
        assert_eq!(counts["b"], 100);
    }

    #[test]
    fn test_round_robin_cursor_survives_candidate_set_change() {
        let balancer = Balancer::new();
        let r = runner(LoadBalancingMode::RoundRobin);
        let a = candidate("a", 1);
        let b = candidate("b", 1);
        let c = candidate("c", 1);

        for _ in 0..5 {
            balancer.select_order(&r, vec![a.clone(), b.clone(), c.clone()]);
        }
        // Shrinking the set must not panic or select out of range
        let order = balancer.select_order(&r, vec![a.clone()]);
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].endpoint.name, "a");
    }

    #[test]
    fn test_round_robin_failover_order_covers_all() {
        let balancer = Balancer::new();
        let r = runner(LoadBalancingMode::RoundRobin);
        let candidates = vec![candidate("a", 1), candidate("b", 1), candidate("c", 1)];

        let order = balancer.select_order(&r, candidates);
        assert_eq!(order.len(), 3);
        let names: std::collections::HashSet<_> =
            order.iter().map(|c| c.endpoint.name.clone()).collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_random_weight_bias() {
        let balancer = Balancer::new();
        let r = runner(LoadBalancingMode::Random);
        let candidates = vec![candidate("heavy", 9), candidate("light", 1)];

        let mut heavy = 0usize;
        let n = 2000;
        for _ in 0..n {
            let order = balancer.select_order(&r, candidates.clone());
            if order[0].endpoint.name == "heavy" {
                heavy += 1;
            }
        }
        // Expected 90%, allow generous tolerance
        assert!(heavy > n * 8 / 10, "heavy selected {} of {}", heavy, n);
    }

    #[test]
    fn test_first_available_is_deterministic() {
        let balancer = Balancer::new();
        let r = runner(LoadBalancingMode::FirstAvailable);
        let candidates = vec![candidate("primary", 1), candidate("standby", 5)];

        for _ in 0..10 {
            let order = balancer.select_order(&r, candidates.clone());
            assert_eq!(order[0].endpoint.name, "primary");
        }
    }

    #[test]
    fn test_empty_candidates() {
        let balancer = Balancer::new();
        let r = runner(LoadBalancingMode::RoundRobin);
        assert!(balancer.select_order(&r, vec![]).is_empty());
    }

    #[test]
    fn test_cursors_are_per_runner() {
        let balancer = Balancer::new();
        let r1 = runner(LoadBalancingMode::RoundRobin);
        let r2 = runner(LoadBalancingMode::RoundRobin);
        let candidates = vec![candidate("a", 1), candidate("b", 1)];

        let first_r1 = balancer.select_order(&r1, candidates.clone());
        let first_r2 = balancer.select_order(&r2, candidates.clone());
        // Both runners start at their own cursor origin
        assert_eq!(first_r1[0].endpoint.name, first_r2[0].endpoint.name);
    }
}
