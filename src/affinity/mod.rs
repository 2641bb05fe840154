//! セッションアフィニティテーブル
//!
//! アフィニティキー→エンドポイントのスティッキーマップ。ランナーごとに
//! 独立したサブテーブルを持ち、スライディングTTLとLRU上限で有界に保つ。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::VirtualModelRunner;

#[derive(Debug, Clone)]
struct AffinityEntry {
    endpoint_id: Uuid,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

type RunnerTable = Arc<Mutex<HashMap<String, AffinityEntry>>>;

/// Sticky key → endpoint map, one sub-table per runner.
#[derive(Clone, Default)]
pub struct SessionAffinityTable {
    tables: Arc<RwLock<HashMap<Uuid, RunnerTable>>>,
}

impl SessionAffinityTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn table_for(&self, runner_id: Uuid) -> RunnerTable {
        if let Some(table) = self
            .tables
            .read()
            .expect("affinity lock poisoned")
            .get(&runner_id)
        {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write().expect("affinity lock poisoned");
        Arc::clone(tables.entry(runner_id).or_default())
    }

    /// Looks up the unexpired entry for a key, without refreshing it.
    ///
    /// Expired entries are removed lazily here. The caller decides
    /// whether the returned endpoint is usable (it may be unhealthy, in
    /// which case the entry is left in place so the endpoint is
    /// preferred again after recovery).
    pub fn lookup(&self, runner: &VirtualModelRunner, key: &str) -> Option<Uuid> {
        let table = self.table_for(runner.id);
        let mut entries = table.lock().expect("affinity lock poisoned");
        let entry = entries.get(key)?;

        let ttl = Duration::from_millis(runner.session_timeout_ms);
        let age = (Utc::now() - entry.last_used_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > ttl {
            entries.remove(key);
            return None;
        }
        Some(entry.endpoint_id)
    }

    /// Refreshes the sliding TTL after the entry's endpoint was used.
    pub fn touch(&self, runner: &VirtualModelRunner, key: &str) {
        let table = self.table_for(runner.id);
        let mut entries = table.lock().expect("affinity lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.last_used_at = Utc::now();
        }
    }

    /// Inserts or overwrites the entry for a key after a successful
    /// load-balancer-selected dispatch.
    ///
    /// When the sub-table is at `session_max_entries`, the
    /// least-recently-used entry is evicted first.
    pub fn record(&self, runner: &VirtualModelRunner, key: &str, endpoint_id: Uuid) {
        let table = self.table_for(runner.id);
        let mut entries = table.lock().expect("affinity lock poisoned");

        let max = runner.session_max_entries.max(1);
        if !entries.contains_key(key) && entries.len() >= max {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(
                    runner_id = %runner.id,
                    "affinity table full, evicting least-recently-used entry"
                );
                entries.remove(&oldest);
            }
        }

        let now = Utc::now();
        entries.insert(
            key.to_string(),
            AffinityEntry {
                endpoint_id,
                created_at: now,
                last_used_at: now,
            },
        );
    }

    /// Drops all entries for a removed runner.
    pub fn remove_runner(&self, runner_id: Uuid) {
        self.tables
            .write()
            .expect("affinity lock poisoned")
            .remove(&runner_id);
    }

    /// Creation time of the oldest live entry for a runner (state API).
    ///
    /// Touches refresh `last_used_at` only, so this reflects how long
    /// the longest-lived session has been pinned.
    pub fn oldest_entry_created_at(&self, runner_id: Uuid) -> Option<DateTime<Utc>> {
        self.tables
            .read()
            .expect("affinity lock poisoned")
            .get(&runner_id)
            .and_then(|table| {
                table
                    .lock()
                    .expect("affinity lock poisoned")
                    .values()
                    .map(|e| e.created_at)
                    .min()
            })
    }

    /// Current entry count for a runner (state API / tests).
    pub fn len(&self, runner_id: Uuid) -> usize {
        self.tables
            .read()
            .expect("affinity lock poisoned")
            .get(&runner_id)
            .map(|t| t.lock().expect("affinity lock poisoned").len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LoadBalancingMode, SessionAffinityMode};

    fn runner(timeout_ms: u64, max_entries: usize) -> VirtualModelRunner {
        VirtualModelRunner {
            id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            name: "r".to_string(),
            base_path: "/r".to_string(),
            endpoint_ids: vec![],
            config_ids: vec![],
            load_balancing: LoadBalancingMode::RoundRobin,
            affinity: SessionAffinityMode::SourceIp,
            session_timeout_ms: timeout_ms,
            session_max_entries: max_entries,
            allow_completions: true,
            allow_embeddings: true,
            allow_model_management: false,
            timeout_ms: 120_000,
            active: true,
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let table = SessionAffinityTable::new();
        let r = runner(600_000, 10);
        let endpoint_id = Uuid::new_v4();

        assert!(table.lookup(&r, "10.0.0.1").is_none());
        table.record(&r, "10.0.0.1", endpoint_id);
        assert_eq!(table.lookup(&r, "10.0.0.1"), Some(endpoint_id));
    }

    #[test]
    fn test_expired_entry_is_removed() {
        let table = SessionAffinityTable::new();
        // TTL of zero: everything is expired on the next lookup
        let r = runner(0, 10);
        table.record(&r, "key", Uuid::new_v4());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(table.lookup(&r, "key").is_none());
        assert_eq!(table.len(r.id), 0);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let table = SessionAffinityTable::new();
        let r = runner(600_000, 2);
        let (e1, e2, e3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        table.record(&r, "first", e1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        table.record(&r, "second", e2);
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Reuse "first" so "second" becomes the LRU entry
        table.touch(&r, "first");
        std::thread::sleep(std::time::Duration::from_millis(2));
        table.record(&r, "third", e3);

        assert_eq!(table.len(r.id), 2);
        assert_eq!(table.lookup(&r, "first"), Some(e1));
        assert!(table.lookup(&r, "second").is_none());
        assert_eq!(table.lookup(&r, "third"), Some(e3));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let table = SessionAffinityTable::new();
        let r = runner(600_000, 1);
        let (e1, e2) = (Uuid::new_v4(), Uuid::new_v4());

        table.record(&r, "key", e1);
        table.record(&r, "key", e2);
        assert_eq!(table.len(r.id), 1);
        assert_eq!(table.lookup(&r, "key"), Some(e2));
    }

    #[test]
    fn test_runner_isolation() {
        let table = SessionAffinityTable::new();
        let r1 = runner(600_000, 10);
        let r2 = runner(600_000, 10);
        let endpoint_id = Uuid::new_v4();

        table.record(&r1, "key", endpoint_id);
        assert!(table.lookup(&r2, "key").is_none());
    }

    #[test]
    fn test_oldest_entry_created_at_survives_touch() {
        let table = SessionAffinityTable::new();
        let r = runner(600_000, 10);
        assert!(table.oldest_entry_created_at(r.id).is_none());

        table.record(&r, "first", Uuid::new_v4());
        std::thread::sleep(std::time::Duration::from_millis(2));
        table.record(&r, "second", Uuid::new_v4());
        let oldest = table
            .oldest_entry_created_at(r.id)
            .expect("entries must be visible");

        // Refreshing the sliding TTL must not move the creation time
        table.touch(&r, "first");
        assert_eq!(table.oldest_entry_created_at(r.id), Some(oldest));
    }

    #[test]
    fn test_remove_runner() {
        let table = SessionAffinityTable::new();
        let r = runner(600_000, 10);
        table.record(&r, "key", Uuid::new_v4());
        table.remove_runner(r.id);
        assert_eq!(table.len(r.id), 0);
    }
}
