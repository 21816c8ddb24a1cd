//! Per-pod IPAM with durable records
//!
//! Owns the local pool plus a persistent log of pod-to-allocation records.
//! In-memory state is authoritative while the process lives; the on-disk
//! log is authoritative across restarts. Records are written by a spawned
//! task after the in-memory mutation commits, so the log may lag by one
//! operation; the runtime retries ADD, which makes that gap tolerable.

use chrono::Utc;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pool::{AllocationStrategy, LocalPool};
use super::{allocation_key, Allocation, IpamError};

/// Default age past which an unconfirmed allocation is swept.
pub const DEFAULT_GC_MAX_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Pool usage summary for the statistics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IpamStatistics {
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    /// allocated / usable, in [0, 1].
    pub utilization: f64,
    pub node_name: String,
    pub cidr: String,
}

pub struct IpamManager {
    pool: Arc<LocalPool>,
    strategy: AllocationStrategy,
    node_name: String,
    state_dir: PathBuf,
    allocations: RwLock<HashMap<String, Allocation>>,
    /// Outstanding write-behind tasks; `flush` joins them.
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl IpamManager {
    /// Open (or create) the state directory and rehydrate persisted records.
    pub fn new(
        cidr: Ipv4Net,
        node_name: &str,
        state_dir: &Path,
        strategy: AllocationStrategy,
    ) -> Result<Self, IpamError> {
        fs::create_dir_all(state_dir).map_err(IpamError::Load)?;

        let manager = Self {
            pool: Arc::new(LocalPool::new(cidr)),
            strategy,
            node_name: node_name.to_string(),
            state_dir: state_dir.to_path_buf(),
            allocations: RwLock::new(HashMap::new()),
            writers: Mutex::new(Vec::new()),
        };
        manager.rehydrate()?;
        Ok(manager)
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.pool.cidr()
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.pool.gateway()
    }

    pub fn pool(&self) -> &LocalPool {
        &self.pool
    }

    /// Allocate an address for `(namespace, name)`.
    ///
    /// Repeated calls with the same key return the same address until a
    /// matching release succeeds; the runtime retries ADD and must see a
    /// stable answer.
    pub async fn allocate_ip(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
    ) -> Result<Allocation, IpamError> {
        let key = allocation_key(namespace, name);

        let record = {
            let mut allocations = self.allocations.write().unwrap();
            if let Some(existing) = allocations.get_mut(&key) {
                debug!("returning existing allocation {} for {}", existing.ip, key);
                if existing.container_id != container_id {
                    existing.container_id = container_id.to_string();
                }
                existing.clone()
            } else {
                let ip = self.pool.allocate_next(self.strategy)?;
                let record = Allocation {
                    ip,
                    pod_namespace: namespace.to_string(),
                    pod_name: name.to_string(),
                    container_id: container_id.to_string(),
                    node_name: self.node_name.clone(),
                    allocated_at: Utc::now(),
                    metadata: HashMap::new(),
                };
                allocations.insert(key.clone(), record.clone());
                info!("allocated {} for {}", ip, key);
                record
            }
        };

        self.spawn_write(record.clone());
        Ok(record)
    }

    /// Release the allocation for `(namespace, name)`. Unknown keys are a
    /// successful no-op.
    pub async fn release_ip(&self, namespace: &str, name: &str) -> Result<(), IpamError> {
        let key = allocation_key(namespace, name);

        let released = {
            let mut allocations = self.allocations.write().unwrap();
            allocations.remove(&key)
        };

        match released {
            Some(record) => {
                self.pool.release(record.ip);
                info!("released {} for {}", record.ip, key);
                self.spawn_remove(&record.pod_namespace, &record.pod_name);
            }
            None => debug!("release for unknown key {}, nothing to do", key),
        }
        Ok(())
    }

    /// Walk every allocation asserting it belongs to the pod CIDR, then
    /// validate the pool itself.
    pub fn health_check(&self) -> Result<(), IpamError> {
        let cidr = self.pool.cidr();
        {
            let allocations = self.allocations.read().unwrap();
            for (key, record) in allocations.iter() {
                if !cidr.contains(&record.ip) {
                    return Err(IpamError::RecordOutOfRange {
                        key: key.clone(),
                        ip: record.ip,
                        cidr,
                    });
                }
            }
        }
        self.pool.validate()?;
        Ok(())
    }

    /// Drop the in-memory map and rebuild it from the persistent log.
    /// Used by the recovery loop after a catastrophic discrepancy.
    pub async fn force_resync(&self) -> Result<(), IpamError> {
        self.flush().await;
        {
            let mut allocations = self.allocations.write().unwrap();
            allocations.clear();
        }
        self.pool.clear();
        self.rehydrate()?;
        info!("IPAM state resynced from {}", self.state_dir.display());
        Ok(())
    }

    /// Sweep allocations older than `max_age` whose pod cannot be confirmed
    /// alive. Returns the number of records released.
    pub async fn garbage_collect<F, Fut>(&self, max_age: Duration, is_pod_alive: F) -> usize
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = bool>,
    {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());

        let candidates: Vec<Allocation> = {
            let allocations = self.allocations.read().unwrap();
            allocations
                .values()
                .filter(|a| a.allocated_at < cutoff)
                .cloned()
                .collect()
        };

        let mut swept = 0;
        for record in candidates {
            if is_pod_alive(record.pod_namespace.clone(), record.pod_name.clone()).await {
                continue;
            }
            warn!(
                "sweeping stale allocation {} for {}/{} (allocated {})",
                record.ip, record.pod_namespace, record.pod_name, record.allocated_at
            );
            if self
                .release_ip(&record.pod_namespace, &record.pod_name)
                .await
                .is_ok()
            {
                swept += 1;
            }
        }
        swept
    }

    pub fn get_statistics(&self) -> IpamStatistics {
        let allocated = self.pool.allocated_count();
        let usable = self.pool.usable_count();
        IpamStatistics {
            total: usable + self.pool.reserved_count(),
            allocated,
            available: self.pool.available_count(),
            utilization: if usable == 0 {
                0.0
            } else {
                allocated as f64 / usable as f64
            },
            node_name: self.node_name.clone(),
            cidr: self.pool.cidr().to_string(),
        }
    }

    /// Linear scan; acceptable at node scale.
    pub fn get_ip_by_container_id(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.get_allocation_by_container_id(container_id)
            .map(|a| a.ip)
    }

    pub fn get_allocation_by_container_id(&self, container_id: &str) -> Option<Allocation> {
        let allocations = self.allocations.read().unwrap();
        allocations
            .values()
            .find(|a| a.container_id == container_id)
            .cloned()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.read().unwrap().len()
    }

    /// Container IDs of every live allocation; the stale-veth sweep keys
    /// its expected-interface set off these.
    pub fn allocation_container_ids(&self) -> Vec<String> {
        let allocations = self.allocations.read().unwrap();
        allocations.values().map(|a| a.container_id.clone()).collect()
    }

    /// Wait for all outstanding write-behind tasks. The plugin binary calls
    /// this before exiting so the one-shot process does not drop its record.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut writers = self.writers.lock().unwrap();
            writers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn record_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}_{}_{}.json", self.node_name, namespace, name))
    }

    fn spawn_write(&self, record: Allocation) {
        let path = self.record_path(&record.pod_namespace, &record.pod_name);
        let handle = tokio::spawn(async move {
            let body = match serde_json::to_vec_pretty(&record) {
                Ok(body) => body,
                Err(e) => {
                    warn!("failed to encode allocation record: {}", e);
                    return;
                }
            };
            if let Err(e) = tokio::fs::write(&path, body).await {
                warn!("failed to persist allocation to {}: {}", path.display(), e);
            }
        });
        self.track_writer(handle);
    }

    fn spawn_remove(&self, namespace: &str, name: &str) {
        let path = self.record_path(namespace, name);
        let handle = tokio::spawn(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove record {}: {}", path.display(), e),
            }
        });
        self.track_writer(handle);
    }

    fn track_writer(&self, handle: JoinHandle<()>) {
        let mut writers = self.writers.lock().unwrap();
        writers.retain(|h| !h.is_finished());
        writers.push(handle);
    }

    /// Scan the state directory and rebuild the map and the pool's
    /// allocated-set. Later `allocated_at` wins an IP collision.
    fn rehydrate(&self) -> Result<(), IpamError> {
        let mut loaded: HashMap<String, Allocation> = HashMap::new();
        let mut by_ip: HashMap<Ipv4Addr, String> = HashMap::new();
        let mut dropped = 0usize;

        let entries = fs::read_dir(&self.state_dir).map_err(IpamError::Load)?;
        for entry in entries {
            let entry = entry.map_err(IpamError::Load)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let record: Allocation = match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|body| serde_json::from_str(&body).map_err(anyhow::Error::from))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping unreadable record {}: {}", path.display(), e);
                    dropped += 1;
                    continue;
                }
            };

            if record.node_name != self.node_name {
                continue;
            }
            if !self.pool.cidr().contains(&record.ip) {
                warn!(
                    "dropping record {} for {}: outside pod CIDR {}",
                    record.ip,
                    record.key(),
                    self.pool.cidr()
                );
                dropped += 1;
                continue;
            }

            if let Some(prior_key) = by_ip.get(&record.ip).cloned() {
                let prior = &loaded[&prior_key];
                if prior.allocated_at >= record.allocated_at {
                    warn!(
                        "record {} for {} collides with newer {}, dropping",
                        record.ip,
                        record.key(),
                        prior_key
                    );
                    dropped += 1;
                    continue;
                }
                warn!(
                    "record {} for {} superseded by {}, dropping the older",
                    record.ip,
                    prior_key,
                    record.key()
                );
                loaded.remove(&prior_key);
                dropped += 1;
            }

            by_ip.insert(record.ip, record.key());
            loaded.insert(record.key(), record);
        }

        for record in loaded.values() {
            if let Err(e) = self.pool.mark_allocated(record.ip) {
                warn!("could not mark {} allocated: {}", record.ip, e);
            }
        }
        self.pool.reset_cursor();

        info!(
            "rehydrated {} allocation(s) from {} ({} dropped)",
            loaded.len(),
            self.state_dir.display(),
            dropped
        );

        let mut allocations = self.allocations.write().unwrap();
        *allocations = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> IpamManager {
        IpamManager::new(
            "10.244.1.0/24".parse().unwrap(),
            "node-a",
            dir.path(),
            AllocationStrategy::Sequential,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);

        let a = m.allocate_ip("default", "nginx", "abc123").await.unwrap();
        let b = m.allocate_ip("default", "nginx", "abc456").await.unwrap();

        assert_eq!(a.ip, b.ip);
        assert_eq!(a.ip, Ipv4Addr::new(10, 244, 1, 4));
        assert_eq!(m.allocation_count(), 1);
        // Container ID follows the latest ADD.
        assert_eq!(b.container_id, "abc456");
    }

    #[tokio::test]
    async fn test_release_unknown_is_ok() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.release_ip("default", "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_release_frees_the_address() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);

        let a = m.allocate_ip("default", "nginx", "abc").await.unwrap();
        m.release_ip("default", "nginx").await.unwrap();
        assert!(m.pool().is_available(a.ip));
        assert_eq!(m.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let first_ip;
        {
            let m = manager(&dir);
            first_ip = m.allocate_ip("default", "nginx", "abc").await.unwrap().ip;
            m.flush().await;
        }

        // Simulated restart: a fresh manager over the same directory.
        let m = manager(&dir);
        assert_eq!(m.allocation_count(), 1);
        assert!(!m.pool().is_available(first_ip));
        let again = m.allocate_ip("default", "nginx", "abc").await.unwrap();
        assert_eq!(again.ip, first_ip);
    }

    #[tokio::test]
    async fn test_record_file_naming() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.allocate_ip("default", "nginx", "abc").await.unwrap();
        m.flush().await;
        assert!(dir.path().join("node-a_default_nginx.json").exists());

        m.release_ip("default", "nginx").await.unwrap();
        m.flush().await;
        assert!(!dir.path().join("node-a_default_nginx.json").exists());
    }

    #[tokio::test]
    async fn test_missing_record_means_unallocated_after_restart() {
        // A crash between the in-memory commit and the log write loses the
        // record; rehydration must treat the pod as unallocated.
        let dir = TempDir::new().unwrap();
        {
            let m = manager(&dir);
            m.allocate_ip("default", "nginx", "abc").await.unwrap();
            // Simulate dying before the write-behind task ran by deleting
            // the record it produced.
            m.flush().await;
            std::fs::remove_file(dir.path().join("node-a_default_nginx.json")).unwrap();
        }

        let m = manager(&dir);
        assert_eq!(m.allocation_count(), 0);
        let fresh = m.allocate_ip("default", "nginx", "abc").await.unwrap();
        assert_eq!(fresh.ip, Ipv4Addr::new(10, 244, 1, 4));
    }

    #[tokio::test]
    async fn test_ip_collision_later_record_wins() {
        let dir = TempDir::new().unwrap();
        let older = Allocation {
            ip: Ipv4Addr::new(10, 244, 1, 7),
            pod_namespace: "default".into(),
            pod_name: "old".into(),
            container_id: "c1".into(),
            node_name: "node-a".into(),
            allocated_at: Utc::now() - chrono::Duration::hours(2),
            metadata: HashMap::new(),
        };
        let newer = Allocation {
            allocated_at: Utc::now(),
            pod_name: "new".into(),
            container_id: "c2".into(),
            ..older.clone()
        };
        std::fs::write(
            dir.path().join("node-a_default_old.json"),
            serde_json::to_vec(&older).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("node-a_default_new.json"),
            serde_json::to_vec(&newer).unwrap(),
        )
        .unwrap();

        let m = manager(&dir);
        assert_eq!(m.allocation_count(), 1);
        assert_eq!(
            m.get_ip_by_container_id("c2"),
            Some(Ipv4Addr::new(10, 244, 1, 7))
        );
        assert_eq!(m.get_ip_by_container_id("c1"), None);
    }

    #[tokio::test]
    async fn test_health_check_passes_on_clean_state() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.allocate_ip("default", "nginx", "abc").await.unwrap();
        m.health_check().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_collect_sweeps_dead_pods_only() {
        let dir = TempDir::new().unwrap();
        let stale = Allocation {
            ip: Ipv4Addr::new(10, 244, 1, 9),
            pod_namespace: "default".into(),
            pod_name: "dead".into(),
            container_id: "c9".into(),
            node_name: "node-a".into(),
            allocated_at: Utc::now() - chrono::Duration::hours(3),
            metadata: HashMap::new(),
        };
        std::fs::write(
            dir.path().join("node-a_default_dead.json"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        let m = manager(&dir);
        m.allocate_ip("default", "alive", "c1").await.unwrap();

        let swept = m
            .garbage_collect(DEFAULT_GC_MAX_AGE, |_ns, name| async move { name == "alive" })
            .await;

        assert_eq!(swept, 1);
        assert_eq!(m.allocation_count(), 1);
        assert!(m.pool().is_available(Ipv4Addr::new(10, 244, 1, 9)));
    }

    #[tokio::test]
    async fn test_garbage_collect_keeps_fresh_records() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.allocate_ip("default", "fresh", "c1").await.unwrap();

        // Predicate claims everything is dead, but the record is too young.
        let swept = m
            .garbage_collect(DEFAULT_GC_MAX_AGE, |_, _| async { false })
            .await;
        assert_eq!(swept, 0);
        assert_eq!(m.allocation_count(), 1);
    }

    #[tokio::test]
    async fn test_force_resync_rebuilds_from_disk() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.allocate_ip("default", "kept", "c1").await.unwrap();
        m.flush().await;
        // This one never reaches disk.
        m.allocate_ip("default", "lost", "c2").await.unwrap();
        std::fs::remove_file(dir.path().join("node-a_default_lost.json")).ok();

        m.force_resync().await.unwrap();
        assert_eq!(m.allocation_count(), 1);
        assert!(m.get_ip_by_container_id("c1").is_some());
        assert!(m.get_ip_by_container_id("c2").is_none());
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.allocate_ip("default", "a", "c1").await.unwrap();
        m.allocate_ip("default", "b", "c2").await.unwrap();

        let stats = m.get_statistics();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.node_name, "node-a");
        assert_eq!(stats.cidr, "10.244.1.0/24");
        assert!(stats.utilization > 0.0 && stats.utilization < 0.02);
        assert_eq!(stats.available, 249);
    }

    #[tokio::test]
    async fn test_foreign_node_records_are_ignored() {
        let dir = TempDir::new().unwrap();
        let foreign = Allocation {
            ip: Ipv4Addr::new(10, 244, 1, 30),
            pod_namespace: "default".into(),
            pod_name: "other".into(),
            container_id: "cx".into(),
            node_name: "node-b".into(),
            allocated_at: Utc::now(),
            metadata: HashMap::new(),
        };
        std::fs::write(
            dir.path().join("node-b_default_other.json"),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .unwrap();

        let m = manager(&dir);
        assert_eq!(m.allocation_count(), 0);
    }
}
