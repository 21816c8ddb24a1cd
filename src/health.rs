//! Health and recovery loop
//!
//! Periodically probes the mesh daemon, pod IPAM, and host routes. After
//! a run of consecutive failures it enters recovery: restart the daemon,
//! sweep stale veth interfaces, and force-resync IPAM. Recovery is
//! single-flight behind a CAS flag and always best-effort.

use anyhow::Result;
use serde::Serialize;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ipam::IpamManager;
use crate::mesh::{ConnectStateMachine, MeshClient, UpOptions};
use crate::netlink::{host_ifname_for_container, interface_exists};

/// Default sweep cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on each individual check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Settle time inside a daemon restart.
const RESTART_SETTLE: Duration = Duration::from_secs(2);

/// How long recovery waits for the mesh check to pass after a restart.
const RESTART_BUDGET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<CheckOutcome>,
    pub consecutive_failures: u32,
    pub recovering: bool,
    /// Unix seconds of the last completed sweep; 0 before the first.
    pub last_sweep: i64,
}

#[derive(Default)]
pub struct HealthCounters {
    pub sweeps: AtomicU64,
    pub failed_sweeps: AtomicU64,
    pub recoveries: AtomicU64,
    consecutive_failures: AtomicU32,
    recovering: AtomicBool,
    last_sweep: AtomicI64,
}

pub struct HealthMonitor {
    client: MeshClient,
    ipam: Arc<IpamManager>,
    up_options: UpOptions,
    /// Mesh-facing interface to assert on; None skips the network check.
    mesh_ifname: Option<String>,
    interval: Duration,
    failure_threshold: u32,
    counters: HealthCounters,
}

impl HealthMonitor {
    pub fn new(
        client: MeshClient,
        ipam: Arc<IpamManager>,
        up_options: UpOptions,
        mesh_ifname: Option<String>,
        interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            client,
            ipam,
            up_options,
            mesh_ifname,
            interval,
            failure_threshold,
            counters: HealthCounters::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the sweep loop until the surrounding task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Run the three checks without touching counters; the HTTP health
    /// surface uses this so probes do not skew the sweep statistics.
    pub async fn probe(&self) -> HealthReport {
        let checks = self.run_checks().await;
        let healthy = checks.iter().all(|c| c.ok);
        self.report(checks, healthy)
    }

    async fn run_checks(&self) -> Vec<CheckOutcome> {
        let (mesh, ipam, network) = tokio::join!(
            bounded_check("mesh", self.check_mesh()),
            bounded_check("ipam", self.check_ipam()),
            bounded_check("network", self.check_network()),
        );
        vec![mesh, ipam, network]
    }

    /// One sweep: run the three checks concurrently, update counters, and
    /// trigger recovery at the threshold.
    pub async fn sweep_once(&self) -> HealthReport {
        let checks = self.run_checks().await;
        let healthy = checks.iter().all(|c| c.ok);

        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_sweep
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);

        let consecutive = if healthy {
            self.counters.consecutive_failures.store(0, Ordering::SeqCst);
            0
        } else {
            self.counters.failed_sweeps.fetch_add(1, Ordering::Relaxed);
            let n = self
                .counters
                .consecutive_failures
                .fetch_add(1, Ordering::SeqCst)
                + 1;
            for check in checks.iter().filter(|c| !c.ok) {
                warn!("health check {} failed: {}", check.name, check.detail);
            }
            n
        };

        if consecutive >= self.failure_threshold {
            self.try_recover().await;
        }

        self.report(checks, healthy)
    }

    pub fn report_now(&self) -> HealthReport {
        self.report(Vec::new(), self.counters.consecutive_failures.load(Ordering::SeqCst) == 0)
    }

    fn report(&self, checks: Vec<CheckOutcome>, healthy: bool) -> HealthReport {
        HealthReport {
            healthy,
            checks,
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::SeqCst),
            recovering: self.counters.recovering.load(Ordering::SeqCst),
            last_sweep: self.counters.last_sweep.load(Ordering::Relaxed),
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.counters.recovering.load(Ordering::SeqCst)
    }

    /// Whether the sweep itself is wedged (no sweep within 2x interval).
    pub fn is_live(&self) -> bool {
        let last = self.counters.last_sweep.load(Ordering::Relaxed);
        if last == 0 {
            return true; // still starting up
        }
        let age = chrono::Utc::now().timestamp() - last;
        age <= 2 * self.interval.as_secs() as i64
    }

    /// Plain-text counters for the metrics endpoint.
    pub fn metrics_text(&self) -> String {
        let stats = self.ipam.get_statistics();
        format!(
            "headcni_health_sweeps_total {}\n\
             headcni_health_failed_sweeps_total {}\n\
             headcni_recoveries_total {}\n\
             headcni_consecutive_failures {}\n\
             headcni_ipam_allocated {}\n\
             headcni_ipam_available {}\n\
             headcni_ipam_utilization {:.4}\n",
            self.counters.sweeps.load(Ordering::Relaxed),
            self.counters.failed_sweeps.load(Ordering::Relaxed),
            self.counters.recoveries.load(Ordering::Relaxed),
            self.counters.consecutive_failures.load(Ordering::SeqCst),
            stats.allocated,
            stats.available,
            stats.utilization,
        )
    }

    async fn check_mesh(&self) -> Result<String> {
        let status = self.client.get_status().await?;
        if status.backend_state != crate::mesh::BackendState::Running {
            anyhow::bail!("backend state is {}", status.backend_state);
        }
        if status.self_status.ips.is_empty() {
            anyhow::bail!("daemon reports no self IPs");
        }
        Ok(format!("running with {} ip(s)", status.self_status.ips.len()))
    }

    async fn check_ipam(&self) -> Result<String> {
        self.ipam.health_check()?;
        let stats = self.ipam.get_statistics();
        Ok(format!(
            "{} allocated, {} available",
            stats.allocated, stats.available
        ))
    }

    async fn check_network(&self) -> Result<String> {
        let Some(ifname) = self.mesh_ifname.as_deref() else {
            return Ok("no mesh interface configured, skipping".to_string());
        };

        if !interface_exists(ifname) {
            anyhow::bail!("mesh interface {} does not exist", ifname);
        }
        let operstate =
            std::fs::read_to_string(format!("/sys/class/net/{}/operstate", ifname))
                .unwrap_or_default();
        let operstate = operstate.trim();
        if operstate != "up" && operstate != "unknown" {
            anyhow::bail!("mesh interface {} is {}", ifname, operstate);
        }

        // Byte-oriented, case-sensitive scan of the kernel routing table.
        let output = Command::new("ip").args(["route", "show"]).output()?;
        let routes = String::from_utf8_lossy(&output.stdout);
        if !routes.contains(ifname) {
            anyhow::bail!("no route references {}", ifname);
        }

        // Fire-and-forget connectivity probe; the result only ever shows
        // up in debug logs.
        tokio::spawn(async {
            let probe = tokio::time::timeout(
                CHECK_TIMEOUT,
                tokio::net::TcpStream::connect("100.100.100.100:53"),
            )
            .await;
            match probe {
                Ok(Ok(_)) => debug!("mesh DNS endpoint reachable"),
                Ok(Err(e)) => debug!("mesh DNS endpoint unreachable: {}", e),
                Err(_) => debug!("mesh DNS probe timed out"),
            }
        });

        Ok(format!("{} up with routes", ifname))
    }

    /// Single-flight recovery: the CAS loser returns immediately.
    async fn try_recover(&self) {
        if self
            .counters
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("recovery already in flight");
            return;
        }
        info!("entering recovery after repeated health failures");
        self.counters.recoveries.fetch_add(1, Ordering::Relaxed);

        self.recover_mesh().await;
        self.sweep_stale_veths().await;
        if let Err(e) = self.ipam.force_resync().await {
            warn!("recovery: IPAM resync failed: {}", e);
        }

        // Give the repaired state a clean slate regardless of outcomes.
        self.counters.consecutive_failures.store(0, Ordering::SeqCst);
        self.counters.recovering.store(false, Ordering::SeqCst);
    }

    async fn recover_mesh(&self) {
        let machine = ConnectStateMachine::new(self.client.clone());
        if let Err(e) = machine.down().await {
            warn!("recovery: mesh down failed: {}", e);
        }
        tokio::time::sleep(RESTART_SETTLE).await;
        match tokio::time::timeout(RESTART_BUDGET, machine.up_with_options(&self.up_options))
            .await
        {
            Ok(Ok(_)) => info!("recovery: mesh daemon reconnected"),
            Ok(Err(e)) => warn!("recovery: mesh up failed: {}", e),
            Err(_) => warn!("recovery: mesh up timed out"),
        }
    }

    /// Delete veth interfaces that look like ours but belong to no live
    /// allocation. Interfaces that do not match our deterministic naming
    /// are never touched.
    async fn sweep_stale_veths(&self) {
        let expected: std::collections::HashSet<String> = {
            let mut set = std::collections::HashSet::new();
            for cid in self.allocation_container_ids() {
                set.insert(host_ifname_for_container(&cid));
            }
            set
        };

        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("veth") || name.len() != 15 {
                continue;
            }
            if expected.contains(&name) {
                continue;
            }
            warn!("sweeping stale veth {}", name);
            if let Err(e) = crate::netlink::cleanup_veth_pair(&name).await {
                warn!("failed to sweep {}: {}", name, e);
            }
        }
    }

    fn allocation_container_ids(&self) -> Vec<String> {
        // Statistics only expose counts; walk the records via the
        // container-id index instead.
        self.ipam.allocation_container_ids()
    }
}

async fn bounded_check<F>(name: &'static str, f: F) -> CheckOutcome
where
    F: std::future::Future<Output = Result<String>>,
{
    match tokio::time::timeout(CHECK_TIMEOUT, f).await {
        Ok(Ok(detail)) => CheckOutcome {
            name,
            ok: true,
            detail,
        },
        Ok(Err(e)) => CheckOutcome {
            name,
            ok: false,
            detail: e.to_string(),
        },
        Err(_) => CheckOutcome {
            name,
            ok: false,
            detail: format!("check timed out after {:?}", CHECK_TIMEOUT),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::AllocationStrategy;
    use tempfile::TempDir;

    fn ipam(dir: &TempDir) -> Arc<IpamManager> {
        Arc::new(
            IpamManager::new(
                "10.244.1.0/24".parse().unwrap(),
                "node-a",
                dir.path(),
                AllocationStrategy::Sequential,
            )
            .unwrap(),
        )
    }

    fn options() -> UpOptions {
        UpOptions {
            control_url: "https://hs.example.com".into(),
            auth_key: "hskey-0123456789abcdef0123".into(),
            hostname: "node-a".into(),
            accept_routes: true,
            advertise_routes: vec![],
            shields_up: false,
            accept_dns: false,
        }
    }

    fn monitor(dir: &TempDir, socket: &std::path::Path) -> HealthMonitor {
        HealthMonitor::new(
            MeshClient::new(socket),
            ipam(dir),
            options(),
            None,
            DEFAULT_INTERVAL,
            3,
        )
    }

    #[tokio::test]
    async fn test_sweep_fails_without_daemon_and_counts_up() {
        let dir = TempDir::new().unwrap();
        let m = monitor(&dir, &dir.path().join("absent.sock"));

        let report = m.sweep_once().await;
        assert!(!report.healthy);
        assert_eq!(report.consecutive_failures, 1);
        let mesh = report.checks.iter().find(|c| c.name == "mesh").unwrap();
        assert!(!mesh.ok);
        // IPAM and network are fine on their own.
        assert!(report.checks.iter().find(|c| c.name == "ipam").unwrap().ok);
        assert!(report
            .checks
            .iter()
            .find(|c| c.name == "network")
            .unwrap()
            .ok);

        let report = m.sweep_once().await;
        assert_eq!(report.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_network_check_fails_on_missing_interface() {
        let dir = TempDir::new().unwrap();
        let mut m = monitor(&dir, &dir.path().join("absent.sock"));
        m.mesh_ifname = Some("headcni-does-not-exist0".into());

        let report = m.sweep_once().await;
        let network = report.checks.iter().find(|c| c.name == "network").unwrap();
        assert!(!network.ok);
        assert!(network.detail.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_liveness_tracks_sweeps() {
        let dir = TempDir::new().unwrap();
        let m = monitor(&dir, &dir.path().join("absent.sock"));
        assert!(m.is_live(), "live before the first sweep");
        m.sweep_once().await;
        assert!(m.is_live());
        assert!(m.report_now().last_sweep > 0);
    }

    #[tokio::test]
    async fn test_metrics_text_shape() {
        let dir = TempDir::new().unwrap();
        let m = monitor(&dir, &dir.path().join("absent.sock"));
        m.sweep_once().await;
        let text = m.metrics_text();
        assert!(text.contains("headcni_health_sweeps_total 1"));
        assert!(text.contains("headcni_ipam_allocated 0"));
    }
}
