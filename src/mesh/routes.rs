//! Route registry
//!
//! Tracks which CIDRs this node intends to advertise into the mesh and
//! reconciles that intent with the daemon's view. The registry is the
//! source of truth for intent; the daemon is the source of truth for
//! actuality; `sync_routes` squares the two.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::client::MeshClient;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRecord {
    pub prefix: String,
    /// Whether the daemon currently advertises this prefix.
    pub advertised: bool,
    pub accepted: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Serializable snapshot of the registry, for backup/restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteBackup {
    pub routes: Vec<RouteRecord>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RouteStatistics {
    pub total: usize,
    pub advertised: usize,
    pub pending: usize,
    pub disabled: usize,
    pub ipv4: usize,
    pub ipv6: usize,
}

pub struct RouteRegistry {
    client: MeshClient,
    routes: RwLock<HashMap<String, RouteRecord>>,
}

impl RouteRegistry {
    pub fn new(client: MeshClient) -> Self {
        Self {
            client,
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn advertise_route(&self, prefix: &str) -> Result<()> {
        self.advertise_routes(&[prefix.to_string()]).await
    }

    /// Record intent for every prefix, then push the full merged list;
    /// the daemon applies advertisements all-or-nothing.
    pub async fn advertise_routes(&self, prefixes: &[String]) -> Result<()> {
        for prefix in prefixes {
            prefix
                .parse::<IpNet>()
                .with_context(|| format!("invalid route prefix {:?}", prefix))?;
        }

        let full_list = {
            let mut routes = self.routes.write().await;
            let now = Utc::now();
            for prefix in prefixes {
                routes
                    .entry(prefix.clone())
                    .and_modify(|r| {
                        r.enabled = true;
                        r.updated_at = now;
                    })
                    .or_insert_with(|| RouteRecord {
                        prefix: prefix.clone(),
                        advertised: false,
                        accepted: false,
                        enabled: true,
                        created_at: now,
                        updated_at: now,
                    });
            }
            enabled_set(&routes)
        };

        self.push(&full_list).await?;

        let mut routes = self.routes.write().await;
        for prefix in prefixes {
            if let Some(record) = routes.get_mut(prefix) {
                record.advertised = true;
                record.updated_at = Utc::now();
            }
        }
        info!("advertising {} route(s) into the mesh", full_list.len());
        Ok(())
    }

    pub async fn remove_route(&self, prefix: &str) -> Result<()> {
        self.remove_routes(&[prefix.to_string()]).await
    }

    /// Drop intent for every prefix and push the remainder.
    pub async fn remove_routes(&self, prefixes: &[String]) -> Result<()> {
        let remainder = {
            let mut routes = self.routes.write().await;
            for prefix in prefixes {
                if routes.remove(prefix).is_none() {
                    debug!("remove for unknown route {}, nothing to do", prefix);
                }
            }
            enabled_set(&routes)
        };
        self.push(&remainder).await
    }

    /// Reconcile intent with the daemon: intents the daemon dropped are
    /// marked not-advertised; daemon-only prefixes are mirrored into the
    /// intent set as advertised.
    pub async fn sync_routes(&self) -> Result<()> {
        let prefs = self
            .client
            .get_prefs()
            .await
            .context("failed to read daemon prefs for route sync")?;
        let daemon_set = prefs.advertise_set();

        let mut routes = self.routes.write().await;
        let now = Utc::now();
        for record in routes.values_mut() {
            let live = daemon_set.contains(&record.prefix);
            if record.advertised != live {
                debug!(
                    "route {} advertised {} -> {}",
                    record.prefix, record.advertised, live
                );
                record.advertised = live;
                record.updated_at = now;
            }
        }
        for prefix in daemon_set {
            routes.entry(prefix.clone()).or_insert_with(|| RouteRecord {
                prefix,
                advertised: true,
                accepted: false,
                enabled: true,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(())
    }

    /// Advertise the node's pod CIDR. The explicit CIDR from config is
    /// authoritative; deriving from a sample pod IP is a deprecated
    /// fallback kept for clusters that predate the config field.
    pub async fn ensure_pool_route(&self, pod_cidr: IpNet) -> Result<()> {
        let prefix = pod_cidr.to_string();
        if self.is_advertised(&prefix).await {
            return Ok(());
        }
        self.advertise_route(&prefix).await
    }

    pub async fn ensure_local_pool_route(&self, pod_ip: Ipv4Addr) -> Result<()> {
        let Some(cidr) = derive_pool_cidr(pod_ip) else {
            bail!(
                "cannot derive a pod CIDR from {}; set pod_cidr in the config",
                pod_ip
            );
        };
        warn!(
            "deriving pod CIDR {} from sample IP {}; this heuristic is \
             deprecated, set pod_cidr in the config",
            cidr, pod_ip
        );
        self.ensure_pool_route(IpNet::V4(cidr)).await
    }

    pub async fn clear_all_routes(&self) -> Result<()> {
        {
            let mut routes = self.routes.write().await;
            routes.clear();
        }
        self.push(&BTreeSet::new()).await
    }

    pub async fn backup_routes(&self) -> RouteBackup {
        let routes = self.routes.read().await;
        let mut list: Vec<RouteRecord> = routes.values().cloned().collect();
        list.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        RouteBackup { routes: list }
    }

    /// Replace registry state with a snapshot and push the result.
    pub async fn restore_routes(&self, backup: RouteBackup) -> Result<()> {
        let full_list = {
            let mut routes = self.routes.write().await;
            routes.clear();
            for record in backup.routes {
                routes.insert(record.prefix.clone(), record);
            }
            enabled_set(&routes)
        };
        self.push(&full_list).await
    }

    pub async fn get_route_statistics(&self) -> RouteStatistics {
        let routes = self.routes.read().await;
        let mut stats = RouteStatistics {
            total: routes.len(),
            ..Default::default()
        };
        for record in routes.values() {
            if !record.enabled {
                stats.disabled += 1;
            } else if record.advertised {
                stats.advertised += 1;
            } else {
                stats.pending += 1;
            }
            match record.prefix.parse::<IpNet>() {
                Ok(IpNet::V4(_)) => stats.ipv4 += 1,
                Ok(IpNet::V6(_)) => stats.ipv6 += 1,
                Err(_) => {}
            }
        }
        stats
    }

    pub async fn is_advertised(&self, prefix: &str) -> bool {
        let routes = self.routes.read().await;
        routes.get(prefix).map(|r| r.advertised).unwrap_or(false)
    }

    async fn push(&self, full_list: &BTreeSet<String>) -> Result<()> {
        let list: Vec<String> = full_list.iter().cloned().collect();
        self.client
            .edit_prefs(
                &super::api::MaskedPrefs::default().advertise_routes(list),
            )
            .await
            .context("failed to push advertised routes to daemon")?;
        Ok(())
    }
}

fn enabled_set(routes: &HashMap<String, RouteRecord>) -> BTreeSet<String> {
    routes
        .values()
        .filter(|r| r.enabled)
        .map(|r| r.prefix.clone())
        .collect()
}

/// Derive a node pod CIDR from one pod IP by private-network pattern.
/// Returns None for addresses outside the documented patterns.
pub fn derive_pool_cidr(ip: Ipv4Addr) -> Option<ipnet::Ipv4Net> {
    let [a, b, c, _] = ip.octets();
    let cidr = match (a, b) {
        (10, 244) => format!("10.244.{}.0/24", c),
        (192, 168) => format!("192.168.{}.0/24", c),
        (172, 16..=31) => format!("172.{}.0.0/16", b),
        (10, _) => format!("10.{}.{}.0/24", b, c),
        _ => return None,
    };
    cidr.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::api::Prefs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Stateful fake daemon: keeps a preference bag and answers the prefs
    /// and edit_prefs ops against it.
    fn spawn_prefs_daemon(path: PathBuf) -> Arc<Mutex<Prefs>> {
        let prefs = Arc::new(Mutex::new(Prefs::default()));
        let shared = prefs.clone();
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (read_half, mut write_half) = stream.into_split();
                let mut line = String::new();
                let mut reader = BufReader::new(read_half);
                if reader.read_line(&mut line).await.is_err() {
                    continue;
                }
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let reply = {
                    let mut prefs = shared.lock().unwrap();
                    match request["op"].as_str().unwrap() {
                        "prefs" => serde_json::json!({"ok": true, "prefs": &*prefs}),
                        "edit_prefs" => {
                            let masked: crate::mesh::api::MaskedPrefs =
                                serde_json::from_value(request["prefs"].clone()).unwrap();
                            masked.apply_to(&mut prefs);
                            serde_json::json!({"ok": true, "prefs": &*prefs})
                        }
                        other => {
                            serde_json::json!({"ok": false, "error": format!("bad op {other}")})
                        }
                    }
                };
                let mut frame = serde_json::to_vec(&reply).unwrap();
                frame.push(b'\n');
                let _ = write_half.write_all(&frame).await;
            }
        });
        prefs
    }

    fn registry(dir: &tempfile::TempDir) -> (RouteRegistry, Arc<Mutex<Prefs>>) {
        let path = dir.path().join("mesh.sock");
        let prefs = spawn_prefs_daemon(path.clone());
        (RouteRegistry::new(MeshClient::new(&path)), prefs)
    }

    #[tokio::test]
    async fn test_advertise_pushes_full_list() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, prefs) = registry(&dir);

        reg.advertise_route("10.244.1.0/24").await.unwrap();
        reg.advertise_route("192.168.5.0/24").await.unwrap();

        let daemon = prefs.lock().unwrap().advertise_set();
        assert!(daemon.contains("10.244.1.0/24"));
        assert!(daemon.contains("192.168.5.0/24"));
        assert!(reg.is_advertised("10.244.1.0/24").await);
    }

    #[tokio::test]
    async fn test_invalid_prefix_is_rejected_before_any_push() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, prefs) = registry(&dir);
        assert!(reg.advertise_route("not-a-cidr").await.is_err());
        assert!(prefs.lock().unwrap().advertise_routes.is_empty());
    }

    #[tokio::test]
    async fn test_remove_pushes_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, prefs) = registry(&dir);
        reg.advertise_routes(&["10.244.1.0/24".into(), "192.168.5.0/24".into()])
            .await
            .unwrap();
        reg.remove_route("10.244.1.0/24").await.unwrap();

        let daemon = prefs.lock().unwrap().advertise_set();
        assert!(!daemon.contains("10.244.1.0/24"));
        assert!(daemon.contains("192.168.5.0/24"));
    }

    #[tokio::test]
    async fn test_sync_adopts_daemon_only_routes_and_drops_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, prefs) = registry(&dir);
        reg.advertise_route("10.244.1.0/24").await.unwrap();

        // Behind our back, the daemon swaps the advertised set.
        {
            let mut prefs = prefs.lock().unwrap();
            prefs.advertise_routes = vec!["172.20.0.0/16".into()];
        }
        reg.sync_routes().await.unwrap();

        assert!(!reg.is_advertised("10.244.1.0/24").await);
        assert!(reg.is_advertised("172.20.0.0/16").await);
    }

    #[tokio::test]
    async fn test_backup_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _prefs) = registry(&dir);
        reg.advertise_routes(&["10.244.1.0/24".into(), "192.168.5.0/24".into()])
            .await
            .unwrap();

        let backup = reg.backup_routes().await;
        reg.clear_all_routes().await.unwrap();
        assert_eq!(reg.backup_routes().await.routes.len(), 0);

        reg.restore_routes(backup.clone()).await.unwrap();
        assert_eq!(reg.backup_routes().await, backup);
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _prefs) = registry(&dir);
        reg.advertise_routes(&["10.244.1.0/24".into(), "fd7a:115c::/48".into()])
            .await
            .unwrap();

        let stats = reg.get_route_statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.advertised, 2);
        assert_eq!(stats.ipv4, 1);
        assert_eq!(stats.ipv6, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_ensure_pool_route_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, prefs) = registry(&dir);
        let cidr: IpNet = "10.244.1.0/24".parse().unwrap();
        reg.ensure_pool_route(cidr).await.unwrap();
        reg.ensure_pool_route(cidr).await.unwrap();
        assert_eq!(prefs.lock().unwrap().advertise_routes.len(), 1);
    }

    #[test]
    fn test_derive_pool_cidr_patterns() {
        let cases = [
            ("10.244.7.33", Some("10.244.7.0/24")),
            ("192.168.44.9", Some("192.168.44.0/24")),
            ("172.18.3.7", Some("172.18.0.0/16")),
            ("10.52.9.200", Some("10.52.9.0/24")),
            ("8.8.8.8", None),
            ("172.32.0.1", None),
        ];
        for (ip, want) in cases {
            let got = derive_pool_cidr(ip.parse().unwrap()).map(|c| c.to_string());
            assert_eq!(got.as_deref(), want, "for {}", ip);
        }
    }
}
