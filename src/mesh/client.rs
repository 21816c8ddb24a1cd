//! Mesh daemon control client
//!
//! Talks to the mesh daemon over its Unix control socket. The protocol is
//! newline-delimited JSON request/response frames; the daemon serializes
//! concurrent requests, so the client opens a fresh connection per call
//! and holds no state beyond the socket path.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::api::{MaskedPrefs, Prefs, Status};

/// Well-known socket of an OS-managed system daemon.
pub const SYSTEM_SOCKET_PATH: &str = "/var/run/tailscale/tailscaled.sock";

/// Default bound on one socket round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Short bound used by liveness probes.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct Request<'a> {
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefs: Option<&'a MaskedPrefs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<Status>,
    #[serde(default)]
    prefs: Option<Prefs>,
}

/// Client pinned to one daemon control socket.
#[derive(Debug, Clone)]
pub struct MeshClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl MeshClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Client for the OS-managed system daemon's well-known socket.
    pub fn system() -> Self {
        Self::new(Path::new(SYSTEM_SOCKET_PATH))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, request: Request<'_>) -> Result<Response> {
        let op = request.op;
        let response = tokio::time::timeout(self.timeout, self.round_trip(&request))
            .await
            .with_context(|| format!("mesh daemon request {:?} timed out", op))??;

        if !response.ok {
            bail!(
                "mesh daemon rejected {:?}: {}",
                op,
                response.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(response)
    }

    async fn round_trip(&self, request: &Request<'_>) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!("failed to connect to {}", self.socket_path.display())
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut frame = serde_json::to_vec(request).context("failed to encode request")?;
        frame.push(b'\n');
        write_half
            .write_all(&frame)
            .await
            .context("failed to send request")?;

        let mut line = String::new();
        let mut reader = BufReader::new(read_half);
        reader
            .read_line(&mut line)
            .await
            .context("failed to read response")?;
        if line.is_empty() {
            bail!("mesh daemon closed the connection without replying");
        }
        serde_json::from_str(&line).context("failed to decode response")
    }

    pub async fn get_status(&self) -> Result<Status> {
        let response = self
            .request(Request {
                op: "status",
                prefs: None,
                auth_key: None,
            })
            .await?;
        response
            .status
            .context("status response carried no status document")
    }

    pub async fn get_prefs(&self) -> Result<Prefs> {
        let response = self
            .request(Request {
                op: "prefs",
                prefs: None,
                auth_key: None,
            })
            .await?;
        response
            .prefs
            .context("prefs response carried no preference document")
    }

    /// Apply a masked preference update; returns the resulting bag.
    pub async fn edit_prefs(&self, masked: &MaskedPrefs) -> Result<Prefs> {
        let response = self
            .request(Request {
                op: "edit_prefs",
                prefs: Some(masked),
                auth_key: None,
            })
            .await?;
        response
            .prefs
            .context("edit_prefs response carried no preference document")
    }

    /// Inject an auth key and trigger the daemon's login flow.
    pub async fn start(&self, auth_key: &str) -> Result<()> {
        debug!("issuing start with key {}", redact_key(auth_key));
        self.request(Request {
            op: "start",
            prefs: None,
            auth_key: Some(auth_key),
        })
        .await?;
        Ok(())
    }

    /// Primary mesh IPv4 of this node.
    pub async fn get_ip(&self) -> Result<Option<IpAddr>> {
        let status = self.get_status().await?;
        Ok(status
            .self_status
            .ips
            .iter()
            .find(|ip| ip.is_ipv4())
            .copied())
    }

    pub async fn get_all_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(self.get_status().await?.self_status.ips)
    }

    /// Whether the daemon answers on its socket at all.
    pub async fn is_running(&self) -> bool {
        let probe = self.clone().with_timeout(LIVENESS_TIMEOUT);
        probe.get_status().await.is_ok()
    }

    /// Whether the daemon reports full connectivity.
    pub async fn is_connected(&self) -> bool {
        let probe = self.clone().with_timeout(LIVENESS_TIMEOUT);
        matches!(probe.get_status().await, Ok(status) if status.fully_connected())
    }

    /// Merge `routes` into the advertised set and push the full list; the
    /// daemon applies advertisements all-or-nothing.
    pub async fn advertise_routes(&self, routes: &[String]) -> Result<Prefs> {
        let prefs = self.get_prefs().await?;
        let mut merged = prefs.advertise_set();
        merged.extend(routes.iter().cloned());
        self.edit_prefs(
            &MaskedPrefs::default().advertise_routes(merged.into_iter().collect()),
        )
        .await
    }

    /// Drop `routes` from the advertised set and push the remainder.
    pub async fn remove_routes(&self, routes: &[String]) -> Result<Prefs> {
        let prefs = self.get_prefs().await?;
        let mut remaining = prefs.advertise_set();
        for route in routes {
            remaining.remove(route);
        }
        self.edit_prefs(
            &MaskedPrefs::default().advertise_routes(remaining.into_iter().collect()),
        )
        .await
    }

    pub async fn accept_routes(&self) -> Result<Prefs> {
        self.edit_prefs(&MaskedPrefs::default().accept_routes(true))
            .await
    }

    pub async fn reject_routes(&self) -> Result<Prefs> {
        self.edit_prefs(&MaskedPrefs::default().accept_routes(false))
            .await
    }

    pub async fn set_hostname(&self, hostname: &str) -> Result<Prefs> {
        self.edit_prefs(&MaskedPrefs::default().hostname(hostname))
            .await
    }
}

/// Auth keys never reach the log in full.
pub fn redact_key(key: &str) -> String {
    if key.len() <= 8 {
        return "…".to_string();
    }
    format!("{}…", &key[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::api::BackendState;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    /// Minimal scripted daemon: answers every request on `path` with the
    /// frames produced by `reply_for`.
    async fn fake_daemon<F>(path: PathBuf, reply_for: F)
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + 'static,
    {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = Vec::new();
                let mut byte = [0u8; 1];
                while let Ok(1) = stream.read(&mut byte).await {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
                let request: serde_json::Value = serde_json::from_slice(&buf).unwrap();
                let mut reply = serde_json::to_vec(&reply_for(request)).unwrap();
                reply.push(b'\n');
                let _ = stream.write_all(&reply).await;
            }
        });
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        fake_daemon(path.clone(), |req| {
            assert_eq!(req["op"], "status");
            serde_json::json!({
                "ok": true,
                "status": {
                    "backend_state": "Running",
                    "have_node_key": true,
                    "self_status": {
                        "hostname": "node-a",
                        "ips": ["100.64.0.7"],
                        "online": true
                    }
                }
            })
        })
        .await;

        let client = MeshClient::new(&path);
        let status = client.get_status().await.unwrap();
        assert_eq!(status.backend_state, BackendState::Running);
        assert!(status.fully_connected());
        assert_eq!(
            client.get_ip().await.unwrap(),
            Some("100.64.0.7".parse().unwrap())
        );
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_daemon_error_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        fake_daemon(path.clone(), |_| {
            serde_json::json!({"ok": false, "error": "backend wedged"})
        })
        .await;

        let client = MeshClient::new(&path);
        let err = client.get_status().await.unwrap_err();
        assert!(err.to_string().contains("backend wedged"));
    }

    #[tokio::test]
    async fn test_edit_prefs_sends_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        fake_daemon(path.clone(), |req| {
            assert_eq!(req["op"], "edit_prefs");
            assert_eq!(req["prefs"]["want_running_set"], true);
            assert_eq!(req["prefs"]["want_running"], true);
            assert_eq!(req["prefs"]["control_url_set"], false);
            serde_json::json!({"ok": true, "prefs": {"want_running": true}})
        })
        .await;

        let client = MeshClient::new(&path);
        let prefs = client
            .edit_prefs(&MaskedPrefs::default().want_running(true))
            .await
            .unwrap();
        assert!(prefs.want_running);
    }

    #[tokio::test]
    async fn test_advertise_routes_merges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        fake_daemon(path.clone(), |req| match req["op"].as_str().unwrap() {
            "prefs" => serde_json::json!({
                "ok": true,
                "prefs": {"advertise_routes": ["10.244.1.0/24"]}
            }),
            "edit_prefs" => {
                let routes = req["prefs"]["advertise_routes"].as_array().unwrap();
                assert_eq!(routes.len(), 2);
                serde_json::json!({"ok": true, "prefs": {
                    "advertise_routes": routes,
                }})
            }
            other => panic!("unexpected op {}", other),
        })
        .await;

        let client = MeshClient::new(&path);
        let prefs = client
            .advertise_routes(&["192.168.0.0/24".to_string()])
            .await
            .unwrap();
        assert_eq!(prefs.advertise_routes.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let client = MeshClient::new(&dir.path().join("absent.sock"));
        assert!(!client.is_running().await);
        assert!(!client.is_connected().await);
    }

    #[test]
    fn test_redact_key() {
        assert_eq!(redact_key("hskey-aabbccddeeff"), "hskey-aa…");
        assert_eq!(redact_key("short"), "…");
        assert!(!redact_key("hskey-supersecretvalue").contains("secret"));
    }
}
