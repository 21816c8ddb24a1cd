//! Daemon-to-plugin notification socket
//!
//! After a successful ADD the plugin tells the co-located daemon that pod
//! networking is ready, over a second Unix socket with the same
//! newline-delimited JSON framing as the mesh control socket. Delivery is
//! best-effort; a missing daemon never fails an ADD.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

pub const REQUEST_POD_READY: &str = "pod_ready";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub pod_ip: String,
    /// The node's pod CIDR, for route advertisement bookkeeping.
    #[serde(default)]
    pub local_pool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tell the daemon a pod's networking is in place. Errors are returned so
/// the caller can log them, but callers must not fail the ADD on them.
pub async fn notify_pod_ready(socket_path: &Path, request: &NotifyRequest) -> Result<()> {
    let response = tokio::time::timeout(NOTIFY_TIMEOUT, round_trip(socket_path, request))
        .await
        .context("pod-ready notification timed out")??;
    if !response.success {
        bail!(
            "daemon rejected pod-ready notification: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn round_trip(socket_path: &Path, request: &NotifyRequest) -> Result<NotifyResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut frame = serde_json::to_vec(request)?;
    frame.push(b'\n');
    write_half.write_all(&frame).await?;

    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;
    serde_json::from_str(&line).context("malformed notification response")
}

/// Serve the notification socket. Runs until the task is aborted; every
/// request is passed to `handler` and its response written back.
pub async fn serve<F>(socket_path: &Path, handler: F) -> Result<()>
where
    F: Fn(NotifyRequest) -> NotifyResponse + Send + Sync + 'static,
{
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    debug!("notification socket listening on {}", socket_path.display());

    let handler = std::sync::Arc::new(handler);
    loop {
        let (stream, _) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler.as_ref()).await {
                warn!("notification request failed: {}", e);
            }
        });
    }
}

async fn handle_connection<F>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(NotifyRequest) -> NotifyResponse,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;
    if line.is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<NotifyRequest>(&line) {
        Ok(request) => handler(request),
        Err(e) => NotifyResponse {
            success: false,
            error: Some(format!("malformed request: {}", e)),
        },
    };

    let mut frame = serde_json::to_vec(&response)?;
    frame.push(b'\n');
    write_half.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request() -> NotifyRequest {
        NotifyRequest {
            request_type: REQUEST_POD_READY.into(),
            namespace: "default".into(),
            pod_name: "nginx".into(),
            container_id: "abc123def456".into(),
            pod_ip: "10.244.1.4".into(),
            local_pool: "10.244.1.0/24".into(),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let server_path = path.clone();
        let server = tokio::spawn(async move {
            serve(&server_path, move |req| {
                assert_eq!(req.request_type, REQUEST_POD_READY);
                assert_eq!(req.pod_ip, "10.244.1.4");
                counter.fetch_add(1, Ordering::SeqCst);
                NotifyResponse {
                    success: true,
                    error: None,
                }
            })
            .await
        });

        // Give the listener a beat to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        notify_pod_ready(&path, &request()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        server.abort();
    }

    #[tokio::test]
    async fn test_rejection_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");

        let server_path = path.clone();
        let server = tokio::spawn(async move {
            serve(&server_path, |_| NotifyResponse {
                success: false,
                error: Some("pool mismatch".into()),
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = notify_pod_ready(&path, &request()).await.unwrap_err();
        assert!(err.to_string().contains("pool mismatch"));
        server.abort();
    }

    #[tokio::test]
    async fn test_missing_daemon_is_an_error_for_the_caller_to_ignore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(notify_pod_ready(&path, &request()).await.is_err());
    }
}
