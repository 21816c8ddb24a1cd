//! Mesh daemon supervision
//!
//! Chooses, starts, verifies, and tears down the mesh daemon in one of
//! three modes. The owned-standalone arm carries the process-identity
//! guard: a PID is only ever signaled after `/proc/<pid>/comm` and
//! `/proc/<pid>/cwd` prove the process is the daemon this supervisor
//! started, so drifting PID files can never clobber an OS-managed daemon.

use anyhow::{anyhow, bail, Context, Result};
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{MeshClient, SYSTEM_SOCKET_PATH};

/// Expected `/proc/<pid>/comm` of the daemon we fork.
pub const DAEMON_COMM: &str = "tailscaled";

/// Socket path used by the owned standalone daemon.
pub const OWNED_SOCKET_PATH: &str = "/var/run/headcni/headcni_tailscale.sock";

/// How long to wait for a forked daemon's socket to appear.
const SOCKET_WAIT_BUDGET: Duration = Duration::from_secs(120);

/// Settle time between stop and start on restart.
const RESTART_SETTLE: Duration = Duration::from_secs(2);

/// cwd prefixes that identify an OS-managed daemon; a PID rooted here is
/// never ours to signal.
const FOREIGN_CWD_PREFIXES: &[&str] = &["/var/lib/tailscale", "/usr", "/opt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// An OS service already runs the daemon; we only verify its socket.
    SharedSystem,
    /// We fork and own a standalone daemon.
    OwnedStandalone,
    /// The daemon runs in-process as a library.
    Embedded,
}

impl ServiceMode {
    /// Pick a mode for this host: a reachable system daemon wins, else we
    /// run our own.
    pub fn detect() -> Self {
        if Path::new(SYSTEM_SOCKET_PATH).exists() {
            Self::SharedSystem
        } else {
            Self::OwnedStandalone
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotFound,
    Stopped,
    /// Process (or library) exists but the socket does not answer.
    Disconnected,
    Running,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub mode: ServiceMode,
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    pub tun_name: String,
    pub port: u16,
    /// Embedded mode only.
    pub config_dir: Option<PathBuf>,
    pub auth_key: Option<String>,
    pub hostname: Option<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            mode: ServiceMode::OwnedStandalone,
            state_dir: PathBuf::from("/var/lib/headcni/tailscale"),
            socket_path: PathBuf::from(OWNED_SOCKET_PATH),
            tun_name: "headcni0".to_string(),
            port: 41641,
            config_dir: None,
            auth_key: None,
            hostname: None,
        }
    }
}

/// In-process daemon seam for embedded mode. The production library is
/// linked in by the embedding build; tests register fakes.
pub trait EmbeddedBackend: Send + Sync {
    fn is_running(&self) -> bool;
    fn shutdown(&self) -> Result<()>;
}

pub type EmbeddedFactory =
    Box<dyn Fn(&ServiceOptions) -> Result<Box<dyn EmbeddedBackend>> + Send + Sync>;

enum HandleKind {
    SharedSystem,
    OwnedStandalone {
        pid: u32,
        pid_file: PathBuf,
        child: Option<Child>,
    },
    Embedded {
        backend: Box<dyn EmbeddedBackend>,
    },
}

/// Per-node singleton record of one supervised daemon.
struct ServiceHandle {
    options: ServiceOptions,
    started_at: DateTime<Utc>,
    kind: HandleKind,
}

/// Public snapshot of a handle.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub mode: ServiceMode,
    pub socket_path: PathBuf,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

pub struct MeshSupervisor {
    services: Mutex<HashMap<String, ServiceHandle>>,
    embedded_factory: Option<EmbeddedFactory>,
}

impl MeshSupervisor {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            embedded_factory: None,
        }
    }

    /// Register the in-process library constructor for embedded mode.
    pub fn with_embedded_factory(mut self, factory: EmbeddedFactory) -> Self {
        self.embedded_factory = Some(factory);
        self
    }

    /// Start (or adopt) the daemon for `name`. An existing handle that
    /// still verifies as running is returned as-is; anything else is torn
    /// down and started afresh.
    pub async fn start_service(&self, name: &str, options: ServiceOptions) -> Result<ServiceInfo> {
        {
            let mut services = self.services.lock().await;
            if let Some(handle) = services.get(name) {
                if self.verify_handle(handle).await {
                    debug!("service {} already running, reusing handle", name);
                    return Ok(info_for(name, handle));
                }
                let stale = services.remove(name).unwrap();
                drop(services);
                if let Err(e) = self.teardown(name, stale).await {
                    warn!("teardown of stale {} handle failed: {}", name, e);
                }
            }
        }

        let handle = match options.mode {
            ServiceMode::SharedSystem => self.start_shared(&options).await?,
            ServiceMode::OwnedStandalone => self.start_owned(&options).await?,
            ServiceMode::Embedded => self.start_embedded(&options)?,
        };

        let info = info_for(name, &handle);
        self.services.lock().await.insert(name.to_string(), handle);
        info!(
            "mesh service {} up in {:?} mode on {}",
            name,
            info.mode,
            info.socket_path.display()
        );
        Ok(info)
    }

    /// Stop the daemon for `name`. Stopping an unknown or already-stopped
    /// service succeeds quietly.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let handle = self.services.lock().await.remove(name);
        match handle {
            Some(handle) => self.teardown(name, handle).await,
            None => {
                debug!("stop for unknown service {}, nothing to do", name);
                Ok(())
            }
        }
    }

    pub async fn get_service_status(&self, name: &str) -> ServiceState {
        let services = self.services.lock().await;
        match services.get(name) {
            None => ServiceState::NotFound,
            Some(handle) => self.probe_handle(handle).await,
        }
    }

    /// Stop, settle, and start again with the previous options.
    pub async fn restart_service(&self, name: &str) -> Result<ServiceInfo> {
        let options = {
            let services = self.services.lock().await;
            services
                .get(name)
                .map(|h| h.options.clone())
                .ok_or_else(|| anyhow!("service {} not found", name))?
        };
        self.stop_service(name).await?;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start_service(name, options).await
    }

    /// Best-effort stop of every supervised service.
    pub async fn stop_all(&self) -> Vec<(String, anyhow::Error)> {
        let names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.stop_service(&name).await {
                failures.push((name, e));
            }
        }
        failures
    }

    pub async fn service_info(&self, name: &str) -> Option<ServiceInfo> {
        let services = self.services.lock().await;
        services.get(name).map(|h| info_for(name, h))
    }

    async fn start_shared(&self, options: &ServiceOptions) -> Result<ServiceHandle> {
        let client = MeshClient::new(Path::new(SYSTEM_SOCKET_PATH));
        if !client.is_running().await {
            bail!(
                "system daemon socket {} is not answering",
                SYSTEM_SOCKET_PATH
            );
        }
        let mut options = options.clone();
        options.socket_path = PathBuf::from(SYSTEM_SOCKET_PATH);
        Ok(ServiceHandle {
            options,
            started_at: Utc::now(),
            kind: HandleKind::SharedSystem,
        })
    }

    async fn start_owned(&self, options: &ServiceOptions) -> Result<ServiceHandle> {
        fs::create_dir_all(&options.state_dir).with_context(|| {
            format!("failed to create state dir {}", options.state_dir.display())
        })?;
        if let Some(parent) = options.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pid_file = options.state_dir.join("tailscaled.pid");

        // A daemon from a previous supervisor life may still be healthy;
        // re-adopt it only when both identity proofs hold.
        if let Some(pid) = read_pid_file(&pid_file) {
            if verify_process_identity(pid, &options.state_dir) {
                info!("re-adopting surviving daemon pid {}", pid);
                self.wait_for_socket(&options.socket_path).await?;
                return Ok(ServiceHandle {
                    options: options.clone(),
                    started_at: Utc::now(),
                    kind: HandleKind::OwnedStandalone {
                        pid,
                        pid_file,
                        child: None,
                    },
                });
            }
            debug!("ignoring stale pid file {}", pid_file.display());
            let _ = fs::remove_file(&pid_file);
        }

        let stdout = fs::File::create(options.state_dir.join("tailscaled.out"))?;
        let stderr = fs::File::create(options.state_dir.join("tailscaled.err"))?;

        let child = Command::new(DAEMON_COMM)
            .arg(format!(
                "--state={}",
                options.state_dir.join("tailscaled.state").display()
            ))
            .arg(format!("--socket={}", options.socket_path.display()))
            .arg(format!("--tun={}", options.tun_name))
            .arg(format!("--port={}", options.port))
            .current_dir(&options.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .context("failed to spawn mesh daemon")?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("spawned daemon has no pid"))?;
        fs::write(&pid_file, pid.to_string())
            .with_context(|| format!("failed to write {}", pid_file.display()))?;

        self.wait_for_socket(&options.socket_path).await?;

        Ok(ServiceHandle {
            options: options.clone(),
            started_at: Utc::now(),
            kind: HandleKind::OwnedStandalone {
                pid,
                pid_file,
                child: Some(child),
            },
        })
    }

    fn start_embedded(&self, options: &ServiceOptions) -> Result<ServiceHandle> {
        let factory = self
            .embedded_factory
            .as_ref()
            .ok_or_else(|| anyhow!("no embedded backend registered"))?;
        let backend = factory(options)?;
        Ok(ServiceHandle {
            options: options.clone(),
            started_at: Utc::now(),
            kind: HandleKind::Embedded { backend },
        })
    }

    async fn wait_for_socket(&self, socket_path: &Path) -> Result<()> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(SOCKET_WAIT_BUDGET),
            ..Default::default()
        };
        let client = MeshClient::new(socket_path);
        backoff::future::retry(policy, || {
            let client = client.clone();
            async move {
                if client.is_running().await {
                    Ok(())
                } else {
                    Err(backoff::Error::transient(anyhow!(
                        "daemon socket not answering yet"
                    )))
                }
            }
        })
        .await
        .with_context(|| {
            format!(
                "daemon socket {} did not come up within {:?}",
                socket_path.display(),
                SOCKET_WAIT_BUDGET
            )
        })
    }

    async fn verify_handle(&self, handle: &ServiceHandle) -> bool {
        self.probe_handle(handle).await == ServiceState::Running
    }

    async fn probe_handle(&self, handle: &ServiceHandle) -> ServiceState {
        match &handle.kind {
            HandleKind::SharedSystem => {
                let client = MeshClient::new(&handle.options.socket_path);
                if client.is_running().await {
                    ServiceState::Running
                } else {
                    ServiceState::Disconnected
                }
            }
            HandleKind::OwnedStandalone { pid, .. } => {
                if !process_alive(*pid) {
                    return ServiceState::Stopped;
                }
                let client = MeshClient::new(&handle.options.socket_path);
                if client.is_running().await {
                    ServiceState::Running
                } else {
                    ServiceState::Disconnected
                }
            }
            HandleKind::Embedded { backend } => {
                if backend.is_running() {
                    ServiceState::Running
                } else {
                    ServiceState::Stopped
                }
            }
        }
    }

    async fn teardown(&self, name: &str, handle: ServiceHandle) -> Result<()> {
        match handle.kind {
            HandleKind::SharedSystem => {
                // The OS owns this daemon; dropping the handle is the whole
                // teardown.
                debug!("releasing shared-system handle for {}", name);
                Ok(())
            }
            HandleKind::OwnedStandalone {
                pid,
                pid_file,
                child,
            } => {
                self.stop_owned(name, pid, &pid_file, child, &handle.options)
                    .await
            }
            HandleKind::Embedded { backend } => {
                backend
                    .shutdown()
                    .with_context(|| format!("embedded daemon {} failed to shut down", name))
            }
        }
    }

    async fn stop_owned(
        &self,
        name: &str,
        pid: u32,
        pid_file: &Path,
        child: Option<Child>,
        options: &ServiceOptions,
    ) -> Result<()> {
        if !process_alive(pid) {
            debug!("daemon {} (pid {}) already exited", name, pid);
            let _ = fs::remove_file(pid_file);
            return Ok(());
        }

        // Safety backstop: never signal a process we cannot prove is ours.
        if !verify_process_identity(pid, &options.state_dir) {
            warn!(
                "refusing to stop pid {}: process identity does not match daemon {}",
                pid, name
            );
            bail!("pid {} failed the process-identity check", pid);
        }

        terminate(pid, child).await?;
        let _ = fs::remove_file(pid_file);
        info!("stopped owned daemon {} (pid {})", name, pid);
        Ok(())
    }
}

impl Default for MeshSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn info_for(name: &str, handle: &ServiceHandle) -> ServiceInfo {
    let pid = match &handle.kind {
        HandleKind::OwnedStandalone { pid, .. } => Some(*pid),
        _ => None,
    };
    ServiceInfo {
        name: name.to_string(),
        mode: handle.options.mode,
        socket_path: handle.options.socket_path.clone(),
        pid,
        started_at: handle.started_at,
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Signal-0 liveness probe.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Ownership proof for owned-standalone PIDs: the comm must be the daemon
/// name and the cwd must sit inside the state directory this supervisor
/// created. A cwd rooted in an OS-daemon location always fails.
pub fn verify_process_identity(pid: u32, state_dir: &Path) -> bool {
    let comm_path = format!("/proc/{}/comm", pid);
    let comm = match fs::read_to_string(&comm_path) {
        Ok(comm) => comm.trim().to_string(),
        Err(_) => return false,
    };
    if comm != DAEMON_COMM {
        debug!("pid {} comm is {:?}, expected {:?}", pid, comm, DAEMON_COMM);
        return false;
    }

    let cwd = match fs::read_link(format!("/proc/{}/cwd", pid)) {
        Ok(cwd) => cwd,
        Err(_) => return false,
    };

    for prefix in FOREIGN_CWD_PREFIXES {
        if cwd.starts_with(prefix) {
            warn!(
                "pid {} cwd {} belongs to an OS-managed daemon, refusing ownership",
                pid,
                cwd.display()
            );
            return false;
        }
    }

    if !cwd.starts_with(state_dir) {
        debug!(
            "pid {} cwd {} is outside supervisor state dir {}",
            pid,
            cwd.display(),
            state_dir.display()
        );
        return false;
    }
    true
}

#[cfg(target_os = "linux")]
async fn terminate(pid: u32, child: Option<Child>) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("SIGTERM failed")?;

    if let Some(mut child) = child {
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(status) => {
                status.context("wait on daemon child failed")?;
                return Ok(());
            }
            Err(_) => {
                warn!("daemon pid {} ignored SIGTERM, killing", pid);
                child.kill().await.context("SIGKILL failed")?;
                return Ok(());
            }
        }
    }

    // Re-adopted process: poll for exit, escalate once.
    for _ in 0..20 {
        if !process_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    warn!("daemon pid {} ignored SIGTERM, killing", pid);
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).context("SIGKILL failed")?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn terminate(_pid: u32, _child: Option<Child>) -> Result<()> {
    anyhow::bail!("daemon supervision requires Linux")
}
