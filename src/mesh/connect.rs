//! Auth/connect state machine
//!
//! Drives the mesh daemon from any initial backend state into full
//! connectivity against the control plane, reusing prior state when the
//! live preferences already match the target. The daemon only exposes a
//! polling interface, so every wait is a bounded poll loop.

use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::api::{BackendState, MaskedPrefs, PrefsTarget, Status};
use super::client::{redact_key, MeshClient};
use super::probe::probe_control_plane;

/// Sentinel auth key meaning "reuse the daemon's existing authentication".
pub const AUTH_KEY_AUTO: &str = "auto";

/// Minimum length of a real pre-shared key.
const MIN_AUTH_KEY_LEN: usize = 20;

const POLL_TICK: Duration = Duration::from_secs(1);
const READY_WAIT: Duration = Duration::from_secs(30);
const RESET_WAIT: Duration = Duration::from_secs(10);
const RESET_WAIT_FROM_RUNNING: Duration = Duration::from_secs(15);
const AUTH_WAIT: Duration = Duration::from_secs(30);
const CONNECT_WAIT: Duration = Duration::from_secs(240);
const NEEDS_LOGIN_DEADLINE: Duration = Duration::from_secs(120);
const PROBE_AFTER: Duration = Duration::from_secs(60);
const PROBE_EVERY: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(15);
const DOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct UpOptions {
    pub control_url: String,
    pub auth_key: String,
    pub hostname: String,
    pub accept_routes: bool,
    pub advertise_routes: Vec<String>,
    pub shields_up: bool,
    pub accept_dns: bool,
}

impl UpOptions {
    fn target(&self) -> PrefsTarget {
        PrefsTarget {
            control_url: self.control_url.clone(),
            hostname: self.hostname.clone(),
            accept_routes: self.accept_routes,
            shields_up: self.shields_up,
            advertise_routes: self.advertise_routes.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.auth_key.is_empty() {
            bail!("auth key must not be empty");
        }
        if self.auth_key != AUTH_KEY_AUTO && self.auth_key.len() < MIN_AUTH_KEY_LEN {
            bail!(
                "auth key {} is too short to be a pre-shared key",
                redact_key(&self.auth_key)
            );
        }
        if self.control_url.is_empty() {
            bail!("control URL must not be empty");
        }
        for route in &self.advertise_routes {
            route
                .parse::<ipnet::IpNet>()
                .with_context(|| format!("invalid advertised route {:?}", route))?;
        }
        Ok(())
    }
}

pub struct ConnectStateMachine {
    client: MeshClient,
}

impl ConnectStateMachine {
    pub fn new(client: MeshClient) -> Self {
        Self { client }
    }

    /// Run `up_with_options` up to twice, pausing between attempts.
    /// Auth-key rejection is terminal and never retried.
    pub async fn up_with_options_with_retry(&self, options: &UpOptions) -> Result<Status> {
        match self.up_with_options(options).await {
            Ok(status) => Ok(status),
            Err(e) if is_auth_rejection(&e) => Err(e),
            Err(e) => {
                warn!("mesh up attempt failed, retrying in {:?}: {}", RETRY_DELAY, e);
                tokio::time::sleep(RETRY_DELAY).await;
                self.up_with_options(options).await
            }
        }
    }

    /// Bring the daemon to full connectivity: Running, holding mesh IPs,
    /// and online, with preferences matching `options`.
    pub async fn up_with_options(&self, options: &UpOptions) -> Result<Status> {
        options.validate()?;
        let target = options.target();

        // The daemon may still be booting; wait for a stable backend state.
        let status = self
            .wait_for_status(READY_WAIT, |s| s.backend_state != BackendState::Starting)
            .await?
            .context("mesh daemon did not reach a stable state in time")?;
        let initial_state = status.backend_state;
        debug!("daemon ready in state {}", initial_state);

        // Already connected with matching prefs: adopt it and stop here.
        if status.backend_state == BackendState::Running && !status.self_status.ips.is_empty() {
            let prefs = self.client.get_prefs().await?;
            let reasons = target.diff_reasons(&prefs);
            if reasons.is_empty() {
                info!("reusing connected daemon state, preferences already match");
                self.client
                    .edit_prefs(&MaskedPrefs::default().want_running(true))
                    .await?;
                return self.client.get_status().await;
            }
            info!("cannot reuse daemon state: {}", reasons.join("; "));
        }

        // Not reusable: force the daemon toward a clean slate before
        // programming it.
        self.client
            .edit_prefs(&MaskedPrefs::default().want_running(false).logged_out(true))
            .await?;
        let budget = if initial_state == BackendState::Running {
            RESET_WAIT_FROM_RUNNING
        } else {
            RESET_WAIT
        };
        if self
            .wait_for_status(budget, |s| {
                matches!(
                    s.backend_state,
                    BackendState::Stopped | BackendState::NeedsLogin
                )
            })
            .await?
            .is_none()
        {
            warn!("daemon did not settle after reset, continuing anyway");
        }

        // Push the masked diff and require the control URL to stick.
        let prefs = self.client.get_prefs().await?;
        let masked = target.masked_diff(&prefs);
        if !masked.is_empty() {
            self.client.edit_prefs(&masked).await?;
        }
        let prefs = self.client.get_prefs().await?;
        if prefs.control_url != target.control_url {
            bail!(
                "daemon kept control URL {:?} after setup, wanted {:?}",
                prefs.control_url,
                target.control_url
            );
        }

        self.authenticate(options, &target).await?;
        let status = self.wait_for_connection(options).await?;
        self.post_connect(options).await;
        Ok(status)
    }

    async fn authenticate(&self, options: &UpOptions, target: &PrefsTarget) -> Result<()> {
        if options.auth_key == AUTH_KEY_AUTO {
            let status = self.client.get_status().await?;
            if !status.have_node_key {
                bail!("auth key \"auto\" requires an existing node key, none held");
            }
            // Re-assert the target for any drift, then ask for running.
            let prefs = self.client.get_prefs().await?;
            let masked = target.masked_diff(&prefs);
            if !masked.is_empty() {
                self.client.edit_prefs(&masked).await?;
            }
            self.client
                .edit_prefs(&MaskedPrefs::default().want_running(true))
                .await?;
            return Ok(());
        }

        // Drive toward NeedsLogin first so the login flow has somewhere to
        // deliver the key.
        self.client
            .edit_prefs(&MaskedPrefs::default().want_running(true))
            .await?;
        info!(
            "starting login with pre-shared key {}",
            redact_key(&options.auth_key)
        );
        self.client.start(&options.auth_key).await?;

        let outcome = self
            .wait_for_status(AUTH_WAIT, |s| {
                !s.auth_url.is_empty()
                    || s.have_node_key
                    || matches!(
                        s.backend_state,
                        BackendState::Starting | BackendState::Running
                    )
            })
            .await?;

        match outcome {
            Some(status) if !status.auth_url.is_empty() => {
                bail!(
                    "manual authentication required at {}; the pre-shared key \
                     may be invalid",
                    status.auth_url
                );
            }
            Some(_) => Ok(()),
            None => bail!("daemon did not acknowledge the auth key in time"),
        }
    }

    async fn wait_for_connection(&self, options: &UpOptions) -> Result<Status> {
        let started = Instant::now();
        let mut reenabled_from_stopped = false;
        let mut needs_login_since: Option<Instant> = None;
        let mut last_probe = Instant::now();

        loop {
            if started.elapsed() > CONNECT_WAIT {
                bail!(
                    "mesh daemon did not reach full connectivity within {:?}",
                    CONNECT_WAIT
                );
            }

            match self.client.get_status().await {
                Ok(status) => {
                    if status.fully_connected() {
                        info!(
                            "mesh connected: {} ({} peer(s))",
                            status
                                .self_status
                                .ips
                                .iter()
                                .map(|ip| ip.to_string())
                                .collect::<Vec<_>>()
                                .join(", "),
                            status.peers.len()
                        );
                        return Ok(status);
                    }

                    if !status.auth_url.is_empty() {
                        bail!(
                            "manual authentication required at {}; the pre-shared \
                             key may be invalid",
                            status.auth_url
                        );
                    }

                    match status.backend_state {
                        BackendState::NeedsLogin => {
                            if status.have_node_key {
                                // Transient regression; nudge it forward.
                                debug!("NeedsLogin with a node key held, re-enabling");
                                let _ = self
                                    .client
                                    .edit_prefs(&MaskedPrefs::default().want_running(true))
                                    .await;
                                needs_login_since = None;
                            } else {
                                let since = *needs_login_since.get_or_insert_with(Instant::now);
                                if since.elapsed() > NEEDS_LOGIN_DEADLINE {
                                    bail!("authentication failed");
                                }
                            }
                        }
                        BackendState::Stopped if !reenabled_from_stopped => {
                            debug!("daemon stopped mid-connect, re-enabling once");
                            reenabled_from_stopped = true;
                            let _ = self
                                .client
                                .edit_prefs(&MaskedPrefs::default().want_running(true))
                                .await;
                        }
                        _ => {}
                    }
                }
                Err(e) => debug!("status poll failed while connecting: {}", e),
            }

            if started.elapsed() > PROBE_AFTER && last_probe.elapsed() > PROBE_EVERY {
                last_probe = Instant::now();
                let control_url = options.control_url.clone();
                tokio::task::spawn_blocking(move || {
                    let report = probe_control_plane(&control_url);
                    debug!(
                        "control-plane probe while waiting: dns={} tcp={} http={}",
                        report.dns_ok, report.tcp_ok, report.http_ok
                    );
                });
            }

            tokio::time::sleep(POLL_TICK).await;
        }
    }

    /// Post-connect fixups are warnings, never errors.
    async fn post_connect(&self, options: &UpOptions) {
        if !options.accept_dns {
            // Keep the daemon's hands off /etc/resolv.conf.
            if let Err(e) = self
                .client
                .edit_prefs(&MaskedPrefs::default().corp_dns(false))
                .await
            {
                warn!("failed to disable mesh DNS takeover: {}", e);
            }
        }
    }

    /// Stop the daemon's participation in the mesh.
    pub async fn down(&self) -> Result<()> {
        self.client
            .edit_prefs(&MaskedPrefs::default().want_running(false))
            .await
            .context("failed to push want_running=false")?;

        if self
            .wait_for_status(DOWN_WAIT, |s| s.backend_state == BackendState::Stopped)
            .await?
            .is_none()
        {
            warn!("daemon did not report Stopped within {:?}", DOWN_WAIT);
        }
        Ok(())
    }

    /// Poll status every tick until `pred` holds or the budget runs out.
    /// Transient socket errors keep the poll alive; `None` means timeout.
    async fn wait_for_status<F>(&self, budget: Duration, pred: F) -> Result<Option<Status>>
    where
        F: Fn(&Status) -> bool,
    {
        let deadline = Instant::now() + budget;
        loop {
            match self.client.get_status().await {
                Ok(status) if pred(&status) => return Ok(Some(status)),
                Ok(_) => {}
                Err(e) => debug!("status poll failed: {}", e),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_TICK).await;
        }
    }
}

fn is_auth_rejection(e: &anyhow::Error) -> bool {
    let text = e.to_string();
    text.contains("manual authentication") || text.contains("authentication failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::api::{Prefs, SelfStatus};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Scripted daemon with just enough state-machine behavior: a valid
    /// auth key produces a node key and full connectivity; anything else
    /// surfaces an auth URL.
    #[derive(Default)]
    struct FakeDaemon {
        status: Status,
        prefs: Prefs,
        valid_key: String,
        ops: Vec<String>,
    }

    impl FakeDaemon {
        fn apply(&mut self, masked: &MaskedPrefs) {
            masked.apply_to(&mut self.prefs);
            if masked.logged_out_set && masked.logged_out {
                // Connectivity drops but the node key survives until a new
                // Start replaces it.
                self.status.backend_state = BackendState::NeedsLogin;
                self.status.self_status = SelfStatus::default();
            }
            if masked.want_running_set && masked.want_running {
                if self.status.have_node_key {
                    self.connect();
                } else {
                    self.status.backend_state = BackendState::NeedsLogin;
                }
            }
        }

        fn start(&mut self, key: &str) {
            self.ops.push(format!("start:{}", key));
            if key == self.valid_key {
                self.status.have_node_key = true;
                self.connect();
            } else {
                self.status.auth_url = "https://hs.example.com/register/x".into();
            }
        }

        fn connect(&mut self) {
            self.status.backend_state = BackendState::Running;
            self.status.self_status = SelfStatus {
                hostname: self.prefs.hostname.clone(),
                ips: vec!["100.64.0.7".parse().unwrap()],
                online: true,
            };
        }
    }

    fn spawn_daemon(path: PathBuf, daemon: FakeDaemon) -> Arc<Mutex<FakeDaemon>> {
        let shared = Arc::new(Mutex::new(daemon));
        let listener = UnixListener::bind(&path).unwrap();
        let state = shared.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (read_half, mut write_half) = stream.into_split();
                let mut line = String::new();
                let mut reader = BufReader::new(read_half);
                if reader.read_line(&mut line).await.is_err() || line.is_empty() {
                    continue;
                }
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let reply = {
                    let mut daemon = state.lock().unwrap();
                    let op = request["op"].as_str().unwrap().to_string();
                    daemon.ops.push(op.clone());
                    match op.as_str() {
                        "status" => serde_json::json!({"ok": true, "status": daemon.status}),
                        "prefs" => serde_json::json!({"ok": true, "prefs": daemon.prefs}),
                        "edit_prefs" => {
                            let masked: MaskedPrefs =
                                serde_json::from_value(request["prefs"].clone()).unwrap();
                            daemon.apply(&masked);
                            serde_json::json!({"ok": true, "prefs": daemon.prefs})
                        }
                        "start" => {
                            let key = request["auth_key"].as_str().unwrap().to_string();
                            daemon.start(&key);
                            serde_json::json!({"ok": true})
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
        shared
    }

    fn options() -> UpOptions {
        UpOptions {
            control_url: "https://hs.example.com".into(),
            auth_key: "hskey-0123456789abcdef0123".into(),
            hostname: "node-a".into(),
            accept_routes: true,
            advertise_routes: vec!["10.244.1.0/24".into()],
            shields_up: false,
            accept_dns: false,
        }
    }

    #[tokio::test]
    async fn test_fresh_login_from_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let daemon = FakeDaemon {
            valid_key: "hskey-0123456789abcdef0123".into(),
            ..Default::default()
        };
        let state = spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let status = machine.up_with_options(&options()).await.unwrap();

        assert!(status.fully_connected());
        let daemon = state.lock().unwrap();
        assert_eq!(daemon.prefs.control_url, "https://hs.example.com");
        assert_eq!(daemon.prefs.hostname, "node-a");
        assert!(daemon.prefs.accept_routes);
        assert_eq!(daemon.prefs.advertise_routes, vec!["10.244.1.0/24"]);
        assert!(daemon.ops.iter().any(|op| op.starts_with("start:")));
        // accept_dns=false pushed corp_dns off post-connect.
        assert!(!daemon.prefs.corp_dns);
    }

    #[tokio::test]
    async fn test_state_reuse_skips_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let mut daemon = FakeDaemon {
            valid_key: "hskey-0123456789abcdef0123".into(),
            prefs: Prefs {
                control_url: "https://hs.example.com".into(),
                hostname: "node-a".into(),
                accept_routes: true,
                advertise_routes: vec!["10.244.1.0/24".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        daemon.status.have_node_key = true;
        daemon.connect();
        let state = spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let started = Instant::now();
        let status = machine.up_with_options(&options()).await.unwrap();
        assert!(status.fully_connected());
        assert!(started.elapsed() < Duration::from_secs(2));

        let daemon = state.lock().unwrap();
        assert!(!daemon.ops.iter().any(|op| op.starts_with("start")));
        let edits = daemon.ops.iter().filter(|op| *op == "edit_prefs").count();
        assert_eq!(edits, 1, "reuse should push exactly one edit_prefs");
    }

    #[tokio::test]
    async fn test_mismatched_prefs_force_reset_and_relogin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let mut daemon = FakeDaemon {
            valid_key: "hskey-0123456789abcdef0123".into(),
            prefs: Prefs {
                control_url: "https://old.example.com".into(),
                hostname: "node-a".into(),
                accept_routes: true,
                advertise_routes: vec!["10.244.1.0/24".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        daemon.status.have_node_key = true;
        daemon.connect();
        let state = spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let status = machine.up_with_options(&options()).await.unwrap();
        assert!(status.fully_connected());

        let daemon = state.lock().unwrap();
        assert_eq!(daemon.prefs.control_url, "https://hs.example.com");
        assert!(daemon.ops.iter().any(|op| op.starts_with("start:")));
    }

    #[tokio::test]
    async fn test_rejected_key_fails_fast_with_auth_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let daemon = FakeDaemon {
            valid_key: "hskey-some-other-key-entirely".into(),
            ..Default::default()
        };
        spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let err = machine.up_with_options(&options()).await.unwrap_err();
        assert!(err.to_string().contains("manual authentication"));
        assert!(is_auth_rejection(&err));
    }

    #[tokio::test]
    async fn test_auto_key_requires_node_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        spawn_daemon(path.clone(), FakeDaemon::default());

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let mut opts = options();
        opts.auth_key = AUTH_KEY_AUTO.into();
        let err = machine.up_with_options(&opts).await.unwrap_err();
        assert!(err.to_string().contains("auto"));
    }

    #[tokio::test]
    async fn test_auto_key_reuses_existing_node_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let mut daemon = FakeDaemon::default();
        daemon.status.have_node_key = true;
        daemon.status.backend_state = BackendState::Stopped;
        let state = spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let mut opts = options();
        opts.auth_key = AUTH_KEY_AUTO.into();
        let status = machine.up_with_options(&opts).await.unwrap();
        assert!(status.fully_connected());
        assert!(!state
            .lock()
            .unwrap()
            .ops
            .iter()
            .any(|op| op.starts_with("start:")));
    }

    #[tokio::test]
    async fn test_option_validation() {
        let dir = tempfile::tempdir().unwrap();
        let machine = ConnectStateMachine::new(MeshClient::new(&dir.path().join("x.sock")));

        let mut opts = options();
        opts.auth_key = String::new();
        assert!(machine.up_with_options(&opts).await.is_err());

        let mut opts = options();
        opts.auth_key = "short".into();
        assert!(machine.up_with_options(&opts).await.is_err());

        let mut opts = options();
        opts.control_url = String::new();
        assert!(machine.up_with_options(&opts).await.is_err());

        let mut opts = options();
        opts.advertise_routes = vec!["bogus".into()];
        assert!(machine.up_with_options(&opts).await.is_err());
    }

    #[tokio::test]
    async fn test_down_pushes_want_running_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let mut daemon = FakeDaemon::default();
        daemon.status.have_node_key = true;
        daemon.connect();
        daemon.status.backend_state = BackendState::Stopped; // settles instantly
        let state = spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        machine.down().await.unwrap();
        assert!(!state.lock().unwrap().prefs.want_running);
    }

    #[tokio::test]
    async fn test_retry_does_not_mask_auth_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");
        let daemon = FakeDaemon {
            valid_key: "hskey-some-other-key-entirely".into(),
            ..Default::default()
        };
        spawn_daemon(path.clone(), daemon);

        let machine = ConnectStateMachine::new(MeshClient::new(&path));
        let started = Instant::now();
        let err = machine
            .up_with_options_with_retry(&options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("manual authentication"));
        // A retry would have slept 15s first; rejection must fail fast.
        assert!(started.elapsed() < RETRY_DELAY);
    }
}
