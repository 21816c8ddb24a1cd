//! Configuration
//!
//! Two surfaces: the CNI network config handed to the plugin on stdin
//! (single-plugin or chained `plugins[]` shape), and the daemon's YAML
//! config file with environment variable overrides.

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::ipam::AllocationStrategy;
use crate::mesh::{ServiceMode, OWNED_SOCKET_PATH};
use crate::netlink::DEFAULT_MTU;

/// The plugin's own `type` in CNI configs.
pub const PLUGIN_NAME: &str = "headcni";

/// Native IPAM backend name.
pub const NATIVE_IPAM: &str = "headcni-ipam";

/// File-per-IP backend name, compatible with the upstream allocator.
pub const HOST_LOCAL_IPAM: &str = "host-local";

/// Default plugin-to-daemon notification socket.
pub const DEFAULT_DAEMON_SOCKET: &str = "/var/run/headcni/daemon.sock";

/// Per-node state root.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/headcni";

// ---------------------------------------------------------------------------
// CNI network config (stdin)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<Vec<IpamRange>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_strategy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MagicDnsConf {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub base_domain: String,
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub search_domains: Vec<String>,
}

/// One network configuration as this plugin sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub enable_ipv6: bool,
    #[serde(default)]
    pub enable_network_policy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic_dns: Option<MagicDnsConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailscale_nic: Option<String>,
}

/// Chained-config envelope; only the shape we need to pick our entry out.
#[derive(Debug, Deserialize)]
struct NetConfList {
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    #[serde(default)]
    name: String,
    plugins: Vec<serde_json::Value>,
}

impl NetConf {
    /// Parse the stdin config, resolving a chained `plugins[]` shape to
    /// the entry whose type is this plugin's own name.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).context("network config is not valid JSON")?;

        if value.get("plugins").is_some() {
            let list: NetConfList =
                serde_json::from_value(value).context("malformed chained network config")?;
            for entry in list.plugins {
                if entry.get("type").and_then(|t| t.as_str()) == Some(PLUGIN_NAME) {
                    let mut conf: NetConf = serde_json::from_value(entry)
                        .context("malformed plugin entry in chained config")?;
                    // The list owns these fields in the chained shape.
                    conf.cni_version = list.cni_version;
                    conf.name = list.name;
                    return Ok(conf);
                }
            }
            bail!("no {:?} entry in chained network config", PLUGIN_NAME);
        }

        serde_json::from_value(value).context("malformed network config")
    }

    /// The node's pod CIDR: IPAM ranges first, then the IPAM subnet, then
    /// the top-level field.
    pub fn resolve_pod_cidr(&self) -> Result<Ipv4Net> {
        let from_ipam = self.ipam.as_ref().and_then(|ipam| {
            ipam.ranges
                .as_ref()
                .and_then(|r| r.first())
                .and_then(|r| r.first())
                .and_then(|r| r.subnet.clone())
                .or_else(|| ipam.subnet.clone())
        });

        let cidr = from_ipam
            .or_else(|| self.pod_cidr.clone())
            .context("no pod CIDR configured: set ipam.ranges, ipam.subnet, or pod_cidr")?;
        cidr.parse()
            .with_context(|| format!("invalid pod CIDR {:?}", cidr))
    }

    /// Gateway override from IPAM config, if any.
    pub fn gateway_override(&self) -> Result<Option<Ipv4Addr>> {
        match self.ipam.as_ref().and_then(|i| i.gateway.as_ref()) {
            Some(gw) => Ok(Some(
                gw.parse()
                    .with_context(|| format!("invalid ipam.gateway {:?}", gw))?,
            )),
            None => Ok(None),
        }
    }

    pub fn service_cidr(&self) -> Result<Option<Ipv4Net>> {
        match &self.service_cidr {
            Some(cidr) => Ok(Some(
                cidr.parse()
                    .with_context(|| format!("invalid service_cidr {:?}", cidr))?,
            )),
            None => Ok(None),
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    pub fn ipam_type(&self) -> &str {
        self.ipam
            .as_ref()
            .map(|i| i.ipam_type.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(NATIVE_IPAM)
    }

    pub fn allocation_strategy(&self) -> Result<AllocationStrategy> {
        match self
            .ipam
            .as_ref()
            .and_then(|i| i.allocation_strategy.as_deref())
        {
            None => Ok(AllocationStrategy::Sequential),
            Some(s) => AllocationStrategy::parse(s)
                .with_context(|| format!("unknown allocation_strategy {:?}", s)),
        }
    }

    pub fn host_local_data_dir(&self) -> PathBuf {
        self.ipam
            .as_ref()
            .and_then(|i| i.data_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::ipam::host_local::default_data_dir(&self.name))
    }
}

// ---------------------------------------------------------------------------
// Daemon config (YAML file + env overrides)
// ---------------------------------------------------------------------------

fn default_hostname() -> String {
    String::new()
}

fn default_accept_routes() -> bool {
    true
}

fn default_mesh_mode() -> String {
    "auto".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(OWNED_SOCKET_PATH)
}

fn default_daemon_socket() -> PathBuf {
    PathBuf::from(DEFAULT_DAEMON_SOCKET)
}

fn default_health_addr() -> String {
    "127.0.0.1:9007".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_gc_max_age() -> u64 {
    7200
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `headcnid` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    pub control_url: String,

    #[serde(default)]
    pub auth_key: String,
    /// Wins over `auth_key` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key_file: Option<PathBuf>,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    pub pod_cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,

    #[serde(default = "default_accept_routes")]
    pub accept_routes: bool,
    #[serde(default)]
    pub accept_dns: bool,
    #[serde(default)]
    pub shields_up: bool,

    /// auto | system | standalone | embedded
    #[serde(default = "default_mesh_mode")]
    pub mesh_mode: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_daemon_socket")]
    pub daemon_socket: PathBuf,

    #[serde(default = "default_health_addr")]
    pub health_addr: String,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    #[serde(default = "default_gc_max_age")]
    pub gc_max_age_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl DaemonConfig {
    /// Load from `HEADCNI_CONFIG` or the default path, then apply env
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("HEADCNI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/headcni/config.yaml"));
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: DaemonConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HEADCNI_CONTROL_URL") {
            self.control_url = url;
        }
        if let Ok(key) = std::env::var("HEADCNI_AUTH_KEY") {
            self.auth_key = key;
            self.auth_key_file = None;
        }
        if let Ok(cidr) = std::env::var("HEADCNI_POD_CIDR") {
            self.pod_cidr = cidr;
        }
        if let Ok(socket) = std::env::var("HEADCNI_DAEMON_SOCKET") {
            self.daemon_socket = PathBuf::from(socket);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.control_url.is_empty() {
            bail!("control_url cannot be empty");
        }
        if !self.control_url.starts_with("http://") && !self.control_url.starts_with("https://") {
            bail!("control_url must start with http:// or https://");
        }
        self.pod_cidr
            .parse::<Ipv4Net>()
            .with_context(|| format!("invalid pod_cidr {:?}", self.pod_cidr))?;
        if let Some(cidr) = &self.service_cidr {
            cidr.parse::<Ipv4Net>()
                .with_context(|| format!("invalid service_cidr {:?}", cidr))?;
        }
        if self.auth_key.is_empty() && self.auth_key_file.is_none() {
            bail!("one of auth_key or auth_key_file is required");
        }
        match self.mesh_mode.as_str() {
            "auto" | "system" | "standalone" | "embedded" => {}
            other => bail!("unknown mesh_mode {:?}", other),
        }
        Ok(())
    }

    pub fn pod_cidr(&self) -> Result<Ipv4Net> {
        self.pod_cidr
            .parse()
            .with_context(|| format!("invalid pod_cidr {:?}", self.pod_cidr))
    }

    pub fn service_cidr(&self) -> Option<Ipv4Net> {
        self.service_cidr.as_ref().and_then(|c| c.parse().ok())
    }

    /// The file pointer wins over the inline value.
    pub fn resolved_auth_key(&self) -> Result<String> {
        if let Some(path) = &self.auth_key_file {
            let key = fs::read_to_string(path)
                .with_context(|| format!("failed to read auth key file {}", path.display()))?;
            let key = key.trim().to_string();
            if key.is_empty() {
                bail!("auth key file {} is empty", path.display());
            }
            return Ok(key);
        }
        Ok(self.auth_key.clone())
    }

    /// Hostname for the mesh: config, then `NODE_NAME`, then the kernel.
    pub fn resolved_hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }
        node_name()
    }

    pub fn mesh_mode(&self) -> ServiceMode {
        match self.mesh_mode.as_str() {
            "system" => ServiceMode::SharedSystem,
            "standalone" => ServiceMode::OwnedStandalone,
            "embedded" => ServiceMode::Embedded,
            _ => ServiceMode::detect(),
        }
    }

    pub fn ipam_state_dir(&self) -> PathBuf {
        self.state_dir.join("ipam")
    }
}

/// This node's name: `NODE_NAME`, else the kernel hostname.
pub fn node_name() -> String {
    if let Ok(name) = std::env::var("NODE_NAME") {
        if !name.is_empty() {
            return name;
        }
    }
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
