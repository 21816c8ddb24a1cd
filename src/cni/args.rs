//! CNI environment and arguments
//!
//! The runtime passes everything through environment variables, with pod
//! identity packed into `CNI_ARGS` as `;`-separated `K=V` pairs.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;

pub const ENV_COMMAND: &str = "CNI_COMMAND";
pub const ENV_CONTAINER_ID: &str = "CNI_CONTAINERID";
pub const ENV_NETNS: &str = "CNI_NETNS";
pub const ENV_IFNAME: &str = "CNI_IFNAME";
pub const ENV_ARGS: &str = "CNI_ARGS";
pub const ENV_PATH: &str = "CNI_PATH";

const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
const ARG_POD_NAME: &str = "K8S_POD_NAME";
const ARG_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";
const ARG_POD_UID: &str = "K8S_POD_UID";

/// The standard CNI environment for one invocation.
#[derive(Debug, Clone)]
pub struct CniEnv {
    pub command: String,
    pub container_id: String,
    pub netns: PathBuf,
    pub ifname: String,
    pub args: HashMap<String, String>,
    pub path: String,
}

impl CniEnv {
    pub fn from_env() -> Result<Self> {
        let command = std::env::var(ENV_COMMAND)
            .context("CNI_COMMAND is not set; this binary is run by the container runtime")?;
        Ok(Self {
            command,
            container_id: std::env::var(ENV_CONTAINER_ID).unwrap_or_default(),
            netns: PathBuf::from(std::env::var(ENV_NETNS).unwrap_or_default()),
            ifname: std::env::var(ENV_IFNAME).unwrap_or_default(),
            args: parse_cni_args(&std::env::var(ENV_ARGS).unwrap_or_default()),
            path: std::env::var(ENV_PATH).unwrap_or_default(),
        })
    }

    /// Pod identity from the args, required for ADD.
    pub fn pod_identity(&self) -> Result<PodIdentity> {
        PodIdentity::from_args(&self.args, &self.container_id)
            .context("CNI_ARGS is missing the pod identity keys")
    }

    /// Best-effort identity for DEL; missing args do not abort teardown.
    pub fn pod_identity_opt(&self) -> Option<PodIdentity> {
        PodIdentity::from_args(&self.args, &self.container_id).ok()
    }
}

/// Identity of the pod a CNI event concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
    pub container_id: String,
    pub uid: String,
}

impl PodIdentity {
    fn from_args(args: &HashMap<String, String>, fallback_cid: &str) -> Result<Self> {
        let namespace = args
            .get(ARG_POD_NAMESPACE)
            .filter(|s| !s.is_empty())
            .context("K8S_POD_NAMESPACE missing")?;
        let name = args
            .get(ARG_POD_NAME)
            .filter(|s| !s.is_empty())
            .context("K8S_POD_NAME missing")?;
        let container_id = args
            .get(ARG_POD_INFRA_CONTAINER_ID)
            .filter(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or(fallback_cid);
        Ok(Self {
            namespace: namespace.clone(),
            name: name.clone(),
            container_id: container_id.to_string(),
            uid: args.get(ARG_POD_UID).cloned().unwrap_or_default(),
        })
    }
}

/// Parse `;`-separated `K=V` pairs; malformed fragments are skipped.
pub fn parse_cni_args(args: &str) -> HashMap<String, String> {
    args.split(';')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}
