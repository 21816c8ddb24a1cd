//! IP address management
//!
//! Two backends implement the same allocate/release contract: the native
//! per-pod manager with durable records, and a host-local file-per-IP
//! allocator compatible with the upstream CNI plugin's on-disk layout.

pub mod host_local;
pub mod manager;
pub mod pool;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

pub use host_local::HostLocalIpam;
pub use manager::{IpamManager, IpamStatistics};
pub use pool::{AllocationStrategy, LocalPool, PoolError};

/// One pod's IP allocation, keyed by `(pod_namespace, pod_name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_id: String,
    pub node_name: String,
    pub allocated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Allocation {
    /// Map key for the allocation table.
    pub fn key(&self) -> String {
        allocation_key(&self.pod_namespace, &self.pod_name)
    }
}

pub fn allocation_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[derive(Debug, Error)]
pub enum IpamError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("allocation for {key} references {ip}, outside pod CIDR {cidr}")]
    RecordOutOfRange {
        key: String,
        ip: Ipv4Addr,
        cidr: ipnet::Ipv4Net,
    },

    #[error("failed to persist allocation record: {0}")]
    Persist(#[source] std::io::Error),

    #[error("failed to read allocation records: {0}")]
    Load(#[source] std::io::Error),
}

/// IPAM backend selected by `ipam.type` in the network config.
pub enum IpamBackend {
    /// `headcni-ipam`: the native manager (durable per-pod records).
    Native(IpamManager),
    /// `host-local`: file-per-IP records keyed by container ID.
    HostLocal(HostLocalIpam),
}

impl IpamBackend {
    /// Allocate an address for a pod. Idempotent per backend contract.
    pub async fn allocate(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
    ) -> Result<Allocation, IpamError> {
        match self {
            Self::Native(m) => m.allocate_ip(namespace, name, container_id).await,
            Self::HostLocal(h) => h.allocate(namespace, name, container_id),
        }
    }

    /// Release a pod's address. Unknown pods release as a successful no-op.
    pub async fn release(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
    ) -> Result<(), IpamError> {
        match self {
            Self::Native(m) => m.release_ip(namespace, name).await,
            Self::HostLocal(h) => h.release_by_container_id(container_id),
        }
    }

    pub fn get_ip_by_container_id(&self, container_id: &str) -> Option<Ipv4Addr> {
        match self {
            Self::Native(m) => m.get_ip_by_container_id(container_id),
            Self::HostLocal(h) => h.get_ip_by_container_id(container_id),
        }
    }

    /// Join outstanding persistence writers; the one-shot plugin process
    /// must not exit while a record write is in flight.
    pub async fn flush(&self) {
        if let Self::Native(m) = self {
            m.flush().await;
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        match self {
            Self::Native(m) => m.gateway(),
            Self::HostLocal(h) => h.gateway(),
        }
    }

    pub fn cidr(&self) -> ipnet::Ipv4Net {
        match self {
            Self::Native(m) => m.cidr(),
            Self::HostLocal(h) => h.cidr(),
        }
    }
}
