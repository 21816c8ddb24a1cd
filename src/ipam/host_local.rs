//! host-local compatible allocator
//!
//! Keeps one file per allocated IP in a data directory; the file name is
//! the address, the body is the owning container ID. Matches the on-disk
//! layout of the upstream `host-local` CNI plugin so the two can share a
//! directory.

use ipnet::Ipv4Net;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Allocation, IpamError, PoolError};

/// Default record directory, parameterized by the network name.
pub fn default_data_dir(network_name: &str) -> PathBuf {
    PathBuf::from("/var/lib/cni/networks").join(network_name)
}

pub struct HostLocalIpam {
    cidr: Ipv4Net,
    data_dir: PathBuf,
    node_name: String,
}

impl HostLocalIpam {
    pub fn new(cidr: Ipv4Net, data_dir: &Path, node_name: &str) -> Result<Self, IpamError> {
        fs::create_dir_all(data_dir).map_err(IpamError::Persist)?;
        Ok(Self {
            cidr,
            data_dir: data_dir.to_path_buf(),
            node_name: node_name.to_string(),
        })
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.cidr.network()) + 1)
    }

    /// Allocate the first free address, scanning upward from `.10`.
    /// A container that already holds an address gets it back.
    pub fn allocate(
        &self,
        namespace: &str,
        name: &str,
        container_id: &str,
    ) -> Result<Allocation, IpamError> {
        if let Some(ip) = self.get_ip_by_container_id(container_id) {
            debug!("host-local: {} already holds {}", container_id, ip);
            return Ok(self.record(ip, namespace, name, container_id));
        }

        let network = u32::from(self.cidr.network());
        let broadcast = u32::from(self.cidr.broadcast());

        for addr in (network + 10)..broadcast {
            let candidate = Ipv4Addr::from(addr);
            let path = self.data_dir.join(candidate.to_string());
            if path.exists() {
                continue;
            }
            fs::write(&path, container_id).map_err(IpamError::Persist)?;
            info!("host-local: allocated {} for {}", candidate, container_id);
            return Ok(self.record(candidate, namespace, name, container_id));
        }

        Err(IpamError::Pool(PoolError::Exhausted { cidr: self.cidr }))
    }

    /// Remove the record owned by `container_id`. Missing records are a
    /// successful no-op.
    pub fn release_by_container_id(&self, container_id: &str) -> Result<(), IpamError> {
        match self.find_record(container_id) {
            Some((ip, path)) => {
                fs::remove_file(&path).map_err(IpamError::Persist)?;
                info!("host-local: released {} for {}", ip, container_id);
                Ok(())
            }
            None => {
                debug!("host-local: no record for {}, nothing to do", container_id);
                Ok(())
            }
        }
    }

    pub fn get_ip_by_container_id(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.find_record(container_id).map(|(ip, _)| ip)
    }

    fn find_record(&self, container_id: &str) -> Option<(Ipv4Addr, PathBuf)> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "host-local: cannot read {}: {}",
                    self.data_dir.display(),
                    e
                );
                return None;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let ip: Ipv4Addr = match entry.file_name().to_string_lossy().parse() {
                Ok(ip) => ip,
                Err(_) => continue,
            };
            match fs::read_to_string(&path) {
                Ok(body) if body.trim() == container_id => return Some((ip, path)),
                Ok(_) => {}
                Err(e) => warn!("host-local: cannot read {}: {}", path.display(), e),
            }
        }
        None
    }

    fn record(&self, ip: Ipv4Addr, namespace: &str, name: &str, container_id: &str) -> Allocation {
        Allocation {
            ip,
            pod_namespace: namespace.to_string(),
            pod_name: name.to_string(),
            container_id: container_id.to_string(),
            node_name: self.node_name.clone(),
            allocated_at: chrono::Utc::now(),
            metadata: Default::default(),
        }
    }
}
