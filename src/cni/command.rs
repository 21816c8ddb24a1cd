//! CNI command plane
//!
//! ADD is transactional: every step registers the cleanup that undoes it,
//! and a failure at step N reverts steps 1..N-1 before the original error
//! is returned. DEL is best-effort and must tolerate any partial state a
//! crashed ADD may have left behind. CHECK returns the first failing
//! assertion.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::args::CniEnv;
use super::types::{assemble_dns, CniInterface, CniIp, CniResult, RouteEntry};
use crate::config::{NetConf, DEFAULT_DAEMON_SOCKET, HOST_LOCAL_IPAM, NATIVE_IPAM};
use crate::ipam::{HostLocalIpam, IpamBackend, IpamManager};
use crate::netlink::{self, host_ifname_for_container, PodNetConfig, POD_IFNAME};
use crate::notify::{self, NotifyRequest, REQUEST_POD_READY};

/// Outer bound on one ADD invocation.
pub const ADD_TIMEOUT: Duration = Duration::from_secs(30);

/// Outer bound on one DEL invocation.
pub const DEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Formatted host-end MAC for the result document.
const HOST_VETH_MAC_STR: &str = "ee:ee:ee:ee:ee:ee";

/// Pick the IPAM backend named by `ipam.type`.
pub fn select_backend(conf: &NetConf, ipam_root: &Path, node_name: &str) -> Result<IpamBackend> {
    let cidr = conf.resolve_pod_cidr()?;
    match conf.ipam_type() {
        NATIVE_IPAM => {
            let manager = IpamManager::new(
                cidr,
                node_name,
                ipam_root,
                conf.allocation_strategy()?,
            )?;
            Ok(IpamBackend::Native(manager))
        }
        HOST_LOCAL_IPAM => {
            let ipam = HostLocalIpam::new(cidr, &conf.host_local_data_dir(), node_name)?;
            Ok(IpamBackend::HostLocal(ipam))
        }
        other => anyhow::bail!("unknown ipam.type {:?}", other),
    }
}

pub async fn cmd_add(conf: &NetConf, env: &CniEnv, ipam_root: &Path) -> Result<CniResult> {
    let identity = env.pod_identity()?;
    let container_id = if env.container_id.is_empty() {
        identity.container_id.clone()
    } else {
        env.container_id.clone()
    };
    if env.netns.as_os_str().is_empty() {
        anyhow::bail!("CNI_NETNS is not set");
    }

    let cidr = conf.resolve_pod_cidr()?;
    let node = crate::config::node_name();
    let backend = select_backend(conf, ipam_root, &node)?;
    let gateway = conf
        .gateway_override()?
        .unwrap_or_else(|| backend.gateway());
    let service_cidr = conf.service_cidr()?;

    info!(
        "ADD {}/{} (container {}) in {}",
        identity.namespace,
        identity.name,
        container_id,
        cidr
    );

    let allocation = backend
        .allocate(&identity.namespace, &identity.name, &container_id)
        .await
        .context("IP allocation failed")?;

    let host_ifname = host_ifname_for_container(&container_id);

    // Step: veth pair. Rollback: release the allocation.
    if let Err(e) = netlink::create_veth_pair(&env.netns, POD_IFNAME, &host_ifname).await {
        rollback_allocation(&backend, &identity.namespace, &identity.name, &container_id).await;
        return Err(e).context("veth creation failed");
    }

    // Step: program the pod namespace. Rollback: veth + allocation.
    let pod_config = PodNetConfig {
        ip: allocation.ip,
        prefix_len: cidr.prefix_len(),
        mtu: conf.mtu(),
        gateway,
        service_cidr,
        enable_ipv6: conf.enable_ipv6,
    };
    if let Err(e) = netlink::setup_pod_network_ns(&env.netns, &pod_config).await {
        rollback_veth(&host_ifname).await;
        rollback_allocation(&backend, &identity.namespace, &identity.name, &container_id).await;
        return Err(e).context("pod namespace setup failed");
    }

    // Step: host-side /32. Rollback: routes + veth + allocation.
    if let Err(e) = netlink::setup_host_route(allocation.ip, &host_ifname).await {
        rollback_host_route(&host_ifname).await;
        rollback_veth(&host_ifname).await;
        rollback_allocation(&backend, &identity.namespace, &identity.name, &container_id).await;
        return Err(e).context("host route setup failed");
    }

    // Remote nodes answer via the overlay; point return traffic at the
    // mesh NIC when one exists. Warnings only.
    if let Some(mesh_if) = netlink::detect_mesh_interface(conf.tailscale_nic.as_deref()) {
        if let Err(e) = netlink::add_mesh_route(allocation.ip, &mesh_if).await {
            warn!("failed to add mesh /32 via {}: {}", mesh_if, e);
        }
    }

    let result = compose_result(
        conf,
        allocation.ip,
        cidr.prefix_len(),
        gateway,
        &host_ifname,
        &env.netns,
    );

    notify_daemon(&identity.namespace, &identity.name, &container_id, &allocation.ip, &cidr).await;

    backend.flush().await;
    Ok(result)
}

pub async fn cmd_del(conf: &NetConf, env: &CniEnv, ipam_root: &Path) -> Result<()> {
    let identity = env.pod_identity_opt();
    let container_id = identity
        .as_ref()
        .map(|i| i.container_id.clone())
        .filter(|cid| !cid.is_empty())
        .unwrap_or_else(|| env.container_id.clone());

    info!("DEL container {}", container_id);

    // The released IP is needed later for mesh-route cleanup; look it up
    // before touching the backend.
    let mut pod_ip = None;
    match select_backend(conf, ipam_root, &crate::config::node_name()) {
        Ok(backend) => {
            pod_ip = backend.get_ip_by_container_id(&container_id);
            let released = match (&backend, &identity) {
                (IpamBackend::Native(manager), None) => {
                    // No pod identity survived; fall back to the record the
                    // container ID points at.
                    match manager.get_allocation_by_container_id(&container_id) {
                        Some(record) => {
                            manager
                                .release_ip(&record.pod_namespace, &record.pod_name)
                                .await
                        }
                        None => Ok(()),
                    }
                }
                (_, Some(identity)) => {
                    backend
                        .release(&identity.namespace, &identity.name, &container_id)
                        .await
                }
                (IpamBackend::HostLocal(_), None) => {
                    backend.release("", "", &container_id).await
                }
            };
            if let Err(e) = released {
                warn!("IP release failed, continuing teardown: {}", e);
            }
            backend.flush().await;
        }
        Err(e) => warn!("cannot open IPAM backend, continuing teardown: {}", e),
    }

    let host_ifname = host_ifname_for_container(&container_id);
    if let Err(e) = netlink::cleanup_veth_pair(&host_ifname).await {
        warn!("veth cleanup failed: {}", e);
    }
    if let Err(e) = netlink::cleanup_host_route(&host_ifname).await {
        warn!("host route cleanup failed: {}", e);
    }

    if netlink::detect_mesh_interface(conf.tailscale_nic.as_deref()).is_some() {
        if let Some(ip) = pod_ip {
            if let Err(e) = netlink::delete_pod_routes(ip).await {
                warn!("mesh route cleanup for {} failed: {}", ip, e);
            }
        }
    }

    Ok(())
}

pub async fn cmd_check(conf: &NetConf, env: &CniEnv) -> Result<()> {
    if env.netns.as_os_str().is_empty() {
        anyhow::bail!("CNI_NETNS is not set");
    }
    // With a mesh NIC in play, default-route ownership belongs to the
    // mesh, not to eth0.
    let expect_default =
        netlink::detect_mesh_interface(conf.tailscale_nic.as_deref()).is_none();
    netlink::check_pod_interface(&env.netns, expect_default).await
}

/// Build the ADD result document.
pub fn compose_result(
    conf: &NetConf,
    ip: std::net::Ipv4Addr,
    prefix_len: u8,
    gateway: std::net::Ipv4Addr,
    host_ifname: &str,
    netns: &Path,
) -> CniResult {
    let service_cidr = conf.service_cidr().ok().flatten();
    let dns = assemble_dns(conf, service_cidr);

    CniResult {
        cni_version: if conf.cni_version.is_empty() {
            super::types::DEFAULT_CNI_VERSION.to_string()
        } else {
            conf.cni_version.clone()
        },
        interfaces: vec![
            CniInterface {
                name: host_ifname.to_string(),
                mac: HOST_VETH_MAC_STR.to_string(),
                sandbox: None,
            },
            CniInterface {
                name: POD_IFNAME.to_string(),
                mac: String::new(),
                sandbox: Some(netns.display().to_string()),
            },
        ],
        ips: vec![CniIp {
            address: format!("{}/{}", ip, prefix_len),
            gateway: Some(gateway.into()),
            interface: Some(1),
        }],
        routes: vec![RouteEntry {
            dst: "0.0.0.0/0".to_string(),
            gw: Some(gateway.into()),
        }],
        dns,
    }
}

async fn rollback_allocation(backend: &IpamBackend, namespace: &str, name: &str, cid: &str) {
    if let Err(e) = backend.release(namespace, name, cid).await {
        warn!("rollback: IP release failed: {}", e);
    }
    backend.flush().await;
}

async fn rollback_veth(host_ifname: &str) {
    if let Err(e) = netlink::cleanup_veth_pair(host_ifname).await {
        warn!("rollback: veth cleanup failed: {}", e);
    }
}

async fn rollback_host_route(host_ifname: &str) {
    if let Err(e) = netlink::cleanup_host_route(host_ifname).await {
        warn!("rollback: host route cleanup failed: {}", e);
    }
}

/// Best-effort pod-ready notification to the co-located daemon.
async fn notify_daemon(
    namespace: &str,
    name: &str,
    container_id: &str,
    pod_ip: &std::net::Ipv4Addr,
    pod_cidr: &ipnet::Ipv4Net,
) {
    let socket = std::env::var("HEADCNI_DAEMON_SOCKET")
        .unwrap_or_else(|_| DEFAULT_DAEMON_SOCKET.to_string());
    let request = NotifyRequest {
        request_type: REQUEST_POD_READY.to_string(),
        namespace: namespace.to_string(),
        pod_name: name.to_string(),
        container_id: container_id.to_string(),
        pod_ip: pod_ip.to_string(),
        local_pool: pod_cidr.to_string(),
    };
    match notify::notify_pod_ready(Path::new(&socket), &request).await {
        Ok(()) => debug!("daemon acknowledged pod-ready for {}/{}", namespace, name),
        Err(e) => debug!("pod-ready notification skipped: {}", e),
    }
}
