//! Kernel networking via netlink
//!
//! Creates veth pairs, migrates one end into the pod namespace, programs
//! addresses and routes on both sides, and tears everything down again.
//! Holds no state of its own; the kernel is the serialization boundary.

pub mod name;
pub mod netns;

use anyhow::Result;
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

pub use name::{host_ifname_for_container, veth_name_for_workload, MAX_IFNAME_LEN};
pub use netns::with_netns;

/// Pod-side interface name; fixed by convention.
pub const POD_IFNAME: &str = "eth0";

/// Default pod MTU, leaving room for overlay encapsulation.
pub const DEFAULT_MTU: u32 = 1280;

/// Deterministic MAC for the host end of every veth pair, keeping
/// neighbor entries stable across pod restarts.
pub const HOST_VETH_MAC: [u8; 6] = [0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE];

/// Interface-name prefixes that identify the mesh NIC.
const MESH_IF_PREFIXES: &[&str] = &["tailscale", "headcni"];

/// Warn when a node carries more interfaces than this.
const INTERFACE_COUNT_WARN: usize = 1000;

/// Everything needed to program `eth0` inside the pod namespace.
#[derive(Debug, Clone)]
pub struct PodNetConfig {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u32,
    pub gateway: Ipv4Addr,
    pub service_cidr: Option<Ipv4Net>,
    pub enable_ipv6: bool,
}

/// Derive the pod's IPv6 address by embedding the four IPv4 octets into
/// `fd00::` at byte offsets 8-11.
pub fn derive_ipv6(ipv4: Ipv4Addr) -> Ipv6Addr {
    let mut bytes = [0u8; 16];
    bytes[0] = 0xfd;
    bytes[8..12].copy_from_slice(&ipv4.octets());
    Ipv6Addr::from(bytes)
}

/// Resolve the mesh-facing interface: an explicit override wins, else the
/// first interface matching a known mesh prefix.
pub fn detect_mesh_interface(override_name: Option<&str>) -> Option<String> {
    if let Some(name) = override_name {
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mut candidates: Vec<String> = entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| MESH_IF_PREFIXES.iter().any(|p| n.starts_with(p)))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Whether an interface exists in the host namespace.
pub fn interface_exists(name: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", name)).exists()
}

/// Snapshot of host networking capacity, for diagnostics.
#[derive(Debug, Default)]
pub struct SystemResourceReport {
    pub interface_count: usize,
    pub duplicate_names: Vec<String>,
    pub ip_forward: Option<String>,
    pub somaxconn: Option<String>,
}

/// Enumerate interfaces and sample a few kernel tunables, warning on
/// anything unusual. Never fails the caller.
pub fn check_system_resources() -> SystemResourceReport {
    use std::collections::HashSet;
    use tracing::warn;

    let mut report = SystemResourceReport::default();

    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        let mut seen = HashSet::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            report.interface_count += 1;
            if !seen.insert(name.clone()) {
                report.duplicate_names.push(name);
            }
        }
    }

    if report.interface_count > INTERFACE_COUNT_WARN {
        warn!(
            "host carries {} network interfaces; veth leakage suspected",
            report.interface_count
        );
    }
    for dup in &report.duplicate_names {
        warn!("duplicate interface name observed: {}", dup);
    }

    report.ip_forward = std::fs::read_to_string("/proc/sys/net/ipv4/ip_forward")
        .ok()
        .map(|s| s.trim().to_string());
    report.somaxconn = std::fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .map(|s| s.trim().to_string());

    if report.ip_forward.as_deref() == Some("0") {
        warn!("net.ipv4.ip_forward is disabled; cross-node pod traffic will not route");
    }

    report
}

#[cfg(target_os = "linux")]
mod ops {
    use super::*;
    use anyhow::{anyhow, bail, Context};
    use futures::TryStreamExt;
    use netlink_packet_route::link::LinkFlag;
    use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteScope};
    use netlink_packet_route::AddressFamily;
    use rtnetlink::{Handle, IpVersion};
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use std::time::Duration;
    use tracing::{debug, warn};

    /// Attempts before a veth-create race is treated as a hard failure.
    const VETH_CREATE_ATTEMPTS: u32 = 3;

    fn connect() -> Result<Handle> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("failed to open netlink socket")?;
        tokio::spawn(connection);
        Ok(handle)
    }

    fn is_exist_err(e: &rtnetlink::Error) -> bool {
        matches!(e, rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -libc::EEXIST)
    }

    async fn link_index(handle: &Handle, ifname: &str) -> Result<Option<u32>> {
        let mut links = handle.link().get().match_name(ifname.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
            Err(e) => Err(e).context(format!("failed to look up interface {}", ifname)),
        }
    }

    /// Create the veth pair inside the pod namespace and migrate the host
    /// end back out by file descriptor.
    pub async fn create_veth_pair(
        netns_path: &Path,
        pod_ifname: &str,
        host_ifname: &str,
    ) -> Result<()> {
        // A stale host end from a crashed ADD shadows the new pair; delete
        // it first and give the kernel a moment to reap.
        let handle = connect()?;
        if let Some(index) = link_index(&handle, host_ifname).await? {
            debug!("deleting stale host interface {} (index {})", host_ifname, index);
            handle
                .link()
                .del(index)
                .execute()
                .await
                .with_context(|| format!("failed to delete stale {}", host_ifname))?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let host_ns =
            File::open("/proc/self/ns/net").context("failed to open host network namespace")?;

        let pod_ifname = pod_ifname.to_string();
        let host_ifname = host_ifname.to_string();
        with_netns(netns_path, move || async move {
            let handle = connect()?;
            let mut delay = Duration::from_millis(100);

            for attempt in 1..=VETH_CREATE_ATTEMPTS {
                match handle
                    .link()
                    .add()
                    .veth(host_ifname.clone(), pod_ifname.clone())
                    .execute()
                    .await
                {
                    Ok(()) => break,
                    Err(e) if is_exist_err(&e) && attempt < VETH_CREATE_ATTEMPTS => {
                        warn!(
                            "veth {}/{} already exists (attempt {}), clearing and retrying",
                            host_ifname, pod_ifname, attempt
                        );
                        for name in [host_ifname.as_str(), pod_ifname.as_str()] {
                            if let Some(index) = link_index(&handle, name).await? {
                                let _ = handle.link().del(index).execute().await;
                            }
                        }
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    Err(e) => {
                        return Err(e).context(format!(
                            "failed to create veth pair {}/{}",
                            host_ifname, pod_ifname
                        ))
                    }
                }
            }

            let host_index = link_index(&handle, &host_ifname)
                .await?
                .ok_or_else(|| anyhow!("host end {} vanished after create", host_ifname))?;
            let pod_index = link_index(&handle, &pod_ifname)
                .await?
                .ok_or_else(|| anyhow!("pod end {} vanished after create", pod_ifname))?;

            handle
                .link()
                .set(host_index)
                .address(HOST_VETH_MAC.to_vec())
                .execute()
                .await
                .context("failed to pin host-end MAC")?;

            handle.link().set(pod_index).up().execute().await?;
            handle.link().set(host_index).up().execute().await?;

            handle
                .link()
                .set(host_index)
                .setns_by_fd(host_ns.as_raw_fd())
                .execute()
                .await
                .with_context(|| format!("failed to move {} to host namespace", host_ifname))?;

            Ok(())
        })
        .await
    }

    /// Program `eth0` inside the pod namespace: MTU, address, routes, and
    /// the optional derived IPv6.
    pub async fn setup_pod_network_ns(netns_path: &Path, cfg: &PodNetConfig) -> Result<()> {
        let cfg = cfg.clone();
        with_netns(netns_path, move || async move {
            let handle = connect()?;
            let index = link_index(&handle, POD_IFNAME)
                .await?
                .ok_or_else(|| anyhow!("{} not found in pod namespace", POD_IFNAME))?;

            handle
                .link()
                .set(index)
                .mtu(cfg.mtu)
                .execute()
                .await
                .context("failed to set pod MTU")?;

            add_address(&handle, index, cfg.ip.into(), cfg.prefix_len).await?;

            handle.link().set(index).up().execute().await?;

            // On-link /32 to the gateway, then the default route through it.
            let gw_route = handle
                .route()
                .add()
                .v4()
                .destination_prefix(cfg.gateway, 32)
                .output_interface(index)
                .scope(RouteScope::Link);
            tolerate_exists(gw_route.execute().await, "gateway /32")?;

            let default_route = handle
                .route()
                .add()
                .v4()
                .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                .gateway(cfg.gateway)
                .output_interface(index);
            tolerate_exists(default_route.execute().await, "default route")?;

            if let Some(service_cidr) = cfg.service_cidr {
                let svc_route = handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(service_cidr.network(), service_cidr.prefix_len())
                    .gateway(cfg.gateway)
                    .output_interface(index);
                tolerate_exists(svc_route.execute().await, "service route")?;
            }

            if cfg.enable_ipv6 {
                let v6 = derive_ipv6(cfg.ip);
                add_address(&handle, index, v6.into(), 64).await?;
                let v6_default = handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(Ipv6Addr::UNSPECIFIED, 0)
                    .gateway(derive_ipv6(cfg.gateway))
                    .output_interface(index);
                tolerate_exists(v6_default.execute().await, "IPv6 default route")?;
            }

            Ok(())
        })
        .await
    }

    async fn add_address(
        handle: &Handle,
        index: u32,
        addr: std::net::IpAddr,
        prefix_len: u8,
    ) -> Result<()> {
        match handle.address().add(index, addr, prefix_len).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_exist_err(&e) => {
                debug!("address {} already present", addr);
                Ok(())
            }
            Err(e) => Err(e).context(format!("failed to add address {}", addr)),
        }
    }

    fn tolerate_exists(result: Result<(), rtnetlink::Error>, what: &str) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_exist_err(&e) => {
                debug!("{} already present", what);
                Ok(())
            }
            Err(e) => Err(e).context(format!("failed to add {}", what)),
        }
    }

    /// Host-side /32 to the pod via the host end of its veth pair.
    pub async fn setup_host_route(pod_ip: Ipv4Addr, host_ifname: &str) -> Result<()> {
        route_via_interface(pod_ip, host_ifname).await
    }

    /// Host-side /32 to the pod via the mesh interface, so return traffic
    /// from remote nodes stays inside the overlay.
    pub async fn add_mesh_route(pod_ip: Ipv4Addr, mesh_ifname: &str) -> Result<()> {
        route_via_interface(pod_ip, mesh_ifname).await
    }

    async fn route_via_interface(pod_ip: Ipv4Addr, ifname: &str) -> Result<()> {
        let handle = connect()?;
        let index = link_index(&handle, ifname)
            .await?
            .ok_or_else(|| anyhow!("interface {} not found", ifname))?;

        handle.link().set(index).up().execute().await?;

        let route = handle
            .route()
            .add()
            .v4()
            .destination_prefix(pod_ip, 32)
            .output_interface(index)
            .scope(RouteScope::Link);
        tolerate_exists(route.execute().await, "pod /32")
    }

    /// Delete the host end; the pod end dies with its namespace. Missing
    /// interfaces are a successful no-op.
    pub async fn cleanup_veth_pair(host_ifname: &str) -> Result<()> {
        let handle = connect()?;
        match link_index(&handle, host_ifname).await? {
            Some(index) => handle
                .link()
                .del(index)
                .execute()
                .await
                .with_context(|| format!("failed to delete {}", host_ifname)),
            None => {
                debug!("{} already gone", host_ifname);
                Ok(())
            }
        }
    }

    /// Delete every route referencing the host end. Missing interfaces are
    /// a successful no-op.
    pub async fn cleanup_host_route(host_ifname: &str) -> Result<()> {
        let handle = connect()?;
        let index = match link_index(&handle, host_ifname).await? {
            Some(index) => index,
            None => {
                debug!("{} already gone, no routes to clean", host_ifname);
                return Ok(());
            }
        };

        let mut routes = handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = routes.try_next().await? {
            let references = msg.attributes.iter().any(|attr| match attr {
                RouteAttribute::Oif(oif) => *oif == index,
                _ => false,
            });
            if references {
                if let Err(e) = handle.route().del(msg).execute().await {
                    warn!("failed to delete route via {}: {}", host_ifname, e);
                }
            }
        }
        Ok(())
    }

    /// Delete every host /32 whose destination is the released pod IP.
    pub async fn delete_pod_routes(pod_ip: Ipv4Addr) -> Result<()> {
        let handle = connect()?;
        let mut routes = handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = routes.try_next().await? {
            if msg.header.destination_prefix_length != 32 {
                continue;
            }
            let matches = msg.attributes.iter().any(|attr| {
                matches!(
                    attr,
                    RouteAttribute::Destination(RouteAddress::Inet(dst)) if *dst == pod_ip
                )
            });
            if matches {
                if let Err(e) = handle.route().del(msg).execute().await {
                    warn!("failed to delete /32 for {}: {}", pod_ip, e);
                }
            }
        }
        Ok(())
    }

    /// CHECK: `eth0` exists, is up, carries an IPv4 address, and owns a
    /// default route unless the mesh interface does.
    pub async fn check_pod_interface(netns_path: &Path, expect_default_route: bool) -> Result<()> {
        with_netns(netns_path, move || async move {
            let handle = connect()?;

            let mut links = handle
                .link()
                .get()
                .match_name(POD_IFNAME.to_string())
                .execute();
            let link = match links.try_next().await {
                Ok(Some(msg)) => msg,
                _ => bail!("{} not found in pod namespace", POD_IFNAME),
            };
            let index = link.header.index;
            if !link.header.flags.contains(&LinkFlag::Up) {
                bail!("{} is down", POD_IFNAME);
            }

            let mut addresses = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();
            let mut has_v4 = false;
            while let Some(msg) = addresses.try_next().await? {
                if msg.header.family == AddressFamily::Inet {
                    has_v4 = true;
                    break;
                }
            }
            if !has_v4 {
                bail!("{} carries no IPv4 address", POD_IFNAME);
            }

            if expect_default_route {
                let mut routes = handle.route().get(IpVersion::V4).execute();
                let mut has_default = false;
                while let Some(msg) = routes.try_next().await? {
                    if msg.header.destination_prefix_length == 0 {
                        has_default = true;
                        break;
                    }
                }
                if !has_default {
                    bail!("pod namespace has no default route");
                }
            }

            Ok(())
        })
        .await
    }
}

#[cfg(not(target_os = "linux"))]
mod ops {
    use super::*;

    pub async fn create_veth_pair(_: &Path, _: &str, _: &str) -> Result<()> {
        anyhow::bail!("veth wiring requires Linux")
    }
    pub async fn setup_pod_network_ns(_: &Path, _: &PodNetConfig) -> Result<()> {
        anyhow::bail!("pod namespace programming requires Linux")
    }
    pub async fn setup_host_route(_: Ipv4Addr, _: &str) -> Result<()> {
        anyhow::bail!("host routes require Linux")
    }
    pub async fn add_mesh_route(_: Ipv4Addr, _: &str) -> Result<()> {
        anyhow::bail!("mesh routes require Linux")
    }
    pub async fn cleanup_veth_pair(_: &str) -> Result<()> {
        Ok(())
    }
    pub async fn cleanup_host_route(_: &str) -> Result<()> {
        Ok(())
    }
    pub async fn delete_pod_routes(_: Ipv4Addr) -> Result<()> {
        Ok(())
    }
    pub async fn check_pod_interface(_: &Path, _: bool) -> Result<()> {
        anyhow::bail!("pod checks require Linux")
    }
}

pub use ops::{
    add_mesh_route, check_pod_interface, cleanup_host_route, cleanup_veth_pair, create_veth_pair,
    delete_pod_routes, setup_host_route, setup_pod_network_ns,
};
