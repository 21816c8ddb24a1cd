//! Deterministic interface naming
//!
//! Host-end veth names are derived from the container ID so a DEL after a
//! crashed ADD can still find the interface. Workload-derived names hash
//! the pod identity instead, for callers that do not hold a container ID.

use sha1::{Digest, Sha1};

/// Kernel limit (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

const VETH_PREFIX: &str = "veth";

/// Suffix used when the container ID sanitizes down to nothing.
const FALLBACK_SUFFIX: &str = "headcni0";

/// Derive the host-end interface name from a container ID.
///
/// The ID is stripped to alphanumerics, truncated to 11 characters, and
/// prefixed with `veth`, keeping the result within the kernel's 15-char
/// bound and guaranteeing a leading letter.
pub fn host_ifname_for_container(container_id: &str) -> String {
    let sanitized: String = container_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_IFNAME_LEN - VETH_PREFIX.len())
        .collect();

    if sanitized.is_empty() {
        return format!("{}{}", VETH_PREFIX, FALLBACK_SUFFIX);
    }
    format!("{}{}", VETH_PREFIX, sanitized)
}

/// Derive a veth name from the workload identity:
/// `veth` + first 11 hex characters of `sha1(namespace + "." + pod)`.
pub fn veth_name_for_workload(namespace: &str, pod: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b".");
    hasher.update(pod.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", VETH_PREFIX, &digest[..MAX_IFNAME_LEN - VETH_PREFIX.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_ifname_from_container_id() {
        assert_eq!(host_ifname_for_container("abc123def456"), "vethabc123def45");
    }

    #[test]
    fn test_host_ifname_strips_non_alphanumerics() {
        assert_eq!(
            host_ifname_for_container("ab-c1.23:def456789"),
            "vethabc123def45"
        );
    }

    #[test]
    fn test_host_ifname_empty_id_falls_back() {
        let name = host_ifname_for_container("");
        assert_eq!(name, "vethheadcni0");
        assert!(name.len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn test_host_ifname_bounded() {
        let name = host_ifname_for_container(&"f".repeat(64));
        assert_eq!(name.len(), MAX_IFNAME_LEN);
    }

    #[test]
    fn test_workload_name_shape() {
        let name = veth_name_for_workload("default", "nginx");
        assert_eq!(name.len(), MAX_IFNAME_LEN);
        assert!(name.starts_with("veth"));
        assert!(name.chars().next().unwrap().is_ascii_lowercase());
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_workload_name_deterministic_and_distinct() {
        let a = veth_name_for_workload("default", "nginx");
        let b = veth_name_for_workload("default", "nginx");
        let c = veth_name_for_workload("kube-system", "nginx");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
