//! HeadCNI - pod networking over a WireGuard mesh
//!
//! A Kubernetes CNI plugin that allocates pod addresses from a node-local
//! CIDR slice, wires veth pairs between the host and pod namespaces, and
//! steers traffic into a mesh overlay coordinated by a self-hosted
//! control plane. The `headcni` binary implements the CNI verbs; the
//! `headcnid` daemon supervises the mesh daemon, keeps it authenticated,
//! advertises the node's pod CIDR, and self-heals common failures.

pub mod cni;
pub mod config;
pub mod health;
pub mod ipam;
pub mod mesh;
pub mod netlink;
pub mod notify;
