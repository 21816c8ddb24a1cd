//! CNI command plane
//!
//! ADD/DEL/CHECK on top of the IPAM, netlink, and mesh subsystems, plus
//! the wire types the runtime reads back.

pub mod args;
pub mod command;
pub mod types;

pub use args::{parse_cni_args, CniEnv, PodIdentity};
pub use command::{
    cmd_add, cmd_check, cmd_del, compose_result, select_backend, ADD_TIMEOUT, DEL_TIMEOUT,
};
pub use types::{
    assemble_dns, version_reply, CniDns, CniError, CniInterface, CniIp, CniResult, RouteEntry,
    DEFAULT_CNI_VERSION, ERR_INTERNAL, ERR_INVALID_NETWORK_CONFIG, ERR_TRY_AGAIN_LATER,
    SUPPORTED_CNI_VERSIONS,
};
