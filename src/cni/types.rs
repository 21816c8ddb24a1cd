//! CNI result wire types
//!
//! The JSON documents written to stdout (results) and stderr (errors),
//! encoded per the negotiated `cniVersion`, plus the DNS block assembly
//! with nameserver priority reordering.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::config::NetConf;

/// Versions this plugin will negotiate.
pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Fallback when the config does not pin a version.
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// Well-known CNI error codes.
pub const ERR_INVALID_NETWORK_CONFIG: u32 = 7;
pub const ERR_TRY_AGAIN_LATER: u32 = 11;
pub const ERR_INTERNAL: u32 = 999;

/// Cluster DNS addresses recognized when no service CIDR is configured.
const KNOWN_CLUSTER_DNS: &[&str] = &["10.43.0.10", "10.96.0.10", "10.0.0.10"];

/// The mesh hands out addresses from this shared range.
const MESH_CGNAT_RANGE: &str = "100.64.0.0/10";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CniInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CniIp {
    /// `address/prefix` form.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CniDns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl CniDns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// Success result for ADD, per the CNI result schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CniInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<CniIp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteEntry>,
    #[serde(default, skip_serializing_if = "CniDns::is_empty")]
    pub dns: CniDns,
}

/// Error reply, printed to stderr for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CniError {
    pub fn new(cni_version: &str, code: u32, msg: &str, details: Option<String>) -> Self {
        let version = if cni_version.is_empty() {
            DEFAULT_CNI_VERSION
        } else {
            cni_version
        };
        Self {
            cni_version: version.to_string(),
            code,
            msg: msg.to_string(),
            details,
        }
    }
}

/// Reply to the VERSION verb.
pub fn version_reply(cni_version: &str) -> serde_json::Value {
    let version = if cni_version.is_empty() {
        DEFAULT_CNI_VERSION
    } else {
        cni_version
    };
    serde_json::json!({
        "cniVersion": version,
        "supportedVersions": SUPPORTED_CNI_VERSIONS,
    })
}

/// Assemble the result DNS block from the magic-DNS config, reordering
/// nameservers by priority: cluster DNS first, mesh DNS second, anything
/// else last, preserving relative order within each tier.
pub fn assemble_dns(conf: &NetConf, service_cidr: Option<Ipv4Net>) -> CniDns {
    let Some(magic) = conf.magic_dns.as_ref().filter(|m| m.enable) else {
        return CniDns::default();
    };

    CniDns {
        nameservers: order_nameservers(&magic.nameservers, service_cidr),
        domain: if magic.base_domain.is_empty() {
            None
        } else {
            Some(magic.base_domain.clone())
        },
        search: magic.search_domains.clone(),
        options: Vec::new(),
    }
}

fn order_nameservers(nameservers: &[String], service_cidr: Option<Ipv4Net>) -> Vec<String> {
    let mesh_range: Ipv4Net = MESH_CGNAT_RANGE.parse().expect("static CIDR");

    let tier = |ns: &str| -> u8 {
        let Ok(ip) = ns.parse::<Ipv4Addr>() else {
            return 2;
        };
        let in_service = service_cidr.map(|cidr| cidr.contains(&ip)).unwrap_or(false);
        if in_service || KNOWN_CLUSTER_DNS.contains(&ns) {
            0
        } else if mesh_range.contains(&ip) {
            1
        } else {
            2
        }
    };

    let mut ordered: Vec<String> = Vec::with_capacity(nameservers.len());
    for wanted in 0u8..=2 {
        ordered.extend(
            nameservers
                .iter()
                .filter(|ns| tier(ns.as_str()) == wanted)
                .cloned(),
        );
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MagicDnsConf;

    fn conf_with_dns(nameservers: &[&str]) -> NetConf {
        NetConf {
            magic_dns: Some(MagicDnsConf {
                enable: true,
                base_domain: "mesh.example.com".into(),
                nameservers: nameservers.iter().map(|s| s.to_string()).collect(),
                search_domains: vec!["svc.cluster.local".into()],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_nameserver_priority_reordering() {
        let conf = conf_with_dns(&["8.8.8.8", "100.100.100.100", "10.96.0.10"]);
        let dns = assemble_dns(&conf, Some("10.96.0.0/12".parse().unwrap()));
        assert_eq!(
            dns.nameservers,
            vec!["10.96.0.10", "100.100.100.100", "8.8.8.8"]
        );
        assert_eq!(dns.domain.as_deref(), Some("mesh.example.com"));
        assert_eq!(dns.search, vec!["svc.cluster.local"]);
    }

    #[test]
    fn test_known_cluster_dns_recognized_without_service_cidr() {
        let conf = conf_with_dns(&["1.1.1.1", "10.43.0.10"]);
        let dns = assemble_dns(&conf, None);
        assert_eq!(dns.nameservers, vec!["10.43.0.10", "1.1.1.1"]);
    }

    #[test]
    fn test_relative_order_preserved_within_tier() {
        let conf = conf_with_dns(&["9.9.9.9", "8.8.8.8", "100.64.0.2", "100.100.100.100"]);
        let dns = assemble_dns(&conf, None);
        assert_eq!(
            dns.nameservers,
            vec!["100.64.0.2", "100.100.100.100", "9.9.9.9", "8.8.8.8"]
        );
    }

    #[test]
    fn test_disabled_magic_dns_yields_empty_block() {
        let mut conf = conf_with_dns(&["10.96.0.10"]);
        conf.magic_dns.as_mut().unwrap().enable = false;
        assert!(assemble_dns(&conf, None).is_empty());
        assert!(assemble_dns(&NetConf::default(), None).is_empty());
    }

    #[test]
    fn test_non_ip_nameserver_lands_in_last_tier() {
        let conf = conf_with_dns(&["dns.example.com", "10.96.0.10"]);
        let dns = assemble_dns(&conf, Some("10.96.0.0/12".parse().unwrap()));
        assert_eq!(dns.nameservers, vec!["10.96.0.10", "dns.example.com"]);
    }

    #[test]
    fn test_result_serialization_shape() {
        let result = CniResult {
            cni_version: "1.0.0".into(),
            interfaces: vec![CniInterface {
                name: "vethabc123def45".into(),
                mac: "ee:ee:ee:ee:ee:ee".into(),
                sandbox: None,
            }],
            ips: vec![CniIp {
                address: "10.244.1.4/24".into(),
                gateway: Some("10.244.1.1".parse().unwrap()),
                interface: Some(0),
            }],
            routes: vec![RouteEntry {
                dst: "0.0.0.0/0".into(),
                gw: Some("10.244.1.1".parse().unwrap()),
            }],
            dns: CniDns::default(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["ips"][0]["address"], "10.244.1.4/24");
        assert_eq!(json["routes"][0]["dst"], "0.0.0.0/0");
        // Empty DNS must not appear at all.
        assert!(json.get("dns").is_none());
    }

    #[test]
    fn test_error_defaults_version() {
        let err = CniError::new("", ERR_INVALID_NETWORK_CONFIG, "bad config", None);
        assert_eq!(err.cni_version, DEFAULT_CNI_VERSION);
        assert_eq!(err.code, 7);
    }

    #[test]
    fn test_version_reply_lists_supported() {
        let reply = version_reply("0.4.0");
        assert_eq!(reply["cniVersion"], "0.4.0");
        assert!(reply["supportedVersions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "1.0.0"));
    }
}
