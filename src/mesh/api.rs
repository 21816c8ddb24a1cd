//! Mesh daemon wire types
//!
//! Status and preference documents exchanged with the mesh daemon over its
//! control socket. Preference updates are masked: only fields whose `*_set`
//! bit is true are applied by the daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// The daemon's finite backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendState {
    #[default]
    Stopped,
    Starting,
    NeedsLogin,
    Running,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::NeedsLogin => "NeedsLogin",
            Self::Running => "Running",
        };
        f.write_str(s)
    }
}

/// This node as the daemon sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfStatus {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub online: bool,
}

/// One mesh peer, for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerStatus {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub online: bool,
}

/// Full daemon status document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub backend_state: BackendState,
    #[serde(default)]
    pub have_node_key: bool,
    /// Non-empty only when manual interactive auth would be required,
    /// meaning the pre-shared key was rejected.
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub self_status: SelfStatus,
    #[serde(default)]
    pub peers: Vec<PeerStatus>,
    #[serde(default)]
    pub version: String,
}

impl Status {
    /// Terminal success for the connect state machine.
    pub fn fully_connected(&self) -> bool {
        self.backend_state == BackendState::Running
            && !self.self_status.ips.is_empty()
            && self.self_status.online
    }
}

/// The daemon's persisted preference bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prefs {
    #[serde(default)]
    pub control_url: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub accept_routes: bool,
    #[serde(default)]
    pub shields_up: bool,
    #[serde(default)]
    pub advertise_routes: Vec<String>,
    #[serde(default)]
    pub want_running: bool,
    #[serde(default)]
    pub logged_out: bool,
    #[serde(default)]
    pub corp_dns: bool,
}

impl Prefs {
    pub fn advertise_set(&self) -> BTreeSet<String> {
        self.advertise_routes.iter().cloned().collect()
    }
}

/// Partial preference update; only fields with their `*_set` bit are
/// applied atomically at the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskedPrefs {
    #[serde(default)]
    pub control_url_set: bool,
    #[serde(default)]
    pub control_url: String,

    #[serde(default)]
    pub hostname_set: bool,
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub accept_routes_set: bool,
    #[serde(default)]
    pub accept_routes: bool,

    #[serde(default)]
    pub shields_up_set: bool,
    #[serde(default)]
    pub shields_up: bool,

    #[serde(default)]
    pub advertise_routes_set: bool,
    #[serde(default)]
    pub advertise_routes: Vec<String>,

    #[serde(default)]
    pub want_running_set: bool,
    #[serde(default)]
    pub want_running: bool,

    #[serde(default)]
    pub logged_out_set: bool,
    #[serde(default)]
    pub logged_out: bool,

    #[serde(default)]
    pub corp_dns_set: bool,
    #[serde(default)]
    pub corp_dns: bool,
}

impl MaskedPrefs {
    pub fn is_empty(&self) -> bool {
        !(self.control_url_set
            || self.hostname_set
            || self.accept_routes_set
            || self.shields_up_set
            || self.advertise_routes_set
            || self.want_running_set
            || self.logged_out_set
            || self.corp_dns_set)
    }

    pub fn control_url(mut self, url: &str) -> Self {
        self.control_url_set = true;
        self.control_url = url.to_string();
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname_set = true;
        self.hostname = hostname.to_string();
        self
    }

    pub fn accept_routes(mut self, accept: bool) -> Self {
        self.accept_routes_set = true;
        self.accept_routes = accept;
        self
    }

    pub fn shields_up(mut self, up: bool) -> Self {
        self.shields_up_set = true;
        self.shields_up = up;
        self
    }

    pub fn advertise_routes(mut self, routes: Vec<String>) -> Self {
        self.advertise_routes_set = true;
        self.advertise_routes = routes;
        self
    }

    pub fn want_running(mut self, want: bool) -> Self {
        self.want_running_set = true;
        self.want_running = want;
        self
    }

    pub fn logged_out(mut self, out: bool) -> Self {
        self.logged_out_set = true;
        self.logged_out = out;
        self
    }

    pub fn corp_dns(mut self, on: bool) -> Self {
        self.corp_dns_set = true;
        self.corp_dns = on;
        self
    }

    /// Apply to a preference bag the way the daemon would.
    pub fn apply_to(&self, prefs: &mut Prefs) {
        if self.control_url_set {
            prefs.control_url = self.control_url.clone();
        }
        if self.hostname_set {
            prefs.hostname = self.hostname.clone();
        }
        if self.accept_routes_set {
            prefs.accept_routes = self.accept_routes;
        }
        if self.shields_up_set {
            prefs.shields_up = self.shields_up;
        }
        if self.advertise_routes_set {
            prefs.advertise_routes = self.advertise_routes.clone();
        }
        if self.want_running_set {
            prefs.want_running = self.want_running;
        }
        if self.logged_out_set {
            prefs.logged_out = self.logged_out;
        }
        if self.corp_dns_set {
            prefs.corp_dns = self.corp_dns;
        }
    }
}

/// The fields the connect state machine steers toward.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefsTarget {
    pub control_url: String,
    pub hostname: String,
    pub accept_routes: bool,
    pub shields_up: bool,
    pub advertise_routes: Vec<String>,
}

impl PrefsTarget {
    /// Human-readable reasons the live prefs diverge from this target.
    /// Empty means the live state is reusable. Advertised routes compare
    /// as a set; ordering differences are not a mismatch.
    pub fn diff_reasons(&self, live: &Prefs) -> Vec<String> {
        let mut reasons = Vec::new();
        if live.control_url != self.control_url {
            reasons.push(format!(
                "control URL {:?} != {:?}",
                live.control_url, self.control_url
            ));
        }
        if !self.hostname.is_empty() && live.hostname != self.hostname {
            reasons.push(format!("hostname {:?} != {:?}", live.hostname, self.hostname));
        }
        if live.accept_routes != self.accept_routes {
            reasons.push(format!(
                "accept_routes {} != {}",
                live.accept_routes, self.accept_routes
            ));
        }
        let want: BTreeSet<String> = self.advertise_routes.iter().cloned().collect();
        if live.advertise_set() != want {
            reasons.push(format!(
                "advertise_routes {:?} != {:?}",
                live.advertise_routes, self.advertise_routes
            ));
        }
        reasons
    }

    /// Masked update carrying only the fields that diverge from `live`.
    pub fn masked_diff(&self, live: &Prefs) -> MaskedPrefs {
        let mut masked = MaskedPrefs::default();
        if live.control_url != self.control_url {
            masked = masked.control_url(&self.control_url);
        }
        if !self.hostname.is_empty() && live.hostname != self.hostname {
            masked = masked.hostname(&self.hostname);
        }
        if live.accept_routes != self.accept_routes {
            masked = masked.accept_routes(self.accept_routes);
        }
        if live.shields_up != self.shields_up {
            masked = masked.shields_up(self.shields_up);
        }
        let want: BTreeSet<String> = self.advertise_routes.iter().cloned().collect();
        if live.advertise_set() != want {
            masked = masked.advertise_routes(want.into_iter().collect());
        }
        masked
    }
}
