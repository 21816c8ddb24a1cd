//! Control-plane reachability probe
//!
//! Three-legged diagnostic (DNS, TCP, HTTP) run while the connect state
//! machine waits on the daemon, so a stuck login can be told apart from a
//! dead control plane. Purely informational; never fails the caller.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

const TCP_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub dns_ok: bool,
    pub tcp_ok: bool,
    pub http_ok: bool,
    pub details: Vec<String>,
}

impl ProbeReport {
    pub fn all_ok(&self) -> bool {
        self.dns_ok && self.tcp_ok && self.http_ok
    }
}

/// Probe the control plane named by `control_url`. Blocking; callers on a
/// runtime should wrap this in `spawn_blocking`.
pub fn probe_control_plane(control_url: &str) -> ProbeReport {
    let mut report = ProbeReport::default();

    let Some((host, port)) = host_port(control_url) else {
        report
            .details
            .push(format!("cannot parse host from {:?}", control_url));
        warn!("control-plane probe: unparseable URL {:?}", control_url);
        return report;
    };

    match (host.as_str(), port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => {
                report.dns_ok = true;
                debug!("control-plane probe: {} resolves to {}", host, addr);

                match TcpStream::connect_timeout(&addr, TCP_TIMEOUT) {
                    Ok(_) => report.tcp_ok = true,
                    Err(e) => report.details.push(format!("tcp {}: {}", addr, e)),
                }
            }
            None => report.details.push(format!("dns {}: no addresses", host)),
        },
        Err(e) => report.details.push(format!("dns {}: {}", host, e)),
    }

    if report.tcp_ok {
        match ureq::get(control_url)
            .timeout(HTTP_TIMEOUT)
            .call()
        {
            Ok(_) => report.http_ok = true,
            // Any HTTP status proves the server is answering.
            Err(ureq::Error::Status(code, _)) => {
                report.http_ok = true;
                debug!("control-plane probe: HTTP status {}", code);
            }
            Err(e) => report.details.push(format!("http: {}", e)),
        }
    }

    if !report.all_ok() {
        warn!(
            "control plane {} unreachable: dns={} tcp={} http={} ({})",
            control_url,
            report.dns_ok,
            report.tcp_ok,
            report.http_ok,
            report.details.join("; ")
        );
    }
    report
}

/// Extract `(host, port)` from an http(s) URL, defaulting the port by
/// scheme.
fn host_port(url: &str) -> Option<(String, u16)> {
    let (default_port, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (443u16, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (80u16, rest)
    } else {
        return None;
    };

    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_parsing() {
        assert_eq!(
            host_port("https://hs.example.com"),
            Some(("hs.example.com".to_string(), 443))
        );
        assert_eq!(
            host_port("http://hs.example.com:8080/admin"),
            Some(("hs.example.com".to_string(), 8080))
        );
        assert_eq!(
            host_port("https://10.0.0.1:443"),
            Some(("10.0.0.1".to_string(), 443))
        );
        assert_eq!(host_port("hs.example.com"), None);
        assert_eq!(host_port("https://"), None);
    }

    #[test]
    fn test_probe_unresolvable_host() {
        let report = probe_control_plane("https://does-not-exist.invalid");
        assert!(!report.dns_ok);
        assert!(!report.tcp_ok);
        assert!(!report.http_ok);
        assert!(!report.details.is_empty());
    }

    #[test]
    fn test_probe_unparseable_url() {
        let report = probe_control_plane("not a url");
        assert!(!report.all_ok());
    }
}
