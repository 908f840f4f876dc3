//! SSRF protection for outbound HTTP.
//!
//! Two layers, both required: [`NetworkSandbox::validate_url`] checks the
//! URL up front, and [`SafeResolver`] re-validates at dial time so a DNS
//! answer that changes between validation and connect (rebinding) still
//! cannot reach a private address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;
use tokio::net::{TcpStream, lookup_host};

use crate::error::SecurityError;

/// Guards outbound network access against private and reserved ranges.
pub struct NetworkSandbox {
    forbidden: Vec<IpNet>,
}

impl Default for NetworkSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSandbox {
    pub fn new() -> Self {
        let forbidden = [
            // IPv4
            "0.0.0.0/8",
            "10.0.0.0/8",
            "100.64.0.0/10",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "198.18.0.0/15",
            "224.0.0.0/4",
            "240.0.0.0/4",
            "255.255.255.255/32",
            // IPv6
            "::/128",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
            "ff00::/8",
        ]
        .iter()
        .map(|net| net.parse().expect("static CIDR literal"))
        .collect();
        Self { forbidden }
    }

    /// Sandbox with a caller-supplied denylist. The default list covers
    /// every private and reserved range; narrowing it is for controlled
    /// environments (tests, air-gapped labs) only.
    pub fn with_forbidden(forbidden: Vec<IpNet>) -> Self {
        Self { forbidden }
    }

    /// Check a single address. IPv4-mapped IPv6 addresses are normalized
    /// to IPv4 first so `::ffff:10.0.0.1` hits the `10.0.0.0/8` block.
    pub fn validate_ip(&self, ip: IpAddr) -> Result<(), SecurityError> {
        let canonical = ip.to_canonical();
        for net in &self.forbidden {
            if net.contains(&canonical) {
                return Err(SecurityError::SsrfBlocked(format!(
                    "address {canonical} is in forbidden range {net}"
                )));
            }
        }
        Ok(())
    }

    /// Validate a URL string for outbound use.
    ///
    /// Fails when the scheme is not http/https, the host is missing, the
    /// host is a forbidden literal IP, or DNS resolution fails or yields
    /// any forbidden address. The resolution result is discarded; dialing
    /// must go through [`SafeResolver`] or [`Self::safe_dial`].
    pub async fn validate_url(&self, raw: &str) -> Result<(), SecurityError> {
        let url = url::Url::parse(raw)
            .map_err(|e| SecurityError::SsrfBlocked(format!("invalid URL {raw:?}: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SecurityError::SsrfBlocked(format!(
                    "scheme {other:?} is not allowed"
                )));
            }
        }

        let host = url
            .host()
            .ok_or_else(|| SecurityError::SsrfBlocked(format!("URL {raw:?} has no host")))?;

        match host {
            url::Host::Ipv4(ip) => self.validate_ip(IpAddr::V4(ip)),
            url::Host::Ipv6(ip) => self.validate_ip(IpAddr::V6(ip)),
            url::Host::Domain(domain) => {
                let port = url.port_or_known_default().unwrap_or(443);
                let addrs: Vec<SocketAddr> = lookup_host((domain, port))
                    .await
                    .map_err(|e| {
                        SecurityError::SsrfBlocked(format!("cannot resolve {domain}: {e}"))
                    })?
                    .collect();
                if addrs.is_empty() {
                    return Err(SecurityError::SsrfBlocked(format!(
                        "{domain} resolved to no addresses"
                    )));
                }
                for addr in &addrs {
                    self.validate_ip(addr.ip())?;
                }
                Ok(())
            }
        }
    }

    /// Resolve once, validate every returned address, and connect to the
    /// first one by literal IP. Immune to rebinding between validate and
    /// dial because the dialed address is the validated address.
    pub async fn safe_dial(&self, addr: &str) -> Result<TcpStream, SecurityError> {
        let addrs: Vec<SocketAddr> = lookup_host(addr)
            .await
            .map_err(|e| SecurityError::SsrfBlocked(format!("cannot resolve {addr}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(SecurityError::SsrfBlocked(format!(
                "{addr} resolved to no addresses"
            )));
        }
        for candidate in &addrs {
            self.validate_ip(candidate.ip())?;
        }
        let target = addrs[0];
        TcpStream::connect(target)
            .await
            .map_err(|e| SecurityError::SsrfBlocked(format!("dial {target} failed: {e}")))
    }
}

/// DNS resolver for `reqwest` that filters forbidden addresses.
///
/// Install with `ClientBuilder::dns_resolver` so every request the client
/// makes can only connect to addresses that passed validation.
pub struct SafeResolver {
    sandbox: Arc<NetworkSandbox>,
}

impl SafeResolver {
    pub fn new(sandbox: Arc<NetworkSandbox>) -> Self {
        Self { sandbox }
    }

    /// Build an HTTP client whose dials are confined by `sandbox`.
    pub fn client(sandbox: Arc<NetworkSandbox>) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .dns_resolver(Arc::new(Self::new(sandbox)))
            .build()
    }
}

impl reqwest::dns::Resolve for SafeResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let sandbox = Arc::clone(&self.sandbox);
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();
            for addr in &addrs {
                if let Err(e) = sandbox.validate_ip(addr.ip()) {
                    return Err(Box::new(std::io::Error::other(e.to_string()))
                        as Box<dyn std::error::Error + Send + Sync>);
                }
            }
            let iter: Box<dyn Iterator<Item = SocketAddr> + Send> = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_loopback_literal() {
        let sandbox = NetworkSandbox::new();
        let err = sandbox.validate_url("http://127.0.0.1/").await.unwrap_err();
        assert!(matches!(err, SecurityError::SsrfBlocked(_)));
    }

    #[tokio::test]
    async fn blocks_ipv4_mapped_ipv6() {
        let sandbox = NetworkSandbox::new();
        let err = sandbox
            .validate_url("http://[::ffff:10.0.0.1]/")
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::SsrfBlocked(_)));
    }

    #[tokio::test]
    async fn blocks_private_and_link_local() {
        let sandbox = NetworkSandbox::new();
        for url in [
            "http://10.1.2.3/",
            "http://172.16.0.1/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
            "http://[fe80::1]/",
        ] {
            assert!(
                sandbox.validate_url(url).await.is_err(),
                "{url} should be blocked"
            );
        }
    }

    #[tokio::test]
    async fn allows_public_literal() {
        let sandbox = NetworkSandbox::new();
        sandbox.validate_url("https://1.1.1.1/").await.unwrap();
        sandbox.validate_url("https://8.8.8.8/dns").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_scheme_and_empty_host() {
        let sandbox = NetworkSandbox::new();
        assert!(sandbox.validate_url("ftp://example.com/").await.is_err());
        assert!(sandbox.validate_url("file:///etc/passwd").await.is_err());
        assert!(sandbox.validate_url("http://").await.is_err());
    }

    #[test]
    fn validate_ip_covers_broadcast_and_multicast() {
        let sandbox = NetworkSandbox::new();
        assert!(sandbox.validate_ip("255.255.255.255".parse().unwrap()).is_err());
        assert!(sandbox.validate_ip("224.0.0.1".parse().unwrap()).is_err());
        assert!(sandbox.validate_ip("100.64.0.1".parse().unwrap()).is_err());
        assert!(sandbox.validate_ip("9.9.9.9".parse().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn safe_dial_refuses_loopback() {
        let sandbox = NetworkSandbox::new();
        let err = sandbox.safe_dial("127.0.0.1:80").await.unwrap_err();
        assert!(matches!(err, SecurityError::SsrfBlocked(_)));
    }
}
