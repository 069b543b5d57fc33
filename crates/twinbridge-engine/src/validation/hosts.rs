//! Hostname allow/block checks for connection URIs.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;
use tracing::{debug, warn};

use twinbridge_core::errors::ConnectivityError;
use twinbridge_settings::{HostSettings, SettingsError};

/// Turns a hostname into addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, String>;
}

/// Resolver backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| format!("failed to resolve '{host}': {e}"))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Fixed host table. IP literals resolve to themselves.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: impl Into<String>, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.entries
            .insert(host.into().to_ascii_lowercase(), ips.into_iter().collect());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<IpAddr>, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| format!("unknown host '{host}'"))
    }
}

/// CIDR block such as `10.0.0.0/8` or `fd00::/8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

fn mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p.min(128))),
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, prefix) = match s.trim().split_once('/') {
            Some((n, p)) => (n, Some(p)),
            None => (s.trim(), None),
        };
        let network: IpAddr = network.parse().map_err(|_| format!("bad subnet address in '{s}'"))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| format!("bad prefix length in '{s}'"))?,
            None => max,
        };
        if prefix > max {
            return Err(format!("prefix length {prefix} too large in '{s}'"));
        }
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Addresses a connection must never reach while blocking is enabled.
fn is_restricted(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_restricted_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_restricted_v4(&v4),
            None => is_restricted_v6(v6),
        },
    }
}

fn is_restricted_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
}

fn is_restricted_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || first & 0xfe00 == 0xfc00
        // fe80::/10 link local
        || first & 0xffc0 == 0xfe80
}

fn compile_patterns(field: &str, raw: &[String]) -> Result<Vec<Pattern>, SettingsError> {
    raw.iter()
        .map(|p| {
            Pattern::new(&p.to_ascii_lowercase())
                .map_err(|e| SettingsError::InvalidValue(format!("hosts.{field}: '{p}': {e}")))
        })
        .collect()
}

#[derive(Clone)]
pub struct HostValidator {
    allowed: Vec<Pattern>,
    blocked: Vec<Pattern>,
    subnets: Vec<Subnet>,
    resolver: Arc<dyn HostResolver>,
}

impl fmt::Debug for HostValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostValidator")
            .field("allowed", &self.allowed.len())
            .field("blocked", &self.blocked.len())
            .field("subnets", &self.subnets)
            .finish()
    }
}

impl HostValidator {
    pub fn from_settings(settings: &HostSettings, resolver: Arc<dyn HostResolver>) -> Result<Self, SettingsError> {
        let subnets = settings
            .blocked_subnets
            .iter()
            .map(|s| s.parse::<Subnet>().map_err(|e| SettingsError::InvalidValue(format!("hosts.blockedSubnets: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed: compile_patterns("allowedHostnames", &settings.allowed_hostnames)?,
            blocked: compile_patterns("blockedHostnames", &settings.blocked_hostnames)?,
            subnets,
            resolver,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Blocking is active once any block list is configured.
    pub fn is_blocking_enabled(&self) -> bool {
        !self.blocked.is_empty() || !self.subnets.is_empty()
    }

    pub async fn validate(&self, host: &str, port: u16) -> Result<(), ConnectivityError> {
        let host = host.to_ascii_lowercase();
        if self.allowed.iter().any(|p| p.matches(&host)) {
            debug!(host, "host explicitly allowed");
            return Ok(());
        }
        if !self.is_blocking_enabled() {
            return Ok(());
        }

        let blocked = || ConnectivityError::ConfigurationInvalid(format!("host '{host}' is blocked"));
        if self.blocked.iter().any(|p| p.matches(&host)) {
            warn!(host, "host matches a blocked pattern");
            return Err(blocked());
        }

        let ips = self
            .resolver
            .resolve(&host, port)
            .await
            .map_err(ConnectivityError::ConfigurationInvalid)?;
        if let Some(ip) = ips
            .iter()
            .find(|ip| is_restricted(ip) || self.subnets.iter().any(|s| s.contains(ip)))
        {
            warn!(host, %ip, "host resolves to a blocked address");
            return Err(blocked());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn validator(settings: HostSettings, resolver: StaticResolver) -> HostValidator {
        HostValidator::from_settings(&settings, Arc::new(resolver)).unwrap()
    }

    fn blocking(blocked: &[&str], subnets: &[&str]) -> HostSettings {
        HostSettings {
            allowed_hostnames: Vec::new(),
            blocked_hostnames: blocked.iter().map(|s| s.to_string()).collect(),
            blocked_subnets: subnets.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn subnet_parsing_and_membership() {
        let net: Subnet = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains(&ip("10.20.30.40")));
        assert!(!net.contains(&ip("11.0.0.1")));
        assert!(!net.contains(&ip("::1")));

        let host: Subnet = "192.0.2.7".parse().unwrap();
        assert_eq!(host.to_string(), "192.0.2.7/32");
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("not-an-ip/8".parse::<Subnet>().is_err());

        let v6: Subnet = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(&ip("2001:db8:1::5")));
    }

    #[test]
    fn restricted_addresses() {
        for restricted in ["127.0.0.1", "10.1.2.3", "169.254.0.1", "224.0.0.1", "0.0.0.0", "::1", "fd12::1", "fe80::1", "::ffff:127.0.0.1"] {
            assert!(is_restricted(&ip(restricted)), "{restricted}");
        }
        for public in ["8.8.8.8", "2001:4860::8888"] {
            assert!(!is_restricted(&ip(public)), "{public}");
        }
    }

    #[test]
    fn invalid_patterns_are_settings_errors() {
        let settings = HostSettings {
            blocked_subnets: vec!["10.0.0.0/99".into()],
            ..Default::default()
        };
        assert_matches!(
            HostValidator::from_settings(&settings, Arc::new(StaticResolver::new())),
            Err(SettingsError::InvalidValue(_))
        );
    }

    #[tokio::test]
    async fn without_block_lists_everything_passes() {
        let v = validator(HostSettings::default(), StaticResolver::new());
        assert!(!v.is_blocking_enabled());
        v.validate("localhost", 1883).await.unwrap();
    }

    #[tokio::test]
    async fn blocked_glob_rejects() {
        let v = validator(blocking(&["*.internal"], &[]), StaticResolver::new());
        assert_matches!(
            v.validate("Broker.Internal", 5672).await,
            Err(ConnectivityError::ConfigurationInvalid(_))
        );
    }

    #[tokio::test]
    async fn restricted_and_subnet_addresses_reject() {
        let resolver = StaticResolver::new()
            .with("loop.example", [ip("127.0.0.1")])
            .with("corp.example", [ip("203.0.113.9")])
            .with("public.example", [ip("198.51.100.4")]);
        let v = validator(blocking(&["blocked.example"], &["203.0.113.0/24"]), resolver);

        assert!(v.validate("loop.example", 1883).await.is_err());
        assert!(v.validate("corp.example", 1883).await.is_err());
        assert!(v.validate("public.example", 1883).await.is_ok());
        assert!(v.validate("unknown.example", 1883).await.is_err());
    }

    #[tokio::test]
    async fn allow_list_bypasses_blocking() {
        let mut settings = blocking(&["*"], &[]);
        settings.allowed_hostnames = vec!["localhost".into()];
        let v = validator(settings, StaticResolver::new());
        v.validate("localhost", 1883).await.unwrap();
        assert!(v.validate("other", 1883).await.is_err());
    }
}
