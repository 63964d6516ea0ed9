//! DNS features: the client surface and the FakeDNS engine
//!
//! The dispatch core resolves nothing itself; it only needs a DNS client
//! feature to exist (essential default) and, when configured, a FakeDNS
//! engine to map synthetic IPs back to the domains clients asked for.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};

use super::Feature;
use crate::error::{Error, Result};

/// Default fake-IP pool.
pub const FAKE_IP_POOL: &str = "198.18.0.0/16";

/// Minimal resolver surface.
#[async_trait]
pub trait DnsClient: Feature {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

/// Essential default: resolve through the operating system.
#[derive(Debug, Default)]
pub struct SystemDnsClient;

impl Feature for SystemDnsClient {}

#[async_trait]
impl DnsClient for SystemDnsClient {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((domain, 0))
            .await
            .map_err(|e| Error::Transport(format!("resolve {}: {}", domain, e)))?
            .map(|sa| sa.ip())
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(Error::Transport(format!("no addresses for {}", domain)));
        }
        Ok(addrs)
    }
}

/// Hands out synthetic IPs from a reserved range so a later TCP connect to
/// that IP reveals the domain the client resolved.
pub trait FakeDns: Feature {
    fn fake_ip_range(&self) -> IpNet;
    fn domain_from_fake_ip(&self, ip: IpAddr) -> Option<String>;
    fn fake_ip_for_domain(&self, domain: &str) -> Vec<IpAddr>;
}

struct PoolState {
    /// Host offset of the next allocation; wraps around the pool.
    next: u32,
    by_domain: HashMap<String, Ipv4Addr>,
    by_ip: HashMap<Ipv4Addr, String>,
}

/// In-memory FakeDNS engine over an IPv4 pool with wraparound reuse.
pub struct FakeDnsEngine {
    pool: Ipv4Net,
    host_count: u32,
    state: Mutex<PoolState>,
}

impl FakeDnsEngine {
    pub fn new(pool: Ipv4Net) -> Self {
        let host_count = (pool.hosts().count() as u32).max(1);
        Self {
            pool,
            host_count,
            state: Mutex::new(PoolState {
                next: 0,
                by_domain: HashMap::new(),
                by_ip: HashMap::new(),
            }),
        }
    }

    pub fn with_default_pool() -> Self {
        let pool = FAKE_IP_POOL
            .parse::<Ipv4Net>()
            .expect("default fake-IP pool is a valid CIDR");
        Self::new(pool)
    }

    fn host_at(&self, offset: u32) -> Ipv4Addr {
        let base = u32::from(self.pool.network());
        // Skip the network address itself.
        Ipv4Addr::from(base + 1 + offset)
    }
}

impl Feature for FakeDnsEngine {}

impl FakeDns for FakeDnsEngine {
    fn fake_ip_range(&self) -> IpNet {
        IpNet::V4(self.pool)
    }

    fn domain_from_fake_ip(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip else { return None };
        self.state.lock().unwrap().by_ip.get(&v4).cloned()
    }

    fn fake_ip_for_domain(&self, domain: &str) -> Vec<IpAddr> {
        let domain = domain.to_lowercase();
        let mut state = self.state.lock().unwrap();
        if let Some(ip) = state.by_domain.get(&domain) {
            return vec![IpAddr::V4(*ip)];
        }

        let ip = self.host_at(state.next % self.host_count);
        state.next = state.next.wrapping_add(1);

        // Wraparound: evict whatever domain held this address before.
        if let Some(old) = state.by_ip.insert(ip, domain.clone()) {
            state.by_domain.remove(&old);
        }
        state.by_domain.insert(domain, ip);
        vec![IpAddr::V4(ip)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(cidr: &str) -> FakeDnsEngine {
        FakeDnsEngine::new(cidr.parse().unwrap())
    }

    #[test]
    fn test_allocation_round_trips() {
        let fdns = engine("198.18.0.0/16");
        let ips = fdns.fake_ip_for_domain("foo.example");
        assert_eq!(ips.len(), 1);
        assert!(fdns.fake_ip_range().contains(&ips[0]));
        assert_eq!(
            fdns.domain_from_fake_ip(ips[0]).as_deref(),
            Some("foo.example")
        );
    }

    #[test]
    fn test_allocation_is_stable_per_domain() {
        let fdns = engine("198.18.0.0/24");
        let a = fdns.fake_ip_for_domain("a.example");
        let again = fdns.fake_ip_for_domain("a.example");
        assert_eq!(a, again);
    }

    #[test]
    fn test_wraparound_evicts_oldest() {
        // /30 has two usable hosts.
        let fdns = engine("10.0.0.0/30");
        let a = fdns.fake_ip_for_domain("a.example")[0];
        let _b = fdns.fake_ip_for_domain("b.example")[0];
        let c = fdns.fake_ip_for_domain("c.example")[0];
        assert_eq!(a, c);
        assert_eq!(fdns.domain_from_fake_ip(a).as_deref(), Some("c.example"));
    }

    #[test]
    fn test_unknown_ip_has_no_domain() {
        let fdns = engine("198.18.0.0/16");
        assert!(fdns
            .domain_from_fake_ip("192.0.2.1".parse().unwrap())
            .is_none());
    }
}
