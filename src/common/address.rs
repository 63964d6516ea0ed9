//! Addresses and dispatch targets
//!
//! An `Address` is what an inbound decodes from client framing: either a
//! concrete socket endpoint or a still-unresolved name. Which of the two
//! it is matters throughout the dispatch chain: rules match domains and
//! CIDRs differently, FakeDNS only ever applies to IP targets, and
//! sniffing may swap an IP back for the name the client asked for.

use std::net::{IpAddr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// A connection endpoint: resolved socket address or domain name, each
/// carrying its port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Classify a host string: an IP literal becomes a socket endpoint,
    /// anything else is kept as a name. This is how sniffed hosts enter
    /// the address model.
    pub fn parse_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// The IP, when this endpoint is already resolved. Domain addresses
    /// answer `None`; resolution is the outbound's concern, not ours.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Socket(addr) => Some(addr.ip()),
            Address::Domain(_, _) => None,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// A logical connection target: network plus address.
///
/// Dispatching on an invalid destination (empty host or port zero) is a
/// caller bug; `Dispatcher::dispatch` rejects it up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
}

impl Destination {
    pub fn tcp(address: Address) -> Self {
        Self {
            network: Network::Tcp,
            address,
        }
    }

    pub fn udp(address: Address) -> Self {
        Self {
            network: Network::Udp,
            address,
        }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// A destination is valid iff the host is non-empty and the port is
    /// in [1, 65535].
    pub fn is_valid(&self) -> bool {
        if self.address.port() == 0 {
            return false;
        }
        match &self.address {
            Address::Socket(_) => true,
            Address::Domain(domain, _) => !domain.is_empty(),
        }
    }

    /// Replace the host with a sniffed domain, keeping port and network.
    pub fn with_host(&self, host: &str) -> Self {
        Self {
            network: self.network,
            address: Address::parse_host(host, self.address.port()),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_validity() {
        assert!(Destination::tcp(Address::domain("example.com", 443)).is_valid());
        assert!(!Destination::tcp(Address::domain("example.com", 0)).is_valid());
        assert!(!Destination::tcp(Address::domain("", 443)).is_valid());
        assert!(Destination::udp(Address::ip_port("1.2.3.4".parse().unwrap(), 53)).is_valid());
    }

    #[test]
    fn test_with_host_keeps_port_and_network() {
        let dest = Destination::tcp(Address::ip_port("1.2.3.4".parse().unwrap(), 80));
        let overridden = dest.with_host("example.org");
        assert_eq!(overridden.network, Network::Tcp);
        assert_eq!(overridden.port(), 80);
        assert_eq!(overridden.address, Address::domain("example.org", 80));
    }

    #[test]
    fn test_parse_host_classifies_ip_literals() {
        let ip = Address::parse_host("198.18.3.7", 443);
        assert!(!ip.is_domain());
        assert_eq!(ip.ip(), Some("198.18.3.7".parse().unwrap()));

        let v6 = Address::parse_host("2001:db8::1", 443);
        assert!(!v6.is_domain());

        let name = Address::parse_host("example.com", 443);
        assert!(name.is_domain());
        assert_eq!(name.ip(), None);
    }

    #[test]
    fn test_display_forms() {
        let name = Address::domain("example.com", 8443);
        assert_eq!(name.to_string(), "example.com:8443");
        let dest = Destination::udp(Address::ip_port("10.0.0.1".parse().unwrap(), 53));
        assert_eq!(dest.to_string(), "udp:10.0.0.1:53");
    }
}
