//! Rule-based Router implementation

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::common::address::{Address, Network};
use crate::error::{Error, Result};
use crate::features::Feature;

use super::{Route, Router, RoutingContext};

/// A compiled domain matcher.
#[derive(Debug, Clone)]
pub enum DomainPattern {
    /// Exact match (`full:example.com`).
    Full(String),
    /// The domain itself or any subdomain (`domain:example.com`).
    Suffix(String),
    /// Substring match (`keyword:ads`).
    Keyword(String),
    /// Regular expression (`regexp:^cdn\d+\.`).
    Regexp(Regex),
}

impl DomainPattern {
    /// Parse the prefixed pattern syntax. Plain strings match as
    /// substrings.
    pub fn parse(pattern: &str) -> Result<Self> {
        if let Some(rest) = pattern.strip_prefix("full:") {
            Ok(DomainPattern::Full(rest.to_lowercase()))
        } else if let Some(rest) = pattern.strip_prefix("domain:") {
            Ok(DomainPattern::Suffix(rest.to_lowercase()))
        } else if let Some(rest) = pattern.strip_prefix("keyword:") {
            Ok(DomainPattern::Keyword(rest.to_lowercase()))
        } else if let Some(rest) = pattern.strip_prefix("regexp:") {
            let re = Regex::new(rest)
                .map_err(|e| Error::Config(format!("bad domain regexp {}: {}", rest, e)))?;
            Ok(DomainPattern::Regexp(re))
        } else {
            Ok(DomainPattern::Keyword(pattern.to_lowercase()))
        }
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Full(target) => domain == target,
            DomainPattern::Suffix(target) => {
                domain == target || domain.ends_with(&format!(".{}", target))
            }
            DomainPattern::Keyword(keyword) => domain.contains(keyword.as_str()),
            DomainPattern::Regexp(re) => re.is_match(domain),
        }
    }
}

/// One routing rule. Empty fields match anything.
pub struct Rule {
    pub tag: Option<String>,
    pub inbound_tags: Vec<String>,
    pub networks: Vec<Network>,
    /// Sniffed protocol names (`http`, `tls`, `bittorrent`, ...).
    pub protocols: Vec<String>,
    pub domains: Vec<DomainPattern>,
    pub ip_nets: Vec<IpNet>,
    /// Port pattern: `443`, `80,443`, `1000-2000`, or combinations.
    pub ports: Option<String>,
    pub outbound_tag: String,
}

impl Rule {
    fn matches(&self, ctx: &RoutingContext) -> bool {
        if !self.inbound_tags.is_empty() && !self.inbound_tags.iter().any(|t| *t == ctx.inbound_tag)
        {
            return false;
        }
        if !self.networks.is_empty() && !self.networks.contains(&ctx.network) {
            return false;
        }
        if !self.protocols.is_empty()
            && !self.protocols.iter().any(|p| *p == ctx.sniffed_protocol)
        {
            return false;
        }
        if let Some(ports) = &self.ports {
            if !match_port(ports, ctx.destination.port()) {
                return false;
            }
        }

        let has_domain_rules = !self.domains.is_empty();
        let has_ip_rules = !self.ip_nets.is_empty();
        if !has_domain_rules && !has_ip_rules {
            return true;
        }

        match &ctx.destination.address {
            Address::Domain(domain, _) => {
                let lower = domain.to_lowercase();
                has_domain_rules && self.domains.iter().any(|p| p.matches(&lower))
            }
            Address::Socket(addr) => has_ip_rules && match_ip(&self.ip_nets, addr.ip()),
        }
    }
}

fn match_port(pattern: &str, port: u16) -> bool {
    for part in pattern.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u16>(), end.parse::<u16>()) {
                if port >= start && port <= end {
                    return true;
                }
            }
        } else if part.parse::<u16>() == Ok(port) {
            return true;
        }
    }
    false
}

fn match_ip(nets: &[IpNet], ip: IpAddr) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

/// Ordered first-match rule engine.
pub struct RuleRouter {
    rules: Vec<Rule>,
}

impl RuleRouter {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

impl Feature for RuleRouter {}

impl Router for RuleRouter {
    fn pick_route(&self, ctx: &RoutingContext) -> Result<Route> {
        for rule in &self.rules {
            if rule.matches(ctx) {
                return Ok(Route {
                    outbound_tag: rule.outbound_tag.clone(),
                    domain_override: None,
                    rule_tag: rule.tag.clone(),
                });
            }
        }
        Err(Error::NoRoute)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::address::Destination;

    fn rule(outbound: &str) -> Rule {
        Rule {
            tag: None,
            inbound_tags: vec![],
            networks: vec![],
            protocols: vec![],
            domains: vec![],
            ip_nets: vec![],
            ports: None,
            outbound_tag: outbound.to_string(),
        }
    }

    fn ctx_for(dest: Destination) -> RoutingContext {
        RoutingContext::new(dest)
    }

    #[test]
    fn test_domain_suffix_rule() {
        let mut r = rule("proxy");
        r.domains = vec![DomainPattern::parse("domain:google.com").unwrap()];
        let router = RuleRouter::new(vec![r]);

        let hit = ctx_for(Destination::tcp(Address::domain("www.google.com", 443)));
        assert_eq!(router.pick_route(&hit).unwrap().outbound_tag, "proxy");

        let miss = ctx_for(Destination::tcp(Address::domain("example.com", 443)));
        assert!(matches!(router.pick_route(&miss), Err(Error::NoRoute)));
    }

    #[test]
    fn test_full_does_not_match_subdomain() {
        let mut r = rule("proxy");
        r.domains = vec![DomainPattern::parse("full:google.com").unwrap()];
        let router = RuleRouter::new(vec![r]);

        let sub = ctx_for(Destination::tcp(Address::domain("www.google.com", 443)));
        assert!(router.pick_route(&sub).is_err());
    }

    #[test]
    fn test_port_patterns() {
        assert!(match_port("443", 443));
        assert!(match_port("80,443", 443));
        assert!(match_port("1000-2000", 1500));
        assert!(!match_port("1000-2000", 999));
        assert!(!match_port("80", 81));
    }

    #[test]
    fn test_cidr_rule() {
        let mut r = rule("direct");
        r.ip_nets = vec!["10.0.0.0/8".parse().unwrap()];
        let router = RuleRouter::new(vec![r]);

        let hit = ctx_for(Destination::tcp(Address::ip_port(
            "10.1.2.3".parse().unwrap(),
            80,
        )));
        assert_eq!(router.pick_route(&hit).unwrap().outbound_tag, "direct");

        let miss = ctx_for(Destination::tcp(Address::ip_port(
            "8.8.8.8".parse().unwrap(),
            80,
        )));
        assert!(router.pick_route(&miss).is_err());
    }

    #[test]
    fn test_first_match_wins() {
        let mut a = rule("first");
        a.ports = Some("443".to_string());
        let mut b = rule("second");
        b.ports = Some("443".to_string());
        let router = RuleRouter::new(vec![a, b]);

        let ctx = ctx_for(Destination::tcp(Address::domain("example.com", 443)));
        assert_eq!(router.pick_route(&ctx).unwrap().outbound_tag, "first");
    }

    #[test]
    fn test_sniffed_protocol_rule() {
        let mut r = rule("torrent-out");
        r.protocols = vec!["bittorrent".to_string()];
        let router = RuleRouter::new(vec![r]);

        let mut ctx = ctx_for(Destination::tcp(Address::domain("tracker.example", 6881)));
        assert!(router.pick_route(&ctx).is_err());
        ctx.sniffed_protocol = "bittorrent".to_string();
        assert_eq!(router.pick_route(&ctx).unwrap().outbound_tag, "torrent-out");
    }
}
