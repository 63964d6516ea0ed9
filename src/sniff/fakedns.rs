//! FakeDNS metadata sniffing
//!
//! No payload needed: when the dispatch target is an IP inside the fake
//! pool, the engine already knows which domain the client resolved.

use std::sync::Arc;

use crate::common::session::Session;
use crate::features::FakeDns;

use super::{ProtocolSniffer, SniffError, SniffResult};

pub struct FakeDnsSniffer {
    engine: Arc<dyn FakeDns>,
}

impl FakeDnsSniffer {
    pub fn new(engine: Arc<dyn FakeDns>) -> Self {
        Self { engine }
    }
}

impl ProtocolSniffer for FakeDnsSniffer {
    fn name(&self) -> &'static str {
        "fakedns"
    }

    fn sniff_metadata(&self, session: &Session) -> Result<SniffResult, SniffError> {
        let Some(target) = session.target() else {
            return Err(SniffError::Rejected);
        };
        let Some(ip) = target.address.ip() else {
            return Err(SniffError::Rejected);
        };
        if !self.engine.fake_ip_range().contains(&ip) {
            return Err(SniffError::Rejected);
        }
        match self.engine.domain_from_fake_ip(ip) {
            Some(domain) => Ok(SniffResult::metadata("fakedns", domain)),
            None => Err(SniffError::Rejected),
        }
    }
}
