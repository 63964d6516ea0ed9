//! Protocol sniffing framework
//!
//! Classifiers identify a connection's application protocol and true
//! destination from metadata and/or a short payload prefix. A classifier
//! answers with a result, with `NoClue` (feed me more bytes), or with
//! `Rejected` (permanently not this protocol). The framework consults the
//! remaining classifiers in a stable order per round and keeps only the
//! undecided ones for the next round.

mod bittorrent;
mod fakedns;
mod http;
mod tls;

pub use bittorrent::BittorrentSniffer;
pub use fakedns::FakeDnsSniffer;
pub use http::HttpSniffer;
pub use tls::TlsSniffer;

use std::sync::Arc;

use thiserror::Error;

use crate::common::session::Session;
use crate::features::FakeDns;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SniffError {
    /// Not enough bytes to decide; retry with more data.
    #[error("need more data")]
    NoClue,
    /// Definitely not this protocol; stop asking this classifier.
    #[error("not this protocol")]
    Rejected,
    /// No classifier could identify the payload.
    #[error("unknown content")]
    UnknownContent,
    /// The sniffing budget elapsed.
    #[error("timeout on sniffing")]
    Timeout,
    /// The connection was cancelled mid-sniff.
    #[error("sniffing interrupted")]
    Interrupted,
}

/// Outcome of a successful sniff.
///
/// `protocol()` is what goes into the session content; for a composite
/// result `protocol_for_routing()` carries the payload-derived protocol
/// that drives destination-override decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    Metadata { protocol: String, domain: String },
    Payload { protocol: String, domain: String },
    Composite {
        metadata_protocol: String,
        payload_protocol: String,
        domain: String,
    },
}

impl SniffResult {
    pub fn payload(protocol: &str, domain: impl Into<String>) -> Self {
        SniffResult::Payload {
            protocol: protocol.to_string(),
            domain: domain.into(),
        }
    }

    pub fn metadata(protocol: &str, domain: impl Into<String>) -> Self {
        SniffResult::Metadata {
            protocol: protocol.to_string(),
            domain: domain.into(),
        }
    }

    /// Combine a metadata result with a payload result: the metadata side
    /// supplies protocol and domain, the payload side supplies the
    /// protocol used for routing decisions.
    pub fn composite(metadata: &SniffResult, payload: &SniffResult) -> Self {
        SniffResult::Composite {
            metadata_protocol: metadata.protocol().to_string(),
            payload_protocol: payload.protocol().to_string(),
            domain: metadata.domain().to_string(),
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            SniffResult::Metadata { protocol, .. } => protocol,
            SniffResult::Payload { protocol, .. } => protocol,
            SniffResult::Composite {
                metadata_protocol, ..
            } => metadata_protocol,
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            SniffResult::Metadata { domain, .. } => domain,
            SniffResult::Payload { domain, .. } => domain,
            SniffResult::Composite { domain, .. } => domain,
        }
    }

    /// Protocol string consulted by the destination-override rule.
    pub fn protocol_for_routing(&self) -> &str {
        match self {
            SniffResult::Composite {
                payload_protocol, ..
            } => payload_protocol,
            other => other.protocol(),
        }
    }
}

/// A pluggable classifier. Implementations are stateless per call.
pub trait ProtocolSniffer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classify from ambient context only (no payload).
    fn sniff_metadata(&self, _session: &Session) -> Result<SniffResult, SniffError> {
        Err(SniffError::Rejected)
    }

    /// Classify from a payload prefix.
    fn sniff(&self, _session: &Session, _payload: &[u8]) -> Result<SniffResult, SniffError> {
        Err(SniffError::Rejected)
    }
}

/// Composes the registered classifiers for one connection.
pub struct Sniffer {
    payload: Vec<Box<dyn ProtocolSniffer>>,
    metadata: Vec<Box<dyn ProtocolSniffer>>,
}

impl Sniffer {
    /// The standard classifier set: HTTP, TLS and BitTorrent over payload,
    /// FakeDNS over metadata when the engine is available.
    pub fn new(fake_dns: Option<Arc<dyn FakeDns>>) -> Self {
        let mut metadata: Vec<Box<dyn ProtocolSniffer>> = Vec::new();
        if let Some(engine) = fake_dns {
            metadata.push(Box::new(FakeDnsSniffer::new(engine)));
        }
        Self {
            payload: vec![
                Box::new(HttpSniffer),
                Box::new(TlsSniffer),
                Box::new(BittorrentSniffer),
            ],
            metadata,
        }
    }

    #[cfg(test)]
    pub fn with_sniffers(
        payload: Vec<Box<dyn ProtocolSniffer>>,
        metadata: Vec<Box<dyn ProtocolSniffer>>,
    ) -> Self {
        Self { payload, metadata }
    }

    /// Consult the metadata classifiers; first success wins.
    pub fn sniff_metadata(&self, session: &Session) -> Result<SniffResult, SniffError> {
        for sniffer in &self.metadata {
            if let Ok(result) = sniffer.sniff_metadata(session) {
                return Ok(result);
            }
        }
        Err(SniffError::Rejected)
    }

    /// Consult every still-undecided payload classifier. `NoClue` keeps a
    /// classifier in the running; any other failure drops it. When no
    /// classifier remains undecided the payload is unknown content.
    pub fn sniff(&mut self, session: &Session, payload: &[u8]) -> Result<SniffResult, SniffError> {
        let mut pending = Vec::new();
        let mut hit = None;
        for sniffer in self.payload.drain(..) {
            if hit.is_some() {
                pending.push(sniffer);
                continue;
            }
            match sniffer.sniff(session, payload) {
                Ok(result) => {
                    tracing::debug!("sniffed {} via {}", result.protocol(), sniffer.name());
                    hit = Some(result);
                    pending.push(sniffer);
                }
                Err(SniffError::NoClue) => pending.push(sniffer),
                Err(_) => {}
            }
        }
        self.payload = pending;

        if let Some(result) = hit {
            return Ok(result);
        }
        if self.payload.is_empty() {
            Err(SniffError::UnknownContent)
        } else {
            Err(SniffError::NoClue)
        }
    }
}
