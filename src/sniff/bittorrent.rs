//! BitTorrent handshake sniffing

use crate::common::session::Session;

use super::{ProtocolSniffer, SniffError, SniffResult};

/// Wire handshake: length-prefixed protocol string.
const HANDSHAKE: &[u8] = b"\x13BitTorrent protocol";

/// Recognises the BitTorrent peer handshake. Yields no domain; its value
/// is letting rules (and the fakedns override exception) see the protocol.
pub struct BittorrentSniffer;

impl ProtocolSniffer for BittorrentSniffer {
    fn name(&self) -> &'static str {
        "bittorrent"
    }

    fn sniff(&self, _session: &Session, payload: &[u8]) -> Result<SniffResult, SniffError> {
        if payload.len() < HANDSHAKE.len() {
            if HANDSHAKE.starts_with(payload) {
                return Err(SniffError::NoClue);
            }
            return Err(SniffError::Rejected);
        }
        if payload.starts_with(HANDSHAKE) {
            return Ok(SniffResult::payload("bittorrent", ""));
        }
        Err(SniffError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::session::InboundMetadata;
    use tokio_util::sync::CancellationToken;

    fn session() -> Session {
        Session::new(InboundMetadata::default(), true, CancellationToken::new())
    }

    #[test]
    fn test_handshake_detected() {
        let mut payload = HANDSHAKE.to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        let result = BittorrentSniffer.sniff(&session(), &payload).unwrap();
        assert_eq!(result.protocol(), "bittorrent");
        assert!(result.domain().is_empty());
    }

    #[test]
    fn test_prefix_needs_more_data() {
        assert_eq!(
            BittorrentSniffer
                .sniff(&session(), b"\x13BitTor")
                .unwrap_err(),
            SniffError::NoClue
        );
    }

    #[test]
    fn test_other_traffic_rejected() {
        assert_eq!(
            BittorrentSniffer
                .sniff(&session(), b"GET / HTTP/1.1\r\n\r\n\r\n\r\n")
                .unwrap_err(),
            SniffError::Rejected
        );
    }
}
