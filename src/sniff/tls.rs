//! TLS SNI (Server Name Indication) sniffing
//!
//! Hand-written ClientHello walk: enough to pull the SNI host name out of
//! the first record without a TLS stack. Truncated records ask for more
//! data; anything that is not a ClientHello is rejected outright.

use crate::common::session::Session;

use super::{ProtocolSniffer, SniffError, SniffResult};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const RECORD_HEADER_SIZE: usize = 5;
const EXTENSION_TYPE_SNI: u16 = 0x0000;
const SNI_NAME_TYPE_HOSTNAME: u8 = 0x00;
/// RFC 5246 caps one record at 16384 bytes.
const MAX_RECORD_LENGTH: usize = 16384;

/// Extracts the SNI host name from a TLS ClientHello prefix.
pub struct TlsSniffer;

impl ProtocolSniffer for TlsSniffer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn sniff(&self, _session: &Session, payload: &[u8]) -> Result<SniffResult, SniffError> {
        if payload.len() < RECORD_HEADER_SIZE {
            return Err(SniffError::NoClue);
        }
        if payload[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniffError::Rejected);
        }
        let version = u16::from_be_bytes([payload[1], payload[2]]);
        if !(0x0301..=0x0304).contains(&version) {
            return Err(SniffError::Rejected);
        }
        let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
        if record_len > MAX_RECORD_LENGTH {
            return Err(SniffError::Rejected);
        }

        let handshake = &payload[RECORD_HEADER_SIZE..];
        if handshake.is_empty() {
            return Err(SniffError::NoClue);
        }
        if handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(SniffError::Rejected);
        }

        match parse_client_hello(handshake) {
            Ok(Some(sni)) => Ok(SniffResult::payload("tls", sni)),
            // ClientHello without SNI carries nothing a route can use.
            Ok(None) => Err(SniffError::Rejected),
            Err(e) => Err(e),
        }
    }
}

/// Walk the ClientHello body looking for the SNI extension. Returns
/// `NoClue` whenever the walk runs off the end of the available bytes.
fn parse_client_hello(handshake: &[u8]) -> Result<Option<String>, SniffError> {
    // type (1) + length (3) + version (2) + random (32)
    let mut pos: usize = 38;
    if handshake.len() < pos + 1 {
        return Err(SniffError::NoClue);
    }

    // Session ID
    let session_id_len = handshake[pos] as usize;
    pos += 1 + session_id_len;

    // Cipher suites
    if handshake.len() < pos + 2 {
        return Err(SniffError::NoClue);
    }
    let cipher_len = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]) as usize;
    pos += 2 + cipher_len;

    // Compression methods
    if handshake.len() < pos + 1 {
        return Err(SniffError::NoClue);
    }
    let compression_len = handshake[pos] as usize;
    pos += 1 + compression_len;

    // Extensions block
    if handshake.len() < pos + 2 {
        return Err(SniffError::NoClue);
    }
    let extensions_len = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if handshake.len() < extensions_end {
        return Err(SniffError::NoClue);
    }

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]);
        let ext_len = u16::from_be_bytes([handshake[pos + 2], handshake[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return Err(SniffError::NoClue);
        }
        if ext_type == EXTENSION_TYPE_SNI {
            return Ok(parse_sni_extension(&handshake[pos..pos + ext_len]));
        }
        pos += ext_len;
    }

    Ok(None)
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = (2 + list_len).min(data.len());

    let mut pos = 2;
    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > end {
            return None;
        }
        if name_type == SNI_NAME_TYPE_HOSTNAME {
            let name = &data[pos..pos + name_len];
            if name.iter().all(|&b| b.is_ascii() && b != 0) {
                return String::from_utf8(name.to_vec()).ok();
            }
            return None;
        }
        pos += name_len;
    }
    None
}

#[cfg(test)]
pub(crate) fn build_client_hello(sni: &str) -> Vec<u8> {
    let mut hello = Vec::new();

    // ClientHello body: version + random + empty session id
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0u8; 32]);
    hello.push(0x00);

    // One cipher suite, null compression
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);

    // SNI extension
    let name = sni.as_bytes();
    let mut ext = Vec::new();
    ext.extend_from_slice(&[0x00, 0x00]);
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext.push(SNI_NAME_TYPE_HOSTNAME);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    hello.extend_from_slice(&ext);

    let mut handshake = Vec::new();
    handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = Vec::new();
    record.push(CONTENT_TYPE_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::session::InboundMetadata;
    use tokio_util::sync::CancellationToken;

    fn session() -> Session {
        Session::new(InboundMetadata::default(), true, CancellationToken::new())
    }

    fn sniff(payload: &[u8]) -> Result<SniffResult, SniffError> {
        TlsSniffer.sniff(&session(), payload)
    }

    #[test]
    fn test_extracts_sni() {
        let hello = build_client_hello("secret.internal");
        let result = sniff(&hello).unwrap();
        assert_eq!(result.protocol(), "tls");
        assert_eq!(result.domain(), "secret.internal");
    }

    #[test]
    fn test_truncated_hello_needs_more_data() {
        let hello = build_client_hello("example.com");
        assert_eq!(sniff(&hello[..3]).unwrap_err(), SniffError::NoClue);
        assert_eq!(sniff(&hello[..20]).unwrap_err(), SniffError::NoClue);
        assert_eq!(
            sniff(&hello[..hello.len() - 4]).unwrap_err(),
            SniffError::NoClue
        );
    }

    #[test]
    fn test_not_tls_rejected() {
        assert_eq!(
            sniff(b"GET / HTTP/1.1\r\n").unwrap_err(),
            SniffError::Rejected
        );
    }

    #[test]
    fn test_wrong_handshake_type_rejected() {
        let mut hello = build_client_hello("example.com");
        hello[RECORD_HEADER_SIZE] = 0x02;
        assert_eq!(sniff(&hello).unwrap_err(), SniffError::Rejected);
    }
}
