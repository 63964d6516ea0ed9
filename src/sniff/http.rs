//! HTTP Host header sniffing

use crate::common::session::Session;

use super::{ProtocolSniffer, SniffError, SniffResult};

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "HEAD", "DELETE", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Extracts the request target from an HTTP/1.x request prefix.
pub struct HttpSniffer;

impl ProtocolSniffer for HttpSniffer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn sniff(&self, _session: &Session, payload: &[u8]) -> Result<SniffResult, SniffError> {
        begins_with_method(payload)?;

        let text = std::str::from_utf8(payload).map_err(|_| SniffError::Rejected)?;

        // The request line must announce an HTTP/1.x version.
        match text.split_once("\r\n") {
            Some((request_line, rest)) => {
                if !request_line.contains(" HTTP/1.") {
                    return Err(SniffError::Rejected);
                }
                match find_host(rest) {
                    Some(host) => {
                        let domain = strip_port(&host);
                        if !is_valid_hostname(&domain) {
                            return Err(SniffError::Rejected);
                        }
                        Ok(SniffResult::payload("http", domain))
                    }
                    None if text.contains("\r\n\r\n") => Err(SniffError::Rejected),
                    None => Err(SniffError::NoClue),
                }
            }
            None => Err(SniffError::NoClue),
        }
    }
}

fn begins_with_method(payload: &[u8]) -> Result<(), SniffError> {
    for method in METHODS {
        let bytes = method.as_bytes();
        if payload.len() > bytes.len() {
            if payload.starts_with(bytes) && payload[bytes.len()] == b' ' {
                return Ok(());
            }
        } else if bytes.starts_with(payload) {
            // Could still become this method once more bytes arrive.
            return Err(SniffError::NoClue);
        }
    }
    Err(SniffError::Rejected)
}

fn find_host(headers: &str) -> Option<String> {
    for line in headers.split("\r\n") {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn strip_port(host: &str) -> String {
    // Bracketed IPv6 literals keep their brackets off; everything else
    // splits at the last colon.
    if let Some(stripped) = host.strip_prefix('[') {
        if let Some((addr, _)) = stripped.split_once(']') {
            return addr.to_string();
        }
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.parse::<u16>().is_ok() => h.to_string(),
        _ => host.to_string(),
    }
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
}
