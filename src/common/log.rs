//! Access log records
//!
//! Connection-level accounting lines, emitted through tracing so any
//! subscriber (stderr, file, collector) can sink them.

/// Whether the connection was accepted or rejected at the proxy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accepted,
    Rejected,
}

impl std::fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessStatus::Accepted => write!(f, "accepted"),
            AccessStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// One access record. The `detour` field is filled by the dispatcher:
/// `"in -> out"` for a routed pick, `"in >> out"` for the default path,
/// bare `"out"` when the inbound is untagged.
#[derive(Debug, Clone)]
pub struct AccessMessage {
    pub from: String,
    pub to: String,
    pub status: AccessStatus,
    pub detour: String,
    pub reason: String,
}

impl AccessMessage {
    pub fn accepted(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            status: AccessStatus::Accepted,
            detour: String::new(),
            reason: String::new(),
        }
    }
}

/// Emit the record on the access target.
pub fn record(message: &AccessMessage) {
    tracing::info!(
        target: "nodus::access",
        "{} {} {} [{}] {}",
        message.from,
        message.status,
        message.to,
        message.detour,
        message.reason,
    );
}
