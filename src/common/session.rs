//! Session - the typed per-connection context
//!
//! Everything the dispatch chain needs to know about one accepted
//! connection travels in a `Session` shared by reference: who accepted it,
//! which user authenticated, what sniffing found, and where the bytes are
//! ultimately headed. The router only ever sees a read-only projection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::address::{Address, Destination};
use super::log::AccessMessage;

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// An authenticated user attached to the inbound connection.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub level: u32,
}

/// Metadata recorded by the inbound acceptor. Immutable after accept.
#[derive(Debug, Clone, Default)]
pub struct InboundMetadata {
    /// Address of the connecting client.
    pub source: Option<Address>,
    /// Local address the connection arrived on.
    pub gateway: Option<Address>,
    /// Tag of the accepting inbound; empty when untagged.
    pub tag: String,
    pub user: Option<User>,
}

/// What sniffing should do for this connection.
#[derive(Debug, Clone, Default)]
pub struct SniffingRequest {
    pub enabled: bool,
    pub metadata_only: bool,
    /// Destination is overridden when the sniffed protocol starts with one
    /// of these prefixes. The special entry `"fakedns"` also matches
    /// destinations inside the fake-IP pool.
    pub override_destination_for_protocol: Vec<String>,
    /// Lowercased domains that must never be overridden.
    pub exclude_for_domain: Vec<String>,
}

impl SniffingRequest {
    pub fn new(enabled: bool, override_for: Vec<String>, exclude: Vec<String>) -> Self {
        Self {
            enabled,
            metadata_only: false,
            override_destination_for_protocol: override_for,
            exclude_for_domain: exclude.into_iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    pub fn excludes(&self, domain: &str) -> bool {
        let lower = domain.to_lowercase();
        self.exclude_for_domain.iter().any(|d| *d == lower)
    }
}

/// Mutable content attached on first dispatch.
#[derive(Debug, Clone, Default)]
pub struct Content {
    /// Sniffed application protocol, empty until sniffing decides.
    pub protocol: String,
    pub sniffing_request: SniffingRequest,
    pub skip_route_pick: bool,
}

/// Per-connection context threaded through the dispatch chain.
pub struct Session {
    id: u64,
    inbound: InboundMetadata,
    content: Mutex<Content>,
    outbound_target: Mutex<Option<Destination>>,
    access: Mutex<Option<AccessMessage>>,
    /// Cone NAT behavior flag, from `XRAY_CONE_DISABLED` at instance build.
    cone: bool,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(inbound: InboundMetadata, cone: bool, cancel: CancellationToken) -> Self {
        Self {
            id: SESSION_ID.fetch_add(1, Ordering::Relaxed),
            inbound,
            content: Mutex::new(Content::default()),
            outbound_target: Mutex::new(None),
            access: Mutex::new(None),
            cone,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inbound(&self) -> &InboundMetadata {
        &self.inbound
    }

    pub fn user(&self) -> Option<&User> {
        self.inbound.user.as_ref()
    }

    pub fn cone(&self) -> bool {
        self.cone
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn content(&self) -> Content {
        self.content.lock().unwrap().clone()
    }

    pub fn set_sniffing_request(&self, request: SniffingRequest) {
        self.content.lock().unwrap().sniffing_request = request;
    }

    pub fn set_skip_route_pick(&self, skip: bool) {
        self.content.lock().unwrap().skip_route_pick = skip;
    }

    pub fn sniffed_protocol(&self) -> String {
        self.content.lock().unwrap().protocol.clone()
    }

    pub fn set_sniffed_protocol(&self, protocol: &str) {
        self.content.lock().unwrap().protocol = protocol.to_string();
    }

    pub fn target(&self) -> Option<Destination> {
        self.outbound_target.lock().unwrap().clone()
    }

    pub fn set_target(&self, destination: Destination) {
        *self.outbound_target.lock().unwrap() = Some(destination);
    }

    pub fn attach_access_message(&self, message: AccessMessage) {
        *self.access.lock().unwrap() = Some(message);
    }

    pub fn access_message(&self) -> Option<AccessMessage> {
        self.access.lock().unwrap().clone()
    }

    pub fn update_access_detour(&self, detour: String) {
        if let Some(msg) = self.access.lock().unwrap().as_mut() {
            msg.detour = detour;
        }
    }
}
