//! nodus - the request-dispatch core of a pluggable proxy platform
//!
//! # Architecture
//!
//! ```text
//! Inbound acceptor
//! → Dispatcher (sniffing, destination override)
//! → Router (rules → outbound tag)
//! → Outbound handler (direct, blackhole, plug-ins)
//! ```
//!
//! Inbound and outbound never touch each other directly: a dispatch builds
//! two bounded pipes and hands each side one `Link`. Sniffing peeks at the
//! uplink through a cached reader so the payload still reaches the
//! outbound verbatim.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, Buffer, Pipe/Link, Session
//! ├── features/        # Feature registry: policy, stats, dns, outbounds
//! ├── router/          # Rule-based routing
//! ├── sniff/           # Protocol classifiers
//! ├── protocol/        # Built-in outbound handlers
//! └── app/             # Dispatcher, Instance, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Pluggable components
pub mod features;
pub mod protocol;
pub mod router;
pub mod sniff;

// Application
pub mod app;
pub mod config;

// Re-exports for convenience
pub use common::{Address, Destination, Link, MultiBuffer, Network, Session};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::{Dispatcher, Instance};
pub use features::{Feature, FeatureHandle, FeatureKind, OutboundHandler};
pub use router::Router;
