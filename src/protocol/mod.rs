//! Built-in outbound handlers
//!
//! The dispatch core ships two handlers: `direct` splices the link against
//! a freshly dialed TCP connection, `blackhole` swallows everything.
//! Real proxy protocols plug in through the same `OutboundHandler` trait.

mod blackhole;
mod direct;

pub use blackhole::BlackholeHandler;
pub use direct::DirectHandler;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::features::OutboundHandler;

/// Build a handler from its config protocol name.
pub fn create_handler(tag: &str, protocol: &str) -> Result<Arc<dyn OutboundHandler>> {
    match protocol {
        "direct" | "freedom" => Ok(Arc::new(DirectHandler::new(tag))),
        "blackhole" => Ok(Arc::new(BlackholeHandler::new(tag))),
        other => Err(Error::Config(format!("unknown outbound protocol: {}", other))),
    }
}
