//! Blackhole outbound - swallow everything

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::common::pipe::Link;
use crate::common::session::Session;
use crate::features::OutboundHandler;

/// Discards the connection immediately.
pub struct BlackholeHandler {
    tag: String,
}

impl BlackholeHandler {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl OutboundHandler for BlackholeHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, session: Arc<Session>, link: Link) {
        debug!(
            "[{}] swallowing connection to {:?}",
            self.tag,
            session.target()
        );
        link.shutdown();
    }
}
