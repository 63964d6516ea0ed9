//! Outbound handler registry
//!
//! Named handlers with a designated default. The dispatcher looks handlers
//! up by routing tag and falls back to the default when the route misses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::Feature;
use crate::common::pipe::Link;
use crate::common::session::Session;
use crate::error::{Error, Result};

/// One duplex relay from a Link to an upstream transport.
///
/// Contract: `dispatch` must eventually close `link.writer` and interrupt
/// `link.reader`, whether it completes or fails.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    /// Routing tag; may be empty.
    fn tag(&self) -> &str;

    async fn dispatch(&self, session: Arc<Session>, link: Link);
}

pub trait OutboundManager: Feature {
    /// Register a handler. Fails on a duplicate tag. The first handler
    /// added becomes the default unless one is designated explicitly.
    fn add(&self, handler: Arc<dyn OutboundHandler>) -> Result<()>;

    fn remove(&self, tag: &str) -> bool;

    fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>>;

    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>>;

    fn set_default(&self, tag: &str) -> Result<()>;
}

#[derive(Default)]
struct ManagerState {
    handlers: HashMap<String, Arc<dyn OutboundHandler>>,
    default: Option<Arc<dyn OutboundHandler>>,
}

/// Mutex-guarded handler registry.
#[derive(Default)]
pub struct HandlerManager {
    state: Mutex<ManagerState>,
}

impl HandlerManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feature for HandlerManager {}

impl OutboundManager for HandlerManager {
    fn add(&self, handler: Arc<dyn OutboundHandler>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tag = handler.tag().to_string();
        if state.handlers.contains_key(&tag) {
            return Err(Error::Config(format!("duplicate outbound tag: {}", tag)));
        }
        if state.default.is_none() {
            state.default = Some(Arc::clone(&handler));
        }
        state.handlers.insert(tag, handler);
        Ok(())
    }

    fn remove(&self, tag: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let removed = state.handlers.remove(tag);
        let default_gone = matches!(
            (&removed, &state.default),
            (Some(r), Some(d)) if d.tag() == r.tag()
        );
        if default_gone {
            state.default = None;
        }
        removed.is_some()
    }

    fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.state.lock().unwrap().handlers.get(tag).cloned()
    }

    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.state.lock().unwrap().default.clone()
    }

    fn set_default(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.handlers.get(tag).cloned() {
            Some(h) => {
                state.default = Some(h);
                Ok(())
            }
            None => Err(Error::Config(format!("unknown outbound tag: {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHandler {
        tag: String,
    }

    #[async_trait]
    impl OutboundHandler for FakeHandler {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn dispatch(&self, _session: Arc<Session>, link: Link) {
            link.shutdown();
        }
    }

    fn handler(tag: &str) -> Arc<dyn OutboundHandler> {
        Arc::new(FakeHandler {
            tag: tag.to_string(),
        })
    }

    #[test]
    fn test_first_added_is_default() {
        let m = HandlerManager::new();
        m.add(handler("direct")).unwrap();
        m.add(handler("proxy")).unwrap();
        assert_eq!(m.default_handler().unwrap().tag(), "direct");
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let m = HandlerManager::new();
        m.add(handler("direct")).unwrap();
        assert!(m.add(handler("direct")).is_err());
    }

    #[test]
    fn test_set_default() {
        let m = HandlerManager::new();
        m.add(handler("direct")).unwrap();
        m.add(handler("proxy")).unwrap();
        m.set_default("proxy").unwrap();
        assert_eq!(m.default_handler().unwrap().tag(), "proxy");
        assert!(m.set_default("missing").is_err());
    }

    #[test]
    fn test_remove_clears_default() {
        let m = HandlerManager::new();
        m.add(handler("direct")).unwrap();
        assert!(m.remove("direct"));
        assert!(m.default_handler().is_none());
        assert!(!m.remove("direct"));
    }
}
