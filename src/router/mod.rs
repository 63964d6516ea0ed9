//! Router Layer
//!
//! Maps a routing context to an outbound tag. Routers are pure: no IO, no
//! side effects on the context, and the same context always yields the
//! same route for a fixed rule set.

pub mod rule_router;

pub use rule_router::{DomainPattern, Rule, RuleRouter};

use std::any::Any;

use crate::common::address::{Address, Destination, Network};
use crate::error::{Error, Result};
use crate::features::Feature;

/// Read-only projection of a session used for route evaluation.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub inbound_tag: String,
    pub source: Option<Address>,
    pub destination: Destination,
    pub network: Network,
    /// Sniffed application protocol; empty when sniffing was off or failed.
    pub sniffed_protocol: String,
    pub user_email: Option<String>,
}

impl RoutingContext {
    pub fn new(destination: Destination) -> Self {
        Self {
            inbound_tag: String::new(),
            source: None,
            network: destination.network,
            destination,
            sniffed_protocol: String::new(),
            user_email: None,
        }
    }
}

/// Routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub outbound_tag: String,
    /// Rule-supplied domain replacement, when a rule rewrites the target.
    pub domain_override: Option<String>,
    /// Tag of the matching rule, for diagnostics.
    pub rule_tag: Option<String>,
}

impl Route {
    pub fn to_outbound(tag: impl Into<String>) -> Self {
        Self {
            outbound_tag: tag.into(),
            domain_override: None,
            rule_tag: None,
        }
    }
}

/// Router contract: first matching rule wins; `Error::NoRoute` when none
/// matches.
pub trait Router: Feature {
    fn pick_route(&self, ctx: &RoutingContext) -> Result<Route>;

    /// For downcasting to concrete types.
    fn as_any(&self) -> &dyn Any;
}

/// Router that always picks the same outbound.
pub struct StaticRouter {
    outbound: String,
}

impl StaticRouter {
    pub fn new(outbound: impl Into<String>) -> Self {
        Self {
            outbound: outbound.into(),
        }
    }
}

impl Feature for StaticRouter {}

impl Router for StaticRouter {
    fn pick_route(&self, _ctx: &RoutingContext) -> Result<Route> {
        Ok(Route::to_outbound(self.outbound.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Essential default: never matches, so every dispatch takes the default
/// outbound.
#[derive(Debug, Default)]
pub struct DefaultRouter;

impl Feature for DefaultRouter {}

impl Router for DefaultRouter {
    fn pick_route(&self, _ctx: &RoutingContext) -> Result<Route> {
        Err(Error::NoRoute)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
