//! Feature registry
//!
//! Every top-level pluggable component is a Feature: it has a stable kind
//! token, a start hook and a close hook. The registry holds at most one
//! feature per kind and supports deferred resolutions: callbacks annotated
//! with the kinds they require, fired exactly once when the last
//! requirement registers.

pub mod dns;
pub mod outbound;
pub mod policy;
pub mod stats;

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub use dns::{DnsClient, FakeDns, FakeDnsEngine, SystemDnsClient, FAKE_IP_POOL};
pub use outbound::{HandlerManager, OutboundHandler, OutboundManager};
pub use policy::{DefaultPolicyManager, LevelPolicyManager, Policy, PolicyManager};
pub use stats::{
    user_downlink_counter_name, user_uplink_counter_name, Counter, InMemoryStatsManager,
    NoopStatsManager, StatsManager,
};

/// Lifecycle hooks common to every pluggable component.
pub trait Feature: Send + Sync {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Stable type token; the registry holds at most one feature per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Dispatcher,
    Router,
    OutboundManager,
    PolicyManager,
    StatsManager,
    DnsClient,
    FakeDns,
}

impl std::fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FeatureKind::Dispatcher => "dispatcher",
            FeatureKind::Router => "router",
            FeatureKind::OutboundManager => "outbound-manager",
            FeatureKind::PolicyManager => "policy-manager",
            FeatureKind::StatsManager => "stats-manager",
            FeatureKind::DnsClient => "dns-client",
            FeatureKind::FakeDns => "fakedns",
        };
        write!(f, "{}", name)
    }
}

/// A registered feature, typed by kind.
#[derive(Clone)]
pub enum FeatureHandle {
    Dispatcher(Arc<crate::app::Dispatcher>),
    Router(Arc<dyn crate::router::Router>),
    OutboundManager(Arc<dyn OutboundManager>),
    PolicyManager(Arc<dyn PolicyManager>),
    StatsManager(Arc<dyn StatsManager>),
    DnsClient(Arc<dyn DnsClient>),
    FakeDns(Arc<dyn FakeDns>),
}

impl FeatureHandle {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureHandle::Dispatcher(_) => FeatureKind::Dispatcher,
            FeatureHandle::Router(_) => FeatureKind::Router,
            FeatureHandle::OutboundManager(_) => FeatureKind::OutboundManager,
            FeatureHandle::PolicyManager(_) => FeatureKind::PolicyManager,
            FeatureHandle::StatsManager(_) => FeatureKind::StatsManager,
            FeatureHandle::DnsClient(_) => FeatureKind::DnsClient,
            FeatureHandle::FakeDns(_) => FeatureKind::FakeDns,
        }
    }

    pub fn start(&self) -> Result<()> {
        match self {
            FeatureHandle::Dispatcher(f) => f.start(),
            FeatureHandle::Router(f) => f.start(),
            FeatureHandle::OutboundManager(f) => f.start(),
            FeatureHandle::PolicyManager(f) => f.start(),
            FeatureHandle::StatsManager(f) => f.start(),
            FeatureHandle::DnsClient(f) => f.start(),
            FeatureHandle::FakeDns(f) => f.start(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            FeatureHandle::Dispatcher(f) => f.close(),
            FeatureHandle::Router(f) => f.close(),
            FeatureHandle::OutboundManager(f) => f.close(),
            FeatureHandle::PolicyManager(f) => f.close(),
            FeatureHandle::StatsManager(f) => f.close(),
            FeatureHandle::DnsClient(f) => f.close(),
            FeatureHandle::FakeDns(f) => f.close(),
        }
    }
}

/// Immutable snapshot of registered features handed to resolutions.
#[derive(Clone, Default)]
pub struct FeatureSet {
    features: Vec<FeatureHandle>,
}

impl FeatureSet {
    pub fn get(&self, kind: FeatureKind) -> Option<FeatureHandle> {
        self.features.iter().find(|f| f.kind() == kind).cloned()
    }

    pub fn has(&self, kind: FeatureKind) -> bool {
        self.features.iter().any(|f| f.kind() == kind)
    }

    pub fn dispatcher(&self) -> Option<Arc<crate::app::Dispatcher>> {
        match self.get(FeatureKind::Dispatcher) {
            Some(FeatureHandle::Dispatcher(d)) => Some(d),
            _ => None,
        }
    }

    pub fn router(&self) -> Option<Arc<dyn crate::router::Router>> {
        match self.get(FeatureKind::Router) {
            Some(FeatureHandle::Router(r)) => Some(r),
            _ => None,
        }
    }

    pub fn outbound_manager(&self) -> Option<Arc<dyn OutboundManager>> {
        match self.get(FeatureKind::OutboundManager) {
            Some(FeatureHandle::OutboundManager(m)) => Some(m),
            _ => None,
        }
    }

    pub fn policy_manager(&self) -> Option<Arc<dyn PolicyManager>> {
        match self.get(FeatureKind::PolicyManager) {
            Some(FeatureHandle::PolicyManager(m)) => Some(m),
            _ => None,
        }
    }

    pub fn stats_manager(&self) -> Option<Arc<dyn StatsManager>> {
        match self.get(FeatureKind::StatsManager) {
            Some(FeatureHandle::StatsManager(m)) => Some(m),
            _ => None,
        }
    }

    pub fn dns_client(&self) -> Option<Arc<dyn DnsClient>> {
        match self.get(FeatureKind::DnsClient) {
            Some(FeatureHandle::DnsClient(c)) => Some(c),
            _ => None,
        }
    }

    pub fn fake_dns(&self) -> Option<Arc<dyn FakeDns>> {
        match self.get(FeatureKind::FakeDns) {
            Some(FeatureHandle::FakeDns(f)) => Some(f),
            _ => None,
        }
    }
}

type ResolutionCallback = Box<dyn FnOnce(&FeatureSet) -> Result<()> + Send>;

/// A deferred callback waiting for its required kinds to register.
struct Resolution {
    deps: Vec<FeatureKind>,
    callback: ResolutionCallback,
}

impl Resolution {
    fn satisfied_by(&self, set: &FeatureSet) -> bool {
        self.deps.iter().all(|k| set.has(*k))
    }
}

#[derive(Default)]
struct RegistryState {
    features: Vec<FeatureHandle>,
    resolutions: Vec<Resolution>,
    running: bool,
}

/// Shared feature registry. A single mutex serializes registration,
/// resolution firing and lifecycle transitions.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature. Rejects a second feature of the same kind.
    /// When the registry is already running the feature starts
    /// immediately. Resolutions satisfied by this addition fire before
    /// `add` returns; the first failing resolution aborts registration.
    pub fn add(&self, handle: FeatureHandle) -> Result<()> {
        let (ready, start_now) = {
            let mut state = self.state.lock().unwrap();
            if state.features.iter().any(|f| f.kind() == handle.kind()) {
                return Err(Error::Config(format!(
                    "duplicate feature: {}",
                    handle.kind()
                )));
            }
            debug!("registering feature: {}", handle.kind());
            state.features.push(handle.clone());

            let set = FeatureSet {
                features: state.features.clone(),
            };
            let mut ready = Vec::new();
            let mut pending = Vec::new();
            for r in state.resolutions.drain(..) {
                if r.satisfied_by(&set) {
                    ready.push(r);
                } else {
                    pending.push(r);
                }
            }
            state.resolutions = pending;
            let ready: Vec<_> = ready
                .into_iter()
                .map(|r| (r.callback, set.clone()))
                .collect();
            (ready, state.running)
        };

        if start_now {
            if let Err(e) = handle.start() {
                warn!("failed to start feature {}: {}", handle.kind(), e);
            }
        }

        for (callback, set) in ready {
            callback(&set)?;
        }
        Ok(())
    }

    /// Invoke `callback` as soon as every kind in `deps` is registered;
    /// immediately when they already are.
    pub fn require(
        &self,
        deps: &[FeatureKind],
        callback: impl FnOnce(&FeatureSet) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let immediate = {
            let mut state = self.state.lock().unwrap();
            let set = FeatureSet {
                features: state.features.clone(),
            };
            let resolution = Resolution {
                deps: deps.to_vec(),
                callback: Box::new(callback),
            };
            if resolution.satisfied_by(&set) {
                Some((resolution.callback, set))
            } else {
                state.resolutions.push(resolution);
                None
            }
        };

        match immediate {
            Some((callback, set)) => callback(&set),
            None => Ok(()),
        }
    }

    /// The registered feature of the given kind, if any.
    pub fn get(&self, kind: FeatureKind) -> Option<FeatureHandle> {
        self.state
            .lock()
            .unwrap()
            .features
            .iter()
            .find(|f| f.kind() == kind)
            .cloned()
    }

    /// Snapshot of the currently registered features.
    pub fn snapshot(&self) -> FeatureSet {
        FeatureSet {
            features: self.state.lock().unwrap().features.clone(),
        }
    }

    pub fn pending_resolutions(&self) -> usize {
        self.state.lock().unwrap().resolutions.len()
    }

    /// Transition to running and start every feature in registration
    /// order. Fails when called twice, when resolutions are still pending,
    /// or when any feature fails to start.
    pub fn start(&self) -> Result<()> {
        let features = {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(Error::Config("instance already started".to_string()));
            }
            if !state.resolutions.is_empty() {
                return Err(Error::Config(format!(
                    "{} feature dependencies left unresolved",
                    state.resolutions.len()
                )));
            }
            state.running = true;
            state.features.clone()
        };

        for f in &features {
            f.start()?;
        }
        Ok(())
    }

    /// Close every feature in reverse registration order, collecting
    /// errors.
    pub fn close(&self) -> Result<()> {
        let features = {
            let mut state = self.state.lock().unwrap();
            state.running = false;
            state.features.clone()
        };

        let mut failures = Vec::new();
        for f in features.iter().rev() {
            if let Err(e) = f.close() {
                failures.push(format!("{}: {}", f.kind(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "failed to close all features: {}",
                failures.join("; ")
            )))
        }
    }
}
