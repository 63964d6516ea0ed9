//! Instance - lifecycle orchestration
//!
//! An Instance owns the feature registry, the root cancellation token that
//! scopes every dispatch, and the start/close state machine. At any time
//! there is at most one running Instance per process configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::session::{InboundMetadata, Session, SniffingRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::features::{
    DefaultPolicyManager, FakeDnsEngine, FeatureHandle, FeatureKind, HandlerManager,
    InMemoryStatsManager, LevelPolicyManager, OutboundManager, Policy, Registry, SystemDnsClient,
};
use crate::features::policy::{BufferPolicy, StatsPolicy};
use crate::protocol::create_handler;
use crate::router::{DefaultRouter, DomainPattern, Rule, RuleRouter};

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::metrics::init_metrics;

/// Combines all registered features into one runnable unit.
pub struct Instance {
    registry: Arc<Registry>,
    root: CancellationToken,
    cone: bool,
    sniffing_defaults: SniffingRequest,
}

impl Instance {
    pub fn new() -> Self {
        init_metrics();
        let cone = std::env::var("XRAY_CONE_DISABLED").as_deref() != Ok("true");
        Self {
            registry: Arc::new(Registry::new()),
            root: CancellationToken::new(),
            cone,
            sniffing_defaults: SniffingRequest::default(),
        }
    }

    /// Build an instance from configuration: stats, policy, router,
    /// fakedns, outbounds and the dispatcher, then the essential
    /// defaults for whatever is still missing.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut instance = Self::new();
        instance.sniffing_defaults = SniffingRequest::new(
            config.sniffing.enabled,
            config.sniffing.dest_override.clone(),
            config.sniffing.domains_excluded.clone(),
        );
        instance.sniffing_defaults.metadata_only = config.sniffing.metadata_only;

        let registry = &instance.registry;

        registry.add(FeatureHandle::StatsManager(Arc::new(
            InMemoryStatsManager::new(),
        )))?;

        if !config.policy.levels.is_empty() {
            let mut levels = HashMap::new();
            for (level, pc) in &config.policy.levels {
                levels.insert(
                    *level,
                    Policy {
                        timeouts: crate::features::policy::TimeoutPolicy {
                            handshake: Duration::from_secs(pc.handshake_secs),
                            connection_idle: Duration::from_secs(pc.conn_idle_secs),
                            ..Default::default()
                        },
                        stats: StatsPolicy {
                            user_uplink: pc.stats_user_uplink,
                            user_downlink: pc.stats_user_downlink,
                        },
                        buffer: BufferPolicy {
                            per_connection: if pc.buffer_size == 0 {
                                None
                            } else {
                                Some(pc.buffer_size)
                            },
                        },
                    },
                );
            }
            registry.add(FeatureHandle::PolicyManager(Arc::new(
                LevelPolicyManager::new(levels, Policy::default()),
            )))?;
        }

        if !config.routing.rules.is_empty() {
            let mut rules = Vec::with_capacity(config.routing.rules.len());
            for rc in &config.routing.rules {
                let domains = rc
                    .domain
                    .iter()
                    .map(|p| DomainPattern::parse(p))
                    .collect::<Result<Vec<_>>>()?;
                let ip_nets = rc
                    .ip
                    .iter()
                    .map(|p| {
                        p.parse()
                            .map_err(|e| Error::Config(format!("bad CIDR {}: {}", p, e)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let networks = rc
                    .network
                    .iter()
                    .map(|n| match n.as_str() {
                        "tcp" => Ok(crate::common::Network::Tcp),
                        "udp" => Ok(crate::common::Network::Udp),
                        other => Err(Error::Config(format!("unknown network: {}", other))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                rules.push(Rule {
                    tag: rc.tag.clone(),
                    inbound_tags: rc.inbound_tag.clone(),
                    networks,
                    protocols: rc.protocol.clone(),
                    domains,
                    ip_nets,
                    ports: rc.port.clone(),
                    outbound_tag: rc.outbound_tag.clone(),
                });
            }
            registry.add(FeatureHandle::Router(Arc::new(RuleRouter::new(rules))))?;
        }

        if let Some(fc) = &config.fakedns {
            let pool = fc
                .ip_pool
                .parse()
                .map_err(|e| Error::Config(format!("bad fakedns pool {}: {}", fc.ip_pool, e)))?;
            registry.add(FeatureHandle::FakeDns(Arc::new(FakeDnsEngine::new(pool))))?;
        }

        let manager = Arc::new(HandlerManager::new());
        for oc in &config.outbounds {
            manager.add(create_handler(&oc.tag, &oc.protocol)?)?;
        }
        if let Some(default_tag) = &config.routing.default_outbound {
            manager.set_default(default_tag)?;
        }
        registry.add(FeatureHandle::OutboundManager(manager))?;

        let dispatcher = Dispatcher::new(DispatcherConfig {
            sniff_attempts: config.sniffing.attempts,
            sniff_cache_timeout: Duration::from_millis(config.sniffing.cache_timeout_ms),
            log_access: config.log.access,
        });
        dispatcher.register(registry)?;

        instance.ensure_essential_features()?;
        Ok(instance)
    }

    /// Inject no-op/system defaults for {dns client, policy manager,
    /// router, stats manager} so the dispatcher always has collaborators.
    pub fn ensure_essential_features(&self) -> Result<()> {
        let set = self.registry.snapshot();
        if !set.has(FeatureKind::DnsClient) {
            self.registry
                .add(FeatureHandle::DnsClient(Arc::new(SystemDnsClient)))?;
        }
        if !set.has(FeatureKind::PolicyManager) {
            self.registry
                .add(FeatureHandle::PolicyManager(Arc::new(DefaultPolicyManager)))?;
        }
        if !set.has(FeatureKind::Router) {
            self.registry
                .add(FeatureHandle::Router(Arc::new(DefaultRouter)))?;
        }
        if !set.has(FeatureKind::StatsManager) {
            self.registry.add(FeatureHandle::StatsManager(Arc::new(
                crate::features::NoopStatsManager,
            )))?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn add_feature(&self, handle: FeatureHandle) -> Result<()> {
        self.registry.add(handle)
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.registry.snapshot().dispatcher()
    }

    pub fn outbound_manager(&self) -> Option<Arc<dyn OutboundManager>> {
        self.registry.snapshot().outbound_manager()
    }

    /// Whether cone NAT behavior is enabled (`XRAY_CONE_DISABLED` unset or
    /// not `"true"`).
    pub fn cone(&self) -> bool {
        self.cone
    }

    /// The sniffing disposition configured for this instance.
    pub fn sniffing_defaults(&self) -> SniffingRequest {
        self.sniffing_defaults.clone()
    }

    /// Create a session scoped to this instance's lifetime with the
    /// configured sniffing defaults attached.
    pub fn new_session(&self, inbound: InboundMetadata) -> Arc<Session> {
        let session = Arc::new(Session::new(inbound, self.cone, self.root.child_token()));
        session.set_sniffing_request(self.sniffing_defaults.clone());
        session
    }

    /// Start every feature in registration order. Fails when dependencies
    /// are unresolved or any feature refuses to start. One start per
    /// instance.
    pub fn start(&self) -> Result<()> {
        self.registry.start()?;
        info!("nodus {} started", env!("CARGO_PKG_VERSION"));
        Ok(())
    }

    /// Cancel every in-flight dispatch and close features in reverse
    /// registration order.
    pub fn close(&self) -> Result<()> {
        self.root.cancel();
        self.registry.close()
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}
