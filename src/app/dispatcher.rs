//! Dispatcher - Core Execution Flow
//!
//! The dispatcher is the heart of the proxy system. For every accepted
//! connection it builds the two pipes that join inbound and outbound,
//! optionally sniffs the first bytes to learn the true destination,
//! consults the router, and hands the outbound side of the link to the
//! selected handler. The inbound side is returned to the acceptor
//! immediately; everything else continues asynchronously.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::address::{Destination, Network};
use crate::common::buffer::{Buffer, MultiBuffer, BUFFER_SIZE};
use crate::common::log;
use crate::common::pipe::{new_pipe, Link, LinkReader, LinkWriter, PipeError, PipeReader};
use crate::common::session::{Session, SniffingRequest};
use crate::error::{Error, Result};
use crate::features::{
    user_downlink_counter_name, user_uplink_counter_name, Counter, Feature, FeatureKind,
    OutboundHandler, OutboundManager, PolicyManager, Registry, StatsManager,
};
use crate::router::{Router, RoutingContext};
use crate::sniff::{SniffError, SniffResult, Sniffer};

use super::metrics::{
    DISPATCHER_CONNECTIONS_ACTIVE, DISPATCHER_CONNECTIONS_FAILED, DISPATCHER_CONNECTIONS_TOTAL,
    ROUTER_DEFAULTS_TOTAL, ROUTER_PICKS_TOTAL, SNIFF_RESULTS,
};

/// Sniffing budget knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Payload cache-and-sniff rounds before giving up.
    pub sniff_attempts: u32,
    /// How long one cache round waits for client bytes.
    pub sniff_cache_timeout: Duration,
    /// Emit access records for sessions that carry one.
    pub log_access: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sniff_attempts: 2,
            sniff_cache_timeout: Duration::from_millis(100),
            log_access: true,
        }
    }
}

struct Deps {
    router: Arc<dyn Router>,
    outbounds: Arc<dyn OutboundManager>,
    policy: Arc<dyn PolicyManager>,
    stats: Arc<dyn StatsManager>,
}

/// Routes accepted connections onto outbound handlers.
pub struct Dispatcher {
    config: DispatcherConfig,
    deps: OnceLock<Deps>,
    registry: OnceLock<Weak<Registry>>,
}

impl Feature for Dispatcher {}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            deps: OnceLock::new(),
            registry: OnceLock::new(),
        })
    }

    /// Register into `registry`: the dispatcher binds its required
    /// collaborators through a deferred resolution and is added as the
    /// dispatcher feature.
    pub fn register(self: &Arc<Self>, registry: &Arc<Registry>) -> Result<()> {
        let _ = self.registry.set(Arc::downgrade(registry));

        let this = Arc::clone(self);
        registry.require(
            &[
                FeatureKind::Router,
                FeatureKind::OutboundManager,
                FeatureKind::PolicyManager,
                FeatureKind::StatsManager,
            ],
            move |set| {
                let missing = |kind: FeatureKind| Error::Config(format!("{} missing", kind));
                let deps = Deps {
                    router: set.router().ok_or_else(|| missing(FeatureKind::Router))?,
                    outbounds: set
                        .outbound_manager()
                        .ok_or_else(|| missing(FeatureKind::OutboundManager))?,
                    policy: set
                        .policy_manager()
                        .ok_or_else(|| missing(FeatureKind::PolicyManager))?,
                    stats: set
                        .stats_manager()
                        .ok_or_else(|| missing(FeatureKind::StatsManager))?,
                };
                let _ = this.deps.set(deps);
                Ok(())
            },
        )?;

        registry.add(crate::features::FeatureHandle::Dispatcher(Arc::clone(self)))
    }

    fn deps(&self) -> Result<&Deps> {
        self.deps
            .get()
            .ok_or_else(|| Error::Config("dispatcher dependencies unresolved".to_string()))
    }

    fn fake_dns(&self) -> Option<Arc<dyn crate::features::FakeDns>> {
        self.registry
            .get()
            .and_then(Weak::upgrade)
            .and_then(|registry| registry.snapshot().fake_dns())
    }

    /// Dispatch one connection toward `destination`. Returns the inbound
    /// side of the link; the outbound side is carried forward
    /// asynchronously through sniffing and routing.
    pub fn dispatch(
        self: &Arc<Self>,
        session: Arc<Session>,
        destination: Destination,
    ) -> Result<Link> {
        if !destination.is_valid() {
            return Err(Error::InvalidDestination(destination.to_string()));
        }
        let deps = self.deps()?;

        DISPATCHER_CONNECTIONS_TOTAL.inc();
        DISPATCHER_CONNECTIONS_ACTIVE.inc();

        session.set_target(destination.clone());
        let (inbound_link, outbound_writer, uplink_reader) = self.build_links(&session, deps);

        let request = session.content().sniffing_request;
        if !request.enabled {
            let this = Arc::clone(self);
            let outbound_link = Link {
                reader: Box::new(uplink_reader),
                writer: outbound_writer,
            };
            tokio::spawn(async move {
                this.routed_dispatch(session, outbound_link, destination).await;
            });
        } else if destination.network != Network::Tcp {
            // Only metadata sniffing is possible without a byte stream.
            let sniffer = Sniffer::new(self.fake_dns());
            let mut destination = destination;
            if let Ok(result) = sniffer.sniff_metadata(&session) {
                session.set_sniffed_protocol(result.protocol());
                SNIFF_RESULTS.with_label_values(&[result.protocol()]).inc();
                if self.should_override(&result, &request, &destination) {
                    debug!("sniffed domain {} for {}", result.domain(), session.id());
                    destination = destination.with_host(result.domain());
                    session.set_target(destination.clone());
                }
            }
            let this = Arc::clone(self);
            let outbound_link = Link {
                reader: Box::new(uplink_reader),
                writer: outbound_writer,
            };
            tokio::spawn(async move {
                this.routed_dispatch(session, outbound_link, destination).await;
            });
        } else {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let cached = CachedReader::new(uplink_reader);
                let mut destination = destination;
                match this
                    .sniff(&session, &cached, request.metadata_only)
                    .await
                {
                    Ok(result) => {
                        session.set_sniffed_protocol(result.protocol());
                        SNIFF_RESULTS.with_label_values(&[result.protocol()]).inc();
                        if this.should_override(&result, &request, &destination) {
                            debug!(
                                "sniffed domain {} for {}",
                                result.domain(),
                                session.id()
                            );
                            destination = destination.with_host(result.domain());
                            session.set_target(destination.clone());
                        }
                    }
                    Err(e) => debug!("sniffing inconclusive for {}: {}", session.id(), e),
                }
                let outbound_link = Link {
                    reader: Box::new(cached),
                    writer: outbound_writer,
                };
                this.routed_dispatch(session, outbound_link, destination).await;
            });
        }

        Ok(inbound_link)
    }

    /// Two crossed pipes: bytes the inbound writes surface at the outbound
    /// reader and vice-versa. Per-user traffic counters wrap the writers
    /// when the user's policy asks for them.
    fn build_links(
        &self,
        session: &Arc<Session>,
        deps: &Deps,
    ) -> (Link, Box<dyn LinkWriter>, PipeReader) {
        let token = session.cancellation().clone();
        let level = session.user().map(|u| u.level).unwrap_or(0);
        let policy = deps.policy.for_level(level);
        let limit = policy.buffer.per_connection;

        let (uplink_reader, uplink_writer) = new_pipe(limit, token.clone());
        let (downlink_reader, downlink_writer) = new_pipe(limit, token);

        let mut inbound_writer: Box<dyn LinkWriter> = Box::new(uplink_writer);
        let mut outbound_writer: Box<dyn LinkWriter> = Box::new(downlink_writer);

        if let Some(user) = session.user() {
            if !user.email.is_empty() {
                if policy.stats.user_uplink {
                    let name = user_uplink_counter_name(&user.email);
                    if let Some(counter) = deps.stats.get_or_register_counter(&name) {
                        inbound_writer = Box::new(SizeStatWriter::new(counter, inbound_writer));
                    }
                }
                if policy.stats.user_downlink {
                    let name = user_downlink_counter_name(&user.email);
                    if let Some(counter) = deps.stats.get_or_register_counter(&name) {
                        outbound_writer = Box::new(SizeStatWriter::new(counter, outbound_writer));
                    }
                }
            }
        }

        let inbound_link = Link {
            reader: Box::new(downlink_reader),
            writer: inbound_writer,
        };
        (inbound_link, outbound_writer, uplink_reader)
    }

    /// Metadata sniffing plus up to `sniff_attempts` cache-and-sniff
    /// rounds over the uplink. A payload failure falls back to the
    /// metadata result; both succeeding composes them.
    async fn sniff(
        &self,
        session: &Arc<Session>,
        cached: &CachedReader,
        metadata_only: bool,
    ) -> std::result::Result<SniffResult, SniffError> {
        let mut sniffer = Sniffer::new(self.fake_dns());
        let metadata_result = sniffer.sniff_metadata(session);

        if metadata_only {
            return metadata_result;
        }

        let payload_result = self.sniff_payload(session, cached, &mut sniffer).await;

        match (metadata_result, payload_result) {
            (Ok(meta), Err(_)) => Ok(meta),
            (Ok(meta), Ok(payload)) => Ok(SniffResult::composite(&meta, &payload)),
            (Err(_), payload) => payload,
        }
    }

    async fn sniff_payload(
        &self,
        session: &Arc<Session>,
        cached: &CachedReader,
        sniffer: &mut Sniffer,
    ) -> std::result::Result<SniffResult, SniffError> {
        let mut payload = Buffer::new();
        let mut attempts = 0u32;
        loop {
            if session.cancellation().is_cancelled() {
                return Err(SniffError::Interrupted);
            }
            attempts += 1;
            if attempts > self.config.sniff_attempts {
                return Err(SniffError::Timeout);
            }

            cached
                .cache_into(&mut payload, self.config.sniff_cache_timeout)
                .await;
            if !payload.is_empty() {
                match sniffer.sniff(session, payload.bytes()) {
                    Err(SniffError::NoClue) => {}
                    other => return other,
                }
            }
            if payload.is_full() {
                return Err(SniffError::UnknownContent);
            }
        }
    }

    /// The destination is overridden iff the sniffed domain is not
    /// excluded, and either the routing protocol matches a configured
    /// prefix or the fakedns condition holds (target inside the fake pool,
    /// protocol not bittorrent).
    fn should_override(
        &self,
        result: &SniffResult,
        request: &SniffingRequest,
        destination: &Destination,
    ) -> bool {
        let domain = result.domain();
        if domain.is_empty() || request.excludes(domain) {
            return false;
        }
        let protocol = result.protocol_for_routing();
        for prefix in &request.override_destination_for_protocol {
            if protocol.starts_with(prefix.as_str()) {
                return true;
            }
            if prefix == "fakedns" && protocol != "bittorrent" {
                if let (Some(ip), Some(fdns)) = (destination.address.ip(), self.fake_dns()) {
                    if fdns.fake_ip_range().contains(&ip) {
                        debug!("overriding by sniffer {} after fakedns miss", protocol);
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Pick a route (unless suppressed), resolve the handler with
    /// default fallback, emit the access record, and hand over the link.
    async fn routed_dispatch(&self, session: Arc<Session>, link: Link, destination: Destination) {
        let deps = match self.deps() {
            Ok(deps) => deps,
            Err(e) => {
                warn!("{}", e);
                link.shutdown();
                DISPATCHER_CONNECTIONS_ACTIVE.dec();
                return;
            }
        };

        let content = session.content();
        let in_tag = session.inbound().tag.clone();
        let mut handler: Option<Arc<dyn OutboundHandler>> = None;
        let mut picked_route = false;

        if !content.skip_route_pick {
            let ctx = RoutingContext {
                inbound_tag: in_tag.clone(),
                source: session.inbound().source.clone(),
                network: destination.network,
                destination: destination.clone(),
                sniffed_protocol: content.protocol.clone(),
                user_email: session.user().map(|u| u.email.clone()),
            };
            match deps.router.pick_route(&ctx) {
                Ok(route) => {
                    picked_route = true;
                    ROUTER_PICKS_TOTAL.inc();
                    match deps.outbounds.get(&route.outbound_tag) {
                        Some(h) => {
                            debug!(
                                "taking detour [{}] for [{}]",
                                route.outbound_tag, destination
                            );
                            handler = Some(h);
                        }
                        None => warn!("non existing outbound tag: {}", route.outbound_tag),
                    }
                }
                Err(_) => {
                    ROUTER_DEFAULTS_TOTAL.inc();
                    debug!("default route for {}", destination);
                }
            }
        }

        let handler = handler.or_else(|| deps.outbounds.default_handler());
        let Some(handler) = handler else {
            warn!("default outbound handler not set");
            DISPATCHER_CONNECTIONS_FAILED.inc();
            DISPATCHER_CONNECTIONS_ACTIVE.dec();
            link.shutdown();
            return;
        };

        if self.config.log_access && session.access_message().is_some() {
            let out_tag = handler.tag();
            if !out_tag.is_empty() {
                let detour = if in_tag.is_empty() {
                    out_tag.to_string()
                } else if picked_route {
                    format!("{} -> {}", in_tag, out_tag)
                } else {
                    format!("{} >> {}", in_tag, out_tag)
                };
                session.update_access_detour(detour);
            }
            if let Some(message) = session.access_message() {
                log::record(&message);
            }
        }

        handler.dispatch(session, link).await;
        DISPATCHER_CONNECTIONS_ACTIVE.dec();
    }
}

/// Tees up to one buffer of uplink bytes so sniffing can peek without
/// consuming. Every byte read from the underlying pipe is delivered
/// exactly once downstream, however many peeks happened first.
pub struct CachedReader {
    reader: PipeReader,
    cache: Mutex<MultiBuffer>,
}

impl CachedReader {
    pub fn new(reader: PipeReader) -> Self {
        Self {
            reader,
            cache: Mutex::new(MultiBuffer::new()),
        }
    }

    /// One short bounded read off the pipe, appended to the cache; `out`
    /// is refilled with the first `BUFFER_SIZE` bytes of the cache.
    pub async fn cache_into(&self, out: &mut Buffer, timeout: Duration) {
        let incoming = self.reader.read_multi_timeout(timeout).await;
        let mut cache = self.cache.lock().unwrap();
        if let Ok(mb) = incoming {
            if !mb.is_empty() {
                cache.extend(mb);
            }
        }
        out.clear();
        let mut staging = [0u8; BUFFER_SIZE];
        let n = cache.copy_to(&mut staging);
        out.write(&staging[..n]);
    }

    fn drain_cache(&self) -> Option<MultiBuffer> {
        let mut cache = self.cache.lock().unwrap();
        if cache.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *cache))
        }
    }
}

#[async_trait::async_trait]
impl LinkReader for CachedReader {
    async fn read_multi(&self) -> std::result::Result<MultiBuffer, PipeError> {
        match self.drain_cache() {
            Some(mb) => Ok(mb),
            None => self.reader.read_multi().await,
        }
    }

    async fn read_multi_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<MultiBuffer, PipeError> {
        match self.drain_cache() {
            Some(mb) => Ok(mb),
            None => self.reader.read_multi_timeout(timeout).await,
        }
    }

    fn interrupt(&self) {
        self.cache.lock().unwrap().release();
        self.reader.interrupt();
    }
}

/// Counts every byte that passes through a link writer.
pub struct SizeStatWriter {
    counter: Arc<dyn Counter>,
    writer: Box<dyn LinkWriter>,
}

impl SizeStatWriter {
    pub fn new(counter: Arc<dyn Counter>, writer: Box<dyn LinkWriter>) -> Self {
        Self { counter, writer }
    }
}

#[async_trait::async_trait]
impl LinkWriter for SizeStatWriter {
    async fn write_multi(&self, mb: MultiBuffer) -> std::result::Result<(), PipeError> {
        self.counter.add(mb.len() as i64);
        self.writer.write_multi(mb).await
    }

    fn close(&self) {
        self.writer.close()
    }

    fn interrupt(&self) {
        self.writer.interrupt()
    }
}
