//! End-to-end dispatch scenarios: byte fidelity, sniffing and override
//! behavior, routing fallback, accounting and lifecycle teardown.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::Notify;

use nodus::app::{Dispatcher, DispatcherConfig, Instance};
use nodus::common::log::AccessMessage;
use nodus::common::{
    Address, Destination, InboundMetadata, Link, MultiBuffer, Session, SniffingRequest, User,
};
use nodus::features::{
    FakeDns, FakeDnsEngine, FeatureHandle, HandlerManager, InMemoryStatsManager, OutboundHandler,
    OutboundManager, Policy, StatsManager,
};
use nodus::features::policy::{BufferPolicy, LevelPolicyManager, StatsPolicy};
use nodus::router::StaticRouter;
use nodus::Error;

/// What the outbound observed when its dispatch ran.
#[derive(Debug, Clone)]
struct SeenDispatch {
    target: Option<Destination>,
    protocol: String,
}

/// Test outbound: records the session state at dispatch time, optionally
/// writes a canned response, then drains the uplink until it ends.
struct TestOutbound {
    tag: String,
    seen: Arc<Mutex<Option<SeenDispatch>>>,
    collected: Arc<Mutex<Vec<u8>>>,
    respond_with: Vec<u8>,
    finished: Arc<Notify>,
}

impl TestOutbound {
    fn new(tag: &str) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            seen: Arc::new(Mutex::new(None)),
            collected: Arc::new(Mutex::new(Vec::new())),
            respond_with: Vec::new(),
            finished: Arc::new(Notify::new()),
        })
    }

    fn with_response(tag: &str, response: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            seen: Arc::new(Mutex::new(None)),
            collected: Arc::new(Mutex::new(Vec::new())),
            respond_with: response,
            finished: Arc::new(Notify::new()),
        })
    }

    async fn wait_seen(&self, timeout: Duration) -> SeenDispatch {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(seen) = self.seen.lock().unwrap().clone() {
                return seen;
            }
            assert!(Instant::now() < deadline, "outbound was never dispatched");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl OutboundHandler for TestOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, session: Arc<Session>, link: Link) {
        *self.seen.lock().unwrap() = Some(SeenDispatch {
            target: session.target(),
            protocol: session.sniffed_protocol(),
        });

        if !self.respond_with.is_empty() {
            let _ = link
                .writer
                .write_multi(MultiBuffer::from_bytes(&self.respond_with))
                .await;
        }

        while let Ok(mb) = link.reader.read_multi().await {
            self.collected.lock().unwrap().extend(mb.to_bytes());
        }

        link.shutdown();
        self.finished.notify_one();
    }
}

struct TestBed {
    instance: Instance,
    dispatcher: Arc<Dispatcher>,
}

/// Instance with one outbound handler, optional explicit router and
/// optional fakedns engine.
fn build_instance(
    handler: Arc<dyn OutboundHandler>,
    router: Option<FeatureHandle>,
    fakedns: Option<Arc<FakeDnsEngine>>,
) -> TestBed {
    let instance = Instance::new();

    let manager = Arc::new(HandlerManager::new());
    manager.add(handler).unwrap();
    instance
        .add_feature(FeatureHandle::OutboundManager(manager))
        .unwrap();

    if let Some(router) = router {
        instance.add_feature(router).unwrap();
    }
    if let Some(engine) = fakedns {
        instance
            .add_feature(FeatureHandle::FakeDns(engine as Arc<dyn FakeDns>))
            .unwrap();
    }

    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    dispatcher.register(instance.registry()).unwrap();
    instance.ensure_essential_features().unwrap();
    instance.start().unwrap();

    let dispatcher = instance.dispatcher().unwrap();
    TestBed {
        instance,
        dispatcher,
    }
}

fn session_with_tag(instance: &Instance, tag: &str) -> Arc<Session> {
    instance.new_session(InboundMetadata {
        tag: tag.to_string(),
        ..Default::default()
    })
}

fn sniff_request(overrides: &[&str], excludes: &[&str]) -> SniffingRequest {
    SniffingRequest::new(
        true,
        overrides.iter().map(|s| s.to_string()).collect(),
        excludes.iter().map(|s| s.to_string()).collect(),
    )
}

/// Minimal TLS ClientHello record carrying one SNI entry.
fn client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0u8; 32]);
    hello.push(0x00);
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);

    let mut ext = Vec::new();
    ext.extend_from_slice(&[0x00, 0x00]);
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext.push(0x00);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    hello.extend_from_slice(&ext);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_tcp_passthrough_without_sniffing() {
    let outbound = TestOutbound::new("direct");
    let bed = build_instance(
        outbound.clone(),
        Some(FeatureHandle::Router(Arc::new(StaticRouter::new("direct")))),
        None,
    );

    let session = session_with_tag(&bed.instance, "");
    session.attach_access_message(AccessMessage::accepted("client", "tcp:example.com:443"));

    let mut payload = vec![0u8; 64 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let link = bed
        .dispatcher
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::domain("example.com", 443)),
        )
        .unwrap();

    for chunk in payload.chunks(8 * 1024) {
        link.writer
            .write_multi(MultiBuffer::from_bytes(chunk))
            .await
            .unwrap();
    }
    link.writer.close();

    tokio::time::timeout(Duration::from_secs(2), outbound.finished.notified())
        .await
        .expect("relay did not finish in time");

    assert_eq!(*outbound.collected.lock().unwrap(), payload);
    assert_eq!(session.access_message().unwrap().detour, "direct");

    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn http_host_sniffing_overrides_destination() {
    let outbound = TestOutbound::new("direct");
    let bed = build_instance(outbound.clone(), None, None);

    let session = session_with_tag(&bed.instance, "in");
    session.set_sniffing_request(sniff_request(&["http"], &[]));

    let link = bed
        .dispatcher
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::ip_port("1.2.3.4".parse().unwrap(), 80)),
        )
        .unwrap();

    link.writer
        .write_multi(MultiBuffer::from_bytes(
            b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n",
        ))
        .await
        .unwrap();

    let seen = outbound.wait_seen(Duration::from_secs(2)).await;
    assert_eq!(
        seen.target,
        Some(Destination::tcp(Address::domain("example.org", 80)))
    );
    assert_eq!(seen.protocol, "http");
    assert_eq!(session.sniffed_protocol(), "http");

    link.writer.close();
    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_domain_is_not_overridden() {
    let outbound = TestOutbound::new("direct");
    let bed = build_instance(outbound.clone(), None, None);

    let session = session_with_tag(&bed.instance, "in");
    session.set_sniffing_request(sniff_request(&["tls"], &["secret.internal"]));

    let original = Destination::tcp(Address::ip_port("1.2.3.4".parse().unwrap(), 443));
    let link = bed
        .dispatcher
        .dispatch(Arc::clone(&session), original.clone())
        .unwrap();

    link.writer
        .write_multi(MultiBuffer::from_bytes(&client_hello("secret.internal")))
        .await
        .unwrap();

    let seen = outbound.wait_seen(Duration::from_secs(2)).await;
    assert_eq!(seen.target, Some(original));
    assert_eq!(seen.protocol, "tls");

    link.writer.close();
    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn fakedns_ip_is_mapped_back_to_domain() {
    let engine = Arc::new(FakeDnsEngine::with_default_pool());
    let fake_ip = engine.fake_ip_for_domain("foo.example")[0];

    let outbound = TestOutbound::new("direct");
    let bed = build_instance(outbound.clone(), None, Some(engine));

    let session = session_with_tag(&bed.instance, "in");
    session.set_sniffing_request(sniff_request(&["fakedns"], &[]));

    let link = bed
        .dispatcher
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::ip_port(fake_ip, 443)),
        )
        .unwrap();

    link.writer
        .write_multi(MultiBuffer::from_bytes(&client_hello("foo.example")))
        .await
        .unwrap();

    let seen = outbound.wait_seen(Duration::from_secs(2)).await;
    assert_eq!(
        seen.target,
        Some(Destination::tcp(Address::domain("foo.example", 443)))
    );
    assert_eq!(seen.protocol, "fakedns");

    link.writer.close();
    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sniffing_timeout_does_not_abort_the_connection() {
    let outbound = TestOutbound::new("direct");
    let bed = build_instance(outbound.clone(), None, None);

    let session = session_with_tag(&bed.instance, "in");
    session.set_sniffing_request(sniff_request(&["http", "tls"], &[]));

    let original = Destination::tcp(Address::domain("example.com", 443));
    let link = bed
        .dispatcher
        .dispatch(Arc::clone(&session), original.clone())
        .unwrap();

    // Write nothing: two empty 100 ms cache rounds must elapse, then the
    // dispatch proceeds with the unmodified destination.
    let seen = outbound.wait_seen(Duration::from_secs(2)).await;
    assert_eq!(seen.target, Some(original));
    assert_eq!(seen.protocol, "");

    // The connection still relays bytes written after the timeout.
    link.writer
        .write_multi(MultiBuffer::from_bytes(b"late payload"))
        .await
        .unwrap();
    link.writer.close();
    tokio::time::timeout(Duration::from_secs(2), outbound.finished.notified())
        .await
        .unwrap();
    assert_eq!(*outbound.collected.lock().unwrap(), b"late payload");

    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn router_miss_falls_back_to_default_handler() {
    let outbound = TestOutbound::new("direct");
    // No explicit router: the essential default never matches.
    let bed = build_instance(outbound.clone(), None, None);

    let session = session_with_tag(&bed.instance, "in");
    session.attach_access_message(AccessMessage::accepted("client", "tcp:example.com:80"));

    let link = bed
        .dispatcher
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::domain("example.com", 80)),
        )
        .unwrap();

    outbound.wait_seen(Duration::from_secs(2)).await;
    assert_eq!(session.access_message().unwrap().detour, "in >> direct");

    link.writer.close();
    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_access_log_leaves_records_untouched() {
    let outbound = TestOutbound::new("direct");

    let instance = Instance::new();
    let manager = Arc::new(HandlerManager::new());
    manager.add(outbound.clone()).unwrap();
    instance
        .add_feature(FeatureHandle::OutboundManager(manager))
        .unwrap();

    let dispatcher = Dispatcher::new(DispatcherConfig {
        log_access: false,
        ..Default::default()
    });
    dispatcher.register(instance.registry()).unwrap();
    instance.ensure_essential_features().unwrap();
    instance.start().unwrap();

    let session = session_with_tag(&instance, "in");
    session.attach_access_message(AccessMessage::accepted("client", "tcp:example.com:80"));

    let link = instance
        .dispatcher()
        .unwrap()
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::domain("example.com", 80)),
        )
        .unwrap();

    outbound.wait_seen(Duration::from_secs(2)).await;
    // The record stays exactly as the acceptor attached it.
    assert_eq!(session.access_message().unwrap().detour, "");

    link.writer.close();
    instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn user_traffic_is_accounted_per_direction() {
    let outbound = TestOutbound::with_response("direct", vec![0xBBu8; 3000]);

    let instance = Instance::new();
    let stats = Arc::new(InMemoryStatsManager::new());
    instance
        .add_feature(FeatureHandle::StatsManager(
            Arc::clone(&stats) as Arc<dyn StatsManager>
        ))
        .unwrap();

    let mut levels = std::collections::HashMap::new();
    levels.insert(
        1,
        Policy {
            stats: StatsPolicy {
                user_uplink: true,
                user_downlink: true,
            },
            buffer: BufferPolicy {
                per_connection: None,
            },
            ..Default::default()
        },
    );
    instance
        .add_feature(FeatureHandle::PolicyManager(Arc::new(
            LevelPolicyManager::new(levels, Policy::default()),
        )))
        .unwrap();

    let manager = Arc::new(HandlerManager::new());
    manager.add(outbound.clone()).unwrap();
    instance
        .add_feature(FeatureHandle::OutboundManager(manager))
        .unwrap();

    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    dispatcher.register(instance.registry()).unwrap();
    instance.ensure_essential_features().unwrap();
    instance.start().unwrap();

    let session = instance.new_session(InboundMetadata {
        tag: "in".to_string(),
        user: Some(User {
            id: uuid::Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            level: 1,
        }),
        ..Default::default()
    });

    let link = instance
        .dispatcher()
        .unwrap()
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::domain("example.com", 443)),
        )
        .unwrap();

    link.writer
        .write_multi(MultiBuffer::from_bytes(&vec![0xAAu8; 5000]))
        .await
        .unwrap();
    link.writer.close();

    tokio::time::timeout(Duration::from_secs(2), outbound.finished.notified())
        .await
        .unwrap();

    // Drain the downlink so the response definitely passed the stat
    // wrapper.
    let mut received = Vec::new();
    while let Ok(mb) = link.reader.read_multi().await {
        received.extend(mb.to_bytes());
    }
    assert_eq!(received.len(), 3000);

    let uplink = stats
        .get_counter("user>>>alice@example.com>>>traffic>>>uplink")
        .expect("uplink counter registered");
    let downlink = stats
        .get_counter("user>>>alice@example.com>>>traffic>>>downlink")
        .expect("downlink counter registered");
    assert_eq!(uplink.value(), 5000);
    assert_eq!(downlink.value(), 3000);

    instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_destination_is_rejected() {
    let outbound = TestOutbound::new("direct");
    let bed = build_instance(outbound.clone(), None, None);
    let session = session_with_tag(&bed.instance, "in");

    let err = bed
        .dispatcher
        .dispatch(session, Destination::tcp(Address::domain("", 443)))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDestination(_)));

    bed.instance.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn instance_close_tears_down_live_connections() {
    let outbound = TestOutbound::new("direct");
    let bed = build_instance(outbound.clone(), None, None);

    let session = session_with_tag(&bed.instance, "in");
    let link = bed
        .dispatcher
        .dispatch(
            Arc::clone(&session),
            Destination::tcp(Address::domain("example.com", 443)),
        )
        .unwrap();

    // The handler is now blocked reading an idle uplink.
    outbound.wait_seen(Duration::from_secs(2)).await;

    bed.instance.close().unwrap();

    // Cancellation must unblock the handler within the grace period.
    tokio::time::timeout(Duration::from_secs(1), outbound.finished.notified())
        .await
        .expect("outbound task leaked after close");

    // The inbound side observes the teardown too.
    assert!(link.reader.read_multi().await.is_err());

    // Sessions created after close are dead on arrival.
    let late = session_with_tag(&bed.instance, "in");
    assert!(late.cancellation().is_cancelled());
}
