use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_test::assert_ok;

use herald_bus::{
    classifier::{AUTHORIZATION_REASON, BUSINESS_VALIDATION_REASON, INVALID_INPUT_REASON},
    BusConfig, BusError, BusHost, Connections, EntityPath, Envelope, HandlerContext,
    MemoryTransport, MessageHandler, OutboundMessage, QueueBinding, RecordingTelemetry, Registry,
    RegistryError, SendOutcome, SubscriptionFilter, TopicBinding, Transport,
};
use herald_core::{
    AuthRequirement, Critic, FailureKind, HandlerError, HandlerResult, Principal,
    TransactionContext,
};

#[derive(Debug, Deserialize)]
struct Order {
    #[allow(dead_code)]
    id: u32,
    #[serde(default)]
    qty: i64,
}

/// Shared counters a handler reports into.
#[derive(Clone, Default)]
struct CallStats {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl CallStats {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct OrderHandler {
    stats: CallStats,
    delay: Duration,
}

#[async_trait]
impl MessageHandler for OrderHandler {
    type Payload = Envelope<Order>;

    async fn handle(&self, order: Self::Payload, _ctx: HandlerContext) -> HandlerResult {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.stats.running.fetch_sub(1, Ordering::SeqCst);

        if order.body.qty < 0 {
            return Err(HandlerError::business(vec![Critic::critical(
                "NegativeQuantity",
                "qty must not be negative",
            )
            .with_field("qty")]));
        }
        Ok(())
    }
}

fn handler(stats: &CallStats, delay: Duration) -> OrderHandler {
    OrderHandler {
        stats: stats.clone(),
        delay,
    }
}

fn fast_config() -> BusConfig {
    BusConfig {
        receive_wait: Duration::from_millis(20),
        reaper_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(5),
        ..BusConfig::default()
    }
}

struct Fixture {
    host: BusHost,
    transport: MemoryTransport,
    telemetry: Arc<RecordingTelemetry>,
}

fn fixture(registry: Registry, config: BusConfig) -> Fixture {
    let transport = MemoryTransport::from_config(&config);
    let telemetry = Arc::new(RecordingTelemetry::new());
    let host = BusHost::new(
        Arc::new(registry),
        Connections::new().with("primary", Arc::new(transport.clone())),
    )
    .with_config(config)
    .with_telemetry(telemetry.clone());

    Fixture {
        host,
        transport,
        telemetry,
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send(transport: &MemoryTransport, queue: &str, body: &Value) {
    transport
        .send(&EntityPath::queue(queue), OutboundMessage::json(body).unwrap())
        .await
        .unwrap();
}

#[test]
fn registry_rejects_duplicates_and_missing_connection_keys() {
    let stats = CallStats::default();

    let err = Registry::builder()
        .queue(QueueBinding::new("orders", "primary", handler(&stats, Duration::ZERO)))
        .queue(QueueBinding::new("orders", "primary", handler(&stats, Duration::ZERO)))
        .build()
        .unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateHandler { .. }));

    let err = Registry::builder()
        .topic(TopicBinding::new("events", "audit", "", handler(&stats, Duration::ZERO)))
        .build()
        .unwrap_err();
    assert!(matches!(err, RegistryError::MissingConnectionKey { .. }));
}

#[tokio::test]
async fn malformed_payloads_are_dead_lettered_as_invalid_input() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(QueueBinding::new("orders", "primary", handler(&stats, Duration::ZERO)))
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);
    let orders = EntityPath::queue("orders");

    let bodies: [&[u8]; 4] = [b"{not json", b"", b"[1,2,3]", br#"{"qty": 3}"#];
    for body in bodies {
        fx.transport
            .send(&orders, OutboundMessage::new(body.to_vec()))
            .await
            .unwrap();
    }

    let metrics = fx.host.metrics().for_entity("orders");
    wait_until("four dead letters", || metrics.dead_lettered() == 4).await;
    handle.shutdown().await;

    let parked = fx.transport.peek_dead_letters(&orders).await.unwrap();
    assert_eq!(parked.len(), 4);
    assert!(parked.iter().all(|r| r.reason == INVALID_INPUT_REASON));
    assert_eq!(metrics.completed(), 0);
    assert_eq!(stats.calls(), 0);
    assert!(fx
        .telemetry
        .dispatch_failures()
        .iter()
        .all(|f| f.kind == FailureKind::InvalidInput && f.dead_lettered));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_max_concurrent_calls() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(
            QueueBinding::new("orders", "primary", handler(&stats, Duration::from_millis(40)))
                .with_max_concurrent_calls(3),
        )
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);

    for id in 0..12 {
        send(&fx.transport, "orders", &json!({ "id": id })).await;
    }

    let metrics = fx.host.metrics().for_entity("orders");
    wait_until("twelve completions", || metrics.completed() == 12).await;
    handle.shutdown().await;

    assert_eq!(stats.calls(), 12);
    assert!(stats.peak() <= 3, "peak was {}", stats.peak());
    assert!(metrics.peak_in_flight() <= 3);
    assert_eq!(metrics.in_flight(), 0);
}

#[tokio::test]
async fn missing_role_dead_letters_without_invoking() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(
            QueueBinding::new("admin-ops", "primary", handler(&stats, Duration::ZERO))
                .with_auth(AuthRequirement::role("admin")),
        )
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);

    let user = TransactionContext::new().with_principal(Principal::new("u-7").with_role("user"));
    let body = serde_json::to_value(Envelope::with_context(json!({ "id": 1 }), user)).unwrap();
    send(&fx.transport, "admin-ops", &body).await;
    send(&fx.transport, "admin-ops", &json!({ "id": 2 })).await;

    let metrics = fx.host.metrics().for_entity("admin-ops");
    wait_until("two dead letters", || metrics.dead_lettered() == 2).await;
    handle.shutdown().await;

    let parked = fx
        .transport
        .peek_dead_letters(&EntityPath::queue("admin-ops"))
        .await
        .unwrap();
    assert!(parked.iter().all(|r| r.reason == AUTHORIZATION_REASON));
    assert!(parked.iter().any(|r| r.description.contains("u-7")));
    assert_eq!(stats.calls(), 0);
}

#[tokio::test]
async fn admin_principal_is_served_and_completed() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(
            QueueBinding::new("admin-ops", "primary", handler(&stats, Duration::ZERO))
                .with_auth(AuthRequirement::role("admin")),
        )
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);

    let admin = TransactionContext::new().with_principal(Principal::new("ops").with_role("admin"));
    let body = serde_json::to_value(Envelope::with_context(json!({ "id": 1 }), admin)).unwrap();
    send(&fx.transport, "admin-ops", &body).await;

    let metrics = fx.host.metrics().for_entity("admin-ops");
    wait_until("completion", || metrics.completed() == 1).await;
    handle.shutdown().await;

    assert_eq!(stats.calls(), 1);
    assert_eq!(fx.transport.active_message_count(&EntityPath::queue("admin-ops")), 0);
    assert_eq!(fx.transport.locked_message_count(&EntityPath::queue("admin-ops")), 0);
    assert!(fx.telemetry.events().is_empty());
}

#[tokio::test]
async fn business_failures_carry_critics_as_json() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(QueueBinding::new("orders", "primary", handler(&stats, Duration::ZERO)))
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);

    send(&fx.transport, "orders", &json!({ "id": 1, "qty": -2 })).await;

    let metrics = fx.host.metrics().for_entity("orders");
    wait_until("dead letter", || metrics.dead_lettered() == 1).await;
    handle.shutdown().await;

    let parked = fx
        .transport
        .peek_dead_letters(&EntityPath::queue("orders"))
        .await
        .unwrap();
    assert_eq!(parked[0].reason, BUSINESS_VALIDATION_REASON);

    let critics: Vec<Critic> = serde_json::from_str(&parked[0].description).unwrap();
    assert_eq!(critics[0].code, "NegativeQuantity");
    assert_eq!(critics[0].field.as_deref(), Some("qty"));
    assert_eq!(stats.calls(), 1);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(QueueBinding::new("slow", "primary", handler(&stats, Duration::from_millis(200))))
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);

    send(&fx.transport, "slow", &json!({ "id": 1 })).await;
    let metrics = fx.host.metrics().for_entity("slow");
    wait_until("handler running", || metrics.in_flight() == 1).await;

    let report = handle.shutdown().await;

    assert_eq!(report.abandoned(), 0);
    assert_eq!(metrics.completed(), 1);
    assert_eq!(fx.transport.locked_message_count(&EntityPath::queue("slow")), 0);
}

#[tokio::test]
async fn shutdown_lets_go_after_the_grace_period() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(QueueBinding::new("slow", "primary", handler(&stats, Duration::from_secs(2))))
        .build()
        .unwrap();
    let config = BusConfig {
        shutdown_grace: Duration::from_millis(30),
        ..fast_config()
    };
    let fx = fixture(registry, config);
    let handle = assert_ok!(fx.host.start().await);

    send(&fx.transport, "slow", &json!({ "id": 1 })).await;
    let metrics = fx.host.metrics().for_entity("slow");
    wait_until("handler running", || metrics.in_flight() == 1).await;

    let started = Instant::now();
    let report = handle.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.abandoned(), 1);
    assert_eq!(report.drained[0].entity, EntityPath::queue("slow"));
}

#[tokio::test]
async fn unknown_connection_fails_start_before_provisioning() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(QueueBinding::new("orders", "primary", handler(&stats, Duration::ZERO)))
        .queue(QueueBinding::new("billing", "secondary", handler(&stats, Duration::ZERO)))
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());

    let err = fx.host.start().await.err().unwrap();

    assert!(matches!(err, BusError::UnknownConnection(ref key) if key == "secondary"));
    assert!(!fx
        .transport
        .entity_exists(&EntityPath::queue("orders"))
        .await
        .unwrap());
}

#[tokio::test]
async fn label_filters_route_topic_messages() {
    let digest = CallStats::default();
    let purge = CallStats::default();
    let registry = Registry::builder()
        .topic(
            TopicBinding::new("dispatch", "digest-svc", "primary", handler(&digest, Duration::ZERO))
                .with_filter(SubscriptionFilter::Label("digest-svc".into())),
        )
        .topic(
            TopicBinding::new("dispatch", "purge-svc", "primary", handler(&purge, Duration::ZERO))
                .with_filter(SubscriptionFilter::Label("purge-svc".into())),
        )
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());
    let handle = assert_ok!(fx.host.start().await);

    let sender = assert_ok!(fx.host.sender("primary"));
    let topic = EntityPath::topic("dispatch");
    for _ in 0..2 {
        let outcome = sender
            .send_json(&topic, Some("digest-svc"), &json!({ "id": 1 }))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
    }

    let metrics = fx.host.metrics().for_entity("dispatch/subscriptions/digest-svc");
    wait_until("two digest completions", || metrics.completed() == 2).await;
    handle.shutdown().await;

    assert_eq!(digest.calls(), 2);
    assert_eq!(purge.calls(), 0);
}

#[tokio::test]
async fn sender_creates_missing_queue_once() {
    let registry = Registry::builder().build().unwrap();
    let fx = fixture(registry, fast_config());
    let sender = assert_ok!(fx.host.sender("primary"));

    let outcome = sender
        .send_json(&EntityPath::queue("notices"), None, &json!({ "accessToken": "t", "n": 1 }))
        .await
        .unwrap();

    assert_eq!(outcome, SendOutcome::SentAfterCreate);
    assert_eq!(fx.transport.active_message_count(&EntityPath::queue("notices")), 1);
    assert_eq!(fx.host.metrics().messages_sent(), 1);
    assert!(fx.host.sender("nowhere").is_err());
}

#[tokio::test]
async fn health_check_covers_each_queue_and_topic_once() {
    let stats = CallStats::default();
    let registry = Registry::builder()
        .queue(QueueBinding::new("orders", "primary", handler(&stats, Duration::ZERO)))
        .topic(TopicBinding::new("events", "audit", "primary", handler(&stats, Duration::ZERO)))
        .topic(TopicBinding::new("events", "billing", "primary", handler(&stats, Duration::ZERO)))
        .build()
        .unwrap();
    let fx = fixture(registry, fast_config());

    // Nothing provisioned yet: every stats fails.
    let before = fx.host.health_check().await;
    assert!(!before.is_healthy());
    assert_eq!(before.unhealthy().count(), 2);

    let handle = assert_ok!(fx.host.start().await);
    let after = fx.host.health_check().await;
    handle.shutdown().await;

    assert!(after.is_healthy());
    let checked: Vec<EntityPath> = after.entities.iter().map(|e| e.entity.clone()).collect();
    assert_eq!(checked, vec![EntityPath::queue("orders"), EntityPath::topic("events")]);
    assert_eq!(fx.transport.scheduled_message_count(), 0);
}
