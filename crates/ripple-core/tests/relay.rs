//! Cross-process relay through an in-process bus.

use async_trait::async_trait;
use ripple_core::{
    Backoff, Bus, BusError, BusStream, MemoryBus, OutboundRx, Outbound, RelayConfig, Server,
    Socket,
};
use ripple_protocol::Envelope;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn fast_retry() -> RelayConfig {
    RelayConfig {
        backoff: Backoff {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
        },
        ..RelayConfig::default()
    }
}

async fn clustered(bus: &Arc<MemoryBus>) -> Server {
    clustered_on(bus.clone(), fast_retry()).await
}

async fn clustered_on(bus: Arc<dyn Bus>, config: RelayConfig) -> Server {
    let server = Server::new();
    server.use_adapter(bus, config).unwrap();
    wait_until(|| server.adapter().is_some_and(|a| a.is_connected())).await;
    server
}

/// How a [`FaultyBus`] answers a publish.
#[derive(Clone, Copy)]
enum PublishFault {
    /// Never completes.
    Stall,
    /// Reaches the bus but reports an unconfirmed error.
    AcceptThenFail,
}

/// Subscribes through a [`MemoryBus`] but misbehaves on publish.
struct FaultyBus {
    inner: Arc<MemoryBus>,
    fault: PublishFault,
}

#[async_trait]
impl Bus for FaultyBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        match self.fault {
            PublishFault::Stall => std::future::pending::<Result<(), BusError>>().await,
            PublishFault::AcceptThenFail => {
                self.inner.publish(channel, payload).await?;
                Err(BusError::Unconfirmed("connection reset after write".into()))
            }
        }
    }

    async fn subscribe(&self, patterns: &[&str]) -> Result<BusStream, BusError> {
        self.inner.subscribe(patterns).await
    }

    fn name(&self) -> &'static str {
        "faulty"
    }
}

fn faulty(fault: PublishFault) -> Arc<dyn Bus> {
    Arc::new(FaultyBus {
        inner: Arc::new(MemoryBus::new()),
        fault,
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Accept a connection, join `room` and skip the connect announcement.
fn member(server: &Server, room: &str) -> (Socket, OutboundRx) {
    let (socket, mut rx) = server.accept().unwrap();
    server.rooms().join(socket.id(), room).unwrap();
    while rx.try_recv().is_ok() {}
    (socket, rx)
}

async fn next_envelope(rx: &mut OutboundRx) -> Envelope {
    match tokio::time::timeout(WAIT, rx.recv()).await {
        Ok(Some(Outbound::Text(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected an envelope, got {other:?}"),
    }
}

async fn assert_quiet(rx: &mut OutboundRx) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra delivery");
}

#[tokio::test]
async fn test_scenario_b_relay_never_republishes() {
    let bus = Arc::new(MemoryBus::new());
    let server = clustered(&bus).await;
    let (_a, mut rx_a) = member(&server, "lobby");
    let (_b, mut rx_b) = member(&server, "lobby");

    bus.publish(
        "room:lobby",
        r#"{"eventName":"chat","data":["hi"],"roomId":"lobby"}"#.to_string(),
    )
    .await
    .unwrap();

    let expected = Envelope::new("chat", vec![json!("hi")]);
    assert_eq!(next_envelope(&mut rx_a).await, expected);
    assert_eq!(next_envelope(&mut rx_b).await, expected);
    assert_quiet(&mut rx_a).await;
    assert_quiet(&mut rx_b).await;

    let stats = server.adapter().unwrap().stats();
    assert_eq!(stats.relayed, 1);
    assert_eq!(stats.published, 0);
    assert_eq!(bus.published_count(), 1);
}

#[tokio::test]
async fn test_echo_only_delivery_across_processes() {
    let bus = Arc::new(MemoryBus::new());
    let origin = clustered(&bus).await;
    let remote = clustered(&bus).await;

    let (sender, mut rx_sender) = member(&origin, "lobby");
    let (_peer, mut rx_peer) = member(&origin, "lobby");
    let (_far, mut rx_far) = member(&remote, "lobby");
    let (_outside, mut rx_outside) = remote.accept().unwrap();
    while rx_outside.try_recv().is_ok() {}

    origin.to_room("lobby", "chat", vec![json!("hello")]);

    let expected = Envelope::new("chat", vec![json!("hello")]);
    for rx in [&mut rx_sender, &mut rx_peer, &mut rx_far] {
        assert_eq!(next_envelope(rx).await, expected);
        assert_quiet(rx).await;
    }
    assert_quiet(&mut rx_outside).await;
    assert_eq!(bus.published_count(), 1);

    origin.to_room_except("lobby", "chat", sender.id(), vec![json!("again")]);
    assert_eq!(next_envelope(&mut rx_peer).await.data, vec![json!("again")]);
    assert_eq!(next_envelope(&mut rx_far).await.data, vec![json!("again")]);
    assert_quiet(&mut rx_sender).await;

    remote.to_all("news", vec![]);
    for rx in [&mut rx_sender, &mut rx_peer, &mut rx_far, &mut rx_outside] {
        assert_eq!(next_envelope(rx).await.event, "news");
        assert_quiet(rx).await;
    }
}

#[tokio::test]
async fn test_malformed_bus_payload_dropped() {
    let bus = Arc::new(MemoryBus::new());
    let server = clustered(&bus).await;
    let (socket, mut rx) = member(&server, "lobby");

    bus.publish("all", "not json".to_string()).await.unwrap();
    bus.publish("room:lobby", r#"{"data":[]}"#.to_string()).await.unwrap();

    let adapter = server.adapter().unwrap();
    wait_until(|| adapter.stats().dropped == 2).await;
    assert!(adapter.is_connected());
    assert!(socket.is_open());
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_outage_degrades_to_local_and_recovers() {
    let bus = Arc::new(MemoryBus::new());
    let origin = clustered(&bus).await;
    let remote = clustered(&bus).await;
    let (_local, mut rx_local) = member(&origin, "lobby");
    let (_far, mut rx_far) = member(&remote, "lobby");

    bus.set_available(false);
    let adapter = origin.adapter().unwrap();
    wait_until(|| !adapter.is_connected()).await;

    origin.to_room("lobby", "chat", vec![json!("degraded")]);
    assert_eq!(next_envelope(&mut rx_local).await.data, vec![json!("degraded")]);
    assert_quiet(&mut rx_local).await;
    assert_quiet(&mut rx_far).await;
    assert!(adapter.stats().local_fallbacks >= 1);

    bus.set_available(true);
    wait_until(|| adapter.is_connected()).await;
    let remote_adapter = remote.adapter().unwrap();
    wait_until(|| remote_adapter.is_connected()).await;
    assert!(adapter.stats().reconnects >= 1);

    origin.to_room("lobby", "chat", vec![json!("restored")]);
    assert_eq!(next_envelope(&mut rx_local).await.data, vec![json!("restored")]);
    assert_eq!(next_envelope(&mut rx_far).await.data, vec![json!("restored")]);
    assert_quiet(&mut rx_local).await;
}

#[tokio::test]
async fn test_shutdown_stops_subscription_before_closing() {
    let bus = Arc::new(MemoryBus::new());
    let server = clustered(&bus).await;
    let (socket, _rx) = member(&server, "lobby");
    assert_eq!(bus.subscriber_count(), 1);

    server.shutdown().await;

    assert!(!server.adapter().unwrap().is_connected());
    assert_eq!(bus.subscriber_count(), 0);
    assert!(!socket.is_open());
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_outage_mid_stream_delivers_each_broadcast_once_in_order() {
    let bus = Arc::new(MemoryBus::new());
    let origin = clustered(&bus).await;
    let remote = clustered(&bus).await;
    let (_local, mut rx_local) = member(&origin, "lobby");
    let (_far, mut rx_far) = member(&remote, "lobby");
    let adapter = origin.adapter().unwrap();

    // queued before either relay task observes the outage
    bus.set_available(false);
    for n in 1..=3 {
        origin.to_room("lobby", "seq", vec![json!(n)]);
    }
    wait_until(|| !adapter.is_connected()).await;
    origin.to_room("lobby", "seq", vec![json!(4)]);

    for n in 1..=4 {
        assert_eq!(next_envelope(&mut rx_local).await.data, vec![json!(n)]);
    }
    assert_quiet(&mut rx_local).await;
    assert_quiet(&mut rx_far).await;

    let stats = adapter.stats();
    assert_eq!(stats.local_fallbacks, 4);
    assert_eq!(stats.published, 0);
    assert_eq!(stats.unconfirmed, 0);

    bus.set_available(true);
    wait_until(|| adapter.is_connected()).await;
    let remote_adapter = remote.adapter().unwrap();
    wait_until(|| remote_adapter.is_connected()).await;

    origin.to_room("lobby", "seq", vec![json!(5)]);
    assert_eq!(next_envelope(&mut rx_local).await.data, vec![json!(5)]);
    assert_eq!(next_envelope(&mut rx_far).await.data, vec![json!(5)]);
    assert_quiet(&mut rx_local).await;
    assert_quiet(&mut rx_far).await;
    assert_eq!(adapter.stats().published, 1);
}

#[tokio::test]
async fn test_shutdown_not_blocked_by_stalled_publish() {
    let config = RelayConfig {
        publish_timeout: Duration::from_secs(3600),
        ..fast_retry()
    };
    let server = clustered_on(faulty(PublishFault::Stall), config).await;
    let (socket, _rx) = member(&server, "lobby");

    server.to_room("lobby", "chat", vec![json!("stuck")]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(2), server.shutdown())
        .await
        .expect("shutdown waited on a stalled publish");

    let stats = server.adapter().unwrap().stats();
    assert_eq!(stats.unconfirmed, 1);
    assert_eq!(stats.published, 0);
    assert_eq!(stats.local_fallbacks, 0);
    assert!(!socket.is_open());
}

#[tokio::test]
async fn test_publish_timeout_drops_broadcast() {
    let config = RelayConfig {
        publish_timeout: Duration::from_millis(30),
        ..fast_retry()
    };
    let server = clustered_on(faulty(PublishFault::Stall), config).await;
    let (_socket, mut rx) = member(&server, "lobby");

    server.to_room("lobby", "chat", vec![json!("late")]);

    let adapter = server.adapter().unwrap();
    wait_until(|| adapter.stats().unconfirmed == 1).await;
    assert_quiet(&mut rx).await;
    assert_eq!(adapter.stats().local_fallbacks, 0);

    // the publisher moves on to the next broadcast
    server.to_room("lobby", "chat", vec![json!("later")]);
    wait_until(|| adapter.stats().unconfirmed == 2).await;
}

#[tokio::test]
async fn test_unconfirmed_publish_not_delivered_twice() {
    let server = clustered_on(faulty(PublishFault::AcceptThenFail), fast_retry()).await;
    let (_socket, mut rx) = member(&server, "lobby");

    server.to_room("lobby", "chat", vec![json!("once")]);

    assert_eq!(next_envelope(&mut rx).await.data, vec![json!("once")]);
    assert_quiet(&mut rx).await;

    let stats = server.adapter().unwrap().stats();
    assert_eq!(stats.unconfirmed, 1);
    assert_eq!(stats.local_fallbacks, 0);
    assert_eq!(stats.relayed, 1);
}
