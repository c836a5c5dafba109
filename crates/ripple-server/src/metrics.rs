//! Metrics collection and export for Ripple.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use ripple_core::Server;
use ripple_transport::{Connection, TransportError};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ripple_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ripple_connections_active";
    pub const MESSAGES_TOTAL: &str = "ripple_messages_total";
    pub const MESSAGES_BYTES: &str = "ripple_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "ripple_rooms_active";
    pub const MEMBERSHIPS_ACTIVE: &str = "ripple_memberships_active";
    pub const BUS_CONNECTED: &str = "ripple_bus_connected";
    pub const BUS_PUBLISHED: &str = "ripple_bus_published_total";
    pub const BUS_RELAYED: &str = "ripple_bus_relayed_total";
    pub const BUS_DROPPED: &str = "ripple_bus_dropped_total";
    pub const BUS_LOCAL_FALLBACKS: &str = "ripple_bus_local_fallbacks_total";
    pub const BUS_UNCONFIRMED: &str = "ripple_bus_unconfirmed_total";
    pub const BUS_RECONNECTS: &str = "ripple_bus_reconnects_total";
    pub const ERRORS_TOTAL: &str = "ripple_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of non-empty rooms");
    metrics::describe_gauge!(names::MEMBERSHIPS_ACTIVE, "Current number of room memberships");
    metrics::describe_gauge!(names::BUS_CONNECTED, "Whether the bus subscription is live");
    metrics::describe_counter!(names::BUS_PUBLISHED, "Broadcasts published to the bus");
    metrics::describe_counter!(names::BUS_RELAYED, "Bus messages delivered locally");
    metrics::describe_counter!(names::BUS_DROPPED, "Malformed bus messages dropped");
    metrics::describe_counter!(
        names::BUS_LOCAL_FALLBACKS,
        "Broadcasts delivered locally while the bus was unavailable"
    );
    metrics::describe_counter!(
        names::BUS_UNCONFIRMED,
        "Broadcasts dropped because their publish was never confirmed"
    );
    metrics::describe_counter!(names::BUS_RECONNECTS, "Bus resubscriptions");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Copy the room and relay statistics of `server` into the exported metrics.
#[allow(clippy::cast_precision_loss)]
pub fn export_stats(server: &Server) {
    let rooms = server.rooms().stats();
    gauge!(names::ROOMS_ACTIVE).set(rooms.room_count as f64);
    gauge!(names::MEMBERSHIPS_ACTIVE).set(rooms.total_memberships as f64);

    if let Some(adapter) = server.adapter() {
        let stats = adapter.stats();
        gauge!(names::BUS_CONNECTED).set(if adapter.is_connected() { 1.0 } else { 0.0 });
        counter!(names::BUS_PUBLISHED).absolute(stats.published);
        counter!(names::BUS_RELAYED).absolute(stats.relayed);
        counter!(names::BUS_DROPPED).absolute(stats.dropped);
        counter!(names::BUS_LOCAL_FALLBACKS).absolute(stats.local_fallbacks);
        counter!(names::BUS_UNCONFIRMED).absolute(stats.unconfirmed);
        counter!(names::BUS_RECONNECTS).absolute(stats.reconnects);
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// A connection that counts the messages passing through it.
pub struct Metered<C> {
    inner: C,
    _guard: ConnectionMetricsGuard,
}

impl<C: Connection> Metered<C> {
    /// Wrap `inner`, recording a new connection until dropped.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            _guard: ConnectionMetricsGuard::new(),
        }
    }
}

#[async_trait]
impl<C: Connection> Connection for Metered<C> {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        let received = self.inner.recv().await;
        match &received {
            Ok(Some(text)) => record_message(text.len(), "inbound"),
            Ok(None) => {}
            Err(_) => record_error("receive"),
        }
        received
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let bytes = text.len();
        let sent = self.inner.send(text).await;
        match &sent {
            Ok(()) => record_message(bytes, "outbound"),
            Err(_) => record_error("send"),
        }
        sent
    }

    async fn close(&mut self, reason: &str) -> Result<(), TransportError> {
        self.inner.close(reason).await
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }

    fn peer_close_reason(&self) -> Option<&str> {
        self.inner.peer_close_reason()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
