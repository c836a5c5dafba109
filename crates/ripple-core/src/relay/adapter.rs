//! Relay adapter: bridges a room registry and a pub/sub bus.

use super::{Bus, BusError, BusEvent};
use crate::backoff::Backoff;
use crate::room::RoomRegistry;
use futures_util::StreamExt;
use ripple_protocol::{codec, BusMessage, SUBSCRIBE_PATTERNS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Resubscription backoff.
    pub backoff: Backoff,
    /// Broadcasts buffered for publishing.
    pub outbox_capacity: usize,
    /// Upper bound on a single publish before the broadcast is given up.
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            outbox_capacity: 1024,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Broadcasts published to the bus.
    pub published: u64,
    /// Bus messages delivered to local connections.
    pub relayed: u64,
    /// Malformed or unencodable messages dropped.
    pub dropped: u64,
    /// Broadcasts delivered locally because the bus was unavailable.
    pub local_fallbacks: u64,
    /// Broadcasts given up because a publish timed out, was cut short by
    /// shutdown, or failed after it may have reached the bus.
    pub unconfirmed: u64,
    /// Subscriptions re-established after a loss.
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
    local_fallbacks: AtomicU64,
    unconfirmed: AtomicU64,
    reconnects: AtomicU64,
}

struct Shared {
    bus: Arc<dyn Bus>,
    registry: Weak<RoomRegistry>,
    connected: AtomicBool,
    counters: Counters,
    config: RelayConfig,
}

/// Relays broadcasts through a [`Bus`].
///
/// Broadcasts are publish-only: the origin process delivers to its own
/// connections when the message comes back from the bus, like every other
/// subscribed process. Broadcasts go through one outbox, so a process keeps
/// its own send order.
///
/// A broadcast is delivered locally instead of published only when the bus
/// has certainly not taken it: the subscription is down, or the publish was
/// rejected with [`BusError::Unavailable`](super::BusError::Unavailable).
/// A publish that times out or fails with
/// [`BusError::Unconfirmed`](super::BusError::Unconfirmed) is dropped and
/// counted, since its echo may still arrive. Delivery is at most once; while
/// the bus is going down a broadcast already accepted by it can be lost.
pub struct RelayAdapter {
    shared: Arc<Shared>,
    outbox: mpsc::Sender<BusMessage>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayAdapter {
    /// Start the relay: one publisher task and one supervised subscriber task.
    ///
    /// Must be called from within a Tokio runtime. The adapter keeps only a
    /// weak reference to the registry.
    #[must_use]
    pub fn start(bus: Arc<dyn Bus>, registry: &Arc<RoomRegistry>, config: RelayConfig) -> Self {
        info!(bus = bus.name(), "Starting relay adapter");

        let (outbox, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
        let shared = Arc::new(Shared {
            bus,
            registry: Arc::downgrade(registry),
            connected: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        });
        let shutdown = CancellationToken::new();

        let publisher = tokio::spawn(run_publisher(
            Arc::clone(&shared),
            outbox_rx,
            shutdown.clone(),
        ));
        let subscriber = tokio::spawn(run_subscriber(Arc::clone(&shared), shutdown.clone()));

        Self {
            shared,
            outbox,
            shutdown,
            tasks: Mutex::new(vec![publisher, subscriber]),
        }
    }

    /// Broadcast a message to every process.
    ///
    /// Never blocks: the message is queued for the publisher, or delivered
    /// locally when the relay is stopped or its outbox is full.
    pub fn broadcast(&self, message: BusMessage) {
        if self.shutdown.is_cancelled() {
            debug!(
                channel = %message.channel(),
                event = %message.event_name,
                "Relay stopped, delivering locally"
            );
            self.shared.deliver_local(&message);
            return;
        }

        if let Err(e) = self.outbox.try_send(message) {
            let message = match e {
                mpsc::error::TrySendError::Full(message) => message,
                mpsc::error::TrySendError::Closed(message) => message,
            };
            warn!(channel = %message.channel(), "Relay outbox unavailable, delivering locally");
            self.shared.deliver_local(&message);
        }
    }

    /// Check if the bus subscription is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Name of the underlying bus.
    #[must_use]
    pub fn bus_name(&self) -> &'static str {
        self.shared.bus.name()
    }

    /// Get relay counters.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let c = &self.shared.counters;
        RelayStats {
            published: c.published.load(Ordering::Relaxed),
            relayed: c.relayed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            local_fallbacks: c.local_fallbacks.load(Ordering::Relaxed),
            unconfirmed: c.unconfirmed.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop the subscription and the publisher and wait for both tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task failed");
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("Relay adapter stopped");
    }
}

impl Drop for RelayAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    /// Deliver a bus message received from the subscription. Never republishes.
    fn relay(&self, event: &BusEvent) {
        let message = match codec::decode_bus(&event.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %event.channel, error = %e, "Dropping malformed bus payload");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let recipients = registry.deliver(&message);
        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %event.channel, recipients, "Relayed bus message");
    }

    fn deliver_local(&self, message: &BusMessage) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deliver(message);
            self.counters.local_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run_publisher(
    shared: Arc<Shared>,
    mut outbox: mpsc::Receiver<BusMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let channel = message.channel();
        if !shared.connected.load(Ordering::SeqCst) {
            debug!(channel = %channel, "Bus unavailable, delivering locally");
            shared.deliver_local(&message);
            continue;
        }

        let payload = match codec::encode_bus(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Dropping unencodable broadcast");
                shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let publish = tokio::time::timeout(
            shared.config.publish_timeout,
            shared.bus.publish(&channel, payload),
        );
        let outcome = tokio::select! {
            () = shutdown.cancelled() => {
                warn!(channel = %channel, "Publish interrupted by shutdown, dropping broadcast");
                shared.counters.unconfirmed.fetch_add(1, Ordering::Relaxed);
                break;
            }
            outcome = publish => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                shared.counters.published.fetch_add(1, Ordering::Relaxed);
                trace!(channel = %channel, "Published broadcast");
            }
            Ok(Err(BusError::Unavailable(reason))) => {
                warn!(channel = %channel, error = %reason, "Publish rejected, delivering locally");
                shared.deliver_local(&message);
            }
            Ok(Err(e @ BusError::Unconfirmed(_))) => {
                warn!(channel = %channel, error = %e, "Publish unconfirmed, dropping broadcast");
                shared.counters.unconfirmed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!(
                    channel = %channel,
                    timeout_ms = shared.config.publish_timeout.as_millis() as u64,
                    "Publish timed out, dropping broadcast"
                );
                shared.counters.unconfirmed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    debug!("Relay publisher stopped");
}

async fn run_subscriber(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut attempt: u32 = 0;
    let mut lost_before = false;

    loop {
        let subscribed = tokio::select! {
            () = shutdown.cancelled() => break,
            subscribed = shared.bus.subscribe(&SUBSCRIBE_PATTERNS) => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                if lost_before {
                    shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(bus = shared.bus.name(), "Bus subscription restored");
                } else {
                    info!(bus = shared.bus.name(), "Bus subscription established");
                }
                attempt = 0;
                shared.connected.store(true, Ordering::SeqCst);

                loop {
                    let next = tokio::select! {
                        () = shutdown.cancelled() => {
                            shared.connected.store(false, Ordering::SeqCst);
                            debug!("Relay subscriber stopped");
                            return;
                        }
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => shared.relay(&event),
                        Some(Err(e)) => {
                            warn!(error = %e, "Bus subscription lost");
                            break;
                        }
                        None => {
                            warn!("Bus subscription ended");
                            break;
                        }
                    }
                }

                shared.connected.store(false, Ordering::SeqCst);
                lost_before = true;
                warn!(bus = shared.bus.name(), "Relay degraded to local-only delivery");
            }
            Err(e) => {
                lost_before = true;
                warn!(bus = shared.bus.name(), attempt, error = %e, "Bus subscribe failed");
            }
        }

        let delay = shared.config.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "Retrying bus subscription");

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!("Relay subscriber stopped");
}
