//! In-process bus.

use super::{Bus, BusError, BusEvent, BusStream};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use ripple_protocol::bus::pattern_matches;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A bus that lives inside the process.
///
/// Relay adapters sharing one `MemoryBus` (through an `Arc`) behave like
/// separate server processes attached to the same broker. Availability can
/// be switched off to simulate an outage: publishing and subscribing then
/// fail, and open subscriptions end with [`BusError::Unavailable`].
pub struct MemoryBus {
    sender: broadcast::Sender<BusEvent>,
    available: watch::Sender<bool>,
    published: AtomicU64,
}

impl MemoryBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` messages per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (available, _) = watch::channel(true);
        Self {
            sender,
            available,
            published: AtomicU64::new(0),
        }
    }

    /// Bring the bus up or down.
    pub fn set_available(&self, available: bool) {
        debug!(available, "Memory bus availability changed");
        self.available.send_replace(available);
    }

    /// Check if the bus is up.
    #[must_use]
    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Number of successful publishes.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription {
    events: broadcast::Receiver<BusEvent>,
    available: watch::Receiver<bool>,
    patterns: Vec<String>,
    done: bool,
}

impl Subscription {
    async fn next(&mut self) -> Option<Result<BusEvent, BusError>> {
        if self.done {
            return None;
        }
        loop {
            tokio::select! {
                changed = self.available.changed() => {
                    if changed.is_err() || !*self.available.borrow_and_update() {
                        self.done = true;
                        return Some(Err(BusError::Unavailable("memory bus offline".into())));
                    }
                }
                received = self.events.recv() => match received {
                    Ok(event) => {
                        if self.patterns.iter().any(|p| pattern_matches(p, &event.channel)) {
                            return Some(Ok(event));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable("memory bus offline".into()));
        }
        // no subscribers is not an error
        let _ = self.sender.send(BusEvent {
            channel: channel.to_string(),
            payload,
        });
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, patterns: &[&str]) -> Result<BusStream, BusError> {
        let mut available = self.available.subscribe();
        if !*available.borrow_and_update() {
            return Err(BusError::Unavailable("memory bus offline".into()));
        }

        let subscription = Subscription {
            events: self.sender.subscribe(),
            available,
            patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            done: false,
        };

        Ok(stream::unfold(subscription, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
        .boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
