//! Redis bus (PUBLISH / PSUBSCRIBE).

use super::{Bus, BusError, BusEvent, BusStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn unavailable(e: RedisError) -> BusError {
    BusError::Unavailable(e.to_string())
}

/// A bus backed by a Redis server.
///
/// Publishing shares one multiplexed connection, reopened after an error.
/// Every subscription uses a dedicated pub/sub connection.
pub struct RedisBus {
    client: Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    /// Create a bus for `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// No connection is made until the first publish or subscribe.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn open(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut guard = self.publisher.lock().await;

        let mut connection = match guard.take() {
            Some(connection) => connection,
            None => {
                debug!("Opening Redis publish connection");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(unavailable)?
            }
        };

        let result: Result<i64, RedisError> = connection.publish(channel, payload).await;
        match result {
            Ok(_receivers) => {
                *guard = Some(connection);
                Ok(())
            }
            // the connection is dropped and reopened on the next publish
            Err(e) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() => {
                Err(BusError::Unconfirmed(e.to_string()))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn subscribe(&self, patterns: &[&str]) -> Result<BusStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        for pattern in patterns {
            pubsub.psubscribe(*pattern).await.map_err(unavailable)?;
        }
        debug!(patterns = ?patterns, "Redis subscription open");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(Ok(BusEvent { channel, payload })),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping non-text Redis payload");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
