//! Pumps a transport connection against a socket.

use crate::traits::Connection;
use ripple_core::{Outbound, OutboundRx, Socket};
use ripple_protocol::envelope::ERROR;
use serde_json::Value;
use tracing::{debug, warn};

/// Run one connection until either side closes.
///
/// Incoming text goes to [`Socket::receive`]; the socket's outbound queue is
/// written to the transport in order. A clean close by the peer closes the
/// socket with the peer's reason, or `default_reason` if it gave none. A
/// transport failure first fires the local `error` event, then closes the
/// socket with the failure as the reason.
/// The socket's `disconnect` event fires exactly once either way.
pub async fn drive<C>(conn: &mut C, socket: &Socket, mut outbound: OutboundRx, default_reason: &str)
where
    C: Connection + ?Sized,
{
    loop {
        tokio::select! {
            // flush queued output before reading more
            biased;

            item = outbound.recv() => match item {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = conn.send(text).await {
                        fail(socket, &e.to_string());
                        break;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    if let Err(e) = conn.close(&reason).await {
                        debug!(connection = %socket.id(), error = %e, "Close handshake failed");
                    }
                    break;
                }
                None => break,
            },
            incoming = conn.recv() => match incoming {
                Ok(Some(text)) => socket.receive(&text),
                Ok(None) => {
                    let reason = conn
                        .peer_close_reason()
                        .unwrap_or(default_reason)
                        .to_string();
                    debug!(
                        connection = %socket.id(),
                        reason = %reason,
                        "Peer closed the connection"
                    );
                    socket.close(&reason);
                    break;
                }
                Err(e) => {
                    fail(socket, &e.to_string());
                    break;
                }
            },
        }
    }

    socket.close(default_reason);
    if conn.is_open() {
        let _ = conn.close(default_reason).await;
    }
}

fn fail(socket: &Socket, error: &str) {
    warn!(connection = %socket.id(), error = %error, "Transport failed");
    socket.dispatch_local(ERROR, vec![Value::String(error.to_string())]);
    socket.close(&format!("transport error: {error}"));
}
