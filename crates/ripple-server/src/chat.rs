//! Demo chat application: rooms with join, message and leave events.

use anyhow::{anyhow, Result};
use ripple_core::{AckResponder, Args, HandlerResult, Server, Socket};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Install the chat handlers on every accepted connection.
pub fn install(server: &Server) {
    server.on_connection(on_connection);
}

fn on_connection(server: &Server, socket: &Socket) -> HandlerResult {
    debug!(connection = %socket.id(), "Chat session started");
    socket.emit("hello", vec![json!("world")])?;

    let id = socket.id().to_string();

    let (srv, conn) = (server.clone(), id.clone());
    socket.on("join", move |args, ack| join(&srv, &conn, &args, ack));

    let (srv, conn) = (server.clone(), id.clone());
    socket.on("message", move |args, ack| message(&srv, &conn, &args, ack));

    let (srv, conn) = (server.clone(), id.clone());
    socket.on("leave", move |args, ack| leave(&srv, &conn, &args, ack));

    let srv = server.clone();
    socket.on("disconnect", move |args, _| {
        let reason = args.first().and_then(Value::as_str).unwrap_or_default();
        info!(connection = %id, reason = %reason, "Chat session ended");
        srv.to_all("server", vec![json!(format!("{id} disconnected")), json!("leave")]);
        Ok(())
    });

    Ok(())
}

/// `join(room, username, ack)`
fn join(server: &Server, id: &str, args: &Args, ack: Option<AckResponder>) -> HandlerResult {
    let room = text_arg(args, 0, "room")?;
    let username = text_arg(args, 1, "username")?;

    server.rooms().join(id, room)?;

    server.to_connection(
        id,
        "server",
        vec![json!(format!("You joined room {room}")), json!("join")],
    );
    server.to_room_except(
        room,
        "server",
        id,
        vec![json!(format!("{username} joined room {room}")), json!("join")],
    );

    if let Some(ack) = ack {
        ack.send(vec![json!(room)])?;
    }
    Ok(())
}

/// `message(text, username, room, ack)`
fn message(server: &Server, id: &str, args: &Args, ack: Option<AckResponder>) -> HandlerResult {
    let text = args.first().cloned().unwrap_or(Value::Null);
    let username = text_arg(args, 1, "username")?;
    let room = text_arg(args, 2, "room")?;

    server.to_room_except(room, "message", id, vec![text, json!(username)]);

    if let Some(ack) = ack {
        ack.send(vec![json!("ok")])?;
    }
    Ok(())
}

/// `leave(room, username, ack)`
fn leave(server: &Server, id: &str, args: &Args, ack: Option<AckResponder>) -> HandlerResult {
    let room = text_arg(args, 0, "room")?;
    let username = text_arg(args, 1, "username")?;

    if let Some(ack) = ack {
        ack.send(vec![json!(room)])?;
    }

    server.rooms().leave(id, room);
    server.to_room_except(
        room,
        "server",
        id,
        vec![json!(format!("{username} left room {room}"))],
    );
    Ok(())
}

fn text_arg<'a>(args: &'a Args, index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing {name} argument"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{Outbound, OutboundRx};
    use ripple_protocol::Envelope;

    fn chat_server() -> Server {
        let server = Server::new();
        install(&server);
        server
    }

    fn texts(rx: &mut OutboundRx) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Text(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn events(rx: &mut OutboundRx) -> Vec<(String, Args)> {
        texts(rx).into_iter().map(|e| (e.event, e.data)).collect()
    }

    #[test]
    fn test_hello_on_connection() {
        let server = chat_server();
        let (socket, mut rx) = server.accept().unwrap();

        let sent = events(&mut rx);
        assert_eq!(sent[0].0, "connect");
        assert_eq!(sent[0].1, vec![json!({"id": socket.id()})]);
        assert_eq!(sent[1], ("hello".to_string(), vec![json!("world")]));
    }

    #[test]
    fn test_join_notifies_and_acks() {
        let server = chat_server();
        let (alice, mut alice_rx) = server.accept().unwrap();
        let (bob, mut bob_rx) = server.accept().unwrap();

        alice.receive(r#"{"event":"join","data":["lobby","alice"],"ackId":"ack_1"}"#);
        assert_eq!(
            events(&mut alice_rx)[2..],
            [
                (
                    "server".to_string(),
                    vec![json!("You joined room lobby"), json!("join")]
                ),
                ("ack_1".to_string(), vec![json!("lobby")]),
            ]
        );
        events(&mut bob_rx);

        bob.receive(r#"{"event":"join","data":["lobby","bob"],"ackId":"ack_1"}"#);
        assert_eq!(
            events(&mut alice_rx),
            vec![(
                "server".to_string(),
                vec![json!("bob joined room lobby"), json!("join")]
            )]
        );
        let bob_events = events(&mut bob_rx);
        assert_eq!(bob_events.len(), 2);
        assert_eq!(bob_events[1], ("ack_1".to_string(), vec![json!("lobby")]));

        assert_eq!(server.rooms().member_count("lobby"), 2);
    }

    #[test]
    fn test_message_skips_sender() {
        let server = chat_server();
        let (alice, mut alice_rx) = server.accept().unwrap();
        let (bob, mut bob_rx) = server.accept().unwrap();
        let (_carol, mut carol_rx) = server.accept().unwrap();
        alice.receive(r#"{"event":"join","data":["lobby","alice"]}"#);
        bob.receive(r#"{"event":"join","data":["lobby","bob"]}"#);
        events(&mut alice_rx);
        events(&mut bob_rx);
        events(&mut carol_rx);

        bob.receive(r#"{"event":"message","data":["hi",  "bob", "lobby"],"ackId":"ack_7"}"#);

        assert_eq!(
            events(&mut alice_rx),
            vec![("message".to_string(), vec![json!("hi"), json!("bob")])]
        );
        assert_eq!(
            events(&mut bob_rx),
            vec![("ack_7".to_string(), vec![json!("ok")])]
        );
        assert!(events(&mut carol_rx).is_empty());
    }

    #[test]
    fn test_leave_acks_then_notifies_room() {
        let server = chat_server();
        let (alice, mut alice_rx) = server.accept().unwrap();
        let (bob, mut bob_rx) = server.accept().unwrap();
        alice.receive(r#"{"event":"join","data":["lobby","alice"]}"#);
        bob.receive(r#"{"event":"join","data":["lobby","bob"]}"#);
        events(&mut alice_rx);
        events(&mut bob_rx);

        bob.receive(r#"{"event":"leave","data":["lobby","bob"],"ackId":"ack_2"}"#);

        assert_eq!(
            events(&mut bob_rx),
            vec![("ack_2".to_string(), vec![json!("lobby")])]
        );
        assert_eq!(
            events(&mut alice_rx),
            vec![("server".to_string(), vec![json!("bob left room lobby")])]
        );
        assert_eq!(server.rooms().members("lobby"), vec![alice.id().to_string()]);
    }

    #[test]
    fn test_invalid_join_is_not_acked() {
        let server = chat_server();
        let (alice, mut alice_rx) = server.accept().unwrap();
        events(&mut alice_rx);

        alice.receive(r#"{"event":"join","data":["","alice"],"ackId":"ack_1"}"#);
        alice.receive(r#"{"event":"join","data":["lobby"],"ackId":"ack_2"}"#);

        assert!(events(&mut alice_rx).is_empty());
        assert!(!server.rooms().room_exists("lobby"));
        assert!(alice.is_open());
    }

    #[test]
    fn test_disconnect_announced_to_everyone() {
        let server = chat_server();
        let (alice, mut alice_rx) = server.accept().unwrap();
        let (bob, mut bob_rx) = server.accept().unwrap();
        bob.receive(r#"{"event":"join","data":["lobby","bob"]}"#);
        events(&mut alice_rx);
        events(&mut bob_rx);

        bob.close("client disconnected");

        assert_eq!(
            events(&mut alice_rx),
            vec![(
                "server".to_string(),
                vec![json!(format!("{} disconnected", bob.id())), json!("leave")]
            )]
        );
        assert!(events(&mut bob_rx).is_empty());
        assert!(!server.rooms().room_exists("lobby"));
        assert_eq!(server.connection_count(), 1);
        assert!(alice.is_open());
    }
}
