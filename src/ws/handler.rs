//! Endpoint callbacks and application messages.
//!
//! An [`EndpointHandler`] is injected once per endpoint when it is
//! registered. `on_connect` and `on_disconnect` run on the Hub's control
//! loop, `on_message` runs on the connection's reader loop, so all three
//! must return promptly; anything slow belongs in a spawned task.

use bytes::Bytes;

use crate::ws::connection::Connection;
use crate::ws::frame::{self, Opcode};

/// A data frame delivered to, or sent by, the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    /// A non-final or continuation frame, passed through unassembled.
    Fragment {
        opcode: Opcode,
        fin: bool,
        payload: Bytes,
    },
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Text(_) => Opcode::Text,
            Message::Binary(_) => Opcode::Binary,
            Message::Fragment { opcode, .. } => *opcode,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
            Message::Fragment { payload, .. } => payload,
        }
    }

    /// Encode as a server frame.
    pub fn encode(&self) -> Bytes {
        let fin = match self {
            Message::Fragment { fin, .. } => *fin,
            _ => true,
        };
        frame::encode(self.opcode(), fin, self.payload())
    }
}

/// Callbacks for one endpoint.
///
/// `live` is the size of the endpoint's connection set after the change.
pub trait EndpointHandler: Send + Sync + 'static {
    fn on_connect(&self, conn: &Connection, live: usize) {
        let _ = (conn, live);
    }

    fn on_disconnect(&self, conn: &Connection, live: usize) {
        let _ = (conn, live);
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        let _ = (conn, message);
    }
}

/// Sends every message straight back to its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl EndpointHandler for Echo {
    fn on_message(&self, conn: &Connection, message: Message) {
        if let Err(e) = conn.send(message) {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Echo dropped");
        }
    }
}

/// Broadcasts every complete message to all connections on the endpoint,
/// the sender included.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relay;

impl EndpointHandler for Relay {
    fn on_connect(&self, conn: &Connection, live: usize) {
        tracing::info!(connection_id = %conn.id(), path = %conn.path(), live, "Peer joined");
    }

    fn on_disconnect(&self, conn: &Connection, live: usize) {
        tracing::info!(connection_id = %conn.id(), path = %conn.path(), live, "Peer left");
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        if let Message::Fragment { .. } = message {
            // Interleaving fragments from several senders would corrupt
            // every receiver's stream.
            tracing::debug!(connection_id = %conn.id(), "Relay skips fragments");
            return;
        }
        if let Err(e) = conn.hub().try_broadcast(message) {
            tracing::warn!(connection_id = %conn.id(), error = %e, "Relay broadcast dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ws::connection::Channels;
    use crate::ws::frame;
    use crate::ws::hub::{Hub, HubHandle};
    use crate::ws::registry::{Endpoint, EndpointSettings};

    async fn member(hub: &HubHandle) -> (Connection, Channels) {
        let (conn, channels) = Connection::new(hub.clone(), None, 16);
        hub.register(conn.clone()).await.unwrap();
        (conn, channels)
    }

    async fn next_payload(channels: &mut Channels) -> Vec<u8> {
        let bytes = channels.outbound.recv().await.unwrap();
        frame::decode(&mut &bytes[..], 1024).await.unwrap().payload.to_vec()
    }

    #[tokio::test]
    async fn relay_broadcasts_complete_messages_only() {
        let endpoint = Endpoint::new("/relay", EndpointSettings::default(), Arc::new(Relay));
        let hub = Hub::spawn(Arc::new(endpoint));
        let (alice, mut alice_rx) = member(&hub).await;
        let (_bob, mut bob_rx) = member(&hub).await;

        Relay.on_message(
            &alice,
            Message::Fragment {
                opcode: Opcode::Text,
                fin: false,
                payload: Bytes::from_static(b"part"),
            },
        );
        Relay.on_message(&alice, Message::text("hi"));
        // Broadcast intake is FIFO, so this completes after the relayed one.
        hub.broadcast(Message::text("sync")).await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(next_payload(rx).await, b"hi");
            assert_eq!(next_payload(rx).await, b"sync");
            assert!(rx.outbound.try_recv().is_err());
        }
    }

    #[test]
    fn message_encoding() {
        assert_eq!(&Message::text("hi").encode()[..], &[0x81, 0x02, b'h', b'i']);
        assert_eq!(&Message::binary(vec![9u8]).encode()[..], &[0x82, 0x01, 9]);

        let fragment = Message::Fragment {
            opcode: Opcode::Text,
            fin: false,
            payload: Bytes::from_static(b"a"),
        };
        assert_eq!(&fragment.encode()[..], &[0x01, 0x01, b'a']);
        assert_eq!(fragment.opcode(), Opcode::Text);
    }
}
