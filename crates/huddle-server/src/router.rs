//! Delivery router: which connection hears what.
//!
//! Each live socket registers an unbounded sender; the socket's writer task
//! drains it in order. The router never holds two map guards at once, so
//! it cannot deadlock against itself regardless of shard layout.

use std::collections::HashSet;

use dashmap::DashMap;
use huddle_shared::protocol::ServerFrame;
use huddle_shared::{ChannelId, ConnectionId, IdentityId, Message};
use tokio::sync::mpsc;
use tracing::debug;

/// Sender half of one connection's outbound queue.
pub type ConnectionSender = mpsc::UnboundedSender<ServerFrame>;

struct ConnectionEntry {
    identity: IdentityId,
    tx: ConnectionSender,
    channels: HashSet<ChannelId>,
}

#[derive(Default)]
pub struct DeliveryRouter {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    by_identity: DashMap<IdentityId, HashSet<ConnectionId>>,
    subscribers: DashMap<ChannelId, HashSet<ConnectionId>>,
}

impl DeliveryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, connection: ConnectionId, identity: IdentityId, tx: ConnectionSender) {
        self.connections.insert(
            connection,
            ConnectionEntry {
                identity: identity.clone(),
                tx,
                channels: HashSet::new(),
            },
        );
        self.by_identity.entry(identity).or_default().insert(connection);
    }

    /// Forget a connection and every subscription it held.
    pub fn detach(&self, connection: &ConnectionId) -> Option<IdentityId> {
        let (_, entry) = self.connections.remove(connection)?;

        for channel in &entry.channels {
            self.remove_subscriber(channel, connection);
        }
        self.by_identity
            .remove_if_mut(&entry.identity, |_, conns| {
                conns.remove(connection);
                conns.is_empty()
            });

        Some(entry.identity)
    }

    pub fn identity_of(&self, connection: &ConnectionId) -> Option<IdentityId> {
        self.connections.get(connection).map(|e| e.identity.clone())
    }

    /// Returns `false` if the connection is not attached. Access checks are
    /// the caller's job.
    pub fn subscribe(&self, connection: &ConnectionId, channel: &ChannelId) -> bool {
        match self.connections.get_mut(connection) {
            Some(mut entry) => {
                entry.channels.insert(channel.clone());
            }
            None => return false,
        }

        self.subscribers
            .entry(channel.clone())
            .or_default()
            .insert(*connection);

        // A concurrent detach may have run between the two inserts.
        if !self.connections.contains_key(connection) {
            self.remove_subscriber(channel, connection);
            return false;
        }
        true
    }

    pub fn unsubscribe(&self, connection: &ConnectionId, channel: &ChannelId) -> bool {
        let had = self
            .connections
            .get_mut(connection)
            .map(|mut entry| entry.channels.remove(channel))
            .unwrap_or(false);
        self.remove_subscriber(channel, connection);
        had
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, connection: &ConnectionId, channel: &ChannelId) -> bool {
        self.connections
            .get(connection)
            .map(|entry| entry.channels.contains(channel))
            .unwrap_or(false)
    }

    /// Push an appended message to every subscriber of its channel.
    /// Returns how many connections accepted it.
    pub fn publish(&self, message: &Message) -> usize {
        let frame = ServerFrame::MessageAppended {
            message: message.clone(),
        };
        let delivered = self.send_to_channel(&message.channel, &frame);
        debug!(channel = %message.channel, id = message.id, delivered, "Published message");
        delivered
    }

    pub fn send_to_channel(&self, channel: &ChannelId, frame: &ServerFrame) -> usize {
        let targets = self.subscribers_of(channel);
        self.send_to_connections(&targets, frame)
    }

    pub fn send_to_connection(&self, connection: &ConnectionId, frame: ServerFrame) -> bool {
        match self.connections.get(connection) {
            Some(entry) => entry.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Every live connection of `identity`.
    pub fn send_to_identity(&self, identity: &IdentityId, frame: &ServerFrame) -> usize {
        let targets = self.connections_of(identity);
        self.send_to_connections(&targets, frame)
    }

    /// Every attached connection.
    pub fn broadcast(&self, frame: &ServerFrame) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            if entry.tx.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Drop `identity`'s subscriptions to `channel` and tell its connections why.
    pub fn force_unsubscribe(&self, identity: &IdentityId, channel: &ChannelId, reason: &str) {
        let frame = ServerFrame::ForceUnsubscribed {
            channel: channel.clone(),
            reason: reason.to_string(),
        };
        for connection in self.connections_of(identity) {
            if self.unsubscribe(&connection, channel) {
                self.send_to_connection(&connection, frame.clone());
            }
        }
    }

    /// Remove every subscription to `channel`. Returns the former subscribers.
    pub fn close_channel(&self, channel: &ChannelId) -> Vec<ConnectionId> {
        let former: Vec<ConnectionId> = self
            .subscribers
            .remove(channel)
            .map(|(_, conns)| conns.into_iter().collect())
            .unwrap_or_default();

        for connection in &former {
            if let Some(mut entry) = self.connections.get_mut(connection) {
                entry.channels.remove(channel);
            }
        }
        former
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn subscribers_of(&self, channel: &ChannelId) -> Vec<ConnectionId> {
        self.subscribers
            .get(channel)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    fn connections_of(&self, identity: &IdentityId) -> Vec<ConnectionId> {
        self.by_identity
            .get(identity)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    fn send_to_connections(&self, targets: &[ConnectionId], frame: &ServerFrame) -> usize {
        let mut sent = 0;
        for connection in targets {
            // Vanished connections are skipped silently.
            if self.send_to_connection(connection, frame.clone()) {
                sent += 1;
            }
        }
        sent
    }

    fn remove_subscriber(&self, channel: &ChannelId, connection: &ConnectionId) {
        self.subscribers.remove_if_mut(channel, |_, conns| {
            conns.remove(connection);
            conns.is_empty()
        });
    }
}
