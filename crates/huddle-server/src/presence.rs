//! Connection-counted presence.
//!
//! An identity is online while it holds at least one live connection, so a
//! second device coming and going never flaps the public status.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_shared::protocol::ServerFrame;
use huddle_shared::{ConnectionId, IdentityId};
use tracing::info;

use crate::router::DeliveryRouter;

/// Outcome of a connect.
#[derive(Debug, PartialEq, Eq)]
pub enum TrackResult {
    /// 0 -> 1: the identity just came online.
    CameOnline,
    /// Another device of an already-online identity.
    AlreadyOnline,
}

/// Outcome of a disconnect.
#[derive(Debug, PartialEq, Eq)]
pub enum UntrackResult {
    /// 1 -> 0: the identity went offline.
    WentOffline,
    StillOnline,
    NotTracked,
}

pub struct PresenceTracker {
    /// identity -> its live connections; the set size is the count
    online: DashMap<IdentityId, HashSet<ConnectionId>>,
    router: Arc<DeliveryRouter>,
}

impl PresenceTracker {
    pub fn new(router: Arc<DeliveryRouter>) -> Self {
        Self {
            online: DashMap::new(),
            router,
        }
    }

    pub fn connect(&self, identity: &IdentityId, connection: ConnectionId) -> TrackResult {
        let mut conns = self.online.entry(identity.clone()).or_default();
        let first = conns.is_empty();
        conns.insert(connection);

        if first {
            // Emitted under the entry guard so transitions for one identity
            // reach listeners in the order they happened.
            self.announce(identity, true);
            info!(identity = %identity, "Identity online");
            TrackResult::CameOnline
        } else {
            TrackResult::AlreadyOnline
        }
    }

    pub fn disconnect(&self, identity: &IdentityId, connection: &ConnectionId) -> UntrackResult {
        let Entry::Occupied(mut slot) = self.online.entry(identity.clone()) else {
            return UntrackResult::NotTracked;
        };
        if !slot.get_mut().remove(connection) {
            return UntrackResult::NotTracked;
        }
        if !slot.get().is_empty() {
            return UntrackResult::StillOnline;
        }

        slot.remove();
        self.announce(identity, false);
        info!(identity = %identity, "Identity offline");
        UntrackResult::WentOffline
    }

    /// Snapshot, sorted by username.
    pub fn list_online(&self) -> Vec<IdentityId> {
        let mut users: Vec<IdentityId> = self.online.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    pub fn connection_count(&self, identity: &IdentityId) -> usize {
        self.online.get(identity).map(|c| c.len()).unwrap_or(0)
    }

    fn announce(&self, identity: &IdentityId, online: bool) {
        self.router.broadcast(&ServerFrame::PresenceChanged {
            identity: identity.clone(),
            online,
        });
    }
}
