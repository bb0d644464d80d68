//! The persistence seam used by the server.
//!
//! The server keeps authoritative state in memory and writes through to a
//! [`ChatStore`] before each mutation becomes visible. [`SqliteStore`] is the
//! durable implementation; [`EphemeralStore`] accepts every write and
//! forgets it.

use std::path::Path;
use std::sync::Mutex;

use huddle_shared::{ChannelId, IdentityId, Message, MessageId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{IdentityRecord, RoomRecord};
use crate::rooms::RoomSet;

/// Everything the server needs to persist and to rebuild its state.
///
/// Methods are synchronous; async callers run them on the blocking pool.
pub trait ChatStore: Send + Sync + 'static {
    fn insert_identity(&self, identity: &IdentityRecord) -> Result<()>;
    fn load_identities(&self) -> Result<Vec<IdentityRecord>>;

    fn insert_room(&self, room: &RoomRecord) -> Result<()>;
    /// Add a member and drop any pending invite for them.
    fn admit_member(&self, room: &str, identity: &IdentityId) -> Result<()>;
    fn remove_member(&self, room: &str, identity: &IdentityId) -> Result<()>;
    fn add_invite(&self, room: &str, identity: &IdentityId) -> Result<()>;
    /// Remove the room and its message partition together.
    fn delete_room(&self, room: &str) -> Result<()>;
    fn load_rooms(&self) -> Result<Vec<RoomRecord>>;

    fn insert_message(&self, message: &Message) -> Result<()>;
    fn mark_delivered(&self, channel: &ChannelId, id: MessageId) -> Result<()>;
    /// All messages, grouped by channel, ascending id within a channel.
    fn load_messages(&self) -> Result<Vec<Message>>;
}

/// SQLite-backed store. One connection, serialized by a mutex.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&db)
    }
}

impl ChatStore for SqliteStore {
    fn insert_identity(&self, identity: &IdentityRecord) -> Result<()> {
        self.with_db(|db| db.insert_identity(identity))
    }

    fn load_identities(&self) -> Result<Vec<IdentityRecord>> {
        self.with_db(|db| db.list_identities())
    }

    fn insert_room(&self, room: &RoomRecord) -> Result<()> {
        self.with_db(|db| db.insert_room(room))
    }

    fn admit_member(&self, room: &str, identity: &IdentityId) -> Result<()> {
        self.with_db(|db| db.admit_member(room, identity))
    }

    fn remove_member(&self, room: &str, identity: &IdentityId) -> Result<()> {
        self.with_db(|db| db.remove_from_room_set(room, RoomSet::Members, identity).map(|_| ()))
    }

    fn add_invite(&self, room: &str, identity: &IdentityId) -> Result<()> {
        self.with_db(|db| db.add_to_room_set(room, RoomSet::Invites, identity))
    }

    fn delete_room(&self, room: &str) -> Result<()> {
        self.with_db(|db| db.delete_room(room).map(|_| ()))
    }

    fn load_rooms(&self) -> Result<Vec<RoomRecord>> {
        self.with_db(|db| db.list_rooms())
    }

    fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_db(|db| db.insert_message(message))
    }

    fn mark_delivered(&self, channel: &ChannelId, id: MessageId) -> Result<()> {
        self.with_db(|db| db.mark_delivered(channel, id).map(|_| ()))
    }

    fn load_messages(&self) -> Result<Vec<Message>> {
        self.with_db(|db| db.list_messages())
    }
}

/// Store for tests and throwaway deployments: nothing survives a restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralStore;

impl ChatStore for EphemeralStore {
    fn insert_identity(&self, _identity: &IdentityRecord) -> Result<()> {
        Ok(())
    }

    fn load_identities(&self) -> Result<Vec<IdentityRecord>> {
        Ok(Vec::new())
    }

    fn insert_room(&self, _room: &RoomRecord) -> Result<()> {
        Ok(())
    }

    fn admit_member(&self, _room: &str, _identity: &IdentityId) -> Result<()> {
        Ok(())
    }

    fn remove_member(&self, _room: &str, _identity: &IdentityId) -> Result<()> {
        Ok(())
    }

    fn add_invite(&self, _room: &str, _identity: &IdentityId) -> Result<()> {
        Ok(())
    }

    fn delete_room(&self, _room: &str) -> Result<()> {
        Ok(())
    }

    fn load_rooms(&self) -> Result<Vec<RoomRecord>> {
        Ok(Vec::new())
    }

    fn insert_message(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn mark_delivered(&self, _channel: &ChannelId, _id: MessageId) -> Result<()> {
        Ok(())
    }

    fn load_messages(&self) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_shared::{MessageContent, MessageStatus};
    use std::collections::BTreeSet;

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huddle.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_identity(&IdentityRecord {
                    username: "alice".into(),
                    credential_hash: "h".into(),
                    created_at: Utc::now(),
                })
                .unwrap();
            store
                .insert_room(&RoomRecord {
                    name: "general".into(),
                    is_private: false,
                    password_hash: None,
                    creator: "alice".into(),
                    admins: BTreeSet::from(["alice".into()]),
                    members: BTreeSet::from(["alice".into()]),
                    invited: BTreeSet::new(),
                    created_at: Utc::now(),
                })
                .unwrap();
            store
                .insert_message(&Message {
                    id: 1,
                    channel: ChannelId::room("general"),
                    sender: "alice".into(),
                    content: MessageContent::text("hi"),
                    timestamp: Utc::now(),
                    status: MessageStatus::Pending,
                })
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_identities().unwrap().len(), 1);
        assert_eq!(store.load_rooms().unwrap()[0].name, "general");
        assert_eq!(store.load_messages().unwrap()[0].content.text.as_deref(), Some("hi"));
    }

    #[test]
    fn ephemeral_store_forgets() {
        let store = EphemeralStore;
        store.delete_room("anything").unwrap();
        assert!(store.load_rooms().unwrap().is_empty());
    }
}
