//! CRUD operations for [`RoomRecord`] records and their membership tables.

use std::collections::{BTreeSet, HashMap};

use huddle_shared::IdentityId;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::identities::parse_timestamp;
use crate::models::RoomRecord;

/// Membership tables share one shape: `(room_name, identity)`.
#[derive(Debug, Clone, Copy)]
pub enum RoomSet {
    Members,
    Admins,
    Invites,
}

impl RoomSet {
    fn table(self) -> &'static str {
        match self {
            Self::Members => "room_members",
            Self::Admins => "room_admins",
            Self::Invites => "room_invites",
        }
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a room together with its member, admin and invite sets in a
    /// single transaction.
    pub fn insert_room(&self, room: &RoomRecord) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO rooms (name, is_private, password_hash, creator, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                room.name,
                room.is_private,
                room.password_hash,
                room.creator.as_str(),
                room.created_at.to_rfc3339(),
            ],
        )?;

        for (set, identities) in [
            (RoomSet::Members, &room.members),
            (RoomSet::Admins, &room.admins),
            (RoomSet::Invites, &room.invited),
        ] {
            let sql = format!(
                "INSERT INTO {} (room_name, identity) VALUES (?1, ?2)",
                set.table()
            );
            for identity in identities {
                tx.execute(&sql, params![room.name, identity.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Add `identity` to one of a room's sets. Adding twice is a no-op.
    pub fn add_to_room_set(&self, room: &str, set: RoomSet, identity: &IdentityId) -> Result<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (room_name, identity) VALUES (?1, ?2)",
            set.table()
        );
        self.conn().execute(&sql, params![room, identity.as_str()])?;
        Ok(())
    }

    /// Remove `identity` from one of a room's sets. Returns `true` if a row
    /// was deleted.
    pub fn remove_from_room_set(
        &self,
        room: &str,
        set: RoomSet,
        identity: &IdentityId,
    ) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE room_name = ?1 AND identity = ?2",
            set.table()
        );
        let affected = self.conn().execute(&sql, params![room, identity.as_str()])?;
        Ok(affected > 0)
    }

    /// Admit a member and consume their invite atomically.
    pub fn admit_member(&self, room: &str, identity: &IdentityId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO room_members (room_name, identity) VALUES (?1, ?2)",
            params![room, identity.as_str()],
        )?;
        tx.execute(
            "DELETE FROM room_invites WHERE room_name = ?1 AND identity = ?2",
            params![room, identity.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a room and its whole message partition in one transaction.
    /// Returns `true` if the room existed.
    pub fn delete_room(&self, name: &str) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE channel_kind = 'room' AND channel_a = ?1",
            params![name],
        )?;
        let affected = tx.execute("DELETE FROM rooms WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Load every room with its sets, ordered by name.
    pub fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let mut sets: HashMap<(String, &'static str), BTreeSet<IdentityId>> = HashMap::new();
        for set in [RoomSet::Members, RoomSet::Admins, RoomSet::Invites] {
            let mut stmt = self
                .conn()
                .prepare(&format!("SELECT room_name, identity FROM {}", set.table()))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (room, identity) = row?;
                sets.entry((room, set.table()))
                    .or_default()
                    .insert(IdentityId(identity));
            }
        }

        let mut stmt = self.conn().prepare(
            "SELECT name, is_private, password_hash, creator, created_at
             FROM rooms ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let is_private: bool = row.get(1)?;
            let password_hash: Option<String> = row.get(2)?;
            let creator: String = row.get(3)?;
            let created_str: String = row.get(4)?;
            Ok(RoomRecord {
                name,
                is_private,
                password_hash,
                creator: IdentityId(creator),
                admins: BTreeSet::new(),
                members: BTreeSet::new(),
                invited: BTreeSet::new(),
                created_at: parse_timestamp(4, &created_str)?,
            })
        })?;

        let mut rooms = Vec::new();
        for row in rows {
            let mut room = row?;
            let name = room.name.clone();
            let mut take = |set: RoomSet| {
                sets.remove(&(name.clone(), set.table()))
                    .unwrap_or_default()
            };
            room.members = take(RoomSet::Members);
            room.admins = take(RoomSet::Admins);
            room.invited = take(RoomSet::Invites);
            rooms.push(room);
        }
        Ok(rooms)
    }
}
