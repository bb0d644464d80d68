//! v001 -- Initial schema creation.
//!
//! Identities, rooms with their member/admin/invite sets, and the
//! append-only message log keyed by channel.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    username        TEXT PRIMARY KEY NOT NULL,
    credential_hash TEXT NOT NULL,             -- a2id$cost$salt$digest
    created_at      TEXT NOT NULL              -- RFC-3339
);

-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    name          TEXT PRIMARY KEY NOT NULL,   -- case-sensitive
    is_private    INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    password_hash TEXT,                        -- required when private
    creator       TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_members (
    room_name TEXT NOT NULL,
    identity  TEXT NOT NULL,
    PRIMARY KEY (room_name, identity),
    FOREIGN KEY (room_name) REFERENCES rooms(name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS room_admins (
    room_name TEXT NOT NULL,
    identity  TEXT NOT NULL,
    PRIMARY KEY (room_name, identity),
    FOREIGN KEY (room_name) REFERENCES rooms(name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS room_invites (
    room_name TEXT NOT NULL,
    identity  TEXT NOT NULL,
    PRIMARY KEY (room_name, identity),
    FOREIGN KEY (room_name) REFERENCES rooms(name) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages (append-only, per channel)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    channel_kind TEXT NOT NULL,                -- 'room' | 'pair'
    channel_a    TEXT NOT NULL,                -- room name or lower identity
    channel_b    TEXT NOT NULL,                -- '' or higher identity
    id           INTEGER NOT NULL,             -- per-channel sequence
    sender       TEXT NOT NULL,
    text         TEXT,
    media        TEXT,
    timestamp    TEXT NOT NULL,
    status       TEXT NOT NULL,                -- 'pending' | 'delivered'
    PRIMARY KEY (channel_kind, channel_a, channel_b, id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
