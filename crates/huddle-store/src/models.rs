//! Persisted record shapes that have no direct counterpart in
//! `huddle-shared`. Messages are stored as [`huddle_shared::Message`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use huddle_shared::IdentityId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub username: IdentityId,
    /// Salted credential hash (see `huddle_shared::credential`).
    pub credential_hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A room with its membership sets, as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomRecord {
    pub name: String,
    pub is_private: bool,
    pub password_hash: Option<String>,
    pub creator: IdentityId,
    pub admins: BTreeSet<IdentityId>,
    pub members: BTreeSet<IdentityId>,
    /// Identities allowed to join a private room without the password.
    pub invited: BTreeSet<IdentityId>,
    pub created_at: DateTime<Utc>,
}
