use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Identity = registered username, immutable once created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One live socket. An identity may hold several at once (multi-device).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unordered pair of identities. The two members are stored sorted so
/// `(a, b)` and `(b, a)` compare equal and hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrivatePair {
    low: IdentityId,
    high: IdentityId,
}

impl PrivatePair {
    pub fn new(a: IdentityId, b: IdentityId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn members(&self) -> (&IdentityId, &IdentityId) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, identity: &IdentityId) -> bool {
        &self.low == identity || &self.high == identity
    }

    /// The member that is not `identity`, if `identity` is a party.
    pub fn other(&self, identity: &IdentityId) -> Option<&IdentityId> {
        if &self.low == identity {
            Some(&self.high)
        } else if &self.high == identity {
            Some(&self.low)
        } else {
            None
        }
    }
}

/// A conversation stream: a named room or a private pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "ChannelRepr", into = "ChannelRepr")]
pub enum ChannelId {
    Room(String),
    PrivatePair(PrivatePair),
}

impl ChannelId {
    pub fn room(name: impl Into<String>) -> Self {
        Self::Room(name.into())
    }

    pub fn private_pair(a: IdentityId, b: IdentityId) -> Self {
        Self::PrivatePair(PrivatePair::new(a, b))
    }

    pub fn room_name(&self) -> Option<&str> {
        match self {
            Self::Room(name) => Some(name),
            Self::PrivatePair(_) => None,
        }
    }

    /// Storage columns: `(kind, a, b)`. Rooms store an empty `b`.
    pub fn to_columns(&self) -> (&'static str, &str, &str) {
        match self {
            Self::Room(name) => ("room", name, ""),
            Self::PrivatePair(pair) => ("pair", pair.low.as_str(), pair.high.as_str()),
        }
    }

    pub fn from_columns(kind: &str, a: &str, b: &str) -> Option<Self> {
        match kind {
            "room" => Some(Self::room(a)),
            "pair" => Some(Self::private_pair(a.into(), b.into())),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Room(name) => write!(f, "room:{name}"),
            Self::PrivatePair(pair) => write!(f, "dm:{}+{}", pair.low, pair.high),
        }
    }
}

// Wire shape of a channel id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum ChannelRepr {
    Room { name: String },
    PrivatePair { members: [IdentityId; 2] },
}

impl From<ChannelRepr> for ChannelId {
    fn from(repr: ChannelRepr) -> Self {
        match repr {
            ChannelRepr::Room { name } => Self::Room(name),
            ChannelRepr::PrivatePair { members: [a, b] } => Self::private_pair(a, b),
        }
    }
}

impl From<ChannelId> for ChannelRepr {
    fn from(id: ChannelId) -> Self {
        match id {
            ChannelId::Room(name) => Self::Room { name },
            ChannelId::PrivatePair(pair) => Self::PrivatePair {
                members: [pair.low, pair.high],
            },
        }
    }
}

/// Per-channel message sequence number.
pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    Pending,
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            _ => None,
        }
    }
}

/// Message body as submitted by a sender. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Reference to an uploaded media blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn media(blob_ref: impl Into<String>) -> Self {
        Self {
            text: None,
            media: Some(blob_ref.into()),
        }
    }

    /// Trim whitespace and collapse blank fields to `None`.
    pub fn normalized(self) -> Self {
        let clean = |v: Option<String>| {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        Self {
            text: clean(self.text),
            media: clean(self.media),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.media.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub channel: ChannelId,
    pub sender: IdentityId,
    #[serde(flatten)]
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

/// Public view of a room. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub name: String,
    pub is_private: bool,
    pub creator: IdentityId,
    pub admins: Vec<IdentityId>,
    pub members: Vec<IdentityId>,
    pub created_at: DateTime<Utc>,
}
