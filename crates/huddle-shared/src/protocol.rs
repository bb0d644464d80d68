use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::{ChannelId, IdentityId, Message, MessageContent, MessageId};

/// Frames a client sends over its event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Identify { token: String },

    Subscribe { channel: ChannelId },

    Unsubscribe { channel: ChannelId },

    SendMessage {
        channel: ChannelId,
        content: MessageContent,
        /// Opaque client-side reference echoed back in `messageSent`, used
        /// to reconcile the optimistic local echo.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },

    FetchHistory {
        channel: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    GetOnlineUsers,

    InviteToRoom {
        room_name: String,
        username: IdentityId,
    },

    /// Receipt confirmation, used when delivery is acknowledgement-driven.
    Ack {
        channel: ChannelId,
        message_id: MessageId,
    },
}

/// Frames the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Identified { identity: IdentityId },

    Subscribed { channel: ChannelId },

    Unsubscribed { channel: ChannelId },

    MessageAppended { message: Message },

    /// Reply to the sender's own `sendMessage`.
    MessageSent {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },

    MessageDelivered {
        channel: ChannelId,
        message_id: MessageId,
    },

    History {
        channel: ChannelId,
        messages: Vec<Message>,
    },

    OnlineUsers { users: Vec<IdentityId> },

    PresenceChanged { identity: IdentityId, online: bool },

    MemberJoined { room: String, identity: IdentityId },

    MemberKicked { room: String, identity: IdentityId },

    ForceUnsubscribed { channel: ChannelId, reason: String },

    RoomDeleted { room: String },

    Invited { room: String, inviter: IdentityId },

    Error {
        code: String,
        message: String,
        status: u16,
    },
}

impl ServerFrame {
    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.public_message(),
            status: err.status(),
        }
    }
}

impl ClientFrame {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
