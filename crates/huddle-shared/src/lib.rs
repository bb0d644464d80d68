//! # huddle-shared
//!
//! Types shared by the Huddle store and server: identities, channels,
//! messages, the WebSocket wire protocol, the error taxonomy, credential
//! hashing and session tokens.

pub mod constants;
pub mod credential;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;

pub use error::{ChatError, ChatResult};
pub use types::{
    ChannelId, ConnectionId, IdentityId, Message, MessageContent, MessageId, MessageStatus,
    PrivatePair, RoomSummary,
};
