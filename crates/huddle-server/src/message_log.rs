//! Append-only, per-channel message history.
//!
//! Each channel has its own async mutex. Appends take it via
//! [`MessageLog::lock`] and the caller publishes while still holding the
//! guard, which is what keeps per-channel delivery order equal to id order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use huddle_shared::{
    ChannelId, ChatError, ChatResult, IdentityId, Message, MessageContent, MessageId,
    MessageStatus,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::persist::{self, SharedStore};

pub struct ChannelLog {
    next_id: MessageId,
    messages: Vec<Message>,
    dropped: bool,
}

impl ChannelLog {
    fn restore(messages: Vec<Message>) -> Self {
        let next_id = messages.last().map(|m| m.id + 1).unwrap_or(1);
        Self {
            next_id,
            messages,
            dropped: false,
        }
    }

    /// Ascending id order: the newest `limit` messages with id < `before`.
    pub fn history(&self, before: Option<MessageId>, limit: Option<usize>) -> Vec<Message> {
        let end = match before {
            Some(before) => self.messages.partition_point(|m| m.id < before),
            None => self.messages.len(),
        };
        let start = match limit {
            Some(limit) => end.saturating_sub(limit),
            None => 0,
        };
        self.messages[start..end].to_vec()
    }

    fn find(&self, id: MessageId) -> Option<usize> {
        self.messages.binary_search_by_key(&id, |m| m.id).ok()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.find(id).map(|idx| &self.messages[idx])
    }
}

/// Exclusive access to one channel's log.
pub struct ChannelGuard {
    channel: ChannelId,
    log: OwnedMutexGuard<ChannelLog>,
    store: SharedStore,
}

impl ChannelGuard {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Assign the next id, persist, then make the message visible.
    pub async fn append(
        &mut self,
        sender: &IdentityId,
        content: MessageContent,
    ) -> ChatResult<Message> {
        if self.log.dropped {
            return Err(ChatError::RoomNotFound);
        }
        let content = content.normalized();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = Message {
            id: self.log.next_id,
            channel: self.channel.clone(),
            sender: sender.clone(),
            content,
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
        };

        let stored = message.clone();
        persist::write(&self.store, "insert_message", move |s| s.insert_message(&stored)).await?;

        self.log.next_id = message.id + 1;
        self.log.messages.push(message.clone());
        debug!(channel = %self.channel, id = message.id, sender = %sender, "Message appended");
        Ok(message)
    }

    /// Pending -> Delivered. Returns `true` only on the actual transition.
    pub async fn mark_delivered(&mut self, id: MessageId) -> ChatResult<bool> {
        let Some(idx) = self.log.find(id) else {
            return Err(ChatError::InvalidRequest(format!("unknown message id {id}")));
        };
        if self.log.messages[idx].status == MessageStatus::Delivered {
            return Ok(false);
        }

        let channel = self.channel.clone();
        persist::write(&self.store, "mark_delivered", move |s| s.mark_delivered(&channel, id))
            .await?;

        self.log.messages[idx].status = MessageStatus::Delivered;
        Ok(true)
    }

    #[cfg(test)]
    pub fn history(&self, before: Option<MessageId>, limit: Option<usize>) -> Vec<Message> {
        self.log.history(before, limit)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.log.get(id)
    }
}

pub struct MessageLog {
    channels: DashMap<ChannelId, Arc<Mutex<ChannelLog>>>,
    store: SharedStore,
}

impl MessageLog {
    /// `existing` must be grouped by channel and ascending within a channel.
    pub fn new(store: SharedStore, existing: Vec<Message>) -> Self {
        let mut grouped: HashMap<ChannelId, Vec<Message>> = HashMap::new();
        for message in existing {
            grouped.entry(message.channel.clone()).or_default().push(message);
        }

        let channels = grouped
            .into_iter()
            .map(|(channel, mut messages)| {
                messages.sort_by_key(|m| m.id);
                (channel, Arc::new(Mutex::new(ChannelLog::restore(messages))))
            })
            .collect();

        Self { channels, store }
    }

    /// Lock a channel, creating its log on first use.
    pub async fn lock(&self, channel: &ChannelId) -> ChannelGuard {
        let log = Arc::clone(
            self.channels
                .entry(channel.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ChannelLog::restore(Vec::new()))))
                .value(),
        );
        ChannelGuard {
            channel: channel.clone(),
            log: log.lock_owned().await,
            store: Arc::clone(&self.store),
        }
    }

    /// Read-only history. Unknown channels are simply empty.
    pub async fn history(
        &self,
        channel: &ChannelId,
        before: Option<MessageId>,
        limit: Option<usize>,
    ) -> Vec<Message> {
        let Some(log) = self.channels.get(channel).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };
        let log = log.lock().await;
        if log.dropped {
            return Vec::new();
        }
        log.history(before, limit)
    }

    /// Forget a channel's history. The durable copy goes with the room row.
    pub async fn drop_partition(&self, channel: &ChannelId) {
        if let Some((_, log)) = self.channels.remove(channel) {
            let mut log = log.lock().await;
            log.dropped = true;
            log.messages.clear();
            debug!(channel = %channel, "Message partition dropped");
        }
    }
}
