use huddle_shared::{ChannelId, IdentityId, Message, MessageContent, MessageId, MessageStatus};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::identities::parse_timestamp;

const SELECT_COLUMNS: &str =
    "SELECT channel_kind, channel_a, channel_b, id, sender, text, media, timestamp, status
     FROM messages";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let (kind, a, b) = message.channel.to_columns();
        self.conn().execute(
            "INSERT INTO messages
                (channel_kind, channel_a, channel_b, id, sender, text, media, timestamp, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                kind,
                a,
                b,
                message.id as i64,
                message.sender.as_str(),
                message.content.text,
                message.content.media,
                message.timestamp.to_rfc3339(),
                message.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Flip a message to `delivered`. Returns `true` if a row changed.
    pub fn mark_delivered(&self, channel: &ChannelId, id: MessageId) -> Result<bool> {
        let (kind, a, b) = channel.to_columns();
        let affected = self.conn().execute(
            "UPDATE messages SET status = 'delivered'
             WHERE channel_kind = ?1 AND channel_a = ?2 AND channel_b = ?3 AND id = ?4
               AND status != 'delivered'",
            params![kind, a, b, id as i64],
        )?;
        Ok(affected > 0)
    }

    /// Messages of one channel in ascending id order.
    pub fn get_messages_for_channel(&self, channel: &ChannelId) -> Result<Vec<Message>> {
        let (kind, a, b) = channel.to_columns();
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE channel_kind = ?1 AND channel_a = ?2 AND channel_b = ?3
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![kind, a, b], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Every stored message, grouped by channel and ascending by id.
    pub fn list_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS} ORDER BY channel_kind, channel_a, channel_b, id ASC"
        ))?;

        let rows = stmt.query_map([], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(0)?;
    let a: String = row.get(1)?;
    let b: String = row.get(2)?;
    let id: i64 = row.get(3)?;
    let sender: String = row.get(4)?;
    let text: Option<String> = row.get(5)?;
    let media: Option<String> = row.get(6)?;
    let ts_str: String = row.get(7)?;
    let status_str: String = row.get(8)?;

    let channel = ChannelId::from_columns(&kind, &a, &b).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown channel kind {kind:?}").into(),
        )
    })?;

    let status = MessageStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown message status {status_str:?}").into(),
        )
    })?;

    Ok(Message {
        id: id as MessageId,
        channel,
        sender: IdentityId(sender),
        content: MessageContent { text, media },
        timestamp: parse_timestamp(7, &ts_str)?,
        status,
    })
}
