//! CRUD operations for [`IdentityRecord`] records.

use chrono::{DateTime, Utc};
use huddle_shared::IdentityId;
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::IdentityRecord;

impl Database {
    /// Insert a new identity. Fails on a duplicate username.
    pub fn insert_identity(&self, identity: &IdentityRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO identities (username, credential_hash, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                identity.username.as_str(),
                identity.credential_hash,
                identity.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_identity(&self, username: &IdentityId) -> Result<IdentityRecord> {
        self.conn()
            .query_row(
                "SELECT username, credential_hash, created_at
                 FROM identities WHERE username = ?1",
                params![username.as_str()],
                row_to_identity,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT username, credential_hash, created_at
             FROM identities ORDER BY username ASC",
        )?;

        let rows = stmt.query_map([], row_to_identity)?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row?);
        }
        Ok(identities)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRecord> {
    let username: String = row.get(0)?;
    let credential_hash: String = row.get(1)?;
    let created_str: String = row.get(2)?;

    Ok(IdentityRecord {
        username: IdentityId(username),
        credential_hash,
        created_at: parse_timestamp(2, &created_str)?,
    })
}

/// Parse an RFC-3339 column, reporting the column index on failure.
pub(crate) fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}
