//! # huddle-store
//!
//! Durable storage for the Huddle server, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` with typed CRUD helpers, and the [`ChatStore`]
//! trait the server writes through.

pub mod database;
pub mod identities;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod store;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use store::{ChatStore, EphemeralStore, SqliteStore};
