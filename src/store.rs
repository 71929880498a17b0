//! Wire types and the seam to the remote session table.
//!
//! The viewer only reads: a bulk listing, a single-session lookup, and a
//! "changed since" query that backs the polling change feed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A row from the bulk listing (and from the changed-since query)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    #[serde(default)]
    pub messages: Value,
    pub updated_at: String,
}

/// Result of the single-session lookup
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionDetail {
    #[serde(default)]
    pub messages: Value,
    /// Network origin of the session, shape not guaranteed
    #[serde(default)]
    pub user_ip: Value,
}

/// Row state carried by a change event. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl ChangeRow {
    /// The session id, if present and non-empty
    pub fn id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// An insert/update notification: "this row now has this state"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub new: Option<ChangeRow>,
}

impl ChangeEvent {
    pub fn upsert(row: SessionRow) -> Self {
        Self {
            new: Some(ChangeRow {
                session_id: Some(row.session_id),
                messages: row.messages,
                updated_at: Some(row.updated_at),
            }),
        }
    }

    /// The row, only when it identifies a session
    pub fn row(&self) -> Option<(&str, &ChangeRow)> {
        let row = self.new.as_ref()?;
        Some((row.id()?, row))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Zero or more than one row matched a single-session lookup
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Every session, newest `updated_at` first
    async fn fetch_sessions(&self) -> Result<Vec<SessionRow>, StoreError>;

    /// Exactly one session by id
    async fn fetch_session(&self, session_id: &str) -> Result<SessionDetail, StoreError>;

    /// Rows with `updated_at >= since` (all rows if `None`), oldest first
    async fn fetch_changed_since(&self, since: Option<&str>) -> Result<Vec<SessionRow>, StoreError>;
}
