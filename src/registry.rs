//! Ordered, deduplicated list of session summaries.
//!
//! Fed by the bulk load and then by change events, one at a time. Holds at
//! most one summary per session id, newest `updated_at` first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

use crate::store::{ChangeEvent, SessionRow};
use crate::transcript::{normalize, ChatTurn};

/// Max characters of the last turn shown in the list
pub const PREVIEW_CHARS: usize = 40;
const PREVIEW_MARKER: &str = "...";
const SHORT_ID_CHARS: usize = 8;

/// Placeholder for an empty transcript seen during the bulk load
pub const EMPTY_PREVIEW_LOADED: &str = "No messages yet";
/// Placeholder for an empty transcript arriving on the change stream
pub const EMPTY_PREVIEW_LIVE: &str = "New session started";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub preview: String,
    pub last_updated: String,
    pub has_unseen_update: bool,
}

impl SessionSummary {
    fn from_parts(id: &str, turns: &[ChatTurn], last_updated: &str, placeholder: &str) -> Self {
        Self {
            id: id.to_string(),
            preview: preview(turns, placeholder),
            last_updated: last_updated.to_string(),
            has_unseen_update: false,
        }
    }
}

/// List text for a transcript: the head of its last turn, or `placeholder`.
pub fn preview(turns: &[ChatTurn], placeholder: &str) -> String {
    let Some(last) = turns.last() else {
        return placeholder.to_string();
    };
    let mut chars = last.content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}{}", head, PREVIEW_MARKER)
    } else {
        head
    }
}

/// Abbreviated id for list display ("0f3a9c21...")
pub fn short_id(id: &str) -> String {
    let head: String = id.chars().take(SHORT_ID_CHARS).collect();
    format!("{}...", head)
}

/// Descending by timestamp. Parseable timestamps rank above unparseable ones,
/// which fall back to string order.
fn newest_first(a: &SessionSummary, b: &SessionSummary) -> Ordering {
    let parse = |s: &str| DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc));
    parse(&b.last_updated)
        .cmp(&parse(&a.last_updated))
        .then_with(|| b.last_updated.cmp(&a.last_updated))
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    summaries: Vec<SessionSummary>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with a bulk snapshot. The store's ordering is kept as is.
    pub fn load_all(&mut self, rows: &[SessionRow]) -> &[SessionSummary] {
        self.summaries = rows
            .iter()
            .map(|row| {
                let turns = normalize(&row.messages);
                SessionSummary::from_parts(&row.session_id, &turns, &row.updated_at, EMPTY_PREVIEW_LOADED)
            })
            .collect();
        &self.summaries
    }

    /// Merge one upsert event. Returns false if the event carried no session id.
    pub fn apply_change(&mut self, event: &ChangeEvent, selected_id: Option<&str>) -> bool {
        let Some((id, row)) = event.row() else {
            return false;
        };

        let turns = normalize(&row.messages);
        let mut summary = SessionSummary::from_parts(
            id,
            &turns,
            row.updated_at.as_deref().unwrap_or_default(),
            EMPTY_PREVIEW_LIVE,
        );
        summary.has_unseen_update = selected_id != Some(id);

        self.summaries.retain(|s| s.id != id);
        self.summaries.insert(0, summary);
        // Stable sort: on equal timestamps the changed session stays ahead
        self.summaries.sort_by(newest_first);

        debug!("Applied change for session {} ({} turns)", id, turns.len());
        true
    }

    /// Clear the unseen flag for `id`. `None` if no such session.
    pub fn mark_seen(&mut self, id: &str) -> Option<&SessionSummary> {
        let summary = self.summaries.iter_mut().find(|s| s.id == id)?;
        summary.has_unseen_update = false;
        Some(summary)
    }

    pub fn get(&self, id: &str) -> Option<&SessionSummary> {
        self.summaries.iter().find(|s| s.id == id)
    }

    pub fn summaries(&self) -> &[SessionSummary] {
        &self.summaries
    }

    pub fn count(&self) -> usize {
        self.summaries.len()
    }

    /// Case-insensitive match on id or preview, in list order
    pub fn search(&self, term: &str) -> Vec<&SessionSummary> {
        let term = term.to_lowercase();
        self.summaries()
            .iter()
            .filter(|s| {
                term.is_empty()
                    || s.id.to_lowercase().contains(&term)
                    || s.preview.to_lowercase().contains(&term)
            })
            .collect()
    }
}
