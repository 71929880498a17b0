//! Viewer state: the session list, the current selection, and the transcript
//! being shown.
//!
//! There is one `Viewer` per process. Callers hold it behind a lock and mutate
//! it through three paths: the bulk load, the change stream, and selection.
//! Store calls happen outside the lock, so a selection is split into
//! `begin_select` (under the lock) and `finish_select` (under the lock again,
//! after the fetch). The generation in `SelectTicket` lets `finish_select`
//! drop responses for a selection that has since been replaced. Bulk loads are
//! split the same way, with a `LoadTicket`.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::registry::{short_id, SessionRegistry, SessionSummary};
use crate::store::{ChangeEvent, SessionDetail, SessionRow, StoreError};
use crate::transcript::{normalize, ChatTurn};

/// Transcript of the selected session plus its origin metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTranscript {
    pub session_id: String,
    pub turns: Vec<ChatTurn>,
    pub origin: Value,
}

/// Proof that a bulk load was started, checked when it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub generation: u64,
}

/// Proof that a selection fetch was started, checked when it completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectTicket {
    pub session_id: String,
    pub generation: u64,
}

/// A list entry as the UI shows it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionItem {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub short_id: String,
    pub is_selected: bool,
    /// Unread badge; never shown on the selected session
    pub show_unseen: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptView {
    pub session_id: String,
    pub turns: Vec<ChatTurn>,
    pub origin: Option<String>,
}

/// Read-side snapshot of the whole viewer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub selected_session_id: Option<String>,
    pub sessions: Vec<SessionItem>,
    pub is_loading_sessions: bool,
    pub is_loading_transcript: bool,
    pub transcript: Option<TranscriptView>,
}

/// Display text for an origin value: strings verbatim, other values as JSON.
pub fn origin_text(origin: &Value) -> Option<String> {
    match origin {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Default)]
pub struct Viewer {
    registry: SessionRegistry,
    selected: Option<String>,
    generation: u64,
    active: Option<ActiveTranscript>,
    loading_sessions: bool,
    loading_transcript: bool,
    load_generation: u64,
    /// Events applied while a bulk load is in flight, replayed over its snapshot
    applied_during_load: Vec<ChangeEvent>,
}

impl Viewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn active(&self) -> Option<&ActiveTranscript> {
        self.active.as_ref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn begin_load(&mut self) -> LoadTicket {
        self.load_generation += 1;
        self.loading_sessions = true;
        self.applied_during_load.clear();
        LoadTicket {
            generation: self.load_generation,
        }
    }

    /// Apply a bulk fetch. Returns true if the list was replaced.
    ///
    /// The snapshot may predate change events applied while it was in flight,
    /// so those events are applied again on top of it in arrival order.
    pub fn finish_load(&mut self, ticket: LoadTicket, result: Result<Vec<SessionRow>, StoreError>) -> bool {
        if ticket.generation != self.load_generation {
            debug!(
                "Discarding stale session list (generation {} < {})",
                ticket.generation, self.load_generation
            );
            return false;
        }

        self.loading_sessions = false;
        let replay = std::mem::take(&mut self.applied_during_load);
        match result {
            Ok(rows) => {
                self.registry.load_all(&rows);
                for event in &replay {
                    self.registry.apply_change(event, self.selected.as_deref());
                }
                info!(
                    "Loaded {} sessions ({} changes replayed)",
                    self.registry.count(),
                    replay.len()
                );
                true
            }
            Err(e) => {
                error!("Error fetching sessions: {}", e);
                false
            }
        }
    }

    /// Start viewing `session_id`. `None` if it is already selected.
    pub fn begin_select(&mut self, session_id: &str) -> Option<SelectTicket> {
        if self.selected.as_deref() == Some(session_id) {
            return None;
        }

        self.generation += 1;
        self.selected = Some(session_id.to_string());
        self.active = None;
        self.loading_transcript = true;
        if self.registry.mark_seen(session_id).is_none() {
            debug!("Selected session {} is not in the list", session_id);
        }

        Some(SelectTicket {
            session_id: session_id.to_string(),
            generation: self.generation,
        })
    }

    /// Complete a selection fetch. Returns false if the ticket is stale and
    /// the result was discarded.
    pub fn finish_select(
        &mut self,
        ticket: SelectTicket,
        result: Result<SessionDetail, StoreError>,
    ) -> bool {
        if ticket.generation != self.generation {
            debug!(
                "Discarding stale transcript for {} (generation {} < {})",
                ticket.session_id, ticket.generation, self.generation
            );
            return false;
        }

        self.loading_transcript = false;
        match result {
            // `begin_select` cleared `active`, so a transcript for this id can
            // only come from a change applied during the fetch. It is newer.
            Ok(detail) => match &mut self.active {
                Some(active) if active.session_id == ticket.session_id => {
                    debug!("Keeping turns from change applied during fetch of {}", ticket.session_id);
                    active.origin = detail.user_ip;
                }
                _ => {
                    self.active = Some(ActiveTranscript {
                        turns: normalize(&detail.messages),
                        origin: detail.user_ip,
                        session_id: ticket.session_id.clone(),
                    });
                }
            },
            Err(e) => {
                error!("Error fetching messages for session {}: {}", ticket.session_id, e);
            }
        }
        self.registry.mark_seen(&ticket.session_id);
        true
    }

    /// Merge a change event, judged against the selection as it is now.
    /// Returns `(list_changed, transcript_changed)`.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> (bool, bool) {
        let Some((id, row)) = event.row() else {
            return (false, false);
        };
        if self.registry.get(id).is_none() {
            info!("New session {}", id);
        }

        let selected = self.selected.clone();
        self.registry.apply_change(event, selected.as_deref());
        if self.loading_sessions {
            self.applied_during_load.push(event.clone());
        }
        if selected.as_deref() != Some(id) {
            return (true, false);
        }

        let turns = normalize(&row.messages);
        match &mut self.active {
            Some(active) => active.turns = turns,
            None => {
                self.active = Some(ActiveTranscript {
                    session_id: id.to_string(),
                    turns,
                    origin: Value::Null,
                })
            }
        }
        (true, true)
    }

    pub fn snapshot(&self, filter: Option<&str>) -> ViewState {
        let sessions = self
            .registry
            .search(filter.unwrap_or_default())
            .into_iter()
            .map(|summary| {
                let is_selected = self.selected.as_deref() == Some(summary.id.as_str());
                SessionItem {
                    short_id: short_id(&summary.id),
                    is_selected,
                    show_unseen: summary.has_unseen_update && !is_selected,
                    summary: summary.clone(),
                }
            })
            .collect();

        ViewState {
            selected_session_id: self.selected.clone(),
            sessions,
            is_loading_sessions: self.loading_sessions,
            is_loading_transcript: self.loading_transcript,
            transcript: self.active.as_ref().map(|a| TranscriptView {
                session_id: a.session_id.clone(),
                turns: a.turns.clone(),
                origin: origin_text(&a.origin),
            }),
        }
    }
}
