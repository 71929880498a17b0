//! Change subscription.
//!
//! Change events reach one bounded queue from two producers: the polling feed
//! below and webhook pushes from the HTTP layer. A single consumer drains the
//! queue and applies each event to the viewer in arrival order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::store::{ChangeEvent, SessionRow, SessionStore, StoreError};
use crate::viewer::Viewer;

/// Capacity of the change queue
pub const QUEUE_CAPACITY: usize = 256;

/// Turns "rows changed since" queries into upsert events.
///
/// Queries use `>=` on the watermark so rows sharing the newest timestamp are
/// not lost; ids already emitted at the watermark are skipped.
#[derive(Debug, Default)]
pub struct PollingFeed {
    watermark: Option<String>,
    at_watermark: HashSet<String>,
}

impl PollingFeed {
    /// Start after the rows already covered by a bulk load.
    pub fn after(rows: &[SessionRow]) -> Self {
        let mut feed = Self::default();
        let mut sorted: Vec<&SessionRow> = rows.iter().collect();
        sorted.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        for row in sorted {
            feed.advance(row);
        }
        feed
    }

    fn advance(&mut self, row: &SessionRow) {
        match &self.watermark {
            Some(w) if row.updated_at.as_str() < w.as_str() => {}
            Some(w) if row.updated_at == *w => {
                self.at_watermark.insert(row.session_id.clone());
            }
            _ => {
                self.watermark = Some(row.updated_at.clone());
                self.at_watermark.clear();
                self.at_watermark.insert(row.session_id.clone());
            }
        }
    }

    fn is_known(&self, row: &SessionRow) -> bool {
        self.watermark.as_deref() == Some(row.updated_at.as_str())
            && self.at_watermark.contains(&row.session_id)
    }

    pub async fn poll(&mut self, store: &dyn SessionStore) -> Result<Vec<ChangeEvent>, StoreError> {
        let rows = store.fetch_changed_since(self.watermark.as_deref()).await?;
        let mut events = Vec::new();
        for row in rows {
            if self.is_known(&row) {
                continue;
            }
            self.advance(&row);
            events.push(ChangeEvent::upsert(row));
        }
        Ok(events)
    }
}

/// Poll the store forever, pushing new rows onto the change queue.
pub async fn start_polling(
    store: Arc<dyn SessionStore>,
    mut feed: PollingFeed,
    tx: mpsc::Sender<ChangeEvent>,
    interval: Duration,
) {
    info!("Polling for session changes every {}ms", interval.as_millis());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match feed.poll(store.as_ref()).await {
            Ok(events) => {
                if !events.is_empty() {
                    debug!("Poll found {} changed sessions", events.len());
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        info!("Change queue closed, stopping poller");
                        return;
                    }
                }
            }
            Err(e) => warn!("Change poll failed: {}", e),
        }
    }
}

/// Apply queued events one at a time. `on_applied` runs under the write lock
/// with `(list_changed, transcript_changed)`.
pub async fn consume<F>(mut rx: mpsc::Receiver<ChangeEvent>, viewer: Arc<RwLock<Viewer>>, on_applied: F)
where
    F: Fn(&Viewer, bool, bool),
{
    while let Some(event) = rx.recv().await {
        let mut guard = viewer.write().await;
        let (list_changed, transcript_changed) = guard.apply_change(&event);
        if list_changed {
            on_applied(&guard, list_changed, transcript_changed);
        }
    }
    info!("Change queue drained, consumer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn row(id: &str, messages: Value, updated_at: &str) -> SessionRow {
        SessionRow {
            session_id: id.to_string(),
            messages,
            updated_at: updated_at.to_string(),
        }
    }

    fn event_ids(events: &[ChangeEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.row().map(|(id, _)| id.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_feed_skips_rows_from_bulk_load() {
        let initial = vec![
            row("a", json!([]), "2025-01-02T00:00:00Z"),
            row("b", json!([]), "2025-01-01T00:00:00Z"),
        ];
        let store = MemoryStore::new(initial.clone());
        let mut feed = PollingFeed::after(&initial);

        assert!(feed.poll(&store).await.unwrap().is_empty());

        store.put(row("b", json!("user:-new"), "2025-01-03T00:00:00Z"));
        store.put(row("c", json!([]), "2025-01-03T00:00:00Z"));
        let events = feed.poll(&store).await.unwrap();
        assert_eq!(event_ids(&events), vec!["b", "c"]);

        assert!(feed.poll(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_catches_late_row_at_same_timestamp() {
        let initial = vec![row("a", json!([]), "2025-01-02T00:00:00Z")];
        let store = MemoryStore::new(initial.clone());
        let mut feed = PollingFeed::after(&initial);

        store.put(row("z", json!([]), "2025-01-02T00:00:00Z"));
        let events = feed.poll(&store).await.unwrap();
        assert_eq!(event_ids(&events), vec!["z"]);
    }

    #[tokio::test]
    async fn test_feed_without_bulk_load_emits_everything() {
        let store = MemoryStore::new(vec![
            row("a", json!([]), "2025-01-02T00:00:00Z"),
            row("b", json!([]), "2025-01-01T00:00:00Z"),
        ]);
        let mut feed = PollingFeed::default();
        let events = feed.poll(&store).await.unwrap();
        assert_eq!(event_ids(&events), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_feed_survives_store_error() {
        let store = MemoryStore::new(vec![]);
        let mut feed = PollingFeed::default();
        store.set_failing(true);
        assert!(feed.poll(&store).await.is_err());
        store.set_failing(false);
        store.put(row("a", json!([]), "2025-01-02T00:00:00Z"));
        assert_eq!(event_ids(&feed.poll(&store).await.unwrap()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_consume_applies_in_arrival_order() {
        let viewer = Arc::new(RwLock::new(Viewer::new()));
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let calls = Arc::new(Mutex::new(Vec::new()));

        tx.send(ChangeEvent::upsert(row("a", json!("user:-first"), "2025-01-01T00:00:00Z")))
            .await
            .unwrap();
        tx.send(ChangeEvent::default()).await.unwrap();
        // Older timestamp arriving later still wins for its own row
        tx.send(ChangeEvent::upsert(row("a", json!("user:-second"), "2024-12-31T00:00:00Z")))
            .await
            .unwrap();
        drop(tx);

        let recorded = calls.clone();
        consume(rx, viewer.clone(), move |v, list, transcript| {
            recorded.lock().unwrap().push((v.registry().count(), list, transcript));
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), vec![(1, true, false), (1, true, false)]);
        let viewer = viewer.read().await;
        assert_eq!(viewer.registry().get("a").unwrap().preview, "second");
    }
}
