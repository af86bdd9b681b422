use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{AwarenessBroadcast, AwarenessEntry, AwarenessPayload};

/// Per-room ephemeral presence map: connection id to the latest payload that
/// connection announced. Pure in-memory, never persisted; mutation returns
/// the diff to broadcast so other clients only ever see deltas.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    entries: HashMap<Uuid, AwarenessPayload>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace this connection's entry and return the diff.
    pub fn set_local(&mut self, conn_id: Uuid, payload: AwarenessPayload) -> AwarenessBroadcast {
        self.entries.insert(conn_id, payload.clone());
        AwarenessBroadcast { conn_id, payload: Some(payload) }
    }

    /// Delete this connection's entry; `None` when there was nothing to
    /// remove.
    pub fn remove(&mut self, conn_id: Uuid) -> Option<AwarenessBroadcast> {
        self.entries
            .remove(&conn_id)
            .map(|_| AwarenessBroadcast { conn_id, payload: None })
    }

    /// Full map for a new joiner.
    pub fn snapshot_all(&self) -> Vec<AwarenessEntry> {
        self.entries
            .iter()
            .map(|(conn_id, payload)| AwarenessEntry {
                conn_id: *conn_id,
                payload: payload.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str) -> AwarenessPayload {
        AwarenessPayload {
            user: name.to_string(),
            name: name.to_string(),
            color: "#336699".to_string(),
            cursor: None,
        }
    }

    #[test]
    fn set_returns_diff_and_replaces_entry() {
        let mut tracker = AwarenessTracker::new();
        let conn = Uuid::new_v4();

        let diff = tracker.set_local(conn, payload("alice"));
        assert_eq!(diff.conn_id, conn);
        assert!(diff.payload.is_some());
        assert_eq!(tracker.len(), 1);

        let mut updated = payload("alice");
        updated.cursor = Some(crate::models::CursorRange { anchor: 3, head: 7 });
        tracker.set_local(conn, updated.clone());
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.snapshot_all()[0].payload, updated);
    }

    #[test]
    fn remove_returns_removal_diff_once() {
        let mut tracker = AwarenessTracker::new();
        let conn = Uuid::new_v4();
        tracker.set_local(conn, payload("alice"));

        let diff = tracker.remove(conn).unwrap();
        assert_eq!(diff.conn_id, conn);
        assert!(diff.payload.is_none());
        assert!(tracker.remove(conn).is_none());
        assert!(tracker.is_empty());
    }
}
