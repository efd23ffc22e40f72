//! Presence Tracking
//!
//! Transient per-principal metadata: cursor, selection, typing. Presence
//! lives only inside the room actor and is never persisted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cursor position in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub col: u32,
}

/// Selection as opaque CRDT relative positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: String,
    pub head: String,
}

/// Roster entry shipped to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub principal_id: String,
    pub display_name: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPos>,
    pub typing: bool,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    display_name: String,
    color: String,
    cursor: Option<CursorPos>,
    selection: Option<Selection>,
    typing: bool,
    typing_generation: u64,
    last_activity: DateTime<Utc>,
}

/// Per-room presence map, keyed by principal id
#[derive(Debug, Default)]
pub struct PresenceMap {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, principal_id: &str, display_name: &str, color: &str) {
        self.entries
            .entry(principal_id.to_string())
            .or_insert_with(|| PresenceEntry {
                display_name: display_name.to_string(),
                color: color.to_string(),
                cursor: None,
                selection: None,
                typing: false,
                typing_generation: 0,
                last_activity: Utc::now(),
            });
    }

    pub fn remove(&mut self, principal_id: &str) -> bool {
        self.entries.remove(principal_id).is_some()
    }

    pub fn contains(&self, principal_id: &str) -> bool {
        self.entries.contains_key(principal_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_cursor(&mut self, principal_id: &str, cursor: CursorPos, selection: Option<Selection>) {
        if let Some(entry) = self.entries.get_mut(principal_id) {
            entry.cursor = Some(cursor);
            entry.selection = selection;
            entry.last_activity = Utc::now();
        }
    }

    /// Flip the typing flag and bump its generation. The returned generation
    /// arms the expiry tick; a tick whose generation no longer matches is
    /// stale and must be ignored.
    pub fn set_typing(&mut self, principal_id: &str, active: bool) -> u64 {
        match self.entries.get_mut(principal_id) {
            Some(entry) => {
                entry.typing = active;
                entry.typing_generation += 1;
                entry.last_activity = Utc::now();
                entry.typing_generation
            }
            None => 0,
        }
    }

    /// Expire a typing flag if `generation` is still current. Returns true
    /// when the flag actually flipped off.
    pub fn expire_typing(&mut self, principal_id: &str, generation: u64) -> bool {
        match self.entries.get_mut(principal_id) {
            Some(entry) if entry.typing && entry.typing_generation == generation => {
                entry.typing = false;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<UserSnapshot> {
        let mut users: Vec<UserSnapshot> = self
            .entries
            .iter()
            .map(|(id, entry)| UserSnapshot {
                principal_id: id.clone(),
                display_name: entry.display_name.clone(),
                color: entry.color.clone(),
                cursor: entry.cursor,
                typing: entry.typing,
            })
            .collect();
        users.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
        users
    }

    pub fn snapshot_of(&self, principal_id: &str) -> Option<UserSnapshot> {
        self.entries.get(principal_id).map(|entry| UserSnapshot {
            principal_id: principal_id.to_string(),
            display_name: entry.display_name.clone(),
            color: entry.color.clone(),
            cursor: entry.cursor,
            typing: entry.typing,
        })
    }
}
