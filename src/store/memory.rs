//! In-Memory Document Store
//!
//! Map-backed store for tests and for `DOCSTORE_URL=memory:`. Supports
//! save fault injection so the retry and degraded paths can be exercised
//! without a real outage.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{
    DocumentStore, MemberRecord, RoomRecord, RoomSeed, SaveRequest, SettingsPatch, StoreError,
    StoreResult,
};

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, RoomRecord>,
    members: HashMap<(String, String), MemberRecord>,
    saves: Vec<SaveRequest>,
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_saves: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with `StoreError::Unavailable`.
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    /// Every save accepted so far, in arrival order.
    pub fn saves(&self) -> Vec<SaveRequest> {
        self.inner.lock().saves.clone()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_room(&self, seed: RoomSeed) -> StoreResult<RoomRecord> {
        let mut inner = self.inner.lock();
        let exists = inner
            .rooms
            .values()
            .any(|r| r.room_key == seed.room_key || r.join_code == seed.join_code);
        if exists {
            return Err(StoreError::RoomExists);
        }
        let now = Utc::now();
        let record = RoomRecord {
            room_key: seed.room_key.clone(),
            join_code: seed.join_code,
            name: seed.name,
            owner_ref: seed.owner_ref,
            visibility: seed.visibility,
            password_hash: seed.password_hash,
            capacity: seed.capacity,
            language: seed.language,
            document_blob: None,
            fallback_text: String::new(),
            created_at: now,
            last_activity: now,
            last_saved: None,
            last_save_reason: None,
        };
        inner.rooms.insert(seed.room_key, record.clone());
        Ok(record)
    }

    async fn lookup_room(&self, key_or_code: &str) -> StoreResult<RoomRecord> {
        let inner = self.inner.lock();
        inner
            .rooms
            .values()
            .find(|r| r.room_key == key_or_code || r.join_code == key_or_code)
            .cloned()
            .ok_or(StoreError::RoomNotFound)
    }

    async fn load_room(&self, room_key: &str) -> StoreResult<RoomRecord> {
        let inner = self.inner.lock();
        inner.rooms.get(room_key).cloned().ok_or(StoreError::RoomNotFound)
    }

    async fn save_room(&self, save: SaveRequest) -> StoreResult<()> {
        if self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let room = inner.rooms.get_mut(&save.room_key).ok_or(StoreError::RoomNotFound)?;
        room.document_blob = Some(save.document_blob.clone());
        room.fallback_text = save.fallback_text.clone();
        room.language = save.language.clone();
        room.last_saved = Some(save.timestamp);
        room.last_save_reason = Some(save.reason);
        room.last_activity = save.timestamp;
        inner.saves.push(save);
        Ok(())
    }

    async fn update_settings(&self, room_key: &str, patch: SettingsPatch) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let room = inner.rooms.get_mut(room_key).ok_or(StoreError::RoomNotFound)?;
        if let Some(name) = patch.name {
            room.name = name;
        }
        if let Some(visibility) = patch.visibility {
            room.visibility = visibility;
        }
        if let Some(capacity) = patch.capacity {
            room.capacity = capacity;
        }
        if let Some(password_hash) = patch.password_hash {
            room.password_hash = password_hash;
        }
        Ok(())
    }

    async fn upsert_member(&self, member: MemberRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let key = (member.room_key.clone(), member.principal_id.clone());
        match inner.members.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.display_name = member.display_name;
                existing.last_seen = member.last_seen;
                existing.online = member.online;
            }
            Entry::Vacant(entry) => {
                entry.insert(member);
            }
        }
        Ok(())
    }

    async fn get_member(
        &self,
        room_key: &str,
        principal_id: &str,
    ) -> StoreResult<Option<MemberRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .members
            .get(&(room_key.to_string(), principal_id.to_string()))
            .cloned())
    }

    async fn mark_online(
        &self,
        room_key: &str,
        principal_id: &str,
        online: bool,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(member) = inner
            .members
            .get_mut(&(room_key.to_string(), principal_id.to_string()))
        {
            member.online = online;
            member.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn count_online(&self, room_key: &str) -> StoreResult<u32> {
        let inner = self.inner.lock();
        Ok(inner
            .members
            .values()
            .filter(|m| m.room_key == room_key && m.online)
            .count() as u32)
    }

    async fn purge_room(&self, room_key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.rooms.remove(room_key);
        inner.members.retain(|(key, _), _| key != room_key);
        Ok(())
    }
}
