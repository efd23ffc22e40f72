//! Room Registry
//!
//! Process-wide mapping from room key to the live room actor. Creation is
//! serialized under a single mutex so concurrent references converge on
//! one actor; the mutex only guards map access and never awaits an actor.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::room::{RoomActor, RoomCommand, RoomHandle};
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<HubConfig>,
    store: Arc<dyn DocumentStore>,
    rooms: Mutex<HashMap<String, RoomHandle>>,
}

impl RoomRegistry {
    pub fn new(config: Arc<HubConfig>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner: Arc::new(Inner { config, store, rooms: Mutex::new(HashMap::new()) }),
        }
    }

    /// Return the live actor for `room_key`, spawning one on first
    /// reference. A handle whose actor has stopped receiving counts as
    /// terminating and is replaced.
    pub fn acquire(&self, room_key: &str) -> RoomHandle {
        let mut rooms = self.inner.rooms.lock();
        if let Some(handle) = rooms.get(room_key) {
            if !handle.is_closed() {
                return handle.clone();
            }
            debug!("room {}: replacing terminated actor {}", room_key, handle.actor_id);
        }
        let handle = RoomActor::spawn(
            room_key.to_string(),
            self.inner.config.clone(),
            self.inner.store.clone(),
            self.clone(),
        );
        rooms.insert(room_key.to_string(), handle.clone());
        handle
    }

    /// Remove the mapping, but only if it still points at the same actor
    /// instance. A reborn actor of the same key is left alone.
    pub fn release(&self, room_key: &str, actor_id: Uuid) {
        let mut rooms = self.inner.rooms.lock();
        if rooms.get(room_key).map_or(false, |h| h.actor_id == actor_id) {
            rooms.remove(room_key);
        }
    }

    /// Live handle without spawning.
    pub fn peek(&self, room_key: &str) -> Option<RoomHandle> {
        let rooms = self.inner.rooms.lock();
        rooms.get(room_key).filter(|h| !h.is_closed()).cloned()
    }

    /// Ask a live actor (if any) to drop everything; used when the room is
    /// purged.
    pub async fn terminate(&self, room_key: &str) {
        if let Some(handle) = self.peek(room_key) {
            let _ = handle.send(RoomCommand::Terminate).await;
        }
    }

    /// Number of resident (non-terminated) room actors.
    pub fn active_rooms(&self) -> usize {
        let rooms = self.inner.rooms.lock();
        rooms.values().filter(|h| !h.is_closed()).count()
    }
}
