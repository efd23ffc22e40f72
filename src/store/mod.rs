//! Document Store
//!
//! Persistent room and membership records behind a backend-neutral trait.
//! One opaque CRDT state blob per room plus a plain-text fallback; the blob
//! and the fallback are always written together by a single save.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::Role;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,

    #[error("room already exists")]
    RoomExists,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Why a room snapshot was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveReason {
    /// Quiet period after the last update
    Debounce,
    /// Forced under continuous edits
    MaxStaleness,
    /// Last session detached
    LastLeft,
    /// Actor teardown
    Cleanup,
}

impl SaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveReason::Debounce => "debounce",
            SaveReason::MaxStaleness => "max-staleness",
            SaveReason::LastLeft => "last-left",
            SaveReason::Cleanup => "cleanup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "debounce" => Some(SaveReason::Debounce),
            "max-staleness" => Some(SaveReason::MaxStaleness),
            "last-left" => Some(SaveReason::LastLeft),
            "cleanup" => Some(SaveReason::Cleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// Persistent room row
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_key: String,
    pub join_code: String,
    pub name: String,
    pub owner_ref: String,
    pub visibility: Visibility,
    pub password_hash: Option<String>,
    pub capacity: u32,
    pub language: String,
    pub document_blob: Option<Vec<u8>>,
    pub fallback_text: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_saved: Option<DateTime<Utc>>,
    pub last_save_reason: Option<SaveReason>,
}

/// Persistent member row, unique per `(room_key, principal_id)`
#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub room_key: String,
    pub principal_id: String,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
    pub banned: bool,
}

/// Input for room creation
#[derive(Debug, Clone)]
pub struct RoomSeed {
    pub room_key: String,
    pub join_code: String,
    pub name: String,
    pub owner_ref: String,
    pub visibility: Visibility,
    pub password_hash: Option<String>,
    pub capacity: u32,
    pub language: String,
}

/// One atomic room snapshot write
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub room_key: String,
    pub document_blob: Vec<u8>,
    pub fallback_text: String,
    pub language: String,
    pub reason: SaveReason,
    pub timestamp: DateTime<Utc>,
}

/// Owner-driven settings change; `password_hash: Some(None)` clears the password
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
    pub capacity: Option<u32>,
    pub password_hash: Option<Option<String>>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.visibility.is_none()
            && self.capacity.is_none()
            && self.password_hash.is_none()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_room(&self, seed: RoomSeed) -> StoreResult<RoomRecord>;

    /// Resolve a room key or a join code to the full record. Either form
    /// uniquely addresses the room.
    async fn lookup_room(&self, key_or_code: &str) -> StoreResult<RoomRecord>;

    /// Load by primary room key only.
    async fn load_room(&self, room_key: &str) -> StoreResult<RoomRecord>;

    /// Atomically write blob, fallback text, language, and save metadata.
    async fn save_room(&self, save: SaveRequest) -> StoreResult<()>;

    async fn update_settings(&self, room_key: &str, patch: SettingsPatch) -> StoreResult<()>;

    /// Insert or refresh a member row. An existing row keeps its role and
    /// joined_at; display name, last_seen, and online are refreshed.
    async fn upsert_member(&self, member: MemberRecord) -> StoreResult<()>;

    async fn get_member(&self, room_key: &str, principal_id: &str)
        -> StoreResult<Option<MemberRecord>>;

    async fn mark_online(&self, room_key: &str, principal_id: &str, online: bool)
        -> StoreResult<()>;

    async fn count_online(&self, room_key: &str) -> StoreResult<u32>;

    /// Delete the room and all its member rows.
    async fn purge_room(&self, room_key: &str) -> StoreResult<()>;
}
