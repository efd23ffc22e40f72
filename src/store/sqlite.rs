//! SQLite Document Store
//!
//! Embedded persistence backend. SQLite statements are atomic, which gives
//! the save path its no-partial-blob guarantee; queries run on blocking
//! worker threads so the async runtime is never stalled.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::admission::Role;

use super::{
    DocumentStore, MemberRecord, RoomRecord, RoomSeed, SaveReason, SaveRequest, SettingsPatch,
    StoreError, StoreResult, Visibility,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    room_key TEXT PRIMARY KEY,
    join_code TEXT NOT NULL,
    name TEXT NOT NULL,
    owner_ref TEXT NOT NULL,
    visibility TEXT NOT NULL,
    password_hash TEXT,
    capacity INTEGER NOT NULL,
    language TEXT NOT NULL,
    document_blob BLOB,
    fallback_text TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    last_saved INTEGER,
    last_save_reason TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_rooms_join_code ON rooms(join_code);

CREATE TABLE IF NOT EXISTS members (
    room_key TEXT NOT NULL,
    principal_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    role TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    online INTEGER NOT NULL DEFAULT 0,
    banned INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (room_key, principal_id)
);

CREATE INDEX IF NOT EXISTS idx_members_online ON members(room_key, online);
"#;

/// SQLite-backed document store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Fully in-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {}", e)))?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create_room(&self, seed: RoomSeed) -> StoreResult<RoomRecord> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO rooms (room_key, join_code, name, owner_ref, visibility, \
                 password_hash, capacity, language, fallback_text, created_at, last_activity) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '', ?9, ?9)",
                params![
                    seed.room_key,
                    seed.join_code,
                    seed.name,
                    seed.owner_ref,
                    seed.visibility.as_str(),
                    seed.password_hash,
                    seed.capacity,
                    seed.language,
                    now.timestamp_millis(),
                ],
            )
            .map_err(insert_error)?;
            select_room(conn, &seed.room_key)?.ok_or(StoreError::RoomNotFound)
        })
        .await
    }

    async fn lookup_room(&self, key_or_code: &str) -> StoreResult<RoomRecord> {
        let key = key_or_code.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM rooms WHERE room_key = ?1 OR join_code = ?1",
                params![key],
                row_to_room,
            )
            .optional()
            .map_err(unavailable)?
            .ok_or(StoreError::RoomNotFound)
        })
        .await
    }

    async fn load_room(&self, room_key: &str) -> StoreResult<RoomRecord> {
        let key = room_key.to_string();
        self.with_conn(move |conn| select_room(conn, &key)?.ok_or(StoreError::RoomNotFound))
            .await
    }

    async fn save_room(&self, save: SaveRequest) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE rooms SET document_blob = ?2, fallback_text = ?3, language = ?4, \
                     last_saved = ?5, last_save_reason = ?6, last_activity = ?5 \
                     WHERE room_key = ?1",
                    params![
                        save.room_key,
                        save.document_blob,
                        save.fallback_text,
                        save.language,
                        save.timestamp.timestamp_millis(),
                        save.reason.as_str(),
                    ],
                )
                .map_err(unavailable)?;
            if updated == 0 {
                return Err(StoreError::RoomNotFound);
            }
            Ok(())
        })
        .await
    }

    async fn update_settings(&self, room_key: &str, patch: SettingsPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let key = room_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(unavailable)?;
            if let Some(name) = &patch.name {
                tx.execute("UPDATE rooms SET name = ?2 WHERE room_key = ?1", params![key, name])
                    .map_err(unavailable)?;
            }
            if let Some(visibility) = patch.visibility {
                tx.execute(
                    "UPDATE rooms SET visibility = ?2 WHERE room_key = ?1",
                    params![key, visibility.as_str()],
                )
                .map_err(unavailable)?;
            }
            if let Some(capacity) = patch.capacity {
                tx.execute(
                    "UPDATE rooms SET capacity = ?2 WHERE room_key = ?1",
                    params![key, capacity],
                )
                .map_err(unavailable)?;
            }
            if let Some(password_hash) = &patch.password_hash {
                tx.execute(
                    "UPDATE rooms SET password_hash = ?2 WHERE room_key = ?1",
                    params![key, password_hash],
                )
                .map_err(unavailable)?;
            }
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM rooms WHERE room_key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(unavailable)?;
            if exists.is_none() {
                return Err(StoreError::RoomNotFound);
            }
            tx.commit().map_err(unavailable)
        })
        .await
    }

    async fn upsert_member(&self, member: MemberRecord) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO members (room_key, principal_id, display_name, role, joined_at, \
                 last_seen, online, banned) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(room_key, principal_id) DO UPDATE SET \
                 display_name = excluded.display_name, last_seen = excluded.last_seen, \
                 online = excluded.online",
                params![
                    member.room_key,
                    member.principal_id,
                    member.display_name,
                    role_str(member.role),
                    member.joined_at.timestamp_millis(),
                    member.last_seen.timestamp_millis(),
                    member.online,
                    member.banned,
                ],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn get_member(
        &self,
        room_key: &str,
        principal_id: &str,
    ) -> StoreResult<Option<MemberRecord>> {
        let key = room_key.to_string();
        let principal = principal_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM members WHERE room_key = ?1 AND principal_id = ?2",
                params![key, principal],
                row_to_member,
            )
            .optional()
            .map_err(unavailable)
        })
        .await
    }

    async fn mark_online(
        &self,
        room_key: &str,
        principal_id: &str,
        online: bool,
    ) -> StoreResult<()> {
        let key = room_key.to_string();
        let principal = principal_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE members SET online = ?3, last_seen = ?4 \
                 WHERE room_key = ?1 AND principal_id = ?2",
                params![key, principal, online, Utc::now().timestamp_millis()],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn count_online(&self, room_key: &str) -> StoreResult<u32> {
        let key = room_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM members WHERE room_key = ?1 AND online = 1",
                params![key],
                |row| row.get::<_, u32>(0),
            )
            .map_err(unavailable)
        })
        .await
    }

    async fn purge_room(&self, room_key: &str) -> StoreResult<()> {
        let key = room_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(unavailable)?;
            tx.execute("DELETE FROM members WHERE room_key = ?1", params![key])
                .map_err(unavailable)?;
            tx.execute("DELETE FROM rooms WHERE room_key = ?1", params![key])
                .map_err(unavailable)?;
            tx.commit().map_err(unavailable)
        })
        .await
    }
}

fn select_room(conn: &Connection, room_key: &str) -> StoreResult<Option<RoomRecord>> {
    conn.query_row("SELECT * FROM rooms WHERE room_key = ?1", params![room_key], row_to_room)
        .optional()
        .map_err(unavailable)
}

fn row_to_room(row: &Row<'_>) -> rusqlite::Result<RoomRecord> {
    let visibility: String = row.get("visibility")?;
    let reason: Option<String> = row.get("last_save_reason")?;
    Ok(RoomRecord {
        room_key: row.get("room_key")?,
        join_code: row.get("join_code")?,
        name: row.get("name")?,
        owner_ref: row.get("owner_ref")?,
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Public),
        password_hash: row.get("password_hash")?,
        capacity: row.get("capacity")?,
        language: row.get("language")?,
        document_blob: row.get("document_blob")?,
        fallback_text: row.get("fallback_text")?,
        created_at: millis(row.get("created_at")?),
        last_activity: millis(row.get("last_activity")?),
        last_saved: row.get::<_, Option<i64>>("last_saved")?.map(millis),
        last_save_reason: reason.as_deref().and_then(SaveReason::parse),
    })
}

fn row_to_member(row: &Row<'_>) -> rusqlite::Result<MemberRecord> {
    let role: String = row.get("role")?;
    Ok(MemberRecord {
        room_key: row.get("room_key")?,
        principal_id: row.get("principal_id")?,
        display_name: row.get("display_name")?,
        role: parse_role(&role),
        joined_at: millis(row.get("joined_at")?),
        last_seen: millis(row.get("last_seen")?),
        online: row.get("online")?,
        banned: row.get("banned")?,
    })
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Owner => "owner",
        Role::Editor => "editor",
        Role::Viewer => "viewer",
    }
}

fn parse_role(value: &str) -> Role {
    match value {
        "owner" => Role::Owner,
        "viewer" => Role::Viewer,
        _ => Role::Editor,
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn insert_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::RoomExists
        }
        _ => unavailable(e),
    }
}
