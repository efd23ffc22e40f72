//! Hub Context
//!
//! Shared handles for every connection, plus the room-lifecycle operations
//! the external control plane consumes: create, delete, settings, stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

use crate::admission::{self, Action, AdmissionService, Role};
use crate::config::{HubConfig, MAX_CAPACITY};
use crate::error::{Error, Result};
use crate::principal::Principal;
use crate::registry::RoomRegistry;
use crate::store::{
    DocumentStore, MemberRecord, RoomRecord, RoomSeed, SettingsPatch, Visibility,
};

/// Shared per-process context
#[derive(Clone)]
pub struct Hub {
    pub config: Arc<HubConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub registry: RoomRegistry,
    pub admission: Arc<AdmissionService>,
    sessions: Arc<AtomicUsize>,
}

/// Control-plane input for room creation
#[derive(Debug, Clone)]
pub struct CreateRoomOptions {
    pub name: String,
    pub visibility: Visibility,
    pub password: Option<String>,
    pub capacity: Option<u32>,
    pub language: Option<String>,
}

/// Owner-driven settings change with a plain-text password
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
    pub capacity: Option<u32>,
    /// `Some(None)` clears the password
    pub password: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub active_rooms: usize,
    pub active_sessions: usize,
}

impl Hub {
    pub fn new(config: Arc<HubConfig>, store: Arc<dyn DocumentStore>) -> Self {
        let registry = RoomRegistry::new(config.clone(), store.clone());
        let admission = Arc::new(AdmissionService::new(&config.token_signing_key));
        Self {
            config,
            store,
            registry,
            admission,
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a room owned by `owner`. Guest owners are legal but never
    /// persisted as member rows.
    pub async fn create_room(&self, owner: &Principal, opts: CreateRoomOptions) -> Result<RoomRecord> {
        let capacity = opts
            .capacity
            .unwrap_or(self.config.capacity_default)
            .clamp(1, MAX_CAPACITY);
        let password_hash = match &opts.password {
            Some(password) => Some(admission::hash_password(password)?),
            None => None,
        };
        let seed = RoomSeed {
            // short key for the URL, longer code for invites
            room_key: generate_key(6),
            join_code: generate_key(8),
            name: opts.name,
            owner_ref: owner.owner_ref(),
            visibility: opts.visibility,
            password_hash,
            capacity,
            language: opts.language.unwrap_or_else(|| "plaintext".to_string()),
        };
        let record = self.store.create_room(seed).await?;
        if !owner.is_guest() {
            let now = chrono::Utc::now();
            self.store
                .upsert_member(MemberRecord {
                    room_key: record.room_key.clone(),
                    principal_id: owner.id().to_string(),
                    display_name: owner.display_name().to_string(),
                    role: Role::Owner,
                    joined_at: now,
                    last_seen: now,
                    online: false,
                    banned: false,
                })
                .await?;
        }
        info!("created room {} ({})", record.room_key, record.name);
        Ok(record)
    }

    /// Purge a room and terminate its live actor. Owner only.
    pub async fn delete_room(&self, principal: &Principal, key_or_code: &str) -> Result<()> {
        let record = self.store.lookup_room(key_or_code).await?;
        self.require(principal, &record, Action::DeleteRoom).await?;
        self.registry.terminate(&record.room_key).await;
        self.store.purge_room(&record.room_key).await?;
        info!("deleted room {}", record.room_key);
        Ok(())
    }

    /// Change capacity, password, name, or visibility. Owner only.
    pub async fn update_room_settings(
        &self,
        principal: &Principal,
        key_or_code: &str,
        update: SettingsUpdate,
    ) -> Result<()> {
        let record = self.store.lookup_room(key_or_code).await?;
        self.require(principal, &record, Action::ChangeSettings).await?;
        if let Some(capacity) = update.capacity {
            if capacity == 0 || capacity > MAX_CAPACITY {
                return Err(Error::Config(format!(
                    "capacity must be between 1 and {}",
                    MAX_CAPACITY
                )));
            }
        }
        let password_hash = match update.password {
            Some(Some(password)) => Some(Some(admission::hash_password(&password)?)),
            Some(None) => Some(None),
            None => None,
        };
        let patch = SettingsPatch {
            name: update.name,
            visibility: update.visibility,
            capacity: update.capacity,
            password_hash,
        };
        self.store.update_settings(&record.room_key, patch).await?;
        Ok(())
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_rooms: self.registry.active_rooms(),
            active_sessions: self.sessions.load(Ordering::Relaxed),
        }
    }

    /// RAII counter for one live connection.
    pub fn session_gauge(&self) -> SessionGauge {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        SessionGauge { sessions: self.sessions.clone() }
    }

    async fn require(
        &self,
        principal: &Principal,
        record: &RoomRecord,
        action: Action,
    ) -> Result<()> {
        let member = self
            .store
            .get_member(&record.room_key, principal.id())
            .await
            .unwrap_or(None);
        let role = self.admission.role_for(record, principal, member.as_ref());
        if self.admission.authorize_action(role, action) {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "{} requires the owner role",
                record.room_key
            )))
        }
    }
}

pub struct SessionGauge {
    sessions: Arc<AtomicUsize>,
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

fn generate_key(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect::<String>()
        .to_uppercase()
}
