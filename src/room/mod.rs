//! Room Actor
//!
//! One task per active room. The actor owns the room's CRDT document, the
//! attached sessions, and presence; every mutation arrives as a command on
//! a single channel and is applied by the one consumer loop, so no field
//! ever has two concurrent mutators. Broadcasts are enqueued into each
//! peer's outbox and never block the actor. Persistence is debounced
//! write-behind with a staleness bound and at most one in-flight save.

pub mod outbox;

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use uuid::Uuid;

use crate::admission::Role;
use crate::config::HubConfig;
use crate::document::RoomDocument;
use crate::error::Error;
use crate::presence::{CursorPos, PresenceMap, Selection, UserSnapshot};
use crate::principal::Principal;
use crate::protocol::{ErrorKind, ServerFrame, WarningKind};
use crate::registry::RoomRegistry;
use crate::store::{DocumentStore, RoomRecord, SaveReason, SaveRequest, StoreError};

use outbox::{Outbox, PushOutcome};

/// Command channel bound; senders briefly await when a room is saturated.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// A session as the actor sees it: an identity and a place to put frames.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub outbox: Outbox,
}

/// Everything a freshly admitted session needs to greet its client.
#[derive(Debug, Clone)]
pub struct HelloSnapshot {
    pub room_key: String,
    pub room_name: String,
    pub role: Role,
    pub language: String,
    pub users: Vec<UserSnapshot>,
    pub document: Vec<u8>,
}

/// Why a session detached (logging only; the effects are identical)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    Left,
    TransportClosed,
    Timeout,
}

/// Commands processed by the actor in arrival order
pub enum RoomCommand {
    Attach {
        session: SessionHandle,
        principal: Principal,
        role: Role,
        reply: oneshot::Sender<Result<HelloSnapshot, ErrorKind>>,
    },
    Detach {
        session_id: Uuid,
        reason: DetachReason,
    },
    CrdtUpdate {
        session_id: Uuid,
        blob: Vec<u8>,
    },
    Cursor {
        session_id: Uuid,
        cursor: CursorPos,
        selection: Option<Selection>,
    },
    Typing {
        session_id: Uuid,
        active: bool,
    },
    LanguageChange {
        session_id: Uuid,
        language: String,
    },
    Chat {
        session_id: Uuid,
        text: String,
    },
    SaveTick {
        generation: u64,
    },
    IdleTick {
        generation: u64,
    },
    TypingTick {
        principal_id: String,
        generation: u64,
    },
    SaveDone {
        reason: SaveReason,
        result: Result<(), StoreError>,
    },
    /// The room was purged; drop everything without a final save.
    Terminate,
}

/// Cloneable address of a live room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub room_key: String,
    pub actor_id: Uuid,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub async fn send(&self, command: RoomCommand) -> Result<(), Error> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::RoomClosed(self.room_key.clone()))
    }

    /// True once the actor has stopped receiving; the registry treats such
    /// a handle as terminating and spawns a replacement.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorState {
    Running,
    /// Save retry budget exhausted; still serving, clients warned
    Degraded,
}

enum Flow {
    Continue,
    Shutdown,
}

struct AttachedSession {
    principal: Principal,
    role: Role,
    outbox: Outbox,
}

struct RoomMeta {
    name: String,
    capacity: u32,
    language: String,
}

pub struct RoomActor {
    room_key: String,
    actor_id: Uuid,
    config: Arc<HubConfig>,
    store: Arc<dyn DocumentStore>,
    registry: RoomRegistry,
    rx: mpsc::Receiver<RoomCommand>,
    tx: mpsc::Sender<RoomCommand>,

    doc: RoomDocument,
    meta: RoomMeta,
    sessions: HashMap<Uuid, AttachedSession>,
    presence: PresenceMap,
    state: ActorState,

    dirty: bool,
    updates_since_save: u64,
    oldest_dirty: Option<Instant>,
    save_generation: u64,
    save_inflight: bool,
    pending_save: Option<SaveReason>,
    save_attempts: u32,
    idle_generation: u64,
    purged: bool,
}

impl RoomActor {
    /// Spawn the actor task and return its handle. The actor's first action
    /// is to load the room; commands queue in the channel until then.
    pub fn spawn(
        room_key: String,
        config: Arc<HubConfig>,
        store: Arc<dyn DocumentStore>,
        registry: RoomRegistry,
    ) -> RoomHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor_id = Uuid::new_v4();
        let handle = RoomHandle { room_key: room_key.clone(), actor_id, tx: tx.clone() };

        let actor = RoomActor {
            meta: RoomMeta {
                name: room_key.clone(),
                capacity: config.capacity_default,
                language: "plaintext".to_string(),
            },
            room_key,
            actor_id,
            config,
            store,
            registry,
            rx,
            tx,
            doc: RoomDocument::new(),
            sessions: HashMap::new(),
            presence: PresenceMap::new(),
            state: ActorState::Running,
            dirty: false,
            updates_since_save: 0,
            oldest_dirty: None,
            save_generation: 0,
            save_inflight: false,
            pending_save: None,
            save_attempts: 0,
            idle_generation: 0,
            purged: false,
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        debug!("room {}: actor {} starting", self.room_key, self.actor_id);

        match self.store.load_room(&self.room_key).await {
            Ok(record) => self.init_from_record(record),
            Err(e) => {
                warn!("room {}: load failed, refusing sessions: {}", self.room_key, e);
                let kind = match e {
                    StoreError::RoomNotFound => ErrorKind::RoomNotFound,
                    _ => ErrorKind::RoomUnavailable,
                };
                self.refuse_queued_attaches(kind);
                self.registry.release(&self.room_key, self.actor_id);
                return;
            }
        }

        // arm the idle timer so a room nobody attaches to still gets reaped
        self.arm_idle_timer();

        while let Some(command) = self.rx.recv().await {
            let flow = panic::catch_unwind(AssertUnwindSafe(|| self.handle_command(command)));
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break,
                Err(_) => {
                    error!("room {}: command handler panicked; shutting the room down", self.room_key);
                    break;
                }
            }
        }

        self.drain().await;
    }

    fn init_from_record(&mut self, record: RoomRecord) {
        self.meta = RoomMeta {
            name: record.name,
            capacity: record.capacity.max(1),
            language: record.language,
        };
        match record.document_blob {
            Some(blob) if !blob.is_empty() => match RoomDocument::from_state(&blob) {
                Ok(doc) => self.doc = doc,
                Err(e) => {
                    error!(
                        "room {}: stored blob no longer decodes, reseeding from fallback text: {}",
                        self.room_key, e
                    );
                    self.doc = RoomDocument::new();
                    self.doc.seed_text(&record.fallback_text);
                }
            },
            _ => {
                self.doc = RoomDocument::new();
                self.doc.seed_text(&record.fallback_text);
            }
        }
        info!("room {}: loaded ({} bytes of text)", self.room_key, self.doc.len());
    }

    fn refuse_queued_attaches(&mut self, kind: ErrorKind) {
        while let Ok(command) = self.rx.try_recv() {
            if let RoomCommand::Attach { reply, .. } = command {
                let _ = reply.send(Err(kind));
            }
        }
    }

    fn handle_command(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Attach { session, principal, role, reply } => {
                self.handle_attach(session, principal, role, reply);
            }
            RoomCommand::Detach { session_id, reason } => self.handle_detach(session_id, reason),
            RoomCommand::CrdtUpdate { session_id, blob } => self.handle_crdt_update(session_id, blob),
            RoomCommand::Cursor { session_id, cursor, selection } => {
                self.handle_cursor(session_id, cursor, selection)
            }
            RoomCommand::Typing { session_id, active } => self.handle_typing(session_id, active),
            RoomCommand::LanguageChange { session_id, language } => {
                self.handle_language_change(session_id, language)
            }
            RoomCommand::Chat { session_id, text } => self.handle_chat(session_id, text),
            RoomCommand::SaveTick { generation } => self.handle_save_tick(generation),
            RoomCommand::IdleTick { generation } => {
                if generation == self.idle_generation && self.sessions.is_empty() {
                    info!("room {}: idle grace elapsed, tearing down", self.room_key);
                    return Flow::Shutdown;
                }
            }
            RoomCommand::TypingTick { principal_id, generation } => {
                if self.presence.expire_typing(&principal_id, generation) {
                    self.broadcast_all(ServerFrame::Typing { principal_id, active: false });
                }
            }
            RoomCommand::SaveDone { reason, result } => self.handle_save_done(reason, result),
            RoomCommand::Terminate => {
                self.handle_terminate();
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    // ---- joins and leaves ----

    fn handle_attach(
        &mut self,
        session: SessionHandle,
        principal: Principal,
        role: Role,
        reply: oneshot::Sender<Result<HelloSnapshot, ErrorKind>>,
    ) {
        let already_present = self
            .sessions
            .values()
            .any(|s| s.principal.id() == principal.id());

        if !already_present && self.distinct_principals() >= self.meta.capacity as usize {
            let _ = reply.send(Err(ErrorKind::RoomFull));
            return;
        }

        self.idle_generation += 1; // cancels any pending teardown
        self.presence
            .insert(principal.id(), principal.display_name(), principal.color_token());

        let snapshot = HelloSnapshot {
            room_key: self.room_key.clone(),
            room_name: self.meta.name.clone(),
            role,
            language: self.meta.language.clone(),
            users: self.presence.snapshot(),
            document: self.doc.encode_state(),
        };

        let session_id = session.id;
        self.sessions.insert(
            session_id,
            AttachedSession { principal: principal.clone(), role, outbox: session.outbox },
        );
        let _ = reply.send(Ok(snapshot));

        if !already_present {
            if let Some(user) = self.presence.snapshot_of(principal.id()) {
                self.broadcast_except(session_id, ServerFrame::UserJoined { user });
            }
            if !principal.is_guest() {
                self.spawn_membership_upsert(&principal, role);
            }
        }
        info!(
            "room {}: {} attached as {} ({} sessions)",
            self.room_key,
            principal.id(),
            role.as_str(),
            self.sessions.len()
        );
    }

    fn handle_detach(&mut self, session_id: Uuid, reason: DetachReason) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return; // second detach is a no-op
        };
        debug!("room {}: session {} detached ({:?})", self.room_key, session_id, reason);
        session.outbox.close(None);
        self.after_session_removed(session);
    }

    /// Shared tail of detach and forced close: presence, online bookkeeping,
    /// and the empty-room transition.
    fn after_session_removed(&mut self, session: AttachedSession) {
        let principal_id = session.principal.id().to_string();
        let last_of_principal = !self
            .sessions
            .values()
            .any(|s| s.principal.id() == principal_id);

        if last_of_principal {
            self.presence.remove(&principal_id);
            self.broadcast_all(ServerFrame::UserLeft { principal_id: principal_id.clone() });
            if !session.principal.is_guest() {
                self.spawn_mark_online(principal_id, false);
            }
        }

        if self.sessions.is_empty() {
            self.request_save(SaveReason::LastLeft);
            self.arm_idle_timer();
        }
    }

    fn arm_idle_timer(&mut self) {
        self.idle_generation += 1;
        let generation = self.idle_generation;
        let tx = self.tx.clone();
        let grace = self.config.idle_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            let _ = tx.send(RoomCommand::IdleTick { generation }).await;
        });
    }

    fn distinct_principals(&self) -> usize {
        self.sessions
            .values()
            .map(|s| s.principal.id())
            .collect::<HashSet<_>>()
            .len()
    }

    // ---- document updates ----

    fn handle_crdt_update(&mut self, session_id: Uuid, blob: Vec<u8>) {
        let Some(session) = self.sessions.get(&session_id) else { return };
        if !matches!(session.role, Role::Owner | Role::Editor) {
            session.outbox.push(ServerFrame::Error {
                kind: ErrorKind::Unauthorized,
                detail: Some("viewers cannot edit".to_string()),
            });
            return;
        }
        if let Err(e) = self.doc.apply_update(&blob) {
            warn!("room {}: malformed update from {}: {}", self.room_key, session_id, e);
            self.close_session(session_id, ErrorKind::ProtocolError);
            return;
        }

        self.dirty = true;
        self.updates_since_save += 1;
        if self.oldest_dirty.is_none() {
            self.oldest_dirty = Some(Instant::now());
        }
        self.schedule_save();

        let origin = self.sessions[&session_id].principal.id().to_string();
        self.broadcast_except(
            session_id,
            ServerFrame::CrdtUpdate { blob, origin_principal_id: origin },
        );
    }

    // ---- presence ----

    fn handle_cursor(&mut self, session_id: Uuid, cursor: CursorPos, selection: Option<Selection>) {
        let Some(session) = self.sessions.get(&session_id) else { return };
        let principal_id = session.principal.id().to_string();
        self.presence.set_cursor(&principal_id, cursor, selection.clone());
        self.broadcast_except(
            session_id,
            ServerFrame::Cursor {
                principal_id,
                line: cursor.line,
                col: cursor.col,
                selection,
            },
        );
    }

    fn handle_typing(&mut self, session_id: Uuid, active: bool) {
        let Some(session) = self.sessions.get(&session_id) else { return };
        let principal_id = session.principal.id().to_string();
        let generation = self.presence.set_typing(&principal_id, active);
        if active {
            let tx = self.tx.clone();
            let ttl = self.config.typing_ttl;
            let tick_principal = principal_id.clone();
            tokio::spawn(async move {
                sleep(ttl).await;
                let _ = tx
                    .send(RoomCommand::TypingTick { principal_id: tick_principal, generation })
                    .await;
            });
        }
        self.broadcast_except(session_id, ServerFrame::Typing { principal_id, active });
    }

    fn handle_language_change(&mut self, session_id: Uuid, language: String) {
        let Some(session) = self.sessions.get(&session_id) else { return };
        if !matches!(session.role, Role::Owner | Role::Editor) {
            session.outbox.push(ServerFrame::Error {
                kind: ErrorKind::Unauthorized,
                detail: Some("viewers cannot change the language".to_string()),
            });
            return;
        }
        if self.meta.language == language {
            return;
        }
        self.meta.language = language.clone();
        self.dirty = true;
        if self.oldest_dirty.is_none() {
            self.oldest_dirty = Some(Instant::now());
        }
        self.schedule_save();
        self.broadcast_all(ServerFrame::LanguageChange { language });
    }

    fn handle_chat(&mut self, session_id: Uuid, text: String) {
        let Some(session) = self.sessions.get(&session_id) else { return };
        let frame = ServerFrame::Chat {
            principal_id: session.principal.id().to_string(),
            display_name: session.principal.display_name().to_string(),
            text,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.broadcast_except(session_id, frame);
    }

    // ---- persistence ----

    /// Arm (or re-arm) the debounce timer. The effective deadline is the
    /// debounce period from now, capped by the staleness bound measured
    /// from the oldest unsaved change.
    fn schedule_save(&mut self) {
        if self.save_inflight {
            self.pending_save.get_or_insert(SaveReason::Debounce);
            return;
        }
        let debounce_deadline = Instant::now() + self.config.debounce;
        let deadline = match self.oldest_dirty {
            Some(oldest) => debounce_deadline.min(oldest + self.config.max_staleness),
            None => debounce_deadline,
        };
        self.save_generation += 1;
        let generation = self.save_generation;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = tx.send(RoomCommand::SaveTick { generation }).await;
        });
    }

    fn handle_save_tick(&mut self, generation: u64) {
        if generation != self.save_generation || !self.dirty {
            return;
        }
        if self.save_inflight {
            self.pending_save.get_or_insert(SaveReason::Debounce);
            return;
        }
        let reason = match self.pending_save.take() {
            Some(reason @ (SaveReason::LastLeft | SaveReason::Cleanup)) => reason,
            _ => match self.oldest_dirty {
                Some(oldest) if oldest.elapsed() >= self.config.max_staleness => {
                    SaveReason::MaxStaleness
                }
                _ => SaveReason::Debounce,
            },
        };
        self.begin_save(reason);
    }

    /// Ask for a save now, or remember it if one is already in flight.
    fn request_save(&mut self, reason: SaveReason) {
        if self.save_inflight {
            self.pending_save = Some(reason);
        } else {
            self.begin_save(reason);
        }
    }

    fn begin_save(&mut self, reason: SaveReason) {
        debug!(
            "room {}: snapshotting {} updates ({})",
            self.room_key,
            self.updates_since_save,
            reason.as_str()
        );
        self.save_inflight = true;
        self.dirty = false;
        self.updates_since_save = 0;
        self.oldest_dirty = None;

        let save = SaveRequest {
            room_key: self.room_key.clone(),
            document_blob: self.doc.encode_state(),
            fallback_text: self.doc.text(),
            language: self.meta.language.clone(),
            reason,
            timestamp: Utc::now(),
        };
        let store = self.store.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = store.save_room(save).await;
            let _ = tx.send(RoomCommand::SaveDone { reason, result }).await;
        });
    }

    fn handle_save_done(&mut self, reason: SaveReason, result: Result<(), StoreError>) {
        self.save_inflight = false;
        match result {
            Ok(()) => {
                self.save_attempts = 0;
                if self.state == ActorState::Degraded {
                    self.state = ActorState::Running;
                    info!("room {}: persistence recovered", self.room_key);
                }
                debug!("room {}: saved ({})", self.room_key, reason.as_str());
                if let Some(pending) = self.pending_save.take() {
                    self.begin_save(pending);
                } else if self.dirty {
                    self.schedule_save();
                }
            }
            Err(e) => {
                self.dirty = true;
                if self.oldest_dirty.is_none() {
                    self.oldest_dirty = Some(Instant::now());
                }
                self.save_attempts += 1;
                warn!(
                    "room {}: save failed (attempt {}): {}",
                    self.room_key, self.save_attempts, e
                );
                if self.save_attempts >= self.config.save_retry_budget
                    && self.state != ActorState::Degraded
                {
                    self.state = ActorState::Degraded;
                    self.broadcast_all(ServerFrame::Warning {
                        kind: WarningKind::PersistenceStalled,
                        detail: Some(e.to_string()),
                    });
                }
                let exponent = self.save_attempts.saturating_sub(1).min(6);
                let backoff = (self.config.save_backoff_initial * 2u32.pow(exponent))
                    .min(self.config.save_backoff_cap);
                self.save_generation += 1;
                let generation = self.save_generation;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    sleep(backoff).await;
                    let _ = tx.send(RoomCommand::SaveTick { generation }).await;
                });
            }
        }
    }

    // ---- fan-out ----

    fn broadcast_except(&mut self, origin: Uuid, frame: ServerFrame) {
        let mut backpressured: Vec<Uuid> = Vec::new();
        for (id, session) in &self.sessions {
            if *id == origin {
                continue;
            }
            if session.outbox.push(frame.clone()) == PushOutcome::RejectedFull {
                backpressured.push(*id);
            }
        }
        for id in backpressured {
            self.close_session(id, ErrorKind::Backpressure);
        }
    }

    fn broadcast_all(&mut self, frame: ServerFrame) {
        let mut backpressured: Vec<Uuid> = Vec::new();
        for (id, session) in &self.sessions {
            if session.outbox.push(frame.clone()) == PushOutcome::RejectedFull {
                backpressured.push(*id);
            }
        }
        for id in backpressured {
            self.close_session(id, ErrorKind::Backpressure);
        }
    }

    /// Forcibly close one session. Peers are unaffected.
    fn close_session(&mut self, session_id: Uuid, kind: ErrorKind) {
        let Some(session) = self.sessions.remove(&session_id) else { return };
        warn!("room {}: closing session {} ({:?})", self.room_key, session_id, kind);
        session.outbox.close(Some(kind));
        self.after_session_removed(session);
    }

    // ---- teardown ----

    fn handle_terminate(&mut self) {
        info!("room {}: purged, dropping {} sessions", self.room_key, self.sessions.len());
        self.purged = true;
        for (_, session) in self.sessions.drain() {
            session.outbox.close(Some(ErrorKind::RoomNotFound));
        }
    }

    async fn drain(mut self) {
        // wait out an in-flight save so the final snapshot supersedes it
        while self.save_inflight {
            match self.rx.recv().await {
                Some(RoomCommand::SaveDone { .. }) => self.save_inflight = false,
                Some(RoomCommand::Attach { reply, .. }) => {
                    let _ = reply.send(Err(ErrorKind::RoomUnavailable));
                }
                Some(_) => {}
                None => break,
            }
        }

        if !self.purged && self.dirty {
            let save = SaveRequest {
                room_key: self.room_key.clone(),
                document_blob: self.doc.encode_state(),
                fallback_text: self.doc.text(),
                language: self.meta.language.clone(),
                reason: SaveReason::Cleanup,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.store.save_room(save).await {
                error!("room {}: final save failed: {}", self.room_key, e);
            }
        }

        for (_, session) in self.sessions.drain() {
            session.outbox.close(None);
            if !session.principal.is_guest() {
                let store = self.store.clone();
                let room_key = self.room_key.clone();
                let principal_id = session.principal.id().to_string();
                tokio::spawn(async move {
                    let _ = store.mark_online(&room_key, &principal_id, false).await;
                });
            }
        }

        self.registry.release(&self.room_key, self.actor_id);
        info!("room {}: actor {} terminated", self.room_key, self.actor_id);
    }

    // ---- store bookkeeping workers ----

    fn spawn_membership_upsert(&self, principal: &Principal, role: Role) {
        let store = self.store.clone();
        let room_key = self.room_key.clone();
        let member = crate::store::MemberRecord {
            room_key: room_key.clone(),
            principal_id: principal.id().to_string(),
            display_name: principal.display_name().to_string(),
            role,
            joined_at: Utc::now(),
            last_seen: Utc::now(),
            online: true,
            banned: false,
        };
        tokio::spawn(async move {
            if let Err(e) = store.upsert_member(member).await {
                warn!("room {}: member upsert failed: {}", room_key, e);
            }
        });
    }

    fn spawn_mark_online(&self, principal_id: String, online: bool) {
        let store = self.store.clone();
        let room_key = self.room_key.clone();
        tokio::spawn(async move {
            if let Err(e) = store.mark_online(&room_key, &principal_id, online).await {
                warn!("room {}: online bookkeeping failed: {}", room_key, e);
            }
        });
    }
}
