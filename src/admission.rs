//! Admission & Membership
//!
//! Resolves a join request to an identity, verifies room passwords, and
//! authorizes actions against the room's role model. Everything here is
//! synchronous relative to its caller and never mutates room-actor state.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::error::{Error as HubError, Result as HubResult};
use crate::principal::Principal;
use crate::store::{MemberRecord, RoomRecord};

/// Room role with fixed permission sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

/// Mutating operations gated by role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Edit,
    ChangeLanguage,
    Invite,
    ChangeSettings,
    DeleteRoom,
}

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub exp: u64,
    pub iat: u64,
}

/// Outcome of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Admitted(Role),
    PasswordRequired,
    PasswordInvalid,
    RoomFull,
    Banned,
}

/// A bearer token was present but did not verify.
#[derive(Debug, Error)]
#[error("invalid credential: {0}")]
pub struct InvalidCredential(pub String);

/// Admission service
pub struct AdmissionService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AdmissionService {
    pub fn new(signing_key: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Resolve credentials to a principal. An absent token is not an error:
    /// it produces a guest. A present token must verify.
    pub fn resolve(
        &self,
        token: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Principal, InvalidCredential> {
        match token {
            None => Ok(Principal::guest(display_name)),
            Some(token) => {
                let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
                    .map_err(|e| InvalidCredential(e.to_string()))?;
                Ok(Principal::User {
                    id: data.claims.sub,
                    name: data.claims.name,
                })
            }
        }
    }

    /// Issue a bearer token for an authenticated user. Consumed by the
    /// control plane's login flow and by tests.
    pub fn issue_token(&self, user_id: &str, name: &str, ttl_secs: u64) -> HubResult<String> {
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: user_id.to_string(),
            name: name.to_string(),
            exp: now + ttl_secs,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| HubError::Unexpected(format!("token encoding failed: {}", e)))
    }

    /// Decide whether `principal` may join `room`.
    ///
    /// The capacity check here is advisory (persisted online members); the
    /// authoritative check runs inside the room actor where concurrent
    /// joins are serialized.
    pub fn authorize_join(
        &self,
        room: &RoomRecord,
        principal: &Principal,
        password: Option<&str>,
        member: Option<&MemberRecord>,
        online_count: u32,
    ) -> JoinDecision {
        if member.map_or(false, |m| m.banned) {
            return JoinDecision::Banned;
        }
        if let Some(hash) = &room.password_hash {
            match password {
                None => return JoinDecision::PasswordRequired,
                Some(password) if !verify_password(password, hash) => {
                    return JoinDecision::PasswordInvalid
                }
                Some(_) => {}
            }
        }
        let already_online = member.map_or(false, |m| m.online);
        if !already_online && online_count >= room.capacity {
            return JoinDecision::RoomFull;
        }
        JoinDecision::Admitted(self.role_for(room, principal, member))
    }

    /// Role of `principal` in `room`: ownership wins, then the persisted
    /// member row, then the editor default for first-time joiners.
    pub fn role_for(
        &self,
        room: &RoomRecord,
        principal: &Principal,
        member: Option<&MemberRecord>,
    ) -> Role {
        if room.owner_ref == principal.owner_ref() {
            return Role::Owner;
        }
        member.map_or(Role::Editor, |m| m.role)
    }

    /// Permission check for mutating operations.
    pub fn authorize_action(&self, role: Role, action: Action) -> bool {
        match action {
            Action::Edit | Action::ChangeLanguage | Action::Invite => {
                matches!(role, Role::Owner | Role::Editor)
            }
            Action::ChangeSettings | Action::DeleteRoom => role == Role::Owner,
        }
    }
}

/// Hash a room password with a fresh salt.
pub fn hash_password(password: &str) -> HubResult<String> {
    if password.is_empty() {
        return Err(HubError::Config("password must not be empty".to_string()));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| HubError::Unexpected(format!("password hashing failed: {}", e)))
}

/// Constant-time password verification against a stored argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
