//! Principals
//!
//! The acting identity of a session: an authenticated user or a guest
//! synthesized for the lifetime of the connection. A guest is never
//! promoted to a user in place.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Palette for deterministic per-principal colors
const USER_COLORS: [&str; 12] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4",
    "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9", "#F8B500", "#00CED1",
];

/// Session identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Principal {
    User { id: String, name: String },
    Guest { id: String, name: String },
}

impl Principal {
    /// Synthesize a guest principal for an unauthenticated connection.
    pub fn guest(display_name: Option<&str>) -> Self {
        let nonce: u16 = rand::thread_rng().gen();
        let id = format!("guest_{}_{:04x}", Utc::now().timestamp_millis(), nonce);
        let name = match display_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("Guest {:04x}", nonce),
        };
        Principal::Guest { id, name }
    }

    pub fn id(&self) -> &str {
        match self {
            Principal::User { id, .. } | Principal::Guest { id, .. } => id,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Principal::User { name, .. } | Principal::Guest { name, .. } => name,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Principal::Guest { .. })
    }

    /// Stable string form used for room ownership (`user:<id>` / `guest:<id>`).
    pub fn owner_ref(&self) -> String {
        match self {
            Principal::User { id, .. } => format!("user:{}", id),
            Principal::Guest { id, .. } => format!("guest:{}", id),
        }
    }

    /// Deterministic palette color derived from the principal id.
    pub fn color_token(&self) -> &'static str {
        let hash = self.id().bytes().fold(0u32, |acc, b| acc.wrapping_add(b as u32));
        USER_COLORS[hash as usize % USER_COLORS.len()]
    }
}
