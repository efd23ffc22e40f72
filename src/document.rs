//! Room Document
//!
//! CRDT document state for one room, backed by yrs. Updates are opaque
//! byte strings; merging is commutative, so peers converge regardless of
//! delivery order. The room's code buffer lives in the `"code"` root text.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::{Error, Result};

/// Root text field holding the room's code buffer.
pub const TEXT_FIELD: &str = "code";

pub struct RoomDocument {
    doc: Doc,
    text: TextRef,
}

impl RoomDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_FIELD);
        Self { doc, text }
    }

    /// Restore a document from a previously encoded state blob.
    pub fn from_state(blob: &[u8]) -> Result<Self> {
        let document = Self::new();
        document.apply_update(blob)?;
        Ok(document)
    }

    /// Merge a remote update into the document.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update)
            .map_err(|e| Error::Document(format!("failed to decode update: {:?}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update);
        Ok(())
    }

    /// Encode the full document state as a single update blob.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Plain-text projection of the code buffer for fallback consumers.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed the code buffer from plain text. Used when a room row carries a
    /// fallback text but no blob (or a blob that no longer decodes).
    pub fn seed_text(&self, content: &str) {
        if content.is_empty() {
            return;
        }
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, 0, content);
    }
}

impl Default for RoomDocument {
    fn default() -> Self {
        Self::new()
    }
}
