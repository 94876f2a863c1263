//! Collaborative text buffers.
//!
//! Text cards only carry a [`TextId`]; the characters live in a single yrs
//! document shared by every text card in the room. Each buffer is a root
//! `Text` named by its id, so concurrent inserts merge character by character
//! instead of overwriting each other.
//!
//! ```text
//! local edit ──▶ SharedText::edit ──▶ update bytes ──▶ peers
//! peer bytes ──▶ SharedText::apply_update ──▶ changed? ──▶ relay / redraw
//! ```
//!
//! Offsets are UTF-8 byte offsets.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Update};

use crate::TextId;

#[derive(Debug, Error)]
pub enum TextError {
    #[error("invalid text update: {0}")]
    InvalidUpdate(String),
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("edit out of bounds: {index}+{len} exceeds length {length}")]
    OutOfBounds { index: u32, len: u32, length: u32 },
}

/// A single text edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert { index: u32, chunk: String },
    Delete { index: u32, len: u32 },
}

/// All shared text in a room.
pub struct SharedText {
    doc: Doc,
}

impl Default for SharedText {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedText {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Apply a local edit and return the update to broadcast.
    pub fn edit(&mut self, id: &TextId, edit: &TextEdit) -> Result<Vec<u8>, TextError> {
        let text = self.doc.get_or_insert_text(id.as_str());
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        let length = text.len(&txn);

        match edit {
            TextEdit::Insert { index, chunk } => {
                if *index > length {
                    return Err(TextError::OutOfBounds {
                        index: *index,
                        len: 0,
                        length,
                    });
                }
                text.insert(&mut txn, *index, chunk);
            }
            TextEdit::Delete { index, len } => {
                if index.saturating_add(*len) > length {
                    return Err(TextError::OutOfBounds {
                        index: *index,
                        len: *len,
                        length,
                    });
                }
                text.remove_range(&mut txn, *index, *len);
            }
        }

        Ok(txn.encode_update_v1())
    }

    /// Current content of one buffer; empty if it was never written.
    pub fn content(&self, id: &TextId) -> String {
        let text = self.doc.get_or_insert_text(id.as_str());
        let txn = yrs::Transact::transact(&self.doc);
        text.get_string(&txn)
    }

    /// Merge a remote update. Returns `true` when it added anything new.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<bool, TextError> {
        if bytes.is_empty() {
            return Ok(false);
        }
        let update =
            Update::decode_v1(bytes).map_err(|e| TextError::InvalidUpdate(e.to_string()))?;

        let before = self.state();
        {
            let mut txn = yrs::Transact::transact_mut(&self.doc);
            txn.apply_update(update)
                .map_err(|e| TextError::InvalidUpdate(format!("{e:?}")))?;
        }
        Ok(self.state() != before)
    }

    /// Encoded state vector, sent in the first sync step.
    pub fn state_vector(&self) -> Vec<u8> {
        self.state().encode_v1()
    }

    /// Everything we have that the remote state vector lacks.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, TextError> {
        let sv = if remote_state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(remote_state_vector)
                .map_err(|e| TextError::InvalidStateVector(e.to_string()))?
        };
        let txn = yrs::Transact::transact(&self.doc);
        Ok(txn.encode_diff_v1(&sv))
    }

    fn state(&self) -> StateVector {
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector()
    }
}
