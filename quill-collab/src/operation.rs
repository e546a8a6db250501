//! Operation model: one client action against one document.
//!
//! Wire format (JSON text frame):
//! ```text
//! {
//!   "type":        "insert" | "delete" | "cursor",
//!   "docId":       string        (overwritten by the server),
//!   "position":    integer       (character offset, may be out of range),
//!   "value":       string        (insert text / delete length),
//!   "operationId": uuid,
//!   "source":      string        (overwritten by the server),
//!   "timestamp":   u64 ns        (overwritten by the session clock),
//!   "cursorPos":   integer       (cursor only),
//!   "userColor":   string        (cursor only)
//! }
//! ```
//!
//! Positions are plain character offsets into the current text, not stable
//! identifiers. Two concurrent edits can shift each other's offsets; the
//! single session apply path is the only ordering authority.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::CollabError;

/// Maximum accepted length of a document identifier, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 256;

/// Identifier of a collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap a string without validation.
    ///
    /// The boundary uses [`str::parse`] instead, which rejects ids that
    /// cannot be stored.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for DocumentId {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CollabError::InvalidDocumentId("empty".into()));
        }
        if s.len() > MAX_DOCUMENT_ID_LEN {
            return Err(CollabError::InvalidDocumentId(format!(
                "{} bytes exceeds limit of {MAX_DOCUMENT_ID_LEN}",
                s.len()
            )));
        }
        if s.chars().any(char::is_control) {
            return Err(CollabError::InvalidDocumentId("contains control characters".into()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of client action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Splice `value` into the text at `position`
    Insert,
    /// Remove `value.chars().count()` characters starting at `position`
    Delete,
    /// Presence update; no effect on text
    Cursor,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Delete => "delete",
            OperationKind::Cursor => "cursor",
        }
    }
}

/// One client action against a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(rename = "docId", default)]
    pub document_id: DocumentId,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub value: String,
    #[serde(default = "Uuid::nil")]
    pub operation_id: Uuid,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(rename = "cursorPos", default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_color: Option<String>,
}

impl Operation {
    fn new(
        kind: OperationKind,
        document_id: DocumentId,
        position: i64,
        value: String,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            document_id,
            position,
            value,
            operation_id: Uuid::new_v4(),
            source: source.into(),
            timestamp: now_nanos(),
            cursor_position: None,
            user_color: None,
        }
    }

    /// Insert `text` at `position`.
    pub fn insert(
        document_id: DocumentId,
        position: i64,
        text: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(OperationKind::Insert, document_id, position, text.into(), source)
    }

    /// Delete `count` characters starting at `position`.
    ///
    /// Only the character length of `value` is meaningful for deletes, so the
    /// value is filled with placeholder characters.
    pub fn delete(
        document_id: DocumentId,
        position: i64,
        count: usize,
        source: impl Into<String>,
    ) -> Self {
        Self::new(OperationKind::Delete, document_id, position, "x".repeat(count), source)
    }

    /// Cursor/presence update.
    pub fn cursor(
        document_id: DocumentId,
        cursor_position: i64,
        user_color: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Cursor, document_id, 0, String::new(), source);
        op.cursor_position = Some(cursor_position);
        op.user_color = Some(user_color.into());
        op
    }

    /// Number of characters a delete removes (before clamping).
    pub fn delete_len(&self) -> usize {
        self.value.chars().count()
    }

    pub fn is_cursor(&self) -> bool {
        self.kind == OperationKind::Cursor
    }
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
