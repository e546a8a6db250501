//! Per-document presence: who is where in the text.
//!
//! Entries are keyed by user id and overwritten by every cursor operation
//! from that user. Nothing removes an entry; a user who leaves keeps their
//! last cursor until they return and move it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::operation::Operation;

/// Latest cursor state for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub user_color: String,
    pub cursor_pos: i64,
}

/// Presence map for one document.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the sender's entry from a cursor operation.
    ///
    /// Returns `false` (and changes nothing) for non-cursor operations.
    pub fn apply(&mut self, op: &Operation) -> bool {
        if !op.is_cursor() {
            return false;
        }
        let entry = PresenceEntry {
            user_id: op.source.clone(),
            user_color: op.user_color.clone().unwrap_or_default(),
            cursor_pos: op.cursor_position.unwrap_or(op.position),
        };
        self.entries.insert(op.source.clone(), entry);
        true
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owned copy of all entries, keyed by user id.
    pub fn to_map(&self) -> HashMap<String, PresenceEntry> {
        self.entries.clone()
    }
}

/// Stable `#rrggbb` color for a user who did not pick one.
///
/// The hue comes from an FNV-1a hash of the user id; saturation and
/// lightness are fixed for readable cursors on a light background.
pub fn color_for_user(user_id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.45);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
