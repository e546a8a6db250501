//! In-memory authoritative text for one document.
//!
//! The text is a `Vec<char>` so that positions are character offsets.
//! Deletion physically removes characters; there are no tombstones.
//!
//! Concurrency: one writer or many readers via `std::sync::RwLock`. Readers
//! observe the text either before or after a mutation, never in between.
//! Concurrent *mutators* are not ordered here; the owning session serializes
//! them.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::operation::{DocumentId, Operation, OperationKind};

/// Source tag used for the bulk insert that seeds a replica from a snapshot.
pub const SNAPSHOT_SOURCE: &str = "snapshot";

/// Mutable character buffer with clamping apply semantics.
#[derive(Debug, Default)]
pub struct Replica {
    text: RwLock<Vec<char>>,
}

impl Replica {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a replica with `content` via a single insert at position 0.
    pub fn from_text(document_id: DocumentId, content: &str) -> Self {
        let replica = Self::new();
        if !content.is_empty() {
            let seed = Operation::insert(document_id, 0, content, SNAPSHOT_SOURCE);
            replica.apply(&seed);
        }
        replica
    }

    /// Apply one operation in place. Never fails.
    ///
    /// - Insert: position clamped into `[0, len]`.
    /// - Delete: ignored unless position is in `[0, len)`; count truncated to
    ///   the remaining characters.
    /// - Cursor: no effect.
    pub fn apply(&self, op: &Operation) {
        match op.kind {
            OperationKind::Insert => {
                if op.value.is_empty() {
                    return;
                }
                let mut text = self.write();
                let at = op.position.clamp(0, text.len() as i64) as usize;
                text.splice(at..at, op.value.chars());
            }
            OperationKind::Delete => {
                let mut text = self.write();
                let len = text.len() as i64;
                if op.position < 0 || op.position >= len {
                    return;
                }
                let start = op.position as usize;
                let count = op.delete_len().min(text.len() - start);
                text.drain(start..start + count);
            }
            OperationKind::Cursor => {}
        }
    }

    /// Current full text.
    pub fn read(&self) -> String {
        self.read_guard().iter().collect()
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave the Vec in an invalid
    // state, so poisoning is ignored.
    fn read_guard(&self) -> RwLockReadGuard<'_, Vec<char>> {
        self.text.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<char>> {
        self.text.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn doc() -> DocumentId {
        DocumentId::new("replica-test")
    }

    fn insert(pos: i64, text: &str) -> Operation {
        Operation::insert(doc(), pos, text, "t")
    }

    fn delete(pos: i64, count: usize) -> Operation {
        Operation::delete(doc(), pos, count, "t")
    }

    #[test]
    fn test_insert_into_empty() {
        let r = Replica::new();
        r.apply(&insert(0, "hello"));
        assert_eq!(r.read(), "hello");
    }

    #[test]
    fn test_append_at_end() {
        let r = Replica::from_text(doc(), "hello");
        r.apply(&insert(5, " world"));
        assert_eq!(r.read(), "hello world");
    }

    #[test]
    fn test_delete_uses_value_length() {
        let r = Replica::from_text(doc(), "hello world");
        let mut op = delete(5, 0);
        op.value = "xxxxxx".into();
        r.apply(&op);
        assert_eq!(r.read(), "hello");
    }

    #[test]
    fn test_delete_out_of_range_ignored() {
        let r = Replica::from_text(doc(), "hi");
        r.apply(&delete(5, 1));
        assert_eq!(r.read(), "hi");
        r.apply(&delete(2, 1));
        assert_eq!(r.read(), "hi");
        r.apply(&delete(-1, 1));
        assert_eq!(r.read(), "hi");
    }

    #[test]
    fn test_overlong_delete_truncates() {
        let r = Replica::from_text(doc(), "abcdef");
        r.apply(&delete(4, 100));
        assert_eq!(r.read(), "abcd");
    }

    #[test]
    fn test_insert_position_clamped() {
        let r = Replica::from_text(doc(), "mid");
        r.apply(&insert(-10, "<"));
        r.apply(&insert(1000, ">"));
        assert_eq!(r.read(), "<mid>");
    }

    #[test]
    fn test_delete_on_empty_is_noop() {
        let r = Replica::new();
        r.apply(&delete(0, 3));
        assert!(r.is_empty());
    }

    #[test]
    fn test_cursor_does_not_touch_text() {
        let r = Replica::from_text(doc(), "abc");
        r.apply(&Operation::cursor(doc(), 1, "#000000", "t"));
        assert_eq!(r.read(), "abc");
    }

    #[test]
    fn test_positions_are_characters() {
        let r = Replica::from_text(doc(), "añb");
        assert_eq!(r.len(), 3);
        r.apply(&insert(2, "ü"));
        assert_eq!(r.read(), "añüb");
        r.apply(&delete(1, 2));
        assert_eq!(r.read(), "ab");
    }

    #[test]
    fn test_matches_string_model() {
        // Deterministic pseudo-random sequence of in-range edits checked
        // against a plain String model.
        let r = Replica::new();
        let mut model: Vec<char> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for i in 0..500 {
            let roll = next();
            if model.is_empty() || roll % 3 != 0 {
                let pos = (next() % (model.len() as u64 + 1)) as usize;
                let text = format!("{}", i % 10).repeat((roll % 4 + 1) as usize);
                r.apply(&insert(pos as i64, &text));
                model.splice(pos..pos, text.chars());
            } else {
                let pos = (next() % model.len() as u64) as usize;
                let count = ((next() % 5) as usize).min(model.len() - pos);
                r.apply(&delete(pos as i64, count));
                model.drain(pos..pos + count);
            }
            assert_eq!(r.len(), model.len());
        }

        assert_eq!(r.read(), model.iter().collect::<String>());
    }

    #[test]
    fn test_concurrent_readers_see_whole_inserts() {
        let r = Arc::new(Replica::new());
        let writer = {
            let r = r.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    r.apply(&insert(0, "abcd"));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        // Every insert is 4 chars; a torn read would break this.
                        assert_eq!(r.len() % 4, 0);
                        assert_eq!(r.read().chars().count() % 4, 0);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for h in readers {
            h.join().unwrap();
        }
        assert_eq!(r.len(), 800);
    }
}
