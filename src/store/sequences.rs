//! Sequence store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::access::AccessIndex;
use crate::types::{ImageId, Sequence, SequenceId};

/// Owns sequences and tracks which have had their images fetched.
pub struct SequenceStore {
    sequences: HashMap<SequenceId, Arc<Sequence>>,
    access: AccessIndex<SequenceId>,
    images_cached: HashSet<SequenceId>,
}

impl SequenceStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            sequences: HashMap::new(),
            access: AccessIndex::new(),
            images_cached: HashSet::new(),
        }
    }

    /// Insert a sequence. An existing sequence with the same id is kept and
    /// returned.
    pub fn insert(&mut self, sequence: Sequence) -> Arc<Sequence> {
        let id = sequence.id.clone();
        let stored = Arc::clone(
            self.sequences
                .entry(id.clone())
                .or_insert_with(|| Arc::new(sequence)),
        );
        self.access.touch(id);
        stored
    }

    /// Get a sequence without recording an access.
    pub fn get(&self, id: &SequenceId) -> Option<&Arc<Sequence>> {
        self.sequences.get(id)
    }

    /// Member ids in capture order.
    pub fn members(&self, id: &SequenceId) -> Option<&[ImageId]> {
        self.sequences.get(id).map(|s| s.image_ids.as_slice())
    }

    /// Get a sequence and record an access.
    pub fn touch(&mut self, id: &SequenceId) -> Option<Arc<Sequence>> {
        let sequence = self.sequences.get(id).cloned()?;
        self.access.touch(id.clone());
        Some(sequence)
    }

    /// Remove a sequence along with its images-cached flag.
    pub fn remove(&mut self, id: &SequenceId) -> Option<Arc<Sequence>> {
        self.access.remove(id);
        self.images_cached.remove(id);
        self.sequences.remove(id)
    }

    /// Whether the sequence is present.
    pub fn contains(&self, id: &SequenceId) -> bool {
        self.sequences.contains_key(id)
    }

    /// Flag that every member of the sequence has a complete node.
    pub fn mark_images_cached(&mut self, id: &SequenceId) {
        if self.sequences.contains_key(id) {
            self.images_cached.insert(id.clone());
        }
    }

    /// Whether the sequence's images have been fetched.
    pub fn has_images_cached(&self, id: &SequenceId) -> bool {
        self.images_cached.contains(id)
    }

    /// Clear the images-cached flag of one sequence.
    pub fn unmark_images_cached(&mut self, id: &SequenceId) {
        self.images_cached.remove(id);
    }

    /// Remove every sequence.
    pub fn clear(&mut self) {
        self.sequences.clear();
        self.access.clear();
        self.images_cached.clear();
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Last access time of a sequence.
    pub fn last_access(&self, id: &SequenceId) -> Option<DateTime<Utc>> {
        self.access.last_access(id)
    }

    /// Sequence ids, least recently used first.
    pub fn oldest_first(&self) -> Vec<SequenceId> {
        self.access.oldest_first()
    }
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sequence(id: &str, members: &[&str]) -> Sequence {
        Sequence::new(
            SequenceId::from(id),
            members.iter().map(|m| ImageId::from(*m)).collect(),
        )
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut store = SequenceStore::new();
        store.insert(make_sequence("s", &["a", "b"]));
        let stored = store.insert(make_sequence("s", &["x"]));

        assert_eq!(stored.image_ids, vec![ImageId::from("a"), ImageId::from("b")]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_images_cached_flag_follows_sequence() {
        let mut store = SequenceStore::new();
        let id = SequenceId::from("s");

        store.mark_images_cached(&id);
        assert!(!store.has_images_cached(&id));

        store.insert(make_sequence("s", &["a"]));
        store.mark_images_cached(&id);
        assert!(store.has_images_cached(&id));

        store.remove(&id);
        assert!(!store.has_images_cached(&id));
        assert!(store.members(&id).is_none());
    }

    #[test]
    fn test_oldest_first() {
        let mut store = SequenceStore::new();
        store.insert(make_sequence("s1", &[]));
        store.insert(make_sequence("s2", &[]));
        store.touch(&SequenceId::from("s1"));

        assert_eq!(
            store.oldest_first(),
            vec![SequenceId::from("s2"), SequenceId::from("s1")]
        );
    }
}
