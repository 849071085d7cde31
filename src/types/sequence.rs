//! Ordered capture sequences.

use serde::{Deserialize, Serialize};

use super::{ImageId, SequenceId};

/// A capture sequence: the authoritative ordering of its member images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence id.
    pub id: SequenceId,
    /// Member image ids in capture order.
    pub image_ids: Vec<ImageId>,
}

impl Sequence {
    /// Create a new sequence.
    pub fn new(id: SequenceId, image_ids: Vec<ImageId>) -> Self {
        Self { id, image_ids }
    }

    /// Position of an image in the sequence.
    pub fn position_of(&self, id: &ImageId) -> Option<usize> {
        self.image_ids.iter().position(|member| member == id)
    }

    /// Image preceding `id`, if any.
    pub fn find_prev(&self, id: &ImageId) -> Option<&ImageId> {
        let index = self.position_of(id)?;
        index.checked_sub(1).and_then(|i| self.image_ids.get(i))
    }

    /// Image following `id`, if any.
    pub fn find_next(&self, id: &ImageId) -> Option<&ImageId> {
        let index = self.position_of(id)?;
        self.image_ids.get(index + 1)
    }

    /// Number of member images.
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    /// Whether the sequence has no members.
    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence() -> Sequence {
        Sequence::new(
            SequenceId::from("s"),
            vec![ImageId::from("a"), ImageId::from("b"), ImageId::from("c")],
        )
    }

    #[test]
    fn test_prev_and_next() {
        let s = sequence();
        assert_eq!(s.find_prev(&ImageId::from("a")), None);
        assert_eq!(s.find_next(&ImageId::from("a")), Some(&ImageId::from("b")));
        assert_eq!(s.find_prev(&ImageId::from("c")), Some(&ImageId::from("b")));
        assert_eq!(s.find_next(&ImageId::from("c")), None);
        assert_eq!(s.find_next(&ImageId::from("x")), None);
    }
}
