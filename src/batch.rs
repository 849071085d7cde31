//! Batch planning for large id lists.
//!
//! Splits the member ids of a sequence into capped batches. When a reference
//! image is given, the batch around it is fetched first so the image the
//! viewer is looking at, and its neighbours, land before the rest.
//!
//! ## Priority window
//!
//! For a list of `n > 50` ids with the reference at position `p`, the
//! priority batch is the 50 ids starting at `clamp(p - 25, 0, n - 50)`. The
//! reference therefore sits at offset 25 unless it is within 25 of either
//! end, in which case the window is the first or last 50 ids.

use crate::types::ImageId;

/// Default maximum number of ids per batch.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Size of the batch fetched first around a reference id.
pub const PRIORITY_WINDOW: usize = 50;

/// Splits id lists into ordered batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    max_batch_size: usize,
}

impl BatchPlanner {
    /// Create a planner emitting batches of at most `max_batch_size` ids.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Maximum ids per batch.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Plan the batches for `ids`.
    ///
    /// Every id appears in exactly one batch. Without a reference, or with a
    /// reference that is not in `ids`, batches are consecutive chunks in
    /// original order. With a reference, the priority window comes first and
    /// the remaining ids follow in their original relative order.
    pub fn plan(&self, ids: &[ImageId], reference: Option<&ImageId>) -> Vec<Vec<ImageId>> {
        if ids.is_empty() {
            return Vec::new();
        }

        let position = reference.and_then(|r| ids.iter().position(|id| id == r));
        let Some(position) = position else {
            return self.chunk(ids.iter());
        };

        if ids.len() <= PRIORITY_WINDOW {
            return vec![ids.to_vec()];
        }

        let start = position
            .saturating_sub(PRIORITY_WINDOW / 2)
            .min(ids.len() - PRIORITY_WINDOW);
        let end = start + PRIORITY_WINDOW;

        let mut batches = vec![ids[start..end].to_vec()];
        batches.extend(self.chunk(ids[..start].iter().chain(&ids[end..])));
        batches
    }

    fn chunk<'a>(&self, ids: impl Iterator<Item = &'a ImageId>) -> Vec<Vec<ImageId>> {
        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(self.max_batch_size);
        for id in ids {
            current.push(id.clone());
            if current.len() == self.max_batch_size {
                batches.push(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(self.max_batch_size),
                ));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}
