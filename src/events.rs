//! Change notifications.
//!
//! The graph publishes one [`GraphEvent`] on a broadcast channel after every
//! state transition a presentation layer may want to react to. Receivers
//! that fall behind lose the oldest events, never block the graph.

use serde::{Deserialize, Serialize};

use crate::types::{CellId, ImageId, SequenceId};

/// A state transition of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// An image became complete through a full or fill fetch.
    ImageCached {
        /// Image id.
        image_id: ImageId,
    },
    /// A cell's membership was fetched.
    CellCached {
        /// Cell id.
        cell_id: CellId,
        /// Number of images the fetch added.
        added: usize,
    },
    /// A sequence's id list was fetched.
    SequenceCached {
        /// Sequence id.
        sequence_id: SequenceId,
    },
    /// One batch of a sequence's images landed.
    SequenceImagesBatch {
        /// Sequence id.
        sequence_id: SequenceId,
        /// Images in the batch.
        image_ids: Vec<ImageId>,
    },
    /// Every image of a sequence is complete.
    SequenceImagesCached {
        /// Sequence id.
        sequence_id: SequenceId,
    },
    /// Every image around an image is complete.
    SpatialAreaCached {
        /// Image id.
        image_id: ImageId,
    },
    /// Sequence edges were computed for an image.
    SequenceEdgesCached {
        /// Image id.
        image_id: ImageId,
    },
    /// Spatial edges were computed for an image.
    SpatialEdgesCached {
        /// Image id.
        image_id: ImageId,
    },
    /// Spatial edges of every image were invalidated.
    SpatialEdgesReset,
    /// The edge candidate filter changed.
    FilterChanged,
    /// An eviction pass ran.
    Uncached {
        /// Images removed from the graph.
        removed_images: usize,
        /// Cells removed from the graph.
        evicted_cells: usize,
        /// Sequences removed from the graph.
        evicted_sequences: usize,
    },
    /// The graph was reset.
    Reset {
        /// Images that survived.
        kept_images: usize,
    },
    /// Every pending fetch was aborted.
    Aborted {
        /// Requests that were in flight.
        requests: usize,
    },
}
