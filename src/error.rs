//! Error taxonomy for graph operations.

use std::fmt;

use crate::provider::ProviderError;
use crate::spatial::CellIndexError;
use crate::types::{CellId, ImageId, SequenceId};

/// Cached resource named by the `AlreadyCaching` / `AlreadyCached` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheResource {
    /// Images of a sequence fetched in batches.
    SequenceImages,
    /// The owning sequence of an image.
    ImageSequence,
    /// Per-image active-use cache.
    ImageCache,
    /// Next/prev edges of an image.
    SequenceEdges,
    /// Spatial edges of an image.
    SpatialEdges,
}

impl fmt::Display for CacheResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceImages => write!(f, "sequence images"),
            Self::ImageSequence => write!(f, "image sequence"),
            Self::ImageCache => write!(f, "image cache"),
            Self::SequenceEdges => write!(f, "sequence edges"),
            Self::SpatialEdges => write!(f, "spatial edges"),
        }
    }
}

/// Error type for graph operations.
///
/// `Clone` so that a single deduplicated fetch can hand the same failure to
/// every attached caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Image not present in the graph.
    #[error("Image not found: {0}")]
    ImageNotFound(ImageId),
    /// Sequence not present in the graph.
    #[error("Sequence not found: {0}")]
    SequenceNotFound(SequenceId),
    /// Cell not present in the graph.
    #[error("Cell not found: {0}")]
    CellNotFound(CellId),
    /// A full fetch was requested for an image the graph already holds.
    #[error("Image already exists: {0}")]
    AlreadyExists(ImageId),
    /// The image already holds both core and fill fields.
    #[error("Image already complete: {0}")]
    AlreadyComplete(ImageId),
    /// A full fetch for the image is in flight.
    #[error("Full fetch already in flight for image: {0}")]
    AlreadyFetchingFull(ImageId),
    /// The resource is currently being cached.
    #[error("Already caching {resource}: {id}")]
    AlreadyCaching {
        /// Resource kind.
        resource: CacheResource,
        /// Id of the image or sequence.
        id: String,
    },
    /// The resource has already been cached.
    #[error("Already cached {resource}: {id}")]
    AlreadyCached {
        /// Resource kind.
        resource: CacheResource,
        /// Id of the image or sequence.
        id: String,
    },
    /// The image's covering cells have not all been fetched.
    #[error("Tiles not cached for image: {0}")]
    TilesNotCached(ImageId),
    /// Nodes around the image are not all complete.
    #[error("Spatial area not cached for image: {0}")]
    SpatialAreaNotCached(ImageId),
    /// The image's owning sequence has not been fetched.
    #[error("Sequence not cached for image: {0}")]
    SequenceNotCached(ImageId),
    /// Degenerate bounding box rejected by the cell index.
    #[error("Invalid bounding box: {0}")]
    InvalidBoundingBox(String),
    /// The fetch was cancelled.
    #[error("Request aborted")]
    Aborted,
    /// Opaque failure from the data provider.
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),
    /// The provider answered without a record that was asked for.
    #[error("Provider response is missing image: {0}")]
    MissingFromResponse(ImageId),
}

impl GraphError {
    /// Whether this error reports a missing image, sequence or cell.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ImageNotFound(_) | Self::SequenceNotFound(_) | Self::CellNotFound(_)
        )
    }

    pub(crate) fn already_caching(resource: CacheResource, id: impl fmt::Display) -> Self {
        Self::AlreadyCaching {
            resource,
            id: id.to_string(),
        }
    }

    pub(crate) fn already_cached(resource: CacheResource, id: impl fmt::Display) -> Self {
        Self::AlreadyCached {
            resource,
            id: id.to_string(),
        }
    }
}

impl From<ProviderError> for GraphError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Aborted => Self::Aborted,
            ProviderError::Upstream(message) => Self::UpstreamFailure(message),
        }
    }
}

impl From<CellIndexError> for GraphError {
    fn from(e: CellIndexError) -> Self {
        match e {
            CellIndexError::InvalidBoundingBox { .. } => Self::InvalidBoundingBox(e.to_string()),
        }
    }
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
