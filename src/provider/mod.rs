//! Data provider backends.
//!
//! The graph never talks to the network itself. Every suspension point of a
//! graph operation is one of the four fetches below; everything else is a
//! synchronous state transition.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{CellId, CoreImage, ImageId, ImageRecord, Sequence, SequenceId, SpatialImage};

/// Error type for provider fetches.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The fetch observed its cancellation token.
    #[error("Fetch aborted")]
    Aborted,
    /// Any other failure, transport or service side.
    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Core records of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreImagesResponse {
    /// Cell the records belong to.
    pub cell_id: CellId,
    /// Core records of every image in the cell.
    pub images: Vec<CoreImage>,
}

/// Fill record for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialImageItem {
    /// Image id.
    pub id: ImageId,
    /// Fill fields.
    pub spatial: SpatialImage,
}

/// Trait for remote image data sources.
///
/// All fetches accept a cancellation token. Implementations should return
/// [`ProviderError::Aborted`] once it fires; the graph also races every fetch
/// against the token, so a provider that ignores it is still abortable.
#[async_trait]
pub trait DataProvider: Send + Sync + 'static {
    /// Fetch the core records of every image in a cell.
    async fn fetch_core_images(
        &self,
        cell_id: &CellId,
        cancel: &CancellationToken,
    ) -> Result<CoreImagesResponse, ProviderError>;

    /// Fetch fill records by id.
    async fn fetch_spatial_images(
        &self,
        ids: &[ImageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<SpatialImageItem>, ProviderError>;

    /// Fetch complete records by id.
    async fn fetch_full_images(
        &self,
        ids: &[ImageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<ImageRecord>, ProviderError>;

    /// Fetch the ordered member ids of a sequence.
    async fn fetch_sequence(
        &self,
        id: &SequenceId,
        cancel: &CancellationToken,
    ) -> Result<Sequence, ProviderError>;
}

pub use memory::{Dataset, FetchCounts, InMemoryDataProvider};
