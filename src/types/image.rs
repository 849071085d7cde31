//! Image records and the cached image node.
//!
//! An image becomes known to the graph in one of two ways:
//!
//! 1. As a [`CoreImage`] discovered while fetching a spatial cell (id, position
//!    and owning sequence only).
//! 2. As a full [`ImageRecord`] fetched directly by id.
//!
//! A core-only node is later *filled* with a [`SpatialImage`]. A node is
//! complete exactly when it holds both halves, so completeness is derived
//! from the data rather than tracked as a separate flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::edge::{EdgeStatus, NavigationEdge};
use super::{ImageId, SequenceId};

/// Geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    /// Longitude in degrees.
    pub lng: f64,
    /// Latitude in degrees.
    pub lat: f64,
}

impl LngLat {
    /// Create a new position.
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// Whether this position lies inside the box spanned by `sw` and `ne`
    /// (inclusive on every edge).
    pub fn within(&self, sw: &LngLat, ne: &LngLat) -> bool {
        self.lng >= sw.lng && self.lng <= ne.lng && self.lat >= sw.lat && self.lat <= ne.lat
    }
}

/// Projection model of the camera that captured an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraType {
    /// Regular perspective camera.
    #[default]
    Perspective,
    /// Fisheye lens.
    Fisheye,
    /// Full 360° spherical capture.
    Spherical,
}

/// Minimal per-image data discovered through a cell fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreImage {
    /// Image id.
    pub id: ImageId,
    /// Raw capture position.
    pub position: LngLat,
    /// Owning sequence.
    pub sequence_id: SequenceId,
}

/// Spatial and visual fields that complete a core record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialImage {
    /// Position after reconstruction, when available.
    pub computed_position: Option<LngLat>,
    /// Altitude above sea level in meters.
    #[serde(default)]
    pub altitude: f64,
    /// Camera heading in degrees.
    #[serde(default)]
    pub compass_angle: f64,
    /// Heading after reconstruction, when available.
    #[serde(default)]
    pub computed_compass_angle: Option<f64>,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
    /// Reconstruction cluster the image belongs to.
    pub cluster_id: Option<String>,
    /// Merge group shared by images reconstructed together.
    pub merge_id: Option<String>,
    /// Camera model.
    #[serde(default)]
    pub camera_type: CameraType,
    /// Image width in pixels.
    #[serde(default)]
    pub width: u32,
    /// Image height in pixels.
    #[serde(default)]
    pub height: u32,
}

/// A complete record returned by a by-id fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Core fields.
    pub core: CoreImage,
    /// Fill fields.
    pub spatial: SpatialImage,
}

impl ImageRecord {
    /// Image id of this record.
    pub fn id(&self) -> &ImageId {
        &self.core.id
    }
}

/// An image as held by the graph.
///
/// Nodes are shared as `Arc<ImageNode>` snapshots; the graph mutates its own
/// copy through `Arc::make_mut`, so a caller never observes a half-applied
/// fetch response.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageNode {
    core: CoreImage,
    spatial: Option<SpatialImage>,
    cache_initialized: bool,
    sequence_edges: EdgeStatus,
    spatial_edges: EdgeStatus,
}

impl ImageNode {
    /// Create a core-only node.
    pub fn from_core(core: CoreImage) -> Self {
        Self {
            core,
            spatial: None,
            cache_initialized: false,
            sequence_edges: EdgeStatus::default(),
            spatial_edges: EdgeStatus::default(),
        }
    }

    /// Create a complete node from a full record.
    pub fn from_record(record: ImageRecord) -> Self {
        let mut node = Self::from_core(record.core);
        node.spatial = Some(record.spatial);
        node
    }

    /// Image id.
    pub fn id(&self) -> &ImageId {
        &self.core.id
    }

    /// Raw capture position.
    pub fn position(&self) -> LngLat {
        self.core.position
    }

    /// Reconstructed position, falling back to the raw position.
    pub fn computed_position(&self) -> LngLat {
        self.spatial
            .as_ref()
            .and_then(|s| s.computed_position)
            .unwrap_or(self.core.position)
    }

    /// Owning sequence id.
    pub fn sequence_id(&self) -> &SequenceId {
        &self.core.sequence_id
    }

    /// Owning cluster id, known once filled.
    pub fn cluster_id(&self) -> Option<&str> {
        self.spatial.as_ref().and_then(|s| s.cluster_id.as_deref())
    }

    /// Merge group id, known once filled.
    pub fn merge_id(&self) -> Option<&str> {
        self.spatial.as_ref().and_then(|s| s.merge_id.as_deref())
    }

    /// Core fields.
    pub fn core(&self) -> &CoreImage {
        &self.core
    }

    /// Fill fields, if the node is complete.
    pub fn spatial(&self) -> Option<&SpatialImage> {
        self.spatial.as_ref()
    }

    /// Whether both core and fill fields are present.
    pub fn is_complete(&self) -> bool {
        self.spatial.is_some()
    }

    /// Whether the node has been promoted into active use.
    pub fn is_cache_initialized(&self) -> bool {
        self.cache_initialized
    }

    /// Sequence (next/prev) edges.
    pub fn sequence_edges(&self) -> &EdgeStatus {
        &self.sequence_edges
    }

    /// Spatial edges.
    pub fn spatial_edges(&self) -> &EdgeStatus {
        &self.spatial_edges
    }

    pub(crate) fn fill(&mut self, spatial: SpatialImage) {
        self.spatial = Some(spatial);
    }

    pub(crate) fn initialize_cache(&mut self) {
        self.cache_initialized = true;
    }

    pub(crate) fn cache_sequence_edges(&mut self, edges: Vec<NavigationEdge>) {
        self.sequence_edges = EdgeStatus::cached(edges);
    }

    pub(crate) fn cache_spatial_edges(&mut self, edges: Vec<NavigationEdge>) {
        self.spatial_edges = EdgeStatus::cached(edges);
    }

    pub(crate) fn reset_sequence_edges(&mut self) {
        self.sequence_edges = EdgeStatus::default();
    }

    pub(crate) fn reset_spatial_edges(&mut self) {
        self.spatial_edges = EdgeStatus::default();
    }

    /// Drop derived state and leave active use. The record itself survives.
    pub(crate) fn uncache(&mut self) {
        self.reset_sequence_edges();
        self.reset_spatial_edges();
        self.cache_initialized = false;
    }
}
