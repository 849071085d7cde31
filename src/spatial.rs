//! Spatial collaborators: cell indexing and geodesy.
//!
//! The graph only needs two things from the outside world here: a way to map
//! positions and boxes onto cell ids ([`CellIndex`]) and a way to grow a
//! point into a box of a given radius ([`Geodesy`]). Both are consumed through
//! traits; [`GridCellIndex`] and [`EquirectangularGeodesy`] are small
//! implementations good enough for local data sets and tests.

use crate::types::{CellId, LngLat};

/// Meters per degree of latitude on a spherical earth.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Error type for cell index operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CellIndexError {
    /// The north-east corner is not strictly north-east of the south-west corner.
    #[error("north-east corner ({ne_lng}, {ne_lat}) is not north-east of south-west corner ({sw_lng}, {sw_lat})")]
    InvalidBoundingBox {
        /// South-west longitude.
        sw_lng: f64,
        /// South-west latitude.
        sw_lat: f64,
        /// North-east longitude.
        ne_lng: f64,
        /// North-east latitude.
        ne_lat: f64,
    },
}

impl CellIndexError {
    /// Build the error for a degenerate box.
    pub fn invalid_box(sw: &LngLat, ne: &LngLat) -> Self {
        Self::InvalidBoundingBox {
            sw_lng: sw.lng,
            sw_lat: sw.lat,
            ne_lng: ne.lng,
            ne_lat: ne.lat,
        }
    }
}

/// Maps points and boxes onto spatial cells.
pub trait CellIndex: Send + Sync {
    /// Cell containing `point`.
    fn point_to_cell_id(&self, point: &LngLat) -> CellId;

    /// Minimal set of cells covering the box.
    fn bbox_to_cell_ids(&self, sw: &LngLat, ne: &LngLat) -> Result<Vec<CellId>, CellIndexError>;
}

/// Converts between geographic and local coordinates.
pub trait Geodesy: Send + Sync {
    /// South-west and north-east corners of the box extending `threshold_meters`
    /// from `center` in every direction.
    fn bounding_box_corners(&self, center: &LngLat, threshold_meters: f64) -> (LngLat, LngLat);
}

/// Regular latitude/longitude grid.
///
/// Cell ids are `"{row}:{col}"` where `row = floor(lat / size)` and
/// `col = floor(lng / size)`.
#[derive(Debug, Clone)]
pub struct GridCellIndex {
    cell_size_degrees: f64,
}

impl GridCellIndex {
    /// Create a grid with square cells of the given size in degrees.
    pub fn new(cell_size_degrees: f64) -> Self {
        Self { cell_size_degrees }
    }

    fn row(&self, lat: f64) -> i64 {
        (lat / self.cell_size_degrees).floor() as i64
    }

    fn col(&self, lng: f64) -> i64 {
        (lng / self.cell_size_degrees).floor() as i64
    }

    fn cell_id(row: i64, col: i64) -> CellId {
        CellId::new(format!("{row}:{col}"))
    }
}

impl Default for GridCellIndex {
    fn default() -> Self {
        // Roughly 1 km at mid latitudes
        Self::new(0.01)
    }
}

impl CellIndex for GridCellIndex {
    fn point_to_cell_id(&self, point: &LngLat) -> CellId {
        Self::cell_id(self.row(point.lat), self.col(point.lng))
    }

    fn bbox_to_cell_ids(&self, sw: &LngLat, ne: &LngLat) -> Result<Vec<CellId>, CellIndexError> {
        if !(ne.lng > sw.lng && ne.lat > sw.lat) {
            return Err(CellIndexError::invalid_box(sw, ne));
        }

        let mut cells = Vec::new();
        for row in self.row(sw.lat)..=self.row(ne.lat) {
            for col in self.col(sw.lng)..=self.col(ne.lng) {
                cells.push(Self::cell_id(row, col));
            }
        }
        Ok(cells)
    }
}

/// Flat-earth approximation around the box center.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquirectangularGeodesy;

impl Geodesy for EquirectangularGeodesy {
    fn bounding_box_corners(&self, center: &LngLat, threshold_meters: f64) -> (LngLat, LngLat) {
        let dlat = threshold_meters / METERS_PER_DEGREE;
        let cos_lat = center.lat.to_radians().cos().max(1e-6);
        let dlng = threshold_meters / (METERS_PER_DEGREE * cos_lat);

        (
            LngLat::new(center.lng - dlng, center.lat - dlat),
            LngLat::new(center.lng + dlng, center.lat + dlat),
        )
    }
}
