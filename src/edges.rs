//! Edge computation.
//!
//! The graph decides *which* images are candidates for an image's edges;
//! an [`EdgeCalculator`] decides what the edges are. Computation happens in
//! two steps:
//!
//! 1. [`EdgeCalculator::potential_edges`] measures every candidate relative
//!    to the source image.
//! 2. [`EdgeCalculator::compute_spatial_edges`] assigns edge directions from
//!    those measurements.
//!
//! Sequence edges need no geometry and have a provided implementation.

use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_4, FRAC_PI_6, PI};
use std::sync::Arc;

use crate::types::{
    CameraType, EdgeDirection, ImageId, ImageNode, LngLat, NavigationEdge, PotentialEdge,
    Sequence,
};

/// Meters per degree of latitude on a spherical earth.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Predicate narrowing the candidates considered for spatial edges.
pub type ImageFilter = Arc<dyn Fn(&ImageNode) -> bool + Send + Sync>;

/// Computes navigation edges for an image.
pub trait EdgeCalculator: Send + Sync {
    /// Measure candidates relative to `node`.
    ///
    /// `fallback_ids` are images that should be considered even when they
    /// fall outside the calculator's usual reach, typically the previous and
    /// next image in the node's sequence.
    fn potential_edges(
        &self,
        node: &ImageNode,
        candidates: &[Arc<ImageNode>],
        fallback_ids: &[ImageId],
    ) -> Vec<PotentialEdge>;

    /// Assign spatial edges from measured candidates.
    fn compute_spatial_edges(
        &self,
        node: &ImageNode,
        potential: &[PotentialEdge],
    ) -> Vec<NavigationEdge>;

    /// Next/prev edges of `node` within `sequence`.
    fn compute_sequence_edges(&self, node: &ImageNode, sequence: &Sequence) -> Vec<NavigationEdge> {
        let mut edges = Vec::with_capacity(2);
        if let Some(next) = sequence.find_next(node.id()) {
            edges.push(NavigationEdge::new(
                node.id().clone(),
                next.clone(),
                EdgeDirection::Next,
            ));
        }
        if let Some(prev) = sequence.find_prev(node.id()) {
            edges.push(NavigationEdge::new(
                node.id().clone(),
                prev.clone(),
                EdgeDirection::Prev,
            ));
        }
        edges
    }
}

/// Edge calculator keeping the nearest candidate per direction.
#[derive(Debug, Clone)]
pub struct DistanceEdgeCalculator {
    /// Candidates farther than this are ignored unless named as fallback.
    pub max_distance_meters: f64,
    /// Candidates closer than this are turn candidates rather than steps.
    pub turn_distance_meters: f64,
}

impl Default for DistanceEdgeCalculator {
    fn default() -> Self {
        Self {
            max_distance_meters: 20.0,
            turn_distance_meters: 2.0,
        }
    }
}

fn heading(node: &ImageNode) -> f64 {
    node.spatial()
        .map(|s| s.computed_compass_angle.unwrap_or(s.compass_angle))
        .unwrap_or(0.0)
        .to_radians()
}

fn wrap(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

/// Local east/north offset in meters from `from` to `to`.
fn offset(from: &LngLat, to: &LngLat) -> (f64, f64) {
    let cos_lat = from.lat.to_radians().cos();
    let east = (to.lng - from.lng) * METERS_PER_DEGREE * cos_lat;
    let north = (to.lat - from.lat) * METERS_PER_DEGREE;
    (east, north)
}

fn is_spherical(node: &ImageNode) -> bool {
    node.spatial()
        .is_some_and(|s| s.camera_type == CameraType::Spherical)
}

impl DistanceEdgeCalculator {
    fn step_direction(motion_change: f64) -> EdgeDirection {
        let magnitude = motion_change.abs();
        if magnitude <= FRAC_PI_4 {
            EdgeDirection::StepForward
        } else if magnitude >= 3.0 * FRAC_PI_4 {
            EdgeDirection::StepBackward
        } else if motion_change > 0.0 {
            EdgeDirection::StepRight
        } else {
            EdgeDirection::StepLeft
        }
    }

    fn turn_direction(rotation: f64) -> Option<EdgeDirection> {
        let magnitude = rotation.abs();
        if magnitude < FRAC_PI_4 {
            None
        } else if magnitude >= 3.0 * FRAC_PI_4 {
            Some(EdgeDirection::TurnU)
        } else if rotation > 0.0 {
            Some(EdgeDirection::TurnRight)
        } else {
            Some(EdgeDirection::TurnLeft)
        }
    }
}

impl EdgeCalculator for DistanceEdgeCalculator {
    fn potential_edges(
        &self,
        node: &ImageNode,
        candidates: &[Arc<ImageNode>],
        fallback_ids: &[ImageId],
    ) -> Vec<PotentialEdge> {
        let origin = node.computed_position();
        let source_heading = heading(node);

        candidates
            .iter()
            .filter(|c| c.id() != node.id() && c.is_complete())
            .filter_map(|candidate| {
                let (east, north) = offset(&origin, &candidate.computed_position());
                let distance = east.hypot(north);
                let fallback = fallback_ids.contains(candidate.id());
                if distance > self.max_distance_meters && !fallback {
                    return None;
                }

                // Bearing measured clockwise from north
                let bearing = east.atan2(north);
                Some(PotentialEdge {
                    target: candidate.id().clone(),
                    sequence_id: candidate.sequence_id().clone(),
                    distance,
                    motion_change: wrap(bearing - source_heading),
                    rotation: wrap(heading(candidate) - source_heading),
                    same_merge_group: node.merge_id().is_some()
                        && node.merge_id() == candidate.merge_id(),
                    spherical: is_spherical(candidate),
                })
            })
            .collect()
    }

    fn compute_spatial_edges(
        &self,
        node: &ImageNode,
        potential: &[PotentialEdge],
    ) -> Vec<NavigationEdge> {
        let mut nearest: BTreeMap<EdgeDirection, &PotentialEdge> = BTreeMap::new();
        // One similar edge per other sequence
        let mut similar: BTreeMap<&str, &PotentialEdge> = BTreeMap::new();

        for candidate in potential {
            let direction = if candidate.spherical || is_spherical(node) {
                Some(EdgeDirection::Spherical)
            } else if candidate.distance < self.turn_distance_meters {
                Self::turn_direction(candidate.rotation)
            } else if candidate.rotation.abs() <= FRAC_PI_4 {
                Some(Self::step_direction(candidate.motion_change))
            } else {
                None
            };

            if let Some(direction) = direction {
                let closer = nearest
                    .get(&direction)
                    .map_or(true, |current| candidate.distance < current.distance);
                if closer {
                    nearest.insert(direction, candidate);
                }
            }

            if &candidate.sequence_id != node.sequence_id()
                && candidate.rotation.abs() < FRAC_PI_6
            {
                let closer = similar
                    .get(candidate.sequence_id.as_str())
                    .map_or(true, |current| candidate.distance < current.distance);
                if closer {
                    similar.insert(candidate.sequence_id.as_str(), candidate);
                }
            }
        }

        nearest
            .into_iter()
            .map(|(direction, c)| NavigationEdge::new(node.id().clone(), c.target.clone(), direction))
            .chain(similar.into_values().map(|c| {
                NavigationEdge::new(node.id().clone(), c.target.clone(), EdgeDirection::Similar)
            }))
            .collect()
    }
}
