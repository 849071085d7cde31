//! Navigation edge types.

use serde::{Deserialize, Serialize};
use super::{ImageId, SequenceId};

/// Direction of a navigation edge between two images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDirection {
    /// Next image in the same sequence.
    Next,
    /// Previous image in the same sequence.
    Prev,
    /// Step forward.
    StepForward,
    /// Step backward.
    StepBackward,
    /// Step left.
    StepLeft,
    /// Step right.
    StepRight,
    /// Rotate left in place.
    TurnLeft,
    /// Rotate right in place.
    TurnRight,
    /// Turn around.
    TurnU,
    /// Move to a nearby spherical image.
    Spherical,
    /// Similar viewpoint in another sequence.
    Similar,
}

impl EdgeDirection {
    /// Parse an edge direction from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "next" => Some(Self::Next),
            "prev" => Some(Self::Prev),
            "step_forward" => Some(Self::StepForward),
            "step_backward" => Some(Self::StepBackward),
            "step_left" => Some(Self::StepLeft),
            "step_right" => Some(Self::StepRight),
            "turn_left" => Some(Self::TurnLeft),
            "turn_right" => Some(Self::TurnRight),
            "turn_u" => Some(Self::TurnU),
            "spherical" => Some(Self::Spherical),
            "similar" => Some(Self::Similar),
            _ => None,
        }
    }

    /// Whether the edge follows sequence order rather than spatial layout.
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::Next | Self::Prev)
    }
}

impl std::fmt::Display for EdgeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Next => "next",
            Self::Prev => "prev",
            Self::StepForward => "step_forward",
            Self::StepBackward => "step_backward",
            Self::StepLeft => "step_left",
            Self::StepRight => "step_right",
            Self::TurnLeft => "turn_left",
            Self::TurnRight => "turn_right",
            Self::TurnU => "turn_u",
            Self::Spherical => "spherical",
            Self::Similar => "similar",
        };
        f.write_str(name)
    }
}

/// Directed navigation edge from one image to another.
///
/// Implements `Ord` for deterministic ordering: (source, target, direction).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NavigationEdge {
    /// Origin image.
    pub source: ImageId,
    /// Destination image.
    pub target: ImageId,
    /// Direction of travel.
    pub direction: EdgeDirection,
}

impl NavigationEdge {
    /// Create a new edge.
    pub fn new(source: ImageId, target: ImageId, direction: EdgeDirection) -> Self {
        Self {
            source,
            target,
            direction,
        }
    }
}

/// Cached edges of one kind for a node.
///
/// `cached == false` means the edges must be (re)computed before use; an empty
/// but cached list means the node genuinely has no edges of this kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeStatus {
    /// Whether the edges have been computed.
    pub cached: bool,
    /// Computed edges, sorted.
    pub edges: Vec<NavigationEdge>,
}

impl EdgeStatus {
    /// Create a computed edge status.
    pub fn cached(mut edges: Vec<NavigationEdge>) -> Self {
        edges.sort();
        Self {
            cached: true,
            edges,
        }
    }
}

/// Candidate neighbour produced by an edge calculator before edge kinds are
/// assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialEdge {
    /// Candidate image.
    pub target: ImageId,
    /// Sequence of the candidate.
    pub sequence_id: SequenceId,
    /// Distance to the candidate in meters.
    pub distance: f64,
    /// Bearing towards the candidate relative to the source heading, in
    /// radians within `[-pi, pi]`. Positive is clockwise.
    pub motion_change: f64,
    /// Heading of the candidate relative to the source heading, in radians
    /// within `[-pi, pi]`.
    pub rotation: f64,
    /// Whether the candidate was reconstructed in the same merge group.
    pub same_merge_group: bool,
    /// Whether the candidate is spherical.
    pub spherical: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_ordering() {
        let a = ImageId::from("a");
        let b = ImageId::from("b");
        let c = ImageId::from("c");

        let e1 = NavigationEdge::new(a.clone(), b.clone(), EdgeDirection::Next);
        let e2 = NavigationEdge::new(a.clone(), c.clone(), EdgeDirection::Next);
        let e3 = NavigationEdge::new(b, c, EdgeDirection::Prev);

        // Same source, different target
        assert!(e1 < e2);
        // Different source
        assert!(e2 < e3);
    }

    #[test]
    fn test_direction_round_trips_through_display() {
        for direction in [EdgeDirection::Next, EdgeDirection::TurnU, EdgeDirection::StepLeft] {
            assert_eq!(EdgeDirection::from_str(&direction.to_string()), Some(direction));
        }
        assert_eq!(EdgeDirection::from_str("sideways"), None);
    }

    #[test]
    fn test_cached_status_sorts_edges() {
        let a = ImageId::from("a");
        let status = EdgeStatus::cached(vec![
            NavigationEdge::new(a.clone(), ImageId::from("z"), EdgeDirection::Similar),
            NavigationEdge::new(a.clone(), ImageId::from("b"), EdgeDirection::Next),
        ]);
        assert!(status.cached);
        assert_eq!(status.edges[0].target, ImageId::from("b"));
        assert!(!EdgeStatus::default().cached);
    }
}
