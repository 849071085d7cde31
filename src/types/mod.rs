//! Core types for the image graph.

pub mod image;
pub mod edge;
pub mod sequence;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use image::{CameraType, CoreImage, ImageNode, ImageRecord, LngLat, SpatialImage};
pub use edge::{EdgeDirection, EdgeStatus, NavigationEdge, PotentialEdge};
pub use sequence::Sequence;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id! {
    /// Globally unique identifier of an image.
    ImageId
}

string_id! {
    /// Identifier of a capture sequence.
    SequenceId
}

string_id! {
    /// Identifier of a spatial cell produced by a [`CellIndex`](crate::spatial::CellIndex).
    CellId
}
