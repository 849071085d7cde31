//! # imagery-graph
//!
//! In-memory, request-deduplicating cache of street-level imagery records.
//!
//! The graph answers one question for a viewer:
//!
//! > Which images, sequences and spatial cells are held right now, and what
//! > does it take to hold the ones I need next?
//!
//! ## Core Contract
//!
//! 1. Every record is fetched at most once per outstanding request: callers
//!    asking for the same thing while it is in flight share one provider call
//! 2. Images become *complete* only when both core and spatial attributes are
//!    present; navigation edges are computed from complete images only
//! 3. Memory stays bounded: idle records are dropped least-recently-used
//!    first, never touching what the caller asked to keep
//!
//! ## Architecture
//!
//! ```text
//! Viewer → Graph ─┬─ RequestRegistry (in-flight dedupe)
//!                 ├─ BatchPlanner    (sequence/area batching)
//!                 ├─ Stores          (nodes, cells, sequences + LRU)
//!                 └─ EvictionManager (bounded retention)
//!                        ↓
//!                  DataProvider (remote or in-memory)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let provider = Arc::new(InMemoryDataProvider::from_dataset(dataset, &GridCellIndex::default()));
//! let graph = Graph::new(provider, GraphConfiguration::default())?;
//!
//! let node = graph.cache_full(&ImageId::from("img_1")).await?;
//! graph.cache_sequence_images(node.sequence_id(), Some(node.id())).await?;
//! graph.uncache(&[node.id().clone()], Some(node.sequence_id()));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod config;
pub mod spatial;
pub mod provider;
pub mod store;
pub mod registry;
pub mod batch;
pub mod edges;
pub mod events;
pub mod eviction;
pub mod graph;

// Re-exports
pub use types::{
    CameraType, CellId, CoreImage, EdgeDirection, EdgeStatus, ImageId, ImageNode, ImageRecord,
    LngLat, NavigationEdge, PotentialEdge, Sequence, SequenceId, SpatialImage,
};
pub use error::{CacheResource, GraphError, GraphResult};
pub use config::{ConfigError, GraphConfiguration};
pub use spatial::{CellIndex, CellIndexError, EquirectangularGeodesy, Geodesy, GridCellIndex};
pub use provider::{
    CoreImagesResponse, DataProvider, Dataset, FetchCounts, InMemoryDataProvider, ProviderError,
    SpatialImageItem,
};
pub use store::{CellStore, NodeStore, SequenceStore, Stores};
pub use registry::{RegistryStats, RequestKey, RequestRegistry, SharedRequest};
pub use batch::{BatchPlanner, DEFAULT_BATCH_SIZE, PRIORITY_WINDOW};
pub use edges::{DistanceEdgeCalculator, EdgeCalculator, ImageFilter};
pub use events::GraphEvent;
pub use eviction::{EvictionManager, EvictionReport, KeepSet};
pub use graph::{Graph, GraphBuilder, GraphStats};
