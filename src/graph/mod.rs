//! The graph orchestrator.
//!
//! A [`Graph`] composes the stores, the request registries, the batch
//! planners and the eviction manager behind one public surface. It is cheap
//! to clone; clones share state.
//!
//! ## Locking
//!
//! All store state sits behind one `parking_lot` mutex. Every state
//! transition takes the lock, applies its mutation and releases it before
//! the next await point, so two fetches landing together never interleave
//! partial updates of the same image.
//!
//! ## Submodules
//!
//! - `cache` - the asynchronous cache operations
//! - `edges` - edge computation, filtering and cache initialization

mod cache;
mod edges;

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::BatchPlanner;
use crate::config::{ConfigError, GraphConfiguration};
use crate::edges::{DistanceEdgeCalculator, EdgeCalculator, ImageFilter};
use crate::error::{GraphError, GraphResult};
use crate::events::GraphEvent;
use crate::eviction::{EvictionManager, EvictionReport, KeepSet};
use crate::provider::DataProvider;
use crate::registry::{RegistryStats, RequestKey, RequestRegistry};
use crate::spatial::{CellIndex, EquirectangularGeodesy, Geodesy, GridCellIndex};
use crate::store::Stores;
use crate::types::{CellId, ImageId, ImageNode, Sequence, SequenceId};

/// Snapshot of graph size and request activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Images held.
    pub images: usize,
    /// Images holding both core and fill fields.
    pub complete_images: usize,
    /// Images promoted into active use.
    pub initialized_images: usize,
    /// Cells held.
    pub cells: usize,
    /// Cells whose membership has been fetched.
    pub fetched_cells: usize,
    /// Sequences held.
    pub sequences: usize,
    /// Requests in flight.
    pub in_flight_requests: usize,
    /// Requests received across every registry.
    pub total_requests: u64,
    /// Requests that attached to an in-flight fetch.
    pub coalesced_requests: u64,
}

struct GraphInner<P: DataProvider> {
    provider: Arc<P>,
    config: GraphConfiguration,
    cell_index: Arc<dyn CellIndex>,
    geodesy: Arc<dyn Geodesy>,
    edge_calculator: Arc<dyn EdgeCalculator>,
    sequence_planner: BatchPlanner,
    spatial_planner: BatchPlanner,
    eviction: EvictionManager,
    stores: Mutex<Stores>,
    filter: RwLock<Option<ImageFilter>>,
    /// `Full` and `Fill` requests.
    images: RequestRegistry<Arc<ImageNode>>,
    /// `Cell`, `Tiles` and `BoundingBox` requests.
    cells: RequestRegistry<Vec<Arc<ImageNode>>>,
    /// `Sequence` requests.
    sequences: RequestRegistry<Arc<Sequence>>,
    /// `SequenceImages` and `SpatialArea` requests.
    areas: RequestRegistry<()>,
    cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<GraphEvent>,
}

/// Builder for [`Graph`].
pub struct GraphBuilder<P: DataProvider> {
    provider: Arc<P>,
    config: GraphConfiguration,
    cell_index: Arc<dyn CellIndex>,
    geodesy: Arc<dyn Geodesy>,
    edge_calculator: Arc<dyn EdgeCalculator>,
}

impl<P: DataProvider> GraphBuilder<P> {
    /// Use a configuration other than the default.
    pub fn config(mut self, config: GraphConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Use a cell index other than the default grid.
    pub fn cell_index(mut self, cell_index: Arc<dyn CellIndex>) -> Self {
        self.cell_index = cell_index;
        self
    }

    /// Use a geodesy other than the equirectangular approximation.
    pub fn geodesy(mut self, geodesy: Arc<dyn Geodesy>) -> Self {
        self.geodesy = geodesy;
        self
    }

    /// Use an edge calculator other than [`DistanceEdgeCalculator`].
    pub fn edge_calculator(mut self, edge_calculator: Arc<dyn EdgeCalculator>) -> Self {
        self.edge_calculator = edge_calculator;
        self
    }

    /// Validate the configuration and build the graph.
    pub fn build(self) -> Result<Graph<P>, ConfigError> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(self.config.event_capacity);

        Ok(Graph {
            inner: Arc::new(GraphInner {
                provider: self.provider,
                sequence_planner: BatchPlanner::new(self.config.sequence_batch_size),
                spatial_planner: BatchPlanner::new(self.config.spatial_batch_size),
                eviction: EvictionManager::new(&self.config),
                config: self.config,
                cell_index: self.cell_index,
                geodesy: self.geodesy,
                edge_calculator: self.edge_calculator,
                stores: Mutex::new(Stores::default()),
                filter: RwLock::new(None),
                images: RequestRegistry::new(),
                cells: RequestRegistry::new(),
                sequences: RequestRegistry::new(),
                areas: RequestRegistry::new(),
                cancel: Mutex::new(CancellationToken::new()),
                events,
            }),
        })
    }
}

/// In-memory image graph backed by a [`DataProvider`].
pub struct Graph<P: DataProvider> {
    inner: Arc<GraphInner<P>>,
}

impl<P: DataProvider> Clone for Graph<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Race a fetch against the abort signal.
async fn abortable<T, E, F>(token: CancellationToken, fetch: F) -> GraphResult<T>
where
    F: Future<Output = Result<T, E>>,
    GraphError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GraphError::Aborted),
        result = fetch => result.map_err(GraphError::from),
    }
}

impl<P: DataProvider> Graph<P> {
    /// Start building a graph over `provider`.
    pub fn builder(provider: Arc<P>) -> GraphBuilder<P> {
        GraphBuilder {
            provider,
            config: GraphConfiguration::default(),
            cell_index: Arc::new(GridCellIndex::default()),
            geodesy: Arc::new(EquirectangularGeodesy),
            edge_calculator: Arc::new(DistanceEdgeCalculator::default()),
        }
    }

    /// Create a graph with default collaborators.
    pub fn new(provider: Arc<P>, config: GraphConfiguration) -> Result<Self, ConfigError> {
        Self::builder(provider).config(config).build()
    }

    /// The graph's configuration.
    pub fn config(&self) -> &GraphConfiguration {
        &self.inner.config
    }

    /// The data provider.
    pub fn provider(&self) -> &Arc<P> {
        &self.inner.provider
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: GraphEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn token(&self) -> CancellationToken {
        self.inner.cancel.lock().clone()
    }

    fn threshold(&self) -> f64 {
        self.inner.config.tile_threshold_meters
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Whether the image is held.
    pub fn has_image(&self, id: &ImageId) -> bool {
        self.inner.stores.lock().nodes.contains(id)
    }

    /// Get an image and record an access.
    pub fn get_image(&self, id: &ImageId) -> GraphResult<Arc<ImageNode>> {
        self.inner
            .stores
            .lock()
            .nodes
            .touch(id)
            .ok_or_else(|| GraphError::ImageNotFound(id.clone()))
    }

    /// Whether every covering cell of the image has been fetched.
    pub fn has_tiles(&self, id: &ImageId) -> bool {
        let mut guard = self.inner.stores.lock();
        let stores = &mut *guard;
        let Some(node) = stores.nodes.get(id).cloned() else {
            return false;
        };
        stores
            .cells
            .is_tile_complete(
                &node,
                self.inner.cell_index.as_ref(),
                self.inner.geodesy.as_ref(),
                self.threshold(),
            )
            .unwrap_or(false)
    }

    /// Whether tiles are complete and every image in them is complete.
    pub fn has_spatial_area(&self, id: &ImageId) -> bool {
        let mut stores = self.inner.stores.lock();
        self.spatial_area_complete(&mut stores, id).unwrap_or(false)
    }

    fn spatial_area_complete(&self, stores: &mut Stores, id: &ImageId) -> GraphResult<bool> {
        let node = stores
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
        let cells = stores.cells.covering_cells_for(
            &node,
            self.inner.cell_index.as_ref(),
            self.inner.geodesy.as_ref(),
            self.threshold(),
        )?;
        if !cells.iter().all(|cell| stores.cells.is_fetched(cell)) {
            return Ok(false);
        }

        let complete = cells
            .iter()
            .filter_map(|cell| stores.cells.members(cell))
            .flatten()
            .all(|member| stores.nodes.get(member).map_or(true, |n| n.is_complete()));
        Ok(complete)
    }

    /// Whether the sequence is held.
    pub fn has_sequence(&self, id: &SequenceId) -> bool {
        self.inner.stores.lock().sequences.contains(id)
    }

    /// Get a sequence and record an access.
    pub fn get_sequence(&self, id: &SequenceId) -> GraphResult<Arc<Sequence>> {
        self.inner
            .stores
            .lock()
            .sequences
            .touch(id)
            .ok_or_else(|| GraphError::SequenceNotFound(id.clone()))
    }

    /// Whether every image of the sequence has been fetched.
    pub fn has_sequence_images(&self, id: &SequenceId) -> bool {
        self.inner.stores.lock().sequences.has_images_cached(id)
    }

    /// Whether the owning sequence of the image is held.
    pub fn has_image_sequence(&self, id: &ImageId) -> bool {
        let stores = self.inner.stores.lock();
        stores
            .nodes
            .get(id)
            .is_some_and(|node| stores.sequences.contains(node.sequence_id()))
    }

    /// Images of a cell, recording an access to the cell.
    pub fn get_cell_images(&self, cell_id: &CellId) -> GraphResult<Vec<Arc<ImageNode>>> {
        let mut stores = self.inner.stores.lock();
        if !stores.cells.touch(cell_id) {
            return Err(GraphError::CellNotFound(cell_id.clone()));
        }
        Ok(cell_members(&stores, cell_id))
    }

    /// Whether a full fetch of the image is in flight.
    pub fn is_caching_full(&self, id: &ImageId) -> bool {
        self.inner.images.contains(&RequestKey::Full(id.clone()))
    }

    /// Whether a fill fetch of the image is in flight.
    pub fn is_caching_fill(&self, id: &ImageId) -> bool {
        self.inner.images.contains(&RequestKey::Fill(id.clone()))
    }

    /// Whether the image's covering cells are being fetched.
    pub fn is_caching_tiles(&self, id: &ImageId) -> bool {
        self.inner.cells.contains(&RequestKey::Tiles(id.clone()))
    }

    /// Whether the sequence's id list is being fetched.
    pub fn is_caching_sequence(&self, id: &SequenceId) -> bool {
        self.inner.sequences.contains(&RequestKey::Sequence(id.clone()))
    }

    /// Whether the sequence's images are being fetched.
    pub fn is_caching_sequence_images(&self, id: &SequenceId) -> bool {
        self.inner
            .areas
            .contains(&RequestKey::SequenceImages(id.clone()))
    }

    /// Whether the owning sequence of the image is being fetched.
    pub fn is_caching_image_sequence(&self, id: &ImageId) -> bool {
        let sequence_id = self
            .inner
            .stores
            .lock()
            .nodes
            .get(id)
            .map(|node| node.sequence_id().clone());
        sequence_id.is_some_and(|sequence_id| self.is_caching_sequence(&sequence_id))
    }

    /// Whether the images around the image are being filled.
    pub fn is_caching_spatial_area(&self, id: &ImageId) -> bool {
        self.inner.areas.contains(&RequestKey::SpatialArea(id.clone()))
    }

    /// Size and request statistics.
    pub fn stats(&self) -> GraphStats {
        let registry = self.registry_stats();
        let stores = self.inner.stores.lock();
        GraphStats {
            images: stores.nodes.len(),
            complete_images: stores.nodes.iter().filter(|n| n.is_complete()).count(),
            initialized_images: stores
                .nodes
                .iter()
                .filter(|n| n.is_cache_initialized())
                .count(),
            cells: stores.cells.len(),
            fetched_cells: stores.cells.fetched_len(),
            sequences: stores.sequences.len(),
            in_flight_requests: self.in_flight_count(),
            total_requests: registry.total_requests,
            coalesced_requests: registry.coalesced_requests,
        }
    }

    fn registry_stats(&self) -> RegistryStats {
        self.inner
            .images
            .stats()
            .merge(self.inner.cells.stats())
            .merge(self.inner.sequences.stats())
            .merge(self.inner.areas.stats())
    }

    fn in_flight_count(&self) -> usize {
        self.inner.images.in_flight_count()
            + self.inner.cells.in_flight_count()
            + self.inner.sequences.in_flight_count()
            + self.inner.areas.in_flight_count()
    }

    // ─── Eviction ────────────────────────────────────────────────────────

    /// Evict least recently used resources down to the configured ceilings.
    ///
    /// `keep_ids`, every member of `keep_sequence` and every image or
    /// sequence with a fetch in flight survive. Members of a sequence whose
    /// images are being fetched count as in flight.
    pub fn uncache(&self, keep_ids: &[ImageId], keep_sequence: Option<&SequenceId>) -> EvictionReport {
        let mut busy_images = Vec::new();
        let mut busy_sequences = Vec::new();
        let mut filling_sequences = Vec::new();
        let keys = self
            .inner
            .images
            .keys()
            .into_iter()
            .chain(self.inner.cells.keys())
            .chain(self.inner.sequences.keys())
            .chain(self.inner.areas.keys());
        for key in keys {
            match key {
                RequestKey::Full(id)
                | RequestKey::Fill(id)
                | RequestKey::Tiles(id)
                | RequestKey::SpatialArea(id) => busy_images.push(id),
                RequestKey::Sequence(id) => busy_sequences.push(id),
                RequestKey::SequenceImages(id) => {
                    filling_sequences.push(id.clone());
                    busy_sequences.push(id);
                }
                RequestKey::Cell(_) | RequestKey::BoundingBox(_) => {}
            }
        }

        let report = {
            let mut stores = self.inner.stores.lock();
            // Members of a sequence being filled are busy too.
            for id in &filling_sequences {
                if let Some(members) = stores.sequences.members(id) {
                    busy_images.extend(members.iter().cloned());
                }
            }
            let keep = KeepSet::new(keep_ids.iter().cloned())
                .with_sequence(keep_sequence.cloned())
                .with_busy_images(busy_images)
                .with_busy_sequences(busy_sequences);
            self.inner.eviction.evict(&mut stores, &keep)
        };
        if !report.is_empty() {
            self.emit(GraphEvent::Uncached {
                removed_images: report.removed_images.len(),
                evicted_cells: report.evicted_cells.len(),
                evicted_sequences: report.evicted_sequences.len(),
            });
        }
        report
    }

    /// Remove everything except `keep_ids`, whose edges are reset.
    ///
    /// In-flight requests are left running.
    pub fn reset(&self, keep_ids: &[ImageId]) -> GraphResult<EvictionReport> {
        let report = {
            let mut stores = self.inner.stores.lock();
            self.inner.eviction.reset(&mut stores, keep_ids)?
        };
        self.emit(GraphEvent::Reset {
            kept_images: keep_ids.len(),
        });
        Ok(report)
    }

    /// Abort every in-flight fetch.
    ///
    /// Every caller attached to a pending request observes
    /// [`GraphError::Aborted`]. Returns the number of requests aborted.
    pub fn abort_pending(&self) -> usize {
        let previous = std::mem::replace(&mut *self.inner.cancel.lock(), CancellationToken::new());
        let requests = self.in_flight_count();
        previous.cancel();

        self.inner.images.clear();
        self.inner.cells.clear();
        self.inner.sequences.clear();
        self.inner.areas.clear();

        info!(requests, "Aborted pending requests");
        self.emit(GraphEvent::Aborted { requests });
        requests
    }
}

/// Nodes for the members of a cell, in id order.
fn cell_members(stores: &Stores, cell_id: &CellId) -> Vec<Arc<ImageNode>> {
    stores
        .cells
        .members(cell_id)
        .map(|members| {
            members
                .iter()
                .filter_map(|id| stores.nodes.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// Record an access to each node.
fn touch_all(stores: &mut Stores, nodes: &[Arc<ImageNode>]) {
    for node in nodes {
        stores.nodes.touch(node.id());
    }
}
