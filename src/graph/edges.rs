//! Edge computation, candidate filtering and cache initialization.

use std::sync::Arc;

use tracing::debug;

use super::Graph;
use crate::edges::ImageFilter;
use crate::error::{CacheResource, GraphError, GraphResult};
use crate::events::GraphEvent;
use crate::provider::DataProvider;
use crate::types::{ImageId, ImageNode};

impl<P: DataProvider> Graph<P> {
    /// Promote an image into active use.
    pub fn initialize_cache(&self, id: &ImageId) -> GraphResult<Arc<ImageNode>> {
        let mut stores = self.inner.stores.lock();
        let node = stores
            .nodes
            .touch(id)
            .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
        if node.is_cache_initialized() {
            return Err(GraphError::already_cached(CacheResource::ImageCache, id));
        }
        stores
            .nodes
            .update(id, ImageNode::initialize_cache)
            .ok_or_else(|| GraphError::ImageNotFound(id.clone()))
    }

    /// Whether the image has been promoted into active use.
    pub fn has_initialized_cache(&self, id: &ImageId) -> bool {
        self.inner
            .stores
            .lock()
            .nodes
            .get(id)
            .is_some_and(|node| node.is_cache_initialized())
    }

    /// Compute next/prev edges from the image's owning sequence.
    pub fn cache_sequence_edges(&self, id: &ImageId) -> GraphResult<Arc<ImageNode>> {
        let node = {
            let mut stores = self.inner.stores.lock();
            let node = stores
                .nodes
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
            if node.sequence_edges().cached {
                return Err(GraphError::already_cached(CacheResource::SequenceEdges, id));
            }
            let sequence = stores
                .sequences
                .get(node.sequence_id())
                .cloned()
                .ok_or_else(|| GraphError::SequenceNotCached(id.clone()))?;

            let edges = self.inner.edge_calculator.compute_sequence_edges(&node, &sequence);
            stores
                .nodes
                .update(id, |n| n.cache_sequence_edges(edges))
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?
        };

        self.emit(GraphEvent::SequenceEdgesCached {
            image_id: id.clone(),
        });
        Ok(node)
    }

    /// Compute spatial edges from the images around an image.
    ///
    /// Requires the spatial area of the image to be cached. Candidates are
    /// the members of the image's covering cells plus its sequence
    /// neighbours when the sequence is held, narrowed by the active filter.
    pub fn cache_spatial_edges(&self, id: &ImageId) -> GraphResult<Arc<ImageNode>> {
        let filter = self.inner.filter.read().clone();

        let node = {
            let mut guard = self.inner.stores.lock();
            let stores = &mut *guard;
            let node = stores
                .nodes
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
            if node.spatial_edges().cached {
                return Err(GraphError::already_cached(CacheResource::SpatialEdges, id));
            }
            if !self.spatial_area_complete(stores, id)? {
                return Err(GraphError::SpatialAreaNotCached(id.clone()));
            }

            let fallback_ids: Vec<ImageId> = stores
                .sequences
                .get(node.sequence_id())
                .map(|sequence| {
                    [sequence.find_prev(id), sequence.find_next(id)]
                        .into_iter()
                        .flatten()
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let mut candidate_ids: Vec<ImageId> = stores
                .cells
                .cached_covering(id)
                .into_iter()
                .flatten()
                .filter_map(|cell| stores.cells.members(cell))
                .flatten()
                .cloned()
                .collect();
            candidate_ids.extend(fallback_ids.iter().cloned());
            candidate_ids.sort();
            candidate_ids.dedup();

            let candidates: Vec<Arc<ImageNode>> = candidate_ids
                .iter()
                .filter(|candidate| *candidate != id)
                .filter_map(|candidate| stores.nodes.get(candidate).cloned())
                .filter(|candidate| candidate.is_complete())
                .filter(|candidate| filter.as_ref().map_or(true, |f| f(candidate.as_ref())))
                .collect();

            let calculator = &self.inner.edge_calculator;
            let potential = calculator.potential_edges(&node, &candidates, &fallback_ids);
            let edges = calculator.compute_spatial_edges(&node, &potential);
            debug!(
                image_id = %id,
                candidates = candidates.len(),
                edges = edges.len(),
                "Computed spatial edges"
            );

            stores
                .nodes
                .update(id, |n| n.cache_spatial_edges(edges))
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?
        };

        self.emit(GraphEvent::SpatialEdgesCached {
            image_id: id.clone(),
        });
        Ok(node)
    }

    /// Invalidate spatial edges of every image.
    ///
    /// Covering cell sets are forgotten as well, so the next tile check
    /// recomputes them.
    pub fn reset_spatial_edges(&self) {
        {
            let mut stores = self.inner.stores.lock();
            stores.nodes.update_all(ImageNode::reset_spatial_edges);
            stores.cells.clear_covering();
        }
        self.emit(GraphEvent::SpatialEdgesReset);
    }

    /// Install a predicate narrowing spatial edge candidates.
    ///
    /// Edges already computed are left as they are.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&ImageNode) -> bool + Send + Sync + 'static,
    {
        let filter: ImageFilter = Arc::new(filter);
        *self.inner.filter.write() = Some(filter);
        self.emit(GraphEvent::FilterChanged);
    }

    /// Remove the candidate filter.
    pub fn clear_filter(&self) {
        *self.inner.filter.write() = None;
        self.emit(GraphEvent::FilterChanged);
    }
}
