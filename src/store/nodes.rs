//! Image node store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::access::AccessIndex;
use crate::error::{GraphError, GraphResult};
use crate::types::{CoreImage, ImageId, ImageNode, ImageRecord, SpatialImage};

/// Owns image nodes and their access order.
///
/// Nodes are handed out as `Arc` snapshots. Mutation goes through
/// `Arc::make_mut`, so every change a fetch response makes lands in one step
/// from the reader's point of view.
pub struct NodeStore {
    nodes: HashMap<ImageId, Arc<ImageNode>>,
    access: AccessIndex<ImageId>,
}

impl NodeStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            access: AccessIndex::new(),
        }
    }

    /// Insert a core-only node. Returns the existing node unchanged if the id
    /// is already present, along with `false`.
    pub fn insert_core(&mut self, core: CoreImage) -> (Arc<ImageNode>, bool) {
        if let Some(existing) = self.nodes.get(&core.id) {
            return (Arc::clone(existing), false);
        }

        let id = core.id.clone();
        let node = Arc::new(ImageNode::from_core(core));
        self.nodes.insert(id.clone(), Arc::clone(&node));
        self.access.touch(id);
        (node, true)
    }

    /// Complete a core-only node.
    pub fn fill(&mut self, id: &ImageId, spatial: SpatialImage) -> GraphResult<Arc<ImageNode>> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
        if node.is_complete() {
            return Err(GraphError::AlreadyComplete(id.clone()));
        }

        Arc::make_mut(node).fill(spatial);
        let node = Arc::clone(node);
        self.access.touch(id.clone());
        Ok(node)
    }

    /// Insert a complete node, or upgrade a core-only node in place.
    ///
    /// An already complete node is left untouched; the first complete record
    /// wins.
    pub fn insert_full(&mut self, record: ImageRecord) -> Arc<ImageNode> {
        let id = record.id().clone();
        let node = if let Some(existing) = self.nodes.get_mut(&id) {
            if !existing.is_complete() {
                Arc::make_mut(existing).fill(record.spatial);
            }
            Arc::clone(existing)
        } else {
            let node = Arc::new(ImageNode::from_record(record));
            self.nodes.insert(id.clone(), Arc::clone(&node));
            node
        };
        self.access.touch(id);
        node
    }

    /// Get a node without recording an access.
    pub fn get(&self, id: &ImageId) -> Option<&Arc<ImageNode>> {
        self.nodes.get(id)
    }

    /// Get a node and record an access.
    pub fn touch(&mut self, id: &ImageId) -> Option<Arc<ImageNode>> {
        let node = self.nodes.get(id).cloned()?;
        self.access.touch(id.clone());
        Some(node)
    }

    /// Apply a mutation to a node.
    pub(crate) fn update<F>(&mut self, id: &ImageId, mutate: F) -> Option<Arc<ImageNode>>
    where
        F: FnOnce(&mut ImageNode),
    {
        let node = self.nodes.get_mut(id)?;
        mutate(Arc::make_mut(node));
        Some(Arc::clone(node))
    }

    /// Apply a mutation to every node.
    pub(crate) fn update_all<F>(&mut self, mut mutate: F)
    where
        F: FnMut(&mut ImageNode),
    {
        for node in self.nodes.values_mut() {
            mutate(Arc::make_mut(node));
        }
    }

    /// Remove a node unconditionally.
    pub fn remove(&mut self, id: &ImageId) -> Option<Arc<ImageNode>> {
        self.access.remove(id);
        self.nodes.remove(id)
    }

    /// Whether the node is present.
    pub fn contains(&self, id: &ImageId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ImageNode>> {
        self.nodes.values()
    }

    /// Last access time of a node.
    pub fn last_access(&self, id: &ImageId) -> Option<DateTime<Utc>> {
        self.access.last_access(id)
    }

    /// Node ids, least recently used first.
    pub fn oldest_first(&self) -> Vec<ImageId> {
        self.access.oldest_first()
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}
