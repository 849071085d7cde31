//! LRU eviction across the graph's stores.
//!
//! ## Resource classes
//!
//! Every pass ranks its candidates oldest access first and removes only the
//! excess over its own ceiling:
//!
//! 1. **Tiles**: cells not covering or containing a kept image. Evicting a
//!    cell drops its membership; a member left in no cell that is not kept is
//!    removed from the graph.
//! 2. **Pre-stored images**: images never promoted into active use. Removed
//!    outright.
//! 3. **Idle images**: cache-initialized images. Their derived state is
//!    dropped; the record itself is removed only when no cell lists it.
//! 4. **Sequences**: every sequence except the kept one and those whose
//!    images are being fetched. Member images are unaffected.
//!
//! Removing an image that a cell lists detaches it from the cell and marks
//! the cell unfetched, so cells never claim members the graph no longer holds.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GraphConfiguration;
use crate::error::{GraphError, GraphResult};
use crate::store::Stores;
use crate::types::{CellId, ImageId, ImageNode, SequenceId};

/// What an eviction or reset must leave in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepSet {
    /// Images that must survive.
    pub image_ids: HashSet<ImageId>,
    /// Sequence that must survive along with every member image.
    pub sequence_id: Option<SequenceId>,
    /// Sequences with work in flight; never evicted.
    pub busy_sequences: HashSet<SequenceId>,
}

impl KeepSet {
    /// Keep the given images.
    pub fn new<I>(image_ids: I) -> Self
    where
        I: IntoIterator<Item = ImageId>,
    {
        Self {
            image_ids: image_ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Also keep a sequence and its members.
    pub fn with_sequence(mut self, sequence_id: Option<SequenceId>) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    /// Also keep images with fetches in flight.
    pub fn with_busy_images<I>(mut self, image_ids: I) -> Self
    where
        I: IntoIterator<Item = ImageId>,
    {
        self.image_ids.extend(image_ids);
        self
    }

    /// Also keep sequences with fetches in flight.
    pub fn with_busy_sequences<I>(mut self, sequence_ids: I) -> Self
    where
        I: IntoIterator<Item = SequenceId>,
    {
        self.busy_sequences.extend(sequence_ids);
        self
    }
}

/// Outcome of an eviction or reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Images removed from the graph.
    pub removed_images: Vec<ImageId>,
    /// Removed images that were cache-initialized and went through disposal.
    pub disposed_images: Vec<ImageId>,
    /// Images whose derived state was dropped but whose record survives.
    pub uncached_images: Vec<ImageId>,
    /// Cells removed.
    pub evicted_cells: Vec<CellId>,
    /// Sequences removed.
    pub evicted_sequences: Vec<SequenceId>,
}

impl EvictionReport {
    /// Whether nothing was evicted.
    pub fn is_empty(&self) -> bool {
        self.removed_images.is_empty()
            && self.uncached_images.is_empty()
            && self.evicted_cells.is_empty()
            && self.evicted_sequences.is_empty()
    }

    fn record_removal(&mut self, node: &ImageNode) {
        if node.is_cache_initialized() {
            self.disposed_images.push(node.id().clone());
        }
        self.removed_images.push(node.id().clone());
    }
}

/// Remove an image from the node store.
///
/// Its sequence no longer has every image cached, so the sequence's flag is
/// cleared along with it.
fn remove_image(stores: &mut Stores, id: &ImageId) -> Option<Arc<ImageNode>> {
    let node = stores.nodes.remove(id)?;
    stores.sequences.unmark_images_cached(node.sequence_id());
    Some(node)
}

/// Enforces the per-resource ceilings of a [`GraphConfiguration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionManager {
    max_sequences: usize,
    max_unused_images: usize,
    max_unused_pre_stored_images: usize,
    max_unused_tiles: usize,
}

/// Keep set with the kept sequence's members resolved.
struct Resolved<'a> {
    keep: &'a KeepSet,
    sequence_members: HashSet<ImageId>,
}

impl Resolved<'_> {
    fn keeps(&self, node: &ImageNode) -> bool {
        self.keep.image_ids.contains(node.id())
            || self.sequence_members.contains(node.id())
            || self.keep.sequence_id.as_ref() == Some(node.sequence_id())
    }
}

impl EvictionManager {
    /// Create a manager using the ceilings of `config`.
    pub fn new(config: &GraphConfiguration) -> Self {
        Self {
            max_sequences: config.max_sequences,
            max_unused_images: config.max_unused_images,
            max_unused_pre_stored_images: config.max_unused_pre_stored_images,
            max_unused_tiles: config.max_unused_tiles,
        }
    }

    /// Run every eviction pass.
    pub fn evict(&self, stores: &mut Stores, keep: &KeepSet) -> EvictionReport {
        let sequence_members = keep
            .sequence_id
            .as_ref()
            .and_then(|id| stores.sequences.members(id))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        let resolved = Resolved {
            keep,
            sequence_members,
        };

        let mut report = EvictionReport::default();
        self.evict_tiles(stores, &resolved, &mut report);
        self.evict_pre_stored(stores, &resolved, &mut report);
        self.evict_idle(stores, &resolved, &mut report);
        self.evict_sequences(stores, keep, &mut report);

        info!(
            target: "imagery_graph::eviction",
            removed_images = report.removed_images.len(),
            disposed_images = report.disposed_images.len(),
            uncached_images = report.uncached_images.len(),
            evicted_cells = report.evicted_cells.len(),
            evicted_sequences = report.evicted_sequences.len(),
            "eviction_pass"
        );
        report
    }

    fn evict_tiles(&self, stores: &mut Stores, resolved: &Resolved<'_>, report: &mut EvictionReport) {
        let mut keep_cells: BTreeSet<CellId> = BTreeSet::new();
        for node in stores.nodes.iter().filter(|n| resolved.keeps(n)) {
            if let Some(covering) = stores.cells.cached_covering(node.id()) {
                keep_cells.extend(covering.iter().cloned());
            }
            if let Some(containing) = stores.cells.cells_containing(node.id()) {
                keep_cells.extend(containing.iter().cloned());
            }
        }

        let candidates: Vec<CellId> = stores
            .cells
            .oldest_first()
            .into_iter()
            .filter(|cell_id| !keep_cells.contains(cell_id))
            .collect();
        let excess = candidates.len().saturating_sub(self.max_unused_tiles);

        for cell_id in candidates.into_iter().take(excess) {
            let Some(members) = stores.cells.remove_cell(&cell_id) else {
                continue;
            };
            debug!(cell_id = %cell_id, members = members.len(), "Evicted cell");

            for id in members {
                if stores.cells.cells_containing(&id).is_some() {
                    continue;
                }
                let orphaned = stores.nodes.get(&id).filter(|n| !resolved.keeps(n)).cloned();
                if let Some(node) = orphaned {
                    stores.cells.forget_covering(&id);
                    remove_image(stores, &id);
                    report.record_removal(&node);
                }
            }
            report.evicted_cells.push(cell_id);
        }
    }

    fn evict_pre_stored(
        &self,
        stores: &mut Stores,
        resolved: &Resolved<'_>,
        report: &mut EvictionReport,
    ) {
        let candidates: Vec<ImageId> = stores
            .nodes
            .oldest_first()
            .into_iter()
            .filter(|id| {
                stores
                    .nodes
                    .get(id)
                    .is_some_and(|n| !n.is_cache_initialized() && !resolved.keeps(n))
            })
            .collect();
        let excess = candidates.len().saturating_sub(self.max_unused_pre_stored_images);

        for id in candidates.into_iter().take(excess) {
            stores.cells.detach_image(&id);
            stores.cells.forget_covering(&id);
            if let Some(node) = remove_image(stores, &id) {
                report.record_removal(&node);
            }
        }
    }

    fn evict_idle(&self, stores: &mut Stores, resolved: &Resolved<'_>, report: &mut EvictionReport) {
        let candidates: Vec<ImageId> = stores
            .nodes
            .oldest_first()
            .into_iter()
            .filter(|id| {
                stores
                    .nodes
                    .get(id)
                    .is_some_and(|n| n.is_cache_initialized() && !resolved.keeps(n))
            })
            .collect();
        let excess = candidates.len().saturating_sub(self.max_unused_images);

        for id in candidates.into_iter().take(excess) {
            if stores.cells.cells_containing(&id).is_some() {
                stores.nodes.update(&id, ImageNode::uncache);
                report.uncached_images.push(id);
            } else {
                stores.cells.forget_covering(&id);
                if let Some(node) = remove_image(stores, &id) {
                    report.record_removal(&node);
                }
            }
        }
    }

    fn evict_sequences(&self, stores: &mut Stores, keep: &KeepSet, report: &mut EvictionReport) {
        let candidates: Vec<SequenceId> = stores
            .sequences
            .oldest_first()
            .into_iter()
            .filter(|id| keep.sequence_id.as_ref() != Some(id) && !keep.busy_sequences.contains(id))
            .collect();
        let excess = candidates.len().saturating_sub(self.max_sequences);

        for id in candidates.into_iter().take(excess) {
            stores.sequences.remove(&id);
            report.evicted_sequences.push(id);
        }
    }

    /// Remove every image except `keep_ids` and drop all cells and sequences.
    ///
    /// Kept images survive with both edge sets reset. Fails without touching
    /// anything if a kept id is unknown.
    pub fn reset(&self, stores: &mut Stores, keep_ids: &[ImageId]) -> GraphResult<EvictionReport> {
        if let Some(missing) = keep_ids.iter().find(|id| !stores.nodes.contains(id)) {
            return Err(GraphError::ImageNotFound(missing.clone()));
        }
        let keep: HashSet<&ImageId> = keep_ids.iter().collect();

        let mut report = EvictionReport::default();
        for id in stores.nodes.oldest_first() {
            if keep.contains(&id) {
                stores.nodes.update(&id, |node| {
                    node.reset_sequence_edges();
                    node.reset_spatial_edges();
                });
            } else if let Some(node) = remove_image(stores, &id) {
                report.record_removal(&node);
            }
        }

        report.evicted_cells = stores.cells.oldest_first();
        report.evicted_sequences = stores.sequences.oldest_first();
        stores.cells.clear();
        stores.sequences.clear();

        info!(
            target: "imagery_graph::eviction",
            kept_images = keep.len(),
            removed_images = report.removed_images.len(),
            disposed_images = report.disposed_images.len(),
            "reset"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{EquirectangularGeodesy, GridCellIndex};
    use crate::types::{CoreImage, LngLat, Sequence};

    fn make_core(id: &str, sequence: &str) -> CoreImage {
        CoreImage {
            id: ImageId::from(id),
            position: LngLat::new(0.005, 0.005),
            sequence_id: SequenceId::from(sequence),
        }
    }

    fn manager(sequences: usize, images: usize, pre_stored: usize, tiles: usize) -> EvictionManager {
        EvictionManager::new(&GraphConfiguration::with_limits(
            sequences, images, pre_stored, tiles,
        ))
    }

    fn ids(list: &[&str]) -> Vec<ImageId> {
        list.iter().map(|id| ImageId::from(*id)).collect()
    }

    #[test]
    fn test_pre_stored_removed_unless_kept() {
        let mut stores = Stores::default();
        stores.nodes.insert_core(make_core("a", "s"));
        stores.nodes.insert_core(make_core("b", "s"));

        let report = manager(10, 10, 0, 10).evict(&mut stores, &KeepSet::new(ids(&["a"])));
        assert_eq!(report.removed_images, ids(&["b"]));
        assert!(report.disposed_images.is_empty());
        assert!(stores.nodes.contains(&ImageId::from("a")));
        assert!(!stores.nodes.contains(&ImageId::from("b")));
    }

    #[test]
    fn test_pre_stored_evicts_oldest_first() {
        let mut stores = Stores::default();
        for id in ["a", "b", "c"] {
            stores.nodes.insert_core(make_core(id, "s"));
        }
        stores.nodes.touch(&ImageId::from("a"));

        let report = manager(10, 10, 1, 10).evict(&mut stores, &KeepSet::default());
        assert_eq!(report.removed_images, ids(&["b", "c"]));
        assert!(stores.nodes.contains(&ImageId::from("a")));
    }

    #[test]
    fn test_keep_sequence_protects_members() {
        let mut stores = Stores::default();
        stores.nodes.insert_core(make_core("a", "s"));
        stores.nodes.insert_core(make_core("b", "t"));
        stores
            .sequences
            .insert(Sequence::new(SequenceId::from("t"), ids(&["b"])));

        let keep = KeepSet::default().with_sequence(Some(SequenceId::from("s")));
        let report = manager(0, 10, 0, 10).evict(&mut stores, &keep);

        assert_eq!(report.removed_images, ids(&["b"]));
        assert_eq!(report.evicted_sequences, vec![SequenceId::from("t")]);
    }

    #[test]
    fn test_removing_member_marks_cell_unfetched() {
        let mut stores = Stores::default();
        let cell = CellId::from("c");
        stores.nodes.insert_core(make_core("a", "s"));
        stores.nodes.insert_core(make_core("b", "s"));
        stores.cells.populate(&cell, ids(&["a", "b"]));

        manager(10, 10, 1, 10).evict(&mut stores, &KeepSet::default());
        assert!(!stores.cells.is_fetched(&cell));
        assert_eq!(stores.cells.members(&cell).unwrap().len(), 1);
    }

    #[test]
    fn test_idle_image_in_cell_is_uncached_not_removed() {
        let mut stores = Stores::default();
        let cell = CellId::from("c");
        for id in ["a", "b"] {
            stores.nodes.insert_core(make_core(id, "s"));
            stores.nodes.update(&ImageId::from(id), ImageNode::initialize_cache);
        }
        stores.cells.populate(&cell, ids(&["a"]));

        let report = manager(10, 0, 10, 10).evict(&mut stores, &KeepSet::default());
        assert_eq!(report.uncached_images, ids(&["a"]));
        assert_eq!(report.removed_images, ids(&["b"]));
        assert_eq!(report.disposed_images, ids(&["b"]));

        let a = stores.nodes.get(&ImageId::from("a")).unwrap();
        assert!(!a.is_cache_initialized());
    }

    #[test]
    fn test_tiles_covering_kept_image_survive() {
        let mut stores = Stores::default();
        let index = GridCellIndex::default();
        let (kept, _) = stores.nodes.insert_core(make_core("kept", "s"));
        let covering = stores
            .cells
            .covering_cells_for(&kept, &index, &EquirectangularGeodesy, 20.0)
            .unwrap();
        for cell in &covering {
            stores.cells.populate(cell, ids(&["kept"]));
        }
        stores.nodes.insert_core(make_core("orphan", "s"));
        stores.cells.populate(&CellId::from("far"), ids(&["orphan"]));

        let report = manager(10, 10, 10, 0).evict(&mut stores, &KeepSet::new(ids(&["kept"])));
        assert_eq!(report.evicted_cells, vec![CellId::from("far")]);
        assert_eq!(report.removed_images, ids(&["orphan"]));
        for cell in &covering {
            assert!(stores.cells.is_fetched(cell));
        }
    }

    #[test]
    fn test_removing_member_clears_sequence_images_flag() {
        let mut stores = Stores::default();
        let s = SequenceId::from("s");
        let t = SequenceId::from("t");
        stores.nodes.insert_core(make_core("a", "s"));
        stores.nodes.insert_core(make_core("b", "t"));
        stores.sequences.insert(Sequence::new(s.clone(), ids(&["a"])));
        stores.sequences.insert(Sequence::new(t.clone(), ids(&["b"])));
        stores.sequences.mark_images_cached(&s);
        stores.sequences.mark_images_cached(&t);

        let report = manager(10, 10, 0, 10).evict(&mut stores, &KeepSet::new(ids(&["b"])));
        assert_eq!(report.removed_images, ids(&["a"]));
        assert!(stores.sequences.contains(&s));
        assert!(!stores.sequences.has_images_cached(&s));
        assert!(stores.sequences.has_images_cached(&t));
    }

    #[test]
    fn test_busy_sequences_are_not_evicted() {
        let mut stores = Stores::default();
        stores.sequences.insert(Sequence::new(SequenceId::from("s"), vec![]));

        let keep = KeepSet::default().with_busy_sequences([SequenceId::from("s")]);
        let report = manager(0, 10, 10, 10).evict(&mut stores, &keep);
        assert!(report.evicted_sequences.is_empty());
        assert!(stores.sequences.contains(&SequenceId::from("s")));
    }

    #[test]
    fn test_reset_keeps_only_listed_images() {
        let mut stores = Stores::default();
        for id in ["x", "init", "pre"] {
            stores.nodes.insert_core(make_core(id, "s"));
        }
        stores.nodes.update(&ImageId::from("x"), |n| {
            n.initialize_cache();
            n.cache_sequence_edges(Vec::new());
        });
        stores.nodes.update(&ImageId::from("init"), ImageNode::initialize_cache);
        stores.cells.populate(&CellId::from("c"), ids(&["x", "init"]));
        stores.sequences.insert(Sequence::new(SequenceId::from("s"), ids(&["x"])));

        let report = manager(10, 10, 10, 10).reset(&mut stores, &ids(&["x"])).unwrap();

        assert_eq!(report.disposed_images, ids(&["init"]));
        let mut removed = report.removed_images.clone();
        removed.sort();
        assert_eq!(removed, ids(&["init", "pre"]));

        let x = stores.nodes.get(&ImageId::from("x")).unwrap();
        assert!(x.is_cache_initialized());
        assert!(!x.sequence_edges().cached);
        assert!(stores.cells.is_empty());
        assert!(stores.sequences.is_empty());
    }

    #[test]
    fn test_reset_with_unknown_keep_id_changes_nothing() {
        let mut stores = Stores::default();
        stores.nodes.insert_core(make_core("a", "s"));

        let result = manager(10, 10, 10, 10).reset(&mut stores, &ids(&["missing"]));
        assert_eq!(result, Err(GraphError::ImageNotFound(ImageId::from("missing"))));
        assert_eq!(stores.nodes.len(), 1);
    }
}
