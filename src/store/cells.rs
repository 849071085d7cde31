//! Spatial cell store.
//!
//! Holds two kinds of state:
//!
//! - per cell: the ids of the images known to lie in it and whether a full
//!   membership fetch has landed;
//! - per image: the set of cells covering the box around its position. This
//!   set is computed once through the [`CellIndex`] and [`Geodesy`]
//!   collaborators and kept until explicitly forgotten, so membership checks
//!   never re-encode positions.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::access::AccessIndex;
use crate::error::GraphResult;
use crate::spatial::{CellIndex, Geodesy};
use crate::types::{CellId, ImageId, ImageNode};

#[derive(Debug, Default)]
struct CellRecord {
    images: BTreeSet<ImageId>,
    fetched: bool,
}

/// Owns cell membership and per-image covering cells.
pub struct CellStore {
    cells: HashMap<CellId, CellRecord>,
    access: AccessIndex<CellId>,
    /// Image -> cells listing it as a member.
    memberships: HashMap<ImageId, BTreeSet<CellId>>,
    /// Image -> cells covering the box around it.
    covering: HashMap<ImageId, BTreeSet<CellId>>,
}

impl CellStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            cells: HashMap::new(),
            access: AccessIndex::new(),
            memberships: HashMap::new(),
            covering: HashMap::new(),
        }
    }

    /// Create an empty, unfetched cell if absent.
    pub fn ensure_cell(&mut self, cell_id: &CellId) {
        if !self.cells.contains_key(cell_id) {
            self.cells.insert(cell_id.clone(), CellRecord::default());
            self.access.touch(cell_id.clone());
        }
    }

    /// Mark a cell fetched and merge `image_ids` into its membership.
    pub fn populate<I>(&mut self, cell_id: &CellId, image_ids: I)
    where
        I: IntoIterator<Item = ImageId>,
    {
        self.ensure_cell(cell_id);
        let Some(record) = self.cells.get_mut(cell_id) else {
            return;
        };

        for id in image_ids {
            self.memberships
                .entry(id.clone())
                .or_default()
                .insert(cell_id.clone());
            record.images.insert(id);
        }
        record.fetched = true;
        self.access.touch(cell_id.clone());
    }

    /// Member ids of a cell.
    pub fn members(&self, cell_id: &CellId) -> Option<&BTreeSet<ImageId>> {
        self.cells.get(cell_id).map(|record| &record.images)
    }

    /// Whether a membership fetch has landed for the cell.
    pub fn is_fetched(&self, cell_id: &CellId) -> bool {
        self.cells.get(cell_id).is_some_and(|record| record.fetched)
    }

    /// Whether the cell is known, fetched or not.
    pub fn contains(&self, cell_id: &CellId) -> bool {
        self.cells.contains_key(cell_id)
    }

    /// Record an access to a cell.
    pub fn touch(&mut self, cell_id: &CellId) -> bool {
        if self.cells.contains_key(cell_id) {
            self.access.touch(cell_id.clone());
            true
        } else {
            false
        }
    }

    /// Cells listing the image as a member.
    pub fn cells_containing(&self, id: &ImageId) -> Option<&BTreeSet<CellId>> {
        self.memberships.get(id).filter(|cells| !cells.is_empty())
    }

    /// Covering cells of a node, computing and caching them on first use.
    pub fn covering_cells_for(
        &mut self,
        node: &ImageNode,
        index: &dyn CellIndex,
        geodesy: &dyn Geodesy,
        threshold_meters: f64,
    ) -> GraphResult<BTreeSet<CellId>> {
        if let Some(cells) = self.covering.get(node.id()) {
            return Ok(cells.clone());
        }

        let (sw, ne) = geodesy.bounding_box_corners(&node.position(), threshold_meters);
        let cells: BTreeSet<CellId> = index.bbox_to_cell_ids(&sw, &ne)?.into_iter().collect();
        self.covering.insert(node.id().clone(), cells.clone());
        Ok(cells)
    }

    /// Covering cells of an image if already computed.
    pub fn cached_covering(&self, id: &ImageId) -> Option<&BTreeSet<CellId>> {
        self.covering.get(id)
    }

    /// Whether every covering cell of the node has been fetched.
    pub fn is_tile_complete(
        &mut self,
        node: &ImageNode,
        index: &dyn CellIndex,
        geodesy: &dyn Geodesy,
        threshold_meters: f64,
    ) -> GraphResult<bool> {
        let cells = self.covering_cells_for(node, index, geodesy, threshold_meters)?;
        Ok(cells.iter().all(|cell_id| self.is_fetched(cell_id)))
    }

    /// Drop an image from every cell listing it.
    ///
    /// Those cells no longer hold their full membership, so they are marked
    /// unfetched and will be fetched again on next demand. Returns the
    /// affected cells.
    pub fn detach_image(&mut self, id: &ImageId) -> BTreeSet<CellId> {
        let cells = self.memberships.remove(id).unwrap_or_default();
        for cell_id in &cells {
            if let Some(record) = self.cells.get_mut(cell_id) {
                record.images.remove(id);
                record.fetched = false;
            }
        }
        cells
    }

    /// Remove a cell and return its members.
    pub fn remove_cell(&mut self, cell_id: &CellId) -> Option<BTreeSet<ImageId>> {
        let record = self.cells.remove(cell_id)?;
        self.access.remove(cell_id);
        for id in &record.images {
            if let Some(cells) = self.memberships.get_mut(id) {
                cells.remove(cell_id);
                if cells.is_empty() {
                    self.memberships.remove(id);
                }
            }
        }
        Some(record.images)
    }

    /// Forget the covering cells of one image.
    pub fn forget_covering(&mut self, id: &ImageId) {
        self.covering.remove(id);
    }

    /// Forget the covering cells of every image.
    pub fn clear_covering(&mut self) {
        self.covering.clear();
    }

    /// Remove every cell and all per-image state.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.access.clear();
        self.memberships.clear();
        self.covering.clear();
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of fetched cells.
    pub fn fetched_len(&self) -> usize {
        self.cells.values().filter(|record| record.fetched).count()
    }

    /// Last access time of a cell.
    pub fn last_access(&self, cell_id: &CellId) -> Option<DateTime<Utc>> {
        self.access.last_access(cell_id)
    }

    /// Cell ids, least recently used first.
    pub fn oldest_first(&self) -> Vec<CellId> {
        self.access.oldest_first()
    }
}

impl Default for CellStore {
    fn default() -> Self {
        Self::new()
    }
}
