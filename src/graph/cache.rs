//! Asynchronous cache operations.
//!
//! Each public operation validates the request synchronously, then attaches
//! to (or starts) a deduplicated request. Request bodies capture the abort
//! token current at issuance and race every fetch against it.

use std::collections::{BTreeMap, BTreeSet};
use std::slice;
use std::sync::Arc;

use futures::future::{try_join_all, FutureExt};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{abortable, cell_members, touch_all, Graph};
use crate::error::{CacheResource, GraphError, GraphResult};
use crate::events::GraphEvent;
use crate::provider::DataProvider;
use crate::registry::{RequestKey, SharedRequest};
use crate::store::Stores;
use crate::types::{CellId, ImageId, ImageNode, LngLat, Sequence, SequenceId};

/// Ids of every member of `cells`.
fn member_ids<'a>(stores: &Stores, cells: impl IntoIterator<Item = &'a CellId>) -> BTreeSet<ImageId> {
    cells
        .into_iter()
        .filter_map(|cell| stores.cells.members(cell))
        .flatten()
        .cloned()
        .collect()
}

/// Nodes of every member of `cells`, once each, in id order.
fn union_members<'a>(
    stores: &Stores,
    cells: impl IntoIterator<Item = &'a CellId>,
) -> Vec<Arc<ImageNode>> {
    let mut union: BTreeMap<ImageId, Arc<ImageNode>> = BTreeMap::new();
    for cell in cells {
        for node in cell_members(stores, cell) {
            union.entry(node.id().clone()).or_insert(node);
        }
    }
    union.into_values().collect()
}

impl<P: DataProvider> Graph<P> {
    // ─── Images ──────────────────────────────────────────────────────────

    /// Fetch a complete record for an image the graph has never seen.
    ///
    /// Fails with [`GraphError::AlreadyExists`] if the image is held in any
    /// state.
    pub async fn cache_full(&self, id: &ImageId) -> GraphResult<Arc<ImageNode>> {
        if self.has_image(id) {
            return Err(GraphError::AlreadyExists(id.clone()));
        }

        let graph = self.clone();
        let image_id = id.clone();
        self.inner
            .images
            .dedupe(RequestKey::Full(id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_full(image_id, token).await }.boxed()
            })
            .await
    }

    async fn fetch_full(&self, id: ImageId, token: CancellationToken) -> GraphResult<Arc<ImageNode>> {
        debug!(image_id = %id, "Fetching full image");
        let records = abortable(
            token.clone(),
            self.inner
                .provider
                .fetch_full_images(slice::from_ref(&id), &token),
        )
        .await?;
        let record = records
            .into_iter()
            .find(|record| record.id() == &id)
            .ok_or_else(|| GraphError::MissingFromResponse(id.clone()))?;

        // A cell fetch may have inserted the core record meanwhile; it is
        // upgraded in place
        let node = self.inner.stores.lock().nodes.insert_full(record);
        self.emit(GraphEvent::ImageCached { image_id: id });
        Ok(node)
    }

    /// Complete a core-only image with its fill fields.
    pub async fn cache_fill(&self, id: &ImageId) -> GraphResult<Arc<ImageNode>> {
        if self.is_caching_full(id) {
            return Err(GraphError::AlreadyFetchingFull(id.clone()));
        }
        {
            let stores = self.inner.stores.lock();
            let node = stores
                .nodes
                .get(id)
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
            if node.is_complete() {
                return Err(GraphError::AlreadyComplete(id.clone()));
            }
        }

        let graph = self.clone();
        let image_id = id.clone();
        self.inner
            .images
            .dedupe(RequestKey::Fill(id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_fill(image_id, token).await }.boxed()
            })
            .await
    }

    async fn fetch_fill(&self, id: ImageId, token: CancellationToken) -> GraphResult<Arc<ImageNode>> {
        debug!(image_id = %id, "Fetching fill");
        let items = abortable(
            token.clone(),
            self.inner
                .provider
                .fetch_spatial_images(slice::from_ref(&id), &token),
        )
        .await?;
        let item = items
            .into_iter()
            .find(|item| item.id == id)
            .ok_or_else(|| GraphError::MissingFromResponse(id.clone()))?;

        let node = {
            let mut stores = self.inner.stores.lock();
            let complete = stores.nodes.get(&id).map(|node| node.is_complete());
            match complete {
                None => return Err(GraphError::ImageNotFound(id)),
                Some(true) => stores.nodes.touch(&id),
                Some(false) => Some(stores.nodes.fill(&id, item.spatial)?),
            }
        };
        let node = node.ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
        self.emit(GraphEvent::ImageCached { image_id: id });
        Ok(node)
    }

    // ─── Cells ───────────────────────────────────────────────────────────

    /// Fetch every covering cell of an image that has not been fetched yet.
    ///
    /// Resolves with the members of the covering cells. The covering set is
    /// computed once per image and reused until spatial edges are reset.
    pub async fn cache_tiles(&self, id: &ImageId) -> GraphResult<Vec<Arc<ImageNode>>> {
        let cells = {
            let mut guard = self.inner.stores.lock();
            let stores = &mut *guard;
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

            if cells.iter().all(|cell| stores.cells.is_fetched(cell)) {
                let members = union_members(stores, &cells);
                touch_all(stores, &members);
                return Ok(members);
            }
            cells
        };

        let graph = self.clone();
        self.inner
            .cells
            .dedupe(RequestKey::Tiles(id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_cells(cells.into_iter().collect(), token).await }.boxed()
            })
            .await
    }

    /// Fetch one cell's membership.
    ///
    /// A cell that has already been fetched resolves with its members without
    /// a fetch.
    pub async fn cache_cell(&self, cell_id: &CellId) -> GraphResult<Vec<Arc<ImageNode>>> {
        {
            let mut guard = self.inner.stores.lock();
            let stores = &mut *guard;
            if stores.cells.is_fetched(cell_id) {
                stores.cells.touch(cell_id);
                let members = cell_members(stores, cell_id);
                touch_all(stores, &members);
                return Ok(members);
            }
        }
        self.request_cell(cell_id.clone()).await
    }

    /// Fetch every cell covering a bounding box.
    ///
    /// Resolves with the union of the covering cells' members.
    pub async fn cache_bounding_box(
        &self,
        sw: &LngLat,
        ne: &LngLat,
    ) -> GraphResult<Vec<Arc<ImageNode>>> {
        let cell_ids = self.inner.cell_index.bbox_to_cell_ids(sw, ne)?;

        let graph = self.clone();
        self.inner
            .cells
            .dedupe(RequestKey::bounding_box(sw, ne), move || {
                let token = graph.token();
                async move { graph.fetch_cells(cell_ids, token).await }.boxed()
            })
            .await
    }

    /// Re-fetch the membership of every known cell in `cell_ids`.
    ///
    /// Unknown cells are skipped. Newly discovered images are added; images
    /// already held are left as they are. Returns the cells that were
    /// fetched.
    pub async fn update_cells(&self, cell_ids: &[CellId]) -> GraphResult<Vec<CellId>> {
        let known: Vec<CellId> = {
            let stores = self.inner.stores.lock();
            cell_ids
                .iter()
                .filter(|cell_id| stores.cells.contains(cell_id))
                .cloned()
                .collect()
        };

        try_join_all(known.iter().cloned().map(|cell_id| self.request_cell(cell_id))).await?;
        Ok(known)
    }

    fn request_cell(&self, cell_id: CellId) -> SharedRequest<Vec<Arc<ImageNode>>> {
        let graph = self.clone();
        self.inner
            .cells
            .dedupe(RequestKey::Cell(cell_id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_cell(cell_id, token).await }.boxed()
            })
    }

    async fn fetch_cell(&self, cell_id: CellId, token: CancellationToken) -> GraphResult<Vec<Arc<ImageNode>>> {
        debug!(cell_id = %cell_id, "Fetching cell");
        let response = abortable(
            token.clone(),
            self.inner.provider.fetch_core_images(&cell_id, &token),
        )
        .await?;

        let (members, added) = {
            let mut guard = self.inner.stores.lock();
            let stores = &mut *guard;
            let mut added = 0;
            let mut ids = Vec::with_capacity(response.images.len());
            for core in response.images {
                ids.push(core.id.clone());
                let (_, inserted) = stores.nodes.insert_core(core);
                if inserted {
                    added += 1;
                }
            }
            stores.cells.populate(&cell_id, ids);
            (cell_members(stores, &cell_id), added)
        };

        debug!(cell_id = %cell_id, members = members.len(), added, "Cell cached");
        self.emit(GraphEvent::CellCached { cell_id, added });
        Ok(members)
    }

    async fn fetch_cells(
        &self,
        cell_ids: Vec<CellId>,
        token: CancellationToken,
    ) -> GraphResult<Vec<Arc<ImageNode>>> {
        let pending: Vec<CellId> = {
            let stores = self.inner.stores.lock();
            cell_ids
                .iter()
                .filter(|cell_id| !stores.cells.is_fetched(cell_id))
                .cloned()
                .collect()
        };
        let requests = try_join_all(pending.into_iter().map(|cell_id| self.request_cell(cell_id)));
        abortable(token, requests).await?;

        let mut guard = self.inner.stores.lock();
        let stores = &mut *guard;
        for cell_id in &cell_ids {
            stores.cells.touch(cell_id);
        }
        let members = union_members(stores, &cell_ids);
        touch_all(stores, &members);
        Ok(members)
    }

    // ─── Sequences ───────────────────────────────────────────────────────

    /// Fetch a sequence's ordered id list. A held sequence resolves without
    /// a fetch.
    pub async fn cache_sequence(&self, id: &SequenceId) -> GraphResult<Arc<Sequence>> {
        if let Some(sequence) = self.inner.stores.lock().sequences.touch(id) {
            return Ok(sequence);
        }

        let graph = self.clone();
        let sequence_id = id.clone();
        self.inner
            .sequences
            .dedupe(RequestKey::Sequence(id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_sequence(sequence_id, token).await }.boxed()
            })
            .await
    }

    async fn fetch_sequence(&self, id: SequenceId, token: CancellationToken) -> GraphResult<Arc<Sequence>> {
        debug!(sequence_id = %id, "Fetching sequence");
        let response = abortable(
            token.clone(),
            self.inner.provider.fetch_sequence(&id, &token),
        )
        .await?;

        let sequence = self
            .inner
            .stores
            .lock()
            .sequences
            .insert(Sequence::new(id.clone(), response.image_ids));
        self.emit(GraphEvent::SequenceCached { sequence_id: id });
        Ok(sequence)
    }

    /// Fetch the owning sequence of an image.
    pub async fn cache_image_sequence(&self, id: &ImageId) -> GraphResult<Arc<Sequence>> {
        let sequence_id = {
            let stores = self.inner.stores.lock();
            let node = stores
                .nodes
                .get(id)
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
            if stores.sequences.contains(node.sequence_id()) {
                return Err(GraphError::already_cached(CacheResource::ImageSequence, id));
            }
            node.sequence_id().clone()
        };
        if self.is_caching_sequence(&sequence_id) {
            return Err(GraphError::already_caching(CacheResource::ImageSequence, id));
        }

        self.cache_sequence(&sequence_id).await
    }

    /// Fetch complete records for every image of a held sequence.
    ///
    /// Batches are planned around `reference` when given and fetched with
    /// bounded concurrency. Each landed batch is applied as it arrives;
    /// members already complete are skipped. The sequence is flagged as
    /// having its images cached only after every batch has landed. On
    /// failure, batches already applied stay applied.
    pub async fn cache_sequence_images(
        &self,
        id: &SequenceId,
        reference: Option<&ImageId>,
    ) -> GraphResult<()> {
        let sequence = {
            let stores = self.inner.stores.lock();
            let sequence = stores
                .sequences
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::SequenceNotFound(id.clone()))?;
            if stores.sequences.has_images_cached(id) {
                return Err(GraphError::already_cached(CacheResource::SequenceImages, id));
            }
            sequence
        };
        if self.is_caching_sequence_images(id) {
            return Err(GraphError::already_caching(CacheResource::SequenceImages, id));
        }

        let batches = self.inner.sequence_planner.plan(&sequence.image_ids, reference);
        let graph = self.clone();
        let sequence_id = id.clone();
        self.inner
            .areas
            .dedupe(RequestKey::SequenceImages(id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_sequence_images(sequence_id, batches, token).await }.boxed()
            })
            .await
    }

    async fn fetch_sequence_images(
        &self,
        sequence_id: SequenceId,
        batches: Vec<Vec<ImageId>>,
        token: CancellationToken,
    ) -> GraphResult<()> {
        debug!(sequence_id = %sequence_id, batches = batches.len(), "Fetching sequence images");
        let mut landed = stream::iter(batches)
            .map(|batch| self.fetch_image_batch(batch, token.clone()))
            .buffer_unordered(self.inner.config.max_concurrent_batches);

        while let Some(result) = landed.next().await {
            match result {
                Ok(image_ids) if image_ids.is_empty() => {}
                Ok(image_ids) => self.emit(GraphEvent::SequenceImagesBatch {
                    sequence_id: sequence_id.clone(),
                    image_ids,
                }),
                Err(e) => {
                    warn!(sequence_id = %sequence_id, error = %e, "Sequence image batch failed");
                    return Err(e);
                }
            }
        }

        self.inner
            .stores
            .lock()
            .sequences
            .mark_images_cached(&sequence_id);
        self.emit(GraphEvent::SequenceImagesCached { sequence_id });
        Ok(())
    }

    async fn fetch_image_batch(
        &self,
        batch: Vec<ImageId>,
        token: CancellationToken,
    ) -> GraphResult<Vec<ImageId>> {
        let needed: Vec<ImageId> = {
            let stores = self.inner.stores.lock();
            batch
                .into_iter()
                .filter(|id| !stores.nodes.get(id).is_some_and(|n| n.is_complete()))
                .collect()
        };
        if needed.is_empty() {
            return Ok(needed);
        }

        debug!(batch_size = needed.len(), "Fetching image batch");
        let records = abortable(
            token.clone(),
            self.inner.provider.fetch_full_images(&needed, &token),
        )
        .await?;

        let returned: BTreeSet<ImageId> = records.iter().map(|r| r.id().clone()).collect();
        {
            let mut stores = self.inner.stores.lock();
            for record in records {
                stores.nodes.insert_full(record);
            }
        }

        match needed.iter().find(|id| !returned.contains(id)) {
            Some(missing) => Err(GraphError::MissingFromResponse(missing.clone())),
            None => Ok(needed),
        }
    }

    // ─── Spatial area ────────────────────────────────────────────────────

    /// Fill every incomplete image in the covering cells of an image.
    ///
    /// Requires the image's tiles to be cached. Resolves immediately when
    /// the area is already complete.
    pub async fn cache_spatial_area(&self, id: &ImageId) -> GraphResult<()> {
        {
            let mut guard = self.inner.stores.lock();
            let stores = &mut *guard;
            let node = stores
                .nodes
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::ImageNotFound(id.clone()))?;
            let tiles = stores.cells.is_tile_complete(
                &node,
                self.inner.cell_index.as_ref(),
                self.inner.geodesy.as_ref(),
                self.threshold(),
            )?;
            if !tiles {
                return Err(GraphError::TilesNotCached(id.clone()));
            }
            if self.spatial_area_complete(stores, id)? {
                return Ok(());
            }
        }

        let graph = self.clone();
        let image_id = id.clone();
        self.inner
            .areas
            .dedupe(RequestKey::SpatialArea(id.clone()), move || {
                let token = graph.token();
                async move { graph.fetch_spatial_area(image_id, token).await }.boxed()
            })
            .await
    }

    async fn fetch_spatial_area(&self, id: ImageId, token: CancellationToken) -> GraphResult<()> {
        let pending: Vec<ImageId> = {
            let stores = self.inner.stores.lock();
            let cells = stores
                .cells
                .cached_covering(&id)
                .cloned()
                .ok_or_else(|| GraphError::TilesNotCached(id.clone()))?;
            member_ids(&stores, &cells)
                .into_iter()
                .filter(|member| stores.nodes.get(member).is_some_and(|n| !n.is_complete()))
                .collect()
        };

        // Images with a fill already in flight join it instead of being refetched.
        let mut attached = Vec::new();
        let mut unclaimed = Vec::with_capacity(pending.len());
        for member in pending {
            match self.inner.images.attach(&RequestKey::Fill(member.clone())) {
                Some(fill) => attached.push(fill),
                None => unclaimed.push(member),
            }
        }

        let batches = self.inner.spatial_planner.plan(&unclaimed, None);
        debug!(
            image_id = %id,
            images = unclaimed.len(),
            attached = attached.len(),
            batches = batches.len(),
            "Filling spatial area"
        );

        let mut landed = stream::iter(batches)
            .map(|batch| self.fetch_fill_batch(batch, token.clone()))
            .buffer_unordered(self.inner.config.max_concurrent_batches);
        while let Some(result) = landed.next().await {
            if let Err(e) = result {
                warn!(image_id = %id, error = %e, "Spatial area batch failed");
                return Err(e);
            }
        }
        if let Err(e) = abortable(token.clone(), try_join_all(attached)).await {
            warn!(image_id = %id, error = %e, "Spatial area fill failed");
            return Err(e);
        }

        self.emit(GraphEvent::SpatialAreaCached { image_id: id });
        Ok(())
    }

    async fn fetch_fill_batch(&self, batch: Vec<ImageId>, token: CancellationToken) -> GraphResult<()> {
        let items = abortable(
            token.clone(),
            self.inner.provider.fetch_spatial_images(&batch, &token),
        )
        .await?;

        let mut filled = Vec::with_capacity(items.len());
        {
            let mut stores = self.inner.stores.lock();
            for item in items {
                let incomplete = stores.nodes.get(&item.id).is_some_and(|n| !n.is_complete());
                if incomplete {
                    stores.nodes.fill(&item.id, item.spatial)?;
                    filled.push(item.id);
                }
            }
        }

        for image_id in filled {
            self.emit(GraphEvent::ImageCached { image_id });
        }
        Ok(())
    }
}
