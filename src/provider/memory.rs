//! In-memory data provider for testing and offline replay.
//!
//! Besides serving records, the provider records every fetch it receives and
//! can be told to hold responses, delay specific batches or fail specific
//! keys, which is what concurrency and failure tests need.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{CoreImagesResponse, DataProvider, ProviderError, SpatialImageItem};
use crate::spatial::CellIndex;
use crate::types::{CellId, ImageId, ImageRecord, Sequence, SequenceId};

/// Serializable set of records to serve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    /// Complete image records.
    pub images: Vec<ImageRecord>,
    /// Sequences.
    pub sequences: Vec<Sequence>,
}

/// Fetches observed by an [`InMemoryDataProvider`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchCounts {
    /// Core fetches per cell.
    pub core: BTreeMap<CellId, usize>,
    /// Id lists of every fill fetch, in arrival order.
    pub spatial_batches: Vec<Vec<ImageId>>,
    /// Id lists of every full fetch, in arrival order.
    pub full_batches: Vec<Vec<ImageId>>,
    /// Sequence fetches per sequence.
    pub sequences: BTreeMap<SequenceId, usize>,
}

impl FetchCounts {
    /// Core fetches issued for one cell.
    pub fn core_calls(&self, cell_id: &CellId) -> usize {
        self.core.get(cell_id).copied().unwrap_or(0)
    }

    /// Core fetches issued across all cells.
    pub fn total_core_calls(&self) -> usize {
        self.core.values().sum()
    }

    /// Sequence fetches issued for one sequence.
    pub fn sequence_calls(&self, id: &SequenceId) -> usize {
        self.sequences.get(id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Data {
    cells: BTreeMap<CellId, Vec<ImageId>>,
    images: BTreeMap<ImageId, ImageRecord>,
    sequences: BTreeMap<SequenceId, Sequence>,
}

#[derive(Debug, Default)]
struct Controls {
    failing: HashSet<String>,
    full_delays: HashMap<ImageId, Duration>,
}

/// In-memory data provider.
pub struct InMemoryDataProvider {
    data: RwLock<Data>,
    counts: Mutex<FetchCounts>,
    controls: Mutex<Controls>,
    /// `true` while fetches may complete.
    gate: watch::Sender<bool>,
}

impl InMemoryDataProvider {
    /// Create a new empty provider.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            data: RwLock::new(Data::default()),
            counts: Mutex::new(FetchCounts::default()),
            controls: Mutex::new(Controls::default()),
            gate,
        }
    }

    /// Create a provider serving a dataset, placing each image in the cell
    /// that contains its position.
    pub fn from_dataset(dataset: Dataset, index: &dyn CellIndex) -> Self {
        let provider = Self::new();
        for record in dataset.images {
            let cell_id = index.point_to_cell_id(&record.core.position);
            provider.add_image(cell_id, record);
        }
        for sequence in dataset.sequences {
            provider.add_sequence(sequence);
        }
        provider
    }

    /// Add an image to a cell.
    pub fn add_image(&self, cell_id: CellId, record: ImageRecord) {
        let mut data = self.data.write();
        let members = data.cells.entry(cell_id).or_default();
        if !members.contains(record.id()) {
            members.push(record.id().clone());
        }
        data.images.insert(record.id().clone(), record);
    }

    /// Add a sequence.
    pub fn add_sequence(&self, sequence: Sequence) {
        self.data.write().sequences.insert(sequence.id.clone(), sequence);
    }

    /// Number of images served.
    pub fn num_images(&self) -> usize {
        self.data.read().images.len()
    }

    /// Snapshot of the fetches received so far.
    pub fn counts(&self) -> FetchCounts {
        self.counts.lock().clone()
    }

    /// Hold every fetch until [`release`](Self::release) is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let held fetches complete.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Fail every fetch that names `key` (a cell, image or sequence id).
    pub fn fail_on(&self, key: impl Into<String>) {
        self.controls.lock().failing.insert(key.into());
    }

    /// Stop failing fetches.
    pub fn clear_failures(&self) {
        self.controls.lock().failing.clear();
    }

    /// Delay full fetches whose batch contains `id`.
    pub fn delay_full_batches_containing(&self, id: ImageId, delay: Duration) {
        self.controls.lock().full_delays.insert(id, delay);
    }

    fn check_failure<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<(), ProviderError> {
        let controls = self.controls.lock();
        for key in keys {
            if controls.failing.contains(key) {
                return Err(ProviderError::Upstream(format!("injected failure for {key}")));
            }
        }
        Ok(())
    }

    async fn wait_for_gate(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut open = self.gate.subscribe();
        loop {
            if *open.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Aborted),
                changed = open.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for InMemoryDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataProvider for InMemoryDataProvider {
    async fn fetch_core_images(
        &self,
        cell_id: &CellId,
        cancel: &CancellationToken,
    ) -> Result<CoreImagesResponse, ProviderError> {
        *self.counts.lock().core.entry(cell_id.clone()).or_default() += 1;
        self.wait_for_gate(cancel).await?;
        self.check_failure([cell_id.as_str()])?;

        let data = self.data.read();
        let images = data
            .cells
            .get(cell_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| data.images.get(id).map(|r| r.core.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(CoreImagesResponse {
            cell_id: cell_id.clone(),
            images,
        })
    }

    async fn fetch_spatial_images(
        &self,
        ids: &[ImageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<SpatialImageItem>, ProviderError> {
        self.counts.lock().spatial_batches.push(ids.to_vec());
        self.wait_for_gate(cancel).await?;
        self.check_failure(ids.iter().map(ImageId::as_str))?;

        let data = self.data.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                data.images.get(id).map(|r| SpatialImageItem {
                    id: id.clone(),
                    spatial: r.spatial.clone(),
                })
            })
            .collect())
    }

    async fn fetch_full_images(
        &self,
        ids: &[ImageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<ImageRecord>, ProviderError> {
        self.counts.lock().full_batches.push(ids.to_vec());

        let delay = {
            let controls = self.controls.lock();
            ids.iter().filter_map(|id| controls.full_delays.get(id)).max().copied()
        };
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.wait_for_gate(cancel).await?;
        self.check_failure(ids.iter().map(ImageId::as_str))?;

        let data = self.data.read();
        Ok(ids.iter().filter_map(|id| data.images.get(id).cloned()).collect())
    }

    async fn fetch_sequence(
        &self,
        id: &SequenceId,
        cancel: &CancellationToken,
    ) -> Result<Sequence, ProviderError> {
        *self.counts.lock().sequences.entry(id.clone()).or_default() += 1;
        self.wait_for_gate(cancel).await?;
        self.check_failure([id.as_str()])?;

        self.data
            .read()
            .sequences
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Upstream(format!("Sequence not found: {id}")))
    }
}
