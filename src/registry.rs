//! Request deduplication.
//!
//! When several callers ask for the same resource while a fetch for it is in
//! flight, only one fetch runs and every caller receives its result.
//!
//! ```text
//! cache_cell(c) ─┐
//!                │                          DataProvider
//! cache_cell(c) ─┼──► RequestRegistry ─────► fetch_core_images(c)
//!                │        │                        │
//! cache_tiles(x)─┘        ▼                        ▼
//!                  [all callers hold the     [one fetch]
//!                   same Shared future]◄───────────┘
//! ```
//!
//! ## Lifetime of an entry
//!
//! The registry mirrors the lifetime of the factory's future: the entry is
//! registered when the first caller arrives and removed as soon as the future
//! settles, successfully or not. Failures are never cached, so the next call
//! after an error starts a new fetch. The registry has no timeout; aborting is
//! the caller's concern.
//!
//! Each entry is driven by its own spawned task, so a fetch runs to completion
//! (or abort) even when every caller stops waiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::GraphResult;
use crate::types::{CellId, ImageId, LngLat, SequenceId};

/// Future handed to every caller attached to one request.
pub type SharedRequest<T> = Shared<BoxFuture<'static, GraphResult<T>>>;

/// Discriminated key of a deduplicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// Full fetch of one image.
    Full(ImageId),
    /// Fill fetch of one image.
    Fill(ImageId),
    /// Covering cells of one image.
    Tiles(ImageId),
    /// Fill of every image around one image.
    SpatialArea(ImageId),
    /// Membership of one cell.
    Cell(CellId),
    /// Id list of one sequence.
    Sequence(SequenceId),
    /// Batched full fetch of a sequence's images.
    SequenceImages(SequenceId),
    /// Covering cells of a box, as raw coordinate bits.
    BoundingBox([u64; 4]),
}

impl RequestKey {
    /// Key for a bounding box request.
    pub fn bounding_box(sw: &LngLat, ne: &LngLat) -> Self {
        Self::BoundingBox([
            sw.lng.to_bits(),
            sw.lat.to_bits(),
            ne.lng.to_bits(),
            ne.lat.to_bits(),
        ])
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(id) => write!(f, "full:{id}"),
            Self::Fill(id) => write!(f, "fill:{id}"),
            Self::Tiles(id) => write!(f, "tiles:{id}"),
            Self::SpatialArea(id) => write!(f, "spatial_area:{id}"),
            Self::Cell(id) => write!(f, "cell:{id}"),
            Self::Sequence(id) => write!(f, "sequence:{id}"),
            Self::SequenceImages(id) => write!(f, "sequence_images:{id}"),
            Self::BoundingBox([a, b, c, d]) => write!(
                f,
                "bbox:{},{},{},{}",
                f64::from_bits(*a),
                f64::from_bits(*b),
                f64::from_bits(*c),
                f64::from_bits(*d)
            ),
        }
    }
}

/// Statistics for monitoring deduplication effectiveness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total requests received.
    pub total_requests: u64,
    /// Requests that attached to an in-flight fetch.
    pub coalesced_requests: u64,
    /// Requests that started a fetch.
    pub new_requests: u64,
}

impl RegistryStats {
    /// Returns the coalescing ratio (0.0 to 1.0).
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }

    /// Sum of two snapshots.
    pub fn merge(self, other: Self) -> Self {
        Self {
            total_requests: self.total_requests + other.total_requests,
            coalesced_requests: self.coalesced_requests + other.coalesced_requests,
            new_requests: self.new_requests + other.new_requests,
        }
    }
}

struct Entry<T: Clone> {
    generation: u64,
    future: SharedRequest<T>,
}

struct Inner<T: Clone> {
    in_flight: HashMap<RequestKey, Entry<T>>,
    next_generation: u64,
}

/// Tracks in-flight requests and hands out shared futures.
pub struct RequestRegistry<T: Clone> {
    inner: Arc<Mutex<Inner<T>>>,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
}

impl<T> RequestRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                in_flight: HashMap::new(),
                next_generation: 0,
            })),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            new_requests: AtomicU64::new(0),
        }
    }

    /// Returns the in-flight future for `key`, or starts one with `factory`.
    ///
    /// `factory` runs with the registry locked and must not call back into
    /// it; it should only build the future. The entry removes itself once the
    /// future settles unless it was cleared and replaced in the meantime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dedupe<F>(&self, key: RequestKey, factory: F) -> SharedRequest<T>
    where
        F: FnOnce() -> BoxFuture<'static, GraphResult<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.in_flight.get(&key) {
            self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                coalesced = self.coalesced_requests.load(Ordering::Relaxed),
                "Coalescing request - attaching to in-flight fetch"
            );
            return entry.future.clone();
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let registry = Arc::clone(&self.inner);
        let settle_key = key.clone();
        let operation = factory();
        let future = async move {
            let result = operation.await;
            let mut inner = registry.lock();
            let current = inner
                .in_flight
                .get(&settle_key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                inner.in_flight.remove(&settle_key);
            }
            result
        }
        .boxed()
        .shared();

        inner.in_flight.insert(
            key.clone(),
            Entry {
                generation,
                future: future.clone(),
            },
        );
        self.new_requests.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %key,
            in_flight_count = inner.in_flight.len(),
            "New request - starting fetch"
        );
        drop(inner);

        tokio::spawn(future.clone());
        future
    }

    /// Returns the in-flight future for `key` without starting a fetch.
    pub fn attach(&self, key: &RequestKey) -> Option<SharedRequest<T>> {
        let inner = self.inner.lock();
        let future = inner.in_flight.get(key)?.future.clone();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Attaching to in-flight fetch");
        Some(future)
    }

    /// Whether a request for `key` is in flight.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.inner.lock().in_flight.contains_key(key)
    }

    /// Keys of every in-flight request.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.inner.lock().in_flight.keys().cloned().collect()
    }

    /// Number of in-flight requests.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Forget every in-flight request. Futures already handed out keep
    /// running; the next call for the same key starts a new fetch.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let cleared = inner.in_flight.len();
        inner.in_flight.clear();
        if cleared > 0 {
            debug!(cleared, "Cleared in-flight requests");
        }
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
        }
    }
}

impl<T> Default for RequestRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
