//! Graph Cache Replay
//!
//! Loads a dataset into an in-memory provider and drives a graph through a
//! viewer-like session: cache the dataset's bounding box, every sequence
//! with its images, then the spatial area and edges around the first image
//! of each sequence. Finishes with an eviction pass and prints a JSON
//! summary on stdout.
//!
//! ## Usage
//!
//! ```text
//! graph_cache_replay <dataset.json> [config.json]
//! ```
//!
//! ## Logging Configuration
//!
//! Set `RUST_LOG` to control log levels:
//! - `RUST_LOG=info` - Default, logs fetches and eviction passes
//! - `RUST_LOG=debug` - Verbose, includes request coalescing
//!
//! Set `LOG_FORMAT` to control output format:
//! - `LOG_FORMAT=json` - JSON structured logs (default)
//! - `LOG_FORMAT=pretty` - Human-readable logs for development
//!
//! Logs go to stderr so the summary on stdout stays machine-readable.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imagery_graph::{
    Dataset, EvictionReport, Graph, GraphConfiguration, GraphStats, GridCellIndex, ImageId,
    InMemoryDataProvider, LngLat,
};

/// Initialize the tracing subscriber based on environment configuration.
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,imagery_graph=info".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[derive(Serialize)]
struct ReplaySummary {
    before_eviction: GraphStats,
    after_eviction: GraphStats,
    eviction: EvictionReport,
    spatial_edges: usize,
    elapsed_ms: u64,
}

/// South-west and north-east corners enclosing every image of the dataset.
fn dataset_bounds(dataset: &Dataset) -> Option<(LngLat, LngLat)> {
    let mut positions = dataset.images.iter().map(|record| record.core.position);
    let first = positions.next()?;
    let (sw, ne) = positions.fold((first, first), |(sw, ne), p| {
        (
            LngLat::new(sw.lng.min(p.lng), sw.lat.min(p.lat)),
            LngLat::new(ne.lng.max(p.lng), ne.lat.max(p.lat)),
        )
    });
    Some((sw, ne))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let dataset_path = args
        .next()
        .ok_or("usage: graph_cache_replay <dataset.json> [config.json]")?;
    let config = match args.next() {
        Some(path) => GraphConfiguration::from_json(&std::fs::read_to_string(path)?)?,
        None => GraphConfiguration::default(),
    };

    let dataset: Dataset = serde_json::from_str(&std::fs::read_to_string(&dataset_path)?)?;
    info!(
        path = %dataset_path,
        images = dataset.images.len(),
        sequences = dataset.sequences.len(),
        "Dataset loaded"
    );

    let bounds = dataset_bounds(&dataset);
    let sequence_ids: Vec<_> = dataset.sequences.iter().map(|s| s.id.clone()).collect();

    let provider = Arc::new(InMemoryDataProvider::from_dataset(
        dataset,
        &GridCellIndex::default(),
    ));
    let graph = Graph::new(provider, config)?;
    let start = Instant::now();

    if let Some((sw, ne)) = bounds {
        let nodes = graph.cache_bounding_box(&sw, &ne).await?;
        let inside = nodes
            .iter()
            .filter(|node| node.position().within(&sw, &ne))
            .count();
        info!(images = nodes.len(), inside, "Bounding box cached");
    }

    let mut keep: Vec<ImageId> = Vec::new();
    let mut spatial_edges = 0;
    for sequence_id in &sequence_ids {
        let sequence = graph.cache_sequence(sequence_id).await?;
        let Some(first) = sequence.image_ids.first().cloned() else {
            continue;
        };
        graph.cache_sequence_images(sequence_id, Some(&first)).await?;

        graph.initialize_cache(&first)?;
        graph.cache_sequence_edges(&first)?;
        graph.cache_tiles(&first).await?;
        graph.cache_spatial_area(&first).await?;
        match graph.cache_spatial_edges(&first) {
            Ok(node) => spatial_edges += node.spatial_edges().edges.len(),
            Err(e) => warn!(image_id = %first, error = %e, "Spatial edges skipped"),
        }
        keep.push(first);
    }

    let before_eviction = graph.stats();
    let eviction = graph.uncache(&keep, sequence_ids.first());
    let summary = ReplaySummary {
        before_eviction,
        after_eviction: graph.stats(),
        eviction,
        spatial_edges,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
