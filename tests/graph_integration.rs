//! Integration tests for graph caching, request deduplication and batching.
//!
//! Every test drives a [`Graph`] over an [`InMemoryDataProvider`] and checks
//! both the graph state and the fetches the provider actually received.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use imagery_graph::{
    CacheResource, CellId, CoreImage, EdgeDirection, Graph, GraphConfiguration, GraphError,
    GraphEvent, ImageId, ImageRecord, InMemoryDataProvider, LngLat, Sequence, SequenceId,
    SpatialImage,
};

// ─── Fixtures ────────────────────────────────────────────────────────────

fn make_record(id: &str, sequence: &str, lng: f64, lat: f64) -> ImageRecord {
    ImageRecord {
        core: CoreImage {
            id: ImageId::from(id),
            position: LngLat::new(lng, lat),
            sequence_id: SequenceId::from(sequence),
        },
        spatial: SpatialImage {
            computed_position: None,
            altitude: 0.0,
            compass_angle: 0.0,
            computed_compass_angle: None,
            captured_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            cluster_id: Some("cluster".to_string()),
            merge_id: Some("merge".to_string()),
            camera_type: Default::default(),
            width: 2048,
            height: 1536,
        },
    }
}

/// Cell of the default grid holding every fixture near (0.005, 0.005).
fn home_cell() -> CellId {
    CellId::from("0:0")
}

/// Provider with sequence `s` = [a, b, c], 5.5 m apart heading north.
fn make_abc_provider() -> Arc<InMemoryDataProvider> {
    let provider = InMemoryDataProvider::new();
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        let record = make_record(id, "s", 0.005, 0.005 + i as f64 * 0.00005);
        provider.add_image(home_cell(), record);
    }
    provider.add_sequence(Sequence::new(
        SequenceId::from("s"),
        vec![ImageId::from("a"), ImageId::from("b"), ImageId::from("c")],
    ));
    Arc::new(provider)
}

/// Provider with one sequence `long` of `n` images named `i0000`, `i0001`, ...
fn make_long_sequence_provider(n: usize) -> (Arc<InMemoryDataProvider>, Vec<ImageId>) {
    let provider = InMemoryDataProvider::new();
    let ids: Vec<ImageId> = (0..n).map(|i| ImageId::new(format!("i{i:04}"))).collect();
    for (i, id) in ids.iter().enumerate() {
        let record = make_record(id.as_str(), "long", 0.002, 0.002 + i as f64 * 0.000001);
        provider.add_image(home_cell(), record);
    }
    provider.add_sequence(Sequence::new(SequenceId::from("long"), ids.clone()));
    (Arc::new(provider), ids)
}

fn make_graph(provider: &Arc<InMemoryDataProvider>) -> Graph<InMemoryDataProvider> {
    Graph::new(Arc::clone(provider), GraphConfiguration::default()).unwrap()
}

/// Yield until `ready` holds.
async fn wait_until(mut ready: impl FnMut() -> bool) {
    while !ready() {
        tokio::task::yield_now().await;
    }
}

fn batch_lengths(batches: &[Vec<ImageId>]) -> Vec<usize> {
    let mut lengths: Vec<usize> = batches.iter().map(Vec::len).collect();
    lengths.sort_unstable();
    lengths
}

// ─── Completeness ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_fetch_yields_complete_node() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");

    let node = graph.cache_full(&a).await.unwrap();
    assert!(node.is_complete());
    assert!(graph.has_image(&a));

    let err = graph.cache_full(&a).await.unwrap_err();
    assert_eq!(err, GraphError::AlreadyExists(a));
}

#[tokio::test]
async fn test_tile_then_fill_completes_node() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let b = ImageId::from("b");

    let members = graph.cache_cell(&home_cell()).await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|node| !node.is_complete()));

    let node = graph.cache_fill(&b).await.unwrap();
    assert!(node.is_complete());
    assert!(graph.get_image(&b).unwrap().is_complete());

    let err = graph.cache_fill(&b).await.unwrap_err();
    assert_eq!(err, GraphError::AlreadyComplete(b));
}

#[tokio::test]
async fn test_full_then_tile_keeps_node_complete() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");

    graph.cache_full(&a).await.unwrap();
    let members = graph.cache_tiles(&a).await.unwrap();

    assert_eq!(members.len(), 3);
    assert!(graph.has_tiles(&a));
    assert!(graph.get_image(&a).unwrap().is_complete());
    assert!(!graph.get_image(&ImageId::from("b")).unwrap().is_complete());
}

#[tokio::test]
async fn test_tile_then_sequence_images_upgrades_in_place() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let s = SequenceId::from("s");

    graph.cache_cell(&home_cell()).await.unwrap();
    graph.cache_sequence(&s).await.unwrap();
    graph.cache_sequence_images(&s, None).await.unwrap();

    for id in ["a", "b", "c"] {
        assert!(graph.get_image(&ImageId::from(id)).unwrap().is_complete());
    }
    // Cell membership survives the upgrade
    assert_eq!(graph.get_cell_images(&home_cell()).unwrap().len(), 3);
}

#[tokio::test]
async fn test_fill_of_unknown_image_fails() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);

    let err = graph.cache_fill(&ImageId::from("a")).await.unwrap_err();
    assert!(err.is_not_found());
}

// ─── Deduplication ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_bounding_boxes_share_cell_fetches() {
    let provider = make_abc_provider();
    provider.add_image(CellId::from("0:1"), make_record("east", "t", 0.015, 0.005));
    let graph = make_graph(&provider);

    let sw = LngLat::new(0.001, 0.001);
    let ne = LngLat::new(0.011, 0.009);

    provider.hold();
    let release = async {
        wait_until(|| provider.counts().total_core_calls() == 2).await;
        provider.release();
    };
    let (first, second, ()) = tokio::join!(
        graph.cache_bounding_box(&sw, &ne),
        graph.cache_bounding_box(&sw, &ne),
        release,
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(first, second);

    let counts = provider.counts();
    assert_eq!(counts.core_calls(&home_cell()), 1);
    assert_eq!(counts.core_calls(&CellId::from("0:1")), 1);
    assert!(graph.stats().coalesced_requests >= 1);
}

#[tokio::test]
async fn test_overlapping_boxes_fetch_shared_cell_once() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);

    provider.hold();
    let release = async {
        wait_until(|| provider.counts().total_core_calls() >= 1).await;
        provider.release();
    };
    let (small_sw, small_ne) = (LngLat::new(0.004, 0.004), LngLat::new(0.006, 0.006));
    let (large_sw, large_ne) = (LngLat::new(0.001, 0.001), LngLat::new(0.009, 0.009));
    let (small, large, ()) = tokio::join!(
        graph.cache_bounding_box(&small_sw, &small_ne),
        graph.cache_bounding_box(&large_sw, &large_ne),
        release,
    );

    assert_eq!(small.unwrap().len(), 3);
    assert_eq!(large.unwrap().len(), 3);
    assert_eq!(provider.counts().core_calls(&home_cell()), 1);
}

#[tokio::test]
async fn test_degenerate_bounding_box_is_rejected() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);

    let err = graph
        .cache_bounding_box(&LngLat::new(0.01, 0.01), &LngLat::new(0.0, 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidBoundingBox(_)));
    assert_eq!(provider.counts().total_core_calls(), 0);
}

#[tokio::test]
async fn test_fetched_cell_and_sequence_are_served_without_fetch() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let s = SequenceId::from("s");

    graph.cache_cell(&home_cell()).await.unwrap();
    graph.cache_cell(&home_cell()).await.unwrap();
    graph.cache_sequence(&s).await.unwrap();
    graph.cache_sequence(&s).await.unwrap();

    let counts = provider.counts();
    assert_eq!(counts.core_calls(&home_cell()), 1);
    assert_eq!(counts.sequence_calls(&s), 1);
}

// ─── Sequence batching ───────────────────────────────────────────────────

#[tokio::test]
async fn test_sequence_of_200_uses_one_batch() {
    let (provider, ids) = make_long_sequence_provider(200);
    let graph = make_graph(&provider);
    let s = SequenceId::from("long");

    graph.cache_sequence(&s).await.unwrap();
    graph.cache_sequence_images(&s, None).await.unwrap();

    let batches = provider.counts().full_batches;
    assert_eq!(batches, vec![ids]);
    assert!(graph.has_sequence_images(&s));
}

#[tokio::test]
async fn test_sequence_of_201_uses_two_batches() {
    let (provider, _) = make_long_sequence_provider(201);
    let graph = make_graph(&provider);
    let s = SequenceId::from("long");

    graph.cache_sequence(&s).await.unwrap();
    graph.cache_sequence_images(&s, None).await.unwrap();

    assert_eq!(batch_lengths(&provider.counts().full_batches), vec![1, 200]);
    assert_eq!(graph.stats().complete_images, 201);
}

#[tokio::test]
async fn test_reference_batches_prioritize_window() {
    for (position, window) in [(0usize, 0..50usize), (399, 350..400), (200, 175..225)] {
        let (provider, ids) = make_long_sequence_provider(400);
        let graph = make_graph(&provider);
        let s = SequenceId::from("long");

        graph.cache_sequence(&s).await.unwrap();
        graph
            .cache_sequence_images(&s, Some(&ids[position]))
            .await
            .unwrap();

        let batches = provider.counts().full_batches;
        assert!(
            batches.contains(&ids[window].to_vec()),
            "no priority batch around position {position}"
        );
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 400);
        assert_eq!(graph.get_sequence(&s).unwrap().image_ids, ids);
    }
}

#[tokio::test(start_paused = true)]
async fn test_member_order_survives_out_of_order_batches() {
    let (provider, ids) = make_long_sequence_provider(201);
    provider.delay_full_batches_containing(ids[0].clone(), Duration::from_millis(250));
    let graph = make_graph(&provider);
    let s = SequenceId::from("long");
    let mut events = graph.subscribe();

    graph.cache_sequence(&s).await.unwrap();
    graph.cache_sequence_images(&s, None).await.unwrap();

    let mut landed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let GraphEvent::SequenceImagesBatch { image_ids, .. } = event {
            landed.push(image_ids.len());
        }
    }
    assert_eq!(landed, vec![1, 200]);
    assert_eq!(graph.get_sequence(&s).unwrap().image_ids, ids);
}

#[tokio::test]
async fn test_abc_sequence_scenario() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let s = SequenceId::from("s");

    graph.cache_sequence(&s).await.unwrap();
    graph.cache_sequence_images(&s, None).await.unwrap();

    assert!(graph.has_sequence_images(&s));
    assert_eq!(
        graph.get_sequence(&s).unwrap().image_ids,
        vec![ImageId::from("a"), ImageId::from("b"), ImageId::from("c")]
    );
    assert_eq!(provider.counts().full_batches.len(), 1);
    for id in ["a", "b", "c"] {
        assert!(graph.get_image(&ImageId::from(id)).unwrap().is_complete());
    }
}

// ─── State machine violations ────────────────────────────────────────────

#[tokio::test]
async fn test_sequence_images_in_flight_and_done() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let s = SequenceId::from("s");
    graph.cache_sequence(&s).await.unwrap();

    provider.hold();
    let pending = {
        let graph = graph.clone();
        let s = s.clone();
        tokio::spawn(async move { graph.cache_sequence_images(&s, None).await })
    };
    wait_until(|| graph.is_caching_sequence_images(&s)).await;

    let err = graph.cache_sequence_images(&s, None).await.unwrap_err();
    assert_eq!(
        err,
        GraphError::AlreadyCaching {
            resource: CacheResource::SequenceImages,
            id: "s".to_string(),
        }
    );

    provider.release();
    pending.await.unwrap().unwrap();
    assert!(!graph.is_caching_sequence_images(&s));

    let err = graph.cache_sequence_images(&s, None).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::AlreadyCached {
            resource: CacheResource::SequenceImages,
            ..
        }
    ));
}

#[tokio::test]
async fn test_fill_rejected_while_full_in_flight() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");

    provider.hold();
    let pending = {
        let graph = graph.clone();
        let a = a.clone();
        tokio::spawn(async move { graph.cache_full(&a).await })
    };
    wait_until(|| graph.is_caching_full(&a)).await;

    let err = graph.cache_fill(&a).await.unwrap_err();
    assert_eq!(err, GraphError::AlreadyFetchingFull(a.clone()));

    provider.release();
    assert!(pending.await.unwrap().unwrap().is_complete());
}

#[tokio::test]
async fn test_image_sequence_already_cached() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");

    graph.cache_full(&a).await.unwrap();
    assert!(!graph.has_image_sequence(&a));
    graph.cache_image_sequence(&a).await.unwrap();
    assert!(graph.has_image_sequence(&a));

    let err = graph.cache_image_sequence(&a).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::AlreadyCached {
            resource: CacheResource::ImageSequence,
            ..
        }
    ));
}

// ─── Abort and failure ───────────────────────────────────────────────────

#[tokio::test]
async fn test_abort_reaches_every_waiter() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");

    provider.hold();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let graph = graph.clone();
            let a = a.clone();
            tokio::spawn(async move { graph.cache_full(&a).await })
        })
        .collect();
    wait_until(|| !provider.counts().full_batches.is_empty()).await;

    assert_eq!(graph.abort_pending(), 1);
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap_err(), GraphError::Aborted);
    }
    assert!(!graph.is_caching_full(&a));
    assert!(!graph.has_image(&a));

    // A fresh request is not affected by the earlier abort
    provider.release();
    assert!(graph.cache_full(&a).await.unwrap().is_complete());
}

#[tokio::test]
async fn test_failed_fetch_is_not_cached() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);

    provider.fail_on("0:0");
    let err = graph.cache_cell(&home_cell()).await.unwrap_err();
    assert!(matches!(err, GraphError::UpstreamFailure(_)));
    assert!(graph.get_cell_images(&home_cell()).is_err());

    provider.clear_failures();
    let members = graph.cache_cell(&home_cell()).await.unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(provider.counts().core_calls(&home_cell()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_leaves_sequence_partially_cached() {
    let (provider, ids) = make_long_sequence_provider(201);
    // The failing batch lands after the first one
    provider.delay_full_batches_containing(ids[200].clone(), Duration::from_millis(100));
    provider.fail_on(ids[200].as_str());
    let graph = make_graph(&provider);
    let s = SequenceId::from("long");

    graph.cache_sequence(&s).await.unwrap();
    let err = graph.cache_sequence_images(&s, None).await.unwrap_err();
    assert!(matches!(err, GraphError::UpstreamFailure(_)));
    assert!(!graph.has_sequence_images(&s));
    assert!(graph.has_image(&ids[0]));
    assert!(!graph.has_image(&ids[200]));

    provider.clear_failures();
    graph.cache_sequence_images(&s, None).await.unwrap();
    assert!(graph.has_sequence_images(&s));
    assert_eq!(graph.stats().complete_images, 201);
}

// ─── Cell refresh ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_cells_merges_new_members() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);

    graph.cache_cell(&home_cell()).await.unwrap();
    provider.add_image(home_cell(), make_record("d", "s", 0.006, 0.006));

    let updated = graph
        .update_cells(&[home_cell(), CellId::from("9:9")])
        .await
        .unwrap();
    assert_eq!(updated, vec![home_cell()]);
    assert_eq!(graph.get_cell_images(&home_cell()).unwrap().len(), 4);
    assert_eq!(provider.counts().core_calls(&home_cell()), 2);
}

// ─── Spatial area and edges ──────────────────────────────────────────────

#[tokio::test]
async fn test_spatial_area_then_edges() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");
    let b = ImageId::from("b");
    let s = SequenceId::from("s");

    graph.cache_full(&a).await.unwrap();
    let err = graph.cache_spatial_area(&a).await.unwrap_err();
    assert_eq!(err, GraphError::TilesNotCached(a.clone()));

    graph.cache_tiles(&a).await.unwrap();
    assert!(!graph.has_spatial_area(&a));
    let err = graph.cache_spatial_edges(&a).unwrap_err();
    assert_eq!(err, GraphError::SpatialAreaNotCached(a.clone()));

    graph.cache_spatial_area(&a).await.unwrap();
    assert!(graph.has_spatial_area(&a));
    assert_eq!(provider.counts().spatial_batches.len(), 1);

    graph.initialize_cache(&a).unwrap();
    assert!(graph.has_initialized_cache(&a));
    assert!(graph.initialize_cache(&a).is_err());

    assert_eq!(
        graph.cache_sequence_edges(&a).unwrap_err(),
        GraphError::SequenceNotCached(a.clone())
    );
    graph.cache_sequence(&s).await.unwrap();
    let node = graph.cache_sequence_edges(&a).unwrap();
    assert_eq!(node.sequence_edges().edges.len(), 1);
    assert_eq!(node.sequence_edges().edges[0].direction, EdgeDirection::Next);

    let node = graph.cache_spatial_edges(&a).unwrap();
    assert!(node.spatial_edges().cached);
    assert!(node
        .spatial_edges()
        .edges
        .iter()
        .any(|edge| edge.target == b && edge.direction == EdgeDirection::StepForward));
    assert!(graph.cache_spatial_edges(&a).is_err());
}

#[tokio::test]
async fn test_spatial_area_joins_in_flight_fill() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");
    let b = ImageId::from("b");
    let c = ImageId::from("c");

    graph.cache_cell(&home_cell()).await.unwrap();
    graph.cache_tiles(&a).await.unwrap();

    provider.hold();
    let fill = {
        let graph = graph.clone();
        let b = b.clone();
        tokio::spawn(async move { graph.cache_fill(&b).await })
    };
    wait_until(|| graph.is_caching_fill(&b)).await;
    wait_until(|| provider.counts().spatial_batches.len() == 1).await;

    let area = {
        let graph = graph.clone();
        let a = a.clone();
        tokio::spawn(async move { graph.cache_spatial_area(&a).await })
    };
    wait_until(|| provider.counts().spatial_batches.len() == 2).await;

    provider.release();
    assert!(fill.await.unwrap().unwrap().is_complete());
    area.await.unwrap().unwrap();

    let batches = provider.counts().spatial_batches;
    assert_eq!(batches.iter().filter(|batch| batch.contains(&b)).count(), 1);
    let mut area_batch = batches[1].clone();
    area_batch.sort();
    assert_eq!(area_batch, vec![a.clone(), c.clone()]);
    assert!(graph.has_spatial_area(&a));
    for id in [&a, &b, &c] {
        assert!(graph.get_image(id).unwrap().is_complete());
    }
}

#[tokio::test]
async fn test_filter_narrows_recomputed_edges() {
    let provider = make_abc_provider();
    let graph = make_graph(&provider);
    let a = ImageId::from("a");
    let b = ImageId::from("b");

    graph.cache_full(&a).await.unwrap();
    graph.cache_tiles(&a).await.unwrap();
    graph.cache_spatial_area(&a).await.unwrap();
    graph.cache_spatial_edges(&a).unwrap();

    let excluded = b.clone();
    graph.set_filter(move |node| node.id() != &excluded);
    graph.reset_spatial_edges();
    assert!(!graph.get_image(&a).unwrap().spatial_edges().cached);

    let node = graph.cache_spatial_edges(&a).unwrap();
    assert!(node.spatial_edges().edges.iter().all(|edge| edge.target != b));
    assert!(!node.spatial_edges().edges.is_empty());
}
