use std::ops::ControlFlow;

use leafprop::{
    CSR, CumCSR, Distance, EmbeddingPropagation, EmbeddingStore, FeatureAggregator,
    FeatureStore, Loss, NodeEmbedder
};

// 0 - 1 - 2 - 3 - 0
fn build_ring() -> (CumCSR, FeatureStore) {
    let mut edges = Vec::new();
    for (f, t) in [(0, 1), (1, 2), (2, 3), (3, 0)] {
        edges.push((f, t, 1.));
        edges.push((t, f, 1.));
    }
    let graph = CumCSR::convert(CSR::construct_from_edges(edges));

    let mut features = FeatureStore::new(4, "feat".into());
    for node in 0..4 {
        features.set_features(node, vec![format!("f{}", node)]);
    }
    (graph, features)
}

fn build_ep(passes: usize, alpha: f32, seed: u64) -> EmbeddingPropagation {
    EmbeddingPropagation {
        alpha,
        loss: Loss::MarginLoss { margin: 1., negatives: 2 },
        batch_size: 4,
        dims: 8,
        passes,
        hard_negatives: 0,
        valid_pct: 0.,
        seed,
        indicator: false,
        ..Default::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    1. - Distance::Cosine.compute(a, b)
}

fn feature_embedding(features: &FeatureStore, embeddings: &EmbeddingStore, node: usize) -> Vec<f32> {
    let feat = features.get_feature_id("feat", &format!("f{}", node)).unwrap();
    embeddings.get_embedding(feat)
}

#[test]
fn ring_neighbors_end_up_closer_than_diagonals() {
    let (graph, features) = build_ring();
    for alpha in [0.1f32, 0.9] {
        for seed in 0..16u64 {
            let mut losses = Vec::new();
            let embeddings = build_ep(50, alpha, seed).learn_with_observer(
                &graph, &features, None, &FeatureAggregator::Averaged, |stats| {
                    losses.push(stats.train_loss);
                    ControlFlow::Continue(())
                }).unwrap();
            assert_eq!(losses.len(), 50);

            let emb = |node| feature_embedding(&features, &embeddings, node);
            let adjacent = [(0, 1), (1, 2), (2, 3), (3, 0)].iter()
                .map(|(a, b)| cosine(&emb(*a), &emb(*b)))
                .fold(f32::INFINITY, f32::min);
            let diagonal = cosine(&emb(0), &emb(2)).max(cosine(&emb(1), &emb(3)));
            assert!(adjacent > diagonal,
                "alpha: {}, seed: {}, closest adjacent: {}, farthest diagonal: {}",
                alpha, seed, adjacent, diagonal);
        }
    }
}

#[test]
fn node_embeddings_match_single_features() {
    let (graph, features) = build_ring();
    let embeddings = build_ep(5, 0.1, 2023)
        .learn(&graph, &features, None, &FeatureAggregator::Averaged).unwrap();

    let agg = FeatureAggregator::Averaged;
    let (nodes, report) = NodeEmbedder::new(&agg, false).embed(&features, &embeddings).unwrap();
    assert!(report.is_complete());
    for node in 0..4 {
        assert_eq!(nodes.get_embedding(node), feature_embedding(&features, &embeddings, node));
    }
}

#[test]
fn zero_passes_returns_warm_start() {
    let (graph, features) = build_ring();
    let data: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
    let warm = EmbeddingStore::from_vec(8, data.clone(), Distance::Cosine);

    let out = build_ep(0, 0.1, 2023).learn(&graph, &features, Some(warm), &FeatureAggregator::Averaged).unwrap();
    assert_eq!(out.to_vec(), data);
    assert_eq!(out.dims(), 8);
}
