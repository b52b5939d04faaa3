use rand::prelude::*;
use rand_xorshift::XorShiftRng;
use rand_distr::{Distribution,Uniform};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use leafprop::{
    exact_search, AggregatorConfig, Ann, CSR, CumCSR, EmbeddingPropagation, FeatureAggregator,
    FeatureStore, Graph, Loss, NeighborhoodAligner, NodeEmbedder
};

const SEED: u64 = 2022341;

fn build_clique_edges(max: usize) -> Vec<(usize, usize, f32)> {
    let mut edges = Vec::new();
    for ni in 0..max {
        for no in (ni+1)..max {
            edges.push((ni, no, 1f32));
            edges.push((no, ni, 1f32));
        }
    }
    edges
}

fn generate_random_features(size: usize, num_feats: usize, feat_space: usize) -> FeatureStore {
    let mut feature_store = FeatureStore::new(size, "feat".into());
    let mut rng = XorShiftRng::seed_from_u64(SEED);
    let dist = Uniform::new(0, num_feats);
    let feat_dist = Uniform::new(0, feat_space);
    for node_id in 0..size {
        let nf = dist.sample(&mut rng);
        let mut feats = Vec::with_capacity(nf);
        for _ in 0..nf {
            feats.push(format!("{}", feat_dist.sample(&mut rng)));
        }
        feature_store.set_features(node_id, feats);
    }
    feature_store.fill_missing_nodes();
    feature_store
}

fn build_ep() -> EmbeddingPropagation {
    EmbeddingPropagation {
        alpha: 1e-2,
        batch_size: 128,
        dims: 16,
        passes: 5,
        seed: 202220222,
        indicator: false,
        max_nodes: Some(10),
        loss: Loss::MarginLoss { margin: 1., negatives: 5 },
        ..Default::default()
    }
}

fn embedding_propagation(c: &mut Criterion) {
    let ccsr = CumCSR::convert(CSR::construct_from_edges(build_clique_edges(500)));

    for num_feats in [10usize, 25].iter() {
        let feature_store = generate_random_features(ccsr.len(), *num_feats, 1000);
        let ep = build_ep();

        let averaged = FeatureAggregator::Averaged;
        c.bench_function(&format!("ep:averaged:{}", num_feats), |b| b.iter(|| {
            ep.learn(black_box(&ccsr), &feature_store, None, &averaged)
        }));

        let config = AggregatorConfig::Attention { heads: 2, d_k: 8, context_window: Some(3) };
        c.bench_function(&format!("ep:attention:{}", num_feats), |b| b.iter(|| {
            let agg = FeatureAggregator::new(&config, &feature_store, ep.dims, SEED)
                .expect("valid attention config");
            ep.learn(black_box(&ccsr), &feature_store, None, &agg)
        }));
    }
}

fn node_construction(c: &mut Criterion) {
    let ccsr = CumCSR::convert(CSR::construct_from_edges(build_clique_edges(500)));
    let feature_store = generate_random_features(ccsr.len(), 25, 1000);
    let agg = FeatureAggregator::Averaged;
    let ep = EmbeddingPropagation { passes: 1, ..build_ep() };
    let embeddings = ep.learn(&ccsr, &feature_store, None, &agg).expect("training succeeds");

    let embedder = NodeEmbedder::new(&agg, false);
    c.bench_function("node_embedder", |b| b.iter(|| {
        embedder.embed(black_box(&feature_store), &embeddings)
    }));

    let (nodes, _) = embedder.embed(&feature_store, &embeddings).expect("embedding succeeds");
    let aligner = NeighborhoodAligner::new(0.5, Some(50)).expect("valid alignment");
    c.bench_function("align", |b| b.iter(|| {
        aligner.align_all(black_box(&ccsr), &nodes)
    }));
    assert_eq!(nodes.len(), ccsr.len());

    let query = nodes.get_embedding(0);
    c.bench_function("ann:exact", |b| b.iter(|| {
        exact_search(black_box(&nodes), &query, 10)
    }));

    let ann = Ann::fit(&nodes, 10, 20, SEED).expect("valid forest");
    c.bench_function("ann:forest", |b| b.iter(|| {
        ann.predict(black_box(&nodes), &query, 10)
    }));
}

criterion_group!{
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = embedding_propagation, node_construction
}
criterion_main!(benches);
