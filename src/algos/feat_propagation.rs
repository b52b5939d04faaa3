//! Propagates features from nodes which have them to nodes which don't, hop by hop.
use hashbrown::HashMap;
use float_ord::FloatOrd;
use tracing::{debug,info};

use crate::graph::{CDFGraph,CDFtoP};
use crate::feature_store::FeatureStore;

pub struct FeaturePropagator {
    /// Maximum number of features a node can receive
    pub k: usize,

    /// Minimum L2 normalized weight a feature needs to be propagated
    pub threshold: f32,

    /// Maximum number of hops to propagate across
    pub max_iters: usize
}

impl FeaturePropagator {
    pub fn new(k: usize, threshold: f32, max_iters: usize) -> Self {
        FeaturePropagator { k, threshold, max_iters }
    }

    /// Fills in features for nodes without direct features.  Each iteration reads a snapshot of
    /// the previous one, so propagated features travel exactly one hop per iteration and
    /// propagating twice yields the same associations.
    pub fn propagate(&self, graph: &impl CDFGraph, features: &mut FeatureStore) {
        let num_nodes = features.num_nodes();

        // Start from direct features only
        let mut current: Vec<Vec<usize>> = (0..num_nodes).map(|node_id| {
            if features.is_direct(node_id) {
                features.get_features(node_id).to_vec()
            } else {
                Vec::new()
            }
        }).collect();

        let mut working_map = HashMap::new();
        let mut working_vec = Vec::new();
        for iter in 0..self.max_iters {
            let mut next = current.clone();
            let mut updated = 0usize;
            for node_id in 0..num_nodes {
                if features.is_direct(node_id) || !current[node_id].is_empty() { continue }

                let (edges, weights) = graph.get_edges(node_id);
                working_map.clear();

                // Reconstructs the probability distribution
                for (edge, weight) in edges.iter().zip(CDFtoP::new(weights)) {
                    for feat in current[*edge].iter() {
                        *working_map.entry(*feat).or_insert(0f32) += weight;
                    }
                }

                if working_map.is_empty() { continue }

                // L2norm
                working_vec.clear();
                working_vec.extend(working_map.drain());
                working_vec.sort_by_key(|(f, w)| (FloatOrd(-*w), *f));
                let norm = working_vec.iter()
                    .map(|(_, w)| w.powf(2.))
                    .sum::<f32>().sqrt();

                let top_k: Vec<_> = working_vec.drain(..)
                    .filter(|(_, w)| *w / norm > self.threshold)
                    .take(self.k)
                    .map(|(f, _)| f)
                    .collect();

                if !top_k.is_empty() {
                    next[node_id] = top_k;
                    updated += 1;
                }
            }
            current = next;
            debug!(iter, updated, "Feature propagation pass");
            if updated == 0 {
                break
            }
        }

        let mut propagated = 0usize;
        for (node_id, feats) in current.into_iter().enumerate() {
            if !features.is_direct(node_id) {
                propagated += (!feats.is_empty()) as usize;
                features.set_propagated(node_id, feats.into_iter());
            }
        }
        info!(direct = features.num_direct(), propagated, "Propagated features");
    }
}

#[cfg(test)]
mod pf_tests {
    use super::*;
    use crate::graph::{CSR,CumCSR};

    fn build_edges() -> Vec<(usize, usize, f32)> {
        vec![
            (0, 1, 1.),
            (0, 2, 1.),
            (1, 0, 1.),
            (1, 2, 3.),
            (2, 1, 3.),
            (2, 0, 2.5),
            (2, 3, 2.5),
            (3, 2, 2.5),
            (3, 4, 0.5),
            (4, 3, 0.5),
            (4, 5, 0.5),
            (4, 6, 0.5),
            (5, 4, 0.5),
            (5, 6, 0.5),
            (6, 4, 0.5),
            (6, 5, 0.5),
        ]
    }

    fn build_features() -> FeatureStore {
        let mut fs = FeatureStore::new(7, "feat".into());
        fs.set_features(0, vec!["a".into()]);
        fs.set_features(1, vec!["b".into(), "c".into()]);
        fs.set_features(6, vec!["d".into()]);
        fs
    }

    fn snapshot(fs: &FeatureStore) -> Vec<Vec<usize>> {
        fs.iter().cloned().collect()
    }

    #[test]
    fn test_propagation_adds_only() {
        let graph = CumCSR::convert(CSR::construct_from_edges(build_edges()));
        let mut fs = build_features();
        let before = snapshot(&fs);

        FeaturePropagator::new(3, 0., 1).propagate(&graph, &mut fs);
        let after = snapshot(&fs);

        for (b, a) in before.iter().zip(after.iter()) {
            assert!(b.iter().all(|f| a.contains(f)));
        }

        // One hop from 0 and 1
        assert_eq!(fs.get_pretty_features(2).len(), 3);
        // Node 4 and 5 neighbor 6
        assert_eq!(fs.get_pretty_features(4), vec!["d"]);
        assert_eq!(fs.get_pretty_features(5), vec!["d"]);
        // Node 3 is two hops away from everything
        assert!(fs.get_features(3).is_empty());
    }

    #[test]
    fn test_multi_hop() {
        let graph = CumCSR::convert(CSR::construct_from_edges(build_edges()));
        let mut fs = build_features();
        FeaturePropagator::new(10, 0., 2).propagate(&graph, &mut fs);
        assert!(!fs.get_features(3).is_empty());
        assert!(fs.get_features(3).len() <= 4);
    }

    #[test]
    fn test_idempotent() {
        let graph = CumCSR::convert(CSR::construct_from_edges(build_edges()));
        let mut fs = build_features();
        let fp = FeaturePropagator::new(2, 0.1, 2);
        fp.propagate(&graph, &mut fs);
        let first = snapshot(&fs);
        fp.propagate(&graph, &mut fs);
        assert_eq!(first, snapshot(&fs));

        for feats in fs.iter() {
            let mut dedup = feats.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), feats.len());
        }
    }
}
