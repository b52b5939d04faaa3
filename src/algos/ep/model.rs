//! Composes node vectors out of feature embeddings for training.  A node is represented either
//! by its own features, H(n), or reconstructed from its neighborhood, ~H(n).
use rand::prelude::*;

use crate::algos::aggregator::{Aggregation,FeatureAggregator,Gradients};
use crate::algos::utils::{axpy,sample_ordered_indices};
use crate::embeddings::EmbeddingStore;
use crate::feature_store::FeatureStore;
use crate::graph::{CDFGraph,CDFtoP,NodeID};
use crate::sampler::NeighborSampler;

use super::node_sampler::ppr_neighborhood;

/// A node vector built as a weighted mean of one or more feature aggregations.
pub struct Composite {
    parts: Vec<(f32, Aggregation)>,
    output: Vec<f32>
}

impl Composite {
    fn from_parts(parts: Vec<(f32, Aggregation)>, dims: usize) -> Self {
        let mut output = vec![0f32; dims];
        parts.iter().for_each(|(w, agg)| axpy(*w, agg.output(), &mut output));
        Composite { parts, output }
    }

    pub fn output(&self) -> &[f32] {
        &self.output
    }

    /// True when no part aggregated any features.
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|(_, agg)| agg.features().is_empty())
    }

    pub fn backward(&self, aggregator: &FeatureAggregator, grad: &[f32], grads: &mut Gradients) {
        let mut scaled = vec![0f32; grad.len()];
        for (w, agg) in self.parts.iter() {
            scaled.iter_mut().zip(grad.iter()).for_each(|(si, gi)| *si = w * gi);
            aggregator.backward(agg, &scaled, grads);
        }
    }
}

pub struct NodeModel {
    /// Caps the number of features aggregated per node
    pub max_features: Option<usize>,

    /// Caps the neighbors used to reconstruct a node
    pub max_nodes: usize,

    /// How neighbors are picked for reconstruction and walks
    pub sampler: NeighborSampler,

    /// Weights reconstructed neighbors by their transition probability
    pub weighted_averaging: bool
}

impl NodeModel {

    /// Features used for a node this step.  Oversized feature sets are subsampled, keeping the
    /// original order so context windows stay meaningful.
    pub fn select_features<R: Rng>(
        &self,
        node: NodeID,
        feature_store: &FeatureStore,
        rng: &mut R
    ) -> Vec<usize> {
        let feats = feature_store.get_features(node);
        match self.max_features {
            Some(max) if feats.len() > max => {
                sample_ordered_indices(feats.len(), max, rng).into_iter()
                    .map(|idx| feats[idx])
                    .collect()
            },
            _ => feats.to_vec()
        }
    }

    // H(n)
    pub fn construct_node_embedding<R: Rng>(
        &self,
        node: NodeID,
        feature_store: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        aggregator: &FeatureAggregator,
        rng: &mut R
    ) -> Composite {
        let feats = self.select_features(node, feature_store, rng);
        let agg = aggregator.aggregate(&feats, feature_embeddings);
        Composite::from_parts(vec![(1., agg)], feature_embeddings.dims())
    }

    // ~H(n)
    // Samples up to `max_nodes` neighbors and averages their node embeddings.  Returns None when
    // the node has no usable neighbors.
    pub fn reconstruct_node_embedding<G: CDFGraph, R: Rng>(
        &self,
        graph: &G,
        node: NodeID,
        feature_store: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        aggregator: &FeatureAggregator,
        rng: &mut R
    ) -> Option<Composite> {
        let (edges, weights) = graph.get_edges(node);
        if edges.is_empty() { return None }

        let num = self.max_nodes.max(1).min(edges.len());
        let idxs: Vec<usize> = match self.sampler {
            NeighborSampler::Uniform => {
                rand::seq::index::sample(rng, edges.len(), num).into_vec()
            },
            NeighborSampler::Weighted => {
                (0..num).filter_map(|_| self.sampler.sample_edge_index(graph, node, rng)).collect()
            }
        };

        let probs: Vec<f32> = if self.weighted_averaging {
            CDFtoP::new(weights).collect()
        } else {
            Vec::new()
        };

        let nodes = idxs.into_iter().map(|idx| {
            let w = if self.weighted_averaging { probs[idx] } else { 1. };
            (edges[idx], w)
        });

        self.construct_from_multiple_nodes(nodes, feature_store, feature_embeddings, aggregator, rng)
    }

    /// Positive built from the personalized page rank neighborhood of a node, weighted by
    /// visitation frequency.
    pub fn ppr_node_embedding<G: CDFGraph, R: Rng>(
        &self,
        graph: &G,
        node: NodeID,
        num: usize,
        restart_p: f32,
        feature_store: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        aggregator: &FeatureAggregator,
        rng: &mut R
    ) -> Option<Composite> {
        let visits = ppr_neighborhood(node, graph, self.sampler, num, restart_p, rng);
        self.construct_from_multiple_nodes(visits.into_iter(), feature_store,
                                           feature_embeddings, aggregator, rng)
    }

    /// Weighted mean of each node's aggregated features.  Nodes without features or weight are
    /// left out.
    pub fn construct_from_multiple_nodes<I: Iterator<Item=(NodeID, f32)>, R: Rng>(
        &self,
        nodes: I,
        feature_store: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        aggregator: &FeatureAggregator,
        rng: &mut R
    ) -> Option<Composite> {
        let mut parts = Vec::new();
        for (node, weight) in nodes {
            if weight <= 0. { continue }
            let feats = self.select_features(node, feature_store, rng);
            if feats.is_empty() { continue }
            parts.push((weight, aggregator.aggregate(&feats, feature_embeddings)));
        }

        let denom: f32 = parts.iter().map(|(w, _)| w).sum();
        if parts.is_empty() || denom <= 0. { return None }

        parts.iter_mut().for_each(|(w, _)| *w /= denom);
        Some(Composite::from_parts(parts, feature_embeddings.dims()))
    }
}
