//! Single step neighbor samplers.  These drive positive example selection and the steps of
//! random walks.
use rand::prelude::*;
use rand_distr::{Distribution,Uniform};
use float_ord::FloatOrd;

use crate::graph::{CDFGraph,NodeID};

/// Chooses the next node from a node's out edges.
#[derive(Copy,Clone,Debug)]
pub enum NeighborSampler {
    /// Every neighbor is equally likely
    Uniform,

    /// Neighbors are chosen proportional to edge weight
    Weighted
}

impl NeighborSampler {
    pub fn new(weighted: bool) -> Self {
        if weighted { NeighborSampler::Weighted } else { NeighborSampler::Uniform }
    }

    pub fn sample<G: CDFGraph, R: Rng>(&self, g: &G, node: NodeID, rng: &mut R) -> Option<NodeID> {
        match self {
            NeighborSampler::Uniform => UniformSample::sample(g, node, rng),
            NeighborSampler::Weighted => WeightedSample::sample(g, node, rng)
        }
    }

    /// Position of the sampled neighbor within the node's edge list.
    pub fn sample_edge_index<G: CDFGraph, R: Rng>(&self, g: &G, node: NodeID, rng: &mut R) -> Option<usize> {
        match self {
            NeighborSampler::Uniform => UniformSample::sample_index(g, node, rng),
            NeighborSampler::Weighted => WeightedSample::sample_index(g, node, rng)
        }
    }
}

pub struct WeightedSample;

impl WeightedSample {
    pub fn sample<G:CDFGraph, R:Rng>(g: &G, node: NodeID, rng: &mut R) -> Option<NodeID> {
        WeightedSample::sample_index(g, node, rng).map(|idx| g.get_edges(node).0[idx])
    }

    pub fn sample_index<G:CDFGraph, R:Rng>(g: &G, node: NodeID, rng: &mut R) -> Option<usize> {
        let (edges, weights) = g.get_edges(node);
        if edges.is_empty() {
            return None
        }

        let p: f32 = rng.gen();
        let idx = match weights.binary_search_by_key(&FloatOrd(p), |w| FloatOrd(*w)) {
            Ok(idx) => idx,
            Err(idx) => idx
        };
        Some(idx.min(edges.len() - 1))
    }
}

pub struct UniformSample;

impl UniformSample {
    pub fn sample<G: CDFGraph, R:Rng>(g: &G, node: NodeID, rng: &mut R) -> Option<NodeID> {
        UniformSample::sample_index(g, node, rng).map(|idx| g.get_edges(node).0[idx])
    }

    pub fn sample_index<G: CDFGraph, R:Rng>(g: &G, node: NodeID, rng: &mut R) -> Option<usize> {
        let degree = g.degree(node);
        if degree == 0 {
            return None
        }

        let dist = Uniform::new(0, degree);
        Some(rng.sample(dist))
    }
}

#[cfg(test)]
mod sampler_tests {
    use super::*;
    use rand_xorshift::XorShiftRng;
    use crate::graph::{CSR,CumCSR};

    #[test]
    fn test_weighted_proportions() {
        let edges = vec![(0, 1, 1.), (0, 2, 3.), (1, 0, 1.), (2, 0, 1.)];
        let graph = CumCSR::convert(CSR::construct_from_edges(edges));
        let mut rng = XorShiftRng::seed_from_u64(1234);
        let mut counts = [0usize; 3];
        for _ in 0..10_000 {
            let n = NeighborSampler::Weighted.sample(&graph, 0, &mut rng).unwrap();
            counts[n] += 1;
        }
        assert_eq!(counts[0], 0);
        let ratio = counts[2] as f32 / counts[1] as f32;
        assert!(ratio > 2.5 && ratio < 3.5, "ratio: {}", ratio);
    }

    #[test]
    fn test_no_edges() {
        let graph = CumCSR::convert(CSR::construct_with_nodes(3, vec![(0, 1, 1.)]));
        let mut rng = XorShiftRng::seed_from_u64(1234);
        assert_eq!(NeighborSampler::Uniform.sample(&graph, 2, &mut rng), None);
        assert_eq!(NeighborSampler::Weighted.sample(&graph, 2, &mut rng), None);
        assert_eq!(NeighborSampler::Uniform.sample(&graph, 0, &mut rng), Some(1));
    }
}
