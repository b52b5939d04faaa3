//! Negative and personalized page rank samplers used to build training examples.
use hashbrown::HashMap;
use rand::prelude::*;
use rand_distr::{Distribution,Uniform};

use crate::graph::{CDFGraph,NodeID};
use crate::sampler::NeighborSampler;

/// Draws per negative before accepting a possible false negative.
const MAX_NEGATIVE_RETRIES: usize = 32;

/// Two hop walks per requested hard negative before falling back to random negatives.
const HARD_NEGATIVE_ATTEMPTS: usize = 3;

/// Longest walk allowed when sampling a personalized page rank neighborhood.
pub const PPR_MAX_STEPS: usize = 10;

pub trait NodeSampler {
    fn sample_negatives<G: CDFGraph, R: Rng>(
        &self,
        graph: &G,
        anchor: NodeID,
        negatives: &mut Vec<NodeID>,
        num_negs: usize,
        rng: &mut R);
}

/// Samples negatives from a fixed, sorted population of nodes, optionally starting with hard
/// negatives found two hops out from the anchor.  Hard negatives outside the population are
/// discarded so training and validation splits never share negatives.
pub struct RandomWalkHardSampler<'a> {
    population: &'a [NodeID],
    num_hard_negatives: usize
}

impl <'a> RandomWalkHardSampler<'a> {
    pub fn new(num_hard_negatives: usize, population: &'a [NodeID]) -> Self {
        RandomWalkHardSampler { population, num_hard_negatives }
    }

    fn sample_hard_negatives<G: CDFGraph, R: Rng>(
        &self,
        graph: &G,
        anchor: NodeID,
        negatives: &mut Vec<NodeID>,
        num_hard_negs: usize,
        rng: &mut R
    ) {
        let start = negatives.len();
        for _ in 0..(num_hard_negs * HARD_NEGATIVE_ATTEMPTS) {
            if negatives.len() - start >= num_hard_negs { break }

            let hop = NeighborSampler::Uniform.sample(graph, anchor, rng)
                .and_then(|u| NeighborSampler::Uniform.sample(graph, u, rng));

            if let Some(node) = hop {
                if node != anchor
                    && !graph.is_neighbor(anchor, node)
                    && self.population.binary_search(&node).is_ok()
                    && !negatives.contains(&node) {
                    negatives.push(node);
                }
            }
        }
    }
}

impl <'a> NodeSampler for RandomWalkHardSampler<'a> {
    fn sample_negatives<G: CDFGraph, R: Rng>(
        &self,
        graph: &G,
        anchor: NodeID,
        negatives: &mut Vec<NodeID>,
        num_negs: usize,
        rng: &mut R
    ) {
        let num_hard_negs = self.num_hard_negatives.min(num_negs);
        if num_hard_negs > 0 {
            self.sample_hard_negatives(graph, anchor, negatives, num_hard_negs, rng);
        }

        if self.population.is_empty() { return }

        // Bounded rejection of the anchor and its true neighbors.  Once out of retries we keep
        // the last draw, even if it is a false negative.
        let dist = Uniform::new(0, self.population.len());
        while negatives.len() < num_negs {
            let mut candidate = self.population[dist.sample(rng)];
            for _ in 1..MAX_NEGATIVE_RETRIES {
                if candidate != anchor && !graph.is_neighbor(anchor, candidate) { break }
                candidate = self.population[dist.sample(rng)];
            }
            negatives.push(candidate);
        }
    }
}

/// Walks from the anchor, stopping with probability `restart_p` after each step.  Returns the
/// node the walk ended on, falling back to a direct neighbor when the walk ends on the anchor.
pub fn ppr_walk<G: CDFGraph, R: Rng>(
    anchor: NodeID,
    graph: &G,
    sampler: NeighborSampler,
    restart_p: f32,
    max_steps: usize,
    rng: &mut R
) -> Option<NodeID> {
    let mut node = anchor;
    for _ in 0..max_steps {
        match sampler.sample(graph, node, rng) {
            Some(next) => node = next,
            None => break
        }
        if rng.gen::<f32>() < restart_p { break }
    }

    if node != anchor {
        Some(node)
    } else {
        sampler.sample(graph, anchor, rng)
    }
}

/// Visitation frequencies of `num` personalized page rank walks from `anchor`, normalized to
/// sum to one.  Empty when the anchor has no out edges.
pub fn ppr_neighborhood<G: CDFGraph, R: Rng>(
    anchor: NodeID,
    graph: &G,
    sampler: NeighborSampler,
    num: usize,
    restart_p: f32,
    rng: &mut R
) -> Vec<(NodeID, f32)> {
    let mut counts: HashMap<NodeID, usize> = HashMap::new();
    let mut total = 0usize;
    for _ in 0..num {
        if let Some(node) = ppr_walk(anchor, graph, sampler, restart_p, PPR_MAX_STEPS, rng) {
            *counts.entry(node).or_insert(0) += 1;
            total += 1;
        }
    }

    let mut visits: Vec<_> = counts.into_iter()
        .map(|(node, c)| (node, c as f32 / total as f32))
        .collect();

    // Deterministic order for a given seed
    visits.sort_by_key(|(node, _)| *node);
    visits
}
