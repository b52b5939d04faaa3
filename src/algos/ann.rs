//! Nearest neighbor search over embedding tables, using the distance the table was persisted with.
//! Exact search scans the whole table; `Ann` builds a random projection forest and only scores
//! the leaves a query falls into; `GraphAnn` hill climbs across a graph whose nodes share the
//! table's id space.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use float_ord::FloatOrd;
use hashbrown::HashSet;
use rand::prelude::*;
use rand_distr::{Distribution,Uniform};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use tracing::debug;

use crate::embeddings::EmbeddingStore;
use crate::error::{Error,Result};
use crate::graph::{Graph,NodeID};

/// Candidate hyperplanes tried per split
const SPLIT_CANDIDATES: usize = 5;

/// Points sampled to judge how evenly a hyperplane splits a group
const SPLIT_SAMPLE: usize = 30;

/// Chance a hill climb abandons its current path and restarts from a random node
const RESTART_P: f32 = 0.05;

#[derive(Copy,Clone,Debug,PartialEq)]
pub struct NodeDistance {
    pub node: NodeID,
    pub distance: f32
}

/// Tracks the `k` closest nodes seen so far.  Ties on distance favor the lower node id.
pub struct TopK {
    heap: BinaryHeap<(FloatOrd<f32>, NodeID)>,
    k: usize
}

impl TopK {
    pub fn new(k: usize) -> Self {
        TopK { heap: BinaryHeap::with_capacity(k + 1), k }
    }

    pub fn push(&mut self, node: NodeID, distance: f32) {
        let item = (FloatOrd(distance), node);
        if self.heap.len() < self.k {
            self.heap.push(item);
        } else if let Some(worst) = self.heap.peek() {
            if item < *worst {
                self.heap.pop();
                self.heap.push(item);
            }
        }
    }

    pub fn extend(&mut self, other: TopK) {
        other.heap.into_iter().for_each(|(d, node)| self.push(node, d.0));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Closest first.
    pub fn into_sorted(self) -> Vec<NodeDistance> {
        self.heap.into_sorted_vec().into_iter()
            .map(|(d, node)| NodeDistance { node, distance: d.0 })
            .collect()
    }
}

fn check_query(es: &EmbeddingStore, query: &[f32]) -> Result<()> {
    if query.len() != es.dims() {
        return Err(Error::DimensionMismatch { expected: es.dims(), found: query.len() })
    }
    Ok(())
}

// Scores a set of candidates against the query in parallel.
fn score_candidates<'a>(
    es: &EmbeddingStore,
    query: &[f32],
    candidates: impl ParallelIterator<Item=&'a NodeID>,
    k: usize
) -> TopK {
    let distance = es.distance();
    candidates
        .fold(|| (TopK::new(k), vec![0f32; es.dims()]), |(mut top, mut emb), node| {
            es.read_into(*node, &mut emb);
            top.push(*node, distance.compute(query, &emb));
            (top, emb)
        })
        .map(|(top, _)| top)
        .reduce(|| TopK::new(k), |mut a, b| { a.extend(b); a })
}

/// Exact k nearest neighbors of `query`, closest first.
pub fn exact_search(es: &EmbeddingStore, query: &[f32], k: usize) -> Result<Vec<NodeDistance>> {
    check_query(es, query)?;
    let nodes: Vec<NodeID> = (0..es.len()).collect();
    Ok(score_candidates(es, query, nodes.par_iter(), k).into_sorted())
}

struct Hyperplane {
    normal: Vec<f32>,
    offset: f32
}

impl Hyperplane {
    // Perpendicular bisector of two points
    fn between(a: &[f32], b: &[f32]) -> Self {
        let normal: Vec<f32> = a.iter().zip(b.iter()).map(|(ai, bi)| ai - bi).collect();
        let offset = normal.iter().zip(a.iter().zip(b.iter()))
            .map(|(n, (ai, bi))| n * (ai + bi) / 2.)
            .sum();
        Hyperplane { normal, offset }
    }

    fn is_above(&self, emb: &[f32]) -> bool {
        self.normal.iter().zip(emb.iter()).map(|(n, e)| n * e).sum::<f32>() >= self.offset
    }
}

enum Tree {
    Leaf(Vec<NodeID>),
    Split { hp: Hyperplane, above: usize, below: usize }
}

/// Random projection forest.  Each tree recursively splits the table by the perpendicular
/// bisector of two random members until groups fit in a leaf.  Trees are stored as flat tables
/// with the root last.
pub struct Ann {
    trees: Vec<Vec<Tree>>,
    dims: usize
}

impl Ann {
    pub fn fit(
        es: &EmbeddingStore,
        n_trees: usize,
        max_nodes_per_leaf: usize,
        seed: u64
    ) -> Result<Self> {
        if n_trees == 0 || max_nodes_per_leaf == 0 {
            return Err(Error::InvalidConfig(
                "ann needs at least one tree and a leaf size greater than zero".into()))
        }

        let trees: Vec<_> = (0..n_trees).into_par_iter().map(|idx| {
            let mut rng = XorShiftRng::seed_from_u64(seed.wrapping_add(idx as u64));
            let mut table = Vec::new();
            build_tree(&mut table, es, (0..es.len()).collect(), max_nodes_per_leaf, &mut rng);
            table
        }).collect();

        let ann = Ann { trees, dims: es.dims() };
        debug!(trees = n_trees, depth = ?ann.depth(), "Fit ann forest");
        Ok(ann)
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn depth(&self) -> Vec<usize> {
        self.trees.iter().map(|t| tree_depth(t, t.len() - 1)).collect()
    }

    /// Approximate k nearest neighbors: every node sharing a leaf with the query in any tree is
    /// scored exactly.
    pub fn predict(&self, es: &EmbeddingStore, query: &[f32], k: usize) -> Result<Vec<NodeDistance>> {
        check_query(es, query)?;
        if es.dims() != self.dims {
            return Err(Error::DimensionMismatch { expected: self.dims, found: es.dims() })
        }

        let mut seen = HashSet::new();
        let candidates: Vec<NodeID> = self.trees.iter()
            .flat_map(|t| leaf(t, query).iter())
            .filter(|node| seen.insert(**node))
            .copied()
            .collect();

        Ok(score_candidates(es, query, candidates.par_iter(), k).into_sorted())
    }
}

fn leaf<'a>(table: &'a [Tree], emb: &[f32]) -> &'a [NodeID] {
    let mut idx = table.len() - 1;
    loop {
        match &table[idx] {
            Tree::Leaf(nodes) => return nodes,
            Tree::Split { hp, above, below } => {
                idx = if hp.is_above(emb) { *above } else { *below };
            }
        }
    }
}

fn tree_depth(table: &[Tree], idx: usize) -> usize {
    match &table[idx] {
        Tree::Leaf(_) => 1,
        Tree::Split { above, below, .. } => {
            tree_depth(table, *above).max(tree_depth(table, *below)) + 1
        }
    }
}

// Returns the index of the subtree built for `nodes`
fn build_tree(
    table: &mut Vec<Tree>,
    es: &EmbeddingStore,
    nodes: Vec<NodeID>,
    max_nodes_per_leaf: usize,
    rng: &mut impl Rng
) -> usize {
    if nodes.len() <= max_nodes_per_leaf || nodes.len() < 2 {
        table.push(Tree::Leaf(nodes));
        return table.len() - 1
    }

    // Keep the candidate which splits a sample closest to evenly
    let mut best: Option<(usize, Hyperplane)> = None;
    for _ in 0..SPLIT_CANDIDATES {
        let pair = rand::seq::index::sample(rng, nodes.len(), 2);
        let hp = Hyperplane::between(
            &es.get_embedding(nodes[pair.index(0)]),
            &es.get_embedding(nodes[pair.index(1)]));

        let above = (0..SPLIT_SAMPLE)
            .filter_map(|_| nodes.choose(rng))
            .filter(|node| hp.is_above(&es.get_embedding(**node)))
            .count();
        let imbalance = (2 * above).max(SPLIT_SAMPLE) - (2 * above).min(SPLIT_SAMPLE);
        if best.as_ref().map(|(b, _)| imbalance < *b).unwrap_or(true) {
            best = Some((imbalance, hp));
        }
    }

    let hp = match best {
        Some((_, hp)) => hp,
        None => {
            table.push(Tree::Leaf(nodes));
            return table.len() - 1
        }
    };

    let sides: Vec<bool> = nodes.par_iter().map(|node| hp.is_above(&es.get_embedding(*node))).collect();
    let (above, below): (Vec<_>, Vec<_>) = nodes.into_iter().zip(sides)
        .partition(|(_, is_above)| *is_above);
    let above: Vec<NodeID> = above.into_iter().map(|(n, _)| n).collect();
    let below: Vec<NodeID> = below.into_iter().map(|(n, _)| n).collect();

    // Duplicate points can't be separated
    if above.is_empty() || below.is_empty() {
        let nodes = if above.is_empty() { below } else { above };
        table.push(Tree::Leaf(nodes));
        return table.len() - 1
    }

    let above = build_tree(table, es, above, max_nodes_per_leaf, rng);
    let below = build_tree(table, es, below, max_nodes_per_leaf, rng);
    table.push(Tree::Split { hp, above, below });
    table.len() - 1
}

/// Greedy best-first search across a graph.  Each climb starts at a random node and expands the
/// closest unexplored node until it randomly restarts; `max_steps` bounds the total expansions.
/// Results depend on the graph being connected and the embeddings varying smoothly over it.
#[derive(Clone,Debug)]
pub struct GraphAnn {
    pub k: usize,
    pub max_steps: usize,
    pub seed: u64
}

impl GraphAnn {
    pub fn new(k: usize, max_steps: usize, seed: u64) -> Self {
        GraphAnn { k, max_steps, seed }
    }

    pub fn find<G: Graph>(
        &self,
        query: &[f32],
        graph: &G,
        es: &EmbeddingStore
    ) -> Result<Vec<NodeDistance>> {
        check_query(es, query)?;
        if graph.len() > es.len() {
            return Err(Error::InvalidConfig(format!(
                "graph has {} nodes but only {} embeddings", graph.len(), es.len())))
        }

        let mut best = TopK::new(self.k);
        if graph.len() == 0 { return Ok(best.into_sorted()) }

        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        let starts = Uniform::new(0, graph.len());
        let distance = es.distance();
        let mut emb = vec![0f32; es.dims()];
        let mut dist_to = |node: NodeID| {
            es.read_into(node, &mut emb);
            distance.compute(query, &emb)
        };

        // Each climb tracks its own visits so it can cross ground covered by earlier climbs
        let mut scored = HashSet::new();
        let mut visited = HashSet::new();
        let mut frontier = BinaryHeap::new();
        let mut steps = self.max_steps;
        while steps > 0 {
            frontier.clear();
            visited.clear();
            let start = starts.sample(&mut rng);
            visited.insert(start);
            frontier.push(Reverse((FloatOrd(dist_to(start)), start)));

            while let Some(Reverse((d, node))) = frontier.pop() {
                if scored.insert(node) {
                    best.push(node, d.0);
                }
                for next in graph.get_edges(node).0.iter() {
                    if visited.insert(*next) {
                        frontier.push(Reverse((FloatOrd(dist_to(*next)), *next)));
                    }
                }

                steps -= 1;
                if steps == 0 || rng.gen::<f32>() < RESTART_P { break }
            }
        }
        Ok(best.into_sorted())
    }
}
