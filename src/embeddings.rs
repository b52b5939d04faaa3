//! Dense embedding tables.  During training a single table is shared across all worker threads
//! and updated hogwild style: every component is an atomic float, so writers to different
//! vectors never block each other and writers to the same vector race per component.
use std::sync::atomic::Ordering;

use atomic_float::AtomicF32;

use crate::distance::Distance;
use crate::graph::NodeID;

pub struct EmbeddingStore {
    nodes: usize,
    dims: usize,
    embeddings: Vec<AtomicF32>,
    distance: Distance
}

impl EmbeddingStore {
    pub fn new(nodes: usize, dims: usize, distance: Distance) -> Self {
        let embeddings = (0..(nodes * dims)).map(|_| AtomicF32::new(0.)).collect();
        EmbeddingStore { nodes, dims, embeddings, distance }
    }

    /// Builds a table from a row-major buffer.
    pub fn from_vec(dims: usize, data: Vec<f32>, distance: Distance) -> Self {
        let nodes = if dims > 0 { data.len() / dims } else { 0 };
        let embeddings = data.into_iter().map(AtomicF32::new).collect();
        EmbeddingStore { nodes, dims, embeddings, distance }
    }

    pub fn len(&self) -> usize {
        self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes == 0
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn distance(&self) -> Distance {
        self.distance
    }

    #[inline]
    fn slots(&self, node_id: NodeID) -> &[AtomicF32] {
        let start = node_id * self.dims;
        &self.embeddings[start..start+self.dims]
    }

    /// Copies the current value of an embedding into `out`.
    pub fn read_into(&self, node_id: NodeID, out: &mut [f32]) {
        out.iter_mut().zip(self.slots(node_id).iter()).for_each(|(oi, ei)| {
            *oi = ei.load(Ordering::Relaxed);
        });
    }

    pub fn get_embedding(&self, node_id: NodeID) -> Vec<f32> {
        let mut out = vec![0f32; self.dims];
        self.read_into(node_id, &mut out);
        out
    }

    /// Adds `delta` to the embedding, one atomic component at a time.
    pub fn apply_gradient(&self, node_id: NodeID, delta: &[f32]) {
        self.slots(node_id).iter().zip(delta.iter()).for_each(|(ei, di)| {
            ei.fetch_add(*di, Ordering::Relaxed);
        });
    }

    pub fn set_embedding(&self, node_id: NodeID, embedding: &[f32]) {
        self.slots(node_id).iter().zip(embedding.iter()).for_each(|(ei, wi)| {
            ei.store(*wi, Ordering::Relaxed);
        });
    }

    /// Snapshot of the full table in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.embeddings.iter().map(|e| e.load(Ordering::Relaxed)).collect()
    }

    pub fn compute_distance(&self, n1: NodeID, n2: NodeID) -> f32 {
        let e1 = self.get_embedding(n1);
        let e2 = self.get_embedding(n2);
        self.distance.compute(&e1, &e2)
    }
}

impl Clone for EmbeddingStore {
    fn clone(&self) -> Self {
        EmbeddingStore::from_vec(self.dims, self.to_vec(), self.distance)
    }
}

impl std::fmt::Debug for EmbeddingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingStore")
            .field("nodes", &self.nodes)
            .field("dims", &self.dims)
            .field("distance", &self.distance)
            .finish()
    }
}

#[cfg(test)]
mod embedding_tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_embeddings() {
        let es = EmbeddingStore::new(100, 2, Distance::Euclidean);

        es.set_embedding(0, &[0., 1.]);
        es.set_embedding(35, &[2., 3.]);
        es.set_embedding(1, &[1., 2.]);

        assert_eq!(es.get_embedding(0), vec![0., 1.]);
        assert_eq!(es.get_embedding(1), vec![1., 2.]);
        assert_eq!(es.get_embedding(35), vec![2., 3.]);

        assert_eq!(es.compute_distance(0, 1), 2f32.sqrt());
        assert_eq!(es.compute_distance(0, 35), 8f32.sqrt());
    }

    #[test]
    fn test_apply_gradient() {
        let es = EmbeddingStore::from_vec(2, vec![1., 1., 2., 2.], Distance::Cosine);
        es.apply_gradient(1, &[0.5, -1.]);
        assert_eq!(es.get_embedding(0), vec![1., 1.]);
        assert_eq!(es.get_embedding(1), vec![2.5, 1.]);
    }

    #[test]
    fn test_concurrent_updates() {
        let es = EmbeddingStore::new(4, 3, Distance::Cosine);
        (0..1000usize).into_par_iter().for_each(|i| {
            es.apply_gradient(i % 4, &[1., 1., 1.]);
        });
        for idx in 0..4 {
            assert_eq!(es.get_embedding(idx), vec![250., 250., 250.]);
        }
    }

}
