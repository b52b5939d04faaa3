
pub type NodeID = usize;

pub trait Graph {
    /// Get number of nodes in graph
    fn len(&self) -> usize;

    /// Get number of edges in graph
    fn edges(&self) -> usize;

    /// Get degree of node in graph
    fn degree(&self, idx: NodeID) -> usize;

    /// Get edges and corresponding weights
    fn get_edges(&self, idx: NodeID) -> (&[NodeID], &[f32]);

    /// Checks whether `to_node` is a direct neighbor of `from_node`.  Rows are short relative to
    /// the graph so a linear scan is fine.
    fn is_neighbor(&self, from_node: NodeID, to_node: NodeID) -> bool {
        self.get_edges(from_node).0.contains(&to_node)
    }

}

/// Used for trait bounds.  Confirms the weights are normalized transition
/// matrix, optimized in cumulative distribution function.
pub trait CDFGraph: Graph {}

/// Compressed Sparse Row Format.  We use this for graphs since adjancency
/// lists tend to use more memory.
#[derive(Debug,Clone)]
pub struct CSR {
    rows: Vec<NodeID>,
    columns: Vec<NodeID>,
    weights: Vec<f32>
}

impl CSR {
    pub fn construct_from_edges(edges: Vec<(NodeID, NodeID, f32)>) -> Self {
        // Determine the number of rows in the adjacency graph
        let max_node = edges.iter().map(|(from_node, to_node, _)| {
            *from_node.max(to_node)
        }).max().map(|n| n + 1).unwrap_or(0);

        CSR::construct_with_nodes(max_node, edges)
    }

    /// Builds a CSR with at least `num_nodes` rows, which allows isolated nodes at the tail of
    /// the id space.
    pub fn construct_with_nodes(num_nodes: usize, edges: Vec<(NodeID, NodeID, f32)>) -> Self {

        let num_nodes = edges.iter()
            .map(|(from_node, to_node, _)| *from_node.max(to_node) + 1)
            .max()
            .unwrap_or(0)
            .max(num_nodes);

        // Figure out how many out edges per node
        let mut rows = vec![0; num_nodes+1];
        edges.iter().for_each(|(from_node, _to_node, _w)| {
            rows[*from_node + 1] += 1;
        });

        // Convert to row offset format
        let mut offset = 0;
        rows.iter_mut().skip(1).for_each(|count| {
            offset += *count;
            *count = offset;
        });

        // Insert columns and weights
        let mut counts  = vec![0; num_nodes];
        let mut columns = vec![0; edges.len()];
        let mut data    = vec![0f32; edges.len()];
        edges.into_iter().for_each(|(from_node, to_node, weight)| {
            let idx = rows[from_node] + counts[from_node];
            columns[idx] = to_node;
            data[idx] = weight;
            counts[from_node] += 1;
        });

        CSR { rows, columns, weights: data }
    }

}

impl Graph for CSR {
    // Get number of nodes in graph
    fn len(&self) -> usize {
        self.rows.len() - 1
    }

    // Get number of nodes in graph
    fn edges(&self) -> usize {
        self.weights.len()
    }

    // Get degree of node in graph
    fn degree(&self, idx: NodeID) -> usize {
        self.rows[idx+1] - self.rows[idx]
    }

    // Get edges and corresponding weights
    fn get_edges(&self, idx: NodeID) -> (&[NodeID], &[f32]) {
        let start = self.rows[idx];
        let stop  = self.rows[idx+1];
        (&self.columns[start..stop], &self.weights[start..stop])
    }

}

/// Weights are stored as a per-row cumulative distribution so neighbors can be sampled
/// proportional to edge weight with a binary search.
#[derive(Debug,Clone)]
pub struct CumCSR(CSR);

impl CumCSR {
    pub fn convert(mut csr: CSR) -> Self {
        for start_stop in csr.rows.windows(2) {
            let (start, stop) = (start_stop[0], start_stop[1]);
            if start == stop { continue }

            let slice = &mut csr.weights[start..stop];
            let denom = slice.iter().sum::<f32>();
            let n = slice.len() as f32;
            let mut acc = 0.;
            slice.iter_mut().for_each(|w| {
                // All zero rows fall back to uniform transitions
                acc += if denom > 0. { *w } else { 1. };
                *w = if denom > 0. { acc / denom } else { acc / n };
            });
            slice[slice.len() - 1] = 1.;
        }
        CumCSR(csr)
    }
}

impl Graph for CumCSR {
    /// Get number of nodes in graph
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Get number of nodes in graph
    fn edges(&self) -> usize {
        self.0.edges()
    }

    /// Get degree of node in graph
    fn degree(&self, idx: NodeID) -> usize {
        self.0.degree(idx)
    }

    /// Get edges and corresponding weights
    fn get_edges(&self, idx: NodeID) -> (&[NodeID], &[f32]) {
        self.0.get_edges(idx)
    }

}

impl CDFGraph for CumCSR {}

/// Converts a CDF row back into transition probabilities.
pub struct CDFtoP<'a> {
    cdf: &'a [f32],
    idx: usize
}

impl <'a> CDFtoP<'a> {
    pub fn new(cdf: &'a [f32]) -> Self {
        CDFtoP { cdf, idx: 0 }
    }
}

impl <'a> Iterator for CDFtoP<'a> {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.cdf.len() { return None }

        let p = if self.idx == 0 {
            self.cdf[0]
        } else {
            self.cdf[self.idx] - self.cdf[self.idx - 1]
        };
        self.idx += 1;
        Some(p)
    }
}

#[cfg(test)]
mod csr_tests {
    use super::*;

    fn build_edges() -> Vec<(usize, usize, f32)> {
        vec![
            (0, 1, 1.),
            (1, 1, 3.),
            (1, 2, 2.),
            (2, 0, 2.5),
            (1, 0, 10.),
        ]
    }

    #[test]
    fn construct_csr() {
        let edges = build_edges();

        let csr = CSR::construct_from_edges(edges);
        assert_eq!(csr.rows, vec![0, 1, 4, 5]);
        assert_eq!(csr.columns, vec![1, 1, 2, 0, 0]);
        assert_eq!(csr.weights, vec![1., 3., 2., 10., 2.5]);
    }

    #[test]
    fn test_graph() {
        let edges = build_edges();

        let csr = CSR::construct_from_edges(edges);
        assert_eq!(csr.len(), 3);
        assert_eq!(csr.degree(0), 1);
        assert_eq!(csr.degree(1), 3);
        assert_eq!(csr.degree(2), 1);
        assert_eq!(csr.get_edges(2), (vec![0].as_slice(), vec![2.5].as_slice()));
        assert_eq!(csr.get_edges(1), (vec![1,2,0].as_slice(), vec![3., 2., 10.].as_slice()));
        assert!(csr.is_neighbor(1, 2));
        assert!(!csr.is_neighbor(0, 2));
    }

    #[test]
    fn construct_cdf() {
        let edges = build_edges();

        let csr = CSR::construct_from_edges(edges);
        let ccsr = CumCSR::convert(csr);

        assert_eq!(ccsr.0.rows, vec![0, 1, 4, 5]);
        assert_eq!(ccsr.0.columns, vec![1, 1, 2, 0, 0]);
        assert_eq!(ccsr.0.weights, vec![1., 3./15., 5./15., 15./15., 1.]);

        let p: Vec<_> = CDFtoP::new(ccsr.get_edges(1).1).collect();
        assert!((p[0] - 3. / 15.).abs() < 1e-6);
        assert!((p[1] - 2. / 15.).abs() < 1e-6);
        assert!((p[2] - 10. / 15.).abs() < 1e-6);
    }

    #[test]
    fn isolated_and_zero_weight_rows() {
        let edges = vec![(0, 1, 0.), (0, 2, 0.)];
        let csr = CSR::construct_with_nodes(5, edges);
        assert_eq!(csr.len(), 5);
        assert_eq!(csr.degree(4), 0);

        let ccsr = CumCSR::convert(csr);
        assert_eq!(ccsr.get_edges(0).1, &[0.5, 1.]);
        assert_eq!(ccsr.get_edges(3).0.len(), 0);
    }

}
