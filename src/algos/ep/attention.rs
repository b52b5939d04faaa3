//! Multi-head scaled dot product attention over a node's features.  Each head projects feature
//! embeddings into queries and keys; values are the feature embeddings themselves.  The node
//! vector is the mean of the attended values across heads and positions.
use hashbrown::HashMap;
use float_ord::FloatOrd;
use rand::prelude::*;
use rand_xorshift::XorShiftRng;

use crate::distance::Distance;
use crate::embeddings::EmbeddingStore;
use crate::algos::utils::{dot,axpy};

#[derive(Copy,Clone,Debug,PartialEq)]
pub enum AttentionType {
    Full,
    Sliding(usize)
}

impl AttentionType {
    pub fn new(context_window: Option<usize>) -> Self {
        match context_window {
            Some(window) => AttentionType::Sliding(window),
            None         => AttentionType::Full
        }
    }

    /// Positions row `i` is allowed to attend to.
    #[inline]
    fn span(&self, i: usize, n: usize) -> (usize, usize) {
        match self {
            AttentionType::Full => (0, n),
            AttentionType::Sliding(window) => {
                let start = if *window > i { 0 } else { i - window };
                let stop = (i + window + 1).min(n);
                (start, stop)
            }
        }
    }
}

#[derive(Copy,Clone,Debug)]
enum Projection {
    Query,
    Key
}

pub struct MultiHeadAttention {
    pub heads: usize,
    pub d_k: usize,
    pub dims: usize,
    pub attention: AttentionType,

    /// Rows are laid out per head as d_k query rows followed by d_k key rows, each of width
    /// `dims`.
    params: EmbeddingStore
}

type AttentionMatrix = Vec<Vec<Option<f32>>>;

struct HeadCache {
    wq: Vec<f32>,
    wk: Vec<f32>,
    queries: Vec<Vec<f32>>,
    keys: Vec<Vec<f32>>,
    attention: AttentionMatrix,
    col_sums: Vec<f32>
}

/// Forward state needed to backpropagate through attention.
pub struct AttentionCache {
    heads: Vec<HeadCache>
}

impl MultiHeadAttention {
    pub fn new(
        heads: usize,
        d_k: usize,
        dims: usize,
        context_window: Option<usize>,
        seed: u64
    ) -> Self {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let scale = 1f32 / (dims as f32).sqrt();
        let data = (0..(heads * 2 * d_k * dims))
            .map(|_| scale * (2f32 * rng.gen::<f32>() - 1f32))
            .collect();
        let params = EmbeddingStore::from_vec(dims, data, Distance::Dot);
        MultiHeadAttention { heads, d_k, dims, attention: AttentionType::new(context_window), params }
    }

    /// Rebuilds an attention block from previously learned projections.
    pub fn from_params(
        heads: usize,
        d_k: usize,
        dims: usize,
        context_window: Option<usize>,
        params: Vec<f32>
    ) -> Self {
        let params = EmbeddingStore::from_vec(dims, params, Distance::Dot);
        MultiHeadAttention { heads, d_k, dims, attention: AttentionType::new(context_window), params }
    }

    pub fn context_window(&self) -> Option<usize> {
        match self.attention {
            AttentionType::Full => None,
            AttentionType::Sliding(w) => Some(w)
        }
    }

    pub fn params(&self) -> &EmbeddingStore {
        &self.params
    }

    pub fn num_param_rows(&self) -> usize {
        self.heads * 2 * self.d_k
    }

    #[inline]
    fn row_offset(&self, head: usize, proj: Projection) -> usize {
        let base = head * 2 * self.d_k;
        match proj {
            Projection::Query => base,
            Projection::Key   => base + self.d_k
        }
    }

    fn read_block(&self, head: usize, proj: Projection) -> Vec<f32> {
        let offset = self.row_offset(head, proj);
        let mut block = vec![0f32; self.d_k * self.dims];
        block.chunks_mut(self.dims).enumerate().for_each(|(r, row)| {
            self.params.read_into(offset + r, row);
        });
        block
    }

    fn project(&self, w: &[f32], x: &[f32]) -> Vec<f32> {
        w.chunks(self.dims).map(|row| dot(row, x)).collect()
    }

    /// Writes the attended mean of `inputs` into `out`.  A single input is returned as is.
    pub fn forward(&self, inputs: &[Vec<f32>], out: &mut [f32]) -> AttentionCache {
        out.iter_mut().for_each(|oi| *oi = 0.);
        let n = inputs.len();
        if n == 0 {
            return AttentionCache { heads: Vec::new() }
        }

        let scale = 1f32 / (self.d_k as f32).sqrt();
        let mut heads = Vec::with_capacity(self.heads);
        for head in 0..self.heads {
            let wq = self.read_block(head, Projection::Query);
            let wk = self.read_block(head, Projection::Key);
            let queries: Vec<_> = inputs.iter().map(|x| self.project(&wq, x)).collect();
            let keys: Vec<_> = inputs.iter().map(|x| self.project(&wk, x)).collect();

            let scores = compute_attention_matrix(&queries, &keys, self.attention, scale);
            let attention = compute_attention_softmax(scores);

            let mut col_sums = vec![0f32; n];
            attention.iter().for_each(|row| {
                row.iter().zip(col_sums.iter_mut()).for_each(|(a, cs)| {
                    if let Some(a) = a { *cs += a; }
                });
            });

            heads.push(HeadCache { wq, wk, queries, keys, attention, col_sums });
        }

        let denom = (self.heads * n) as f32;
        for hc in heads.iter() {
            inputs.iter().zip(hc.col_sums.iter()).for_each(|(x, cs)| {
                axpy(cs / denom, x, out);
            });
        }

        AttentionCache { heads }
    }

    /// Accumulates gradients for the inputs into `d_inputs` and for the projections into
    /// `d_params`, keyed by parameter row.
    pub fn backward(
        &self,
        inputs: &[Vec<f32>],
        cache: &AttentionCache,
        grad: &[f32],
        d_inputs: &mut [Vec<f32>],
        d_params: &mut HashMap<usize, Vec<f32>>
    ) {
        let n = inputs.len();
        if n == 0 { return }

        let scale = 1f32 / (self.d_k as f32).sqrt();
        let denom = (self.heads * n) as f32;
        let g_out: Vec<f32> = grad.iter().map(|gi| gi / denom).collect();

        // Gradient of the output w.r.t. each attention weight only depends on the column
        let g_attn: Vec<f32> = inputs.iter().map(|x| dot(&g_out, x)).collect();

        for (head, hc) in cache.heads.iter().enumerate() {
            // Value path
            d_inputs.iter_mut().zip(hc.col_sums.iter()).for_each(|(dx, cs)| {
                axpy(*cs, &g_out, dx);
            });

            // Softmax and score path
            let mut d_queries = vec![vec![0f32; self.d_k]; n];
            let mut d_keys = vec![vec![0f32; self.d_k]; n];
            for (i, row) in hc.attention.iter().enumerate() {
                let expected: f32 = row.iter().zip(g_attn.iter())
                    .filter_map(|(a, g)| a.map(|a| a * g))
                    .sum();

                for (j, a) in row.iter().enumerate() {
                    if let Some(a) = a {
                        let d_score = a * (g_attn[j] - expected) * scale;
                        if d_score == 0. { continue }
                        axpy(d_score, &hc.keys[j], &mut d_queries[i]);
                        axpy(d_score, &hc.queries[i], &mut d_keys[j]);
                    }
                }
            }

            // Projections
            let q_offset = self.row_offset(head, Projection::Query);
            let k_offset = self.row_offset(head, Projection::Key);
            for r in 0..self.d_k {
                let wq_r = &hc.wq[r * self.dims..(r + 1) * self.dims];
                let wk_r = &hc.wk[r * self.dims..(r + 1) * self.dims];
                let mut d_wq = vec![0f32; self.dims];
                let mut d_wk = vec![0f32; self.dims];
                for (i, x) in inputs.iter().enumerate() {
                    let dq = d_queries[i][r];
                    let dk = d_keys[i][r];
                    axpy(dq, x, &mut d_wq);
                    axpy(dk, x, &mut d_wk);
                    axpy(dq, wq_r, &mut d_inputs[i]);
                    axpy(dk, wk_r, &mut d_inputs[i]);
                }
                accumulate(d_params, q_offset + r, &d_wq);
                accumulate(d_params, k_offset + r, &d_wk);
            }
        }
    }
}

fn accumulate(grads: &mut HashMap<usize, Vec<f32>>, key: usize, grad: &[f32]) {
    let e = grads.entry(key).or_insert_with(|| vec![0.; grad.len()]);
    axpy(1., grad, e);
}

fn compute_attention_matrix(
    queries: &[Vec<f32>],
    keys: &[Vec<f32>],
    attention: AttentionType,
    scale: f32
) -> AttentionMatrix {
    let n = queries.len();
    let mut scaled = vec![vec![None; n]; n];
    for i in 0..n {
        let (j_start, j_end) = attention.span(i, n);
        let row = &mut scaled[i];
        for j in j_start..j_end {
            row[j] = Some(dot(&queries[i], &keys[j]) * scale);
        }
    }
    scaled
}

fn compute_attention_softmax(mut attention_matrix: AttentionMatrix) -> AttentionMatrix {
    attention_matrix.iter_mut().for_each(|row| {
        let max_value = row.iter()
            .filter_map(|x| x.map(FloatOrd))
            .max()
            .map(|v| v.0)
            .unwrap_or(0.);

        let mut denom = 0f32;
        row.iter_mut().for_each(|ri| {
            if let Some(v) = ri {
                *v = (*v - max_value).exp();
                denom += *v;
            }
        });

        row.iter_mut().for_each(|ri| {
            if let Some(v) = ri { *v /= denom; }
        });
    });
    attention_matrix
}

/// Numerically stable softmax.
pub fn softmax(numers: &mut [f32]) {
    let max_value = numers.iter().map(|v| FloatOrd(*v)).max().map(|v| v.0).unwrap_or(0.);
    let mut denom = 0f32;
    numers.iter_mut().for_each(|v| {
        *v = (*v - max_value).exp();
        denom += *v;
    });
    numers.iter_mut().for_each(|v| *v /= denom);
}
