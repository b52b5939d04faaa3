//! Feature aggregators turn a node's set of feature embeddings into a single node embedding.
//! Every aggregator is differentiable: `aggregate` caches what the backward pass needs and
//! `backward` routes gradients to the feature embeddings and any learned parameters.
use std::fs::File;
use std::io::{BufReader,BufWriter,Write};
use std::path::Path;

use hashbrown::HashMap;
use serde::{Serialize,Deserialize};
use tracing::info;

use crate::algos::ep::attention::{AttentionCache,MultiHeadAttention};
use crate::algos::utils::{axpy,all_finite};
use crate::embeddings::EmbeddingStore;
use crate::error::{Error,Result};
use crate::feature_store::FeatureStore;

/// How a node's features are combined.
#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorConfig {
    /// Unweighted mean
    Averaged,

    /// Mean weighted by alpha / (alpha + p(f)), damping common features
    Weighted { alpha: f32 },

    /// Multi-head self attention with learned query/key projections of size `d_k`
    Attention { heads: usize, d_k: usize, context_window: Option<usize> }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            AggregatorConfig::Averaged => Ok(()),
            AggregatorConfig::Weighted { alpha } => {
                if !(alpha.is_finite() && *alpha > 0.) {
                    return Err(Error::InvalidConfig(format!("weighted alpha must be positive, got {}", alpha)))
                }
                Ok(())
            },
            AggregatorConfig::Attention { heads, d_k, .. } => {
                if *heads == 0 || *d_k == 0 {
                    return Err(Error::InvalidConfig("attention heads and dims must be non-zero".into()))
                }
                Ok(())
            }
        }
    }
}

/// Global unigram probability of each feature, computed over node associations.
#[derive(Clone,Debug)]
pub struct UnigramProbability {
    p_w: Vec<f32>
}

impl UnigramProbability {
    pub fn new(features: &FeatureStore) -> Self {
        let counts = features.count_features();
        let total = counts.iter().sum::<usize>().max(1);
        let p_w = counts.into_iter()
            .map(|c| c as f32 / total as f32)
            .collect();

        UnigramProbability { p_w }
    }

    pub fn from_vec(p_w: Vec<f32>) -> Self {
        UnigramProbability { p_w }
    }

    /// Features outside of the counted space are treated as never observed.
    #[inline]
    pub fn get(&self, feat_id: usize) -> f32 {
        self.p_w.get(feat_id).cloned().unwrap_or(0.)
    }

    pub fn iter(&self) -> impl Iterator<Item=&f32> {
        self.p_w.iter()
    }
}

/// Accumulated gradients for feature embeddings and aggregator parameters.
#[derive(Debug,Default)]
pub struct Gradients {
    pub features: HashMap<usize, Vec<f32>>,
    pub params: HashMap<usize, Vec<f32>>
}

impl Gradients {
    pub fn new() -> Self {
        Gradients::default()
    }

    pub fn add_feature(&mut self, feat_id: usize, scale: f32, grad: &[f32]) {
        let e = self.features.entry(feat_id).or_insert_with(|| vec![0.; grad.len()]);
        axpy(scale, grad, e);
    }

    pub fn add_param(&mut self, row: usize, scale: f32, grad: &[f32]) {
        let e = self.params.entry(row).or_insert_with(|| vec![0.; grad.len()]);
        axpy(scale, grad, e);
    }

    /// Folds another set of gradients into this one.
    pub fn merge(&mut self, other: Gradients) {
        for (feat_id, grad) in other.features.into_iter() {
            self.add_feature(feat_id, 1., &grad);
        }
        for (row, grad) in other.params.into_iter() {
            self.add_param(row, 1., &grad);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.features.values().all(|g| all_finite(g))
            && self.params.values().all(|g| all_finite(g))
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.params.is_empty()
    }
}

enum AggregationState {
    Mean,
    Weighted(Vec<f32>),
    Attention(AttentionCache)
}

/// Result of aggregating one set of features, along with the state needed for backprop.
pub struct Aggregation {
    features: Vec<usize>,
    inputs: Vec<Vec<f32>>,
    output: Vec<f32>,
    state: AggregationState
}

impl Aggregation {
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    pub fn features(&self) -> &[usize] {
        &self.features
    }

    pub fn into_output(self) -> Vec<f32> {
        self.output
    }
}

pub enum FeatureAggregator {
    Averaged,
    Weighted { alpha: f32, unigrams: UnigramProbability },
    Attention(MultiHeadAttention)
}

#[derive(Serialize,Deserialize)]
struct SavedAggregator {
    config: AggregatorConfig,
    dims: Option<usize>,
    unigrams: Option<Vec<f32>>,
    params: Option<Vec<f32>>
}

impl FeatureAggregator {

    /// Builds an aggregator for feature embeddings of size `dims`.  Weighted aggregators count
    /// feature frequencies from `features`; attention projections are randomly initialized from
    /// `seed`.
    pub fn new(
        config: &AggregatorConfig,
        features: &FeatureStore,
        dims: usize,
        seed: u64
    ) -> Result<Self> {
        config.validate()?;
        let agg = match config {
            AggregatorConfig::Averaged => FeatureAggregator::Averaged,
            AggregatorConfig::Weighted { alpha } => FeatureAggregator::Weighted {
                alpha: *alpha,
                unigrams: UnigramProbability::new(features)
            },
            AggregatorConfig::Attention { heads, d_k, context_window } => {
                FeatureAggregator::Attention(
                    MultiHeadAttention::new(*heads, *d_k, dims, *context_window, seed))
            }
        };
        Ok(agg)
    }

    pub fn config(&self) -> AggregatorConfig {
        match self {
            FeatureAggregator::Averaged => AggregatorConfig::Averaged,
            FeatureAggregator::Weighted { alpha, .. } => AggregatorConfig::Weighted { alpha: *alpha },
            FeatureAggregator::Attention(mha) => AggregatorConfig::Attention {
                heads: mha.heads,
                d_k: mha.d_k,
                context_window: mha.context_window()
            }
        }
    }

    /// Learnable parameters, if any.
    pub fn parameters(&self) -> Option<&EmbeddingStore> {
        match self {
            FeatureAggregator::Attention(mha) => Some(mha.params()),
            _ => None
        }
    }

    /// Checks the aggregator can operate on embeddings of size `dims`.
    pub fn check_dims(&self, dims: usize) -> Result<()> {
        match self {
            FeatureAggregator::Attention(mha) if mha.dims != dims => {
                Err(Error::DimensionMismatch { expected: dims, found: mha.dims })
            },
            _ => Ok(())
        }
    }

    /// Aggregates the embeddings of `feats`.  Order matters for windowed attention.
    pub fn aggregate(&self, feats: &[usize], embeddings: &EmbeddingStore) -> Aggregation {
        let dims = embeddings.dims();
        let inputs: Vec<_> = feats.iter().map(|f| embeddings.get_embedding(*f)).collect();
        let mut output = vec![0f32; dims];

        if inputs.is_empty() {
            return Aggregation { features: Vec::new(), inputs, output, state: AggregationState::Mean }
        }

        let state = match self {
            FeatureAggregator::Averaged => {
                let n = inputs.len() as f32;
                inputs.iter().for_each(|x| axpy(1., x, &mut output));
                output.iter_mut().for_each(|oi| *oi /= n);
                AggregationState::Mean
            },
            FeatureAggregator::Weighted { alpha, unigrams } => {
                let mut weights: Vec<f32> = feats.iter()
                    .map(|f| alpha / (alpha + unigrams.get(*f)))
                    .collect();
                let denom = weights.iter().sum::<f32>();
                weights.iter_mut().for_each(|w| *w /= denom);
                inputs.iter().zip(weights.iter()).for_each(|(x, w)| axpy(*w, x, &mut output));
                AggregationState::Weighted(weights)
            },
            FeatureAggregator::Attention(mha) => {
                AggregationState::Attention(mha.forward(&inputs, &mut output))
            }
        };

        Aggregation { features: feats.to_vec(), inputs, output, state }
    }

    /// Backpropagates `grad`, the gradient of the loss w.r.t. the aggregated output.
    pub fn backward(&self, agg: &Aggregation, grad: &[f32], grads: &mut Gradients) {
        if agg.features.is_empty() { return }

        match (&agg.state, self) {
            (AggregationState::Mean, _) => {
                let scale = 1. / agg.features.len() as f32;
                agg.features.iter().for_each(|f| grads.add_feature(*f, scale, grad));
            },
            (AggregationState::Weighted(weights), _) => {
                agg.features.iter().zip(weights.iter())
                    .for_each(|(f, w)| grads.add_feature(*f, *w, grad));
            },
            (AggregationState::Attention(cache), FeatureAggregator::Attention(mha)) => {
                let mut d_inputs = vec![vec![0f32; grad.len()]; agg.inputs.len()];
                mha.backward(&agg.inputs, cache, grad, &mut d_inputs, &mut grads.params);
                agg.features.iter().zip(d_inputs.iter())
                    .for_each(|(f, dx)| grads.add_feature(*f, 1., dx));
            },
            // Attention state is only ever produced by an attention aggregator
            (AggregationState::Attention(_), _) => {}
        }
    }

    /// Forward only construction, used when building node embeddings.
    pub fn construct(&self, feats: &[usize], embeddings: &EmbeddingStore, out: &mut [f32]) {
        let agg = self.aggregate(feats, embeddings);
        out.copy_from_slice(agg.output());
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let saved = match self {
            FeatureAggregator::Averaged => SavedAggregator {
                config: self.config(), dims: None, unigrams: None, params: None
            },
            FeatureAggregator::Weighted { unigrams, .. } => SavedAggregator {
                config: self.config(),
                dims: None,
                unigrams: Some(unigrams.iter().cloned().collect()),
                params: None
            },
            FeatureAggregator::Attention(mha) => SavedAggregator {
                config: self.config(),
                dims: Some(mha.dims),
                unigrams: None,
                params: Some(mha.params().to_vec())
            }
        };

        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(&mut writer, &saved)?;
        writer.flush()?;
        info!(path = %path.as_ref().display(), "Saved aggregator");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let saved: SavedAggregator = serde_json::from_reader(reader)?;
        saved.config.validate()?;

        match saved.config {
            AggregatorConfig::Averaged => Ok(FeatureAggregator::Averaged),
            AggregatorConfig::Weighted { alpha } => {
                let p_w = saved.unigrams.ok_or_else(|| {
                    Error::InvalidConfig("weighted aggregator is missing unigram probabilities".into())
                })?;
                Ok(FeatureAggregator::Weighted { alpha, unigrams: UnigramProbability::from_vec(p_w) })
            },
            AggregatorConfig::Attention { heads, d_k, context_window } => {
                let (dims, params) = match (saved.dims, saved.params) {
                    (Some(dims), Some(params)) => (dims, params),
                    _ => return Err(Error::InvalidConfig("attention aggregator is missing parameters".into()))
                };
                let expected = heads * 2 * d_k * dims;
                if params.len() != expected {
                    return Err(Error::DimensionMismatch { expected, found: params.len() })
                }
                Ok(FeatureAggregator::Attention(
                    MultiHeadAttention::from_params(heads, d_k, dims, context_window, params)))
            }
        }
    }
}
