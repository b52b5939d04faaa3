//! Defines the embedding propagation algorithm.  It needs to be rebranded since the actual paper
//! defines it around a loss which we instead parameterize.
mod optimizer;
mod node_sampler;
pub mod loss;
pub mod model;
pub mod attention;
mod scheduler;

use std::fmt::Write;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xorshift::XorShiftRng;
use serde::{Serialize,Deserialize};
use tracing::{debug,info,warn};

use crate::algos::aggregator::{FeatureAggregator,Gradients};
use crate::algos::utils::random_unit_vector;
use crate::distance::Distance;
use crate::embeddings::EmbeddingStore;
use crate::error::{Error,Result};
use crate::feature_store::FeatureStore;
use crate::graph::{CDFGraph,NodeID};
use crate::progress::CLProgressBar;
use crate::sampler::NeighborSampler;

use self::optimizer::{Optimizer,AdamOptimizer};
use self::node_sampler::{NodeSampler,RandomWalkHardSampler};
use self::model::{Composite,NodeModel};
use self::scheduler::LRScheduler;

pub use self::loss::{Loss,LossOutput,LossWeighting,ObjectiveOptions,Similarity};
pub use self::node_sampler::{ppr_neighborhood,ppr_walk,PPR_MAX_STEPS};

/// Defines the propagator
#[derive(Clone,Debug,Serialize,Deserialize)]
#[serde(default)]
pub struct EmbeddingPropagation {
    /// Learning rate for updating feature embeddings
    pub alpha: f32,

    /// Loss to minimize.
    pub loss: Loss,

    /// Similarity the loss is computed over
    pub similarity: Similarity,

    /// Scales each example's loss by the anchor's degree
    pub loss_weighting: LossWeighting,

    /// Batch size to use.  Larger batches have fewer updates, but also lower variance
    pub batch_size: usize,

    /// Size of the feature and node embeddings
    pub dims: usize,

    /// Number of passes to optimize for
    pub passes: usize,

    /// Neighbors averaged into the positive.  A single sampled neighbor when unset.
    pub max_nodes: Option<usize>,

    /// Features sampled per node
    pub max_features: Option<usize>,

    /// Sample neighbors proportional to edge weight
    pub weighted_neighbor_sampling: bool,

    /// Weight reconstructed neighbors by edge weight
    pub weighted_neighbor_averaging: bool,

    /// Number of negatives drawn two hops out from the anchor
    pub hard_negatives: usize,

    /// Random seed
    pub seed: u64,

    /// We split out valid_pct of nodes to use for validation.
    pub valid_pct: f32,

    /// If added, we add noise to the gradients as a way to regularize the results; this can be
    /// useful when the model overfits and validation start to diverge.
    pub noise: f32,

    /// Whether to show a pretty indicator
    pub indicator: bool
}

impl Default for EmbeddingPropagation {
    fn default() -> Self {
        EmbeddingPropagation {
            alpha: 9e-1,
            loss: Loss::MarginLoss { margin: 1., negatives: 10 },
            similarity: Similarity::Cosine,
            loss_weighting: LossWeighting::None,
            batch_size: 128,
            dims: 100,
            passes: 200,
            max_nodes: None,
            max_features: None,
            weighted_neighbor_sampling: false,
            weighted_neighbor_averaging: false,
            hard_negatives: 0,
            seed: 20222022,
            valid_pct: 0.1,
            noise: 0.,
            indicator: true
        }
    }
}

/// Summary of a single pass, handed to observers.
#[derive(Clone,Debug,PartialEq)]
pub struct PassStats {
    pub pass: usize,
    pub train_loss: f32,
    pub valid_loss: Option<f32>,

    /// Examples dropped due to non-finite losses or gradients
    pub skipped: usize
}

#[derive(Copy,Clone,Debug,PartialEq)]
pub enum TrainingPhase {
    Initialized,
    Training(usize),
    Validating(usize),
    Converged,
    Stopped
}

struct ForwardPass {
    anchor: Composite,
    positive: Composite,
    negatives: Vec<Composite>,
    output: LossOutput
}

enum Example {
    Unused,
    Skipped,
    Trained(f32, Gradients)
}

#[derive(Default)]
struct BatchResult {
    error: f32,
    count: usize,
    skipped: usize
}

impl EmbeddingPropagation {

    pub fn from_json(json: &str) -> Result<Self> {
        let ep: EmbeddingPropagation = serde_json::from_str(json)?;
        ep.validate()?;
        Ok(ep)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks the configuration before any work is done.
    pub fn validate(&self) -> Result<()> {
        if self.dims == 0 {
            return Err(Error::InvalidConfig("dims must be greater than zero".into()))
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be greater than zero".into()))
        }
        if !(self.alpha.is_finite() && self.alpha > 0.) {
            return Err(Error::InvalidConfig(format!("alpha must be positive, got {}", self.alpha)))
        }
        if !(self.valid_pct >= 0. && self.valid_pct < 1.) {
            return Err(Error::InvalidConfig(format!("valid_pct must be in [0, 1), got {}", self.valid_pct)))
        }
        if !(self.noise.is_finite() && self.noise >= 0.) {
            return Err(Error::InvalidConfig(format!("noise must be non-negative, got {}", self.noise)))
        }
        if let LossWeighting::Exponential(w) = self.loss_weighting {
            if !w.is_finite() {
                return Err(Error::InvalidConfig(format!("loss weighting exponent must be finite, got {}", w)))
            }
        }
        self.loss.validate()
    }

    fn model(&self) -> NodeModel {
        NodeModel {
            max_features: self.max_features,
            max_nodes: self.max_nodes.unwrap_or(1),
            sampler: NeighborSampler::new(self.weighted_neighbor_sampling),
            weighted_averaging: self.weighted_neighbor_averaging
        }
    }

    /// Learns the feature embeddings.
    pub fn learn<G: CDFGraph + Send + Sync>(
        &self,
        graph: &G,
        features: &FeatureStore,
        feature_embeddings: Option<EmbeddingStore>,
        aggregator: &FeatureAggregator
    ) -> Result<EmbeddingStore> {
        self.learn_with_observer(graph, features, feature_embeddings, aggregator,
                                 |_| ControlFlow::Continue(()))
    }

    /// Learns the feature embeddings, calling `observer` after every pass.  Returning
    /// `ControlFlow::Break` stops training after the current pass.
    pub fn learn_with_observer<G, F>(
        &self,
        graph: &G,
        features: &FeatureStore,
        feature_embeddings: Option<EmbeddingStore>,
        aggregator: &FeatureAggregator,
        observer: F
    ) -> Result<EmbeddingStore>
    where
        G: CDFGraph + Send + Sync,
        F: FnMut(&PassStats) -> ControlFlow<()>
    {
        let (embeddings, _phase) = self.train(graph, features, feature_embeddings, aggregator, observer)?;
        Ok(embeddings)
    }

    // Returns the embeddings along with the phase training ended in
    fn train<G, F>(
        &self,
        graph: &G,
        features: &FeatureStore,
        feature_embeddings: Option<EmbeddingStore>,
        aggregator: &FeatureAggregator,
        mut observer: F
    ) -> Result<(EmbeddingStore, TrainingPhase)>
    where
        G: CDFGraph + Send + Sync,
        F: FnMut(&PassStats) -> ControlFlow<()>
    {
        self.validate()?;
        features.validate()?;
        aggregator.check_dims(self.dims)?;
        if features.num_nodes() < graph.len() {
            return Err(Error::InvalidConfig(format!(
                "feature store covers {} nodes but the graph has {}", features.num_nodes(), graph.len())))
        }

        let mut rng = XorShiftRng::seed_from_u64(self.seed);

        let feature_embeddings = match feature_embeddings {
            Some(embs) => {
                if embs.dims() != self.dims {
                    return Err(Error::DimensionMismatch { expected: self.dims, found: embs.dims() })
                }
                if embs.len() != features.num_features() {
                    return Err(Error::InvalidConfig(format!(
                        "warm start has {} embeddings but there are {} features",
                        embs.len(), features.num_features())))
                }
                embs
            },
            None => {
                let fe = EmbeddingStore::new(features.num_features(), self.dims, Distance::Cosine);
                randomize_embedding_store(&fe, &mut rng);
                fe
            }
        };

        let mut phase = TrainingPhase::Initialized;
        debug!(?phase, features = feature_embeddings.len(), dims = self.dims, "Embedding table ready");
        if self.passes == 0 {
            info!("No passes requested, returning embeddings untouched");
            return Ok((feature_embeddings, phase))
        }

        // Right now we hard code the parameters for the optimizer but in the future we could allow
        // for this to be parameterized.
        let optimizer = AdamOptimizer::new(0.9, 0.999,
            feature_embeddings.dims(),
            feature_embeddings.len());

        let param_optimizer = aggregator.parameters()
            .map(|p| AdamOptimizer::new(0.9, 0.999, p.dims(), p.len()));

        // Pull out validation idxs
        let mut node_idxs: Vec<_> = (0..graph.len()).collect();
        node_idxs.shuffle(&mut rng);
        let valid_count = (graph.len() as f32 * self.valid_pct) as usize;
        let mut valid_idxs = node_idxs.split_off(graph.len() - valid_count);
        valid_idxs.sort_unstable();

        // Negatives are drawn from a stable copy while node_idxs gets shuffled every pass
        let mut train_idxs = node_idxs.clone();
        train_idxs.sort_unstable();

        let steps_per_pass = (node_idxs.len() + self.batch_size - 1) / self.batch_size;
        let total_updates = steps_per_pass * self.passes;

        let pb = CLProgressBar::new(total_updates as u64, self.indicator);

        let lr_scheduler = {
            let warm_up_steps = (total_updates as f32 / 5f32) as usize;
            LRScheduler::cos_decay(self.alpha / 100f32, self.alpha, warm_up_steps, total_updates)
        };

        let noise_scheduler = if self.noise > 1e-9 {
            let min_noise = 1e-9f32;
            let decay = (((min_noise.ln()) - self.noise.ln()) / (total_updates.max(1) as f32)).exp();
            LRScheduler::exp_decay(0.0, self.noise, decay)
        } else {
            LRScheduler::noop()
        };

        let model = self.model();
        let random_sampler = RandomWalkHardSampler::new(self.hard_negatives, &train_idxs);
        let valid_random_sampler = RandomWalkHardSampler::new(self.hard_negatives, &valid_idxs);

        let step = AtomicUsize::new(1);
        let mut last_error = std::f32::INFINITY;
        let mut valid_error = None;

        for pass in 1..(self.passes + 1) {
            phase = TrainingPhase::Training(pass);
            debug!(?phase, "Starting pass");

            pb.update_message(|msg| {
                msg.clear();
                let cur_step = step.load(Ordering::Relaxed);
                let alpha = lr_scheduler.compute(cur_step);
                let noise = noise_scheduler.compute(cur_step);
                let _ = write!(msg, "Pass {}/{}, Train: {:.5}, Valid: {:.5}, LR: {:.5}, Noise: {:.5}",
                    pass, self.passes, last_error, valid_error.unwrap_or(std::f32::INFINITY),
                    alpha, noise);
            });

            // Shuffle for SGD
            node_idxs.shuffle(&mut rng);
            let batches: Vec<BatchResult> = node_idxs.par_chunks(self.batch_size).enumerate().map(|(i, nodes)| {

                let examples: Vec<_> = nodes.par_iter().map(|node_id| {
                    let seed = self.seed
                        .wrapping_add((pass * graph.len()) as u64)
                        .wrapping_add(*node_id as u64);
                    let mut rng = XorShiftRng::seed_from_u64(seed);
                    let fp = self.run_forward_pass(graph, *node_id, features, &feature_embeddings,
                                                   &model, aggregator, &random_sampler, &mut rng);

                    match fp {
                        None => Example::Unused,
                        Some(fp) if !fp.output.is_finite() => Example::Skipped,
                        Some(fp) => {
                            let grads = self.extract_gradients(&fp, aggregator);
                            if grads.is_finite() {
                                Example::Trained(fp.output.loss, grads)
                            } else {
                                Example::Skipped
                            }
                        }
                    }
                }).collect();

                // Since we're dealing with multiple reconstructions with likely shared features,
                // we aggregate all the gradients
                let mut result = BatchResult::default();
                let mut all_grads = Gradients::new();
                for example in examples.into_iter() {
                    match example {
                        Example::Unused => {},
                        Example::Skipped => result.skipped += 1,
                        Example::Trained(err, grads) => {
                            all_grads.merge(grads);
                            result.error += err;
                            result.count += 1;
                        }
                    }
                }

                let cur_step = step.fetch_add(1, Ordering::Relaxed);

                if result.count > 0 && !all_grads.is_empty() {
                    // Add gaussian noise to help regulate embeddings
                    if self.noise > 0.0 {
                        let noise = noise_scheduler.compute(cur_step);
                        let batch_seed = self.seed.wrapping_add((i + pass * steps_per_pass) as u64);
                        add_noise(&mut all_grads, noise, batch_seed);
                    }

                    // Zero based update count for bias correction
                    let alpha = lr_scheduler.compute(cur_step);
                    let t = (cur_step - 1) as f32;
                    optimizer.update(&feature_embeddings, all_grads.features, alpha, t);
                    if let (Some(opt), Some(params)) = (&param_optimizer, aggregator.parameters()) {
                        opt.update(params, all_grads.params, alpha, t);
                    }
                }

                pb.inc(1);
                result
            }).collect();

            let (error, count, skipped) = batches.iter()
                .fold((0f32, 0usize, 0usize), |(e, c, s), b| (e + b.error, c + b.count, s + b.skipped));

            last_error = if count > 0 { error / count as f32 } else { 0. };
            if skipped > 0 {
                warn!(pass, skipped, "Skipped examples with non-finite loss or gradients");
            }

            if !valid_idxs.is_empty() {
                phase = TrainingPhase::Validating(pass);
                debug!(?phase, "Computing validation loss");
                valid_error = Some(self.validation_loss(graph, features, &feature_embeddings,
                    &model, aggregator, &valid_idxs, &valid_random_sampler));
            }

            let stats = PassStats { pass, train_loss: last_error, valid_loss: valid_error, skipped };
            info!(pass, train_loss = stats.train_loss, valid_loss = ?stats.valid_loss, skipped, "Finished pass");

            if let ControlFlow::Break(()) = observer(&stats) {
                phase = TrainingPhase::Stopped;
                break
            }
        }

        if !matches!(phase, TrainingPhase::Stopped) {
            phase = TrainingPhase::Converged;
        }

        pb.finish();
        info!(?phase, "Training finished");
        Ok((feature_embeddings, phase))
    }

    // Validate.  We use the same random seed for consistency across iterations.
    fn validation_loss<G: CDFGraph + Send + Sync, S: NodeSampler + Sync>(
        &self,
        graph: &G,
        features: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        model: &NodeModel,
        aggregator: &FeatureAggregator,
        valid_idxs: &[NodeID],
        sampler: &S
    ) -> f32 {
        let (error, count) = valid_idxs.par_iter().map(|node_id| {
            let seed = self.seed.wrapping_sub(1).wrapping_add(*node_id as u64);
            let mut rng = XorShiftRng::seed_from_u64(seed);
            let fp = self.run_forward_pass(graph, *node_id, features, feature_embeddings,
                                           model, aggregator, sampler, &mut rng);
            match fp {
                Some(fp) if fp.output.loss.is_finite() => (fp.output.loss, 1usize),
                _ => (0f32, 0usize)
            }
        }).reduce(|| (0f32, 0usize), |a, b| (a.0 + b.0, a.1 + b.1));

        if count > 0 { error / count as f32 } else { 0. }
    }

    fn run_forward_pass<G: CDFGraph, S: NodeSampler, R: Rng>(
        &self,
        graph: &G,
        node: NodeID,
        features: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        model: &NodeModel,
        aggregator: &FeatureAggregator,
        sampler: &S,
        rng: &mut R
    ) -> Option<ForwardPass> {
        // h(v)
        let anchor = model.construct_node_embedding(
            node, features, feature_embeddings, aggregator, rng);
        if anchor.is_empty() { return None }

        // ~h(v)
        let positive = match self.loss {
            Loss::PPR { num, restart_p, .. } => model.ppr_node_embedding(
                graph, node, num, restart_p, features, feature_embeddings, aggregator, rng),
            _ => model.reconstruct_node_embedding(
                graph, node, features, feature_embeddings, aggregator, rng)
        }?;

        // h(u)
        let num_negs = self.loss.negatives();
        let mut negative_ids = Vec::with_capacity(num_negs);
        sampler.sample_negatives(graph, node, &mut negative_ids, num_negs, rng);

        let negatives: Vec<_> = negative_ids.into_iter().map(|neg_node| {
            model.construct_node_embedding(neg_node, features, feature_embeddings, aggregator, rng)
        }).collect();
        let hus: Vec<Vec<f32>> = negatives.iter().map(|hu| hu.output().to_vec()).collect();

        // Compute error
        let mut output = self.loss.compute(self.similarity, anchor.output(), positive.output(), &hus);
        output.scale(self.loss_weighting.weight(graph.degree(node)));

        Some(ForwardPass { anchor, positive, negatives, output })
    }

    fn extract_gradients(&self, fp: &ForwardPass, aggregator: &FeatureAggregator) -> Gradients {
        let mut grads = Gradients::new();
        if fp.output.loss == 0. { return grads }

        fp.anchor.backward(aggregator, &fp.output.d_anchor, &mut grads);
        fp.positive.backward(aggregator, &fp.output.d_positive, &mut grads);
        fp.negatives.iter().zip(fp.output.d_negatives.iter()).for_each(|(hu, d_hu)| {
            hu.backward(aggregator, d_hu, &mut grads);
        });
        grads
    }
}

fn add_noise(grads: &mut Gradients, noise: f32, seed: u64) {
    let perturb = |key: usize, grad: &mut Vec<f32>, offset: u64| {
        let mut rng = XorShiftRng::seed_from_u64(seed.wrapping_add(offset).wrapping_add(key as u64));
        grad.iter_mut().for_each(|gi| {
            *gi += noise * rng.sample::<f32,StandardNormal>(StandardNormal);
        });
    };
    grads.features.par_iter_mut().for_each(|(feat, grad)| perturb(*feat, grad, 0));
    grads.params.par_iter_mut().for_each(|(row, grad)| perturb(*row, grad, 1 << 32));
}

// Randomize embeddings uniformly on the unit sphere.
fn randomize_embedding_store(es: &EmbeddingStore, rng: &mut impl Rng) {
    let mut e = vec![0f32; es.dims()];
    for idx in 0..es.len() {
        random_unit_vector(&mut e, rng);
        es.set_embedding(idx, &e);
    }
}

#[cfg(test)]
mod ep_tests {
    use super::*;
    use crate::algos::aggregator::AggregatorConfig;
    use crate::graph::{CumCSR,CSR,Graph};

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

    fn build_ep() -> EmbeddingPropagation {
        EmbeddingPropagation {
            alpha: 1e-2,
            loss: Loss::MarginLoss { margin: 1., negatives: 1 },
            batch_size: 32,
            dims: 5,
            valid_pct: 0.0,
            passes: 5,
            seed: 202220222,
            indicator: false,
            ..Default::default()
        }
    }

    fn build_inputs() -> (CumCSR, FeatureStore) {
        let ccsr = CumCSR::convert(CSR::construct_from_edges(build_clique_edges(20)));
        let mut feature_store = FeatureStore::new(ccsr.len(), "feat".to_string());
        feature_store.fill_missing_nodes();
        (ccsr, feature_store)
    }

    #[test]
    fn test_simple_learn() {
        let (ccsr, feature_store) = build_inputs();
        let ep = EmbeddingPropagation { valid_pct: 0.2, ..build_ep() };

        let mut seen = Vec::new();
        let embeddings = ep.learn_with_observer(&ccsr, &feature_store, None, &FeatureAggregator::Averaged, |stats| {
            seen.push(stats.clone());
            ControlFlow::Continue(())
        }).unwrap();

        assert_eq!(embeddings.len(), feature_store.num_features());
        assert_eq!(embeddings.dims(), 5);
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|s| s.train_loss.is_finite() && s.valid_loss.is_some()));
        assert!(embeddings.to_vec().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_observer_stops() {
        let (ccsr, feature_store) = build_inputs();
        let ep = build_ep();
        let mut calls = 0;
        ep.learn_with_observer(&ccsr, &feature_store, None, &FeatureAggregator::Averaged, |stats| {
            calls += 1;
            if stats.pass == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
        }).unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_final_phase() {
        let (ccsr, feature_store) = build_inputs();
        let ep = build_ep();
        let agg = FeatureAggregator::Averaged;

        let (_, phase) = ep.train(&ccsr, &feature_store, None, &agg, |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(phase, TrainingPhase::Converged);

        let (_, phase) = ep.train(&ccsr, &feature_store, None, &agg, |stats| {
            if stats.pass == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
        }).unwrap();
        assert_eq!(phase, TrainingPhase::Stopped);

        let ep = EmbeddingPropagation { passes: 0, ..build_ep() };
        let (_, phase) = ep.train(&ccsr, &feature_store, None, &agg, |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(phase, TrainingPhase::Initialized);
    }

    #[test]
    fn test_warm_start_passthrough() {
        let (ccsr, feature_store) = build_inputs();
        let ep = EmbeddingPropagation { passes: 0, ..build_ep() };
        let data: Vec<f32> = (0..(20 * 5)).map(|i| i as f32 / 10.).collect();
        let warm = EmbeddingStore::from_vec(5, data.clone(), Distance::Cosine);
        let out = ep.learn(&ccsr, &feature_store, Some(warm), &FeatureAggregator::Averaged).unwrap();
        assert_eq!(out.to_vec(), data);
    }

    #[test]
    fn test_config_errors() {
        let (ccsr, feature_store) = build_inputs();

        let warm = EmbeddingStore::new(20, 3, Distance::Cosine);
        let res = build_ep().learn(&ccsr, &feature_store, Some(warm), &FeatureAggregator::Averaged);
        assert!(matches!(res, Err(Error::DimensionMismatch { expected: 5, found: 3 })));

        let ep = EmbeddingPropagation { batch_size: 0, ..build_ep() };
        assert!(matches!(ep.learn(&ccsr, &feature_store, None, &FeatureAggregator::Averaged),
                         Err(Error::InvalidConfig(_))));

        let config = AggregatorConfig::Attention { heads: 1, d_k: 2, context_window: None };
        let agg = FeatureAggregator::new(&config, &feature_store, 8, 0).unwrap();
        assert!(matches!(build_ep().learn(&ccsr, &feature_store, None, &agg),
                         Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_non_finite_skipped() {
        let (ccsr, feature_store) = build_inputs();
        let ep = EmbeddingPropagation {
            similarity: Similarity::Dot,
            passes: 1,
            ..build_ep()
        };
        let data = vec![1e30f32; 20 * 5];
        let warm = EmbeddingStore::from_vec(5, data.clone(), Distance::Cosine);

        let mut skipped = 0;
        let out = ep.learn_with_observer(&ccsr, &feature_store, Some(warm), &FeatureAggregator::Averaged, |stats| {
            skipped = stats.skipped;
            ControlFlow::Continue(())
        }).unwrap();

        assert_eq!(skipped, 20);
        assert_eq!(out.to_vec(), data);
    }

    #[test]
    fn test_attention_learns_params() {
        let (ccsr, _) = build_inputs();

        // Attention over a single feature is a passthrough, so give every node a few
        let assoc = (0..20).map(|i| vec![i % 10, (i + 3) % 10, (i + 7) % 10]).collect();
        let feature_store = FeatureStore::from_raw(10, "feat".into(), assoc).unwrap();
        let config = AggregatorConfig::Attention { heads: 2, d_k: 2, context_window: Some(1) };
        let agg = FeatureAggregator::new(&config, &feature_store, 5, 7).unwrap();
        let before = agg.parameters().unwrap().to_vec();

        let ep = EmbeddingPropagation { max_nodes: Some(4), passes: 2, ..build_ep() };
        let embeddings = ep.learn(&ccsr, &feature_store, None, &agg).unwrap();

        assert!(embeddings.to_vec().iter().all(|x| x.is_finite()));
        let after = agg.parameters().unwrap().to_vec();
        assert!(after.iter().all(|x| x.is_finite()));
        assert_ne!(before, after);
    }

    #[test]
    fn test_positive_defaults_to_one_neighbor() {
        assert_eq!(build_ep().model().max_nodes, 1);
        let ep = EmbeddingPropagation { loss: Loss::StarSpace { margin: 1., negatives: 2 }, ..build_ep() };
        assert_eq!(ep.model().max_nodes, 1);
        let ep = EmbeddingPropagation { max_nodes: Some(10), ..build_ep() };
        assert_eq!(ep.model().max_nodes, 10);
    }

    #[test]
    fn test_ppr_and_weighting() {
        let (ccsr, feature_store) = build_inputs();
        let ep = EmbeddingPropagation {
            loss: Loss::PPR { margin: 1., num: 3, restart_p: 0.5 },
            loss_weighting: LossWeighting::Log,
            hard_negatives: 1,
            noise: 1e-3,
            ..build_ep()
        };
        let embeddings = ep.learn(&ccsr, &feature_store, None, &FeatureAggregator::Averaged).unwrap();
        assert!(embeddings.to_vec().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_json_config() {
        let ep = EmbeddingPropagation {
            loss: Loss::RankSpace { tau: 0.5, negatives: 3 },
            loss_weighting: LossWeighting::Exponential(0.5),
            ..build_ep()
        };
        let json = ep.to_json().unwrap();
        let parsed = EmbeddingPropagation::from_json(&json).unwrap();
        assert_eq!(parsed.loss, ep.loss);
        assert_eq!(parsed.loss_weighting, ep.loss_weighting);
        assert_eq!(parsed.dims, ep.dims);

        // Missing fields fall back to defaults
        let parsed = EmbeddingPropagation::from_json(r#"{"dims": 16}"#).unwrap();
        assert_eq!(parsed.dims, 16);
        assert_eq!(parsed.passes, 200);

        assert!(EmbeddingPropagation::from_json(r#"{"valid_pct": 1.5}"#).is_err());
    }
}
