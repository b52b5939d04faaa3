//! Builds node embeddings from trained feature embeddings.
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{info,warn};

use crate::algos::aggregator::FeatureAggregator;
use crate::distance::Distance;
use crate::embeddings::EmbeddingStore;
use crate::error::Result;
use crate::feature_store::FeatureStore;
use crate::progress::CLProgressBar;
use crate::vocab::Vocab;

/// Tracks features which couldn't be found in the feature embedding table.
#[derive(Clone,Debug,Default,PartialEq,Eq)]
pub struct CoverageReport {
    pub nodes: usize,
    pub features_found: usize,
    pub features_missing: usize,

    /// Nodes missing at least one feature
    pub nodes_with_gaps: usize,

    /// Nodes left with no known features, embedded as the zero vector
    pub empty_nodes: usize
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.features_missing == 0
    }
}

pub struct NodeEmbedder<'a> {
    pub aggregator: &'a FeatureAggregator,
    pub indicator: bool
}

impl <'a> NodeEmbedder<'a> {
    pub fn new(aggregator: &'a FeatureAggregator, indicator: bool) -> Self {
        NodeEmbedder { aggregator, indicator }
    }

    /// Embeds every node in the feature store the table was trained against.
    pub fn embed(
        &self,
        features: &FeatureStore,
        feature_embeddings: &EmbeddingStore
    ) -> Result<(EmbeddingStore, CoverageReport)> {
        let num_embeddings = feature_embeddings.len();
        self.embed_mapped(features, feature_embeddings, |feat| {
            if feat < num_embeddings { Some(feat) } else { None }
        })
    }

    /// Embeds nodes from an independently loaded feature store.  Features are matched to the
    /// table by name through `table_vocab`; unknown features are skipped.
    pub fn embed_full_features(
        &self,
        features: &FeatureStore,
        table_vocab: &Vocab,
        feature_embeddings: &EmbeddingStore
    ) -> Result<(EmbeddingStore, CoverageReport)> {
        let feat_vocab = features.get_vocab();
        let num_embeddings = feature_embeddings.len();
        self.embed_mapped(features, feature_embeddings, |feat| {
            let (ns, name) = feat_vocab.get_name(feat)?;
            table_vocab.get_node_id(ns, name).filter(|id| *id < num_embeddings)
        })
    }

    fn embed_mapped<F>(
        &self,
        features: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        map_feature: F
    ) -> Result<(EmbeddingStore, CoverageReport)>
    where
        F: Fn(usize) -> Option<usize> + Sync
    {
        self.aggregator.check_dims(feature_embeddings.dims())?;

        let num_nodes = features.num_nodes();
        let node_embeddings = EmbeddingStore::new(num_nodes, feature_embeddings.dims(), Distance::Cosine);
        let pb = CLProgressBar::new(num_nodes as u64, self.indicator);

        let found = AtomicUsize::new(0);
        let missing = AtomicUsize::new(0);
        let with_gaps = AtomicUsize::new(0);
        let empty = AtomicUsize::new(0);

        (0..num_nodes).into_par_iter().for_each(|node| {
            let raw = features.get_features(node);
            let feats: Vec<_> = raw.iter().filter_map(|f| map_feature(*f)).collect();

            let gaps = raw.len() - feats.len();
            found.fetch_add(feats.len(), Ordering::Relaxed);
            if gaps > 0 {
                missing.fetch_add(gaps, Ordering::Relaxed);
                with_gaps.fetch_add(1, Ordering::Relaxed);
            }
            if feats.is_empty() {
                empty.fetch_add(1, Ordering::Relaxed);
            }

            let mut emb = vec![0f32; feature_embeddings.dims()];
            self.aggregator.construct(&feats, feature_embeddings, &mut emb);
            node_embeddings.set_embedding(node, &emb);
            pb.inc(1);
        });
        pb.finish();

        let report = CoverageReport {
            nodes: num_nodes,
            features_found: found.into_inner(),
            features_missing: missing.into_inner(),
            nodes_with_gaps: with_gaps.into_inner(),
            empty_nodes: empty.into_inner()
        };

        if !report.is_complete() {
            warn!(missing = report.features_missing, nodes = report.nodes_with_gaps,
                  empty = report.empty_nodes, "Features missing from the embedding table were skipped");
        }
        info!(nodes = num_nodes, "Constructed node embeddings");
        Ok((node_embeddings, report))
    }
}
