//! Defines the FeatureStore class which is used to define discrete features for each node
use hashbrown::HashSet;

use crate::bitset::BitSet;
use crate::error::{Error,Result};
use crate::graph::NodeID;
use crate::vocab::Vocab;

/// Namespace used for anonymous, node identity features.
pub const ANONYMOUS_NS: &str = "node";

/// Main FeatureStore struct.  We use a vector of vectors to allow for dynamic numbers of features.
/// Each node holds an ordered set of feature ids: insertion order is kept (attention context
/// windows depend on it) and duplicates are dropped.
#[derive(Debug)]
pub struct FeatureStore {
    /// Raw storage for features, indexed by node id
    features: Vec<Vec<usize>>,

    /// Nodes whose features were provided directly rather than propagated from neighbors
    direct: BitSet,

    /// Since we often convert features to embeddings, which need namespaces, we have a feature
    /// namespace.
    namespace: String,

    /// Maps a raw feature to a feature_id
    feature_vocab: Vocab,
}

/// Maps old feature ids to new feature ids after pruning; `None` means the feature was removed.
pub type FeatureRemap = Vec<Option<usize>>;

impl FeatureStore {

    pub fn new(size: usize, namespace: String) -> Self {
        FeatureStore {
            features: vec![Vec::with_capacity(0); size],
            direct: BitSet::new(size),
            namespace,
            feature_vocab: Vocab::new(),
        }
    }

    /// Builds a feature store from raw feature ids, failing if any id falls outside of
    /// `num_features`.  Features are named by their id within the store's namespace.
    pub fn from_raw(
        num_features: usize,
        namespace: String,
        associations: Vec<Vec<usize>>
    ) -> Result<Self> {
        for (node, feats) in associations.iter().enumerate() {
            if let Some(bad) = feats.iter().find(|f| **f >= num_features) {
                return Err(Error::InvalidFeature { node, feature: *bad, num_features })
            }
        }

        let mut fs = FeatureStore::new(associations.len(), namespace);
        for feat_id in 0..num_features {
            fs.feature_vocab.get_or_insert(&fs.namespace, &feat_id.to_string());
        }
        for (node, feats) in associations.into_iter().enumerate() {
            fs.set_features_raw(node, feats.into_iter());
        }
        Ok(fs)
    }

    pub fn get_ns(&self) -> &String {
        &self.namespace
    }

    fn dedup_into(target: &mut Vec<usize>, feats: impl Iterator<Item=usize>) {
        let mut seen: HashSet<usize> = target.iter().cloned().collect();
        for f in feats {
            if seen.insert(f) {
                target.push(f);
            }
        }
    }

    fn set_nt_features<'a>(
        &mut self,
        node: NodeID,
        namespace: &str,
        node_features: impl Iterator<Item=&'a str>
    ) {
        let vocab = &mut self.feature_vocab;
        let ids: Vec<_> = node_features
            .map(|f| vocab.get_or_insert(namespace, f))
            .collect();
        self.set_features_raw(node, ids.into_iter());
    }

    /// Sets the direct features for a node, replacing anything already there.
    pub fn set_features(&mut self, node: NodeID, node_features: Vec<String>) {
        let ns = self.namespace.clone();
        self.set_nt_features(node, &ns, node_features.iter().map(|f| f.as_str()));
    }

    /// Sets direct features by id.  Callers are responsible for ids being in the vocab.
    pub fn set_features_raw(&mut self, node: NodeID, node_features: impl Iterator<Item=usize>) {
        let mut feats = Vec::new();
        FeatureStore::dedup_into(&mut feats, node_features);
        if !feats.is_empty() {
            self.direct.set_bit(node);
        }
        self.features[node] = feats;
    }

    /// Replaces the propagated features of a node without direct features.  Nodes with direct
    /// features are never touched.
    pub fn set_propagated(&mut self, node: NodeID, node_features: impl Iterator<Item=usize>) {
        if self.is_direct(node) { return }
        let feats = &mut self.features[node];
        feats.clear();
        FeatureStore::dedup_into(feats, node_features);
    }

    pub fn is_direct(&self, node: NodeID) -> bool {
        self.direct.is_set(node)
    }

    /// Number of nodes with directly provided features.
    pub fn num_direct(&self) -> usize {
        self.direct.count()
    }

    pub fn get_features(&self, node: NodeID) -> &[usize] {
        &self.features[node]
    }

    pub fn get_feature_id(&self, namespace: &str, name: &str) -> Option<usize> {
        self.feature_vocab.get_node_id(namespace, name)
    }

    pub fn get_pretty_features(&self, node: NodeID) -> Vec<String> {
        self.features[node].iter()
            .filter_map(|v_id| self.feature_vocab.get_name(*v_id))
            .map(|(_ns, name)| name.to_string())
            .collect()
    }

    pub fn num_features(&self) -> usize {
        self.feature_vocab.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.features.len()
    }

    /// This method assigns an unique, anonymous feature to all nodes which lack any features.  This is
    /// necessary for all graph embedding algorithms which map {feature} -> Embedding.
    pub fn fill_missing_nodes(&mut self) {
        for i in 0..self.features.len() {
            if self.features[i].is_empty() {
                let name = i.to_string();
                self.set_nt_features(i, ANONYMOUS_NS, std::iter::once(name.as_str()));
            }
        }
    }

    pub fn get_vocab(&self) -> &Vocab {
        &self.feature_vocab
    }

    pub fn iter(&self) -> impl Iterator<Item=&Vec<usize>> {
        self.features.iter()
    }

    /// Fails if any node references a feature outside of the vocab.
    pub fn validate(&self) -> Result<()> {
        let num_features = self.num_features();
        for (node, feats) in self.features.iter().enumerate() {
            if let Some(bad) = feats.iter().find(|f| **f >= num_features) {
                return Err(Error::InvalidFeature { node, feature: *bad, num_features })
            }
        }
        Ok(())
    }

    /// Count the number of occurrences of each feature in the feature set.  This is helpful when
    /// pruning to a minimum count.
    pub fn count_features(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.feature_vocab.len()];
        for feats in self.features.iter() {
            for f_i in feats.iter() {
                counts[*f_i] += 1;
            }
        }
        counts
    }

    /// Removes features which don't meet the provided `count`.  This is helpful to prevent one-off
    /// occurences of words acting as node biases and otherwise harming the quality of the
    /// embeddings.  The feature id space is rebuilt; the returned remap translates old ids.
    pub fn prune_min_count(&self, count: usize) -> (FeatureStore, FeatureRemap) {
        let counts = self.count_features();

        let mut new_fs = FeatureStore::new(self.features.len(), self.namespace.clone());
        let mut remap = vec![None; counts.len()];

        // Filter out features that don't meet the min_count
        for (node_id, feats) in self.features.iter().enumerate() {
            let mut new_feats = Vec::with_capacity(feats.len());
            for f_i in feats.iter().filter(|f_i| counts[**f_i] >= count) {
                let new_id = match remap[*f_i] {
                    Some(id) => id,
                    None => match self.feature_vocab.get_name(*f_i) {
                        Some((ns, name)) => {
                            let id = new_fs.feature_vocab.get_or_insert(ns, name);
                            remap[*f_i] = Some(id);
                            id
                        },
                        None => continue
                    }
                };
                new_feats.push(new_id);
            }

            if self.is_direct(node_id) {
                new_fs.set_features_raw(node_id, new_feats.into_iter());
            } else {
                new_fs.set_propagated(node_id, new_feats.into_iter());
            }
        }
        (new_fs, remap)
    }

}
