//! Names and writers for the files persisted by a training run.
use std::path::{Path,PathBuf};

use tracing::info;

use crate::algos::aggregator::FeatureAggregator;
use crate::embeddings::EmbeddingStore;
use crate::error::Result;
use crate::feature_store::FeatureStore;
use crate::io::save_embeddings;
use crate::vocab::Vocab;

#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ArtifactPaths {
    pub feature_embeddings: PathBuf,
    pub node_embeddings: PathBuf,

    /// Node embeddings before neighborhood alignment
    pub original_node_embeddings: PathBuf,

    /// Aggregator configuration and parameters
    pub embedder: PathBuf
}

impl ArtifactPaths {
    /// Embedding tables get a `.gz` suffix when `compress` is set.
    pub fn new(prefix: impl AsRef<Path>, compress: bool) -> Self {
        let prefix = prefix.as_ref().as_os_str().to_string_lossy();
        let suffix = if compress { ".gz" } else { "" };
        let with = |ext: &str, suffix: &str| PathBuf::from(format!("{}.{}{}", prefix, ext, suffix));
        ArtifactPaths {
            feature_embeddings: with("feature-embeddings", suffix),
            node_embeddings: with("node-embeddings", suffix),
            original_node_embeddings: with("node-embeddings.orig", suffix),
            embedder: with("embedder", "")
        }
    }

    /// Persists the trained feature embeddings, named by the feature vocabulary, along with the
    /// aggregator needed to rebuild node embeddings from them.
    pub fn save_training(
        &self,
        features: &FeatureStore,
        feature_embeddings: &EmbeddingStore,
        aggregator: &FeatureAggregator,
        comp_level: Option<u32>
    ) -> Result<()> {
        save_embeddings(&self.feature_embeddings, features.get_vocab(), feature_embeddings, comp_level)?;
        aggregator.save(&self.embedder)?;
        info!(path = %self.feature_embeddings.display(), "Saved feature embeddings");
        Ok(())
    }

    /// Persists node embeddings.  `original` selects the pre-alignment location.
    pub fn save_node_embeddings(
        &self,
        vocab: &Vocab,
        node_embeddings: &EmbeddingStore,
        original: bool,
        comp_level: Option<u32>
    ) -> Result<()> {
        let path = if original { &self.original_node_embeddings } else { &self.node_embeddings };
        save_embeddings(path, vocab, node_embeddings, comp_level)?;
        info!(path = %path.display(), "Saved node embeddings");
        Ok(())
    }
}

#[cfg(test)]
mod artifacts_tests {
    use super::*;
    use crate::distance::Distance;
    use crate::io::EmbeddingReader;

    #[test]
    fn test_paths() {
        let paths = ArtifactPaths::new("out/run", false);
        assert_eq!(paths.feature_embeddings, PathBuf::from("out/run.feature-embeddings"));
        assert_eq!(paths.node_embeddings, PathBuf::from("out/run.node-embeddings"));
        assert_eq!(paths.original_node_embeddings, PathBuf::from("out/run.node-embeddings.orig"));
        assert_eq!(paths.embedder, PathBuf::from("out/run.embedder"));

        let paths = ArtifactPaths::new("run", true);
        assert_eq!(paths.feature_embeddings, PathBuf::from("run.feature-embeddings.gz"));
        assert_eq!(paths.original_node_embeddings, PathBuf::from("run.node-embeddings.orig.gz"));
        assert_eq!(paths.embedder, PathBuf::from("run.embedder"));
    }

    #[test]
    fn test_save_training() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path().join("run"), true);

        let fs = FeatureStore::from_raw(2, "feat".into(), vec![vec![0], vec![1]]).unwrap();
        let es = EmbeddingStore::from_vec(2, vec![1., 2., 3., 4.], Distance::Cosine);
        let agg = FeatureAggregator::Averaged;
        paths.save_training(&fs, &es, &agg, None).unwrap();

        let (vocab, loaded) = EmbeddingReader::load(&paths.feature_embeddings, Distance::Cosine, None, None, None).unwrap();
        let id = vocab.get_node_id("feat", "1").unwrap();
        assert_eq!(loaded.get_embedding(id), vec![3., 4.]);

        let loaded_agg = FeatureAggregator::load(&paths.embedder).unwrap();
        assert_eq!(loaded_agg.config(), agg.config());

        paths.save_node_embeddings(fs.get_vocab(), &es, true, None).unwrap();
        assert!(paths.original_node_embeddings.exists());
        assert!(!paths.node_embeddings.exists());
    }
}
