//! Learns feature embeddings over graphs with embedding propagation, then builds and aligns node
//! embeddings from them.

pub mod graph;
pub mod algos;
pub mod io;
pub mod error;
pub mod artifacts;
mod sampler;
mod vocab;
mod embeddings;
mod bitset;
mod distance;
mod feature_store;
mod progress;

pub use crate::error::{Error,Result};
pub use crate::graph::{CSR,CumCSR,Graph,CDFGraph,NodeID};
pub use crate::vocab::Vocab;
pub use crate::embeddings::EmbeddingStore;
pub use crate::distance::Distance;
pub use crate::feature_store::{FeatureStore,FeatureRemap,ANONYMOUS_NS};
pub use crate::sampler::NeighborSampler;
pub use crate::algos::aggregator::{AggregatorConfig,FeatureAggregator};
pub use crate::algos::alignment::NeighborhoodAligner;
pub use crate::algos::ann::{exact_search,Ann,GraphAnn,NodeDistance,TopK};
pub use crate::algos::ep::{EmbeddingPropagation,Loss,LossWeighting,ObjectiveOptions,PassStats,Similarity};
pub use crate::algos::feat_propagation::FeaturePropagator;
pub use crate::algos::node_embedder::{CoverageReport,NodeEmbedder};
pub use crate::artifacts::ArtifactPaths;
pub use crate::io::{EdgeType,EmbeddingReader,EmbeddingWriter,FeatureReader,GraphReader};
