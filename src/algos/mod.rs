pub mod aggregator;
pub mod alignment;
pub mod ann;
pub mod ep;
pub mod feat_propagation;
pub mod node_embedder;
pub mod utils;
