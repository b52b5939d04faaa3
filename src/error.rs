//! Error types for leafprop.
use thiserror::Error;

/// Errors raised while loading data, configuring a run, or persisting results.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error for configurations and aggregators.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A line in an input file couldn't be parsed.
    #[error("{line}: Malformed input: {message}")]
    MalformedLine { line: usize, message: String },

    /// A node references a feature id outside of the declared feature space.
    #[error("Node {node} references feature {feature} but only {num_features} features exist")]
    InvalidFeature { node: usize, feature: usize, num_features: usize },

    /// Edge weights must be finite and non-negative.
    #[error("Edge {from_node} -> {to_node} has illegal weight {weight}")]
    InvalidEdgeWeight { from_node: usize, to_node: usize, weight: f32 },

    /// Loss weighting kind isn't one of none, log or exponential.
    #[error("Illegal loss weighting type `{0}`")]
    UnknownLossWeighting(String),

    /// Exactly one objective needs to be selected.
    #[error("Exactly one loss objective must be provided, found {0}")]
    ObjectiveSelection(usize),

    /// Warm start tables or aggregators disagree on dimensionality.
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// A numeric parameter is outside its legal range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Node or feature lookup by name failed.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for leafprop.
pub type Result<T> = std::result::Result<T, Error>;
