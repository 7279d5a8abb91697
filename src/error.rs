//! Error types for join and KNN judgement.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JoinError {
    /// Rejected configuration: unknown index type, zero buckets, bad extent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The two inputs of a join are not partitioned by the same grid.
    #[error("Partitioning mismatch: {0}")]
    PartitionMismatch(String),

    /// A geometry that cannot take part in a predicate or distance test.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "toml")]
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl JoinError {
    /// Configuration and partitioning errors are raised before any unit of
    /// work starts and retrying them cannot help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            JoinError::InvalidConfig(_) | JoinError::PartitionMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JoinError>;
