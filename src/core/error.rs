//! Error types for tilegraph.
//!
//! Uses thiserror for structured errors. Tile errors are designed to:
//! - Be cloneable, so one failed computation can be handed to every waiter
//! - Be serializable for reporting through listeners and the CLI
//! - Identify the tile that failed where one is involved

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for tilegraph.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum TilegraphError {
    #[error("Tile error: {0}")]
    Tile(#[from] TileError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the scheduling, caching, geometry and snapshot core.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TileError {
    /// A required argument was absent or out of its legal domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A tile or source index lies outside the valid range.
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    /// The operator or policy cannot work with the given configuration.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A kernel failed while computing a tile.
    #[error("Computation of tile ({tile_x}, {tile_y}) of image {owner} failed: {message}")]
    ComputationFailed {
        owner: u64,
        tile_x: i32,
        tile_y: i32,
        message: String,
    },

    /// The tile was cancelled before computation started.
    #[error("Tile ({tile_x}, {tile_y}) of image {owner} was cancelled")]
    Cancelled { owner: u64, tile_x: i32, tile_y: i32 },
}

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported configuration file format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

// ============================================================================
// Error Utilities
// ============================================================================

impl TileError {
    /// Shorthand for an [`TileError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TileError::InvalidArgument(message.into())
    }

    /// Shorthand for an [`TileError::InvalidIndex`].
    pub fn invalid_index(message: impl Into<String>) -> Self {
        TileError::InvalidIndex(message.into())
    }

    /// Shorthand for an [`TileError::UnsupportedConfiguration`].
    pub fn unsupported(message: impl Into<String>) -> Self {
        TileError::UnsupportedConfiguration(message.into())
    }

    /// Wrap a kernel failure for the given tile.
    pub fn computation_failed(owner: u64, tile_x: i32, tile_y: i32, error: impl std::fmt::Display) -> Self {
        TileError::ComputationFailed {
            owner,
            tile_x,
            tile_y,
            message: error.to_string(),
        }
    }

    /// Get the tile this error concerns, if applicable.
    pub fn tile(&self) -> Option<(u64, i32, i32)> {
        match self {
            TileError::ComputationFailed { owner, tile_x, tile_y, .. }
            | TileError::Cancelled { owner, tile_x, tile_y } => Some((*owner, *tile_x, *tile_y)),
            _ => None,
        }
    }

    /// Contract violations fail fast and are never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            TileError::InvalidArgument(_)
                | TileError::InvalidIndex(_)
                | TileError::UnsupportedConfiguration(_)
        )
    }
}

/// Result type alias for tilegraph operations.
pub type TilegraphResult<T> = Result<T, TilegraphError>;

/// Result type alias for tile operations.
pub type TileResult<T> = Result<T, TileError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computation_failed_display() {
        let error = TileError::computation_failed(7, 1, 2, "kernel exploded");
        let message = error.to_string();
        assert!(message.contains("(1, 2)"));
        assert!(message.contains("kernel exploded"));
        assert_eq!(error.tile(), Some((7, 1, 2)));
    }

    #[test]
    fn test_contract_violations() {
        assert!(TileError::invalid_argument("x").is_contract_violation());
        assert!(TileError::invalid_index("x").is_contract_violation());
        assert!(!TileError::Cancelled { owner: 1, tile_x: 0, tile_y: 0 }.is_contract_violation());
    }

    #[test]
    fn test_tile_error_converts_to_top_level() {
        let error: TilegraphError = TileError::unsupported("bands").into();
        assert!(matches!(error, TilegraphError::Tile(TileError::UnsupportedConfiguration(_))));
    }
}
