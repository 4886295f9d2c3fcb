//! Error types for the disk registry.
//!
//! A single [`RegistryError`] enum covers all registry operations, with a
//! [`Result`] alias used throughout the crate.
//!
//! # Error Categories
//!
//! - **Storage**: durable-store load/commit failures
//! - **Serialization**: encode/decode failures of stored or transported state
//! - **Rejected**: a request terminated before completion (e.g. a compare
//!   worker cancelled during shutdown); the caller may retry
//! - **Configuration**: invalid settings

use std::io;
use thiserror::Error;

/// Main error type for registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Durable store errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The request was terminated before a result was produced.
    #[error("Rejected: {0}")]
    Rejected(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Rejected(_) | RegistryError::Storage(_)
        )
    }
}

impl From<rocksdb::Error> for RegistryError {
    fn from(e: rocksdb::Error) -> Self {
        RegistryError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for RegistryError {
    fn from(e: bincode::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
