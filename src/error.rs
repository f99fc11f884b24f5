//! Error kinds raised by the decoding engine
//!
//! Functions in this crate return `anyhow::Result`. The kinds below are
//! raised through anyhow and can be recovered with
//! `err.downcast_ref::<DecodeError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Unknown variant name, invalid architecture knob, or a parameters
    /// artifact that does not match the constructed decoder.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required artifact (vocabulary, checkpoint) does not exist.
    #[error("Resource not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    /// Wrong latent dimensionality, non-positive counts.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Index outside the vocabulary. Unreachable with a correctly configured
    /// decoder, so seeing this means decoder and vocabulary disagree.
    #[error("Lookup error: index {index} outside vocabulary of size {size}")]
    Lookup { index: u32, size: usize },
}

impl DecodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
