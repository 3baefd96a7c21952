//! Top-level error type of the tuner.

use std::time::Duration;

use thiserror::Error;

use bdatune_types::ConfigurationError;

use crate::buffer::BufferError;
use crate::graph::BuildError;
use crate::platform::{GraphState, PlatformError};

/// Errors returned by [`BdaTuner`](crate::BdaTuner).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuneError {
    /// Tuning space or locator could not be prepared.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The graph could not be built.
    #[error("Graph build failed: {0}")]
    Build(#[from] BuildError),

    /// The graph was built but did not reach the running state.
    #[error("Graph did not start (last state: {state:?})")]
    StartFailure { state: Option<GraphState> },

    /// Every tuner device was tried without success.
    #[error("No tuner device could be started ({attempts} attempts)")]
    DeviceExhausted { attempts: usize },

    /// No sample arrived in time.
    #[error("Timed out after {0:?} waiting for a sample")]
    Timeout(Duration),

    /// The read could not be completed.
    #[error("Buffer error: {0}")]
    Buffer(BufferError),

    /// A platform collaborator failed outside a build step.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl From<BufferError> for TuneError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::Timeout(wait) => TuneError::Timeout(wait),
            other => TuneError::Buffer(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TuneError>;
