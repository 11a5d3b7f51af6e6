//! Run-level errors.
//!
//! Per-instrument conditions (missing fields, source discrepancies) are
//! recorded as data on the instrument and never surface here.

use thiserror::Error;
use zero_common::validation::ValidationError;

/// Fatal errors that abort a screening run. No output is emitted.
#[derive(Debug, Error)]
pub enum ScreenerError {
    /// Weights or thresholds are invalid; raised before any network I/O.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(#[from] ValidationError),

    /// Retrieved universe deviates from the reference count beyond tolerance.
    #[error(
        "Universe sanity check failed: retrieved {retrieved} instruments, expected {expected} (tolerance {:.1}%)",
        .tolerance * 100.0
    )]
    UniverseSanityFailure {
        retrieved: usize,
        expected: usize,
        tolerance: f64,
    },

    /// The run was cancelled before completion.
    #[error("Screening run cancelled")]
    Cancelled,

    /// The artifact could not be written.
    #[error("Failed to publish output: {0}")]
    Output(String),
}

impl ScreenerError {
    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid(_) => 2,
            Self::UniverseSanityFailure { .. } => 3,
            Self::Cancelled => 130,
            Self::Output(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScreenerError>;
