//! Error types for the patch optimization pipeline.
//!
//! This module defines the error taxonomy used across the crate: configuration
//! problems, data shape violations, numerical instability during optimization,
//! accelerator resource exhaustion, and failures propagated from external
//! collaborators (detector, dataset). It also provides utility constructors for
//! creating these errors with appropriate context.

use thiserror::Error;

/// The loss term or tensor in which a numerical anomaly was detected.
///
/// Used to report exactly which part of a training step produced a NaN/Inf so
/// that a failed step can be diagnosed without re-running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossTerm {
    /// The detector-confidence loss.
    Detection,
    /// The non-printability regularizer.
    Printability,
    /// The total-variation regularizer.
    Smoothness,
    /// The combined scalar loss.
    Total,
    /// The gradient of the patch variable.
    PatchGradient,
}

impl std::fmt::Display for LossTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossTerm::Detection => write!(f, "detection loss"),
            LossTerm::Printability => write!(f, "printability loss"),
            LossTerm::Smoothness => write!(f, "smoothness loss"),
            LossTerm::Total => write!(f, "total loss"),
            LossTerm::PatchGradient => write!(f, "patch gradient"),
        }
    }
}

/// Errors that can occur while optimizing an adversarial patch.
#[derive(Error, Debug)]
pub enum AdvPatchError {
    /// Invalid or unknown configuration.
    #[error("configuration: {message}")]
    Configuration {
        /// A message describing the configuration error.
        message: String,
    },

    /// Batch data did not have the shape the pipeline requires.
    #[error("data shape: {context} (expected {expected}, got {actual})")]
    DataShape {
        /// Where the mismatch was detected.
        context: String,
        /// The expected shape or count.
        expected: String,
        /// The actual shape or count.
        actual: String,
    },

    /// A NaN or Inf was detected in a loss term or gradient.
    ///
    /// The step that produced this error must not update the patch.
    #[error("numerical instability in {term}: {context}")]
    NumericalInstability {
        /// The term in which the anomaly was found.
        term: LossTerm,
        /// Additional context (epoch/batch position).
        context: String,
    },

    /// The accelerator ran out of memory.
    #[error("resource exhaustion: {context}")]
    ResourceExhaustion {
        /// What the pipeline was doing when memory ran out.
        context: String,
        /// The underlying device error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The external detector failed.
    #[error("detector: {context}")]
    Detector {
        /// What the detector was asked to do.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error from tensor operations.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Error occurred while loading or saving an image.
    #[error("image")]
    Image(#[from] image::ImageError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias for patch optimization operations.
pub type Result<T> = std::result::Result<T, AdvPatchError>;

impl AdvPatchError {
    /// Creates a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a data shape error with expected/actual context.
    pub fn data_shape(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DataShape {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a numerical instability error for the given loss term.
    pub fn non_finite(term: LossTerm, context: impl Into<String>) -> Self {
        Self::NumericalInstability {
            term,
            context: context.into(),
        }
    }

    /// Creates a detector error wrapping an external failure.
    pub fn detector(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Detector {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wraps a candle error, promoting device out-of-memory conditions to
    /// [`AdvPatchError::ResourceExhaustion`] so callers can reduce batch size
    /// instead of treating the failure as a generic tensor error.
    pub fn from_candle(context: &str, err: candle_core::Error) -> Self {
        let text = err.to_string();
        if text.contains("out of memory") || text.contains("OUT_OF_MEMORY") {
            Self::ResourceExhaustion {
                context: context.to_string(),
                source: Box::new(err),
            }
        } else {
            Self::Candle(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_shape_error_carries_context() {
        let err = AdvPatchError::data_shape("label file", "<= 20 boxes", "23 boxes");
        let text = err.to_string();
        assert!(text.contains("label file"));
        assert!(text.contains("<= 20 boxes"));
        assert!(text.contains("23 boxes"));
    }

    #[test]
    fn non_finite_error_names_the_term() {
        let err = AdvPatchError::non_finite(LossTerm::Smoothness, "epoch 3 batch 7");
        assert!(err.to_string().contains("smoothness loss"));
        assert!(err.to_string().contains("epoch 3 batch 7"));
    }
}
