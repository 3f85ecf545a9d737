//! Core types of the patch optimization pipeline.
//!
//! This module contains the fundamental pieces shared by the rest of the crate:
//! - Error handling and the crate-wide `Result` alias
//! - Experiment configuration and the static mode registry
//! - Traits for the external detector and metrics collaborators

pub mod config;
pub mod errors;
pub mod traits;

pub use config::{ConfidenceTarget, JitterBounds, PatchConfig, PatchInit};
pub use errors::{AdvPatchError, LossTerm, Result};
pub use traits::{DetectionOutput, Detector, LogSink, MetricsSink, NullSink};

/// Initializes the tracing subscriber for logging.
///
/// Sets up the tracing subscriber with environment filter and formatting layer.
/// Typically called once at the start of the training binary.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
