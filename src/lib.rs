//! # adv-patch
//!
//! A Rust library for optimizing printable adversarial patches against
//! YOLO-style object detectors. A patch is a small square image that, when
//! composited onto training images at the location of labeled objects,
//! minimizes the detector's confidence in those objects while remaining
//! physically printable.
//!
//! ## Components
//!
//! - **PatchTransformer**: scales, rotates, shifts and photometrically jitters
//!   the patch onto every labeled box, producing masked instances
//! - **PatchApplier**: composites the masked instances onto the image batch
//! - **MaxConfidenceExtractor**: reduces raw detector output to the
//!   differentiable detection loss
//! - **NonPrintabilityScore** / **TotalVariation**: regularizers keeping the
//!   patch physically realizable
//! - **PatchTrainer**: the epoch/batch optimization loop with plateau
//!   learning-rate scheduling and per-epoch checkpointing
//!
//! ## Modules
//!
//! * [`core`] - Errors, configuration registry, and collaborator traits
//! * [`data`] - Image/label dataset loading with sentinel-padded label sets
//! * [`models`] - A compact candle detector usable as the attack target
//! * [`processors`] - The differentiable transform/composite/loss blocks
//! * [`trainer`] - The optimization loop, seeding, and scheduler
//! * [`utils`] - Image/tensor conversion and device parsing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use adv_patch::core::{PatchConfig, NullSink};
//! use adv_patch::data::PatchDataset;
//! use adv_patch::models::TinyYolo;
//! use adv_patch::trainer::PatchTrainer;
//! use adv_patch::utils::parse_device;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PatchConfig::for_mode("paper_obj")?;
//! let device = parse_device(&config.device)?;
//! let detector = TinyYolo::load(
//!     &config.model_path,
//!     config.num_anchors,
//!     config.num_classes,
//!     &device,
//! )?;
//! let dataset = PatchDataset::open(
//!     &config.img_dir,
//!     &config.lab_dir,
//!     config.max_labels,
//!     config.img_size,
//! )?;
//! let mut trainer = PatchTrainer::new(config, detector, NullSink)?;
//! let patch = trainer.run(&dataset)?;
//! # let _ = patch;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod data;
pub mod models;
pub mod processors;
pub mod trainer;
pub mod utils;

/// Commonly used types.
pub mod prelude {
    pub use crate::core::{
        AdvPatchError, ConfidenceTarget, DetectionOutput, Detector, JitterBounds, LogSink,
        MetricsSink, NullSink, PatchConfig, PatchInit, Result,
    };
    pub use crate::data::{LabelBox, LabelSet, PatchDataset};
    pub use crate::processors::{
        MaxConfidenceExtractor, NonPrintabilityScore, PatchApplier, PatchTransformer,
        TotalVariation, TransformOptions,
    };
    pub use crate::trainer::PatchTrainer;
}
