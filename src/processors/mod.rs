//! Differentiable building blocks of the patch attack: geometric transform,
//! compositing, confidence extraction, and the two physical-plausibility
//! regularizers.

pub mod compositor;
pub mod confidence;
pub mod nps;
pub mod transform;
pub mod tv;

pub use compositor::PatchApplier;
pub use confidence::MaxConfidenceExtractor;
pub use nps::NonPrintabilityScore;
pub use transform::{PatchTransformer, TransformOptions, TransformedPatchBatch, patch_footprint};
pub use tv::TotalVariation;
