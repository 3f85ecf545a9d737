//! Dataset loading and label handling.

pub mod dataset;
pub mod labels;

pub use dataset::PatchDataset;
pub use labels::{LabelBox, LabelSet};
