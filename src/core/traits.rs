//! Seams to the external collaborators of the optimization loop.
//!
//! The detector model and the metrics sink are deliberately behind traits: the
//! loop only needs a callable that maps an image batch to detection tensors,
//! and an optional consumer for scalar/image events.

use crate::core::errors::Result;
use candle_core::Tensor;
use image::RgbImage;
use tracing::info;

/// Raw multi-scale detector output for a batch of images.
///
/// Each scale tensor has shape `[batch, candidates, 5 + num_classes]` with the
/// last dimension laid out as `(x, y, w, h, objectness, class scores...)`,
/// scores already in `[0, 1]`. A scale may legitimately carry zero candidates.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    /// Per-scale prediction tensors.
    pub scales: Vec<Tensor>,
}

impl DetectionOutput {
    /// Creates a detection output from per-scale tensors.
    pub fn new(scales: Vec<Tensor>) -> Self {
        Self { scales }
    }

    /// True when no scale carries any candidate box.
    pub fn is_empty(&self) -> bool {
        self.scales
            .iter()
            .all(|s| s.dims().get(1).copied().unwrap_or(0) == 0)
    }
}

/// A pretrained object detector treated as a black box.
///
/// The detector must be differentiable with respect to its input images so
/// gradients can flow back to the patch.
pub trait Detector {
    /// Runs detection on a batch of images `[N, 3, H, W]` in `[0, 1]`.
    fn detect(&self, images: &Tensor) -> Result<DetectionOutput>;

    /// The `(height, width)` the detector expects its input resized to.
    fn input_size(&self) -> (usize, usize);
}

/// Consumer for training metrics, keyed by a monotonically increasing step.
pub trait MetricsSink {
    /// Records a named scalar value.
    fn scalar(&mut self, name: &str, value: f64, step: usize);

    /// Records a named image.
    fn image(&mut self, name: &str, image: &RgbImage, step: usize);
}

/// Discards all metrics; lets the loop run without any sink attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn scalar(&mut self, _name: &str, _value: f64, _step: usize) {}

    fn image(&mut self, _name: &str, _image: &RgbImage, _step: usize) {}
}

/// Emits metrics as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn scalar(&mut self, name: &str, value: f64, step: usize) {
        info!(metric = name, value, step, "scalar");
    }

    fn image(&mut self, name: &str, image: &RgbImage, step: usize) {
        info!(
            metric = name,
            width = image.width(),
            height = image.height(),
            step,
            "image"
        );
    }
}
