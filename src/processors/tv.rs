//! Total variation regularizer.
//!
//! High-frequency pixel noise survives neither printing nor being
//! photographed, so the optimizer penalizes the absolute difference between
//! each pixel and its right and below neighbors, normalized by patch area.

use crate::core::errors::Result;
use candle_core::Tensor;

/// Measures pixel-to-pixel smoothness of a patch.
#[derive(Debug, Default, Clone, Copy)]
pub struct TotalVariation;

impl TotalVariation {
    /// Creates the scorer.
    pub fn new() -> Self {
        Self
    }

    /// Scores a `[3, S, S]` patch. Zero for a constant-color patch, positive
    /// as soon as any neighbor pair differs; differentiable everywhere else.
    pub fn score(&self, patch: &Tensor) -> Result<Tensor> {
        let (_c, h, w) = patch.dims3()?;
        let right = patch
            .narrow(2, 1, w - 1)?
            .sub(&patch.narrow(2, 0, w - 1)?)?
            .abs()?
            .sum_all()?;
        let below = patch
            .narrow(1, 1, h - 1)?
            .sub(&patch.narrow(1, 0, h - 1)?)?
            .abs()?
            .sum_all()?;
        Ok(right.add(&below)?.affine(1.0 / (h * w) as f64, 0.0)?)
    }
}
