//! Reduces raw detector output to a differentiable attack objective.
//!
//! For every image the extractor finds the strongest remaining detection of
//! the target class across all candidate boxes and output scales. The mean of
//! these per-image maxima is the detection loss the optimizer minimizes: a low
//! value means the detector no longer sees the object confidently.

use crate::core::config::ConfidenceTarget;
use crate::core::errors::{AdvPatchError, Result};
use crate::core::traits::DetectionOutput;
use candle_core::{D, Tensor};

/// Extracts the maximum adversarial confidence per image.
#[derive(Debug, Clone, Copy)]
pub struct MaxConfidenceExtractor {
    target: ConfidenceTarget,
    target_class: usize,
}

impl MaxConfidenceExtractor {
    /// Creates an extractor for the given loss target and class.
    pub fn new(target: ConfidenceTarget, target_class: usize) -> Self {
        Self {
            target,
            target_class,
        }
    }

    /// Computes the per-image maximum confidence, `[N]`, over all candidates
    /// and scales.
    ///
    /// Returns `None` when no scale carries any candidate box: an empty batch
    /// contributes no detection-loss term instead of a zero that would skew
    /// the mean, and never produces a NaN.
    pub fn extract(&self, output: &DetectionOutput) -> Result<Option<Tensor>> {
        let mut best: Option<Tensor> = None;
        for scale in &output.scales {
            let (n, candidates, attrs) = scale.dims3().map_err(|_| {
                AdvPatchError::data_shape(
                    "detection scale",
                    "[N, candidates, 5 + classes]",
                    format!("{:?}", scale.dims()),
                )
            })?;
            if candidates == 0 {
                continue;
            }
            if attrs < 6 || self.target_class >= attrs - 5 {
                return Err(AdvPatchError::data_shape(
                    "detection attributes",
                    format!("at least {} (target class {})", self.target_class + 6, self.target_class),
                    format!("{}", attrs),
                ));
            }
            if let Some(prev) = &best {
                if prev.dims1()? != n {
                    return Err(AdvPatchError::data_shape(
                        "detection scales",
                        format!("batch size {}", prev.dims1()?),
                        format!("batch size {}", n),
                    ));
                }
            }

            let obj = scale.narrow(2, 4, 1)?.squeeze(2)?;
            let cls = scale.narrow(2, 5 + self.target_class, 1)?.squeeze(2)?;
            let conf = self.target.combine(&obj, &cls)?;
            let per_image = conf.max(D::Minus1)?;
            best = Some(match best {
                Some(prev) => prev.maximum(&per_image)?,
                None => per_image,
            });
        }
        Ok(best)
    }

    /// Mean of the per-image maxima, or `None` for an all-empty batch.
    pub fn detection_loss(&self, output: &DetectionOutput) -> Result<Option<Tensor>> {
        match self.extract(output)? {
            Some(per_image) => Ok(Some(per_image.mean_all()?)),
            None => Ok(None),
        }
    }
}
