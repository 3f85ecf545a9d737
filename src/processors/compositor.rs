//! Overlays transformed patch instances onto an image batch.

use crate::core::errors::{AdvPatchError, Result};
use crate::processors::transform::TransformedPatchBatch;
use candle_core::Tensor;

/// Pastes masked patch instances onto images.
///
/// Per image the label slots are applied sequentially, so when two labels of
/// the same image overlap, the later overlay overwrites the earlier one at the
/// overlapping pixels. This last-write-wins behavior is accepted: the paper
/// defines no blending policy for overlaps.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchApplier;

impl PatchApplier {
    /// Creates a new applier.
    pub fn new() -> Self {
        Self
    }

    /// Applies every patch instance: `out = image * (1 - mask) + patch * mask`.
    ///
    /// Inputs and masks are in `[0, 1]`, so the output needs no extra
    /// clamping. Pixels under an all-zero mask are left bit-identical.
    pub fn apply(&self, images: &Tensor, batch: &TransformedPatchBatch) -> Result<Tensor> {
        let (n, c, h, w) = images.dims4()?;
        let (pn, slots, pc, ph, pw) = batch.patches.dims5()?;
        if (n, c, h, w) != (pn, pc, ph, pw) {
            return Err(AdvPatchError::data_shape(
                "patch batch vs image batch",
                format!("[{}, L, {}, {}, {}]", n, c, h, w),
                format!("{:?}", batch.patches.dims()),
            ));
        }

        let mut out = images.clone();
        for slot in 0..slots {
            // Patch instances arrive pre-masked, so the overlay reduces to
            // zeroing the footprint and adding the instance.
            let instance = batch.patches.narrow(1, slot, 1)?.squeeze(1)?;
            let mask = batch.masks.narrow(1, slot, 1)?.squeeze(1)?;
            let keep = mask.affine(-1.0, 1.0)?;
            out = out.broadcast_mul(&keep)?.add(&instance)?;
        }
        Ok(out)
    }
}
