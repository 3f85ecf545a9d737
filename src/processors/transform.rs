//! Geometric and photometric patch transformation.
//!
//! For every valid label in a batch this module produces one patch instance
//! scaled to the labeled box, optionally rotated and shifted, together with a
//! mask marking its footprint on the full image canvas. The resampling is
//! expressed as a precomputed inverse-affine index map consumed by
//! `index_select`, so the output stays differentiable with respect to the
//! patch pixel values while the map itself is plain host-side arithmetic.

use crate::core::config::JitterBounds;
use crate::core::errors::{AdvPatchError, Result};
use crate::data::labels::{LabelBox, LabelSet};
use candle_core::Tensor;
use rand::Rng;

/// Options controlling the randomized parts of the transform.
#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    /// Rotate each instance by a uniform random angle.
    pub rotate: bool,
    /// Jitter each instance's placement around the box center.
    pub randomize_location: bool,
    /// Patch footprint as a fraction of the label box diagonal.
    pub scale_fraction: f32,
    /// Bounds for rotation, placement and photometric jitter.
    pub jitter: JitterBounds,
}

impl TransformOptions {
    /// A fully deterministic configuration: no rotation, no placement jitter,
    /// no photometric variation.
    pub fn deterministic(scale_fraction: f32) -> Self {
        Self {
            rotate: false,
            randomize_location: false,
            scale_fraction,
            jitter: JitterBounds::none(),
        }
    }
}

/// One transformed patch instance per (image, label) slot, shape-aligned with
/// the image batch. Recomputed every forward pass, never persisted.
#[derive(Debug)]
pub struct TransformedPatchBatch {
    /// Patch instances, `[N, L, 3, H, W]`.
    pub patches: Tensor,
    /// Footprint masks in `[0, 1]`, `[N, L, 1, H, W]`. Sentinel labels carry
    /// an all-zero mask.
    pub masks: Tensor,
}

/// Places a patch onto the image canvas for every labeled object.
#[derive(Debug, Clone)]
pub struct PatchTransformer {
    opts: TransformOptions,
}

/// Side length in pixels of the patch footprint for a label, derived from the
/// box diagonal.
pub fn patch_footprint(scale_fraction: f32, label: &LabelBox, img_size: usize) -> f32 {
    let w = label.w * img_size as f32;
    let h = label.h * img_size as f32;
    scale_fraction * (w * w + h * h).sqrt()
}

impl PatchTransformer {
    /// Creates a transformer with the given options.
    pub fn new(opts: TransformOptions) -> Self {
        Self { opts }
    }

    /// Transforms `patch` (`[3, S, S]`, values in `[0, 1]`) into one masked
    /// instance per label slot for every image in the batch.
    ///
    /// # Errors
    ///
    /// Returns a data shape error when the patch is not square 3-channel or
    /// the label sets are not all padded to the same length.
    pub fn forward(
        &self,
        patch: &Tensor,
        labels: &[LabelSet],
        img_size: usize,
        rng: &mut impl Rng,
    ) -> Result<TransformedPatchBatch> {
        let (channels, s_h, s_w) = patch.dims3()?;
        if channels != 3 || s_h != s_w {
            return Err(AdvPatchError::data_shape(
                "patch tensor",
                "[3, S, S]",
                format!("{:?}", patch.dims()),
            ));
        }
        let patch_size = s_h;
        let slots = labels.first().map(LabelSet::len).unwrap_or(0);
        if labels.iter().any(|l| l.len() != slots) || slots == 0 {
            return Err(AdvPatchError::data_shape(
                "label batch",
                format!("{} slots per image", slots.max(1)),
                "inconsistent slot counts",
            ));
        }

        let device = patch.device();
        let flat_patch = patch.reshape((3, patch_size * patch_size))?;

        let mut image_patches = Vec::with_capacity(labels.len());
        let mut image_masks = Vec::with_capacity(labels.len());
        for label_set in labels {
            let mut instance_patches = Vec::with_capacity(slots);
            let mut instance_masks = Vec::with_capacity(slots);
            for label in label_set.boxes() {
                if label.is_sentinel() {
                    instance_patches.push(Tensor::zeros(
                        (3, img_size, img_size),
                        patch.dtype(),
                        device,
                    )?);
                    instance_masks.push(Tensor::zeros(
                        (1, img_size, img_size),
                        patch.dtype(),
                        device,
                    )?);
                    continue;
                }
                let placement = self.sample_placement(label, img_size, rng);
                let (indices, mask) = build_index_map(&placement, patch_size, img_size);
                let indices = Tensor::from_vec(indices, img_size * img_size, device)?;
                let mask =
                    Tensor::from_vec(mask, (1, img_size, img_size), device)?;
                let instance = flat_patch
                    .index_select(&indices, 1)?
                    .reshape((3, img_size, img_size))?
                    .affine(placement.contrast as f64, placement.brightness as f64)?
                    .clamp(0.0f32, 1.0f32)?
                    .broadcast_mul(&mask)?;
                instance_patches.push(instance);
                instance_masks.push(mask);
            }
            image_patches.push(Tensor::stack(&instance_patches, 0)?);
            image_masks.push(Tensor::stack(&instance_masks, 0)?);
        }

        Ok(TransformedPatchBatch {
            patches: Tensor::stack(&image_patches, 0)?,
            masks: Tensor::stack(&image_masks, 0)?,
        })
    }

    fn sample_placement(
        &self,
        label: &LabelBox,
        img_size: usize,
        rng: &mut impl Rng,
    ) -> Placement {
        let jitter = &self.opts.jitter;
        let footprint = patch_footprint(self.opts.scale_fraction, label, img_size);

        let angle = if self.opts.rotate && jitter.max_rotation > 0.0 {
            rng.random_range(-jitter.max_rotation..=jitter.max_rotation)
        } else {
            0.0
        };

        let mut tx = label.cx * img_size as f32;
        let mut ty = label.cy * img_size as f32;
        if self.opts.randomize_location && jitter.max_shift > 0.0 {
            let shift_x = jitter.max_shift * label.w * img_size as f32;
            let shift_y = jitter.max_shift * label.h * img_size as f32;
            tx += rng.random_range(-shift_x..=shift_x);
            ty += rng.random_range(-shift_y..=shift_y);
        }

        let contrast = if jitter.contrast > 0.0 {
            rng.random_range(1.0 - jitter.contrast..=1.0 + jitter.contrast)
        } else {
            1.0
        };
        let brightness = if jitter.brightness > 0.0 {
            rng.random_range(-jitter.brightness..=jitter.brightness)
        } else {
            0.0
        };

        Placement {
            footprint,
            angle,
            tx,
            ty,
            contrast,
            brightness,
        }
    }
}

/// Sampled per-instance transform parameters.
#[derive(Debug, Clone, Copy)]
struct Placement {
    footprint: f32,
    angle: f32,
    tx: f32,
    ty: f32,
    contrast: f32,
    brightness: f32,
}

/// Builds the nearest-neighbor inverse-affine index map and footprint mask for
/// one patch instance on an `img_size` x `img_size` canvas.
///
/// Canvas pixels outside the rotated footprint keep index 0 and mask 0, so
/// rotation corners come out transparent rather than filled.
fn build_index_map(
    placement: &Placement,
    patch_size: usize,
    img_size: usize,
) -> (Vec<u32>, Vec<f32>) {
    let mut indices = vec![0u32; img_size * img_size];
    let mut mask = vec![0.0f32; img_size * img_size];

    let scale = placement.footprint / patch_size as f32;
    if scale <= 0.0 {
        return (indices, mask);
    }
    let (sin, cos) = placement.angle.sin_cos();

    // Only the canvas window that can contain the rotated footprint is
    // visited; the rest stays zero.
    let half = 0.5 * placement.footprint * (sin.abs() + cos.abs());
    let y0 = (placement.ty - half).floor().max(0.0) as usize;
    let y1 = ((placement.ty + half).ceil() as usize).min(img_size);
    let x0 = (placement.tx - half).floor().max(0.0) as usize;
    let x1 = ((placement.tx + half).ceil() as usize).min(img_size);

    let half_patch = patch_size as f32 / 2.0;
    for y in y0..y1 {
        for x in x0..x1 {
            let dx = x as f32 + 0.5 - placement.tx;
            let dy = y as f32 + 0.5 - placement.ty;
            // Inverse rotation maps canvas offsets back into patch space.
            let px = (cos * dx + sin * dy) / scale + half_patch;
            let py = (-sin * dx + cos * dy) / scale + half_patch;
            if px >= 0.0 && py >= 0.0 {
                let (px, py) = (px as usize, py as usize);
                if px < patch_size && py < patch_size {
                    indices[y * img_size + x] = (py * patch_size + px) as u32;
                    mask[y * img_size + x] = 1.0;
                }
            }
        }
    }
    (indices, mask)
}
