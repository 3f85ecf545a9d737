//! Patch seeding strategies.

use crate::core::config::PatchInit;
use crate::core::errors::Result;
use crate::utils::rgb_to_tensor;
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;

/// Builds the initial `[3, S, S]` patch for the chosen strategy.
///
/// All strategies produce values in `[0, 1]`; the image strategy resizes the
/// reference image to the patch size.
pub fn seed_patch(init: &PatchInit, patch_size: usize, device: &Device) -> Result<Tensor> {
    match init {
        PatchInit::Gray => Ok(Tensor::full(
            0.5f32,
            (3, patch_size, patch_size),
            device,
        )?),
        PatchInit::Random => Ok(Tensor::rand(
            0.0f32,
            1.0f32,
            (3, patch_size, patch_size),
            device,
        )?),
        PatchInit::Image(path) => {
            let image = image::open(path)?
                .resize_exact(patch_size as u32, patch_size as u32, FilterType::Triangle)
                .to_rgb8();
            let tensor = rgb_to_tensor(&image, device)?;
            Ok(tensor.to_dtype(DType::F32)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_seed_is_uniform_half() {
        let patch = seed_patch(&PatchInit::Gray, 8, &Device::Cpu).unwrap();
        assert_eq!(patch.dims(), &[3, 8, 8]);
        let values = patch.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn random_seed_stays_in_unit_range() {
        let patch = seed_patch(&PatchInit::Random, 16, &Device::Cpu).unwrap();
        let values = patch.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn image_seed_is_resized_to_the_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.png");
        image::RgbImage::from_pixel(32, 20, image::Rgb([255, 0, 0]))
            .save(&path)
            .unwrap();

        let patch = seed_patch(&PatchInit::Image(path), 12, &Device::Cpu).unwrap();
        assert_eq!(patch.dims(), &[3, 12, 12]);
        let red = patch
            .narrow(0, 0, 1)
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(red > 0.95);
    }
}
