//! Image-directory dataset with YOLO label files.
//!
//! Pairs every image in `img_dir` with the same-stem `.txt` file in `lab_dir`.
//! Images are decoded and resized in parallel with rayon; labels are validated
//! against `max_labels` at load time so an overflow surfaces before it can
//! silently drop boxes inside the transform.

use crate::core::errors::{AdvPatchError, Result};
use crate::data::labels::LabelSet;
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// A dataset of images and their object labels.
#[derive(Debug)]
pub struct PatchDataset {
    entries: Vec<(PathBuf, Option<PathBuf>)>,
    max_labels: usize,
    img_size: usize,
}

impl PatchDataset {
    /// Scans `img_dir` for images and pairs each with its label file.
    ///
    /// An image without a label file yields an all-sentinel label set; a
    /// directory without any image is a configuration error.
    pub fn open(
        img_dir: &Path,
        lab_dir: &Path,
        max_labels: usize,
        img_size: usize,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        for item in std::fs::read_dir(img_dir)? {
            let path = item?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    AdvPatchError::config(format!("unusable image file name: {}", path.display()))
                })?;
            let label_path = lab_dir.join(format!("{}.txt", stem));
            let label_path = label_path.exists().then_some(label_path);
            entries.push((path, label_path));
        }
        entries.sort();
        if entries.is_empty() {
            return Err(AdvPatchError::config(format!(
                "no images found in {}",
                img_dir.display()
            )));
        }
        debug!(images = entries.len(), "dataset scanned");
        Ok(Self {
            entries,
            max_labels,
            img_size,
        })
    }

    /// Number of images in the dataset.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the dataset holds no images (never after a successful open).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shuffled batches of indices for one epoch; a trailing partial batch is
    /// kept.
    pub fn epoch_batches(&self, batch_size: usize, rng: &mut impl rand::Rng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.entries.len()).collect();
        indices.shuffle(rng);
        indices.chunks(batch_size).map(|c| c.to_vec()).collect()
    }

    /// Loads the images and labels for one batch of indices.
    ///
    /// Images are decoded in parallel, resized to `img_size` x `img_size`, and
    /// stacked into a `[N, 3, H, W]` tensor in `[0, 1]`. The label vector is
    /// index-aligned with the image tensor.
    pub fn load_batch(
        &self,
        indices: &[usize],
        device: &Device,
    ) -> Result<(Tensor, Vec<LabelSet>)> {
        let size = self.img_size;
        let loaded: Vec<(Vec<f32>, LabelSet)> = indices
            .par_iter()
            .map(|&i| {
                let (img_path, lab_path) = &self.entries[i];
                let image = image::open(img_path)?
                    .resize_exact(size as u32, size as u32, FilterType::Triangle)
                    .to_rgb8();
                let mut pixels = vec![0.0f32; 3 * size * size];
                for (x, y, pixel) in image.enumerate_pixels() {
                    let (x, y) = (x as usize, y as usize);
                    for c in 0..3 {
                        pixels[c * size * size + y * size + x] = pixel.0[c] as f32 / 255.0;
                    }
                }
                let labels = match lab_path {
                    Some(path) => LabelSet::from_file(path, self.max_labels)?,
                    None => LabelSet::empty(self.max_labels),
                };
                Ok((pixels, labels))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut data = Vec::with_capacity(indices.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(indices.len());
        for (pixels, label_set) in loaded {
            data.extend_from_slice(&pixels);
            labels.push(label_set);
        }
        let images = Tensor::from_vec(data, (indices.len(), 3, size, size), device)?;
        Ok((images, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    fn write_test_dataset(dir: &Path, n: usize) {
        let img_dir = dir.join("images");
        let lab_dir = dir.join("labels");
        std::fs::create_dir_all(&img_dir).unwrap();
        std::fs::create_dir_all(&lab_dir).unwrap();
        for i in 0..n {
            let img = image::RgbImage::from_pixel(8, 8, image::Rgb([i as u8 * 10, 0, 0]));
            img.save(img_dir.join(format!("img{}.png", i))).unwrap();
            let mut f = std::fs::File::create(lab_dir.join(format!("img{}.txt", i))).unwrap();
            writeln!(f, "0 0.5 0.5 0.25 0.25").unwrap();
        }
    }

    #[test]
    fn open_pairs_images_with_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), 3);
        let dataset = PatchDataset::open(
            &dir.path().join("images"),
            &dir.path().join("labels"),
            5,
            16,
        )
        .unwrap();
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn load_batch_shapes_and_range() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), 2);
        let dataset = PatchDataset::open(
            &dir.path().join("images"),
            &dir.path().join("labels"),
            5,
            16,
        )
        .unwrap();

        let (images, labels) = dataset.load_batch(&[0, 1], &Device::Cpu).unwrap();
        assert_eq!(images.dims(), &[2, 3, 16, 16]);
        assert_eq!(labels.len(), 2);
        assert!(!labels[0].boxes()[0].is_sentinel());

        let max = images
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .fold(f32::MIN, f32::max);
        assert!(max <= 1.0);
    }

    #[test]
    fn epoch_batches_cover_all_indices() {
        let dir = tempfile::tempdir().unwrap();
        write_test_dataset(dir.path(), 5);
        let dataset = PatchDataset::open(
            &dir.path().join("images"),
            &dir.path().join("labels"),
            5,
            16,
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let batches = dataset.epoch_batches(2, &mut rng);
        assert_eq!(batches.len(), 3);
        let mut all: Vec<usize> = batches.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn open_fails_on_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        assert!(
            PatchDataset::open(&dir.path().join("images"), &dir.path().join("labels"), 5, 16)
                .is_err()
        );
    }
}
