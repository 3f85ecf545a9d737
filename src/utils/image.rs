//! Image and tensor conversion utilities.
//!
//! This module provides:
//! - Device configuration for candle tensors
//! - RGB image <-> `[3, H, W]` float tensor conversion
//! - A nearest-neighbor resize that keeps gradients flowing to its input

use crate::core::errors::{AdvPatchError, Result};
use candle_core::{DType, Device, Tensor};
use image::RgbImage;

#[cfg(not(feature = "cuda"))]
fn cuda_not_enabled() -> AdvPatchError {
    AdvPatchError::config("CUDA support not enabled. Compile with --features cuda")
}

/// Parses a device string and creates a candle [`Device`].
///
/// # Supported formats
///
/// - `"cpu"` → CPU device
/// - `"cuda"` or `"gpu"` → CUDA device 0
/// - `"cuda:N"` → CUDA device N
///
/// # Errors
///
/// Returns an error if the device string is invalid, or CUDA is requested but
/// unavailable.
pub fn parse_device(device_str: &str) -> Result<Device> {
    let device_str = device_str.to_lowercase();
    match device_str.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0).map_err(|e| {
                    AdvPatchError::config(format!("failed to create CUDA device: {}", e))
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(cuda_not_enabled())
            }
        }
        s if s.starts_with("cuda:") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = s
                    .strip_prefix("cuda:")
                    .unwrap()
                    .parse()
                    .map_err(|_| {
                        AdvPatchError::config(format!("invalid CUDA device ordinal in '{}'", s))
                    })?;
                Device::new_cuda(ordinal).map_err(|e| {
                    AdvPatchError::config(format!(
                        "failed to create CUDA device {}: {}",
                        ordinal, e
                    ))
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(cuda_not_enabled())
            }
        }
        _ => Err(AdvPatchError::config(format!(
            "unknown device: '{}'. Use 'cpu', 'cuda', or 'cuda:N'",
            device_str
        ))),
    }
}

/// Converts an RGB image into a `[3, H, W]` f32 tensor with values in `[0, 1]`.
pub fn rgb_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut data = vec![0.0f32; 3 * h * w];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            data[c * h * w + y * w + x] = pixel.0[c] as f32 / 255.0;
        }
    }
    Ok(Tensor::from_vec(data, (3, h, w), device)?)
}

/// Converts a `[3, H, W]` tensor with values in `[0, 1]` into an RGB image.
///
/// Values are clamped before quantization, so slightly out-of-range tensors
/// still produce a valid image.
pub fn tensor_to_rgb(tensor: &Tensor) -> Result<RgbImage> {
    let (_c, h, w) = tensor.dims3()?;
    let data = tensor
        .clamp(0.0f32, 1.0f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(w as u32, h as u32, data).ok_or_else(|| {
        AdvPatchError::data_shape("tensor to image", format!("{}x{}x3 bytes", w, h), "fewer")
    })
}

/// Resizes a `[N, C, H, W]` batch to `(out_h, out_w)` with nearest-neighbor
/// sampling expressed as two `index_select` gathers, so the operation is
/// differentiable with respect to the input values.
pub fn resize_nearest(batch: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_n, _c, h, w) = batch.dims4()?;
    if h == out_h && w == out_w {
        return Ok(batch.clone());
    }
    let device = batch.device();
    let rows: Vec<u32> = (0..out_h)
        .map(|y| (((y as f32 + 0.5) * h as f32 / out_h as f32) as usize).min(h - 1) as u32)
        .collect();
    let cols: Vec<u32> = (0..out_w)
        .map(|x| (((x as f32 + 0.5) * w as f32 / out_w as f32) as usize).min(w - 1) as u32)
        .collect();
    let rows = Tensor::from_vec(rows, out_h, device)?;
    let cols = Tensor::from_vec(cols, out_w, device)?;
    Ok(batch.index_select(&rows, 2)?.index_select(&cols, 3)?)
}
