//! Utility functions shared across the pipeline.

pub mod image;

pub use image::{parse_device, resize_nearest, rgb_to_tensor, tensor_to_rgb};
