//! Detector model implementations.

pub mod yolo;

pub use yolo::TinyYolo;
