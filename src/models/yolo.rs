//! A compact single-scale YOLO-style detector backed by candle.
//!
//! This is the reference detector the training binary loads from a
//! safetensors checkpoint. Any model implementing [`Detector`] can replace it;
//! the optimization loop only relies on the decoded
//! `[N, candidates, 5 + classes]` layout and on the forward pass being
//! differentiable with respect to its input.

use crate::core::errors::{AdvPatchError, Result};
use crate::core::traits::{DetectionOutput, Detector};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};
use std::path::Path;

const INPUT_SIZE: usize = 416;

/// Channel widths of the tiny backbone; each block halves the resolution.
const BACKBONE: &[usize] = &[16, 32, 64, 128, 256];

/// Tiny-YOLO-style detector: five stride-2 blocks and a 1x1 prediction head.
#[derive(Debug)]
pub struct TinyYolo {
    blocks: Vec<Conv2d>,
    neck: Conv2d,
    head: Conv2d,
    anchors: usize,
    classes: usize,
}

fn leaky(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.maximum(&xs.affine(0.1, 0.0)?)
}

impl TinyYolo {
    /// Builds the detector graph from a variable store.
    pub fn new(vb: VarBuilder, anchors: usize, classes: usize) -> Result<Self> {
        if anchors == 0 || classes == 0 {
            return Err(AdvPatchError::config(
                "detector needs at least one anchor and one class",
            ));
        }
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut blocks = Vec::with_capacity(BACKBONE.len());
        let mut in_ch = 3;
        for (i, &out_ch) in BACKBONE.iter().enumerate() {
            blocks.push(candle_nn::conv2d(
                in_ch,
                out_ch,
                3,
                conv_cfg,
                vb.pp(format!("block{}", i)),
            )?);
            in_ch = out_ch;
        }
        let neck = candle_nn::conv2d(in_ch, 512, 3, conv_cfg, vb.pp("neck"))?;
        let head = candle_nn::conv2d(
            512,
            anchors * (5 + classes),
            1,
            Conv2dConfig::default(),
            vb.pp("head"),
        )?;
        Ok(Self {
            blocks,
            neck,
            head,
            anchors,
            classes,
        })
    }

    /// Loads detector weights from a safetensors checkpoint.
    pub fn load(path: &Path, anchors: usize, classes: usize, device: &Device) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.to_path_buf()], DType::F32, device)
                .map_err(|e| AdvPatchError::from_candle("load detector weights", e))?
        };
        Self::new(vb, anchors, classes)
    }

    /// Raw forward pass to the undecoded prediction grid.
    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = images.clone();
        for block in &self.blocks {
            xs = leaky(&block.forward(&xs)?)?.max_pool2d(2)?;
        }
        let xs = leaky(&self.neck.forward(&xs)?)?;
        self.head.forward(&xs)
    }

    /// Decodes the grid into `[N, anchors * cells, 5 + classes]`, applying a
    /// sigmoid to objectness and class scores.
    fn decode(&self, grid: &Tensor) -> candle_core::Result<Tensor> {
        let (n, _ch, gh, gw) = grid.dims4()?;
        let attrs = 5 + self.classes;
        let preds = grid
            .reshape((n, self.anchors, attrs, gh, gw))?
            .permute((0, 1, 3, 4, 2))?
            .reshape((n, self.anchors * gh * gw, attrs))?;
        let boxes = preds.narrow(2, 0, 4)?;
        let scores = candle_nn::ops::sigmoid(&preds.narrow(2, 4, 1 + self.classes)?)?;
        Tensor::cat(&[boxes, scores], 2)
    }
}

impl Detector for TinyYolo {
    fn detect(&self, images: &Tensor) -> Result<DetectionOutput> {
        let grid = self
            .forward(images)
            .map_err(|e| AdvPatchError::from_candle("detector forward", e))?;
        let preds = self
            .decode(&grid)
            .map_err(|e| AdvPatchError::from_candle("detector decode", e))?;
        Ok(DetectionOutput::new(vec![preds]))
    }

    fn input_size(&self) -> (usize, usize) {
        (INPUT_SIZE, INPUT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn random_model(anchors: usize, classes: usize) -> TinyYolo {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TinyYolo::new(vb, anchors, classes).unwrap()
    }

    #[test]
    fn detect_produces_decoded_candidates() {
        let model = random_model(3, 4);
        let images = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();

        let output = model.detect(&images).unwrap();
        assert_eq!(output.scales.len(), 1);
        // 64 / 32 = 2 cells per side, 3 anchors each.
        assert_eq!(output.scales[0].dims(), &[1, 3 * 2 * 2, 9]);
    }

    #[test]
    fn scores_are_sigmoid_squashed() {
        let model = random_model(2, 3);
        let images = Tensor::rand(0.0f32, 1.0f32, (1, 3, 32, 32), &Device::Cpu).unwrap();

        let preds = &model.detect(&images).unwrap().scales[0];
        let scores = preds
            .narrow(2, 4, 4)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(scores.iter().all(|&s| (0.0..=1.0).contains(&s)));
    }

    #[test]
    fn zero_anchors_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(TinyYolo::new(vb, 0, 4).is_err());
    }
}
