//! The patch optimization loop.
//!
//! Drives the strictly sequential epoch -> batch -> step state machine:
//! transform the patch onto each labeled object, composite, run the external
//! detector, reduce its output to the detection loss, add the printability and
//! smoothness regularizers, backpropagate, and clamp the patch back into
//! `[0, 1]`. A checkpoint image is written after every epoch so an interrupted
//! run always leaves the last completed epoch's patch usable.

pub mod scheduler;
pub mod seed;

use crate::core::config::PatchConfig;
use crate::core::errors::{AdvPatchError, LossTerm, Result};
use crate::core::traits::{Detector, MetricsSink};
use crate::data::dataset::PatchDataset;
use crate::processors::{
    MaxConfidenceExtractor, NonPrintabilityScore, PatchApplier, PatchTransformer,
    TotalVariation, TransformOptions,
};
use crate::utils::{parse_device, resize_nearest, tensor_to_rgb};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand::rngs::StdRng;
use scheduler::ReduceLrOnPlateau;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The three loss components of one step plus their combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    /// Mean maximum adversarial confidence over the batch.
    pub detection: f64,
    /// Weighted non-printability score.
    pub printability: f64,
    /// Weighted total variation.
    pub smoothness: f64,
    /// Combined scalar that was backpropagated.
    pub total: f64,
}

/// Per-epoch mean losses and step accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Epoch index.
    pub epoch: usize,
    /// Mean losses over the completed steps.
    pub losses: StepLosses,
    /// Steps that completed and updated the patch.
    pub completed: usize,
    /// Steps aborted by a numerical anomaly; the patch was not updated.
    pub skipped: usize,
}

/// Optimizes an adversarial patch against a fixed detector.
pub struct PatchTrainer<D, M> {
    config: PatchConfig,
    device: Device,
    transformer: PatchTransformer,
    applier: PatchApplier,
    extractor: MaxConfidenceExtractor,
    nps: NonPrintabilityScore,
    tv: TotalVariation,
    detector: D,
    sink: M,
}

impl<D: Detector, M: MetricsSink> PatchTrainer<D, M> {
    /// Builds a trainer, validating the configuration and loading the
    /// printable palette before any heavier resource is touched.
    pub fn new(config: PatchConfig, detector: D, sink: M) -> Result<Self> {
        config.validate()?;
        let device = parse_device(&config.device)?;
        let nps = NonPrintabilityScore::from_file(&config.printfile, &device)?;
        let transformer = PatchTransformer::new(TransformOptions {
            rotate: config.rotate,
            randomize_location: config.randomize_location,
            scale_fraction: config.scale_fraction,
            jitter: config.jitter,
        });
        let extractor = MaxConfidenceExtractor::new(config.target, config.target_class);
        Ok(Self {
            config,
            device,
            transformer,
            applier: PatchApplier::new(),
            extractor,
            nps,
            tv: TotalVariation::new(),
            detector,
            sink,
        })
    }

    /// The device the trainer allocates tensors on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Runs the optimization to `max_epochs` and returns the final patch.
    pub fn run(&mut self, dataset: &PatchDataset) -> Result<Tensor> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let patch = Var::from_tensor(&seed::seed_patch(
            &self.config.init,
            self.config.patch_size,
            &self.device,
        )?)?;
        let mut optimizer = AdamW::new(
            vec![patch.clone()],
            ParamsAdamW {
                lr: self.config.start_learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let mut lr_schedule = ReduceLrOnPlateau::new(
            self.config.start_learning_rate,
            self.config.plateau_factor,
            self.config.plateau_patience,
            self.config.min_learning_rate,
        )
        .with_cooldown(self.config.plateau_cooldown);

        info!(
            patch = %self.config.patch_name,
            images = dataset.len(),
            epochs = self.config.max_epochs,
            "starting patch optimization"
        );

        for epoch in 0..self.config.max_epochs {
            let stats = self.run_epoch(epoch, dataset, &patch, &mut optimizer, &mut rng)?;

            if let Some(lr) = lr_schedule.step(stats.losses.total) {
                optimizer.set_learning_rate(lr);
            }

            let checkpoint = self.save_checkpoint(patch.as_tensor())?;
            let step = (epoch + 1) * dataset.len().div_ceil(self.config.batch_size);
            self.sink
                .scalar("epoch/total_loss", stats.losses.total, step);
            self.sink
                .scalar("epoch/det_loss", stats.losses.detection, step);
            self.sink
                .scalar("epoch/nps_loss", stats.losses.printability, step);
            self.sink
                .scalar("epoch/tv_loss", stats.losses.smoothness, step);
            self.sink
                .scalar("epoch/learning_rate", optimizer.learning_rate(), step);
            self.sink
                .image("patch", &tensor_to_rgb(patch.as_tensor())?, step);

            info!(
                epoch,
                total = stats.losses.total,
                det = stats.losses.detection,
                nps = stats.losses.printability,
                tv = stats.losses.smoothness,
                skipped = stats.skipped,
                checkpoint = %checkpoint.display(),
                "epoch complete"
            );
        }

        Ok(patch.as_tensor().clone())
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        dataset: &PatchDataset,
        patch: &Var,
        optimizer: &mut AdamW,
        rng: &mut StdRng,
    ) -> Result<EpochStats> {
        let started = Instant::now();
        let batches = dataset.epoch_batches(self.config.batch_size, rng);
        let epoch_len = batches.len();
        let mut sums = StepLosses {
            detection: 0.0,
            printability: 0.0,
            smoothness: 0.0,
            total: 0.0,
        };
        let mut completed = 0usize;
        let mut skipped = 0usize;

        for (i_batch, indices) in batches.iter().enumerate() {
            // Every intermediate tensor of the step lives inside this call and
            // is released when it returns, keeping steady-state memory bounded.
            let outcome = self.step(epoch, i_batch, indices, dataset, patch, optimizer, rng);
            match outcome {
                Ok(losses) => {
                    sums.detection += losses.detection;
                    sums.printability += losses.printability;
                    sums.smoothness += losses.smoothness;
                    sums.total += losses.total;
                    completed += 1;

                    if i_batch % self.config.log_every == 0 {
                        let step = epoch * epoch_len + i_batch;
                        self.sink.scalar("loss/total", losses.total, step);
                        self.sink.scalar("loss/detection", losses.detection, step);
                        self.sink.scalar("loss/nps", losses.printability, step);
                        self.sink.scalar("loss/tv", losses.smoothness, step);
                    }
                }
                Err(err @ AdvPatchError::NumericalInstability { .. }) => {
                    // The failed step left the patch untouched; continuing
                    // with the next batch is safe, retrying this one is not.
                    error!(epoch, batch = i_batch, %err, "step aborted");
                    skipped += 1;
                }
                Err(other) => return Err(other),
            }
        }

        if completed == 0 {
            return Err(AdvPatchError::non_finite(
                LossTerm::Total,
                format!("epoch {}: every step was aborted", epoch),
            ));
        }
        let n = completed as f64;
        debug!(
            epoch,
            elapsed = ?started.elapsed(),
            batches = epoch_len,
            "epoch timing"
        );
        Ok(EpochStats {
            epoch,
            losses: StepLosses {
                detection: sums.detection / n,
                printability: sums.printability / n,
                smoothness: sums.smoothness / n,
                total: sums.total / n,
            },
            completed,
            skipped,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        epoch: usize,
        i_batch: usize,
        indices: &[usize],
        dataset: &PatchDataset,
        patch: &Var,
        optimizer: &mut AdamW,
        rng: &mut StdRng,
    ) -> Result<StepLosses> {
        let position = format!("epoch {} batch {}", epoch, i_batch);
        let (images, labels) = dataset.load_batch(indices, &self.device)?;
        if images.dims4()?.0 != labels.len() {
            return Err(AdvPatchError::data_shape(
                "image/label batch alignment",
                format!("{} label sets", images.dims4()?.0),
                format!("{}", labels.len()),
            ));
        }

        let transformed =
            self.transformer
                .forward(patch.as_tensor(), &labels, self.config.img_size, rng)?;
        let patched = self.applier.apply(&images, &transformed)?;
        let (det_h, det_w) = self.detector.input_size();
        let detector_input = resize_nearest(&patched, det_h, det_w)?;
        let detections = self.detector.detect(&detector_input)?;

        let det_loss = match self.extractor.detection_loss(&detections)? {
            Some(loss) => loss,
            None => Tensor::zeros((), DType::F32, &self.device)?,
        };
        let nps_loss = self
            .nps
            .score(patch.as_tensor())?
            .affine(self.config.nps_weight, 0.0)?;
        let tv_floor = Tensor::new(self.config.tv_floor as f32, &self.device)?;
        let tv_loss = self
            .tv
            .score(patch.as_tensor())?
            .affine(self.config.tv_weight, 0.0)?;
        let total = det_loss
            .add(&nps_loss)?
            .add(&tv_loss.maximum(&tv_floor)?)?;

        let losses = StepLosses {
            detection: finite_scalar(LossTerm::Detection, &det_loss, &position)?,
            printability: finite_scalar(LossTerm::Printability, &nps_loss, &position)?,
            smoothness: finite_scalar(LossTerm::Smoothness, &tv_loss, &position)?,
            total: finite_scalar(LossTerm::Total, &total, &position)?,
        };

        let grads = total.backward().map_err(|e| {
            AdvPatchError::from_candle("backward pass", e)
        })?;
        match grads.get(patch.as_tensor()) {
            Some(grad) => {
                let grad_sum = grad.sum_all()?.to_scalar::<f32>()?;
                if !grad_sum.is_finite() {
                    return Err(AdvPatchError::non_finite(LossTerm::PatchGradient, position));
                }
            }
            None => {
                warn!(epoch, batch = i_batch, "no gradient reached the patch");
                return Ok(losses);
            }
        }
        optimizer
            .step(&grads)
            .map_err(|e| AdvPatchError::from_candle("optimizer step", e))?;
        // The optimizer step can push pixels out of range; restore the
        // invariant before the next forward pass.
        patch.set(&patch.as_tensor().clamp(0.0f32, 1.0f32)?)?;

        Ok(losses)
    }

    fn save_checkpoint(&self, patch: &Tensor) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self
            .config
            .output_dir
            .join(format!("{}.png", self.config.patch_name));
        tensor_to_rgb(patch)?.save(&path)?;
        Ok(path)
    }
}

/// Extracts a scalar loss value, failing when it is NaN or Inf so the step is
/// aborted before the patch can be corrupted.
fn finite_scalar(term: LossTerm, value: &Tensor, position: &str) -> Result<f64> {
    let v = value.to_scalar::<f32>()?;
    if !v.is_finite() {
        return Err(AdvPatchError::non_finite(term, position.to_string()));
    }
    Ok(v as f64)
}

pub use crate::core::traits::{LogSink, NullSink};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ConfidenceTarget, JitterBounds, PatchInit};
    use crate::core::traits::DetectionOutput;
    use std::cell::Cell;
    use std::io::Write;

    /// Detector whose objectness is the mean intensity of each image, so the
    /// loss is differentiable with respect to the patch.
    struct MeanDetector;

    impl Detector for MeanDetector {
        fn detect(&self, images: &Tensor) -> Result<DetectionOutput> {
            let (n, _c, _h, _w) = images.dims4()?;
            let obj = images.flatten_from(1)?.mean(1)?.reshape((n, 1, 1))?;
            let boxes = Tensor::zeros((n, 1, 4), DType::F32, images.device())?;
            let cls = obj.affine(0.5, 0.1)?;
            let preds = Tensor::cat(&[boxes, obj, cls], 2)?;
            Ok(DetectionOutput::new(vec![preds]))
        }

        fn input_size(&self) -> (usize, usize) {
            (32, 32)
        }
    }

    /// Detector that reports NaN objectness for its next `nan_batches` calls
    /// and behaves like [`MeanDetector`] afterwards.
    struct FlakyDetector {
        nan_batches: Cell<usize>,
    }

    impl FlakyDetector {
        fn broken_for(nan_batches: usize) -> Self {
            Self {
                nan_batches: Cell::new(nan_batches),
            }
        }
    }

    impl Detector for FlakyDetector {
        fn detect(&self, images: &Tensor) -> Result<DetectionOutput> {
            let remaining = self.nan_batches.get();
            if remaining == 0 {
                return MeanDetector.detect(images);
            }
            self.nan_batches.set(remaining - 1);
            let n = images.dims4()?.0;
            let boxes = Tensor::zeros((n, 1, 4), DType::F32, images.device())?;
            let obj = Tensor::full(f32::NAN, (n, 1, 1), images.device())?;
            let cls = Tensor::full(0.5f32, (n, 1, 1), images.device())?;
            Ok(DetectionOutput::new(vec![Tensor::cat(&[boxes, obj, cls], 2)?]))
        }

        fn input_size(&self) -> (usize, usize) {
            (32, 32)
        }
    }

    fn test_config(dir: &std::path::Path) -> PatchConfig {
        let printfile = dir.join("print.txt");
        let mut f = std::fs::File::create(&printfile).unwrap();
        writeln!(f, "0.0,0.0,0.0").unwrap();
        writeln!(f, "1.0,1.0,1.0").unwrap();

        PatchConfig {
            patch_name: "test".to_string(),
            patch_size: 8,
            img_size: 32,
            batch_size: 2,
            max_epochs: 2,
            max_labels: 3,
            start_learning_rate: 0.05,
            tv_floor: 0.0,
            target: ConfidenceTarget::Objectness,
            rotate: false,
            randomize_location: false,
            jitter: JitterBounds::none(),
            init: PatchInit::Gray,
            printfile,
            output_dir: dir.join("out"),
            seed: Some(42),
            ..PatchConfig::default()
        }
    }

    fn write_dataset(dir: &std::path::Path) -> PatchDataset {
        let img_dir = dir.join("images");
        let lab_dir = dir.join("labels");
        std::fs::create_dir_all(&img_dir).unwrap();
        std::fs::create_dir_all(&lab_dir).unwrap();
        for i in 0..4 {
            image::RgbImage::from_pixel(32, 32, image::Rgb([200, 180, 160]))
                .save(img_dir.join(format!("{}.png", i)))
                .unwrap();
            let mut f = std::fs::File::create(lab_dir.join(format!("{}.txt", i))).unwrap();
            writeln!(f, "0 0.5 0.5 0.5 0.5").unwrap();
        }
        PatchDataset::open(&img_dir, &lab_dir, 3, 32).unwrap()
    }

    #[test]
    fn training_keeps_the_patch_in_range_and_saves_a_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let dataset = write_dataset(dir.path());

        let mut trainer = PatchTrainer::new(config, MeanDetector, NullSink).unwrap();
        let patch = trainer.run(&dataset).unwrap();

        let values = patch.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(dir.path().join("out/test.png").exists());
    }

    #[test]
    fn mean_detector_loss_decreases_over_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_epochs = 1;
        let dataset = write_dataset(dir.path());

        // Two separate runs from the same seed: the first epoch's losses are
        // identical, so a longer run ending lower means optimization works.
        let mut short = PatchTrainer::new(config.clone(), MeanDetector, NullSink).unwrap();
        let after_one = short.run(&dataset).unwrap();

        config.max_epochs = 6;
        let mut long = PatchTrainer::new(config, MeanDetector, NullSink).unwrap();
        let after_six = long.run(&dataset).unwrap();

        // The detector scores mean brightness, so the optimized patch darkens.
        let one = after_one.mean_all().unwrap().to_scalar::<f32>().unwrap();
        let six = after_six.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(six < one, "after_six {six} vs after_one {one}");
    }

    #[test]
    fn nan_detection_aborts_the_step_and_names_the_term() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let dataset = write_dataset(dir.path());
        let trainer =
            PatchTrainer::new(config, FlakyDetector::broken_for(usize::MAX), NullSink).unwrap();

        let patch = Var::from_tensor(
            &Tensor::full(0.5f32, (3, 8, 8), trainer.device()).unwrap(),
        )
        .unwrap();
        let before = patch.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mut optimizer = AdamW::new(vec![patch.clone()], ParamsAdamW::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let err = trainer
            .step(0, 0, &[0, 1], &dataset, &patch, &mut optimizer, &mut rng)
            .unwrap_err();
        match err {
            AdvPatchError::NumericalInstability { term, .. } => {
                assert_eq!(term, LossTerm::Detection)
            }
            other => panic!("expected a numerical instability, got {other}"),
        }
        // The aborted step must leave the patch exactly as it was.
        let after = patch.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn intermittent_nan_skips_the_batch_and_finishes_the_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let dataset = write_dataset(dir.path());
        let mut trainer =
            PatchTrainer::new(config, FlakyDetector::broken_for(1), NullSink).unwrap();

        let patch = Var::from_tensor(
            &Tensor::full(0.5f32, (3, 8, 8), trainer.device()).unwrap(),
        )
        .unwrap();
        let mut optimizer = AdamW::new(vec![patch.clone()], ParamsAdamW::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        // 4 images at batch size 2: one batch hits the NaN, the other trains.
        let stats = trainer
            .run_epoch(0, &dataset, &patch, &mut optimizer, &mut rng)
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn run_fails_when_every_step_is_numerically_unstable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_epochs = 1;
        let dataset = write_dataset(dir.path());

        let mut trainer =
            PatchTrainer::new(config, FlakyDetector::broken_for(usize::MAX), NullSink).unwrap();
        let err = trainer.run(&dataset).unwrap_err();
        assert!(matches!(
            err,
            AdvPatchError::NumericalInstability { .. }
        ));
    }

    #[test]
    fn missing_printfile_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.printfile = dir.path().join("absent.txt");
        assert!(PatchTrainer::new(config, MeanDetector, NullSink).is_err());
    }
}
