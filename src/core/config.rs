//! Experiment configuration for patch optimization.
//!
//! Every run is driven by a single immutable [`PatchConfig`] record selected by
//! name from a static registry at process start. Presets are built by
//! composition: each named constructor starts from [`PatchConfig::default`] and
//! overrides the fields it cares about, so the effective values of any
//! configuration are inspectable as one flat record.

use crate::core::errors::{AdvPatchError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How objectness and class score combine into the adversarial confidence
/// that the optimizer minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTarget {
    /// Minimize the objectness score alone (the paper's main objective).
    Objectness,
    /// Minimize the target-class probability alone.
    ClassScore,
    /// Minimize the product of objectness and target-class probability.
    ObjectnessTimesClass,
}

impl ConfidenceTarget {
    /// Combines an objectness score and a class score into a single value.
    pub fn combine(
        &self,
        obj: &candle_core::Tensor,
        cls: &candle_core::Tensor,
    ) -> candle_core::Result<candle_core::Tensor> {
        match self {
            ConfidenceTarget::Objectness => Ok(obj.clone()),
            ConfidenceTarget::ClassScore => Ok(cls.clone()),
            ConfidenceTarget::ObjectnessTimesClass => obj.mul(cls),
        }
    }
}

/// Seeding strategy for the initial patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchInit {
    /// Uniform gray (every pixel 0.5).
    Gray,
    /// Uniform random pixel values in [0,1].
    Random,
    /// Load and resize an existing image.
    Image(PathBuf),
}

/// Bounds for the random placement and appearance jitter applied per patch
/// instance during transformation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterBounds {
    /// Maximum rotation in radians, sampled uniformly from `[-max, +max]`.
    pub max_rotation: f32,
    /// Maximum placement offset as a fraction of the label box size.
    pub max_shift: f32,
    /// Multiplicative contrast jitter sampled from `[1-c, 1+c]`.
    pub contrast: f32,
    /// Additive brightness jitter sampled from `[-b, +b]`.
    pub brightness: f32,
}

impl Default for JitterBounds {
    fn default() -> Self {
        Self {
            max_rotation: 20.0_f32.to_radians(),
            max_shift: 0.25,
            contrast: 0.2,
            brightness: 0.1,
        }
    }
}

impl JitterBounds {
    /// Bounds that make the transform fully deterministic.
    pub fn none() -> Self {
        Self {
            max_rotation: 0.0,
            max_shift: 0.0,
            contrast: 0.0,
            brightness: 0.0,
        }
    }
}

/// Immutable configuration for one patch-optimization experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Name used for logging and the checkpoint file stem.
    pub patch_name: String,
    /// Side length of the square patch in pixels.
    pub patch_size: usize,
    /// Side length the dataset images are resized to (square).
    pub img_size: usize,
    /// Images per optimization step.
    pub batch_size: usize,
    /// Maximum number of epochs before the run terminates.
    pub max_epochs: usize,
    /// Maximum labels per image; exceeding this is a load-time error.
    pub max_labels: usize,
    /// Initial learning rate for the Adam optimizer.
    pub start_learning_rate: f64,
    /// Weight of the non-printability term.
    pub nps_weight: f64,
    /// Weight of the total-variation term.
    pub tv_weight: f64,
    /// Floor applied to the weighted total-variation term so it cannot vanish.
    pub tv_floor: f64,
    /// Which detector scores the attack minimizes.
    pub target: ConfidenceTarget,
    /// Class id the attack suppresses.
    pub target_class: usize,
    /// Patch footprint as a fraction of the label box diagonal.
    pub scale_fraction: f32,
    /// Whether to rotate patch instances.
    pub rotate: bool,
    /// Whether to jitter patch placement around the box center.
    pub randomize_location: bool,
    /// Jitter bounds for rotation, placement and photometric variation.
    pub jitter: JitterBounds,
    /// Patch seeding strategy.
    pub init: PatchInit,
    /// Safetensors checkpoint of the detector the binary attacks.
    pub model_path: PathBuf,
    /// Anchor boxes per grid cell of the detector.
    pub num_anchors: usize,
    /// Number of classes the detector predicts.
    pub num_classes: usize,
    /// File of printable RGB triplets, one per line.
    pub printfile: PathBuf,
    /// Directory of training images.
    pub img_dir: PathBuf,
    /// Directory of YOLO-format label files.
    pub lab_dir: PathBuf,
    /// Directory the checkpoint patch is written to.
    pub output_dir: PathBuf,
    /// Emit scalar metrics every this many batches.
    pub log_every: usize,
    /// Plateau scheduler: epochs without improvement before reducing the rate.
    pub plateau_patience: usize,
    /// Plateau scheduler: multiplicative learning-rate reduction factor.
    pub plateau_factor: f64,
    /// Plateau scheduler: epochs after a reduction during which patience
    /// counting is suspended.
    pub plateau_cooldown: usize,
    /// Plateau scheduler: lower bound on the learning rate.
    pub min_learning_rate: f64,
    /// Device specifier ("cpu", "cuda", "cuda:N").
    pub device: String,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            patch_name: "base".to_string(),
            patch_size: 300,
            img_size: 512,
            batch_size: 16,
            max_epochs: 500_000,
            max_labels: 20,
            start_learning_rate: 0.03,
            nps_weight: 0.01,
            tv_weight: 2.5,
            tv_floor: 0.1,
            target: ConfidenceTarget::ObjectnessTimesClass,
            target_class: 0,
            scale_fraction: 0.2,
            rotate: true,
            randomize_location: false,
            jitter: JitterBounds::default(),
            init: PatchInit::Random,
            model_path: PathBuf::from("weights/detector.safetensors"),
            num_anchors: 3,
            num_classes: 80,
            printfile: PathBuf::from("non_printability/30values.txt"),
            img_dir: PathBuf::from("data/train/images"),
            lab_dir: PathBuf::from("data/train/labels"),
            output_dir: PathBuf::from("saved_patches"),
            log_every: 5,
            plateau_patience: 50,
            plateau_factor: 0.1,
            plateau_cooldown: 0,
            min_learning_rate: 1e-6,
            device: "cpu".to_string(),
            seed: None,
        }
    }
}

/// Static registry of named experiment presets.
///
/// Initialized once at process start; the mapping itself is immutable.
static REGISTRY: Lazy<BTreeMap<&'static str, fn() -> PatchConfig>> = Lazy::new(|| {
    let mut m: BTreeMap<&'static str, fn() -> PatchConfig> = BTreeMap::new();
    m.insert("base", PatchConfig::default as fn() -> PatchConfig);
    m.insert("exp1", PatchConfig::exp1);
    m.insert("exp1_des", PatchConfig::exp1_des);
    m.insert("exp2_high_res", PatchConfig::exp2_high_res);
    m.insert("exp3_low_res", PatchConfig::exp3_low_res);
    m.insert("exp4_class_only", PatchConfig::exp4_class_only);
    m.insert("paper_obj", PatchConfig::paper_obj);
    m.insert("aircraft", PatchConfig::aircraft);
    m.insert("airbus-subset-8", PatchConfig::airbus_subset_8);
    m
});

impl PatchConfig {
    /// Looks up a named preset, failing fast with the list of valid names.
    pub fn for_mode(mode: &str) -> Result<Self> {
        REGISTRY.get(mode).map(|f| f()).ok_or_else(|| {
            AdvPatchError::config(format!(
                "unknown mode '{}'; valid modes are: {}",
                mode,
                Self::mode_names().join(", ")
            ))
        })
    }

    /// Names of all registered presets, sorted.
    pub fn mode_names() -> Vec<&'static str> {
        REGISTRY.keys().copied().collect()
    }

    /// Baseline experiment with a raised total-variation floor.
    fn exp1() -> Self {
        Self {
            patch_name: "exp1".to_string(),
            tv_floor: 0.165,
            ..Self::default()
        }
    }

    /// `exp1` sized for a desktop GPU: a larger patch at the same batch size.
    fn exp1_des() -> Self {
        Self {
            patch_name: "exp1_des".to_string(),
            patch_size: 400,
            batch_size: 16,
            ..Self::exp1()
        }
    }

    /// Higher-resolution patch variant of `exp1`.
    fn exp2_high_res() -> Self {
        Self {
            patch_name: "exp2_high_res".to_string(),
            patch_size: 400,
            ..Self::exp1()
        }
    }

    /// Lower-resolution patch variant of `exp1`.
    fn exp3_low_res() -> Self {
        Self {
            patch_name: "exp3_low_res".to_string(),
            patch_size: 100,
            ..Self::exp1()
        }
    }

    /// Minimizes only the target-class score.
    fn exp4_class_only() -> Self {
        Self {
            patch_name: "exp4_class_only".to_string(),
            target: ConfidenceTarget::ClassScore,
            ..Self::exp1()
        }
    }

    /// Reproduces the paper objective: suppress objectness alone.
    fn paper_obj() -> Self {
        Self {
            patch_name: "paper_obj".to_string(),
            target: ConfidenceTarget::Objectness,
            tv_floor: 0.165,
            ..Self::default()
        }
    }

    /// Full Airbus aerial dataset; the learning rate scales linearly with the
    /// smaller batch that fits alongside the larger images.
    fn aircraft() -> Self {
        Self {
            patch_name: "aircraft".to_string(),
            batch_size: 12,
            start_learning_rate: 0.045,
            img_dir: PathBuf::from("airbusdata/train/images"),
            lab_dir: PathBuf::from("airbusdata/train/labels"),
            ..Self::default()
        }
    }

    /// Eight-image Airbus subset for quick overfitting runs.
    fn airbus_subset_8() -> Self {
        Self {
            patch_name: "airbus-subset-8".to_string(),
            img_dir: PathBuf::from("airbus-subset-8/images"),
            lab_dir: PathBuf::from("airbus-subset-8/labels"),
            ..Self::aircraft()
        }
    }

    /// Validates invariants that would otherwise surface deep inside the
    /// pipeline: non-zero dimensions, positive learning rate, sane weights.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.img_size == 0 {
            return Err(AdvPatchError::config(
                "patch_size and img_size must be non-zero",
            ));
        }
        if self.batch_size == 0 {
            return Err(AdvPatchError::config("batch_size must be non-zero"));
        }
        if self.max_labels == 0 {
            return Err(AdvPatchError::config("max_labels must be non-zero"));
        }
        if self.start_learning_rate <= 0.0 {
            return Err(AdvPatchError::config(
                "start_learning_rate must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_fraction) || self.scale_fraction == 0.0 {
            return Err(AdvPatchError::config(
                "scale_fraction must be in (0, 1]",
            ));
        }
        if self.num_classes == 0 || self.target_class >= self.num_classes {
            return Err(AdvPatchError::config(format!(
                "target_class {} outside the detector's {} classes",
                self.target_class, self.num_classes
            )));
        }
        if self.plateau_factor <= 0.0 || self.plateau_factor >= 1.0 {
            return Err(AdvPatchError::config(
                "plateau_factor must be in (0, 1)",
            ));
        }
        Ok(())
    }
}
