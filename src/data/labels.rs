//! YOLO-format bounding-box labels and sentinel padding.
//!
//! Each image carries an ordered set of up to `max_labels` boxes in
//! normalized coordinates. Unused slots are filled with an all-zero sentinel
//! box that every downstream component must treat as "no object here".

use crate::core::errors::{AdvPatchError, Result};
use std::path::Path;

/// A single labeled object in normalized `[0, 1]` image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LabelBox {
    /// Class id of the labeled object.
    pub class_id: u32,
    /// Box center x.
    pub cx: f32,
    /// Box center y.
    pub cy: f32,
    /// Box width.
    pub w: f32,
    /// Box height.
    pub h: f32,
}

impl LabelBox {
    /// The all-zero padding sentinel.
    pub fn sentinel() -> Self {
        Self::default()
    }

    /// True for padding entries: a real box always has positive extent.
    pub fn is_sentinel(&self) -> bool {
        self.w <= 0.0 || self.h <= 0.0
    }
}

/// The labels of one image, zero-padded to a fixed length.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSet {
    boxes: Vec<LabelBox>,
}

impl LabelSet {
    /// Builds a label set from real boxes, padding with sentinels up to
    /// `max_labels`.
    ///
    /// # Errors
    ///
    /// Returns a data shape error when more than `max_labels` boxes are given.
    /// Truncating silently would drop objects from the loss, so the overflow
    /// must surface at load time.
    pub fn new(boxes: Vec<LabelBox>, max_labels: usize) -> Result<Self> {
        if boxes.len() > max_labels {
            return Err(AdvPatchError::data_shape(
                "label set exceeds max_labels; raise max_labels to cover the dataset",
                format!("<= {} boxes", max_labels),
                format!("{} boxes", boxes.len()),
            ));
        }
        let mut boxes = boxes;
        boxes.resize(max_labels, LabelBox::sentinel());
        Ok(Self { boxes })
    }

    /// A label set of only sentinels (an image without objects).
    pub fn empty(max_labels: usize) -> Self {
        Self {
            boxes: vec![LabelBox::sentinel(); max_labels],
        }
    }

    /// All slots, sentinels included.
    pub fn boxes(&self) -> &[LabelBox] {
        &self.boxes
    }

    /// Number of slots (`max_labels`).
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// True when every slot is a sentinel.
    pub fn is_empty(&self) -> bool {
        self.boxes.iter().all(LabelBox::is_sentinel)
    }

    /// Parses a YOLO label file: one `class cx cy w h` line per object,
    /// whitespace-delimited, normalized coordinates.
    pub fn from_file(path: &Path, max_labels: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut boxes = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            boxes.push(parse_label_line(line).map_err(|e| {
                AdvPatchError::config(format!(
                    "{}:{}: {}",
                    path.display(),
                    lineno + 1,
                    e
                ))
            })?);
        }
        Self::new(boxes, max_labels).map_err(|e| match e {
            AdvPatchError::DataShape {
                expected, actual, ..
            } => AdvPatchError::data_shape(
                format!(
                    "{}: label count exceeds max_labels; raise max_labels to cover the dataset",
                    path.display()
                ),
                expected,
                actual,
            ),
            other => other,
        })
    }
}

fn parse_label_line(line: &str) -> std::result::Result<LabelBox, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    let class_id: u32 = fields[0]
        .parse()
        .map_err(|_| format!("invalid class id '{}'", fields[0]))?;
    let mut coords = [0.0f32; 4];
    for (slot, field) in coords.iter_mut().zip(&fields[1..]) {
        let v: f32 = field
            .parse()
            .map_err(|_| format!("invalid coordinate '{}'", field))?;
        if !(0.0..=1.0).contains(&v) {
            return Err(format!("coordinate '{}' outside [0, 1]", field));
        }
        *slot = v;
    }
    let [cx, cy, w, h] = coords;
    if w == 0.0 || h == 0.0 {
        return Err("zero-extent box would be indistinguishable from padding".to_string());
    }
    Ok(LabelBox {
        class_id,
        cx,
        cy,
        w,
        h,
    })
}
