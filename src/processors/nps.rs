//! Non-printability score.
//!
//! Penalizes patch pixels that no physical printer ink can reproduce. The
//! score is the mean, over all pixels, of the distance to the nearest color in
//! a fixed printable palette. The distance is a smooth norm so the score stays
//! differentiable end to end; there is no discrete nearest-neighbor lookup.

use crate::core::errors::{AdvPatchError, Result};
use candle_core::{Device, Tensor};
use std::path::Path;

const DIST_EPS: f64 = 1e-9;

/// Scores how far patch pixels are from the printable palette.
#[derive(Debug)]
pub struct NonPrintabilityScore {
    /// Palette reshaped for broadcasting against the patch, `[K, 3, 1, 1]`.
    palette: Tensor,
}

impl NonPrintabilityScore {
    /// Creates a scorer from RGB triplets in `[0, 1]`.
    pub fn new(colors: &[[f32; 3]], device: &Device) -> Result<Self> {
        if colors.is_empty() {
            return Err(AdvPatchError::config("printable palette is empty"));
        }
        let data: Vec<f32> = colors.iter().flatten().copied().collect();
        let palette = Tensor::from_vec(data, (colors.len(), 3, 1, 1), device)?;
        Ok(Self { palette })
    }

    /// Loads a palette file: one RGB triplet per line, comma- or
    /// whitespace-delimited, values in `[0, 1]`. Blank lines and `#` comments
    /// are ignored.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut colors = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<f32> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .map(str::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    AdvPatchError::config(format!(
                        "{}:{}: invalid color value: {}",
                        path.display(),
                        lineno + 1,
                        e
                    ))
                })?;
            if parts.len() != 3 {
                return Err(AdvPatchError::config(format!(
                    "{}:{}: expected 3 components, got {}",
                    path.display(),
                    lineno + 1,
                    parts.len()
                )));
            }
            if parts.iter().any(|v| !(0.0..=1.0).contains(v)) {
                return Err(AdvPatchError::config(format!(
                    "{}:{}: color component outside [0, 1]",
                    path.display(),
                    lineno + 1
                )));
            }
            colors.push([parts[0], parts[1], parts[2]]);
        }
        Self::new(&colors, device)
    }

    /// Number of palette colors.
    pub fn palette_len(&self) -> usize {
        self.palette.dims4().map(|(k, _, _, _)| k).unwrap_or(0)
    }

    /// Scores a `[3, S, S]` patch: per pixel, the smooth distance to the
    /// nearest palette color, averaged over all pixels.
    pub fn score(&self, patch: &Tensor) -> Result<Tensor> {
        // [1, 3, S, S] against [K, 3, 1, 1] -> per-color distances [K, S, S].
        let diff = patch.unsqueeze(0)?.broadcast_sub(&self.palette)?;
        let dist = diff.sqr()?.sum(1)?.affine(1.0, DIST_EPS)?.sqrt()?;
        Ok(dist.min(0)?.mean_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PALETTE: &[[f32; 3]] = &[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [0.8, 0.1, 0.1]];

    #[test]
    fn palette_colored_patch_scores_zero() {
        let device = Device::Cpu;
        let nps = NonPrintabilityScore::new(PALETTE, &device).unwrap();
        // Every pixel exactly equals the third palette color.
        let mut data = Vec::new();
        for c in PALETTE[2] {
            data.extend(std::iter::repeat(c).take(16));
        }
        let patch = Tensor::from_vec(data, (3, 4, 4), &device).unwrap();

        let score = nps.score(&patch).unwrap().to_scalar::<f32>().unwrap();
        assert!(score < 1e-4, "score {score}");
    }

    #[test]
    fn off_palette_patch_scores_positive() {
        let device = Device::Cpu;
        let nps = NonPrintabilityScore::new(PALETTE, &device).unwrap();
        let patch = Tensor::full(0.5f32, (3, 4, 4), &device).unwrap();

        let score = nps.score(&patch).unwrap().to_scalar::<f32>().unwrap();
        // Nearest palette color to mid-gray is (0.8, 0.1, 0.1) at distance
        // sqrt(0.3^2 + 0.4^2 + 0.4^2).
        assert!((score - 0.41f32.sqrt()).abs() < 1e-3, "score {score}");
    }

    #[test]
    fn parses_palette_file_with_mixed_delimiters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# printable inks").unwrap();
        writeln!(file, "0.0,0.0,0.0").unwrap();
        writeln!(file, "1.0 1.0 1.0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "0.51372,0.19607,0.18823").unwrap();

        let nps = NonPrintabilityScore::from_file(file.path(), &Device::Cpu).unwrap();
        assert_eq!(nps.palette_len(), 3);
    }

    #[test]
    fn rejects_out_of_range_and_short_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0,0.0,1.5").unwrap();
        assert!(NonPrintabilityScore::from_file(file.path(), &Device::Cpu).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0,0.0").unwrap();
        assert!(NonPrintabilityScore::from_file(file.path(), &Device::Cpu).is_err());
    }

    #[test]
    fn empty_palette_is_rejected() {
        assert!(NonPrintabilityScore::new(&[], &Device::Cpu).is_err());
    }
}
