//! The classifier seam: patch in, class probabilities and an optional
//! intermediate activation out.
//!
//! Model adapters implement [`Classifier`]. The activation is whatever the
//! adapter captured from an inner layer during the same forward pass; it is
//! returned by value so nothing about one call can leak into another.

use ndarray::Array3;
use serde::Serialize;

use crate::energy::{luminance, sobel_magnitude};
use crate::error::{Error, Result};
use crate::patch::Patch;

/// Activation captured from inside the classifier, shaped
/// `[channels, height, width]`.
pub type ActivationTensor = Array3<f32>;

/// Verdict of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    /// A camera-captured image.
    Real,
    /// A synthetically generated image.
    Fake,
}

impl Label {
    /// Lowercase name, as used in reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Real => "real",
            Label::Fake => "fake",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one forward pass.
#[derive(Debug, Clone)]
pub struct Inference {
    /// `[p_real, p_fake]`.
    pub probabilities: [f32; 2],
    /// Captured activation, if the adapter produced one.
    pub activation: Option<ActivationTensor>,
}

/// Label and confidence derived from an [`Inference`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    /// Winning class.
    pub label: Label,
    /// Probability of the winning class.
    pub confidence: f32,
    /// Probability of [`Label::Real`].
    pub p_real: f32,
    /// Probability of [`Label::Fake`].
    pub p_fake: f32,
}

impl Inference {
    /// Arg-max over the probabilities; a tie goes to [`Label::Real`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InferenceUnavailable`] if a probability is negative
    /// or not finite.
    pub fn verdict(&self) -> Result<Verdict> {
        let [p_real, p_fake] = self.probabilities;
        if !(p_real.is_finite() && p_fake.is_finite()) || p_real < 0.0 || p_fake < 0.0 {
            return Err(Error::InferenceUnavailable(format!(
                "classifier returned unusable probabilities [{p_real}, {p_fake}]"
            )));
        }
        let (label, confidence) = if p_fake > p_real {
            (Label::Fake, p_fake)
        } else {
            (Label::Real, p_real)
        };
        Ok(Verdict {
            label,
            confidence,
            p_real,
            p_fake,
        })
    }
}

/// A synthetic-image classifier.
///
/// Implementations hold read-only parameters and must be safe to call from
/// several threads at once.
pub trait Classifier: Send + Sync {
    /// Classify `patch`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InferenceUnavailable`] when no probabilities can be
    /// produced. A missing activation is not an error.
    fn infer(&self, patch: &Patch) -> Result<Inference>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn infer(&self, patch: &Patch) -> Result<Inference> {
        (**self).infer(patch)
    }
}

impl<C: Classifier + ?Sized> Classifier for std::sync::Arc<C> {
    fn infer(&self, patch: &Patch) -> Result<Inference> {
        (**self).infer(patch)
    }
}

/// Side of the square cells the heuristic activation is pooled over.
const CELL: usize = 8;

/// Mean noise residual (in `[0, 1]` luminance units) at which the fake
/// probability has decayed to `1/e`.
const NOISE_SCALE: f32 = 0.02;

/// Weight-free classifier scoring how strongly the patch's sensor noise has
/// been suppressed.
///
/// Generated images tend to lack the pixel-level noise residual cameras leave
/// behind. The fake probability is `exp(-mean_residual / 0.02)`, where the
/// residual is the distance of each luminance value from its 3x3 mean. The
/// activation has two channels, residual and gradient magnitude, averaged
/// over 8x8 cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    /// Create the classifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Classifier for HeuristicClassifier {
    #[allow(clippy::cast_precision_loss)]
    fn infer(&self, patch: &Patch) -> Result<Inference> {
        let (w, h) = (patch.width() as usize, patch.height() as usize);
        if w == 0 || h == 0 {
            return Err(Error::InferenceUnavailable(format!(
                "cannot classify empty {w}x{h} patch"
            )));
        }

        let gray = luminance(&patch.image);
        let residual = noise_residual(&gray, w, h);
        let gradient = sobel_magnitude(&gray, w, h);

        let mean_residual = residual.iter().sum::<f32>() / residual.len() as f32;
        let p_fake = (-mean_residual / NOISE_SCALE).exp().clamp(0.0, 1.0);

        let (cw, ch) = (w.div_ceil(CELL), h.div_ceil(CELL));
        let mut activation = Array3::<f32>::zeros((2, ch, cw));
        let mut counts = vec![0.0_f32; cw * ch];
        for y in 0..h {
            for x in 0..w {
                let (cy, cx) = (y / CELL, x / CELL);
                activation[[0, cy, cx]] += residual[y * w + x];
                activation[[1, cy, cx]] += gradient[y * w + x];
                counts[cy * cw + cx] += 1.0;
            }
        }
        for c in 0..2 {
            for cy in 0..ch {
                for cx in 0..cw {
                    activation[[c, cy, cx]] /= counts[cy * cw + cx];
                }
            }
        }

        tracing::debug!(mean_residual, p_fake, "heuristic inference");
        Ok(Inference {
            probabilities: [1.0 - p_fake, p_fake],
            activation: Some(activation),
        })
    }
}

/// Absolute difference between each value and the mean of its 3x3
/// neighbourhood (edges replicated).
fn noise_residual(gray: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0.0_f32; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0_f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    let yy = (y + dy).saturating_sub(1).min(height - 1);
                    let xx = (x + dx).saturating_sub(1).min(width - 1);
                    sum += gray[yy * width + xx];
                }
            }
            out[y * width + x] = (gray[y * width + x] - sum / 9.0).abs();
        }
    }
    out
}
