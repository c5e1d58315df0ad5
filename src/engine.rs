//! Single-image detection pipeline.

use std::fmt;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::{Serialize, Serializer};

use crate::blending::{self, BlendWeights};
use crate::classifier::{Classifier, Label};
use crate::energy::{EnergyEstimator, EnergyField, EnergyMethod};
use crate::error::{Error, PipelineError, Result};
use crate::patch::{self, Patch};
use crate::roi::{self, Roi, Size};
use crate::saliency::{self, SaliencySource};
use crate::store::{HeatmapId, HeatmapStore};

/// Pipeline states an image passes through.
///
/// A real verdict goes straight from [`Stage::Classified`] to
/// [`Stage::Done`]; only fake verdicts enter
/// [`Stage::HeatmapSynthesized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Payload accepted and decoded.
    Received,
    /// Energy field computed.
    EnergyEstimated,
    /// Region of interest chosen.
    RoiLocated,
    /// Patch cropped from the original.
    PatchExtracted,
    /// Classifier verdict available.
    Classified,
    /// Heatmap built and composited.
    HeatmapSynthesized,
    /// Result complete.
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::EnergyEstimated => "energy_estimated",
            Stage::RoiLocated => "roi_located",
            Stage::PatchExtracted => "patch_extracted",
            Stage::Classified => "classified",
            Stage::HeatmapSynthesized => "heatmap_synthesized",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Options controlling detection.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Side of the square patch handed to the classifier.
    pub patch_size: u32,
    /// Preferred energy estimator.
    pub energy_method: EnergyMethod,
    /// Overlay blend weights.
    pub blend: BlendWeights,
    /// Largest accepted batch.
    pub max_batch_size: usize,
    /// Largest accepted image side.
    pub max_image_dimension: u32,
    /// Largest accepted encoded image.
    pub max_payload_bytes: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            patch_size: 256,
            energy_method: EnergyMethod::Wavelet,
            blend: BlendWeights::default(),
            max_batch_size: 50,
            max_image_dimension: 4096,
            max_payload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl DetectorConfig {
    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a zero patch size, batch size or
    /// dimension limit, and for invalid blend weights.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(Error::InvalidInput("patch size must be positive".into()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidInput("max batch size must be positive".into()));
        }
        if self.max_image_dimension == 0 {
            return Err(Error::InvalidInput(
                "max image dimension must be positive".into(),
            ));
        }
        self.blend.validate()
    }
}

/// Outcome of analysing one image.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Classifier verdict.
    pub label: Label,
    /// Probability of `label`.
    pub confidence: f32,
    /// Probability of [`Label::Real`].
    pub p_real: f32,
    /// Probability of [`Label::Fake`].
    pub p_fake: f32,
    /// Region that was classified, in source pixels.
    pub roi: Roi,
    /// Estimator that produced the energy field.
    pub energy_method: EnergyMethod,
    /// Branch that produced the heatmap, if one was made.
    pub saliency: Option<SaliencySource>,
    /// Stored overlay, if one was made and persisted.
    pub heatmap_id: Option<HeatmapId>,
    /// Why a synthesized overlay could not be persisted.
    pub heatmap_error: Option<String>,
    /// Wall time spent on this image.
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    /// Stages passed, in order.
    pub trace: Vec<Stage>,
}

fn as_millis<S: Serializer>(latency: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(latency.as_secs_f64() * 1000.0)
}

/// Request-local state threaded through one pipeline run.
struct Invocation<'a> {
    image: &'a RgbImage,
    started: Instant,
    trace: Vec<Stage>,
    index: Option<usize>,
}

impl<'a> Invocation<'a> {
    fn new(image: &'a RgbImage, started: Instant, index: Option<usize>) -> Self {
        Self {
            image,
            started,
            trace: vec![Stage::Received],
            index,
        }
    }

    fn reach(&mut self, stage: Stage) {
        tracing::debug!(%stage, index = ?self.index, "stage reached");
        self.trace.push(stage);
    }

    fn fail(&self, stage: Stage) -> impl FnOnce(Error) -> PipelineError {
        let index = self.index;
        move |source| {
            let err = PipelineError::new(stage, source);
            match index {
                Some(i) => err.at_index(i),
                None => err,
            }
        }
    }
}

/// The detection engine.
///
/// Create once and reuse for many images; it holds no per-request state, so
/// concurrent calls never see each other's patches or activations.
pub struct Detector<C, S> {
    pub(crate) config: DetectorConfig,
    pub(crate) classifier: C,
    pub(crate) store: S,
}

impl<C: Classifier, S: HeatmapStore> Detector<C, S> {
    /// Create a detector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `config` does not validate.
    pub fn new(config: DetectorConfig, classifier: C, store: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier,
            store,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// The overlay store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decode an encoded image, enforcing the payload and dimension limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for oversized payloads, empty or
    /// oversized images, and [`Error::Image`] for undecodable bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage> {
        if bytes.len() > self.config.max_payload_bytes {
            return Err(Error::InvalidInput(format!(
                "payload of {} bytes exceeds {} byte limit",
                bytes.len(),
                self.config.max_payload_bytes
            )));
        }
        let img = image::load_from_memory(bytes)?;
        let (w, h) = (img.width(), img.height());
        let max = self.config.max_image_dimension;
        if w == 0 || h == 0 || w > max || h > max {
            return Err(Error::InvalidInput(format!(
                "image of {w}x{h} outside accepted range 1..={max}"
            )));
        }
        Ok(img.to_rgb8())
    }

    /// Pick the region the classifier should look at.
    ///
    /// Returns the energy field the search ran on and the ROI in source
    /// coordinates, clamped to the image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty image, or one so
    /// elongated that upscaling its short side to the patch would exceed
    /// `max_image_dimension`.
    pub fn locate_roi(&self, image: &RgbImage) -> Result<(EnergyField, Roi)> {
        let field = self.estimator().estimate(image)?;
        let roi = self.roi_in(&field, image)?;
        Ok((field, roi))
    }

    /// Search images never grow past the accepted image size, or past one
    /// pixel over the patch when the patch is larger than that.
    fn estimator(&self) -> EnergyEstimator {
        let patch = self.config.patch_size;
        EnergyEstimator::new(self.config.energy_method, patch).with_max_side(
            self.config
                .max_image_dimension
                .max(patch.saturating_add(1)),
        )
    }

    fn roi_in(&self, field: &EnergyField, image: &RgbImage) -> Result<Roi> {
        let patch = self.config.patch_size;
        let (fx, fy) = roi::locate(field, field.window_for(patch))?;
        let (x, y) = field.to_source(fx, fy);
        let size = Size::of(image);
        Ok(Roi {
            x,
            y,
            width: patch,
            height: patch,
            source_image_size: size,
        }
        .clamp_to(size))
    }

    /// Decode and analyse one encoded image.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] tagged with the stage that failed.
    pub fn detect_bytes(&self, bytes: &[u8]) -> std::result::Result<Detection, PipelineError> {
        let started = Instant::now();
        let image = self
            .decode(bytes)
            .map_err(|e| PipelineError::new(Stage::Received, e))?;
        self.run(&image, started, None, HeatmapId::generate)
    }

    /// Analyse one decoded image.
    ///
    /// Fake verdicts get a heatmap overlay persisted to the store; a store
    /// failure is reported in [`Detection::heatmap_error`] and does not fail
    /// the detection.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] tagged with the stage that failed.
    pub fn detect(&self, image: &RgbImage) -> std::result::Result<Detection, PipelineError> {
        self.run(image, Instant::now(), None, HeatmapId::generate)
    }

    pub(crate) fn run(
        &self,
        image: &RgbImage,
        started: Instant,
        index: Option<usize>,
        heatmap_id: impl FnOnce() -> HeatmapId,
    ) -> std::result::Result<Detection, PipelineError> {
        let mut inv = Invocation::new(image, started, index);

        let field = self
            .estimator()
            .estimate(inv.image)
            .map_err(inv.fail(Stage::EnergyEstimated))?;
        inv.reach(Stage::EnergyEstimated);

        let roi = self
            .roi_in(&field, inv.image)
            .map_err(inv.fail(Stage::RoiLocated))?;
        inv.reach(Stage::RoiLocated);

        let patch = patch::extract(inv.image, roi).map_err(inv.fail(Stage::PatchExtracted))?;
        inv.reach(Stage::PatchExtracted);

        let inference = self
            .classifier
            .infer(&patch)
            .map_err(inv.fail(Stage::Classified))?;
        let verdict = inference.verdict().map_err(inv.fail(Stage::Classified))?;
        inv.reach(Stage::Classified);

        let mut detection = Detection {
            label: verdict.label,
            confidence: verdict.confidence,
            p_real: verdict.p_real,
            p_fake: verdict.p_fake,
            roi: patch.roi,
            energy_method: field.method(),
            saliency: None,
            heatmap_id: None,
            heatmap_error: None,
            latency: Duration::ZERO,
            trace: Vec::new(),
        };

        if verdict.label == Label::Fake {
            let (source, persisted) =
                self.explain(inv.image, &patch, inference.activation.as_ref(), heatmap_id());
            inv.reach(Stage::HeatmapSynthesized);
            detection.saliency = Some(source);
            match persisted {
                Ok(id) => detection.heatmap_id = Some(id),
                Err(e) => {
                    tracing::warn!(error = %e, index = ?inv.index, "heatmap not persisted");
                    detection.heatmap_error = Some(e.to_string());
                }
            }
        }

        inv.reach(Stage::Done);
        detection.latency = inv.started.elapsed();
        detection.trace = inv.trace;

        tracing::info!(
            label = %detection.label,
            confidence = detection.confidence,
            roi_x = detection.roi.x,
            roi_y = detection.roi.y,
            heatmap = ?detection.heatmap_id.as_ref().map(HeatmapId::as_str),
            latency_ms = detection.latency.as_secs_f64() * 1000.0,
            "image analysed"
        );
        Ok(detection)
    }

    /// Build, composite and store the heatmap for a fake verdict.
    fn explain(
        &self,
        image: &RgbImage,
        patch: &Patch,
        activation: Option<&crate::classifier::ActivationTensor>,
        id: HeatmapId,
    ) -> (SaliencySource, Result<HeatmapId>) {
        let saliency = saliency::synthesize(activation, patch);
        let overlay = blending::compose(&saliency.heatmap, &patch.roi, image, self.config.blend);
        let stored = self.store.put(&id, &overlay).map(|()| id);
        (saliency.source, stored)
    }
}
