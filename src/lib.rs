//! Synthetic-image detection with an explanation of where the evidence is.
//!
//! For each image the pipeline estimates a per-pixel high-frequency energy
//! field (a one-level biorthogonal wavelet decomposition, or Sobel gradients
//! as a fallback), slides a window over it to find the most energetic region,
//! crops that region and hands it to a [`Classifier`]. When the verdict is
//! fake, an activation captured by the classifier (or, lacking one, blurred
//! Canny edges of the patch) becomes a heatmap that is mapped back onto the
//! full image, jet colorized and blended with the original.
//!
//! # Quick Start
//!
//! ```no_run
//! use roi_forensics::{Detector, DetectorConfig, DirectoryStore, HeuristicClassifier};
//!
//! let detector = Detector::new(
//!     DetectorConfig::default(),
//!     HeuristicClassifier::new(),
//!     DirectoryStore::new("heatmaps"),
//! )
//! .expect("valid configuration");
//! let img = image::open("photo.jpg").unwrap().to_rgb8();
//! let detection = detector.detect(&img).unwrap();
//! println!("{} ({:.0}%)", detection.label, detection.confidence * 100.0);
//! if let Some(id) = &detection.heatmap_id {
//!     println!("heatmap: {}", detector.store().path_of(id).display());
//! }
//! ```
//!
//! # Batches
//!
//! A batch is a list of encoded images, loaded from a zip archive, a
//! directory or explicit paths. Failing items are reported in place and do
//! not stop the rest.
//!
//! ```no_run
//! use roi_forensics::{batch, Detector, DetectorConfig, DirectoryStore, HeuristicClassifier};
//!
//! let detector = Detector::new(
//!     DetectorConfig::default(),
//!     HeuristicClassifier::new(),
//!     DirectoryStore::new("heatmaps"),
//! )
//! .unwrap();
//! let items = batch::load_directory("incoming".as_ref()).unwrap();
//! let report = detector.detect_batch(&items, Some("incoming")).unwrap();
//! println!("{} real, {} fake, {} failed", report.summary.real, report.summary.fake, report.summary.failed);
//! ```

#![deny(missing_docs)]

pub mod batch;
pub mod blending;
pub mod classifier;
pub mod energy;
mod engine;
pub mod error;
pub mod patch;
pub mod roi;
pub mod saliency;
pub mod store;

pub use batch::{BatchItem, BatchOutcome, BatchReport, BatchSummary};
pub use blending::BlendWeights;
pub use classifier::{ActivationTensor, Classifier, HeuristicClassifier, Inference, Label, Verdict};
pub use energy::{EnergyEstimator, EnergyField, EnergyMethod};
pub use engine::{Detection, Detector, DetectorConfig, Stage};
pub use error::{Error, ErrorKind, PipelineError, Result};
pub use patch::Patch;
pub use roi::{Roi, Size};
pub use saliency::{Saliency, SaliencySource};
pub use store::{DirectoryStore, HeatmapId, HeatmapStore};
