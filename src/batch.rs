//! Batch detection: item loading, failure-isolated fan-out and aggregate
//! counts.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

use crate::classifier::{Classifier, Label};
use crate::engine::{Detection, Detector, Stage};
use crate::error::{Error, ErrorKind, PipelineError, Result};
use crate::store::{is_supported_image, HeatmapId, HeatmapStore};

/// One encoded image of a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Display name, usually the file name.
    pub name: String,
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
}

impl BatchItem {
    /// Item from in-memory bytes.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Read an item from disk, named after the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path.file_name().map_or_else(
            || path.display().to_string(),
            |f| f.to_string_lossy().to_string(),
        );
        Ok(Self::new(name, std::fs::read(path)?))
    }
}

/// Items of a zip archive with a supported image extension, in archive order.
///
/// # Errors
///
/// Returns [`Error::Archive`] for an unreadable archive and
/// [`Error::InvalidInput`] if it holds no images.
pub fn load_archive(bytes: &[u8]) -> Result<Vec<BatchItem>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut items = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let file_name = Path::new(&name)
            .file_name()
            .map(|f| f.to_string_lossy().to_string());
        let Some(file_name) = file_name else { continue };
        if file_name.starts_with('.') || !is_supported_image(Path::new(&file_name)) {
            tracing::debug!(entry = %name, "skipping archive entry");
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        items.push(BatchItem::new(file_name, buf));
    }
    if items.is_empty() {
        return Err(Error::InvalidInput("archive contains no images".into()));
    }
    Ok(items)
}

/// Supported images directly inside `dir`, sorted by file name.
///
/// # Errors
///
/// Returns [`Error::Io`] if the directory or one of its images cannot be
/// read.
pub fn load_directory(dir: &Path) -> Result<Vec<BatchItem>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_supported_image(p))
        .collect();
    paths.sort();
    load_files(&paths)
}

/// Read each path as an item, keeping the given order.
///
/// # Errors
///
/// Returns [`Error::Io`] for the first unreadable file.
pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<BatchItem>> {
    paths
        .iter()
        .map(|p| BatchItem::from_path(p.as_ref()))
        .collect()
}

/// Result for one batch item.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// The item reached `Done`.
    Success {
        /// Position in the batch.
        index: usize,
        /// Item name.
        name: String,
        /// The detection.
        detection: Detection,
    },
    /// The item failed; siblings are unaffected.
    Failure {
        /// Position in the batch.
        index: usize,
        /// Item name.
        name: String,
        /// Stage the item was trying to reach.
        stage: Stage,
        /// Error kind.
        kind: ErrorKind,
        /// Error description.
        error: String,
    },
}

impl BatchOutcome {
    /// Position in the batch.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            BatchOutcome::Success { index, .. } | BatchOutcome::Failure { index, .. } => *index,
        }
    }

    /// Item name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            BatchOutcome::Success { name, .. } | BatchOutcome::Failure { name, .. } => name,
        }
    }

    /// The detection, if the item succeeded.
    #[must_use]
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            BatchOutcome::Success { detection, .. } => Some(detection),
            BatchOutcome::Failure { .. } => None,
        }
    }

    fn from_result(index: usize, name: &str, result: std::result::Result<Detection, PipelineError>) -> Self {
        match result {
            Ok(detection) => BatchOutcome::Success {
                index,
                name: name.to_string(),
                detection,
            },
            Err(e) => {
                tracing::warn!(index, name, stage = %e.stage, error = %e.source, "batch item failed");
                BatchOutcome::Failure {
                    index,
                    name: name.to_string(),
                    stage: e.stage,
                    kind: e.kind(),
                    error: e.source.to_string(),
                }
            }
        }
    }
}

/// Aggregate counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Items submitted.
    pub total: usize,
    /// Items that reached `Done`.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// Successful items labelled real.
    pub real: usize,
    /// Successful items labelled fake.
    pub fake: usize,
}

impl BatchSummary {
    /// Count `outcomes`.
    #[must_use]
    pub fn tally(outcomes: &[BatchOutcome]) -> Self {
        outcomes.iter().fold(
            Self {
                total: outcomes.len(),
                ..Self::default()
            },
            |mut s, outcome| {
                match outcome.detection() {
                    Some(d) => {
                        s.succeeded += 1;
                        match d.label {
                            Label::Real => s.real += 1,
                            Label::Fake => s.fake += 1,
                        }
                    }
                    None => s.failed += 1,
                }
                s
            },
        )
    }
}

/// Aggregate record of a batch run.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    /// Unique batch identifier.
    pub id: String,
    /// Batch name.
    pub name: String,
    /// Per-item outcomes, in input order.
    pub items: Vec<BatchOutcome>,
    /// Aggregate counts.
    pub summary: BatchSummary,
}

impl<C: Classifier, S: HeatmapStore> Detector<C, S> {
    /// Analyse every item of a batch.
    ///
    /// Items are independent: a failing item becomes a
    /// [`BatchOutcome::Failure`] and the others carry on. Output order always
    /// matches input order, also when items run in parallel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchTooLarge`] before touching any item if there are
    /// more than `max_batch_size` items, and [`Error::InvalidInput`] for an
    /// empty batch.
    pub fn detect_batch(&self, items: &[BatchItem], name: Option<&str>) -> Result<BatchReport> {
        let max = self.config.max_batch_size;
        if items.len() > max {
            return Err(Error::BatchTooLarge {
                count: items.len(),
                max,
            });
        }
        if items.is_empty() {
            return Err(Error::InvalidInput("batch contains no images".into()));
        }

        let id = uuid::Uuid::new_v4();
        let id_text = id.to_string();
        let name = name.map_or_else(
            || format!("batch_{}", &id.simple().to_string()[..8]),
            str::to_string,
        );
        tracing::info!(batch = %name, items = items.len(), "batch started");

        #[cfg(feature = "parallel")]
        let outcomes: Vec<BatchOutcome> = {
            use rayon::prelude::*;
            items
                .par_iter()
                .enumerate()
                .map(|(index, item)| self.detect_item(&id_text, index, item))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<BatchOutcome> = items
            .iter()
            .enumerate()
            .map(|(index, item)| self.detect_item(&id_text, index, item))
            .collect();

        let summary = BatchSummary::tally(&outcomes);
        tracing::info!(
            batch = %name,
            succeeded = summary.succeeded,
            failed = summary.failed,
            real = summary.real,
            fake = summary.fake,
            "batch finished"
        );
        Ok(BatchReport {
            id: id_text,
            name,
            items: outcomes,
            summary,
        })
    }

    fn detect_item(&self, batch_id: &str, index: usize, item: &BatchItem) -> BatchOutcome {
        let started = Instant::now();
        let result = self
            .decode(&item.bytes)
            .map_err(|e| PipelineError::new(Stage::Received, e).at_index(index))
            .and_then(|image| {
                self.run(&image, started, Some(index), || {
                    HeatmapId::for_batch_item(batch_id, index)
                })
            });
        BatchOutcome::from_result(index, &item.name, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([90, 90, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn archive_keeps_images_in_order() {
        let image = png(8, 8);
        let archive = zip_of(&[
            ("b.png", image.as_slice()),
            ("notes.txt", &b"hello"[..]),
            ("nested/", &b""[..]),
            ("nested/a.jpg", &b"not really a jpeg"[..]),
            ("__MACOSX/._b.png", &b"resource fork"[..]),
        ]);
        let items = load_archive(&archive).unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["b.png", "a.jpg"]);
        assert_eq!(items[0].bytes, image);
    }

    #[test]
    fn archive_without_images_is_invalid() {
        let archive = zip_of(&[("readme.md", &b"# nothing"[..])]);
        let err = load_archive(&archive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn garbage_archive_is_invalid_input() {
        let err = load_archive(b"PK but not really").unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn directory_items_are_sorted() {
        let dir = std::env::temp_dir().join(format!("roi-forensics-batch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        for name in ["c.png", "a.png", "b.jpeg"] {
            std::fs::write(dir.join(name), png(4, 4)).unwrap();
        }
        std::fs::write(dir.join("skip.txt"), b"x").unwrap();

        let items = load_directory(&dir).unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.jpeg", "c.png"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_files(&["/definitely/not/here.png"]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn summary_counts_labels_and_failures() {
        let outcomes = vec![
            BatchOutcome::Failure {
                index: 0,
                name: "x".into(),
                stage: Stage::Received,
                kind: ErrorKind::InvalidInput,
                error: "bad".into(),
            },
            BatchOutcome::Failure {
                index: 1,
                name: "y".into(),
                stage: Stage::Classified,
                kind: ErrorKind::InferenceUnavailable,
                error: "down".into(),
            },
        ];
        let summary = BatchSummary::tally(&outcomes);
        assert_eq!(
            summary,
            BatchSummary {
                total: 2,
                succeeded: 0,
                failed: 2,
                real: 0,
                fake: 0
            }
        );
        assert_eq!(outcomes[1].index(), 1);
        assert_eq!(outcomes[1].name(), "y");
    }

    #[test]
    fn failure_serializes_with_status_tag() {
        let outcome = BatchOutcome::Failure {
            index: 2,
            name: "broken.png".into(),
            stage: Stage::Received,
            kind: ErrorKind::InvalidInput,
            error: "invalid input: truncated".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["stage"], "received");
        assert_eq!(json["kind"], "invalid_input");
    }
}
