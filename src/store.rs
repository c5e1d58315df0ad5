//! Durable storage for overlay images.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::Serialize;

use crate::error::{Error, Result};

/// JPEG quality for stored overlays.
const JPEG_QUALITY: u8 = 95;

/// Identifier of a stored heatmap, usable as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct HeatmapId(String);

impl HeatmapId {
    /// Identifier for a single-image request: `heatmap_<uuid>.jpg`.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("heatmap_{}.jpg", uuid::Uuid::new_v4().simple()))
    }

    /// Identifier for an item of a batch:
    /// `batch_<batch prefix>_<index>_<uuid prefix>.jpg`.
    #[must_use]
    pub fn for_batch_item(batch_id: &str, index: usize) -> Self {
        let batch: String = batch_id.chars().filter(char::is_ascii_hexdigit).take(8).collect();
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("batch_{batch}_{index:03}_{}.jpg", &token[..8]))
    }

    /// Wrap an existing identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty identifiers or identifiers
    /// that could escape the store directory.
    pub fn parse(id: &str) -> Result<Self> {
        let safe = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.contains("..");
        if safe {
            Ok(Self(id.to_string()))
        } else {
            Err(Error::InvalidInput(format!("invalid heatmap id {id:?}")))
        }
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HeatmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where overlay images go.
pub trait HeatmapStore: Send + Sync {
    /// Persist `overlay` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PersistenceFailure`] if the overlay cannot be written.
    fn put(&self, id: &HeatmapId, overlay: &RgbImage) -> Result<()>;
}

/// Stores overlays as JPEG files in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Store rooted at `root`; the directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory overlays are written to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the overlay stored under `id`.
    #[must_use]
    pub fn path_of(&self, id: &HeatmapId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Location of a stored overlay, for serving it back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unsafe identifiers or ones with
    /// no stored file.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        let path = self.path_of(&HeatmapId::parse(id)?);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::InvalidInput(format!("no heatmap stored as {id}")))
        }
    }
}

impl HeatmapStore for DirectoryStore {
    fn put(&self, id: &HeatmapId, overlay: &RgbImage) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            Error::PersistenceFailure(format!("cannot create {}: {e}", self.root.display()))
        })?;
        let path = self.path_of(id);
        save_image(overlay, &path)
            .map_err(|e| Error::PersistenceFailure(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "stored heatmap");
        Ok(())
    }
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// Save an RGB image with format-specific quality settings.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::InvalidInput(e.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            let file = BufWriter::new(File::create(path)?);
            let mut encoder = JpegEncoder::new_with_quality(file, JPEG_QUALITY);
            encoder.encode_image(img)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            DynamicImage::ImageRgb8(img.clone()).save_with_format(path, format)?;
        }
        _ => {
            return Err(Error::InvalidInput(format!(
                "unsupported output format {format:?}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("roi-forensics-store-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn generated_ids_are_unique_jpeg_names() {
        let a = HeatmapId::generate();
        let b = HeatmapId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("heatmap_"));
        assert!(a.as_str().ends_with(".jpg"));
    }

    #[test]
    fn batch_ids_carry_batch_and_index() {
        let id = HeatmapId::for_batch_item("3f2a9c10-aaaa-bbbb-cccc-0123456789ab", 7);
        assert!(id.as_str().starts_with("batch_3f2a9c10_007_"), "{id}");
        assert!(id.as_str().ends_with(".jpg"));
    }

    #[test]
    fn parse_rejects_path_traversal() {
        assert!(HeatmapId::parse("heatmap_1.jpg").is_ok());
        assert!(HeatmapId::parse("../etc/passwd").is_err());
        assert!(HeatmapId::parse("a/b.jpg").is_err());
        assert!(HeatmapId::parse("").is_err());
    }

    #[test]
    fn directory_store_writes_and_resolves() {
        let dir = scratch_dir();
        let store = DirectoryStore::new(&dir);
        let id = HeatmapId::generate();
        store
            .put(&id, &RgbImage::from_pixel(40, 30, image::Rgb([10, 200, 30])))
            .unwrap();

        let path = store.resolve(id.as_str()).unwrap();
        let loaded = image::open(&path).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (40, 30));
        assert!(store.resolve("heatmap_missing.jpg").is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unwritable_root_is_persistence_failure() {
        let file = scratch_dir();
        std::fs::write(&file, b"not a directory").unwrap();
        let store = DirectoryStore::new(&file);
        let err = store
            .put(&HeatmapId::generate(), &RgbImage::new(4, 4))
            .unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure(_)));
        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn is_supported_image_accepts_common_formats() {
        assert!(is_supported_image(Path::new("photo.jpg")));
        assert!(is_supported_image(Path::new("photo.JPEG")));
        assert!(is_supported_image(Path::new("photo.png")));
        assert!(is_supported_image(Path::new("photo.webp")));
        assert!(is_supported_image(Path::new("photo.bmp")));
    }

    #[test]
    fn is_supported_image_rejects_unsupported_formats() {
        assert!(!is_supported_image(Path::new("photo.gif")));
        assert!(!is_supported_image(Path::new("photo.txt")));
        assert!(!is_supported_image(Path::new("photo")));
    }
}
