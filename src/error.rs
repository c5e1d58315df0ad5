//! Error types for the roi-forensics crate.

use std::fmt;

use crate::engine::Stage;

/// Errors that can occur while analysing an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input cannot be analysed: bad bytes, unsupported format, bad
    /// configuration, or a search window larger than the image.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A region does not fit inside the image even after clipping.
    #[error("region {x},{y} {width}x{height} exceeds {image_width}x{image_height} image")]
    OutOfBounds {
        /// Region left edge.
        x: u32,
        /// Region top edge.
        y: u32,
        /// Region width.
        width: u32,
        /// Region height.
        height: u32,
        /// Image width in pixels.
        image_width: u32,
        /// Image height in pixels.
        image_height: u32,
    },

    /// The classifier could not produce class probabilities.
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),

    /// The heatmap artifact could not be written.
    #[error("failed to persist heatmap: {0}")]
    PersistenceFailure(String),

    /// A batch holds more items than the configured maximum.
    #[error("batch of {count} items exceeds the limit of {max}")]
    BatchTooLarge {
        /// Number of submitted items.
        count: usize,
        /// Configured maximum batch size.
        max: usize,
    },

    /// An I/O error occurred while reading inputs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An image could not be decoded.
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// An image archive could not be read.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Coarse classification of an [`Error`], stable across wrapped sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::InvalidInput`].
    InvalidInput,
    /// See [`Error::OutOfBounds`].
    OutOfBounds,
    /// See [`Error::InferenceUnavailable`].
    InferenceUnavailable,
    /// See [`Error::PersistenceFailure`].
    PersistenceFailure,
    /// See [`Error::BatchTooLarge`].
    BatchTooLarge,
}

impl Error {
    /// The kind of this error. Read-side I/O, decode and archive errors are
    /// all invalid input.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::Io(_) | Error::Image(_) | Error::Archive(_) => {
                ErrorKind::InvalidInput
            }
            Error::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Error::InferenceUnavailable(_) => ErrorKind::InferenceUnavailable,
            Error::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
            Error::BatchTooLarge { .. } => ErrorKind::BatchTooLarge,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::OutOfBounds => "out of bounds",
            ErrorKind::InferenceUnavailable => "inference unavailable",
            ErrorKind::PersistenceFailure => "persistence failure",
            ErrorKind::BatchTooLarge => "batch too large",
        };
        f.write_str(name)
    }
}

/// An error that escaped the pipeline, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    /// The stage the pipeline was trying to reach.
    pub stage: Stage,
    /// Position of the image in its batch, if any.
    pub index: Option<usize>,
    /// The underlying error.
    #[source]
    pub source: Error,
}

impl PipelineError {
    /// Tag `source` with the stage it interrupted.
    #[must_use]
    pub fn new(stage: Stage, source: Error) -> Self {
        Self {
            stage,
            index: None,
            source,
        }
    }

    /// Attach the batch position of the failing image.
    #[must_use]
    pub fn at_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Shorthand for `self.source.kind()`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let io_err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io_err.to_string().contains("gone"));

        let too_large = Error::BatchTooLarge { count: 51, max: 50 };
        let msg = too_large.to_string();
        assert!(msg.contains("51"));
        assert!(msg.contains("50"));

        let oob = Error::OutOfBounds {
            x: 10,
            y: 20,
            width: 256,
            height: 256,
            image_width: 100,
            image_height: 100,
        };
        let msg = oob.to_string();
        assert!(msg.contains("10,20"));
        assert!(msg.contains("256x256"));
        assert!(msg.contains("100x100"));
    }

    #[test]
    fn read_side_errors_are_invalid_input() {
        let io_err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(io_err.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            Error::PersistenceFailure("disk full".into()).kind(),
            ErrorKind::PersistenceFailure
        );
    }

    #[test]
    fn pipeline_error_carries_stage_and_index() {
        let err = PipelineError::new(Stage::Received, Error::InvalidInput("bad bytes".into()))
            .at_index(2);
        assert_eq!(err.stage, Stage::Received);
        assert_eq!(err.index, Some(2));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("bad bytes"));
    }
}
