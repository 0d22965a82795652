use std::path::PathBuf;

/// Convenient `Result` alias for the data pipeline.
pub type CohortResult<T> = Result<T, CohortError>;

/// Errors raised while resolving manifests, partitioning or loading samples.
///
/// All of them are fatal for a run: callers propagate them to `main`, which
/// prints the message and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    /// A manifest pattern matched zero or several split files.
    #[error("Manifest pattern {pattern} matched {} files (expected exactly one): {matches:?}", matches.len())]
    ManifestNotFound {
        /// The `<dir>/<prefix>*.txt` pattern that was searched.
        pattern: String,
        /// Every file that matched.
        matches: Vec<PathBuf>,
    },

    /// A manifest is too short to reserve the fixed-size test slice.
    #[error("Manifest {manifest} has {found} samples, need at least {needed}")]
    InsufficientSamples {
        /// Manifest that could not satisfy the reservation.
        manifest: String,
        /// Number of samples the reservation requires.
        needed: usize,
        /// Number of samples available after balancing.
        found: usize,
    },

    /// Sample index past the end of a partition.
    #[error("Index {index} is out of bounds for dataset of length {len}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// Samples of one batch disagree on their tensor layout.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape of the first sample in the batch.
        expected: Vec<usize>,
        /// Offending shape.
        actual: Vec<usize>,
    },

    /// A dataset that must hold samples is empty.
    #[error("Dataset {0} is empty")]
    EmptyDataset(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Image decoding failed.
    #[error("Failed to decode image {path}: {source}")]
    Image {
        /// Path of the unreadable image.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: image::ImageError,
    },

    /// A loader worker thread went away before delivering its batch.
    #[error("Loader worker disconnected before delivering batch {0}")]
    WorkerDisconnected(usize),

    /// IO error while reading manifests.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
