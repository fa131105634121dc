//! Error type shared by every stage of the analysis pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
  /// Rank 0 scanned the whole communicator pool without finding a free slot.
  /// Raised identically on every rank.
  #[error("unable to get comm: all {capacity} pooled communicators are in use")]
  CommPoolExhausted { capacity: usize },

  /// Consecutive blob labelings were computed on different grids.
  #[error("blob label grid changed from {previous:?} to {current:?}")]
  DimensionMismatch {
    previous: [usize; 3],
    current: [usize; 3],
  },

  /// Bits outside the known analysis flags.
  #[error("invalid analysis type bits {0:#010b}")]
  InvalidAnalysisType(u32),

  /// Host buffer does not match the size of the device field it mirrors.
  #[error("buffer for {field} has length {actual}, expected {expected}")]
  BufferLength {
    field: &'static str,
    expected: usize,
    actual: usize,
  },

  /// The visualization dataset no longer has the fixed variable layout.
  #[error("mesh variable {index} is {found:?}, expected {expected:?}")]
  MeshLayout {
    index: usize,
    expected: &'static str,
    found: String,
  },

  /// A task ran before the handle it reads was published.
  #[error("input {0} was never published by its producing task")]
  MissingInput(&'static str),

  /// A peer rank sent a payload that does not decode.
  #[error("malformed collective payload: {0}")]
  Protocol(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("analysis task {0} panicked")]
  TaskPanicked(&'static str),

  /// A background task failed on another rank. Every rank stops at the same
  /// step.
  #[error("an analysis task failed on another rank")]
  PeerFailed,

  #[error("failed to build analysis thread pool: {0}")]
  ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl AnalysisError {
  /// Wrap an I/O error with the path that produced it.
  pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}
