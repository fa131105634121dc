//! Blob label volumes and the handles that carry them between tasks.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::array::IntArray;
use crate::error::{AnalysisError, Result};

/// Global blob identifier. Negative values mark non-blob voxels.
pub type BlobId = i32;

/// Label volume of one rank.
///
/// Blob voxels hold `0..count`; every other voxel, halo included, holds `-1`.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobIds {
  pub count: usize,
  pub labels: IntArray,
}

impl BlobIds {
  pub fn dims(&self) -> [usize; 3] {
    self.labels.dims()
  }
}

/// Per-component record, one per raw label in raw-label order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobDescriptor {
  /// Time-consistent global ID (the raw label before reconciliation).
  pub id: BlobId,
  /// Voxel count over all ranks.
  pub volume: u64,
  /// Exposed voxel faces over all ranks.
  pub surface: u64,
}

pub type BlobIdList = Vec<BlobDescriptor>;

/// Write-once value shared between a producing task and its consumers.
///
/// A fresh slot is allocated for every new state. Once published the value
/// is immutable for every holder.
pub struct SharedSlot<T>(Arc<OnceLock<T>>);

impl<T> SharedSlot<T> {
  pub fn new() -> Self {
    Self(Arc::new(OnceLock::new()))
  }

  /// Publish the value. Fails if the slot was already published.
  pub fn publish(&self, value: T) -> Result<()> {
    self
      .0
      .set(value)
      .map_err(|_| AnalysisError::Protocol("shared slot published twice".into()))
  }

  pub fn get(&self) -> Option<&T> {
    self.0.get()
  }

  /// The published value, or `MissingInput(name)` if its producer failed.
  pub fn require(&self, name: &'static str) -> Result<&T> {
    self.get().ok_or(AnalysisError::MissingInput(name))
  }

  pub fn is_published(&self) -> bool {
    self.0.get().is_some()
  }
}

impl<T> Clone for SharedSlot<T> {
  fn clone(&self) -> Self {
    Self(Arc::clone(&self.0))
  }
}

impl<T> Default for SharedSlot<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SharedSlot<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SharedSlot").field(&self.0.get()).finish()
  }
}

pub type BlobIdSlot = SharedSlot<BlobIds>;
pub type BlobListSlot = SharedSlot<BlobIdList>;

/// Largest blob ID handed out so far. Never decreases between resets.
#[derive(Clone, Debug)]
pub struct IdCounter(Arc<AtomicI32>);

impl IdCounter {
  /// Counter with no IDs issued (`-1`).
  pub fn new() -> Self {
    Self(Arc::new(AtomicI32::new(-1)))
  }

  pub fn get(&self) -> BlobId {
    self.0.load(Ordering::SeqCst)
  }

  pub fn reset(&self) {
    self.0.store(-1, Ordering::SeqCst);
  }

  /// Issue the next ID.
  pub fn next_id(&self) -> BlobId {
    self.0.fetch_add(1, Ordering::SeqCst) + 1
  }
}

impl Default for IdCounter {
  fn default() -> Self {
    Self::new()
  }
}
