//! Timing statistics for the analysis tasks.
//!
//! Feature-gated and runtime-toggled to ensure zero overhead when disabled.
//!
//! # Usage
//!
//! ```ignore
//! use pore_analysis::metrics::{PipelineMetrics, TaskKind, COLLECT_METRICS};
//!
//! // Compile with --features metrics (default)
//! // Runtime toggle:
//! COLLECT_METRICS.store(false, Ordering::Relaxed);
//!
//! metrics.record(TaskKind::Analysis, elapsed_us);
//! ```

use std::collections::VecDeque;
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::sync::atomic::AtomicBool;

/// Runtime toggle for metrics collection.
pub static COLLECT_METRICS: AtomicBool = AtomicBool::new(true);

/// Check if metrics collection is enabled (both compile-time and runtime).
#[inline]
pub fn is_enabled() -> bool {
  #[cfg(feature = "metrics")]
  {
    COLLECT_METRICS.load(Ordering::Relaxed)
  }
  #[cfg(not(feature = "metrics"))]
  {
    false
  }
}

/// Rolling window for storing recent values (e.g., timing history).
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
  buffer: VecDeque<T>,
  capacity: usize,
}

impl<T> RollingWindow<T> {
  pub fn new(capacity: usize) -> Self {
    Self {
      buffer: VecDeque::with_capacity(capacity),
      capacity,
    }
  }

  /// Push a new value, evicting the oldest if at capacity.
  pub fn push(&mut self, value: T) {
    if self.buffer.len() >= self.capacity {
      self.buffer.pop_front();
    }
    self.buffer.push_back(value);
  }

  pub fn len(&self) -> usize {
    self.buffer.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffer.is_empty()
  }

  pub fn clear(&mut self) {
    self.buffer.clear();
  }

  /// Iterate over values (oldest to newest).
  pub fn iter(&self) -> impl Iterator<Item = &T> {
    self.buffer.iter()
  }

  pub fn last(&self) -> Option<&T> {
    self.buffer.back()
  }
}

impl RollingWindow<u64> {
  pub fn sum(&self) -> u64 {
    self.buffer.iter().sum()
  }

  pub fn average(&self) -> f64 {
    if self.buffer.is_empty() {
      0.0
    } else {
      self.sum() as f64 / self.buffer.len() as f64
    }
  }

  pub fn min_max(&self) -> Option<(u64, u64)> {
    let min = *self.buffer.iter().min()?;
    let max = *self.buffer.iter().max()?;
    Some((min, max))
  }
}

impl Default for RollingWindow<u64> {
  fn default() -> Self {
    Self::new(64)
  }
}

/// Kinds of work the pipeline submits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
  BlobLabel,
  BlobReconcile,
  Analysis,
  Checkpoint,
  Visualization,
  /// Synchronous device-to-host copy on the simulation thread.
  Staging,
}

impl TaskKind {
  pub const ALL: [TaskKind; 6] = [
    TaskKind::BlobLabel,
    TaskKind::BlobReconcile,
    TaskKind::Analysis,
    TaskKind::Checkpoint,
    TaskKind::Visualization,
    TaskKind::Staging,
  ];

  fn index(self) -> usize {
    self as usize
  }

  pub fn name(self) -> &'static str {
    match self {
      TaskKind::BlobLabel => "identify blobs",
      TaskKind::BlobReconcile => "identify blob maps",
      TaskKind::Analysis => "compute averages",
      TaskKind::Checkpoint => "save checkpoint",
      TaskKind::Visualization => "save vis",
      TaskKind::Staging => "copy data to host",
    }
  }
}

/// Per task-kind timings of the analysis pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
  /// Rolling window of durations in microseconds, indexed by `TaskKind`.
  timings: [RollingWindow<u64>; 6],
  /// Completed runs per kind (cumulative, survives `reset`).
  counts: [u64; 6],
  /// Back-pressure drains forced by a deep queue.
  pub backpressure_drains: u64,
}

impl PipelineMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record one completed task.
  pub fn record(&mut self, kind: TaskKind, timing_us: u64) {
    if !is_enabled() {
      return;
    }
    self.timings[kind.index()].push(timing_us);
    self.counts[kind.index()] += 1;
  }

  pub fn record_backpressure(&mut self) {
    if is_enabled() {
      self.backpressure_drains += 1;
    }
  }

  pub fn count(&self, kind: TaskKind) -> u64 {
    self.counts[kind.index()]
  }

  pub fn timings(&self, kind: TaskKind) -> &RollingWindow<u64> {
    &self.timings[kind.index()]
  }

  pub fn avg_timing_us(&self, kind: TaskKind) -> f64 {
    self.timings[kind.index()].average()
  }

  /// Clear timing windows. Counts are cumulative and kept.
  pub fn reset(&mut self) {
    for window in &mut self.timings {
      window.clear();
    }
  }
}
