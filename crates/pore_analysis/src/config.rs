//! AnalysisConfig - trigger intervals, output location and threading for the
//! analysis pipeline.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{AnalysisError, Result};

/// How background analysis threads are created and placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadAffinity {
  /// No background threads; every task runs inline on the caller.
  #[default]
  None,
  /// `analysis_threads` workers, placement left to the OS.
  Default,
  /// Main thread on the first core, one worker on each remaining core.
  Independent,
}

impl ThreadAffinity {
  pub fn parse(method: &str) -> Result<Self> {
    match method {
      "none" => Ok(Self::None),
      "default" => Ok(Self::Default),
      "independent" => Ok(Self::Independent),
      other => Err(AnalysisError::Config(format!("unknown thread affinity method {other:?}"))),
    }
  }
}

/// Configuration of `RunAnalysis`.
#[derive(Clone, Debug, Deserialize)]
pub struct AnalysisConfig {
  /// Timesteps between restart checkpoints (and visualization dumps).
  pub restart_interval: i64,

  /// Timesteps between statistics passes.
  pub analysis_interval: i64,

  /// Timesteps between blob identifications.
  pub blobid_interval: i64,

  /// Phase-field interface width parameter.
  #[serde(default = "default_beta")]
  pub beta: f64,

  /// Convergence error seed carried for the solver's stopping criterion.
  #[serde(default)]
  pub err: f64,

  /// Base name of the per-rank restart files.
  #[serde(default = "default_restart_file")]
  pub restart_file: String,

  /// Directory receiving every log, checkpoint and visualization file.
  #[serde(default = "default_output_dir")]
  pub output_dir: PathBuf,

  /// Worker count for the `default` affinity method.
  #[serde(default)]
  pub analysis_threads: usize,

  #[serde(default)]
  pub thread_affinity: ThreadAffinity,
}

fn default_beta() -> f64 {
  0.95
}

fn default_restart_file() -> String {
  "Restart".to_string()
}

fn default_output_dir() -> PathBuf {
  PathBuf::from(".")
}

impl AnalysisConfig {
  pub fn new(restart_interval: i64, analysis_interval: i64, blobid_interval: i64) -> Self {
    Self {
      restart_interval,
      analysis_interval,
      blobid_interval,
      ..Self::default()
    }
  }

  pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.output_dir = dir.into();
    self
  }

  pub fn with_threads(mut self, affinity: ThreadAffinity, threads: usize) -> Self {
    self.thread_affinity = affinity;
    self.analysis_threads = threads;
    self
  }

  pub fn validate(&self) -> Result<()> {
    for (name, value) in [
      ("restart_interval", self.restart_interval),
      ("analysis_interval", self.analysis_interval),
      ("blobid_interval", self.blobid_interval),
    ] {
      if value <= 0 {
        return Err(AnalysisError::Config(format!("{name} must be positive, got {value}")));
      }
    }
    if self.beta.is_nan() || self.beta <= 0.0 {
      return Err(AnalysisError::Config(format!("beta must be positive, got {}", self.beta)));
    }
    if self.restart_file.is_empty() {
      return Err(AnalysisError::Config("restart_file must not be empty".into()));
    }
    Ok(())
  }

  /// Per-rank restart file path.
  pub fn restart_path(&self, rank: usize) -> PathBuf {
    self.output_dir.join(format!("{}.{:05}", self.restart_file, rank))
  }
}

impl Default for AnalysisConfig {
  fn default() -> Self {
    Self {
      restart_interval: 100_000,
      analysis_interval: 1_000,
      blobid_interval: 1_000,
      beta: default_beta(),
      err: 0.0,
      restart_file: default_restart_file(),
      output_dir: default_output_dir(),
      analysis_threads: 0,
      thread_affinity: ThreadAffinity::None,
    }
  }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
