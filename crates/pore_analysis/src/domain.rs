//! Rank decomposition of the simulation domain.

use glam::DVec3;
use serde::Deserialize;

use crate::error::{AnalysisError, Result};

/// Per-rank subdomain description.
#[derive(Clone, Debug, Deserialize)]
pub struct DomainConfig {
  /// Local subdomain size including the one-voxel halo.
  pub nx: usize,
  pub ny: usize,
  pub nz: usize,
  /// Process grid `[px, py, pz]`.
  #[serde(default = "default_nproc")]
  pub nproc: [usize; 3],
  /// Physical lengths of the whole domain.
  #[serde(default = "default_lengths")]
  pub lengths: [f64; 3],
  /// Periodic boundaries on every axis.
  #[serde(default)]
  pub periodic: bool,
}

fn default_nproc() -> [usize; 3] {
  [1, 1, 1]
}

fn default_lengths() -> [f64; 3] {
  [1.0, 1.0, 1.0]
}

impl DomainConfig {
  pub fn validate(&self) -> Result<()> {
    if self.nx < 3 || self.ny < 3 || self.nz < 3 {
      return Err(AnalysisError::Config(format!(
        "subdomain {}x{}x{} is too small to hold a halo",
        self.nx, self.ny, self.nz
      )));
    }
    if self.nproc.iter().any(|&p| p == 0) {
      return Err(AnalysisError::Config("process grid needs at least one rank per axis".into()));
    }
    Ok(())
  }

  pub fn dims(&self) -> [usize; 3] {
    [self.nx, self.ny, self.nz]
  }

  /// Number of voxels including the halo.
  pub fn n(&self) -> usize {
    self.nx * self.ny * self.nz
  }

  pub fn ranks(&self) -> usize {
    self.nproc.iter().product()
  }

  pub fn lengths(&self) -> DVec3 {
    DVec3::from_array(self.lengths)
  }

  pub fn rank_info(&self, rank: usize) -> RankInfo {
    RankInfo::new(rank, self.nproc)
  }
}

/// Position of a rank inside the process grid.
///
/// Ranks are numbered x fastest: `rank = ix + iy * px + iz * px * py`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankInfo {
  pub rank: usize,
  pub nproc: [usize; 3],
  pub coords: [usize; 3],
}

impl RankInfo {
  pub fn new(rank: usize, nproc: [usize; 3]) -> Self {
    let coords = [
      rank % nproc[0],
      (rank / nproc[0]) % nproc[1],
      rank / (nproc[0] * nproc[1]),
    ];
    Self {
      rank,
      nproc,
      coords,
    }
  }

  pub fn rank_of(nproc: [usize; 3], coords: [usize; 3]) -> usize {
    coords[0] + nproc[0] * (coords[1] + nproc[1] * coords[2])
  }

  /// Rank one step along `axis` in the positive direction, if any.
  pub fn upper_neighbor(&self, axis: usize, periodic: bool) -> Option<usize> {
    let mut coords = self.coords;
    if coords[axis] + 1 < self.nproc[axis] {
      coords[axis] += 1;
    } else if periodic {
      coords[axis] = 0;
    } else {
      return None;
    }
    Some(Self::rank_of(self.nproc, coords))
  }

  /// Offset of this rank's first interior voxel in the global interior grid.
  pub fn global_offset(&self, interior: [usize; 3]) -> [usize; 3] {
    [
      self.coords[0] * interior[0],
      self.coords[1] * interior[1],
      self.coords[2] * interior[2],
    ]
  }

  pub fn global_dims(&self, interior: [usize; 3]) -> [usize; 3] {
    [
      self.nproc[0] * interior[0],
      self.nproc[1] * interior[1],
      self.nproc[2] * interior[2],
    ]
  }
}
