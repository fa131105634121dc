//! Solver state seam.
//!
//! The pipeline never touches solver memory directly. It asks a
//! [`DeviceState`] to refresh derived fields and copy them into host
//! buffers. Compact fields (`Np` long) cover only the pore voxels and are
//! expanded with [`crate::array::regular_layout`] and a cell map.
//!
//! [`HostDevice`] keeps everything in host memory and derives pressure and
//! velocity from D3Q19 moments. The tests and the driver run on it.

use crate::array::{DoubleArray, IntArray};
use crate::constants::{D3Q19_Q, DENSITY_COMPONENTS};
use crate::error::{AnalysisError, Result};

/// Solver buffers that can be copied to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceField {
  /// Phase indicator on the regular grid (N).
  Phi,
  /// Compact pressure (Np).
  Pressure,
  /// Compact velocity, component-major `[ux.., uy.., uz..]` (3 Np).
  Velocity,
  /// D3Q19 distributions, direction-major (19 Np).
  Distributions,
  /// Two-fluid densities, component-major (2 Np).
  Density,
}

impl DeviceField {
  /// Expected host buffer length.
  pub fn len(self, n: usize, np: usize) -> usize {
    match self {
      DeviceField::Phi => n,
      DeviceField::Pressure => np,
      DeviceField::Velocity => 3 * np,
      DeviceField::Distributions => D3Q19_Q * np,
      DeviceField::Density => DENSITY_COMPONENTS * np,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      DeviceField::Phi => "phi",
      DeviceField::Pressure => "pressure",
      DeviceField::Velocity => "velocity",
      DeviceField::Distributions => "distributions",
      DeviceField::Density => "density",
    }
  }
}

/// Access to the solver's arrays from the simulation thread.
pub trait DeviceState {
  /// Regular grid size including the halo.
  fn n(&self) -> usize;

  /// Number of compact (pore) voxels.
  fn np(&self) -> usize;

  /// Wait for outstanding device work.
  fn device_barrier(&mut self);

  /// Copy `field` into `dst`, which must have exactly `field.len(n, np)`
  /// elements.
  fn copy_to_host(&self, field: DeviceField, dst: &mut [f64]) -> Result<()>;

  fn compute_pressure(&mut self);

  fn compute_velocity(&mut self);
}

/// D3Q19 lattice velocities.
pub const D3Q19_VELOCITIES: [[i32; 3]; D3Q19_Q] = [
  [0, 0, 0],
  [1, 0, 0],
  [-1, 0, 0],
  [0, 1, 0],
  [0, -1, 0],
  [0, 0, 1],
  [0, 0, -1],
  [1, 1, 0],
  [-1, -1, 0],
  [1, -1, 0],
  [-1, 1, 0],
  [1, 0, 1],
  [-1, 0, -1],
  [1, 0, -1],
  [-1, 0, 1],
  [0, 1, 1],
  [0, -1, -1],
  [0, 1, -1],
  [0, -1, 1],
];

/// Build the compact cell map from the solid signed distance.
///
/// Interior voxels with `dist > 0` receive consecutive compact indices in
/// grid order; halo and solid voxels get `-1`. Returns the map and `Np`.
pub fn build_cell_map(solid_dist: &DoubleArray) -> (IntArray, usize) {
  let [nx, ny, nz] = solid_dist.dims();
  let mut map = IntArray::new(nx, ny, nz, -1);
  let mut np = 0usize;
  for z in 1..nz.saturating_sub(1) {
    for y in 1..ny.saturating_sub(1) {
      for x in 1..nx.saturating_sub(1) {
        if solid_dist[(x, y, z)] > 0.0 {
          map[(x, y, z)] = np as i32;
          np += 1;
        }
      }
    }
  }
  (map, np)
}

/// Host-memory solver state.
#[derive(Clone, Debug)]
pub struct HostDevice {
  n: usize,
  np: usize,
  phi: Vec<f64>,
  den: Vec<f64>,
  fq: Vec<f64>,
  pressure: Vec<f64>,
  velocity: Vec<f64>,
  barriers: usize,
}

impl HostDevice {
  /// Zeroed state for `n` grid voxels and `np` pore voxels.
  pub fn new(n: usize, np: usize) -> Self {
    Self {
      n,
      np,
      phi: vec![0.0; n],
      den: vec![0.0; DENSITY_COMPONENTS * np],
      fq: vec![0.0; D3Q19_Q * np],
      pressure: vec![0.0; np],
      velocity: vec![0.0; 3 * np],
      barriers: 0,
    }
  }

  pub fn phi_mut(&mut self) -> &mut [f64] {
    &mut self.phi
  }

  pub fn density_mut(&mut self) -> &mut [f64] {
    &mut self.den
  }

  /// Distributions, direction-major: `fq[q * np + i]`.
  pub fn distributions_mut(&mut self) -> &mut [f64] {
    &mut self.fq
  }

  /// Number of `device_barrier` calls so far.
  pub fn barrier_count(&self) -> usize {
    self.barriers
  }

  fn source(&self, field: DeviceField) -> &[f64] {
    match field {
      DeviceField::Phi => &self.phi,
      DeviceField::Pressure => &self.pressure,
      DeviceField::Velocity => &self.velocity,
      DeviceField::Distributions => &self.fq,
      DeviceField::Density => &self.den,
    }
  }
}

impl DeviceState for HostDevice {
  fn n(&self) -> usize {
    self.n
  }

  fn np(&self) -> usize {
    self.np
  }

  fn device_barrier(&mut self) {
    self.barriers += 1;
  }

  fn copy_to_host(&self, field: DeviceField, dst: &mut [f64]) -> Result<()> {
    let expected = field.len(self.n, self.np);
    if dst.len() != expected {
      return Err(AnalysisError::BufferLength {
        field: field.name(),
        expected,
        actual: dst.len(),
      });
    }
    dst.copy_from_slice(self.source(field));
    Ok(())
  }

  fn compute_pressure(&mut self) {
    let np = self.np;
    for i in 0..np {
      let rho: f64 = (0..D3Q19_Q).map(|q| self.fq[q * np + i]).sum();
      self.pressure[i] = rho / 3.0;
    }
  }

  fn compute_velocity(&mut self) {
    let np = self.np;
    for i in 0..np {
      let mut momentum = [0.0f64; 3];
      for (q, c) in D3Q19_VELOCITIES.iter().enumerate() {
        let f = self.fq[q * np + i];
        for axis in 0..3 {
          momentum[axis] += c[axis] as f64 * f;
        }
      }
      for axis in 0..3 {
        self.velocity[axis * np + i] = momentum[axis];
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_velocity_set_is_symmetric() {
    let mut sum = [0i32; 3];
    for c in D3Q19_VELOCITIES {
      for axis in 0..3 {
        sum[axis] += c[axis];
      }
    }
    assert_eq!(sum, [0, 0, 0]);
  }

  #[test]
  fn test_moments() {
    let mut device = HostDevice::new(8, 2);
    let np = 2;
    // Rest population plus one +x population on cell 0
    device.distributions_mut()[0] = 1.5;
    device.distributions_mut()[np] = 1.5;
    device.compute_pressure();
    device.compute_velocity();

    let mut pressure = vec![0.0; np];
    device.copy_to_host(DeviceField::Pressure, &mut pressure).unwrap();
    assert_eq!(pressure, vec![1.0, 0.0]);

    let mut velocity = vec![0.0; 3 * np];
    device.copy_to_host(DeviceField::Velocity, &mut velocity).unwrap();
    assert_eq!(velocity, vec![1.5, 0.0, 0.0, 0.0, 0.0, 0.0]);
  }

  #[test]
  fn test_copy_rejects_wrong_length() {
    let device = HostDevice::new(8, 2);
    let mut short = vec![0.0; 5];
    assert!(matches!(
      device.copy_to_host(DeviceField::Distributions, &mut short),
      Err(AnalysisError::BufferLength {
        field: "distributions",
        expected: 38,
        actual: 5
      })
    ));
  }

  #[test]
  fn test_cell_map_skips_halo_and_solid() {
    let mut dist = DoubleArray::new(4, 3, 3, 1.0);
    dist[(2, 1, 1)] = -1.0;
    let (map, np) = build_cell_map(&dist);
    assert_eq!(np, 1);
    assert_eq!(map[(1, 1, 1)], 0);
    assert_eq!(map[(2, 1, 1)], -1);
    assert_eq!(map[(0, 1, 1)], -1);
  }
}
