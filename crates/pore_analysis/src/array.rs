//! Column-major 3-D arrays for rank-local field data.
//!
//! Every field the pipeline touches is a full rank subdomain including the
//! one-voxel halo. `strip_halo` produces the interior-only copies written to
//! visualization files, and `regular_layout` expands the solver's compact
//! (pore-only) storage into the regular grid.

use std::ops::{Index, IndexMut};

use crate::error::{AnalysisError, Result};

/// Dense 3-D array with x as the fastest varying axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Array3<T> {
  dims: [usize; 3],
  data: Vec<T>,
}

pub type DoubleArray = Array3<f64>;
pub type IntArray = Array3<i32>;

impl<T: Clone> Array3<T> {
  /// Allocate an `nx * ny * nz` array filled with `value`.
  pub fn new(nx: usize, ny: usize, nz: usize, value: T) -> Self {
    Self {
      dims: [nx, ny, nz],
      data: vec![value; nx * ny * nz],
    }
  }

  pub fn fill(&mut self, value: T) {
    self.data.fill(value);
  }
}

impl<T> Array3<T> {
  /// Wrap an existing buffer. Fails if the length does not match `dims`.
  pub fn from_vec(dims: [usize; 3], data: Vec<T>) -> Result<Self> {
    let expected = dims[0] * dims[1] * dims[2];
    if data.len() != expected {
      return Err(AnalysisError::BufferLength {
        field: "array",
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { dims, data })
  }

  #[inline]
  pub fn dims(&self) -> [usize; 3] {
    self.dims
  }

  /// Dimensions without the one-voxel halo on each side.
  #[inline]
  pub fn interior_dims(&self) -> [usize; 3] {
    self.dims.map(|n| n.saturating_sub(2))
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.data.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  #[inline(always)]
  pub fn index_of(&self, x: usize, y: usize, z: usize) -> usize {
    x + self.dims[0] * (y + self.dims[1] * z)
  }

  #[inline(always)]
  pub fn coords_of(&self, index: usize) -> (usize, usize, usize) {
    let x = index % self.dims[0];
    let y = (index / self.dims[0]) % self.dims[1];
    let z = index / (self.dims[0] * self.dims[1]);
    (x, y, z)
  }

  /// True for voxels in the one-voxel halo.
  #[inline]
  pub fn is_halo(&self, x: usize, y: usize, z: usize) -> bool {
    x == 0
      || y == 0
      || z == 0
      || x + 1 == self.dims[0]
      || y + 1 == self.dims[1]
      || z + 1 == self.dims[2]
  }

  pub fn as_slice(&self) -> &[T] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [T] {
    &mut self.data
  }

  pub fn into_vec(self) -> Vec<T> {
    self.data
  }
}

impl<T> Index<(usize, usize, usize)> for Array3<T> {
  type Output = T;

  #[inline(always)]
  fn index(&self, (x, y, z): (usize, usize, usize)) -> &T {
    &self.data[self.index_of(x, y, z)]
  }
}

impl<T> IndexMut<(usize, usize, usize)> for Array3<T> {
  #[inline(always)]
  fn index_mut(&mut self, (x, y, z): (usize, usize, usize)) -> &mut T {
    let idx = self.index_of(x, y, z);
    &mut self.data[idx]
  }
}

/// Copy the interior of `src` into `dst`, dropping the halo.
///
/// `dst` must have the interior dimensions of `src`.
pub fn strip_halo<T: Copy, U: From<T>>(src: &Array3<T>, dst: &mut Array3<U>) -> Result<()> {
  let [nx, ny, nz] = src.interior_dims();
  if dst.dims() != [nx, ny, nz] {
    return Err(AnalysisError::BufferLength {
      field: "halo-free copy",
      expected: nx * ny * nz,
      actual: dst.len(),
    });
  }
  for z in 0..nz {
    for y in 0..ny {
      for x in 0..nx {
        dst[(x, y, z)] = U::from(src[(x + 1, y + 1, z + 1)]);
      }
    }
  }
  Ok(())
}

/// Expand compact solver storage into the regular grid.
///
/// `map` holds the compact index of each regular voxel, or a negative value
/// for solid voxels (which receive 0.0).
pub fn regular_layout(map: &IntArray, compact: &[f64], dst: &mut DoubleArray) -> Result<()> {
  if map.dims() != dst.dims() {
    return Err(AnalysisError::BufferLength {
      field: "regular layout",
      expected: map.len(),
      actual: dst.len(),
    });
  }
  for (out, &idx) in dst.as_mut_slice().iter_mut().zip(map.as_slice()) {
    *out = if idx < 0 {
      0.0
    } else {
      *compact
        .get(idx as usize)
        .ok_or(AnalysisError::BufferLength {
          field: "compact field",
          expected: idx as usize + 1,
          actual: compact.len(),
        })?
    };
  }
  Ok(())
}

#[cfg(test)]
#[path = "array_test.rs"]
mod array_test;
