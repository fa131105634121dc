//! Visualization datasets and their writers.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use glam::DVec3;

use crate::array::DoubleArray;
use crate::comm::Communicator;
use crate::constants::{VIS_MESH_NAME, VIS_VARIABLES};
use crate::domain::RankInfo;
use crate::error::{AnalysisError, Result};

/// Uniform grid covering one rank's interior.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainMesh {
  pub rank_info: RankInfo,
  /// Interior voxel counts (no halo).
  pub dims: [usize; 3],
  /// Physical lengths of the whole domain.
  pub lengths: DVec3,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeshVariable {
  pub name: String,
  pub data: DoubleArray,
}

/// One named mesh with its volume variables.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshDataset {
  pub name: String,
  pub mesh: DomainMesh,
  pub vars: Vec<MeshVariable>,
}

impl MeshDataset {
  /// The `domain` dataset with the four standard variables, zero filled.
  pub fn domain(rank_info: RankInfo, interior: [usize; 3], lengths: DVec3) -> Self {
    let [nx, ny, nz] = interior;
    let vars = VIS_VARIABLES
      .iter()
      .map(|name| MeshVariable {
        name: (*name).to_string(),
        data: DoubleArray::new(nx, ny, nz, 0.0),
      })
      .collect();
    Self {
      name: VIS_MESH_NAME.to_string(),
      mesh: DomainMesh {
        rank_info,
        dims: interior,
        lengths,
      },
      vars,
    }
  }

  /// Check that the variables are still the standard four, in order.
  pub fn check_layout(&self) -> Result<()> {
    for (index, &expected) in VIS_VARIABLES.iter().enumerate() {
      match self.vars.get(index) {
        Some(var) if var.name == expected => {}
        other => {
          return Err(AnalysisError::MeshLayout {
            index,
            expected,
            found: other.map(|v| v.name.clone()).unwrap_or_default(),
          })
        }
      }
    }
    Ok(())
  }
}

/// Encoder for visualization datasets. Collective over `comm`.
pub trait MeshWriter: Send + Sync {
  fn write_data(
    &self,
    timestep: i64,
    datasets: &[MeshDataset],
    comm: &dyn Communicator,
  ) -> Result<()>;
}

/// Plain dump: `vis<t>/<var>.<rank>.raw` as little-endian `f64`.
///
/// Rank 0 also appends one line per dump to `summary.txt`.
#[derive(Clone, Debug)]
pub struct RawMeshWriter {
  root: PathBuf,
}

impl RawMeshWriter {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn dump_dir(&self, timestep: i64) -> PathBuf {
    self.root.join(format!("vis{timestep:05}"))
  }
}

impl MeshWriter for RawMeshWriter {
  fn write_data(
    &self,
    timestep: i64,
    datasets: &[MeshDataset],
    comm: &dyn Communicator,
  ) -> Result<()> {
    let dir = self.dump_dir(timestep);
    fs::create_dir_all(&dir).map_err(|e| AnalysisError::io(&dir, e))?;

    for dataset in datasets {
      for var in &dataset.vars {
        let path = dir.join(format!("{}.{:05}.raw", var.name, comm.rank()));
        write_raw(&path, &var.data)?;
      }
    }

    if comm.rank() == 0 {
      let path = self.root.join("summary.txt");
      let mut line = format!("vis{timestep:05} ranks={}", comm.size());
      for dataset in datasets {
        let [nx, ny, nz] = dataset.mesh.dims;
        let vars: Vec<_> = dataset.vars.iter().map(|v| v.name.as_str()).collect();
        line.push_str(&format!(" {}[{nx}x{ny}x{nz}]:{}", dataset.name, vars.join(",")));
      }
      line.push('\n');
      let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| AnalysisError::io(&path, e))?;
      file
        .write_all(line.as_bytes())
        .map_err(|e| AnalysisError::io(&path, e))?;
    }
    tracing::debug!(timestep, rank = comm.rank(), "wrote vis dump");
    Ok(())
  }
}

fn write_raw(path: &Path, data: &DoubleArray) -> Result<()> {
  let io = |e| AnalysisError::io(path, e);
  let mut out = BufWriter::new(fs::File::create(path).map_err(io)?);
  for v in data.as_slice() {
    out.write_all(&v.to_le_bytes()).map_err(io)?;
  }
  out.flush().map_err(io)
}
