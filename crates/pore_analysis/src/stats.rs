//! Two-phase averages over a rank subdomain.
//!
//! [`PhaseStatistics`] owns the host copies of the simulation fields that the
//! analysis and visualization tasks read. The simulation thread never writes
//! it: host snapshots travel as [`StagedFields`] and are applied by the next
//! task that holds the lock.
//!
//! Every `compute_averages` pass produces:
//!
//! - one row of domain-wide averages appended to `timelog.tcat`
//! - one row per blob appended to `blobs.tcat`
//!
//! Both files are written by rank 0 only.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::DVec3;

use crate::array::{DoubleArray, IntArray};
use crate::blob::{BlobId, BlobIdList, BlobIds};
use crate::comm::{Communicator, ReduceOp};
use crate::constants::{BLOBLOG_FILENAME, PHASE_LOOKAHEAD, SIGNED_DISTANCE_CLAMP, TIMELOG_FILENAME};
use crate::domain::RankInfo;
use crate::error::{AnalysisError, Result};

/// Signed distance band (in voxels) that counts as the fluid interface.
const INTERFACE_WIDTH: f64 = 1.0;

/// Map a phase indicator in `[-1, 1]` to an approximate signed distance.
///
/// `0.5/beta * ln((1+phi)/(1-phi))`, saturated at `±2.94 * 0.5/beta` once
/// `|phi| > 0.8`.
#[inline]
pub fn color_to_signed_distance(beta: f64, phi: f64) -> f64 {
  let factor = 0.5 / beta;
  let value = phi.clamp(-1.0, 1.0);
  if value > 0.8 {
    SIGNED_DISTANCE_CLAMP * factor
  } else if value < -0.8 {
    -SIGNED_DISTANCE_CLAMP * factor
  } else {
    factor * ((1.0 + value) / (1.0 - value)).ln()
  }
}

/// Apply [`color_to_signed_distance`] to every voxel.
pub fn color_to_signed_distance_field(beta: f64, phase: &DoubleArray, out: &mut DoubleArray) {
  for (d, &p) in out.as_mut_slice().iter_mut().zip(phase.as_slice()) {
    *d = color_to_signed_distance(beta, p);
  }
}

/// Host snapshots waiting to be applied to the statistics state.
#[derive(Clone, Debug, Default)]
pub struct StagedFields {
  pub phase: Option<Arc<DoubleArray>>,
  pub phase_tplus: Option<Arc<DoubleArray>>,
  pub phase_tminus: Option<Arc<DoubleArray>>,
  pub pressure: Option<DoubleArray>,
  pub velocity: Option<[DoubleArray; 3]>,
}

impl StagedFields {
  pub fn is_empty(&self) -> bool {
    self.phase.is_none()
      && self.phase_tplus.is_none()
      && self.phase_tminus.is_none()
      && self.pressure.is_none()
      && self.velocity.is_none()
  }

  /// Fold `newer` on top, newer snapshots replacing older ones.
  pub fn merge(&mut self, newer: StagedFields) {
    if newer.phase.is_some() {
      self.phase = newer.phase;
    }
    if newer.phase_tplus.is_some() {
      self.phase_tplus = newer.phase_tplus;
    }
    if newer.phase_tminus.is_some() {
      self.phase_tminus = newer.phase_tminus;
    }
    if newer.pressure.is_some() {
      self.pressure = newer.pressure;
    }
    if newer.velocity.is_some() {
      self.velocity = newer.velocity;
    }
  }
}

/// Domain-wide averages of one timestep.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalAverages {
  pub timestep: i64,
  /// Pore voxels over all interior voxels.
  pub porosity: f64,
  pub saturation_w: f64,
  pub volume_w: f64,
  pub volume_n: f64,
  pub pressure_w: f64,
  pub pressure_n: f64,
  pub velocity_w: DVec3,
  pub velocity_n: DVec3,
  /// Interfacial areas in voxel faces.
  pub awn: f64,
  pub ans: f64,
  pub aws: f64,
  /// Mean normal speed of the fluid interface (voxels per timestep).
  pub interface_speed: f64,
}

/// Averages of one blob.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobAverages {
  pub id: BlobId,
  pub volume: f64,
  pub pressure: f64,
  pub velocity: DVec3,
  pub centroid: DVec3,
  pub awn: f64,
  pub ans: f64,
}

// Indices into the local sum vector
const S_VOL_W: usize = 0;
const S_VOL_N: usize = 1;
const S_PRESS_W: usize = 2;
const S_PRESS_N: usize = 3;
const S_VEL_W: usize = 4;
const S_VEL_N: usize = 7;
const S_AWN: usize = 10;
const S_ANS: usize = 11;
const S_AWS: usize = 12;
const S_SPEED: usize = 13;
const S_INTERFACE: usize = 14;
const S_PORE: usize = 15;
const S_TOTAL: usize = 16;
const SUMS: usize = 17;

// Per-blob sum layout
const B_VOL: usize = 0;
const B_PRESS: usize = 1;
const B_VEL: usize = 2;
const B_CENTROID: usize = 5;
const B_AWN: usize = 8;
const B_ANS: usize = 9;
const BLOB_SUMS: usize = 10;

/// Shared averaging state of one rank.
#[derive(Clone, Debug)]
pub struct PhaseStatistics {
  rank_info: RankInfo,
  lengths: DVec3,
  beta: f64,
  output_dir: PathBuf,

  pub phase: DoubleArray,
  pub phase_tplus: DoubleArray,
  pub phase_tminus: DoubleArray,
  pub press: DoubleArray,
  pub vel: [DoubleArray; 3],
  /// Signed distance to the fluid interface.
  pub sdn: DoubleArray,
  /// Signed distances of the phase snapshots around the averaging step.
  pub sd_tplus: DoubleArray,
  pub sd_tminus: DoubleArray,
  /// Signed distance to the solid (positive in the pore space).
  pub sds: DoubleArray,
  /// Global blob ID per voxel, `-1` elsewhere.
  pub label_nwp: DoubleArray,
  /// Raw blob label per voxel, indexes `label_map`.
  pub raw_labels: IntArray,
  pub label_map: BlobIdList,
  pub count: usize,
}

impl PhaseStatistics {
  pub fn new(
    solid_dist: DoubleArray,
    rank_info: RankInfo,
    lengths: DVec3,
    beta: f64,
    output_dir: impl Into<PathBuf>,
  ) -> Self {
    let [nx, ny, nz] = solid_dist.dims();
    let field = || DoubleArray::new(nx, ny, nz, 0.0);
    Self {
      rank_info,
      lengths,
      beta,
      output_dir: output_dir.into(),
      phase: field(),
      phase_tplus: field(),
      phase_tminus: field(),
      press: field(),
      vel: [field(), field(), field()],
      sdn: field(),
      sd_tplus: field(),
      sd_tminus: field(),
      sds: solid_dist,
      label_nwp: DoubleArray::new(nx, ny, nz, -1.0),
      raw_labels: IntArray::new(nx, ny, nz, -1),
      label_map: Vec::new(),
      count: 0,
    }
  }

  pub fn dims(&self) -> [usize; 3] {
    self.sds.dims()
  }

  /// Copy staged host snapshots into the state.
  pub fn apply(&mut self, staged: StagedFields) -> Result<()> {
    if let Some(phase) = staged.phase {
      copy_field("phase", &phase, &mut self.phase)?;
    }
    if let Some(tplus) = staged.phase_tplus {
      copy_field("phase_tplus", &tplus, &mut self.phase_tplus)?;
    }
    if let Some(tminus) = staged.phase_tminus {
      copy_field("phase_tminus", &tminus, &mut self.phase_tminus)?;
    }
    if let Some(press) = staged.pressure {
      copy_field("pressure", &press, &mut self.press)?;
    }
    if let Some(vel) = staged.velocity {
      for (src, dst) in vel.iter().zip(self.vel.iter_mut()) {
        copy_field("velocity", src, dst)?;
      }
    }
    Ok(())
  }

  /// Install the latest blob labeling.
  ///
  /// `raw` holds raw labels; `list` maps each raw label to its global ID.
  pub fn set_blobs(&mut self, raw: &BlobIds, list: &BlobIdList) -> Result<()> {
    if raw.dims() != self.dims() {
      return Err(AnalysisError::DimensionMismatch {
        previous: self.dims(),
        current: raw.dims(),
      });
    }
    self.count = raw.count;
    self.label_map = list.clone();
    self.raw_labels = raw.labels.clone();
    for (out, &label) in self
      .label_nwp
      .as_mut_slice()
      .iter_mut()
      .zip(raw.labels.as_slice())
    {
      *out = match list.get(label.max(0) as usize) {
        Some(d) if label >= 0 => d.id as f64,
        _ => -1.0,
      };
    }
    Ok(())
  }

  /// Signed distances, local sums, global reduction and the log rows.
  ///
  /// The staged phase snapshots are left untouched, so repeating a step on
  /// the same state appends the same rows again.
  pub fn compute_averages(
    &mut self,
    timestep: i64,
    comm: &dyn Communicator,
  ) -> Result<(GlobalAverages, Vec<BlobAverages>)> {
    let beta = self.beta;
    color_to_signed_distance_field(beta, &self.phase, &mut self.sdn);
    color_to_signed_distance_field(beta, &self.phase_tminus, &mut self.sd_tminus);
    color_to_signed_distance_field(beta, &self.phase_tplus, &mut self.sd_tplus);

    let local = self.local_sums();
    let global = comm.all_reduce_f64(&local, ReduceOp::Sum)?;
    let averages = global_averages(timestep, &global);

    let blob_local = self.blob_sums();
    let blob_global = comm.all_reduce_f64(&blob_local, ReduceOp::Sum)?;
    let blobs = self.blob_averages(&blob_global);

    if comm.rank() == 0 {
      append_rows(
        &self.output_dir.join(TIMELOG_FILENAME),
        TIMELOG_HEADER,
        &format_timelog_row(&averages),
      )?;
      let rows: String = blobs
        .iter()
        .map(|b| format_blob_row(timestep, b))
        .collect();
      append_rows(&self.output_dir.join(BLOBLOG_FILENAME), BLOBLOG_HEADER, &rows)?;
    }
    Ok((averages, blobs))
  }

  fn is_pore(&self, i: usize) -> bool {
    self.sds.as_slice()[i] > 0.0
  }

  fn local_sums(&self) -> Vec<f64> {
    let mut s = vec![0.0; SUMS];
    let [nx, ny, nz] = self.dims();
    let stride = [1, nx, nx * ny];
    let sdn = self.sdn.as_slice();

    for z in 1..nz - 1 {
      for y in 1..ny - 1 {
        for x in 1..nx - 1 {
          s[S_TOTAL] += 1.0;
          let i = self.sdn.index_of(x, y, z);
          if !self.is_pore(i) {
            continue;
          }
          s[S_PORE] += 1.0;
          let wet = sdn[i] < 0.0;
          let (vol, press, vel) = if wet {
            (S_VOL_W, S_PRESS_W, S_VEL_W)
          } else {
            (S_VOL_N, S_PRESS_N, S_VEL_N)
          };
          s[vol] += 1.0;
          s[press] += self.press.as_slice()[i];
          for axis in 0..3 {
            s[vel + axis] += self.vel[axis].as_slice()[i];
          }

          for &st in &stride {
            // Fluid faces counted once, towards the upper neighbour
            let up = i + st;
            if self.is_pore(up) && (sdn[up] < 0.0) != wet {
              s[S_AWN] += 1.0;
            }
            for j in [i - st, up] {
              if !self.is_pore(j) {
                s[if wet { S_AWS } else { S_ANS }] += 1.0;
              }
            }
          }

          if sdn[i].abs() < INTERFACE_WIDTH {
            let dt = PHASE_LOOKAHEAD as f64;
            s[S_SPEED] += (self.sd_tminus.as_slice()[i] - self.sd_tplus.as_slice()[i]) / dt;
            s[S_INTERFACE] += 1.0;
          }
        }
      }
    }
    s
  }

  fn blob_sums(&self) -> Vec<f64> {
    let mut s = vec![0.0; BLOB_SUMS * self.count];
    let [nx, ny, nz] = self.dims();
    let stride = [1, nx, nx * ny];
    let interior = self.sds.interior_dims();
    let offset = self.rank_info.global_offset(interior);
    let spacing = self.spacing();
    let labels = self.raw_labels.as_slice();
    let sdn = self.sdn.as_slice();

    for z in 1..nz - 1 {
      for y in 1..ny - 1 {
        for x in 1..nx - 1 {
          let i = self.raw_labels.index_of(x, y, z);
          let label = labels[i];
          if label < 0 || label as usize >= self.count {
            continue;
          }
          let b = &mut s[BLOB_SUMS * label as usize..BLOB_SUMS * (label as usize + 1)];
          b[B_VOL] += 1.0;
          b[B_PRESS] += self.press.as_slice()[i];
          let g = DVec3::new(
            (offset[0] + x - 1) as f64,
            (offset[1] + y - 1) as f64,
            (offset[2] + z - 1) as f64,
          );
          let centroid = (g + 0.5) * spacing;
          for axis in 0..3 {
            b[B_VEL + axis] += self.vel[axis].as_slice()[i];
            b[B_CENTROID + axis] += centroid[axis];
          }
          for &st in &stride {
            for j in [i - st, i + st] {
              if labels[j] == label {
                continue;
              }
              if !self.is_pore(j) {
                b[B_ANS] += 1.0;
              } else if sdn[j] < 0.0 {
                b[B_AWN] += 1.0;
              }
            }
          }
        }
      }
    }
    s
  }

  fn blob_averages(&self, sums: &[f64]) -> Vec<BlobAverages> {
    let mut blobs: Vec<BlobAverages> = sums
      .chunks_exact(BLOB_SUMS)
      .enumerate()
      .filter(|(_, b)| b[B_VOL] > 0.0)
      .map(|(raw, b)| {
        let volume = b[B_VOL];
        let vec3 = |k: usize| DVec3::new(b[k], b[k + 1], b[k + 2]) / volume;
        BlobAverages {
          id: self
            .label_map
            .get(raw)
            .map(|d| d.id)
            .unwrap_or(raw as BlobId),
          volume,
          pressure: b[B_PRESS] / volume,
          velocity: vec3(B_VEL),
          centroid: vec3(B_CENTROID),
          awn: b[B_AWN],
          ans: b[B_ANS],
        }
      })
      .collect();
    blobs.sort_by(|a, b| b.volume.total_cmp(&a.volume).then(a.id.cmp(&b.id)));
    blobs
  }

  /// Physical size of one voxel along each axis.
  fn spacing(&self) -> DVec3 {
    let global = self.rank_info.global_dims(self.sds.interior_dims());
    self.lengths / DVec3::new(global[0] as f64, global[1] as f64, global[2] as f64)
  }
}

fn copy_field(name: &'static str, src: &DoubleArray, dst: &mut DoubleArray) -> Result<()> {
  if src.dims() != dst.dims() {
    return Err(AnalysisError::BufferLength {
      field: name,
      expected: dst.len(),
      actual: src.len(),
    });
  }
  dst.as_mut_slice().copy_from_slice(src.as_slice());
  Ok(())
}

fn ratio(num: f64, den: f64) -> f64 {
  if den > 0.0 {
    num / den
  } else {
    0.0
  }
}

fn global_averages(timestep: i64, s: &[f64]) -> GlobalAverages {
  let vec3 = |k: usize, den: f64| DVec3::new(s[k], s[k + 1], s[k + 2]) / den.max(1.0);
  GlobalAverages {
    timestep,
    porosity: ratio(s[S_PORE], s[S_TOTAL]),
    saturation_w: ratio(s[S_VOL_W], s[S_VOL_W] + s[S_VOL_N]),
    volume_w: s[S_VOL_W],
    volume_n: s[S_VOL_N],
    pressure_w: ratio(s[S_PRESS_W], s[S_VOL_W]),
    pressure_n: ratio(s[S_PRESS_N], s[S_VOL_N]),
    velocity_w: vec3(S_VEL_W, s[S_VOL_W]),
    velocity_n: vec3(S_VEL_N, s[S_VOL_N]),
    awn: s[S_AWN],
    ans: s[S_ANS],
    aws: s[S_AWS],
    interface_speed: ratio(s[S_SPEED], s[S_INTERFACE]),
  }
}

const TIMELOG_HEADER: &str =
  "time porosity sw Vw Vn pw pn vawx vawy vawz vanx vany vanz awn ans aws vint\n";
const BLOBLOG_HEADER: &str = "time id Vn pn vx vy vz cx cy cz awn ans\n";

fn format_timelog_row(a: &GlobalAverages) -> String {
  format!(
    "{} {:.8e} {:.8e} {} {} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {} {} {} {:.8e}\n",
    a.timestep,
    a.porosity,
    a.saturation_w,
    a.volume_w,
    a.volume_n,
    a.pressure_w,
    a.pressure_n,
    a.velocity_w.x,
    a.velocity_w.y,
    a.velocity_w.z,
    a.velocity_n.x,
    a.velocity_n.y,
    a.velocity_n.z,
    a.awn,
    a.ans,
    a.aws,
    a.interface_speed,
  )
}

fn format_blob_row(timestep: i64, b: &BlobAverages) -> String {
  format!(
    "{} {} {} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {:.8e} {} {}\n",
    timestep,
    b.id,
    b.volume,
    b.pressure,
    b.velocity.x,
    b.velocity.y,
    b.velocity.z,
    b.centroid.x,
    b.centroid.y,
    b.centroid.z,
    b.awn,
    b.ans,
  )
}

/// Append `rows`, writing `header` first if the file is new or empty.
fn append_rows(path: &Path, header: &str, rows: &str) -> Result<()> {
  let mut file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .map_err(|e| AnalysisError::io(path, e))?;
  let empty = file
    .metadata()
    .map_err(|e| AnalysisError::io(path, e))?
    .len()
    == 0;
  let mut out = String::with_capacity(header.len() + rows.len());
  if empty {
    out.push_str(header);
  }
  out.push_str(rows);
  file
    .write_all(out.as_bytes())
    .map_err(|e| AnalysisError::io(path, e))
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod stats_test;
