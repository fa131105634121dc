//! Global connected-component labeling of blob voxels.

use std::collections::HashMap;

use super::types::{BlobDescriptor, BlobIdList, BlobIds};
use super::DisjointSet;
use crate::array::{DoubleArray, IntArray};
use crate::comm::Communicator;
use crate::domain::RankInfo;
use crate::error::{AnalysisError, Result};

/// Raw labeling of one timestep.
#[derive(Clone, Debug)]
pub struct LabeledBlobs {
  pub ids: BlobIds,
  /// One record per raw label; `id` equals the raw label.
  pub descriptors: BlobIdList,
}

/// Per-component totals: volume, exposed faces, smallest global index.
type ComponentStats = [i64; 3];

/// Label the blob voxels (`phase > vf && dist > vs`) of every rank with
/// globally consistent IDs.
///
/// Collective over `comm`. Components are connected through the six face
/// neighbours, across rank boundaries, and across the domain boundary when
/// `periodic` is set. IDs are ordered by descending volume, ties broken by
/// the smallest global voxel index, so every rank derives the same numbering.
pub fn compute_global_blob_ids(
  phase: &DoubleArray,
  dist: &DoubleArray,
  rank_info: &RankInfo,
  periodic: bool,
  vf: f64,
  vs: f64,
  comm: &dyn Communicator,
) -> Result<LabeledBlobs> {
  if phase.dims() != dist.dims() {
    return Err(AnalysisError::BufferLength {
      field: "solid distance",
      expected: phase.len(),
      actual: dist.len(),
    });
  }
  let ranks: usize = rank_info.nproc.iter().product();
  if comm.size() != ranks {
    return Err(AnalysisError::Protocol(format!(
      "communicator has {} ranks but the process grid has {ranks}",
      comm.size()
    )));
  }

  let phase_data = phase.as_slice();
  let dist_data = dist.as_slice();
  let is_blob = |i: usize| phase_data[i] > vf && dist_data[i] > vs;

  let (local, stats) = label_local(phase, rank_info, &is_blob);

  // count, stats, then the six boundary faces of local labels
  let interior = phase.interior_dims();
  let mut payload = Vec::with_capacity(1 + 3 * stats.len() + 2 * face_total(interior));
  payload.push(stats.len() as i64);
  payload.extend(stats.iter().flatten());
  for axis in 0..3 {
    payload.extend(face(&local, axis, false));
    payload.extend(face(&local, axis, true));
  }

  let gathered = comm.all_gather_i64(payload)?;
  let decoded = gathered
    .iter()
    .map(|p| decode_payload(p, interior))
    .collect::<Result<Vec<_>>>()?;

  let mut offsets = Vec::with_capacity(decoded.len() + 1);
  offsets.push(0usize);
  for rank in &decoded {
    offsets.push(offsets[offsets.len() - 1] + rank.stats.len());
  }
  let total = offsets[decoded.len()];

  let mut sets = DisjointSet::new(total);
  for (r, rank) in decoded.iter().enumerate() {
    let info = RankInfo::new(r, rank_info.nproc);
    for axis in 0..3 {
      let Some(upper) = info.upper_neighbor(axis, periodic) else {
        continue;
      };
      let high = rank.faces[2 * axis + 1];
      let low = decoded[upper].faces[2 * axis];
      for (&a, &b) in high.iter().zip(low) {
        if a >= 0 && b >= 0 {
          sets.union(offsets[r] + a as usize, offsets[upper] + b as usize);
        }
      }
    }
  }

  // Merge the per-rank totals into their global components
  let mut merged: HashMap<usize, ComponentStats> = HashMap::new();
  for (r, rank) in decoded.iter().enumerate() {
    for (c, s) in rank.stats.iter().enumerate() {
      let root = sets.find(offsets[r] + c);
      let entry = merged.entry(root).or_insert([0, 0, i64::MAX]);
      entry[0] += s[0];
      entry[1] += s[1];
      entry[2] = entry[2].min(s[2]);
    }
  }
  let mut order: Vec<(usize, ComponentStats)> = merged.into_iter().collect();
  order.sort_by(|a, b| b.1[0].cmp(&a.1[0]).then(a.1[2].cmp(&b.1[2])));

  let mut final_id = vec![-1i32; total];
  let mut root_id = HashMap::with_capacity(order.len());
  let descriptors: BlobIdList = order
    .iter()
    .enumerate()
    .map(|(id, (root, s))| {
      root_id.insert(*root, id as i32);
      BlobDescriptor {
        id: id as i32,
        volume: s[0] as u64,
        surface: s[1] as u64,
      }
    })
    .collect();
  for (g, slot) in final_id.iter_mut().enumerate() {
    let root = sets.find(g);
    *slot = root_id.get(&root).copied().unwrap_or(-1);
  }

  let me = comm.rank();
  let mut labels = local;
  for label in labels.as_mut_slice() {
    if *label >= 0 {
      *label = final_id[offsets[me] + *label as usize];
    }
  }

  tracing::debug!(rank = me, count = descriptors.len(), "labeled blobs");
  Ok(LabeledBlobs {
    ids: BlobIds {
      count: descriptors.len(),
      labels,
    },
    descriptors,
  })
}

/// Union-find over the interior, returning local component labels and their
/// totals.
fn label_local(
  grid: &DoubleArray,
  rank_info: &RankInfo,
  is_blob: &dyn Fn(usize) -> bool,
) -> (IntArray, Vec<ComponentStats>) {
  let [nx, ny, nz] = grid.dims();
  let stride = [1, nx, nx * ny];
  let mut sets = DisjointSet::new(grid.len());

  for z in 1..nz - 1 {
    for y in 1..ny - 1 {
      for x in 1..nx - 1 {
        let i = grid.index_of(x, y, z);
        if !is_blob(i) {
          continue;
        }
        if x + 2 < nx && is_blob(i + stride[0]) {
          sets.union(i, i + stride[0]);
        }
        if y + 2 < ny && is_blob(i + stride[1]) {
          sets.union(i, i + stride[1]);
        }
        if z + 2 < nz && is_blob(i + stride[2]) {
          sets.union(i, i + stride[2]);
        }
      }
    }
  }

  let interior = grid.interior_dims();
  let offset = rank_info.global_offset(interior);
  let global = rank_info.global_dims(interior);

  let mut local = IntArray::new(nx, ny, nz, -1);
  let mut components: HashMap<usize, usize> = HashMap::new();
  let mut stats: Vec<ComponentStats> = Vec::new();
  for z in 1..nz - 1 {
    for y in 1..ny - 1 {
      for x in 1..nx - 1 {
        let i = grid.index_of(x, y, z);
        if !is_blob(i) {
          continue;
        }
        let root = sets.find(i);
        let comp = *components.entry(root).or_insert_with(|| {
          stats.push([0, 0, i64::MAX]);
          stats.len() - 1
        });
        local.as_mut_slice()[i] = comp as i32;

        // Interior voxels always have six neighbours (halo included)
        let exposed = stride
          .iter()
          .flat_map(|&s| [i - s, i + s])
          .filter(|&j| !is_blob(j))
          .count();
        let gx = offset[0] + x - 1;
        let gy = offset[1] + y - 1;
        let gz = offset[2] + z - 1;
        let gidx = (gx + global[0] * (gy + global[1] * gz)) as i64;

        let s = &mut stats[comp];
        s[0] += 1;
        s[1] += exposed as i64;
        s[2] = s[2].min(gidx);
      }
    }
  }
  (local, stats)
}

fn face_len(interior: [usize; 3], axis: usize) -> usize {
  match axis {
    0 => interior[1] * interior[2],
    1 => interior[0] * interior[2],
    _ => interior[0] * interior[1],
  }
}

fn face_total(interior: [usize; 3]) -> usize {
  (0..3).map(|axis| face_len(interior, axis)).sum()
}

/// Labels on the first (`high == false`) or last interior layer of `axis`.
fn face(labels: &IntArray, axis: usize, high: bool) -> Vec<i64> {
  let [nx, ny, nz] = labels.dims();
  let layer = if high { labels.dims()[axis] - 2 } else { 1 };
  let mut out = Vec::with_capacity(face_len(labels.interior_dims(), axis));
  match axis {
    0 => {
      for z in 1..nz - 1 {
        for y in 1..ny - 1 {
          out.push(labels[(layer, y, z)] as i64);
        }
      }
    }
    1 => {
      for z in 1..nz - 1 {
        for x in 1..nx - 1 {
          out.push(labels[(x, layer, z)] as i64);
        }
      }
    }
    _ => {
      for y in 1..ny - 1 {
        for x in 1..nx - 1 {
          out.push(labels[(x, y, layer)] as i64);
        }
      }
    }
  }
  out
}

struct RankPayload<'a> {
  stats: Vec<ComponentStats>,
  /// `[x_low, x_high, y_low, y_high, z_low, z_high]`
  faces: [&'a [i64]; 6],
}

fn decode_payload(payload: &[i64], interior: [usize; 3]) -> Result<RankPayload<'_>> {
  let count = payload
    .first()
    .copied()
    .filter(|&c| c >= 0)
    .ok_or_else(|| AnalysisError::Protocol("blob payload without component count".into()))?
    as usize;
  let expected = 1 + 3 * count + 2 * face_total(interior);
  if payload.len() != expected {
    return Err(AnalysisError::Protocol(format!(
      "blob payload has {} values, expected {expected}",
      payload.len()
    )));
  }

  let stats = payload[1..1 + 3 * count]
    .chunks_exact(3)
    .map(|c| [c[0], c[1], c[2]])
    .collect();
  let mut rest = &payload[1 + 3 * count..];
  let mut faces: [&[i64]; 6] = [&[]; 6];
  for (k, slot) in faces.iter_mut().enumerate() {
    let (head, tail) = rest.split_at(face_len(interior, k / 2));
    *slot = head;
    rest = tail;
  }

  for face in faces {
    if face.iter().any(|&l| l >= count as i64) {
      return Err(AnalysisError::Protocol("blob face label out of range".into()));
    }
  }
  Ok(RankPayload { stats, faces })
}
