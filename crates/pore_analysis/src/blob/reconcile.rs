//! Timestep-to-timestep blob ID reconciliation.
//!
//! The overlap between the previous step's global IDs and the current raw
//! labels forms a bipartite graph. Each connected component of that graph is
//! one event:
//!
//! | old | new  | event         |
//! |-----|------|---------------|
//! | 0   | 1    | created       |
//! | 1   | 0    | destroyed     |
//! | 1   | 1    | `src_dst`     |
//! | 1   | many | `split`       |
//! | many| 1    | `merge`       |
//! | many| many | `merge_split` |

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use super::label::LabeledBlobs;
use super::types::{BlobId, BlobIdList, BlobIds, IdCounter};
use super::DisjointSet;
use crate::array::IntArray;
use crate::comm::Communicator;
use crate::error::{AnalysisError, Result};

/// Events between two consecutive labelings.
///
/// Produced in terms of raw labels by [`compute_id_map`] and rewritten into
/// global ID space by [`get_new_ids`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMap {
  pub created: Vec<BlobId>,
  pub destroyed: Vec<BlobId>,
  pub src_dst: Vec<(BlobId, BlobId)>,
  pub split: Vec<(BlobId, Vec<BlobId>)>,
  pub merge: Vec<(Vec<BlobId>, BlobId)>,
  pub merge_split: Vec<(Vec<BlobId>, Vec<BlobId>)>,
  /// Global voxel overlap `(old, new, voxels)`, sorted by `(old, new)`.
  pub overlaps: Vec<(BlobId, BlobId, u64)>,
}

impl IdMap {
  /// Map of a first labeling: every component is new.
  pub fn all_created(count: usize) -> Self {
    Self {
      created: (0..count as BlobId).collect(),
      ..Self::default()
    }
  }
}

/// Result of reconciling one labeling.
#[derive(Clone, Debug)]
pub struct Reconciled {
  /// Labels rewritten into global IDs.
  pub ids: BlobIds,
  /// Descriptors in raw-label order carrying their global ID.
  pub list: BlobIdList,
  pub map: IdMap,
}

/// Classify the overlap between `old` (global IDs) and `new` (raw labels).
///
/// Collective over `comm`: overlap counts are summed over every rank.
pub fn compute_id_map(
  old: &IntArray,
  new: &IntArray,
  new_count: usize,
  comm: &dyn Communicator,
) -> Result<IdMap> {
  if old.dims() != new.dims() {
    return Err(AnalysisError::DimensionMismatch {
      previous: old.dims(),
      current: new.dims(),
    });
  }

  let [nx, ny, nz] = new.dims();
  let mut overlaps: BTreeMap<(BlobId, BlobId), u64> = BTreeMap::new();
  let mut olds: BTreeSet<BlobId> = BTreeSet::new();
  for z in 1..nz.saturating_sub(1) {
    for y in 1..ny.saturating_sub(1) {
      for x in 1..nx.saturating_sub(1) {
        let (o, n) = (old[(x, y, z)], new[(x, y, z)]);
        if o >= 0 {
          olds.insert(o);
          if n >= 0 {
            *overlaps.entry((o, n)).or_default() += 1;
          }
        }
      }
    }
  }

  let mut payload = Vec::with_capacity(1 + 3 * overlaps.len() + olds.len());
  payload.push(overlaps.len() as i64);
  for (&(o, n), &c) in &overlaps {
    payload.extend([o as i64, n as i64, c as i64]);
  }
  payload.extend(olds.iter().map(|&o| o as i64));

  let mut overlaps: BTreeMap<(BlobId, BlobId), u64> = BTreeMap::new();
  let mut olds: BTreeSet<BlobId> = BTreeSet::new();
  for rank in comm.all_gather_i64(payload)? {
    let pairs = rank.first().copied().unwrap_or(-1);
    if pairs < 0 || rank.len() < 1 + 3 * pairs as usize {
      return Err(AnalysisError::Protocol("malformed overlap payload".into()));
    }
    let (head, tail) = rank[1..].split_at(3 * pairs as usize);
    for pair in head.chunks_exact(3) {
      let (o, n) = (pair[0] as BlobId, pair[1] as BlobId);
      if n < 0 || n as usize >= new_count {
        return Err(AnalysisError::Protocol(format!("overlap references unknown blob {n}")));
      }
      *overlaps.entry((o, n)).or_default() += pair[2] as u64;
    }
    olds.extend(tail.iter().map(|&o| o as BlobId));
  }

  // Bipartite components: old IDs first, then raw labels
  let old_index: BTreeMap<BlobId, usize> = olds.iter().enumerate().map(|(i, &o)| (o, i)).collect();
  let n_old = old_index.len();
  let mut sets = DisjointSet::new(n_old + new_count);
  for &(o, n) in overlaps.keys() {
    sets.union(old_index[&o], n_old + n as usize);
  }

  let mut groups: BTreeMap<usize, (Vec<BlobId>, Vec<BlobId>)> = BTreeMap::new();
  for (&o, &i) in &old_index {
    groups.entry(sets.find(i)).or_default().0.push(o);
  }
  for n in 0..new_count {
    groups
      .entry(sets.find(n_old + n))
      .or_default()
      .1
      .push(n as BlobId);
  }

  let mut map = IdMap {
    overlaps: overlaps.into_iter().map(|((o, n), c)| (o, n, c)).collect(),
    ..IdMap::default()
  };
  for (_, (src, dst)) in groups {
    match (src.len(), dst.len()) {
      (0, _) => map.created.extend(dst),
      (_, 0) => map.destroyed.extend(src),
      (1, 1) => map.src_dst.push((src[0], dst[0])),
      (1, _) => map.split.push((src[0], dst)),
      (_, 1) => map.merge.push((src, dst[0])),
      _ => map.merge_split.push((src, dst)),
    }
  }
  sort_events(&mut map);
  Ok(map)
}

fn sort_events(map: &mut IdMap) {
  map.created.sort_unstable();
  map.destroyed.sort_unstable();
  map.src_dst.sort_unstable();
  map.split.sort_by_key(|(s, _)| *s);
  map.merge.sort_by_key(|(_, d)| *d);
  map.merge_split.sort_by(|a, b| a.0.cmp(&b.0));
}

/// Assign global IDs to the `new_count` raw labels and rewrite `map` into
/// global ID space. Returns the raw label to global ID table.
///
/// Overlaps are visited largest first (ties by `(old, new)`); a raw label
/// inherits an old ID when neither has been matched yet. Remaining labels
/// draw fresh IDs from `counter` in ascending raw order.
pub fn get_new_ids(map: &mut IdMap, counter: &IdCounter, new_count: usize) -> Vec<BlobId> {
  let mut assigned: Vec<BlobId> = vec![-1; new_count];
  let mut taken: HashSet<BlobId> = HashSet::new();

  let mut pairs = map.overlaps.clone();
  pairs.sort_by(|a, b| b.2.cmp(&a.2).then((a.0, a.1).cmp(&(b.0, b.1))));
  for (old, new, _) in pairs {
    let Some(slot) = assigned.get_mut(new as usize) else {
      continue;
    };
    if *slot < 0 && !taken.contains(&old) {
      *slot = old;
      taken.insert(old);
    }
  }
  for slot in assigned.iter_mut().filter(|s| **s < 0) {
    *slot = counter.next_id();
  }

  let global = |n: &BlobId| assigned.get(*n as usize).copied().unwrap_or(*n);
  let globals = |ns: &Vec<BlobId>| ns.iter().map(global).collect::<Vec<_>>();
  map.created = map.created.iter().map(global).collect();
  map.src_dst = map.src_dst.iter().map(|(s, d)| (*s, global(d))).collect();
  map.split = map.split.iter().map(|(s, d)| (*s, globals(d))).collect();
  map.merge = map.merge.iter().map(|(s, d)| (s.clone(), global(d))).collect();
  map.merge_split = map
    .merge_split
    .iter()
    .map(|(s, d)| (s.clone(), globals(d)))
    .collect();
  map.overlaps = map
    .overlaps
    .iter()
    .map(|(o, n, c)| (*o, global(n), *c))
    .collect();
  assigned
}

/// Rewrite raw labels in place with their global IDs.
pub fn renumber_ids(table: &[BlobId], labels: &mut IntArray) -> Result<()> {
  for label in labels.as_mut_slice() {
    if *label >= 0 {
      *label = *table
        .get(*label as usize)
        .ok_or_else(|| AnalysisError::Protocol(format!("raw label {label} has no global ID")))?;
    }
  }
  Ok(())
}

/// One log line: `<t>: -<created> <destroyed>- <src>-<dst> <src>-<d1>/<d2> ...`
///
/// Identity `src_dst` pairs are left out.
pub fn format_id_map(map: &IdMap, timestep: i64) -> String {
  fn join(ids: &[BlobId]) -> String {
    ids
      .iter()
      .map(|id| id.to_string())
      .collect::<Vec<_>>()
      .join("/")
  }

  let mut line = format!("{timestep}:");
  for id in &map.created {
    let _ = write!(line, " -{id}");
  }
  for id in &map.destroyed {
    let _ = write!(line, " {id}-");
  }
  for (src, dst) in &map.src_dst {
    if src != dst {
      let _ = write!(line, " {src}-{dst}");
    }
  }
  for (src, dst) in &map.split {
    let _ = write!(line, " {src}-{}", join(dst));
  }
  for (src, dst) in &map.merge {
    let _ = write!(line, " {}-{dst}", join(src));
  }
  for (src, dst) in &map.merge_split {
    let _ = write!(line, " {}-{}", join(src), join(dst));
  }
  line
}

/// Append the map line for `timestep`. Timestep 0 starts a new file.
pub fn write_id_map(path: &Path, map: &IdMap, timestep: i64) -> Result<()> {
  let mut file = OpenOptions::new()
    .create(true)
    .write(true)
    .append(timestep != 0)
    .truncate(timestep == 0)
    .open(path)
    .map_err(|e| AnalysisError::io(path, e))?;
  writeln!(file, "{}", format_id_map(map, timestep)).map_err(|e| AnalysisError::io(path, e))
}

/// Turn a raw labeling into time-consistent global IDs.
///
/// Without a `previous` labeling the counter restarts and every component is
/// created. Rank 0 appends the map to `id_map_path`.
pub fn reconcile_blob_ids(
  timestep: i64,
  raw: &LabeledBlobs,
  previous: Option<&BlobIds>,
  counter: &IdCounter,
  id_map_path: &Path,
  comm: &dyn Communicator,
) -> Result<Reconciled> {
  let count = raw.ids.count;
  let mut map = match previous {
    Some(previous) => compute_id_map(&previous.labels, &raw.ids.labels, count, comm)?,
    None => {
      counter.reset();
      IdMap::all_created(count)
    }
  };
  let table = get_new_ids(&mut map, counter, count);

  let mut labels = raw.ids.labels.clone();
  renumber_ids(&table, &mut labels)?;
  let list = raw
    .descriptors
    .iter()
    .zip(&table)
    .map(|(d, &id)| super::BlobDescriptor { id, ..*d })
    .collect();

  if comm.rank() == 0 {
    write_id_map(id_map_path, &map, timestep)?;
  }
  tracing::debug!(
    timestep,
    created = map.created.len(),
    destroyed = map.destroyed.len(),
    max_id = counter.get(),
    "reconciled blob ids"
  );
  Ok(Reconciled {
    ids: BlobIds { count, labels },
    list,
    map,
  })
}
