use std::sync::Arc;
use std::thread;

use super::*;
use crate::array::{DoubleArray, IntArray};
use crate::comm::{Communicator, SelfComm, ThreadWorld};
use crate::constants::{BLOB_VF, BLOB_VS};
use crate::domain::RankInfo;
use crate::error::AnalysisError;

/// Fill a rank's subdomain (halo included) from a function of global
/// interior coordinates. Voxels outside the global domain get -1.
fn global_field(
  info: &RankInfo,
  dims: [usize; 3],
  f: impl Fn(i64, i64, i64) -> f64,
) -> DoubleArray {
  let interior = dims.map(|n| n - 2);
  let offset = info.global_offset(interior);
  let global = info.global_dims(interior);
  let mut out = DoubleArray::new(dims[0], dims[1], dims[2], -1.0);
  for z in 0..dims[2] {
    for y in 0..dims[1] {
      for x in 0..dims[0] {
        let g = [
          offset[0] as i64 + x as i64 - 1,
          offset[1] as i64 + y as i64 - 1,
          offset[2] as i64 + z as i64 - 1,
        ];
        let inside = (0..3).all(|a| g[a] >= 0 && g[a] < global[a] as i64);
        if inside {
          out[(x, y, z)] = f(g[0], g[1], g[2]);
        }
      }
    }
  }
  out
}

fn open_dist(dims: [usize; 3]) -> DoubleArray {
  DoubleArray::new(dims[0], dims[1], dims[2], 1.0)
}

fn label_single(phase: &DoubleArray, periodic: bool) -> LabeledBlobs {
  let info = RankInfo::new(0, [1, 1, 1]);
  compute_global_blob_ids(
    phase,
    &open_dist(phase.dims()),
    &info,
    periodic,
    BLOB_VF,
    BLOB_VS,
    &SelfComm,
  )
  .unwrap()
}

// =============================================================================
// Labeling
// =============================================================================

#[test]
fn test_single_rank_orders_by_volume() {
  let mut phase = DoubleArray::new(7, 5, 5, -1.0);
  // Small blob first in scan order, larger blob later
  phase[(1, 1, 1)] = 1.0;
  for x in 3..6 {
    phase[(x, 3, 3)] = 1.0;
  }

  let labeled = label_single(&phase, false);
  assert_eq!(labeled.ids.count, 2);
  assert_eq!(labeled.ids.labels[(3, 3, 3)], 0);
  assert_eq!(labeled.ids.labels[(1, 1, 1)], 1);
  assert_eq!(
    labeled.descriptors,
    vec![
      BlobDescriptor {
        id: 0,
        volume: 3,
        surface: 14
      },
      BlobDescriptor {
        id: 1,
        volume: 1,
        surface: 6
      },
    ]
  );
  // Halo and background stay unlabeled
  assert_eq!(labeled.ids.labels[(0, 0, 0)], -1);
  assert_eq!(labeled.ids.labels[(2, 2, 2)], -1);
}

#[test]
fn test_equal_volumes_tie_on_position() {
  let mut phase = DoubleArray::new(6, 5, 5, -1.0);
  phase[(4, 3, 3)] = 1.0;
  phase[(1, 1, 1)] = 1.0;

  let labeled = label_single(&phase, false);
  assert_eq!(labeled.ids.labels[(1, 1, 1)], 0);
  assert_eq!(labeled.ids.labels[(4, 3, 3)], 1);
}

#[test]
fn test_solid_buffer_excludes_voxels() {
  let mut phase = DoubleArray::new(5, 5, 5, -1.0);
  phase[(2, 2, 2)] = 1.0;
  let mut dist = open_dist(phase.dims());
  dist[(2, 2, 2)] = -1.0;

  let info = RankInfo::new(0, [1, 1, 1]);
  let labeled =
    compute_global_blob_ids(&phase, &dist, &info, false, BLOB_VF, BLOB_VS, &SelfComm).unwrap();
  assert_eq!(labeled.ids.count, 0);
}

#[test]
fn test_periodic_wrap_joins_faces() {
  let mut phase = DoubleArray::new(6, 5, 5, -1.0);
  phase[(1, 2, 2)] = 1.0;
  phase[(4, 2, 2)] = 1.0;

  assert_eq!(label_single(&phase, false).ids.count, 2);

  let wrapped = label_single(&phase, true);
  assert_eq!(wrapped.ids.count, 1);
  assert_eq!(wrapped.descriptors[0].volume, 2);
}

#[test]
fn test_blob_spanning_ranks_is_merged() {
  let dims = [6, 5, 5];
  let nproc = [2, 1, 1];

  let handles: Vec<_> = ThreadWorld::create(2)
    .into_iter()
    .map(|comm| {
      thread::spawn(move || {
        let info = RankInfo::new(comm.rank(), nproc);
        let phase = global_field(&info, dims, |x, y, z| {
          let line = (2..=5).contains(&x) && y == 1 && z == 1;
          let dot = x == 7 && y == 0 && z == 0;
          if line || dot {
            1.0
          } else {
            -1.0
          }
        });
        let labeled = compute_global_blob_ids(
          &phase,
          &open_dist(dims),
          &info,
          false,
          BLOB_VF,
          BLOB_VS,
          &comm,
        )
        .unwrap();
        (comm.rank(), labeled)
      })
    })
    .collect();

  for handle in handles {
    let (rank, labeled) = handle.join().unwrap();
    assert_eq!(labeled.ids.count, 2);
    assert_eq!(
      labeled.descriptors,
      vec![
        BlobDescriptor {
          id: 0,
          volume: 4,
          surface: 18
        },
        BlobDescriptor {
          id: 1,
          volume: 1,
          surface: 6
        },
      ]
    );
    if rank == 0 {
      assert_eq!(labeled.ids.labels[(3, 2, 2)], 0);
      assert_eq!(labeled.ids.labels[(4, 2, 2)], 0);
    } else {
      assert_eq!(labeled.ids.labels[(1, 2, 2)], 0);
      assert_eq!(labeled.ids.labels[(4, 1, 1)], 1);
    }
  }
}

#[test]
fn test_rank_count_must_match_grid() {
  let phase = DoubleArray::new(5, 5, 5, -1.0);
  let info = RankInfo::new(0, [2, 1, 1]);
  let err = compute_global_blob_ids(
    &phase,
    &open_dist(phase.dims()),
    &info,
    false,
    BLOB_VF,
    BLOB_VS,
    &SelfComm,
  )
  .unwrap_err();
  assert!(matches!(err, AnalysisError::Protocol(_)));
}

// =============================================================================
// Reconciliation
// =============================================================================

fn labels_with(entries: &[((usize, usize, usize), i32)]) -> IntArray {
  let mut labels = IntArray::new(5, 5, 5, -1);
  for &(pos, id) in entries {
    labels[pos] = id;
  }
  labels
}

#[test]
fn test_id_map_classifies_events() {
  let old = labels_with(&[
    ((1, 1, 1), 3),
    ((2, 1, 1), 3),
    ((3, 1, 1), 3),
    ((1, 3, 1), 5),
    ((3, 3, 1), 7),
    ((2, 2, 3), 9),
  ]);
  let new = labels_with(&[
    ((1, 1, 1), 0),
    ((2, 1, 1), 0),
    ((3, 1, 1), 1),
    ((1, 3, 1), 2),
    ((3, 3, 1), 2),
    ((1, 1, 3), 3),
  ]);

  let mut map = compute_id_map(&old, &new, 4, &SelfComm).unwrap();
  assert_eq!(map.created, vec![3]);
  assert_eq!(map.destroyed, vec![9]);
  assert_eq!(map.split, vec![(3, vec![0, 1])]);
  assert_eq!(map.merge, vec![(vec![5, 7], 2)]);
  assert!(map.src_dst.is_empty());

  let counter = IdCounter::new();
  for _ in 0..10 {
    counter.next_id();
  }
  assert_eq!(counter.get(), 9);

  let table = get_new_ids(&mut map, &counter, 4);
  assert_eq!(table, vec![3, 10, 5, 11]);
  assert_eq!(counter.get(), 11);
  assert_eq!(format_id_map(&map, 4), "4: -11 9- 3-3/10 5/7-5");
}

#[test]
fn test_identity_pairs_are_omitted() {
  let map = IdMap {
    src_dst: vec![(2, 2), (4, 6)],
    ..IdMap::default()
  };
  assert_eq!(format_id_map(&map, 1), "1: 4-6");
  assert_eq!(format_id_map(&IdMap::default(), 0), "0:");
}

#[test]
fn test_dimension_mismatch_is_fatal() {
  let old = IntArray::new(5, 5, 5, -1);
  let new = IntArray::new(6, 5, 5, -1);
  let err = compute_id_map(&old, &new, 0, &SelfComm).unwrap_err();
  assert!(matches!(
    err,
    AnalysisError::DimensionMismatch {
      previous: [5, 5, 5],
      current: [6, 5, 5]
    }
  ));
}

fn raw(labels: IntArray, volumes: &[u64]) -> LabeledBlobs {
  LabeledBlobs {
    ids: BlobIds {
      count: volumes.len(),
      labels,
    },
    descriptors: volumes
      .iter()
      .enumerate()
      .map(|(id, &volume)| BlobDescriptor {
        id: id as i32,
        volume,
        surface: 0,
      })
      .collect(),
  }
}

#[test]
fn test_first_reconcile_creates_everything() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("ids.txt");
  let counter = IdCounter::new();
  counter.next_id();
  counter.next_id();

  let first = raw(labels_with(&[((1, 1, 1), 0), ((3, 3, 3), 1)]), &[1, 1]);
  let out = reconcile_blob_ids(0, &first, None, &counter, &path, &SelfComm).unwrap();
  assert_eq!(out.map.created, vec![0, 1]);
  assert_eq!(counter.get(), 1);
  assert_eq!(out.ids.labels, first.ids.labels);
  assert_eq!(std::fs::read_to_string(&path).unwrap(), "0: -0 -1\n");
}

#[test]
fn test_ids_follow_blobs_and_never_decrease() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("ids.txt");
  let counter = IdCounter::new();

  let step0 = raw(labels_with(&[((1, 1, 1), 0), ((3, 3, 3), 1)]), &[1, 1]);
  let out0 = reconcile_blob_ids(0, &step0, None, &counter, &path, &SelfComm).unwrap();

  // Raw order flips: the blob at (3,3,3) is now raw 0, plus a new one
  let step1 = raw(
    labels_with(&[((3, 3, 3), 0), ((1, 1, 1), 1), ((2, 2, 2), 2)]),
    &[1, 1, 1],
  );
  let out1 = reconcile_blob_ids(1, &step1, Some(&out0.ids), &counter, &path, &SelfComm).unwrap();
  assert_eq!(out1.ids.labels[(3, 3, 3)], 1);
  assert_eq!(out1.ids.labels[(1, 1, 1)], 0);
  assert_eq!(out1.ids.labels[(2, 2, 2)], 2);
  let ids: Vec<_> = out1.list.iter().map(|d| d.id).collect();
  assert_eq!(ids, vec![1, 0, 2]);

  // Everything vanishes, the counter keeps its high-water mark
  let step2 = raw(IntArray::new(5, 5, 5, -1), &[]);
  let out2 = reconcile_blob_ids(2, &step2, Some(&out1.ids), &counter, &path, &SelfComm).unwrap();
  assert_eq!(out2.map.destroyed, vec![0, 1, 2]);
  assert_eq!(counter.get(), 2);

  let log = std::fs::read_to_string(&path).unwrap();
  assert_eq!(log, "0: -0 -1\n1: -2\n2: 0- 1- 2-\n");
}

#[test]
fn test_id_map_sums_overlaps_across_ranks() {
  let handles: Vec<_> = ThreadWorld::create(2)
    .into_iter()
    .map(|comm| {
      thread::spawn(move || {
        // Old blob 4 lives on both ranks; on rank 1 it shows up as raw 1
        let (old, new) = if comm.rank() == 0 {
          (
            labels_with(&[((1, 1, 1), 4), ((2, 1, 1), 4)]),
            labels_with(&[((1, 1, 1), 0), ((2, 1, 1), 0)]),
          )
        } else {
          (
            labels_with(&[((1, 1, 1), 4)]),
            labels_with(&[((1, 1, 1), 1)]),
          )
        };
        let comm: Arc<dyn Communicator> = Arc::new(comm);
        compute_id_map(&old, &new, 2, comm.as_ref()).unwrap()
      })
    })
    .collect();

  for handle in handles {
    let map = handle.join().unwrap();
    assert_eq!(map.split, vec![(4, vec![0, 1])]);
    assert_eq!(map.overlaps, vec![(4, 0, 2), (4, 1, 1)]);
  }
}

#[test]
fn test_shared_slot_publishes_once() {
  let slot: SharedSlot<i32> = SharedSlot::new();
  let reader = slot.clone();
  assert!(!reader.is_published());
  assert!(matches!(
    reader.require("value"),
    Err(AnalysisError::MissingInput("value"))
  ));
  slot.publish(3).unwrap();
  assert!(reader.is_published());
  assert!(slot.publish(4).is_err());
  assert_eq!(reader.get(), Some(&3));
}
