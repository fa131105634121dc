//! Blob identification across ranks and timesteps.
//!
//! Identification runs as two chained tasks:
//!
//! ```text
//!   phase, dist ──► label ──► raw BlobIds ──► reconcile ──► BlobIds (global IDs)
//!                     │                          ▲              │
//!                     │                          │              ▼
//!                 all_gather                previous BlobIds   lbpm_id_map.txt
//! ```
//!
//! - `label`: connected components of the blob voxels, merged across rank
//!   boundaries. Raw labels are ordered by volume.
//! - `reconcile`: overlap with the previous step's labels, classification of
//!   the events (created, destroyed, split, merge) and renumbering into
//!   time-consistent IDs.

mod label;
mod reconcile;
mod types;

pub use label::{compute_global_blob_ids, LabeledBlobs};
pub use reconcile::{
  compute_id_map, format_id_map, get_new_ids, reconcile_blob_ids, renumber_ids, write_id_map,
  IdMap, Reconciled,
};
pub use types::{
  BlobDescriptor, BlobId, BlobIdList, BlobIdSlot, BlobIds, BlobListSlot, IdCounter, SharedSlot,
};

/// Union-find with path halving and union by size.
pub(crate) struct DisjointSet {
  parent: Vec<usize>,
  size: Vec<usize>,
}

impl DisjointSet {
  pub(crate) fn new(n: usize) -> Self {
    Self {
      parent: (0..n).collect(),
      size: vec![1; n],
    }
  }

  pub(crate) fn find(&mut self, mut x: usize) -> usize {
    while self.parent[x] != x {
      self.parent[x] = self.parent[self.parent[x]];
      x = self.parent[x];
    }
    x
  }

  pub(crate) fn union(&mut self, a: usize, b: usize) {
    let (mut a, mut b) = (self.find(a), self.find(b));
    if a == b {
      return;
    }
    if self.size[a] < self.size[b] {
      std::mem::swap(&mut a, &mut b);
    }
    self.parent[b] = a;
    self.size[a] += self.size[b];
  }
}

#[cfg(test)]
#[path = "blob_test.rs"]
mod blob_test;
