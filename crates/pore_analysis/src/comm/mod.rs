//! Collective communication seam.
//!
//! The pipeline only needs a handful of collectives, expressed by the
//! [`Communicator`] trait. Two transports ship with the crate:
//!
//! - [`SelfComm`]: a single rank, every collective is the identity.
//! - [`ThreadWorld`]: N ranks inside one process, one thread per rank. Used by
//!   the driver and the multi-rank tests.
//!
//! A distributed transport (MPI or similar) implements the same trait.
//!
//! Every method is collective: all ranks of a communicator must call it in
//! the same order, or the call blocks forever.

use std::sync::Arc;

use crate::error::Result;

pub mod pool;
pub mod thread_world;

pub use pool::{CommLease, CommPool};
pub use thread_world::{ThreadComm, ThreadWorld};

/// Element-wise reduction applied by `all_reduce_f64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
  Sum,
  Min,
  Max,
}

impl ReduceOp {
  #[inline]
  pub fn apply(self, a: f64, b: f64) -> f64 {
    match self {
      ReduceOp::Sum => a + b,
      ReduceOp::Min => a.min(b),
      ReduceOp::Max => a.max(b),
    }
  }
}

/// Collective transport between the ranks of one simulation.
pub trait Communicator: Send + Sync {
  fn rank(&self) -> usize;

  fn size(&self) -> usize;

  fn barrier(&self);

  /// Every rank receives `value` as passed by `root`.
  fn broadcast_i64(&self, value: i64, root: usize) -> i64;

  /// Every rank receives every rank's payload, indexed by rank.
  fn all_gather_i64(&self, values: Vec<i64>) -> Result<Vec<Vec<i64>>>;

  /// Element-wise reduction over equally sized slices.
  fn all_reduce_f64(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>>;

  /// Create an independent communicator over the same ranks.
  fn duplicate(&self) -> Arc<dyn Communicator>;

  /// Whether collectives may be issued from several threads at once.
  fn supports_threads(&self) -> bool {
    true
  }
}

/// Single-rank communicator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
  fn rank(&self) -> usize {
    0
  }

  fn size(&self) -> usize {
    1
  }

  fn barrier(&self) {}

  fn broadcast_i64(&self, value: i64, _root: usize) -> i64 {
    value
  }

  fn all_gather_i64(&self, values: Vec<i64>) -> Result<Vec<Vec<i64>>> {
    Ok(vec![values])
  }

  fn all_reduce_f64(&self, values: &[f64], _op: ReduceOp) -> Result<Vec<f64>> {
    Ok(values.to_vec())
  }

  fn duplicate(&self) -> Arc<dyn Communicator> {
    Arc::new(SelfComm)
  }
}
