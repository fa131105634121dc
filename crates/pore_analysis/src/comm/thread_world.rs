//! In-process multi-rank transport: each rank is a thread.
//!
//! Collectives rendezvous on a shared [`std::sync::Barrier`]. Each rank
//! deposits its payload in a slot, waits, reads every slot, then waits again
//! so no rank overwrites a slot before all peers have read it.
//!
//! `duplicate` is matched across ranks by call order. The n-th duplicate of a
//! communicator on every rank resolves to the same shared context, so ranks
//! must duplicate in the same order (as they must for any collective).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};

use super::{Communicator, ReduceOp};
use crate::error::{AnalysisError, Result};

#[derive(Clone, Debug)]
enum Payload {
  Empty,
  Int(Vec<i64>),
  Float(Vec<f64>),
}

/// Shared state of one communicator across its ranks.
struct Context {
  id: u64,
  size: usize,
  barrier: Barrier,
  slots: Mutex<Vec<Payload>>,
}

impl Context {
  fn new(id: u64, size: usize) -> Self {
    Self {
      id,
      size,
      barrier: Barrier::new(size),
      slots: Mutex::new(vec![Payload::Empty; size]),
    }
  }
}

/// Contexts created by `duplicate`, keyed by (parent id, duplicate index).
struct Registry {
  next_id: AtomicU64,
  contexts: Mutex<HashMap<(u64, u64), Arc<Context>>>,
}

/// Factory for a set of connected in-process ranks.
pub struct ThreadWorld;

impl ThreadWorld {
  /// Create `size` communicators, one per rank, sharing one world context.
  ///
  /// Hand each communicator to its own thread.
  pub fn create(size: usize) -> Vec<ThreadComm> {
    let size = size.max(1);
    let registry = Arc::new(Registry {
      next_id: AtomicU64::new(1),
      contexts: Mutex::new(HashMap::new()),
    });
    let world = Arc::new(Context::new(0, size));
    (0..size)
      .map(|rank| ThreadComm {
        rank,
        ctx: Arc::clone(&world),
        registry: Arc::clone(&registry),
        dup_count: AtomicU64::new(0),
      })
      .collect()
  }
}

/// One rank's handle onto an in-process communicator.
pub struct ThreadComm {
  rank: usize,
  ctx: Arc<Context>,
  registry: Arc<Registry>,
  dup_count: AtomicU64,
}

impl ThreadComm {
  fn exchange(&self, payload: Payload) -> Vec<Payload> {
    {
      let mut slots = self.ctx.slots.lock().unwrap_or_else(PoisonError::into_inner);
      slots[self.rank] = payload;
    }
    self.ctx.barrier.wait();
    let gathered = self
      .ctx
      .slots
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    self.ctx.barrier.wait();
    gathered
  }
}

impl Communicator for ThreadComm {
  fn rank(&self) -> usize {
    self.rank
  }

  fn size(&self) -> usize {
    self.ctx.size
  }

  fn barrier(&self) {
    self.ctx.barrier.wait();
  }

  fn broadcast_i64(&self, value: i64, root: usize) -> i64 {
    match self.exchange(Payload::Int(vec![value])).swap_remove(root) {
      Payload::Int(v) => v.first().copied().unwrap_or(value),
      _ => value,
    }
  }

  fn all_gather_i64(&self, values: Vec<i64>) -> Result<Vec<Vec<i64>>> {
    self
      .exchange(Payload::Int(values))
      .into_iter()
      .enumerate()
      .map(|(rank, payload)| match payload {
        Payload::Int(v) => Ok(v),
        other => Err(AnalysisError::Protocol(format!(
          "rank {rank} sent {other:?} to an integer gather"
        ))),
      })
      .collect()
  }

  fn all_reduce_f64(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
    let gathered = self.exchange(Payload::Float(values.to_vec()));
    // Folded in rank order on every rank, so all ranks get bit-identical sums
    let mut out: Option<Vec<f64>> = None;
    for (rank, payload) in gathered.into_iter().enumerate() {
      let Payload::Float(theirs) = payload else {
        return Err(AnalysisError::Protocol(format!(
          "rank {rank} joined a float reduction with a different payload"
        )));
      };
      if theirs.len() != values.len() {
        return Err(AnalysisError::Protocol(format!(
          "rank {rank} reduced {} values, rank {} reduced {}",
          theirs.len(),
          self.rank,
          values.len()
        )));
      }
      out = Some(match out {
        None => theirs,
        Some(mut acc) => {
          for (a, b) in acc.iter_mut().zip(theirs) {
            *a = op.apply(*a, b);
          }
          acc
        }
      });
    }
    Ok(out.unwrap_or_default())
  }

  fn duplicate(&self) -> Arc<dyn Communicator> {
    let seq = self.dup_count.fetch_add(1, Ordering::SeqCst);
    let ctx = {
      let mut contexts = self
        .registry
        .contexts
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      let size = self.ctx.size;
      let registry = &self.registry;
      Arc::clone(contexts.entry((self.ctx.id, seq)).or_insert_with(|| {
        Arc::new(Context::new(registry.next_id.fetch_add(1, Ordering::SeqCst), size))
      }))
    };
    Arc::new(ThreadComm {
      rank: self.rank,
      ctx,
      registry: Arc::clone(&self.registry),
      dup_count: AtomicU64::new(0),
    })
  }
}
