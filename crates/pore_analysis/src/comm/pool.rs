//! Pool of duplicated communicators leased to background tasks.
//!
//! Background tasks run collectives at arbitrary times while the main loop
//! issues its own. Each task therefore leases a private duplicate.
//!
//! Slot selection is made by rank 0 and broadcast, so every rank leases the
//! same slot for the same task. When the pool is exhausted rank 0 broadcasts
//! `-1` and every rank fails identically.

use std::sync::{Arc, Mutex, PoisonError};

use super::Communicator;
use crate::constants::COMM_POOL_CAPACITY;
use crate::error::{AnalysisError, Result};

struct Slot {
  comm: Option<Arc<dyn Communicator>>,
  used: bool,
}

struct PoolInner {
  /// Communicator used for the slot broadcast itself.
  control: Arc<dyn Communicator>,
  /// Communicator that slots are duplicated from.
  base: Arc<dyn Communicator>,
  slots: Mutex<Vec<Slot>>,
}

impl PoolInner {
  fn release(&self, slot: usize) {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots[slot].used = false;
  }
}

/// Fixed-size pool of lazily duplicated communicators.
#[derive(Clone)]
pub struct CommPool {
  inner: Arc<PoolInner>,
}

impl CommPool {
  pub fn new(base: Arc<dyn Communicator>) -> Self {
    Self::with_capacity(base, COMM_POOL_CAPACITY)
  }

  pub fn with_capacity(base: Arc<dyn Communicator>, capacity: usize) -> Self {
    let control = base.duplicate();
    let slots = (0..capacity)
      .map(|_| Slot {
        comm: None,
        used: false,
      })
      .collect();
    Self {
      inner: Arc::new(PoolInner {
        control,
        base,
        slots: Mutex::new(slots),
      }),
    }
  }

  pub fn capacity(&self) -> usize {
    self.lock_slots().len()
  }

  /// Number of slots currently leased on this rank.
  pub fn in_use(&self) -> usize {
    self.lock_slots().iter().filter(|s| s.used).count()
  }

  /// Number of slots that already hold a duplicated communicator.
  pub fn duplicated(&self) -> usize {
    self.lock_slots().iter().filter(|s| s.comm.is_some()).count()
  }

  /// Lease a communicator. Collective over the pool's ranks.
  pub fn get_comm(&self) -> Result<CommLease> {
    let mut tag = -1i64;
    if self.inner.control.rank() == 0 {
      if let Some(free) = self.lock_slots().iter().position(|s| !s.used) {
        tag = free as i64;
      }
    }
    let tag = self.inner.control.broadcast_i64(tag, 0);
    if tag < 0 {
      return Err(AnalysisError::CommPoolExhausted {
        capacity: self.capacity(),
      });
    }
    let slot = tag as usize;

    let comm = {
      let mut slots = self.lock_slots();
      let entry = slots.get_mut(slot).ok_or_else(|| {
        AnalysisError::Protocol(format!("root selected communicator slot {slot} out of range"))
      })?;
      entry.used = true;
      let base = &self.inner.base;
      Arc::clone(entry.comm.get_or_insert_with(|| base.duplicate()))
    };

    tracing::trace!(slot, "leased communicator");
    Ok(CommLease {
      slot: Some(slot),
      comm,
      pool: Arc::clone(&self.inner),
    })
  }

  fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
    self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Exclusive lease on one pooled communicator.
///
/// Dropping the lease waits on a barrier (all ranks finished with it) and
/// returns the slot.
pub struct CommLease {
  slot: Option<usize>,
  comm: Arc<dyn Communicator>,
  pool: Arc<PoolInner>,
}

impl CommLease {
  pub fn comm(&self) -> &dyn Communicator {
    self.comm.as_ref()
  }

  pub fn slot(&self) -> Option<usize> {
    self.slot
  }
}

impl std::fmt::Debug for CommLease {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CommLease").field("slot", &self.slot).finish()
  }
}

impl Drop for CommLease {
  fn drop(&mut self) {
    if let Some(slot) = self.slot.take() {
      self.comm.barrier();
      self.pool.release(slot);
      tracing::trace!(slot, "released communicator");
    }
  }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
