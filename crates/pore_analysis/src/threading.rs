//! Dependency-aware task pool on top of rayon.
//!
//! Work items are submitted together with the handles of the tasks they
//! depend on. A task is handed to rayon (`spawn_fifo`) only once every
//! dependency has finished, so dependency edges are the only ordering
//! primitive; independent tasks run concurrently.
//!
//! # Usage
//!
//! ```ignore
//! let pool = TaskPool::new(4)?;
//!
//! let label = pool.submit("label", &[], move || label_blobs());
//! let reconcile = pool.submit("reconcile", &[label.clone()], move || reconcile());
//!
//! // Block until every submitted task is done
//! pool.wait_pool_finished()?;
//! ```
//!
//! With zero threads the pool runs every task inline inside `submit`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use core_affinity::CoreId;

use crate::error::{AnalysisError, Result};

/// Unique identifier for a submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
  fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

type Work = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct NodeState {
  finished: bool,
  /// Unfinished dependencies, plus one guard held while submitting.
  remaining: usize,
  dependents: Vec<Arc<Node>>,
  work: Option<Work>,
}

struct Node {
  id: TaskId,
  label: &'static str,
  state: Mutex<NodeState>,
  finished_cv: Condvar,
}

impl Node {
  fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Handle to a submitted task, used to declare dependencies or to wait.
#[derive(Clone)]
pub struct TaskHandle(Arc<Node>);

impl TaskHandle {
  pub fn id(&self) -> TaskId {
    self.0.id
  }

  pub fn label(&self) -> &'static str {
    self.0.label
  }

  pub fn is_finished(&self) -> bool {
    self.0.lock().finished
  }

  /// Block until the task has run.
  pub fn wait(&self) {
    let mut state = self.0.lock();
    while !state.finished {
      state = self
        .0
        .finished_cv
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }
}

impl std::fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskHandle")
      .field("id", &self.0.id)
      .field("label", &self.0.label)
      .finish()
  }
}

struct Shared {
  workers: Option<rayon::ThreadPool>,
  /// Submitted but not yet started.
  queued: AtomicUsize,
  /// Submitted but not yet finished.
  outstanding: Mutex<usize>,
  drained: Condvar,
  first_error: Mutex<Option<AnalysisError>>,
}

/// Thread pool executing work items in dependency order.
pub struct TaskPool {
  shared: Arc<Shared>,
  num_threads: usize,
  affinities: Vec<Option<usize>>,
}

impl TaskPool {
  /// Pool without background threads: tasks run inside `submit`.
  pub fn inline() -> Self {
    Self::from_workers(None, 0, Vec::new())
  }

  /// Pool with `num_threads` workers placed by the OS.
  pub fn new(num_threads: usize) -> Result<Self> {
    if num_threads == 0 {
      return Ok(Self::inline());
    }
    let workers = rayon::ThreadPoolBuilder::new()
      .num_threads(num_threads)
      .thread_name(|i| format!("analysis-worker-{i}"))
      .build()?;
    Ok(Self::from_workers(Some(workers), num_threads, vec![None; num_threads]))
  }

  /// Pool with one worker pinned to each of `cores`.
  pub fn pinned(cores: Vec<CoreId>) -> Result<Self> {
    if cores.is_empty() {
      return Ok(Self::inline());
    }
    let num_threads = cores.len();
    let affinities = cores.iter().map(|c| Some(c.id)).collect();
    let workers = rayon::ThreadPoolBuilder::new()
      .num_threads(num_threads)
      .thread_name(|i| format!("analysis-worker-{i}"))
      .start_handler(move |i| {
        if let Some(core) = cores.get(i) {
          if !core_affinity::set_for_current(*core) {
            tracing::warn!(worker = i, core = core.id, "failed to pin analysis worker");
          }
        }
      })
      .build()?;
    Ok(Self::from_workers(Some(workers), num_threads, affinities))
  }

  fn from_workers(
    workers: Option<rayon::ThreadPool>,
    num_threads: usize,
    affinities: Vec<Option<usize>>,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        workers,
        queued: AtomicUsize::new(0),
        outstanding: Mutex::new(0),
        drained: Condvar::new(),
        first_error: Mutex::new(None),
      }),
      num_threads,
      affinities,
    }
  }

  /// Submit `work` to run after every task in `deps` has finished.
  pub fn submit<F>(&self, label: &'static str, deps: &[TaskHandle], work: F) -> TaskHandle
  where
    F: FnOnce() -> Result<()> + Send + 'static,
  {
    let node = Arc::new(Node {
      id: TaskId::next(),
      label,
      state: Mutex::new(NodeState {
        finished: false,
        remaining: 1,
        dependents: Vec::new(),
        work: Some(Box::new(work)),
      }),
      finished_cv: Condvar::new(),
    });

    self.shared.queued.fetch_add(1, Ordering::SeqCst);
    *self
      .shared
      .outstanding
      .lock()
      .unwrap_or_else(PoisonError::into_inner) += 1;

    for dep in deps {
      let mut dep_state = dep.0.lock();
      if !dep_state.finished {
        dep_state.dependents.push(Arc::clone(&node));
        node.lock().remaining += 1;
      }
    }

    // Drop the submission guard; whoever reaches zero schedules the node
    if release_one(&node) {
      schedule(&self.shared, Arc::clone(&node));
    }
    TaskHandle(node)
  }

  /// Number of submitted tasks that have not started yet.
  pub fn queued(&self) -> usize {
    self.shared.queued.load(Ordering::SeqCst)
  }

  /// Number of submitted tasks that have not finished yet.
  pub fn outstanding(&self) -> usize {
    *self
      .shared
      .outstanding
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Whether a task error is waiting to be reported by `wait_pool_finished`.
  pub fn has_failed(&self) -> bool {
    self
      .shared
      .first_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  pub fn num_threads(&self) -> usize {
    self.num_threads
  }

  /// Core the given worker is pinned to, if any.
  pub fn thread_affinity(&self, worker: usize) -> Option<usize> {
    self.affinities.get(worker).copied().flatten()
  }

  /// Block until every submitted task has finished.
  ///
  /// Returns the first task error recorded since the last call.
  pub fn wait_pool_finished(&self) -> Result<()> {
    let mut outstanding = self
      .shared
      .outstanding
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    while *outstanding > 0 {
      outstanding = self
        .shared
        .drained
        .wait(outstanding)
        .unwrap_or_else(PoisonError::into_inner);
    }
    drop(outstanding);

    match self
      .shared
      .first_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

impl Default for TaskPool {
  fn default() -> Self {
    Self::inline()
  }
}

/// Cores available to this process, if they can be determined.
pub fn process_affinity() -> Vec<CoreId> {
  core_affinity::get_core_ids().unwrap_or_default()
}

/// Pin the calling thread to `core`.
pub fn pin_current_thread(core: CoreId) -> bool {
  core_affinity::set_for_current(core)
}

/// Decrement the pending count; true when the node became ready.
fn release_one(node: &Node) -> bool {
  let mut state = node.lock();
  state.remaining -= 1;
  state.remaining == 0
}

fn schedule(shared: &Arc<Shared>, node: Arc<Node>) {
  match &shared.workers {
    Some(workers) => {
      let shared = Arc::clone(shared);
      workers.spawn_fifo(move || execute(&shared, node));
    }
    None => execute(shared, node),
  }
}

fn execute(shared: &Arc<Shared>, node: Arc<Node>) {
  shared.queued.fetch_sub(1, Ordering::SeqCst);

  let work = node.lock().work.take();
  let outcome = match work {
    Some(work) => match catch_unwind(AssertUnwindSafe(work)) {
      Ok(result) => result,
      Err(_) => Err(AnalysisError::TaskPanicked(node.label)),
    },
    None => Ok(()),
  };
  if let Err(err) = outcome {
    tracing::error!(task = node.label, error = %err, "analysis task failed");
    let mut first = shared
      .first_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if first.is_none() {
      *first = Some(err);
    }
  }

  let dependents = {
    let mut state = node.lock();
    state.finished = true;
    std::mem::take(&mut state.dependents)
  };
  node.finished_cv.notify_all();

  for dependent in dependents {
    if release_one(&dependent) {
      schedule(shared, dependent);
    }
  }

  let mut outstanding = shared
    .outstanding
    .lock()
    .unwrap_or_else(PoisonError::into_inner);
  *outstanding -= 1;
  if *outstanding == 0 {
    shared.drained.notify_all();
  }
}

#[cfg(test)]
#[path = "threading_test.rs"]
mod threading_test;
