//! RunAnalysis - decides what to do every timestep and schedules it.
//!
//! ```text
//!  simulation thread                         analysis pool
//!  ─────────────────                         ─────────────
//!  run(t) ─► analysis type
//!          ─► stage device data (blocking)
//!          ─► submit ──────────────────────► label ──► reconcile ─┐
//!          ◄─ return                                             ▼
//!                                      analysis ◄── {blob, analysis, vis}
//!                                      vis      ◄── {blob, analysis, vis}
//!                                      checkpoint ◄── previous checkpoint
//! ```
//!
//! Only `run` (staging, back-pressure) and `finish` block the caller. Both
//! are collective, so every rank drains its queue at the same step.

use std::fs;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use core_affinity::CoreId;
use smallvec::SmallVec;

use crate::analysis_type::AnalysisType;
use crate::array::{regular_layout, DoubleArray, IntArray};
use crate::blob::{write_id_map, BlobIdSlot, BlobListSlot, IdCounter, IdMap};
use crate::checkpoint::write_restart_timestep;
use crate::comm::{CommLease, CommPool, Communicator, ReduceOp};
use crate::config::{AnalysisConfig, ThreadAffinity};
use crate::constants::{
  ID_MAP_FILENAME, PHASE_LOOKAHEAD, QUEUE_BACKPRESSURE_LIMIT, RESTART_TIMESTEP_FILENAME,
  SIM_STATE_LOOKAHEAD,
};
use crate::device::{DeviceField, DeviceState};
use crate::domain::{DomainConfig, RankInfo};
use crate::error::{AnalysisError, Result};
use crate::mesh::{MeshDataset, MeshWriter};
use crate::metrics::{PipelineMetrics, TaskKind};
use crate::stats::{PhaseStatistics, StagedFields};
use crate::tasks::{
  into_work, AnalysisTask, BlobInputs, BlobLabelTask, BlobReconcileTask, CheckpointTask,
  RawBlobSlot, VisTask,
};
use crate::threading::{pin_current_thread, process_affinity, TaskHandle, TaskPool};

type Deps = SmallVec<[TaskHandle; 3]>;

/// Analysis actions for `timestep` under the configured intervals.
pub fn analysis_type(config: &AnalysisConfig, timestep: i64) -> AnalysisType {
  let analysis = config.analysis_interval;
  let mut kind = AnalysisType::NONE;
  if timestep % analysis + PHASE_LOOKAHEAD == analysis {
    // Phase indicator for the earlier side of the next averaging step
    kind |= AnalysisType::COPY_PHASE_INDICATOR;
  }
  if timestep % config.blobid_interval == 0 {
    kind |= AnalysisType::IDENTIFY_BLOBS;
  }
  if timestep % analysis + SIM_STATE_LOOKAHEAD == 0 {
    kind |= AnalysisType::COPY_SIM_STATE | AnalysisType::IDENTIFY_BLOBS;
  }
  if timestep % analysis == 0 {
    kind |= AnalysisType::COMPUTE_AVERAGES;
  }
  if timestep % config.restart_interval == 0 {
    kind |= AnalysisType::CREATE_RESTART;
    kind |= AnalysisType::WRITE_VIS | AnalysisType::COPY_SIM_STATE | AnalysisType::IDENTIFY_BLOBS;
  }
  kind
}

/// Most recent identification, as consumed by the next tasks.
#[derive(Clone)]
struct BlobState {
  raw: RawBlobSlot,
  ids: BlobIdSlot,
  list: BlobListSlot,
}

/// Concurrent analysis and checkpoint pipeline of one rank.
pub struct RunAnalysis {
  config: AnalysisConfig,
  rank_info: RankInfo,
  periodic: bool,
  dims: [usize; 3],
  np: usize,
  map: IntArray,
  dist: Arc<DoubleArray>,

  comm: Arc<dyn Communicator>,
  comms: CommPool,
  pool: TaskPool,

  stats: Arc<Mutex<PhaseStatistics>>,
  datasets: Arc<Mutex<Vec<MeshDataset>>>,
  writer: Arc<dyn MeshWriter>,
  metrics: Arc<Mutex<PipelineMetrics>>,
  counter: IdCounter,

  /// Host snapshots not yet taken by an analysis or vis task.
  pending: StagedFields,
  blobs: Option<BlobState>,

  wait_blob: Option<TaskHandle>,
  wait_analysis: Option<TaskHandle>,
  wait_vis: Option<TaskHandle>,
  wait_restart: Option<TaskHandle>,
}

impl RunAnalysis {
  /// Set up the pipeline for this rank.
  ///
  /// `map` gives the compact index of every regular voxel (negative for
  /// solid), `solid_dist` the signed distance to the solid. Collective over
  /// `comm`. Background threads follow `config.thread_affinity`.
  pub fn new(
    config: AnalysisConfig,
    domain: &DomainConfig,
    comm: Arc<dyn Communicator>,
    map: IntArray,
    solid_dist: DoubleArray,
    writer: Arc<dyn MeshWriter>,
  ) -> Result<Self> {
    config.validate()?;
    domain.validate()?;
    let dims = domain.dims();
    for (field, d) in [("cell map", map.dims()), ("solid distance", solid_dist.dims())] {
      if d != dims {
        return Err(AnalysisError::BufferLength {
          field,
          expected: domain.n(),
          actual: d.iter().product(),
        });
      }
    }
    if comm.size() != domain.ranks() {
      return Err(AnalysisError::Config(format!(
        "process grid {:?} needs {} ranks, communicator has {}",
        domain.nproc,
        domain.ranks(),
        comm.size()
      )));
    }

    let output_dir = config.output_dir.clone();
    fs::create_dir_all(&output_dir).map_err(|e| AnalysisError::io(&output_dir, e))?;

    let rank_info = domain.rank_info(comm.rank());
    let np = map
      .as_slice()
      .iter()
      .copied()
      .max()
      .map_or(0, |m| (m + 1).max(0) as usize);

    if comm.rank() == 0 {
      write_id_map(&output_dir.join(ID_MAP_FILENAME), &IdMap::default(), 0)?;
    }

    let interior = solid_dist.interior_dims();
    let datasets = vec![MeshDataset::domain(rank_info, interior, domain.lengths())];
    let stats = PhaseStatistics::new(
      solid_dist.clone(),
      rank_info,
      domain.lengths(),
      config.beta,
      &output_dir,
    );

    let mut analysis = Self {
      rank_info,
      periodic: domain.periodic,
      dims,
      np,
      map,
      dist: Arc::new(solid_dist),
      comms: CommPool::new(Arc::clone(&comm)),
      comm,
      pool: TaskPool::inline(),
      stats: Arc::new(Mutex::new(stats)),
      datasets: Arc::new(Mutex::new(datasets)),
      writer,
      metrics: Arc::new(Mutex::new(PipelineMetrics::new())),
      counter: IdCounter::new(),
      pending: StagedFields::default(),
      blobs: None,
      wait_blob: None,
      wait_analysis: None,
      wait_vis: None,
      wait_restart: None,
      config,
    };
    analysis.create_threads(analysis.config.thread_affinity, analysis.config.analysis_threads)?;
    tracing::info!(
      rank = analysis.rank_info.rank,
      np,
      threads = analysis.pool.num_threads(),
      "analysis pipeline ready"
    );
    Ok(analysis)
  }

  pub fn compute_analysis_type(&self, timestep: i64) -> AnalysisType {
    analysis_type(&self.config, timestep)
  }

  /// Stage what `timestep` needs and queue the background work.
  ///
  /// Collective over the communicator on every step with a non-empty
  /// analysis type. A background task failure on any rank is returned here
  /// by every rank, at the first such step after the failure is seen.
  pub fn run(&mut self, timestep: i64, device: &mut dyn DeviceState) -> Result<()> {
    let kind = self.compute_analysis_type(timestep);
    if kind.is_none() {
      return Ok(());
    }
    let _span = tracing::info_span!("run_analysis", timestep, kind = %kind).entered();

    let status = self.pool_status()?;
    if status.failed {
      // Local error first, the barrier in `finish` keeps the ranks together
      self.finish()?;
      return Err(AnalysisError::PeerFailed);
    }
    if status.deepest_queue > QUEUE_BACKPRESSURE_LIMIT {
      tracing::warn!(
        queued = self.pool.queued(),
        deepest = status.deepest_queue,
        "analysis queue is getting behind, waiting"
      );
      self.lock_metrics().record_backpressure();
      self.finish()?;
    }

    let staged = self.stage(kind, device)?;

    if kind.contains(AnalysisType::IDENTIFY_BLOBS) {
      let phase = staged
        .phase_snapshot
        .clone()
        .ok_or(AnalysisError::MissingInput("phase snapshot"))?;
      self.submit_blob_identification(timestep, phase)?;
    }
    if kind.contains(AnalysisType::COMPUTE_AVERAGES) {
      let task = AnalysisTask {
        timestep,
        kind,
        staged: mem::take(&mut self.pending),
        blobs: self.blob_inputs(),
        stats: Arc::clone(&self.stats),
        comm: self.get_comm()?,
      };
      let deps = self.averaging_deps();
      let handle = self
        .pool
        .submit("compute averages", &deps, into_work(task, Arc::clone(&self.metrics)));
      self.wait_analysis = Some(handle);
    }
    if kind.contains(AnalysisType::CREATE_RESTART) {
      let (den, fq) = staged
        .restart
        .ok_or(AnalysisError::MissingInput("restart buffers"))?;
      if self.comm.rank() == 0 {
        write_restart_timestep(
          &self.config.output_dir.join(RESTART_TIMESTEP_FILENAME),
          timestep,
        )?;
      }
      let task = CheckpointTask {
        timestep,
        path: self.config.restart_path(self.rank_info.rank),
        den,
        fq,
      };
      let deps: Deps = self.wait_restart.iter().cloned().collect();
      let handle = self
        .pool
        .submit("save checkpoint", &deps, into_work(task, Arc::clone(&self.metrics)));
      self.wait_restart = Some(handle);
    }
    if kind.contains(AnalysisType::WRITE_VIS) {
      let task = VisTask {
        timestep,
        staged: mem::take(&mut self.pending),
        blobs: self.blob_inputs(),
        stats: Arc::clone(&self.stats),
        datasets: Arc::clone(&self.datasets),
        writer: Arc::clone(&self.writer),
        comm: self.get_comm()?,
      };
      let deps = self.averaging_deps();
      let handle = self
        .pool
        .submit("save vis", &deps, into_work(task, Arc::clone(&self.metrics)));
      self.wait_vis = Some(handle);
    }
    Ok(())
  }

  /// Copy device data to host buffers. Phase first, restart buffers last.
  fn stage(&mut self, kind: AnalysisType, device: &mut dyn DeviceState) -> Result<Staged> {
    let start = Instant::now();
    device.device_barrier();
    let [nx, ny, nz] = self.dims;
    let mut staged = StagedFields::default();

    let phase = if kind.needs_phase() {
      let mut phase = DoubleArray::new(nx, ny, nz, 0.0);
      device.copy_to_host(DeviceField::Phi, phase.as_mut_slice())?;
      Some(Arc::new(phase))
    } else {
      None
    };
    if kind.contains(AnalysisType::COPY_PHASE_INDICATOR) {
      staged.phase_tplus = phase.clone();
    }
    if kind.contains(AnalysisType::COMPUTE_AVERAGES) {
      staged.phase_tminus = phase.clone();
    }

    if kind.contains(AnalysisType::COPY_SIM_STATE) {
      device.compute_pressure();
      device.compute_velocity();
      device.device_barrier();
      staged.phase = phase.clone();

      let np = self.np;
      let mut compact = vec![0.0; np];
      device.copy_to_host(DeviceField::Pressure, &mut compact)?;
      let mut pressure = DoubleArray::new(nx, ny, nz, 0.0);
      regular_layout(&self.map, &compact, &mut pressure)?;

      let mut compact = vec![0.0; 3 * np];
      device.copy_to_host(DeviceField::Velocity, &mut compact)?;
      let mut velocity = [
        DoubleArray::new(nx, ny, nz, 0.0),
        DoubleArray::new(nx, ny, nz, 0.0),
        DoubleArray::new(nx, ny, nz, 0.0),
      ];
      for (axis, out) in velocity.iter_mut().enumerate() {
        regular_layout(&self.map, &compact[axis * np..(axis + 1) * np], out)?;
      }
      staged.pressure = Some(pressure);
      staged.velocity = Some(velocity);
    }

    let restart = if kind.contains(AnalysisType::CREATE_RESTART) {
      let n = device.n();
      let np = device.np();
      let mut den = vec![0.0; DeviceField::Density.len(n, np)];
      device.copy_to_host(DeviceField::Density, &mut den)?;
      let mut fq = vec![0.0; DeviceField::Distributions.len(n, np)];
      device.copy_to_host(DeviceField::Distributions, &mut fq)?;
      Some((Arc::from(den), Arc::from(fq)))
    } else {
      None
    };

    self.pending.merge(staged);
    self
      .lock_metrics()
      .record(TaskKind::Staging, start.elapsed().as_micros() as u64);
    Ok(Staged {
      phase_snapshot: phase,
      restart,
    })
  }

  /// Queue depth and failure state agreed on by every rank.
  fn pool_status(&self) -> Result<PoolStatus> {
    let local = [
      self.pool.queued() as f64,
      if self.pool.has_failed() { 1.0 } else { 0.0 },
    ];
    match self.comm.all_reduce_f64(&local, ReduceOp::Max)?.as_slice() {
      &[queued, failed] => Ok(PoolStatus {
        deepest_queue: queued as usize,
        failed: failed > 0.0,
      }),
      other => Err(AnalysisError::Protocol(format!(
        "pool status has {} values, expected 2",
        other.len()
      ))),
    }
  }

  fn submit_blob_identification(&mut self, timestep: i64, phase: Arc<DoubleArray>) -> Result<()> {
    let next = BlobState {
      raw: RawBlobSlot::new(),
      ids: BlobIdSlot::new(),
      list: BlobListSlot::new(),
    };

    let label = BlobLabelTask {
      timestep,
      phase,
      dist: Arc::clone(&self.dist),
      rank_info: self.rank_info,
      periodic: self.periodic,
      output: next.raw.clone(),
      comm: self.get_comm()?,
    };
    let deps: Deps = self.wait_blob.iter().cloned().collect();
    let label = self
      .pool
      .submit("identify blobs", &deps, into_work(label, Arc::clone(&self.metrics)));

    let reconcile = BlobReconcileTask {
      timestep,
      raw: next.raw.clone(),
      previous: self.blobs.as_ref().map(|b| b.ids.clone()),
      ids: next.ids.clone(),
      list: next.list.clone(),
      counter: self.counter.clone(),
      id_map_path: self.config.output_dir.join(ID_MAP_FILENAME),
      comm: self.get_comm()?,
    };
    let reconcile = self.pool.submit(
      "identify blob maps",
      &[label],
      into_work(reconcile, Arc::clone(&self.metrics)),
    );

    self.wait_blob = Some(reconcile);
    self.blobs = Some(next);
    Ok(())
  }

  fn blob_inputs(&self) -> Option<BlobInputs> {
    self.blobs.as_ref().map(|b| BlobInputs {
      raw: b.raw.clone(),
      list: b.list.clone(),
    })
  }

  fn averaging_deps(&self) -> Deps {
    [&self.wait_blob, &self.wait_analysis, &self.wait_vis]
      .into_iter()
      .flatten()
      .cloned()
      .collect()
  }

  /// (Re)create the background threads.
  ///
  /// Waits for outstanding work first. Without thread support in the
  /// communicator no background threads are created.
  pub fn create_threads(&mut self, method: ThreadAffinity, n_threads: usize) -> Result<()> {
    self.pool.wait_pool_finished()?;

    if method != ThreadAffinity::None && !self.comm.supports_threads() {
      tracing::warn!("communicator is not thread safe, analysis runs on the simulation thread");
      self.pool = TaskPool::inline();
      return Ok(());
    }

    self.pool = match method {
      ThreadAffinity::None => TaskPool::inline(),
      ThreadAffinity::Default => TaskPool::new(n_threads)?,
      ThreadAffinity::Independent => {
        let (simulation_core, pool) = independent_pool(&process_affinity(), n_threads)?;
        if let Some(core) = simulation_core {
          if !pin_current_thread(core) {
            tracing::warn!(core = core.id, "failed to pin simulation thread");
          }
        }
        pool
      }
    };

    if self.comm.rank() == 0 {
      let affinities: Vec<_> = (0..self.pool.num_threads())
        .map(|i| self.pool.thread_affinity(i))
        .collect();
      tracing::info!(?method, threads = self.pool.num_threads(), ?affinities, "analysis threads");
    }
    Ok(())
  }

  /// Lease a communicator for collective work off the simulation thread.
  pub fn get_comm(&self) -> Result<CommLease> {
    self.comms.get_comm()
  }

  /// Wait for every queued task, drop the held dependencies, then barrier.
  pub fn finish(&mut self) -> Result<()> {
    let _span = tracing::info_span!("finish_analysis").entered();
    let result = self.pool.wait_pool_finished();
    self.wait_blob = None;
    self.wait_analysis = None;
    self.wait_vis = None;
    self.wait_restart = None;
    self.comm.barrier();
    result
  }

  /// Snapshot of the task timings.
  pub fn metrics(&self) -> PipelineMetrics {
    self.lock_metrics().clone()
  }

  /// Snapshot of the statistics state. Call after `finish` for a stable view.
  pub fn statistics(&self) -> PhaseStatistics {
    self
      .stats
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Largest blob ID issued so far.
  pub fn max_blob_id(&self) -> i32 {
    self.counter.get()
  }

  pub fn pool(&self) -> &TaskPool {
    &self.pool
  }

  pub fn config(&self) -> &AnalysisConfig {
    &self.config
  }

  fn lock_metrics(&self) -> std::sync::MutexGuard<'_, PipelineMetrics> {
    self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Drop for RunAnalysis {
  fn drop(&mut self) {
    if let Err(err) = self.finish() {
      tracing::error!(error = %err, "analysis pipeline finished with an error");
    }
  }
}

/// Placement for `ThreadAffinity::Independent`.
///
/// The simulation keeps the first core and one worker is pinned to each of
/// the others, so a single core leaves no background threads. Falls back to
/// `n_threads` unpinned workers when the affinity is unknown.
fn independent_pool(cores: &[CoreId], n_threads: usize) -> Result<(Option<CoreId>, TaskPool)> {
  match cores.split_first() {
    Some((&simulation, workers)) => Ok((Some(simulation), TaskPool::pinned(workers.to_vec())?)),
    None => {
      tracing::warn!("unable to determine process affinity, using default placement");
      Ok((None, TaskPool::new(n_threads)?))
    }
  }
}

struct PoolStatus {
  deepest_queue: usize,
  failed: bool,
}

/// Buffers staged for the tasks submitted this step.
struct Staged {
  phase_snapshot: Option<Arc<DoubleArray>>,
  restart: Option<(Arc<[f64]>, Arc<[f64]>)>,
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_test;
