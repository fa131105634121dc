//! Background work items submitted by `RunAnalysis`.
//!
//! Each item owns everything it reads: `Arc` snapshots taken on the
//! simulation thread, write-once slots for its outputs, and a leased
//! communicator for its collectives. Shared mutable state (statistics, mesh
//! buffers) sits behind a `Mutex`; dependency edges keep the holders from
//! overlapping.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::analysis_type::AnalysisType;
use crate::array::{strip_halo, DoubleArray};
use crate::blob::{
  compute_global_blob_ids, reconcile_blob_ids, BlobIdSlot, BlobListSlot, IdCounter, LabeledBlobs,
  SharedSlot,
};
use crate::checkpoint::write_checkpoint;
use crate::comm::CommLease;
use crate::constants::{BLOB_VF, BLOB_VS};
use crate::domain::RankInfo;
use crate::error::{AnalysisError, Result};
use crate::mesh::{MeshDataset, MeshWriter};
use crate::metrics::{PipelineMetrics, TaskKind};
use crate::stats::{PhaseStatistics, StagedFields};

pub type RawBlobSlot = SharedSlot<LabeledBlobs>;

/// A unit of background work.
pub trait WorkItem: Send + 'static {
  const KIND: TaskKind;

  fn timestep(&self) -> i64;

  fn run(self) -> Result<()>;
}

/// Wrap `item` for the task pool: tracing span, timing, metrics.
pub fn into_work<W: WorkItem>(
  item: W,
  metrics: Arc<Mutex<PipelineMetrics>>,
) -> impl FnOnce() -> Result<()> + Send + 'static {
  move || {
    let _span = tracing::info_span!("analysis_task", kind = W::KIND.name(), timestep = item.timestep())
      .entered();
    let start = Instant::now();
    item.run()?;
    let elapsed = start.elapsed().as_micros() as u64;
    metrics
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .record(W::KIND, elapsed);
    Ok(())
  }
}

// =============================================================================
// Blob identification
// =============================================================================

/// Phase 1: label the blobs of one phase snapshot.
pub struct BlobLabelTask {
  pub timestep: i64,
  pub phase: Arc<DoubleArray>,
  pub dist: Arc<DoubleArray>,
  pub rank_info: RankInfo,
  pub periodic: bool,
  pub output: RawBlobSlot,
  pub comm: CommLease,
}

impl WorkItem for BlobLabelTask {
  const KIND: TaskKind = TaskKind::BlobLabel;

  fn timestep(&self) -> i64 {
    self.timestep
  }

  fn run(self) -> Result<()> {
    let labeled = compute_global_blob_ids(
      &self.phase,
      &self.dist,
      &self.rank_info,
      self.periodic,
      BLOB_VF,
      BLOB_VS,
      self.comm.comm(),
    )?;
    self.output.publish(labeled)
  }
}

/// Phase 2: map the raw labels onto the previous step's IDs.
pub struct BlobReconcileTask {
  pub timestep: i64,
  pub raw: RawBlobSlot,
  /// Renumbered labels of the previous identification, if any.
  pub previous: Option<BlobIdSlot>,
  pub ids: BlobIdSlot,
  pub list: BlobListSlot,
  pub counter: IdCounter,
  pub id_map_path: PathBuf,
  pub comm: CommLease,
}

impl WorkItem for BlobReconcileTask {
  const KIND: TaskKind = TaskKind::BlobReconcile;

  fn timestep(&self) -> i64 {
    self.timestep
  }

  fn run(self) -> Result<()> {
    let raw = self.raw.require("raw blob labels")?;
    let previous = match &self.previous {
      Some(slot) => Some(slot.require("previous blob ids")?),
      None => None,
    };
    let reconciled = reconcile_blob_ids(
      self.timestep,
      raw,
      previous,
      &self.counter,
      &self.id_map_path,
      self.comm.comm(),
    )?;
    self.ids.publish(reconciled.ids)?;
    self.list.publish(reconciled.list)
  }
}

/// Latest blob identification handed to the statistics.
#[derive(Clone)]
pub struct BlobInputs {
  pub raw: RawBlobSlot,
  pub list: BlobListSlot,
}

fn install(stats: &mut PhaseStatistics, staged: StagedFields, blobs: Option<&BlobInputs>) -> Result<()> {
  stats.apply(staged)?;
  if let Some(blobs) = blobs {
    let raw = blobs.raw.require("raw blob labels")?;
    let list = blobs.list.require("blob id list")?;
    stats.set_blobs(&raw.ids, list)?;
  }
  Ok(())
}

// =============================================================================
// Analysis
// =============================================================================

/// Apply staged fields and the latest blobs, then compute averages.
pub struct AnalysisTask {
  pub timestep: i64,
  pub kind: AnalysisType,
  pub staged: StagedFields,
  pub blobs: Option<BlobInputs>,
  pub stats: Arc<Mutex<PhaseStatistics>>,
  pub comm: CommLease,
}

impl WorkItem for AnalysisTask {
  const KIND: TaskKind = TaskKind::Analysis;

  fn timestep(&self) -> i64 {
    self.timestep
  }

  fn run(self) -> Result<()> {
    let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
    install(&mut stats, self.staged, self.blobs.as_ref())?;
    if self.kind.contains(AnalysisType::COMPUTE_AVERAGES) {
      let (averages, blobs) = stats.compute_averages(self.timestep, self.comm.comm())?;
      tracing::info!(
        timestep = self.timestep,
        sw = averages.saturation_w,
        awn = averages.awn,
        blobs = blobs.len(),
        "computed averages"
      );
    }
    Ok(())
  }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Write one restart file.
pub struct CheckpointTask {
  pub timestep: i64,
  pub path: PathBuf,
  pub den: Arc<[f64]>,
  pub fq: Arc<[f64]>,
}

impl WorkItem for CheckpointTask {
  const KIND: TaskKind = TaskKind::Checkpoint;

  fn timestep(&self) -> i64 {
    self.timestep
  }

  fn run(self) -> Result<()> {
    write_checkpoint(&self.path, &self.den, &self.fq)?;
    tracing::debug!(path = %self.path.display(), "wrote checkpoint");
    Ok(())
  }
}

// =============================================================================
// Visualization
// =============================================================================

/// Copy the statistics fields into the mesh buffers and write them out.
pub struct VisTask {
  pub timestep: i64,
  pub staged: StagedFields,
  pub blobs: Option<BlobInputs>,
  pub stats: Arc<Mutex<PhaseStatistics>>,
  pub datasets: Arc<Mutex<Vec<MeshDataset>>>,
  pub writer: Arc<dyn MeshWriter>,
  pub comm: CommLease,
}

impl WorkItem for VisTask {
  const KIND: TaskKind = TaskKind::Visualization;

  fn timestep(&self) -> i64 {
    self.timestep
  }

  fn run(self) -> Result<()> {
    let mut datasets = self.datasets.lock().unwrap_or_else(PoisonError::into_inner);
    {
      let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
      install(&mut stats, self.staged, self.blobs.as_ref())?;

      let domain = datasets
        .first_mut()
        .ok_or(AnalysisError::MissingInput("visualization dataset"))?;
      domain.check_layout()?;
      let sources = [&stats.sdn, &stats.press, &stats.sds, &stats.label_nwp];
      for (var, src) in domain.vars.iter_mut().zip(sources) {
        strip_halo(src, &mut var.data)?;
      }
    }
    self
      .writer
      .write_data(self.timestep, &datasets, self.comm.comm())
  }
}
