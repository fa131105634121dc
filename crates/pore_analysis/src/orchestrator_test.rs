use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::*;
use crate::comm::{ReduceOp, SelfComm, ThreadComm, ThreadWorld};
use crate::constants::{BLOBLOG_FILENAME, TIMELOG_FILENAME};
use crate::device::{build_cell_map, HostDevice};
use crate::mesh::RawMeshWriter;
use crate::metrics::is_enabled;

fn cube(n: usize, nproc: [usize; 3]) -> DomainConfig {
  DomainConfig {
    nx: n,
    ny: n,
    nz: n,
    nproc,
    lengths: [1.0; 3],
    periodic: false,
  }
}

/// Open pore space with a spherical droplet given in global interior
/// coordinates. Returns the cell map, solid distance and device state.
fn droplet(
  domain: &DomainConfig,
  rank: usize,
  center: [f64; 3],
  radius: f64,
) -> (IntArray, DoubleArray, HostDevice) {
  let [nx, ny, nz] = domain.dims();
  let info = domain.rank_info(rank);
  let offset = info.global_offset([nx - 2, ny - 2, nz - 2]);
  let dist = DoubleArray::new(nx, ny, nz, 1.0);
  let (map, np) = build_cell_map(&dist);

  let mut device = HostDevice::new(domain.n(), np);
  let phi = device.phi_mut();
  for z in 0..nz {
    for y in 0..ny {
      for x in 0..nx {
        let g = [
          offset[0] as f64 + x as f64 - 1.0,
          offset[1] as f64 + y as f64 - 1.0,
          offset[2] as f64 + z as f64 - 1.0,
        ];
        let r2: f64 = (0..3).map(|a| (g[a] - center[a]).powi(2)).sum();
        phi[dist.index_of(x, y, z)] = if r2 <= radius * radius { 1.0 } else { -1.0 };
      }
    }
  }
  // Rest population only: pressure 1/3, no velocity
  device.distributions_mut()[..np].fill(1.0);
  device.density_mut().fill(0.5);
  (map, dist, device)
}

fn pipeline(
  dir: &Path,
  intervals: (i64, i64, i64),
  affinity: ThreadAffinity,
  threads: usize,
) -> (RunAnalysis, HostDevice) {
  let domain = cube(8, [1, 1, 1]);
  let (map, dist, device) = droplet(&domain, 0, [3.0, 3.0, 3.0], 2.0);
  let config = AnalysisConfig::new(intervals.0, intervals.1, intervals.2)
    .with_output_dir(dir)
    .with_threads(affinity, threads);
  let analysis = RunAnalysis::new(
    config,
    &domain,
    Arc::new(SelfComm),
    map,
    dist,
    Arc::new(RawMeshWriter::new(dir)),
  )
  .unwrap();
  (analysis, device)
}

fn read_lines(path: PathBuf) -> Vec<String> {
  std::fs::read_to_string(path)
    .unwrap()
    .lines()
    .map(str::to_string)
    .collect()
}

// =============================================================================
// Analysis type
// =============================================================================

#[test]
fn test_analysis_type_flags() {
  let config = AnalysisConfig::new(100, 20, 5);

  let at_restart = analysis_type(&config, 100);
  assert!(at_restart.contains(
    AnalysisType::CREATE_RESTART
      | AnalysisType::WRITE_VIS
      | AnalysisType::COPY_SIM_STATE
      | AnalysisType::IDENTIFY_BLOBS
      | AnalysisType::COMPUTE_AVERAGES
  ));
  assert!(!at_restart.contains(AnalysisType::COPY_PHASE_INDICATOR));

  assert_eq!(analysis_type(&config, 12), AnalysisType::COPY_PHASE_INDICATOR);
  assert_eq!(
    analysis_type(&config, 15),
    AnalysisType::IDENTIFY_BLOBS
  );
  assert_eq!(analysis_type(&config, 7), AnalysisType::NONE);
}

#[test]
fn test_analysis_type_is_pure() {
  let config = AnalysisConfig::new(30, 10, 7);
  for t in 0..200 {
    assert_eq!(analysis_type(&config, t), analysis_type(&config, t));
  }
}

#[test]
fn test_rejects_zero_interval() {
  let dir = tempfile::tempdir().unwrap();
  let domain = cube(6, [1, 1, 1]);
  let (map, dist, _) = droplet(&domain, 0, [2.0; 3], 1.0);
  let result = RunAnalysis::new(
    AnalysisConfig::new(10, 0, 5).with_output_dir(dir.path()),
    &domain,
    Arc::new(SelfComm),
    map,
    dist,
    Arc::new(RawMeshWriter::new(dir.path())),
  );
  assert!(matches!(result, Err(AnalysisError::Config(_))));
}

// =============================================================================
// Pipeline runs
// =============================================================================

#[test]
fn test_id_map_starts_at_construction() {
  let dir = tempfile::tempdir().unwrap();
  let (analysis, _) = pipeline(dir.path(), (10, 5, 5), ThreadAffinity::None, 0);
  let map = std::fs::read_to_string(dir.path().join(ID_MAP_FILENAME)).unwrap();
  assert_eq!(map, "0:\n");
  drop(analysis);
}

#[test]
fn test_end_to_end_outputs() {
  let dir = tempfile::tempdir().unwrap();
  let (mut analysis, mut device) = pipeline(dir.path(), (10, 5, 5), ThreadAffinity::Default, 2);
  for t in 0..=20 {
    analysis.run(t, &mut device).unwrap();
  }
  analysis.finish().unwrap();

  let out = dir.path();
  assert_eq!(
    std::fs::read_to_string(out.join("Restart.txt")).unwrap(),
    "24\n"
  );
  let np = device.np();
  let restart = std::fs::metadata(out.join("Restart.00000")).unwrap();
  assert_eq!(restart.len() as usize, 21 * np * 8);

  // Static droplet: one creation, then identity steps
  assert_eq!(
    read_lines(out.join(ID_MAP_FILENAME)),
    vec!["0: -0", "5:", "10:", "15:", "20:"]
  );
  let timelog = read_lines(out.join(TIMELOG_FILENAME));
  assert_eq!(timelog.len(), 6);
  assert!(timelog[5].starts_with("20 "));

  for t in [0, 10, 20] {
    let phase = out.join(format!("vis{t:05}/phase.00000.raw"));
    assert_eq!(std::fs::metadata(phase).unwrap().len(), 6 * 6 * 6 * 8);
  }
  assert!(!out.join("vis00005").exists());

  assert_eq!(analysis.max_blob_id(), 0);
  if is_enabled() {
    let metrics = analysis.metrics();
    assert_eq!(metrics.count(TaskKind::BlobLabel), 5);
    assert_eq!(metrics.count(TaskKind::BlobReconcile), 5);
    assert_eq!(metrics.count(TaskKind::Analysis), 5);
    assert_eq!(metrics.count(TaskKind::Checkpoint), 3);
    assert_eq!(metrics.count(TaskKind::Visualization), 3);
  }

  let stats = analysis.statistics();
  assert_eq!(stats.count, 1);
  assert_eq!(stats.label_nwp[(4, 4, 4)], 0.0);
  assert!((stats.press[(4, 4, 4)] - 1.0 / 3.0).abs() < 1e-12);
}

/// Checks, when a dump is written, that the averages of the same step are
/// already in the time log.
struct OrderCheckWriter {
  inner: RawMeshWriter,
  timelog: PathBuf,
  seen: Arc<Mutex<Vec<(i64, bool)>>>,
}

impl MeshWriter for OrderCheckWriter {
  fn write_data(
    &self,
    timestep: i64,
    datasets: &[MeshDataset],
    comm: &dyn Communicator,
  ) -> Result<()> {
    let logged = std::fs::read_to_string(&self.timelog)
      .unwrap_or_default()
      .lines()
      .any(|l| l.split_whitespace().next() == Some(timestep.to_string().as_str()));
    self.seen.lock().unwrap().push((timestep, logged));
    self.inner.write_data(timestep, datasets, comm)
  }
}

#[test]
fn test_vis_waits_for_analysis() {
  let dir = tempfile::tempdir().unwrap();
  let domain = cube(8, [1, 1, 1]);
  let (map, dist, mut device) = droplet(&domain, 0, [3.0; 3], 2.0);
  let seen = Arc::new(Mutex::new(Vec::new()));
  let writer = OrderCheckWriter {
    inner: RawMeshWriter::new(dir.path()),
    timelog: dir.path().join(TIMELOG_FILENAME),
    seen: Arc::clone(&seen),
  };
  let config = AnalysisConfig::new(10, 10, 10)
    .with_output_dir(dir.path())
    .with_threads(ThreadAffinity::Default, 4);
  let mut analysis =
    RunAnalysis::new(config, &domain, Arc::new(SelfComm), map, dist, Arc::new(writer)).unwrap();

  for t in 0..=30 {
    analysis.run(t, &mut device).unwrap();
  }
  analysis.finish().unwrap();

  let seen = seen.lock().unwrap();
  assert_eq!(seen.len(), 4);
  assert!(seen.iter().all(|&(_, logged)| logged));
}

#[test]
fn test_identical_runs_are_bit_identical() {
  let run = |dir: &Path| {
    let (mut analysis, mut device) = pipeline(dir, (10, 5, 5), ThreadAffinity::None, 0);
    for t in 0..=10 {
      analysis.run(t, &mut device).unwrap();
    }
    analysis.finish().unwrap();
  };
  let a = tempfile::tempdir().unwrap();
  let b = tempfile::tempdir().unwrap();
  run(a.path());
  run(b.path());

  for name in [TIMELOG_FILENAME, BLOBLOG_FILENAME, ID_MAP_FILENAME] {
    let read = |dir: &Path| std::fs::read(dir.join(name)).unwrap();
    assert_eq!(read(a.path()), read(b.path()), "{name} differs");
  }
}

/// Diffuse interface normal to x, centred at `x0`.
fn set_front(device: &mut HostDevice, grid: &DoubleArray, x0: f64) {
  let [nx, ny, nz] = grid.dims();
  let phi = device.phi_mut();
  for z in 0..nz {
    for y in 0..ny {
      for x in 0..nx {
        phi[grid.index_of(x, y, z)] = ((x as f64 - x0) / 2.0).tanh();
      }
    }
  }
}

#[test]
fn test_repeated_step_appends_identical_rows() {
  let dir = tempfile::tempdir().unwrap();
  let domain = cube(8, [1, 1, 1]);
  let (map, dist, mut device) = droplet(&domain, 0, [3.0; 3], 2.0);
  let grid = dist.clone();
  let config = AnalysisConfig::new(100, 10, 5).with_output_dir(dir.path());
  let mut analysis = RunAnalysis::new(
    config,
    &domain,
    Arc::new(SelfComm),
    map,
    dist,
    Arc::new(RawMeshWriter::new(dir.path())),
  )
  .unwrap();

  set_front(&mut device, &grid, 3.0);
  analysis.run(2, &mut device).unwrap();
  set_front(&mut device, &grid, 3.5);
  analysis.run(10, &mut device).unwrap();
  analysis.run(10, &mut device).unwrap();
  analysis.finish().unwrap();

  let timelog = read_lines(dir.path().join(TIMELOG_FILENAME));
  assert_eq!(timelog.len(), 3);
  assert!(timelog[1].starts_with("10 "));
  assert_eq!(timelog[1], timelog[2]);
  // The interface moved between the two snapshots
  assert!(!timelog[1].ends_with(" 0.00000000e0"));
}

#[test]
fn test_deep_queue_is_drained() {
  let dir = tempfile::tempdir().unwrap();
  let (mut analysis, mut device) = pipeline(dir.path(), (10, 5, 5), ThreadAffinity::Default, 1);

  let (release, gate) = mpsc::channel::<()>();
  let done = Arc::new(AtomicUsize::new(0));
  let blocker = analysis.pool().submit("gate", &[], move || {
    let _ = gate.recv();
    Ok(())
  });
  for _ in 0..21 {
    let done = Arc::clone(&done);
    analysis.pool().submit("noop", &[blocker.clone()], move || {
      done.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });
  }
  assert!(analysis.pool().queued() > QUEUE_BACKPRESSURE_LIMIT);

  let releaser = thread::spawn(move || {
    thread::sleep(Duration::from_millis(50));
    release.send(()).unwrap();
  });
  analysis.run(5, &mut device).unwrap();
  releaser.join().unwrap();

  // Every task queued before the step ran before run returned
  assert_eq!(done.load(Ordering::SeqCst), 21);
  if is_enabled() {
    assert_eq!(analysis.metrics().backpressure_drains, 1);
  }
  analysis.finish().unwrap();
}

#[test]
fn test_task_failure_is_returned_by_run() {
  let dir = tempfile::tempdir().unwrap();
  let (mut analysis, mut device) = pipeline(dir.path(), (10, 5, 5), ThreadAffinity::Default, 2);
  let failing = analysis
    .pool()
    .submit("failing", &[], || Err(AnalysisError::MissingInput("grid")));
  failing.wait();

  // Quiet steps do not look at the pool
  analysis.run(3, &mut device).unwrap();
  assert!(matches!(
    analysis.run(5, &mut device),
    Err(AnalysisError::MissingInput("grid"))
  ));
  // Reported once
  analysis.run(10, &mut device).unwrap();
  analysis.finish().unwrap();
}

#[test]
fn test_drop_drains_pool() {
  let dir = tempfile::tempdir().unwrap();
  {
    let (mut analysis, mut device) = pipeline(dir.path(), (10, 5, 5), ThreadAffinity::Default, 2);
    analysis.run(10, &mut device).unwrap();
  }
  assert!(dir.path().join("Restart.00000").exists());
  assert!(dir.path().join("vis00010/BlobID.00000.raw").exists());
}

/// Single-rank communicator that refuses concurrent use.
struct SerialComm;

impl Communicator for SerialComm {
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
    SelfComm.all_gather_i64(values)
  }

  fn all_reduce_f64(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
    SelfComm.all_reduce_f64(values, op)
  }

  fn duplicate(&self) -> Arc<dyn Communicator> {
    Arc::new(SerialComm)
  }

  fn supports_threads(&self) -> bool {
    false
  }
}

#[test]
fn test_independent_single_core_has_no_workers() {
  let (simulation, pool) = independent_pool(&[CoreId { id: 0 }], 4).unwrap();
  assert_eq!(simulation.map(|c| c.id), Some(0));
  assert_eq!(pool.num_threads(), 0);
}

#[test]
fn test_independent_without_affinity_uses_default() {
  let (simulation, pool) = independent_pool(&[], 3).unwrap();
  assert!(simulation.is_none());
  assert_eq!(pool.num_threads(), 3);
  assert_eq!(pool.thread_affinity(0), None);
}

#[test]
fn test_no_threads_without_thread_support() {
  let dir = tempfile::tempdir().unwrap();
  let domain = cube(6, [1, 1, 1]);
  let (map, dist, _) = droplet(&domain, 0, [2.0; 3], 1.0);
  let config = AnalysisConfig::new(10, 5, 5)
    .with_output_dir(dir.path())
    .with_threads(ThreadAffinity::Default, 4);
  let analysis = RunAnalysis::new(
    config,
    &domain,
    Arc::new(SerialComm),
    map,
    dist,
    Arc::new(RawMeshWriter::new(dir.path())),
  )
  .unwrap();
  assert_eq!(analysis.pool().num_threads(), 0);
}

#[test]
fn test_two_ranks_share_blob_ids() {
  let dir = tempfile::tempdir().unwrap();
  let out = dir.path().to_path_buf();
  let domain = cube(6, [2, 1, 1]);

  let handles: Vec<_> = ThreadWorld::create(2)
    .into_iter()
    .map(|comm| {
      let out = out.clone();
      let domain = domain.clone();
      thread::spawn(move || {
        let rank = comm.rank();
        // Droplet straddles the x boundary between the two ranks
        let (map, dist, mut device) = droplet(&domain, rank, [3.5, 1.5, 1.5], 1.2);
        let config = AnalysisConfig::new(10, 5, 5).with_output_dir(&out);
        let mut analysis = RunAnalysis::new(
          config,
          &domain,
          Arc::new(comm),
          map,
          dist,
          Arc::new(RawMeshWriter::new(&out)),
        )
        .unwrap();
        for t in 0..=10 {
          analysis.run(t, &mut device).unwrap();
        }
        analysis.finish().unwrap();
        (analysis.max_blob_id(), analysis.statistics().count)
      })
    })
    .collect();

  for handle in handles {
    assert_eq!(handle.join().unwrap(), (0, 1));
  }
  assert!(out.join("Restart.00000").exists());
  assert!(out.join("Restart.00001").exists());
  assert_eq!(
    read_lines(out.join(ID_MAP_FILENAME)),
    vec!["0: -0", "5:", "10:"]
  );
}

/// Run `body` on both ranks of a two-rank world.
fn on_two_ranks<T, F>(body: F) -> Vec<T>
where
  T: Send + 'static,
  F: Fn(ThreadComm) -> T + Send + Sync + 'static,
{
  let body = Arc::new(body);
  let handles: Vec<_> = ThreadWorld::create(2)
    .into_iter()
    .map(|comm| {
      let body = Arc::clone(&body);
      thread::spawn(move || body(comm))
    })
    .collect();
  handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Pipeline of one rank of a `cube(6, [2, 1, 1])` world with a droplet
/// across the rank boundary.
fn rank_pipeline(
  comm: ThreadComm,
  out: &Path,
  affinity: ThreadAffinity,
  threads: usize,
) -> (RunAnalysis, HostDevice) {
  let domain = cube(6, [2, 1, 1]);
  let (map, dist, device) = droplet(&domain, comm.rank(), [3.5, 1.5, 1.5], 1.2);
  let config = AnalysisConfig::new(10, 5, 5)
    .with_output_dir(out)
    .with_threads(affinity, threads);
  let analysis = RunAnalysis::new(
    config,
    &domain,
    Arc::new(comm),
    map,
    dist,
    Arc::new(RawMeshWriter::new(out)),
  )
  .unwrap();
  (analysis, device)
}

#[test]
fn test_threaded_ranks_run_to_completion() {
  let dir = tempfile::tempdir().unwrap();
  let out = dir.path().to_path_buf();
  let results = on_two_ranks(move |comm| {
    let (mut analysis, mut device) = rank_pipeline(comm, &out, ThreadAffinity::Default, 2);
    for t in 0..=100 {
      analysis.run(t, &mut device).unwrap();
    }
    analysis.finish().unwrap();
    (analysis.max_blob_id(), analysis.statistics().count)
  });
  assert_eq!(results, vec![(0, 1), (0, 1)]);
  assert_eq!(read_lines(dir.path().join(ID_MAP_FILENAME)).len(), 21);
}

#[test]
fn test_backlog_on_one_rank_drains_every_rank() {
  let dir = tempfile::tempdir().unwrap();
  let out = dir.path().to_path_buf();
  let results = on_two_ranks(move |comm| {
    let rank = comm.rank();
    let (mut analysis, mut device) = rank_pipeline(comm, &out, ThreadAffinity::Default, 2);

    // Only rank 0 falls behind
    let done = Arc::new(AtomicUsize::new(0));
    let mut releaser = None;
    if rank == 0 {
      let (release, gate) = mpsc::channel::<()>();
      let blocker = analysis.pool().submit("gate", &[], move || {
        let _ = gate.recv();
        Ok(())
      });
      for _ in 0..21 {
        let done = Arc::clone(&done);
        analysis.pool().submit("noop", &[blocker.clone()], move || {
          done.fetch_add(1, Ordering::SeqCst);
          Ok(())
        });
      }
      releaser = Some(thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();
      }));
    }

    for t in 0..=10 {
      analysis.run(t, &mut device).unwrap();
    }
    analysis.finish().unwrap();
    if let Some(releaser) = releaser {
      releaser.join().unwrap();
    }
    (
      rank,
      done.load(Ordering::SeqCst),
      analysis.metrics().backpressure_drains,
    )
  });

  assert_eq!(results[0].1, 21);
  if is_enabled() {
    assert!(results.iter().all(|&(_, _, drains)| drains == 1));
  }
}

#[test]
fn test_task_failure_stops_every_rank() {
  let dir = tempfile::tempdir().unwrap();
  let out = dir.path().to_path_buf();
  let results = on_two_ranks(move |comm| {
    let rank = comm.rank();
    let (mut analysis, mut device) = rank_pipeline(comm, &out, ThreadAffinity::Default, 2);
    if rank == 1 {
      analysis
        .pool()
        .submit("failing", &[], || Err(AnalysisError::MissingInput("grid")))
        .wait();
    }
    analysis.run(0, &mut device)
  });

  assert!(matches!(results[0], Err(AnalysisError::PeerFailed)));
  assert!(matches!(results[1], Err(AnalysisError::MissingInput("grid"))));
}
