use std::sync::mpsc;
use std::time::{Duration, Instant};

use super::*;

#[test]
fn test_inline_runs_immediately() {
  let pool = TaskPool::inline();
  let hits = Arc::new(AtomicUsize::new(0));

  let h = Arc::clone(&hits);
  let handle = pool.submit("inline", &[], move || {
    h.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });

  assert!(handle.is_finished());
  assert_eq!(hits.load(Ordering::SeqCst), 1);
  assert_eq!(pool.queued(), 0);
  assert_eq!(pool.num_threads(), 0);
}

#[test]
fn test_multiple_tasks() {
  let pool = TaskPool::new(4).unwrap();
  let results = Arc::new(Mutex::new(Vec::new()));

  for i in 0..10 {
    let results = Arc::clone(&results);
    pool.submit("multiply", &[], move || {
      results.lock().unwrap().push(i * 2);
      Ok(())
    });
  }
  pool.wait_pool_finished().unwrap();

  let mut results = results.lock().unwrap().clone();
  results.sort();
  assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
}

#[test]
fn test_dependency_runs_after_prerequisite() {
  let pool = TaskPool::new(4).unwrap();
  let first_end = Arc::new(Mutex::new(None));
  let second_start = Arc::new(Mutex::new(None));

  let end = Arc::clone(&first_end);
  let first = pool.submit("slow", &[], move || {
    std::thread::sleep(Duration::from_millis(50));
    *end.lock().unwrap() = Some(Instant::now());
    Ok(())
  });

  let start = Arc::clone(&second_start);
  let second = pool.submit("dependent", &[first.clone()], move || {
    *start.lock().unwrap() = Some(Instant::now());
    Ok(())
  });

  second.wait();
  assert!(first.is_finished());
  let first_end = first_end.lock().unwrap().unwrap();
  let second_start = second_start.lock().unwrap().unwrap();
  assert!(second_start >= first_end);
}

#[test]
fn test_diamond_dependencies() {
  let pool = TaskPool::new(3).unwrap();
  let order = Arc::new(Mutex::new(Vec::new()));

  let push = |name: &'static str| {
    let order = Arc::clone(&order);
    move || -> Result<()> {
      order.lock().unwrap().push(name);
      Ok(())
    }
  };

  let root = pool.submit("root", &[], push("root"));
  let left = pool.submit("left", &[root.clone()], push("left"));
  let right = pool.submit("right", &[root.clone()], push("right"));
  pool.submit("join", &[left, right], push("join"));
  pool.wait_pool_finished().unwrap();

  let order = order.lock().unwrap();
  assert_eq!(order.len(), 4);
  assert_eq!(order[0], "root");
  assert_eq!(order[3], "join");
}

#[test]
fn test_queued_counts_blocked_tasks() {
  let pool = TaskPool::new(1).unwrap();
  let (release, gate) = mpsc::channel::<()>();

  let blocker = pool.submit("gate", &[], move || {
    let _ = gate.recv();
    Ok(())
  });
  for _ in 0..3 {
    pool.submit("waiting", &[blocker.clone()], || Ok(()));
  }

  assert!(pool.queued() >= 3);
  assert_eq!(pool.outstanding(), 4);

  release.send(()).unwrap();
  pool.wait_pool_finished().unwrap();
  assert_eq!(pool.queued(), 0);
  assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_finished_dependency_is_ignored() {
  let pool = TaskPool::new(2).unwrap();
  let done = pool.submit("done", &[], || Ok(()));
  done.wait();

  let next = pool.submit("next", &[done], || Ok(()));
  next.wait();
  assert!(next.is_finished());
}

#[test]
fn test_error_surfaces_on_wait() {
  let pool = TaskPool::new(2).unwrap();
  let failing = pool.submit("failing", &[], || Err(AnalysisError::MissingInput("test")));
  failing.wait();
  assert!(pool.has_failed());
  let err = pool.wait_pool_finished().unwrap_err();
  assert!(!pool.has_failed());
  assert!(matches!(err, AnalysisError::MissingInput("test")));

  // The error is reported once
  assert!(pool.wait_pool_finished().is_ok());
}

#[test]
fn test_failed_task_releases_dependents() {
  let pool = TaskPool::new(2).unwrap();
  let failing = pool.submit("failing", &[], || Err(AnalysisError::MissingInput("upstream")));
  let ran = Arc::new(AtomicUsize::new(0));
  let r = Arc::clone(&ran);
  let dependent = pool.submit("dependent", &[failing], move || {
    r.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });
  dependent.wait();
  assert_eq!(ran.load(Ordering::SeqCst), 1);
  assert!(pool.wait_pool_finished().is_err());
}

#[test]
fn test_panic_is_captured() {
  let pool = TaskPool::new(1).unwrap();
  let handle = pool.submit("panicking", &[], || panic!("boom"));
  handle.wait();
  assert!(matches!(
    pool.wait_pool_finished(),
    Err(AnalysisError::TaskPanicked("panicking"))
  ));
}

#[test]
fn test_pinned_pool_records_affinity() {
  let cores = process_affinity();
  if cores.is_empty() {
    return;
  }
  let pool = TaskPool::pinned(vec![cores[0]]).unwrap();
  assert_eq!(pool.num_threads(), 1);
  assert_eq!(pool.thread_affinity(0), Some(cores[0].id));
  pool.submit("pinned", &[], || Ok(())).wait();
}
