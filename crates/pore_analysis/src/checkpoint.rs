//! Restart checkpoints.
//!
//! A checkpoint is the two-fluid density (`2 * Np`) followed by the D3Q19
//! distributions (`19 * Np`), stored back to back as raw little-endian `f64`
//! with no header. `Restart.txt` records the timestep to resume from.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::constants::{D3Q19_Q, DENSITY_COMPONENTS, RESTART_TIMESTEP_OFFSET};
use crate::error::{AnalysisError, Result};

/// Host copies of one checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
  pub den: Vec<f64>,
  pub fq: Vec<f64>,
}

/// Write `den` then `fq` to `path`.
pub fn write_checkpoint(path: &Path, den: &[f64], fq: &[f64]) -> Result<()> {
  let io = |e| AnalysisError::io(path, e);
  let mut out = BufWriter::new(File::create(path).map_err(io)?);
  for v in den.iter().chain(fq) {
    out.write_all(&v.to_le_bytes()).map_err(io)?;
  }
  out.flush().map_err(io)
}

/// Read a checkpoint written for `np` pore voxels.
pub fn read_checkpoint(path: &Path, np: usize) -> Result<Checkpoint> {
  let io = |e| AnalysisError::io(path, e);
  let mut bytes = Vec::new();
  File::open(path).map_err(io)?.read_to_end(&mut bytes).map_err(io)?;

  let (n_den, n_fq) = (DENSITY_COMPONENTS * np, D3Q19_Q * np);
  let expected = (n_den + n_fq) * std::mem::size_of::<f64>();
  if bytes.len() != expected {
    return Err(AnalysisError::BufferLength {
      field: "checkpoint",
      expected,
      actual: bytes.len(),
    });
  }

  let mut values = bytes.chunks_exact(8).map(|c| {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(c);
    f64::from_le_bytes(raw)
  });
  let den = values.by_ref().take(n_den).collect();
  let fq = values.collect();
  Ok(Checkpoint { den, fq })
}

/// Record the timestep a restarted run resumes from.
pub fn write_restart_timestep(path: &Path, timestep: i64) -> Result<()> {
  std::fs::write(path, format!("{}\n", timestep + RESTART_TIMESTEP_OFFSET))
    .map_err(|e| AnalysisError::io(path, e))
}

/// Read back the value written by [`write_restart_timestep`].
pub fn read_restart_timestep(path: &Path) -> Result<i64> {
  let text = std::fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
  text
    .trim()
    .parse()
    .map_err(|_| AnalysisError::Config(format!("{} does not hold a timestep", path.display())))
}
