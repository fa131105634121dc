//! pore_analysis - Concurrent in-situ analysis for pore-scale two-phase flow
//!
//! A lattice Boltzmann solver hands this crate its device state every
//! timestep. [`RunAnalysis`] decides from the configured intervals what the
//! step needs, copies those fields to the host on the simulation thread, and
//! queues the heavy work on a background task pool:
//!
//! - **Blob tracking**: connected non-wetting regions labelled across ranks,
//!   then matched to the previous identification so IDs persist over time
//! - **Statistics**: phase volumes, pressures, velocities and interfacial
//!   areas, reduced over all ranks and appended to the time logs
//! - **Checkpoints**: raw restart files plus `Restart.txt`
//! - **Visualization**: halo-free field dumps through a [`MeshWriter`]
//!
//! Ranks talk through the [`Communicator`] seam; [`ThreadWorld`] runs a whole
//! process grid inside one process.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pore_analysis::{AnalysisConfig, RunAnalysis, RawMeshWriter, SelfComm};
//!
//! let config = AnalysisConfig::new(1000, 100, 100).with_output_dir("out");
//! let mut analysis = RunAnalysis::new(
//!     config,
//!     &domain,
//!     Arc::new(SelfComm),
//!     map,
//!     solid_dist,
//!     Arc::new(RawMeshWriter::new("out")),
//! )?;
//! for t in 0..timesteps {
//!     solver.step();
//!     analysis.run(t, &mut solver)?;
//! }
//! analysis.finish()?;
//! ```

pub mod analysis_type;
pub mod array;
pub mod constants;
pub mod error;

pub use analysis_type::AnalysisType;
pub use array::{regular_layout, strip_halo, Array3, DoubleArray, IntArray};
pub use error::{AnalysisError, Result};

// Configuration and rank layout
pub mod config;
pub mod domain;
pub use config::{AnalysisConfig, ThreadAffinity};
pub use domain::{DomainConfig, RankInfo};

// Collective transport between ranks
pub mod comm;
pub use comm::{CommLease, CommPool, Communicator, ReduceOp, SelfComm, ThreadComm, ThreadWorld};

// Solver state seam
pub mod device;
pub use device::{build_cell_map, DeviceField, DeviceState, HostDevice};

// Connected-component tracking
pub mod blob;
pub use blob::{BlobDescriptor, BlobId, BlobIdList, BlobIds, IdCounter, IdMap};

// Averaging and output
pub mod checkpoint;
pub mod mesh;
pub mod stats;
pub use checkpoint::{read_checkpoint, read_restart_timestep, write_checkpoint, Checkpoint};
pub use mesh::{MeshDataset, MeshWriter, RawMeshWriter};
pub use stats::{BlobAverages, GlobalAverages, PhaseStatistics};

// Task scheduling
pub mod metrics;
pub mod tasks;
pub mod threading;
pub use metrics::{PipelineMetrics, TaskKind};
pub use threading::{TaskHandle, TaskId, TaskPool};

pub mod orchestrator;
pub use orchestrator::{analysis_type, RunAnalysis};
