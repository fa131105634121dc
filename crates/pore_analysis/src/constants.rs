//! Fixed parameters of the analysis pipeline.
//!
//! # Subdomain Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       RANK SUBDOMAIN (one axis)                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Index:   0     1     2    ...   n-3   n-2   n-1                        │
//! │           │     │                       │     │                         │
//! │           │     └──── n-2 interior ─────┘     │                         │
//! │           │                                   │                         │
//! │           └─ halo (neighbour copy)            └─ halo (neighbour copy)  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Arrays are column-major: `index = x + y * nx + z * nx * ny`.

/// Number of duplicated communicators a pipeline can lease at once.
pub const COMM_POOL_CAPACITY: usize = 1024;

/// Queue depth above which `RunAnalysis::run` drains before submitting.
pub const QUEUE_BACKPRESSURE_LIMIT: usize = 20;

/// Fluid volume-fraction threshold for blob membership (`phase > VF`).
pub const BLOB_VF: f64 = 0.0;

/// Solid buffer threshold: one voxel around the solid is excluded (`dist > VS`).
pub const BLOB_VS: f64 = -1.0;

/// Lattice directions of the D3Q19 distribution buffer.
pub const D3Q19_Q: usize = 19;

/// Components of the density buffer (two fluids).
pub const DENSITY_COMPONENTS: usize = 2;

/// Offset written to `Restart.txt` relative to the checkpointed timestep.
pub const RESTART_TIMESTEP_OFFSET: i64 = 4;

/// Timestep distance before an analysis step at which the phase field is
/// snapshotted as `phase_tplus`.
pub const PHASE_LOOKAHEAD: i64 = 8;

/// Timestep distance used by the (never firing) pre-analysis state copy.
pub const SIM_STATE_LOOKAHEAD: i64 = 4;

/// Clamp applied by the color to signed distance transform for `|phase| > 0.8`.
pub const SIGNED_DISTANCE_CLAMP: f64 = 2.94;

// Output file names (relative to the configured output directory)

pub const ID_MAP_FILENAME: &str = "lbpm_id_map.txt";
pub const RESTART_TIMESTEP_FILENAME: &str = "Restart.txt";
pub const TIMELOG_FILENAME: &str = "timelog.tcat";
pub const BLOBLOG_FILENAME: &str = "blobs.tcat";

/// Names of the visualization variables, in their fixed order.
pub const VIS_VARIABLES: [&str; 4] = ["phase", "Pressure", "SignDist", "BlobID"];

/// Mesh name of the single visualization dataset.
pub const VIS_MESH_NAME: &str = "domain";

#[cfg(test)]
#[path = "constants_test.rs"]
mod constants_test;
