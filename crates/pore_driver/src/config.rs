//! Configuration parsing for the synthetic driver.

use anyhow::{Context, Result};
use pore_analysis::{AnalysisConfig, DomainConfig};
use serde::Deserialize;
use std::path::Path;

/// Root configuration of a driver run.
#[derive(Debug, Deserialize)]
pub struct Config {
	/// Pipeline intervals, output location and threading.
	pub analysis: AnalysisConfig,
	/// Per-rank subdomain and process grid.
	pub domain: DomainConfig,
	/// Last timestep to run (inclusive).
	#[serde(default = "default_timesteps")]
	pub timesteps: i64,
	/// Seed for the grain and droplet placement. Every rank uses the same one.
	#[serde(default)]
	pub seed: u64,
	#[serde(default)]
	pub flow: FlowConfig,
}

/// Synthetic two-phase state fed to the pipeline.
#[derive(Debug, Deserialize)]
pub struct FlowConfig {
	/// Number of non-wetting droplets.
	#[serde(default = "default_droplets")]
	pub droplets: usize,
	#[serde(default = "default_droplet_radius")]
	pub droplet_radius: f64,
	/// Number of solid grains (0 for an open box).
	#[serde(default)]
	pub grains: usize,
	#[serde(default = "default_grain_radius")]
	pub grain_radius: f64,
	/// Droplet displacement per timestep, in voxels.
	#[serde(default = "default_drift")]
	pub drift: [f64; 3],
}

fn default_timesteps() -> i64 {
	1000
}

fn default_droplets() -> usize {
	4
}

fn default_droplet_radius() -> f64 {
	3.0
}

fn default_grain_radius() -> f64 {
	2.5
}

fn default_drift() -> [f64; 3] {
	[0.01, 0.0, 0.0]
}

impl Default for FlowConfig {
	fn default() -> Self {
		Self {
			droplets: default_droplets(),
			droplet_radius: default_droplet_radius(),
			grains: 0,
			grain_radius: default_grain_radius(),
			drift: default_drift(),
		}
	}
}

impl Config {
	/// Load configuration from a TOML file.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read config file: {}", path.display()))?;
		Self::parse(&content)
	}

	/// Parse and validate configuration text.
	pub fn parse(content: &str) -> Result<Self> {
		let config: Config =
			toml::from_str(content).with_context(|| "Failed to parse config TOML")?;

		config.analysis.validate()?;
		config.domain.validate()?;
		if config.timesteps < 0 {
			anyhow::bail!("timesteps must not be negative, got {}", config.timesteps);
		}
		if config.flow.droplet_radius <= 0.0 || config.flow.grain_radius <= 0.0 {
			anyhow::bail!("droplet and grain radii must be positive");
		}

		Ok(config)
	}
}
