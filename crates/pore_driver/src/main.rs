//! Synthetic driver for the pore analysis pipeline.
//!
//! Runs every rank of the configured process grid as a thread of this
//! process, feeds each one a drifting-droplet state and reports what the
//! pipeline found.

mod config;
mod synthetic;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Sender;
use pore_analysis::{
	Communicator, PipelineMetrics, RawMeshWriter, RunAnalysis, TaskKind, ThreadAffinity, ThreadComm,
	ThreadWorld,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

use config::Config;
use synthetic::SyntheticFlow;

/// Concurrent analysis pipeline on a synthetic two-phase flow.
#[derive(Parser, Debug)]
#[command(name = "pore_driver")]
#[command(about = "Runs the blob tracking and checkpoint pipeline on synthetic data")]
struct Args {
	/// Path to configuration TOML file.
	#[arg(short, long)]
	config: PathBuf,

	/// Output directory (overrides the config).
	#[arg(short, long)]
	output_dir: Option<PathBuf>,

	/// Last timestep to run (overrides the config).
	#[arg(short, long)]
	timesteps: Option<i64>,

	/// Thread placement: none, default or independent.
	#[arg(long)]
	affinity: Option<String>,

	/// Worker threads per rank for the default placement.
	#[arg(long)]
	threads: Option<usize>,
}

/// What one rank reports back once its pipeline has drained.
struct RankSummary {
	rank: usize,
	max_blob_id: i32,
	blobs: usize,
	metrics: PipelineMetrics,
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let mut config = Config::load(&args.config)?;
	if let Some(dir) = args.output_dir {
		config.analysis.output_dir = dir;
	}
	if let Some(timesteps) = args.timesteps {
		config.timesteps = timesteps;
	}
	if let Some(method) = &args.affinity {
		config.analysis.thread_affinity = ThreadAffinity::parse(method)?;
	}
	if let Some(threads) = args.threads {
		config.analysis.analysis_threads = threads;
	}

	let ranks = config.domain.ranks();
	// Blob and averaging chains each hold a collective; both must be able to run
	if ranks > 1
		&& config.analysis.thread_affinity == ThreadAffinity::Default
		&& config.analysis.analysis_threads < 2
	{
		tracing::warn!(
			threads = config.analysis.analysis_threads,
			"multi-rank runs need two analysis threads per rank, using 2"
		);
		config.analysis.analysis_threads = 2;
	}

	println!("Loaded config from: {}", args.config.display());
	println!(
		"Running {} rank(s) of {}x{}x{} for {} timesteps",
		ranks, config.domain.nx, config.domain.ny, config.domain.nz, config.timesteps
	);

	let config = Arc::new(config);
	let (results, summaries) = crossbeam_channel::unbounded();
	let handles = ThreadWorld::create(ranks)
		.into_iter()
		.map(|comm| {
			let config = Arc::clone(&config);
			let results = results.clone();
			thread::Builder::new()
				.name(format!("rank-{}", comm.rank()))
				.spawn(move || run_rank(&config, comm, &results))
		})
		.collect::<std::io::Result<Vec<_>>>()
		.context("Failed to spawn rank threads")?;
	drop(results);

	for handle in handles {
		handle
			.join()
			.map_err(|_| anyhow::anyhow!("rank thread panicked"))??;
	}

	let mut summaries: Vec<RankSummary> = summaries.iter().collect();
	summaries.sort_by_key(|s| s.rank);
	report(&summaries);

	println!("\nDone! Output written to: {}", config.analysis.output_dir.display());
	Ok(())
}

fn run_rank(config: &Config, comm: ThreadComm, results: &Sender<RankSummary>) -> Result<()> {
	let rank = comm.rank();
	let _span = tracing::info_span!("rank", rank).entered();

	let mut flow = SyntheticFlow::new(config, config.domain.rank_info(rank));
	let writer = RawMeshWriter::new(&config.analysis.output_dir);
	let mut analysis = RunAnalysis::new(
		config.analysis.clone(),
		&config.domain,
		Arc::new(comm),
		flow.cell_map().clone(),
		flow.solid_distance().clone(),
		Arc::new(writer),
	)
	.with_context(|| format!("Failed to set up the pipeline on rank {rank}"))?;

	for timestep in 0..=config.timesteps {
		flow.step(timestep);
		analysis
			.run(timestep, &mut flow)
			.with_context(|| format!("Analysis failed on rank {rank} at timestep {timestep}"))?;
	}
	analysis
		.finish()
		.with_context(|| format!("Background tasks failed on rank {rank}"))?;

	results
		.send(RankSummary {
			rank,
			max_blob_id: analysis.max_blob_id(),
			blobs: analysis.statistics().count,
			metrics: analysis.metrics(),
		})
		.context("Failed to report rank summary")?;
	Ok(())
}

fn report(summaries: &[RankSummary]) {
	for summary in summaries {
		println!(
			"\nrank {}: {} blob(s) at the last identification, {} ID(s) issued",
			summary.rank,
			summary.blobs,
			summary.max_blob_id + 1
		);
		for kind in TaskKind::ALL {
			let count = summary.metrics.count(kind);
			if count > 0 {
				println!(
					"  {:<20} {:>6} runs  {:>10.1} us avg",
					kind.name(),
					count,
					summary.metrics.avg_timing_us(kind)
				);
			}
		}
		if summary.metrics.backpressure_drains > 0 {
			println!("  queue drained {} time(s)", summary.metrics.backpressure_drains);
		}
	}
}
