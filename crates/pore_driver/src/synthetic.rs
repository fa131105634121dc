//! Synthetic solver state: non-wetting droplets drifting through a bed of
//! solid grains.
//!
//! Geometry is generated in global interior coordinates from the shared seed,
//! so every rank sees the same grains and droplets and only fills in its own
//! subdomain.

use glam::DVec3;
use pore_analysis::constants::D3Q19_Q;
use pore_analysis::device::D3Q19_VELOCITIES;
use pore_analysis::{
	build_cell_map, DeviceField, DeviceState, DoubleArray, HostDevice, IntArray, RankInfo,
	Result,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;

/// Solid distance used where no grain is in range.
const OPEN_DISTANCE: f64 = 1.0e3;

/// Phase-field interface half width, in voxels.
const INTERFACE_WIDTH: f64 = 1.0;

#[derive(Clone, Copy, Debug)]
struct Sphere {
	center: DVec3,
	radius: f64,
}

/// Host-side stand-in for the lattice Boltzmann solver of one rank.
pub struct SyntheticFlow {
	device: HostDevice,
	map: IntArray,
	dist: DoubleArray,
	/// Global interior coordinate of local voxel (1, 1, 1).
	origin: DVec3,
	extent: DVec3,
	periodic: bool,
	droplets: Vec<Sphere>,
	drift: DVec3,
}

impl SyntheticFlow {
	pub fn new(config: &Config, rank_info: RankInfo) -> Self {
		let domain = &config.domain;
		let [nx, ny, nz] = domain.dims();
		let interior = [nx - 2, ny - 2, nz - 2];
		let offset = rank_info.global_offset(interior);
		let global = rank_info.global_dims(interior);
		let origin = DVec3::new(offset[0] as f64, offset[1] as f64, offset[2] as f64);
		let extent = DVec3::new(global[0] as f64, global[1] as f64, global[2] as f64);

		let mut rng = StdRng::seed_from_u64(config.seed);
		let mut place = |radius: f64| Sphere {
			center: DVec3::new(
				rng.random_range(0.0..extent.x),
				rng.random_range(0.0..extent.y),
				rng.random_range(0.0..extent.z),
			),
			radius,
		};
		let grains: Vec<_> = (0..config.flow.grains)
			.map(|_| place(config.flow.grain_radius))
			.collect();
		let droplets: Vec<_> = (0..config.flow.droplets)
			.map(|_| place(config.flow.droplet_radius))
			.collect();

		let mut flow = Self {
			device: HostDevice::new(domain.n(), 0),
			map: IntArray::new(nx, ny, nz, -1),
			dist: DoubleArray::new(nx, ny, nz, OPEN_DISTANCE),
			origin,
			extent,
			periodic: domain.periodic,
			droplets,
			drift: DVec3::from_array(config.flow.drift),
		};

		for z in 0..nz {
			for y in 0..ny {
				for x in 0..nx {
					let p = flow.global_position(x, y, z);
					let d = grains
						.iter()
						.map(|g| flow.separation(p, g.center) - g.radius)
						.fold(OPEN_DISTANCE, f64::min);
					flow.dist[(x, y, z)] = d;
				}
			}
		}

		let (map, np) = build_cell_map(&flow.dist);
		flow.map = map;
		flow.device = HostDevice::new(domain.n(), np);
		flow.fill_distributions();
		tracing::debug!(
			rank = rank_info.rank,
			np,
			grains = grains.len(),
			"synthetic state ready"
		);
		flow
	}

	pub fn cell_map(&self) -> &IntArray {
		&self.map
	}

	pub fn solid_distance(&self) -> &DoubleArray {
		&self.dist
	}

	/// Advance the droplets to `timestep` and rewrite the phase and density.
	pub fn step(&mut self, timestep: i64) {
		let shift = self.drift * timestep as f64;
		let centers: Vec<_> = self
			.droplets
			.iter()
			.map(|d| (self.wrap(d.center + shift), d.radius))
			.collect();

		let [nx, ny, nz] = self.dist.dims();
		let np = self.device.np();
		let mut phi = vec![-1.0; nx * ny * nz];
		let mut nonwetting = vec![0.0; np];
		for z in 0..nz {
			for y in 0..ny {
				for x in 0..nx {
					let p = self.global_position(x, y, z);
					// Signed distance to the nearest droplet surface, negative inside
					let d = centers
						.iter()
						.map(|&(c, r)| self.separation(p, c) - r)
						.fold(f64::INFINITY, f64::min);
					let value = (-d / INTERFACE_WIDTH).clamp(-1.0, 1.0);
					let index = self.dist.index_of(x, y, z);
					phi[index] = value;
					if let Ok(i) = usize::try_from(self.map[(x, y, z)]) {
						nonwetting[i] = 0.5 * (1.0 + value);
					}
				}
			}
		}

		self.device.phi_mut().copy_from_slice(&phi);
		let den = self.device.density_mut();
		for (i, &n) in nonwetting.iter().enumerate() {
			den[i] = 1.0 - n;
			den[np + i] = n;
		}
	}

	/// Equilibrium distributions for a uniform flow along the drift.
	fn fill_distributions(&mut self) {
		let np = self.device.np();
		let u = self.drift;
		let fq = self.device.distributions_mut();
		for q in 0..D3Q19_Q {
			let c = D3Q19_VELOCITIES[q];
			let weight = match q {
				0 => 1.0 / 3.0,
				1..=6 => 1.0 / 18.0,
				_ => 1.0 / 36.0,
			};
			let cu = c[0] as f64 * u.x + c[1] as f64 * u.y + c[2] as f64 * u.z;
			let f = weight * (1.0 + 3.0 * cu);
			fq[q * np..(q + 1) * np].fill(f);
		}
	}

	fn global_position(&self, x: usize, y: usize, z: usize) -> DVec3 {
		self.origin + DVec3::new(x as f64, y as f64, z as f64) - DVec3::ONE
	}

	fn wrap(&self, p: DVec3) -> DVec3 {
		DVec3::new(
			p.x.rem_euclid(self.extent.x),
			p.y.rem_euclid(self.extent.y),
			p.z.rem_euclid(self.extent.z),
		)
	}

	/// Distance between two global points, minimum image when periodic.
	fn separation(&self, a: DVec3, b: DVec3) -> f64 {
		let mut d = a - b;
		if self.periodic {
			d -= self.extent * (d / self.extent).round();
		}
		d.length()
	}
}

impl DeviceState for SyntheticFlow {
	fn n(&self) -> usize {
		self.device.n()
	}

	fn np(&self) -> usize {
		self.device.np()
	}

	fn device_barrier(&mut self) {
		self.device.device_barrier();
	}

	fn copy_to_host(&self, field: DeviceField, dst: &mut [f64]) -> Result<()> {
		self.device.copy_to_host(field, dst)
	}

	fn compute_pressure(&mut self) {
		self.device.compute_pressure();
	}

	fn compute_velocity(&mut self) {
		self.device.compute_velocity();
	}
}
