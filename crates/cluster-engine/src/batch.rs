//! Full recomputation of a partition: k-means++ seeding followed by Lloyd's iterations.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use chrono::Utc;
use rand::{
	distributions::{Distribution, WeightedIndex},
	Rng,
};
use tracing::{debug, trace, warn};

use super::{
	cluster::{Cluster, PartitionMode, PartitionState},
	config::EngineConfig,
	error::Error,
	geo::{self, Coordinate, DistanceMetric},
	incident::IncidentPoint,
	job::CancelFlag,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchClusterer {
	metric: DistanceMetric,
	k_min: usize,
	k_max: usize,
	max_iterations: usize,
}

#[derive(Debug)]
pub struct BatchOutcome {
	/// Replacement state, ready to be committed over the state it was computed from.
	pub state: PartitionState,
	pub k: usize,
	pub iterations: usize,
	/// `false` when Lloyd's loop stopped at the iteration cap.
	pub converged: bool,
	/// Sum of squared member distances to their centroid.
	pub inertia: f64,
}

impl BatchClusterer {
	#[must_use]
	pub const fn new(metric: DistanceMetric, k_min: usize, k_max: usize, max_iterations: usize) -> Self {
		Self {
			metric,
			k_min,
			k_max,
			max_iterations,
		}
	}

	#[must_use]
	pub const fn from_config(config: &EngineConfig) -> Self {
		Self::new(
			config.metric,
			config.k_min,
			config.k_max,
			config.max_iterations,
		)
	}

	/// Number of clusters to look for among `n` points, always within `[1, n]` (0 only for no points).
	#[allow(
		clippy::cast_precision_loss,
		clippy::cast_possible_truncation,
		clippy::cast_sign_loss
	)]
	pub fn choose_k(&self, n: usize, k_hint: Option<usize>) -> Result<usize, Error> {
		if k_hint == Some(0) {
			return Err(Error::InvalidKHint);
		}

		if n == 0 {
			return Ok(0);
		}

		let k = k_hint.unwrap_or_else(|| {
			((n as f64 / 2.0).sqrt().round() as usize).clamp(self.k_min, self.k_max)
		});

		Ok(k.clamp(1, n))
	}

	/// Clusters `points` from scratch into a brand new state meant to replace `previous`.
	///
	/// A missing `k_hint` falls back to the hint stored in `previous`, then to the `sqrt(n/2)` heuristic.
	/// Results depend on `rng`, two runs over the same points may disagree.
	pub fn run<R: Rng>(
		&self,
		previous: &PartitionState,
		points: &[IncidentPoint],
		k_hint: Option<usize>,
		cancel: &CancelFlag,
		rng: &mut R,
	) -> Result<BatchOutcome, Error> {
		let k_hint = k_hint.or(previous.k_hint);
		let k = self.choose_k(points.len(), k_hint)?;

		let coordinates = points
			.iter()
			.map(IncidentPoint::coordinate)
			.collect::<Vec<_>>();

		let mut centroids = self.seed(&coordinates, k, cancel, rng)?;

		let mut assignments = vec![usize::MAX; coordinates.len()];
		let mut iterations = 0;
		let mut converged = coordinates.is_empty();

		while !converged && iterations < self.max_iterations {
			cancel.check()?;
			iterations += 1;

			if !self.assign_all(&coordinates, &centroids, &mut assignments) {
				converged = true;
				break;
			}

			for (index, centroid) in centroids.iter_mut().enumerate() {
				// Empty groups keep their centroid, they're dropped once the loop ends
				if let Some(mean) = geo::mean(
					coordinates
						.iter()
						.zip(&assignments)
						.filter(|(_, assigned)| **assigned == index)
						.map(|(coordinate, _)| *coordinate),
				) {
					*centroid = mean;
				}
			}

			trace!(iterations, "Lloyd's iteration done");
		}

		cancel.check()?;

		let (state, inertia) = self.build_state(previous, points, &assignments, centroids.len(), k_hint);

		if converged {
			debug!(
				partition = %state.partition_key,
				k,
				clusters = state.clusters.len(),
				iterations,
				inertia,
				"Batch clustering converged"
			);
		} else {
			warn!(
				partition = %state.partition_key,
				k,
				iterations,
				"Batch clustering hit the iteration cap before converging"
			);
		}

		Ok(BatchOutcome {
			state,
			k,
			iterations,
			converged,
			inertia,
		})
	}

	/// k-means++: uniform first pick, then picks weighted by the squared distance to the closest chosen centroid.
	fn seed<R: Rng>(
		&self,
		coordinates: &[Coordinate],
		k: usize,
		cancel: &CancelFlag,
		rng: &mut R,
	) -> Result<Vec<Coordinate>, Error> {
		let mut centroids = Vec::with_capacity(k);

		if k == 0 || coordinates.is_empty() {
			return Ok(centroids);
		}

		let first = coordinates[rng.gen_range(0..coordinates.len())];
		centroids.push(first);

		let mut weights = coordinates
			.iter()
			.map(|coordinate| self.metric.squared_distance(*coordinate, first))
			.collect::<Vec<_>>();

		while centroids.len() < k {
			cancel.check()?;

			let picked = match WeightedIndex::<f64>::new(&weights) {
				Ok(distribution) => coordinates[distribution.sample(rng)],
				Err(e) => {
					// Every remaining point sits on a chosen centroid
					trace!(?e, found = centroids.len(), k, "Stopping seeding early");
					break;
				}
			};

			centroids.push(picked);

			for (weight, coordinate) in weights.iter_mut().zip(coordinates) {
				*weight = weight.min(self.metric.squared_distance(*coordinate, picked));
			}
		}

		Ok(centroids)
	}

	/// Moves every point to its nearest centroid, returns whether any assignment changed.
	fn assign_all(
		&self,
		coordinates: &[Coordinate],
		centroids: &[Coordinate],
		assignments: &mut [usize],
	) -> bool {
		let mut changed = false;

		for (coordinate, assigned) in coordinates.iter().zip(assignments.iter_mut()) {
			let nearest = centroids
				.iter()
				.enumerate()
				.map(|(index, centroid)| (index, self.metric.squared_distance(*coordinate, *centroid)))
				.fold(None, |best: Option<(usize, f64)>, (index, distance)| match best {
					Some((_, best_distance)) if best_distance <= distance => best,
					_ => Some((index, distance)),
				})
				.map_or(usize::MAX, |(index, _)| index);

			if *assigned != nearest {
				*assigned = nearest;
				changed = true;
			}
		}

		changed
	}

	fn build_state(
		&self,
		previous: &PartitionState,
		points: &[IncidentPoint],
		assignments: &[usize],
		groups: usize,
		k_hint: Option<usize>,
	) -> (PartitionState, f64) {
		let now = Utc::now();

		let mut state = PartitionState {
			partition_key: previous.partition_key.clone(),
			clusters: BTreeMap::new(),
			version: previous.version,
			mode: PartitionMode::Stable,
			k_hint,
			next_cluster_id: previous.next_cluster_id,
			updated_at: previous.updated_at,
		};

		let mut inertia = 0.0;

		for group in 0..groups {
			let members = points
				.iter()
				.zip(assignments)
				.filter(|(_, assigned)| **assigned == group)
				.map(|(point, _)| point)
				.collect::<Vec<_>>();

			let Some(centroid) = geo::mean(members.iter().map(|point| point.coordinate())) else {
				continue;
			};

			let mut radius_estimate = 0.0f64;
			for member in &members {
				let distance = self.metric.distance(member.coordinate(), centroid);
				radius_estimate = radius_estimate.max(distance);
				inertia += self.metric.squared_distance(member.coordinate(), centroid);
			}

			let cluster_id = state.allocate_cluster_id();
			state.clusters.insert(
				cluster_id,
				Arc::new(Cluster {
					cluster_id,
					partition_key: state.partition_key.clone(),
					centroid_lat: centroid.latitude,
					centroid_lon: centroid.longitude,
					member_count: members.len(),
					member_ids: members.iter().map(|point| point.id).collect::<BTreeSet<_>>(),
					radius_estimate,
					created_at: now,
					updated_at: now,
				}),
			);
		}

		(state, inertia)
	}
}

/// Moves a computed batch state on top of `current`, which changed while the batch was running.
///
/// Cluster ids are reallocated from `current`'s counter so none of them is ever reused.
#[must_use]
pub fn rebase(mut state: PartitionState, current: &PartitionState) -> PartitionState {
	let clusters = std::mem::take(&mut state.clusters);

	let mut rebased = PartitionState {
		version: current.version,
		next_cluster_id: current.next_cluster_id.max(state.next_cluster_id),
		updated_at: current.updated_at,
		..state
	};

	for mut cluster in clusters.into_values() {
		let cluster_id = rebased.allocate_cluster_id();
		Arc::make_mut(&mut cluster).cluster_id = cluster_id;
		rebased.clusters.insert(cluster_id, cluster);
	}

	rebased
}
