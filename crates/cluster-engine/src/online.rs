//! Online k-means: every incident joins its nearest centroid when close enough, or starts its own cluster.

use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use tracing::{debug, trace};

use super::{
	cluster::{Cluster, ClusterId, PartitionState},
	config::EngineConfig,
	error::Error,
	geo::DistanceMetric,
	incident::IncidentPoint,
	partition::Year,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnlineClusterer {
	metric: DistanceMetric,
	assignment_radius: f64,
}

/// Result of applying a batch of incidents to a partition state.
#[derive(Debug)]
pub struct OnlineOutcome {
	/// The state to commit, only meaningful when `accepted > 0`.
	pub state: PartitionState,
	/// One entry per submitted incident, in submission order.
	pub results: Vec<Result<ClusterId, Error>>,
	pub accepted: usize,
}

impl OnlineClusterer {
	#[must_use]
	pub const fn new(metric: DistanceMetric, assignment_radius: f64) -> Self {
		Self {
			metric,
			assignment_radius,
		}
	}

	#[must_use]
	pub const fn from_config(config: &EngineConfig) -> Self {
		Self::new(config.metric, config.assignment_radius)
	}

	/// Assigns `incidents` in order on top of a copy of `state`.
	///
	/// Only `current_year` partitions may be clustered incrementally. Duplicates (already clustered, or repeated
	/// inside `incidents`) and incidents of another partition are rejected individually, they never fail the
	/// whole call.
	///
	/// Untouched clusters stay shared with `state`, the work done is proportional to the cluster count and the
	/// size of the clusters incidents join, never to the whole partition.
	pub fn apply(
		&self,
		state: &PartitionState,
		incidents: &[IncidentPoint],
		current_year: Year,
	) -> Result<OnlineOutcome, Error> {
		let year = state.partition_key.year();
		if year != current_year {
			return Err(Error::IncrementalNotAllowed { year, current_year });
		}

		let mut next = state.clone();
		let mut submitted = HashSet::with_capacity(incidents.len());

		let mut accepted = 0;

		let results = incidents
			.iter()
			.map(|incident| {
				if incident.partition_key != next.partition_key {
					return Err(Error::PartitionMismatch {
						incident_id: incident.id,
						expected: next.partition_key.clone(),
						found: incident.partition_key.clone(),
					});
				}

				if next.contains_incident(incident.id) || !submitted.insert(incident.id) {
					trace!(incident_id = incident.id, "Rejecting duplicate incident");
					return Err(Error::DuplicateIncident {
						incident_id: incident.id,
						partition: next.partition_key.clone(),
					});
				}

				accepted += 1;
				Ok(self.assign(&mut next, incident))
			})
			.collect::<Vec<_>>();

		debug!(
			partition = %next.partition_key,
			submitted = incidents.len(),
			accepted,
			clusters = next.clusters.len(),
			"Applied incidents"
		);

		Ok(OnlineOutcome {
			state: next,
			results,
			accepted,
		})
	}

	/// Nearest centroid in `state`, lowest cluster id winning ties.
	#[must_use]
	pub fn nearest(&self, state: &PartitionState, incident: &IncidentPoint) -> Option<(ClusterId, f64)> {
		let point = incident.coordinate();

		state
			.clusters
			.values()
			.map(|cluster| (cluster.cluster_id, self.metric.distance(cluster.centroid(), point)))
			.fold(None, |best, (cluster_id, distance)| match best {
				Some((_, best_distance)) if best_distance <= distance => best,
				_ => Some((cluster_id, distance)),
			})
	}

	#[allow(clippy::cast_precision_loss)]
	fn assign(&self, state: &mut PartitionState, incident: &IncidentPoint) -> ClusterId {
		let now = Utc::now();

		let target = self
			.nearest(state, incident)
			.filter(|(_, distance)| *distance <= self.assignment_radius)
			.and_then(|(cluster_id, _)| state.clusters.get_mut(&cluster_id))
			.map(Arc::make_mut);

		if let Some(cluster) = target {
			let previous_centroid = cluster.centroid();

			cluster.member_count += 1;
			let n = cluster.member_count as f64;
			cluster.centroid_lat += (incident.latitude - cluster.centroid_lat) / n;
			cluster.centroid_lon += (incident.longitude - cluster.centroid_lon) / n;
			cluster.member_ids.insert(incident.id);

			// Every older member moved at most `shift` relative to the centroid
			let shift = self.metric.distance(previous_centroid, cluster.centroid());
			cluster.radius_estimate = (cluster.radius_estimate + shift)
				.max(self.metric.distance(cluster.centroid(), incident.coordinate()));
			cluster.updated_at = now;

			trace!(
				incident_id = incident.id,
				cluster_id = cluster.cluster_id,
				members = cluster.member_count,
				"Incident joined cluster"
			);

			cluster.cluster_id
		} else {
			let cluster_id = state.allocate_cluster_id();
			state
				.clusters
				.insert(cluster_id, Arc::new(Cluster::seed(cluster_id, incident, now)));

			trace!(incident_id = incident.id, cluster_id, "Incident seeded a new cluster");

			cluster_id
		}
	}
}
