use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
	geo::Coordinate,
	incident::{IncidentId, IncidentPoint},
	partition::PartitionKey,
};

pub type ClusterId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
	pub cluster_id: ClusterId,
	pub partition_key: PartitionKey,
	pub centroid_lat: f64,
	pub centroid_lon: f64,
	pub member_count: usize,
	pub member_ids: BTreeSet<IncidentId>,
	/// Spread of the members around the centroid, in the configured metric's unit.
	///
	/// Exact after a batch recompute, an upper bound after online updates.
	pub radius_estimate: f64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Cluster {
	/// A single member cluster centered on the incident.
	pub(crate) fn seed(cluster_id: ClusterId, point: &IncidentPoint, now: DateTime<Utc>) -> Self {
		Self {
			cluster_id,
			partition_key: point.partition_key.clone(),
			centroid_lat: point.latitude,
			centroid_lon: point.longitude,
			member_count: 1,
			member_ids: BTreeSet::from([point.id]),
			radius_estimate: 0.0,
			created_at: now,
			updated_at: now,
		}
	}

	#[must_use]
	pub const fn centroid(&self) -> Coordinate {
		Coordinate::new(self.centroid_lat, self.centroid_lon)
	}

	#[must_use]
	pub fn contains(&self, incident_id: IncidentId) -> bool {
		self.member_ids.contains(&incident_id)
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
	#[default]
	Stable,
	Recomputing,
}

/// Every cluster of a partition plus the version of the last committed mutation.
///
/// Version 0 means nothing was ever committed for the partition. Clusters are shared between consecutive
/// versions, so cloning a state is linear in its cluster count and a writer only copies the clusters it touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
	pub partition_key: PartitionKey,
	pub clusters: BTreeMap<ClusterId, Arc<Cluster>>,
	pub version: u64,
	pub mode: PartitionMode,
	pub k_hint: Option<usize>,
	pub next_cluster_id: ClusterId,
	pub updated_at: Option<DateTime<Utc>>,
}

impl PartitionState {
	#[must_use]
	pub const fn empty(partition_key: PartitionKey) -> Self {
		Self {
			partition_key,
			clusters: BTreeMap::new(),
			version: 0,
			mode: PartitionMode::Stable,
			k_hint: None,
			next_cluster_id: 1,
			updated_at: None,
		}
	}

	#[must_use]
	pub fn total_members(&self) -> usize {
		self.clusters.values().map(|cluster| cluster.member_count).sum()
	}

	#[must_use]
	pub fn cluster_of(&self, incident_id: IncidentId) -> Option<ClusterId> {
		self.clusters
			.values()
			.find(|cluster| cluster.contains(incident_id))
			.map(|cluster| cluster.cluster_id)
	}

	#[must_use]
	pub fn contains_incident(&self, incident_id: IncidentId) -> bool {
		self.cluster_of(incident_id).is_some()
	}

	pub(crate) fn allocate_cluster_id(&mut self) -> ClusterId {
		let cluster_id = self.next_cluster_id;
		self.next_cluster_id += 1;
		cluster_id
	}
}

/// What changed between two states of the same partition, as seen by one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDiff {
	pub added: Vec<Arc<Cluster>>,
	pub updated: Vec<Arc<Cluster>>,
	pub removed: Vec<ClusterId>,
}

impl ClusterDiff {
	#[must_use]
	pub fn between(previous: Option<&PartitionState>, current: &PartitionState) -> Self {
		let Some(previous) = previous else {
			return Self {
				added: current.clusters.values().cloned().collect(),
				..Default::default()
			};
		};

		let mut diff = Self::default();

		for (cluster_id, cluster) in &current.clusters {
			match previous.clusters.get(cluster_id) {
				None => diff.added.push(Arc::clone(cluster)),
				Some(old) if !Arc::ptr_eq(old, cluster) && old != cluster => {
					diff.updated.push(Arc::clone(cluster));
				}
				Some(_) => {}
			}
		}

		diff.removed = previous
			.clusters
			.keys()
			.filter(|cluster_id| !current.clusters.contains_key(cluster_id))
			.copied()
			.collect();

		diff
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn point(id: IncidentId, latitude: f64, longitude: f64) -> IncidentPoint {
		IncidentPoint {
			id,
			latitude,
			longitude,
			timestamp: Utc::now(),
			district_id: None,
			category: "theft".to_string(),
			partition_key: PartitionKey::new(2024, "cbt").expect("valid key"),
		}
	}

	#[test]
	fn diff_tracks_added_updated_and_removed() {
		let key = PartitionKey::new(2024, "cbt").expect("valid key");
		let now = Utc::now();

		let mut before = PartitionState::empty(key);
		let first = before.allocate_cluster_id();
		let second = before.allocate_cluster_id();
		before
			.clusters
			.insert(first, Arc::new(Cluster::seed(first, &point(1, 1.0, 1.0), now)));
		before
			.clusters
			.insert(second, Arc::new(Cluster::seed(second, &point(2, 5.0, 5.0), now)));

		let initial = ClusterDiff::between(None, &before);
		assert_eq!(initial.added.len(), 2);

		let mut after = before.clone();
		after.clusters.remove(&second);
		if let Some(cluster) = after.clusters.get_mut(&first).map(Arc::make_mut) {
			cluster.member_ids.insert(3);
			cluster.member_count = 2;
		}
		let third = after.allocate_cluster_id();
		after
			.clusters
			.insert(third, Arc::new(Cluster::seed(third, &point(4, 9.0, 9.0), now)));

		let diff = ClusterDiff::between(Some(&before), &after);
		assert_eq!(diff.added.iter().map(|c| c.cluster_id).collect::<Vec<_>>(), vec![third]);
		assert_eq!(diff.updated.iter().map(|c| c.cluster_id).collect::<Vec<_>>(), vec![first]);
		assert_eq!(diff.removed, vec![second]);

		assert!(ClusterDiff::between(Some(&after), &after).is_empty());
	}

	#[test]
	fn membership_lookups() {
		let mut state = PartitionState::empty(PartitionKey::new(2024, "cbt").expect("valid key"));
		let cluster_id = state.allocate_cluster_id();
		state
			.clusters
			.insert(cluster_id, Arc::new(Cluster::seed(cluster_id, &point(42, 0.0, 0.0), Utc::now())));

		assert_eq!(state.cluster_of(42), Some(cluster_id));
		assert!(!state.contains_incident(43));
		assert_eq!(state.total_members(), 1);
		assert_eq!(state.next_cluster_id, cluster_id + 1);
	}
}
