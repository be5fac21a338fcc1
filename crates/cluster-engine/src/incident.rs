use std::collections::HashSet;

use async_channel as chan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{trace, warn};

use super::{
	error::Error,
	geo::Coordinate,
	partition::{resolve, DistrictId, PartitionKey, ResolvePartition, Year},
};

pub type IncidentId = i64;

/// An incident as the source hands it over, partition parts may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
	pub id: IncidentId,
	pub latitude: f64,
	pub longitude: f64,
	pub timestamp: DateTime<Utc>,
	#[serde(default)]
	pub district_id: Option<DistrictId>,
	#[serde(default)]
	pub category: String,
	#[serde(default)]
	pub year: Option<Year>,
	#[serde(default)]
	pub month: Option<u32>,
	#[serde(default)]
	pub source_type: Option<String>,
}

impl ResolvePartition for IncidentRecord {
	fn partition_key(&self) -> Result<PartitionKey, Error> {
		resolve(self.year, self.source_type.as_deref(), None)
	}
}

/// A resolved, validated incident. Immutable, the engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentPoint {
	pub id: IncidentId,
	pub latitude: f64,
	pub longitude: f64,
	pub timestamp: DateTime<Utc>,
	pub district_id: Option<DistrictId>,
	pub category: String,
	pub partition_key: PartitionKey,
}

impl IncidentPoint {
	/// Resolves the record's base partition and checks its coordinates.
	pub fn from_record(record: &IncidentRecord) -> Result<Self, Error> {
		let partition_key = record.partition_key()?;

		if !Coordinate::new(record.latitude, record.longitude).is_valid() {
			return Err(Error::InvalidCoordinates {
				id: record.id,
				latitude: record.latitude,
				longitude: record.longitude,
			});
		}

		Ok(Self {
			id: record.id,
			latitude: record.latitude,
			longitude: record.longitude,
			timestamp: record.timestamp,
			district_id: record.district_id,
			category: record.category.clone(),
			partition_key,
		})
	}

	#[must_use]
	pub const fn coordinate(&self) -> Coordinate {
		Coordinate::new(self.latitude, self.longitude)
	}

	/// The same incident viewed from another partition, used to feed district scoped partitions.
	#[must_use]
	pub fn rekeyed(&self, partition_key: PartitionKey) -> Self {
		Self {
			partition_key,
			..self.clone()
		}
	}

	/// Whether this incident falls into `key`, district scope included.
	#[must_use]
	pub fn belongs_to(&self, key: &PartitionKey) -> bool {
		self.partition_key.base() == key.base()
			&& key
				.district_id()
				.map_or(true, |district_id| self.district_id == Some(district_id))
	}
}

/// The external collaborator owning incidents.
#[async_trait]
pub trait IncidentSource: Send + Sync + 'static {
	/// Every incident of the partition, keyed with the requested partition key.
	async fn list_by_partition(&self, key: &PartitionKey) -> Result<Vec<IncidentPoint>, Error>;

	/// Insert notifications, one record per newly ingested incident.
	fn subscribe_inserts(&self) -> chan::Receiver<IncidentRecord>;
}

/// An [`IncidentSource`] backed by memory, used by tests and the cli.
///
/// All receivers returned by [`IncidentSource::subscribe_inserts`] share one queue, so each notification is
/// delivered to exactly one of them.
#[derive(Debug)]
pub struct InMemoryIncidentSource {
	records: RwLock<Vec<IncidentRecord>>,
	inserts_tx: chan::Sender<IncidentRecord>,
	inserts_rx: chan::Receiver<IncidentRecord>,
}

impl Default for InMemoryIncidentSource {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryIncidentSource {
	#[must_use]
	pub fn new() -> Self {
		let (inserts_tx, inserts_rx) = chan::unbounded();

		Self {
			records: RwLock::new(Vec::new()),
			inserts_tx,
			inserts_rx,
		}
	}

	/// Stores a record and emits an insert notification for it.
	pub async fn insert(&self, record: IncidentRecord) {
		self.records.write().await.push(record.clone());

		if self.inserts_tx.send(record).await.is_err() {
			warn!("Incident insert channel closed, notification dropped");
		}
	}

	/// Bulk loads historical records without emitting insert notifications.
	pub async fn extend(&self, records: impl IntoIterator<Item = IncidentRecord> + Send) {
		self.records.write().await.extend(records);
	}

	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}
}

#[async_trait]
impl IncidentSource for InMemoryIncidentSource {
	async fn list_by_partition(&self, key: &PartitionKey) -> Result<Vec<IncidentPoint>, Error> {
		let records = self.records.read().await;
		let mut seen = HashSet::with_capacity(records.len());

		let points = records
			.iter()
			.filter_map(|record| {
				IncidentPoint::from_record(record)
					.map_err(|e| warn!(incident_id = record.id, ?e, "Skipping malformed incident;"))
					.ok()
			})
			.filter(|point| point.belongs_to(key))
			// Later re-inserts of an id are ignored, the first record wins
			.filter(|point| seen.insert(point.id))
			.map(|point| point.rekeyed(key.clone()))
			.collect::<Vec<_>>();

		trace!(partition = %key, count = points.len(), "Listed incidents");

		Ok(points)
	}

	fn subscribe_inserts(&self) -> chan::Receiver<IncidentRecord> {
		self.inserts_rx.clone()
	}
}
