//! The Cluster Store: the single source of truth for every partition's clusters.
//!
//! Each partition lives in its own [`watch`] channel holding an immutable [`PartitionState`] snapshot.
//! Readers clone the [`Arc`], broadcasters subscribe to the channel, and the partition's single writer swaps the
//! whole snapshot in with a compare-and-swap on `version`, so a half written state is never observable.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, instrument, trace, warn};

use super::{
	cluster::{PartitionMode, PartitionState},
	error::Error,
	partition::PartitionKey,
};

type Slot = Arc<watch::Sender<Arc<PartitionState>>>;

#[derive(Debug, Default)]
pub struct ClusterStore {
	partitions: RwLock<HashMap<PartitionKey, Slot>>,
}

impl ClusterStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	async fn slot(&self, key: &PartitionKey) -> Slot {
		if let Some(slot) = self.partitions.read().await.get(key) {
			return Arc::clone(slot);
		}

		Arc::clone(
			self.partitions
				.write()
				.await
				.entry(key.clone())
				.or_insert_with(|| {
					trace!(partition = %key, "Creating partition slot");
					let (tx, _rx) = watch::channel(Arc::new(PartitionState::empty(key.clone())));
					Arc::new(tx)
				}),
		)
	}

	/// Whether any job or subscriber ever touched this partition.
	pub async fn contains(&self, key: &PartitionKey) -> bool {
		self.partitions.read().await.contains_key(key)
	}

	pub async fn partitions(&self) -> Vec<PartitionKey> {
		let mut keys = self
			.partitions
			.read()
			.await
			.keys()
			.cloned()
			.collect::<Vec<_>>();
		keys.sort();
		keys
	}

	/// Point in time read. Unknown partitions read as an empty version 0 state.
	pub async fn snapshot(&self, key: &PartitionKey) -> Arc<PartitionState> {
		match self.partitions.read().await.get(key) {
			Some(slot) => Arc::clone(&slot.borrow()),
			None => Arc::new(PartitionState::empty(key.clone())),
		}
	}

	/// Change feed of a partition, creating its (empty) slot if needed.
	pub async fn subscribe(&self, key: &PartitionKey) -> watch::Receiver<Arc<PartitionState>> {
		self.slot(key).await.subscribe()
	}

	/// Atomically replaces the partition state if its version is still `expected_version`.
	///
	/// The committed state gets `expected_version + 1` as its version. On a version mismatch nothing is written
	/// and [`Error::StoreCommitConflict`] is returned so the writer can retry against a fresh snapshot.
	#[instrument(skip(self, next), fields(partition = %next.partition_key), err)]
	pub async fn commit(
		&self,
		mut next: PartitionState,
		expected_version: u64,
	) -> Result<Arc<PartitionState>, Error> {
		let slot = self.slot(&next.partition_key).await;

		next.version = expected_version + 1;
		next.updated_at = Some(Utc::now());
		let next = Arc::new(next);

		let mut found_version = expected_version;

		let committed = slot.send_if_modified(|current| {
			if current.version == expected_version {
				*current = Arc::clone(&next);
				true
			} else {
				found_version = current.version;
				false
			}
		});

		if committed {
			debug!(
				version = next.version,
				clusters = next.clusters.len(),
				members = next.total_members(),
				"Committed partition state"
			);
			Ok(next)
		} else {
			warn!(
				expected_version,
				found_version, "Partition state changed under the writer"
			);
			Err(Error::StoreCommitConflict {
				partition: next.partition_key.clone(),
				expected: expected_version,
				found: found_version,
			})
		}
	}

	/// Flips the partition mode in place. Not a committed mutation: no version bump, subscribers aren't woken.
	pub async fn set_mode(&self, key: &PartitionKey, mode: PartitionMode) {
		self.slot(key).await.send_if_modified(|current| {
			if current.mode != mode {
				Arc::make_mut(current).mode = mode;
			}
			false
		});
	}

	/// Drops every change feed, ending all subscriber streams.
	pub async fn close(&self) {
		let slots = self.partitions.write().await.drain().count();
		debug!(slots, "Closed cluster store change feeds");
	}
}
