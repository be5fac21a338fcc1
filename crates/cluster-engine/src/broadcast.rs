//! Change notifier: turns a partition's committed versions into a stream of cluster updates.
//!
//! Backed by the store's watch channels, so a slow subscriber skips intermediate versions and always
//! lands on the latest one. Every subscription starts with the current full state.

use std::{
	pin::Pin,
	sync::Arc,
	task::{ready, Context, Poll},
};

use futures::Stream;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use super::{
	cluster::{Cluster, ClusterDiff, PartitionMode, PartitionState},
	partition::PartitionKey,
	store::ClusterStore,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterUpdateEvent {
	pub partition_key: PartitionKey,
	pub version: u64,
	pub mode: PartitionMode,
	/// Full cluster set ordered by cluster id.
	pub clusters: Arc<[Arc<Cluster>]>,
	/// Relative to the previous event this subscriber received.
	pub changes: ClusterDiff,
}

impl ClusterUpdateEvent {
	fn new(previous: Option<&PartitionState>, current: &PartitionState) -> Self {
		Self {
			partition_key: current.partition_key.clone(),
			version: current.version,
			mode: current.mode,
			clusters: current.clusters.values().cloned().collect(),
			changes: ClusterDiff::between(previous, current),
		}
	}
}

pin_project! {
	/// Stream of [`ClusterUpdateEvent`] for a single partition, ends when the engine shuts down.
	pub struct ClusterUpdates {
		#[pin]
		states: WatchStream<Arc<PartitionState>>,
		last: Option<Arc<PartitionState>>,
	}
}

impl ClusterUpdates {
	fn new(states: WatchStream<Arc<PartitionState>>) -> Self {
		Self { states, last: None }
	}
}

impl Stream for ClusterUpdates {
	type Item = ClusterUpdateEvent;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let mut this = self.project();

		loop {
			let Some(state) = ready!(this.states.as_mut().poll_next(cx)) else {
				return Poll::Ready(None);
			};

			if this
				.last
				.as_ref()
				.is_some_and(|last| last.version >= state.version)
			{
				trace!(version = state.version, "Skipping already delivered version");
				continue;
			}

			let event = ClusterUpdateEvent::new(this.last.as_deref(), &state);
			*this.last = Some(state);

			return Poll::Ready(Some(event));
		}
	}
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
	store: Arc<ClusterStore>,
}

impl Broadcaster {
	#[must_use]
	pub const fn new(store: Arc<ClusterStore>) -> Self {
		Self { store }
	}

	pub async fn subscribe(&self, partition_key: &PartitionKey) -> ClusterUpdates {
		trace!(partition = %partition_key, "New cluster updates subscriber");
		ClusterUpdates::new(WatchStream::new(self.store.subscribe(partition_key).await))
	}
}
