use std::{pin::pin, sync::Arc, time::Duration};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use serde::{Deserialize, Serialize};
use tokio::{spawn, sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use super::{
	broadcast::{Broadcaster, ClusterUpdates},
	cluster::PartitionState,
	config::EngineConfig,
	coordinator::{IncrementalTicket, JobCoordinator},
	error::Error,
	incident::{IncidentId, IncidentPoint, IncidentRecord, IncidentSource},
	job::{ClusterJob, JobId, JobKind},
	partition::{resolve, DistrictId, PartitionKey, ResolvePartition, Year},
	store::ClusterStore,
};

/// A caller's request to (re)cluster a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeRequest {
	pub year: Option<Year>,
	pub source_type: Option<String>,
	pub district_id: Option<DistrictId>,
	pub kind: JobKind,
	pub k_hint: Option<usize>,
	/// Batch only, defaults to the configured `batch_deadline`.
	#[serde(skip)]
	pub deadline: Option<Duration>,
}

impl RecomputeRequest {
	#[must_use]
	pub fn batch(year: Year, source_type: impl Into<String>) -> Self {
		Self::new(year, source_type, JobKind::Batch)
	}

	#[must_use]
	pub fn incremental(year: Year, source_type: impl Into<String>) -> Self {
		Self::new(year, source_type, JobKind::Incremental)
	}

	fn new(year: Year, source_type: impl Into<String>, kind: JobKind) -> Self {
		Self {
			year: Some(year),
			source_type: Some(source_type.into()),
			district_id: None,
			kind,
			k_hint: None,
			deadline: None,
		}
	}

	#[must_use]
	pub fn with_district(mut self, district_id: DistrictId) -> Self {
		self.district_id = Some(district_id);
		self
	}

	#[must_use]
	pub fn with_k_hint(mut self, k_hint: usize) -> Self {
		self.k_hint = Some(k_hint);
		self
	}

	#[must_use]
	pub fn with_deadline(mut self, deadline: Duration) -> Self {
		self.deadline = Some(deadline);
		self
	}
}

impl ResolvePartition for RecomputeRequest {
	fn partition_key(&self) -> Result<PartitionKey, Error> {
		resolve(self.year, self.source_type.as_deref(), self.district_id)
	}
}

/// The clustering engine: owns the store, the job coordinator and the ingest of new incidents.
pub struct ClusterEngine {
	config: Arc<EngineConfig>,
	store: Arc<ClusterStore>,
	coordinator: Arc<JobCoordinator>,
	broadcaster: Broadcaster,
	ingest_stop_tx: chan::Sender<()>,
	ingest_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterEngine {
	/// Builds the engine and starts listening to `source` insert notifications. Must run inside a tokio runtime.
	#[instrument(name = "cluster_engine", skip_all)]
	pub fn new(config: EngineConfig, source: Arc<dyn IncidentSource>) -> Result<Self, Error> {
		config.validate()?;

		let config = Arc::new(config);
		let store = Arc::new(ClusterStore::new());
		let coordinator = Arc::new(JobCoordinator::new(
			Arc::clone(&config),
			Arc::clone(&store),
			Arc::clone(&source),
		));

		let (ingest_stop_tx, ingest_stop_rx) = chan::bounded(1);

		let ingest_handle = spawn(
			ingest(
				Arc::clone(&config),
				Arc::clone(&coordinator),
				source.subscribe_inserts(),
				ingest_stop_rx,
			)
			.in_current_span(),
		);

		info!(
			metric = ?config.metric,
			assignment_radius = config.assignment_radius,
			unit = config.metric.unit(),
			current_year = config.current_year_or_now(),
			"Cluster engine started"
		);

		Ok(Self {
			broadcaster: Broadcaster::new(Arc::clone(&store)),
			config,
			store,
			coordinator,
			ingest_stop_tx,
			ingest_handle: Mutex::new(Some(ingest_handle)),
		})
	}

	#[must_use]
	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	#[must_use]
	pub fn current_year(&self) -> Year {
		self.config.current_year_or_now()
	}

	/// Queues a recompute of the request's partition.
	///
	/// Incremental requests cluster the partition's not yet clustered incidents and are only allowed for the
	/// current year. Batch requests work for any year.
	#[instrument(skip(self), err)]
	pub async fn request_recompute(&self, request: &RecomputeRequest) -> Result<JobId, Error> {
		let partition_key = request.partition_key()?;

		match request.kind {
			JobKind::Incremental => {
				self.ensure_current_year(&partition_key)?;
				self.coordinator.submit_catch_up(&partition_key).await
			}
			JobKind::Batch => {
				self.coordinator
					.submit_batch(&partition_key, request.k_hint, request.deadline)
					.await
			}
		}
	}

	/// Clusters one incident of the current year into its base partition, outcome available through the ticket.
	#[instrument(skip(self, record), fields(incident_id = record.id), err)]
	pub async fn submit_incident(&self, record: IncidentRecord) -> Result<IncrementalTicket, Error> {
		let incident = IncidentPoint::from_record(&record)?;
		self.ensure_current_year(&incident.partition_key)?;

		let partition_key = incident.partition_key.clone();
		self.coordinator
			.submit_incidents(&partition_key, vec![incident])
			.await
	}

	pub async fn job_status(&self, job_id: JobId) -> Result<ClusterJob, Error> {
		self.coordinator
			.job(job_id)
			.await
			.ok_or(Error::JobNotFound(job_id))
	}

	pub async fn cancel_job(&self, job_id: JobId) -> Result<(), Error> {
		self.coordinator.cancel(job_id).await
	}

	pub async fn subscribe(&self, partition_key: &PartitionKey) -> ClusterUpdates {
		self.broadcaster.subscribe(partition_key).await
	}

	pub async fn current_clusters(&self, partition_key: &PartitionKey) -> Arc<PartitionState> {
		self.store.snapshot(partition_key).await
	}

	/// Partitions that were ever clustered or subscribed to.
	pub async fn partitions(&self) -> Vec<PartitionKey> {
		self.store.partitions().await
	}

	/// Stops ingesting, cancels queued jobs, waits for running ones and ends every subscription.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let Some(handle) = self.ingest_handle.lock().await.take() else {
			warn!("Trying to shutdown a cluster engine that was already shutdown");
			return;
		};

		if self.ingest_stop_tx.send(()).await.is_err() {
			warn!("Ingest task went away before the stop signal");
		}

		if let Err(e) = handle.await {
			if e.is_panic() {
				error!(?e, "Ingest task critically failed");
			}
		}

		self.coordinator.shutdown().await;
		self.store.close().await;

		info!("Cluster engine gracefully shutdown");
	}

	fn ensure_current_year(&self, partition_key: &PartitionKey) -> Result<(), Error> {
		let current_year = self.current_year();

		if partition_key.year() == current_year {
			Ok(())
		} else {
			Err(Error::IncrementalNotAllowed {
				year: partition_key.year(),
				current_year,
			})
		}
	}
}

async fn ingest(
	config: Arc<EngineConfig>,
	coordinator: Arc<JobCoordinator>,
	inserts_rx: chan::Receiver<IncidentRecord>,
	stop_rx: chan::Receiver<()>,
) {
	enum StreamMessage {
		Insert(IncidentRecord),
		Stop,
	}

	let mut msg_stream = pin!((
		inserts_rx.map(StreamMessage::Insert),
		stop_rx.map(|()| StreamMessage::Stop),
	)
		.merge());

	trace!("Incident ingest starting...");

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Insert(record) => {
				ingest_record(&coordinator, config.current_year_or_now(), record).await;
			}
			StreamMessage::Stop => {
				trace!("Incident ingest received stop signal");
				break;
			}
		}
	}

	debug!("Incident ingest stopped");
}

async fn ingest_record(coordinator: &JobCoordinator, current_year: Year, record: IncidentRecord) {
	let incident = match IncidentPoint::from_record(&record) {
		Ok(incident) => incident,
		Err(e) => {
			warn!(incident_id = record.id, %e, "Skipping malformed incident;");
			return;
		}
	};

	if incident.partition_key.year() != current_year {
		debug!(
			incident_id = incident.id,
			year = incident.partition_key.year(),
			current_year,
			"Skipping incident outside the current year, a batch recompute will pick it up"
		);
		return;
	}

	let mut targets = vec![incident.partition_key.clone()];

	// District scoped partitions only follow along once a job committed them, subscribers alone don't count
	if let Some(district_id) = incident.district_id {
		let scoped = incident.partition_key.with_district(district_id);
		if coordinator.store().snapshot(&scoped).await.version > 0 {
			targets.push(scoped);
		}
	}

	for partition_key in targets {
		match coordinator
			.submit_incidents(&partition_key, vec![incident.rekeyed(partition_key.clone())])
			.await
		{
			Ok(ticket) => {
				spawn(log_outcomes(incident.id, ticket).in_current_span());
			}
			Err(e) => warn!(incident_id = incident.id, partition = %partition_key, %e, "Failed to submit incident;"),
		}
	}
}

async fn log_outcomes(incident_id: IncidentId, ticket: IncrementalTicket) {
	let job_id = ticket.job_id();

	for outcome in ticket.outcomes().await {
		match outcome {
			Ok(cluster_id) => trace!(incident_id, %job_id, cluster_id, "Incident clustered"),
			Err(e) if e.is_incident_local() => debug!(incident_id, %job_id, %e, "Incident rejected"),
			Err(e) => warn!(incident_id, %job_id, %e, "Incident not clustered;"),
		}
	}
}
