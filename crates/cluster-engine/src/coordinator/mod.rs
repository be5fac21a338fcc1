//! The Job Coordinator: at most one active clustering job per partition.
//!
//! Every partition gets its own lazily spawned worker which drains a FIFO queue of jobs, one at a time.
//! Incremental submissions coalesce into the partition's pending incremental job, batch jobs never coalesce.
//! Workers of different partitions run in parallel.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use chrono::Utc;
use futures_concurrency::future::Join;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, instrument, trace, warn};

use super::{
	cluster::ClusterId,
	config::EngineConfig,
	error::Error,
	incident::{IncidentPoint, IncidentSource},
	job::{ClusterJob, JobId},
	partition::PartitionKey,
	store::ClusterStore,
};

mod execute;
mod message;
mod worker;

use message::IncidentOutcomes;
use worker::{PartitionWorker, WorkerComm};

/// Everything a partition worker needs to run jobs, shared by all workers.
pub(crate) struct JobContext {
	pub(crate) store: Arc<ClusterStore>,
	pub(crate) source: Arc<dyn IncidentSource>,
	pub(crate) config: Arc<EngineConfig>,
	pub(crate) jobs: JobTable,
}

/// Audit records of every job, reaped by age and count once terminal.
#[derive(Debug)]
pub(crate) struct JobTable {
	jobs: RwLock<HashMap<JobId, ClusterJob>>,
	retention: Duration,
	max_retained: usize,
}

impl JobTable {
	pub(crate) fn new(retention: Duration, max_retained: usize) -> Self {
		Self {
			jobs: RwLock::default(),
			retention,
			max_retained,
		}
	}

	pub(crate) async fn insert(&self, job: ClusterJob) {
		let mut jobs = self.jobs.write().await;
		self.evict(&mut jobs);
		jobs.insert(job.job_id, job);
	}

	pub(crate) async fn get(&self, job_id: JobId) -> Option<ClusterJob> {
		self.jobs.read().await.get(&job_id).cloned()
	}

	pub(crate) async fn update(&self, job_id: JobId, f: impl FnOnce(&mut ClusterJob)) {
		if let Some(job) = self.jobs.write().await.get_mut(&job_id) {
			f(job);
		} else {
			warn!(%job_id, "Tried to update a job that was already evicted");
		}
	}

	fn evict(&self, jobs: &mut HashMap<JobId, ClusterJob>) {
		let now = Utc::now();
		let before = jobs.len();

		jobs.retain(|_, job| {
			!(job.status.is_terminal()
				&& job
					.finished_at
					.and_then(|finished_at| (now - finished_at).to_std().ok())
					.is_some_and(|age| age > self.retention))
		});

		let mut terminal = jobs
			.values()
			.filter(|job| job.status.is_terminal())
			.map(|job| (job.finished_at, job.job_id))
			.collect::<Vec<_>>();

		if terminal.len() > self.max_retained {
			terminal.sort_unstable();
			let excess = terminal.len() - self.max_retained;
			for (_, job_id) in terminal.into_iter().take(excess) {
				jobs.remove(&job_id);
			}
		}

		if jobs.len() < before {
			trace!(evicted = before - jobs.len(), "Evicted finished jobs");
		}
	}
}

/// Handle on incidents submitted for incremental clustering.
#[derive(Debug)]
pub struct IncrementalTicket {
	job_id: JobId,
	count: usize,
	outcomes_rx: oneshot::Receiver<IncidentOutcomes>,
}

impl IncrementalTicket {
	pub(crate) const fn new(
		job_id: JobId,
		count: usize,
		outcomes_rx: oneshot::Receiver<IncidentOutcomes>,
	) -> Self {
		Self {
			job_id,
			count,
			outcomes_rx,
		}
	}

	/// The incremental job carrying these incidents, possibly shared with other submitters.
	#[must_use]
	pub const fn job_id(&self) -> JobId {
		self.job_id
	}

	/// Waits for the job to finish, one result per submitted incident in submission order.
	pub async fn outcomes(self) -> Vec<Result<ClusterId, Error>> {
		let count = self.count;

		self.outcomes_rx
			.await
			.unwrap_or_else(|_| (0..count).map(|_| Err(Error::Shutdown)).collect())
	}
}

pub struct JobCoordinator {
	ctx: Arc<JobContext>,
	workers: RwLock<HashMap<PartitionKey, PartitionWorker>>,
	closed: AtomicBool,
}

impl JobCoordinator {
	#[must_use]
	pub fn new(
		config: Arc<EngineConfig>,
		store: Arc<ClusterStore>,
		source: Arc<dyn IncidentSource>,
	) -> Self {
		Self {
			ctx: Arc::new(JobContext {
				jobs: JobTable::new(config.job_retention, config.max_retained_jobs),
				store,
				source,
				config,
			}),
			workers: RwLock::default(),
			closed: AtomicBool::new(false),
		}
	}

	async fn comm(&self, partition_key: &PartitionKey) -> Result<WorkerComm, Error> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::Shutdown);
		}

		if let Some(worker) = self.workers.read().await.get(partition_key) {
			return Ok(worker.comm());
		}

		let mut workers = self.workers.write().await;

		// Shutdown could have drained the workers while we waited for the lock
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::Shutdown);
		}

		Ok(workers
			.entry(partition_key.clone())
			.or_insert_with(|| {
				debug!(partition = %partition_key, "Spawning partition worker");
				PartitionWorker::spawn(partition_key.clone(), Arc::clone(&self.ctx))
			})
			.comm())
	}

	/// Queues incidents for incremental clustering, coalescing them into the partition's pending incremental job.
	#[instrument(skip(self, incidents), fields(partition = %partition_key, incidents = incidents.len()), err)]
	pub async fn submit_incidents(
		&self,
		partition_key: &PartitionKey,
		incidents: Vec<IncidentPoint>,
	) -> Result<IncrementalTicket, Error> {
		self.comm(partition_key)
			.await?
			.submit_incidents(incidents)
			.await
	}

	/// Queues an incremental pass over the partition's incidents that aren't clustered yet.
	#[instrument(skip(self), fields(partition = %partition_key), err)]
	pub async fn submit_catch_up(&self, partition_key: &PartitionKey) -> Result<JobId, Error> {
		self.comm(partition_key).await?.submit_catch_up().await
	}

	#[instrument(skip(self), fields(partition = %partition_key), err)]
	pub async fn submit_batch(
		&self,
		partition_key: &PartitionKey,
		k_hint: Option<usize>,
		deadline: Option<Duration>,
	) -> Result<JobId, Error> {
		if k_hint == Some(0) {
			return Err(Error::InvalidKHint);
		}

		self.comm(partition_key)
			.await?
			.submit_batch(k_hint, deadline.unwrap_or(self.ctx.config.batch_deadline))
			.await
	}

	#[instrument(skip(self), err)]
	pub async fn cancel(&self, job_id: JobId) -> Result<(), Error> {
		let job = self
			.ctx
			.jobs
			.get(job_id)
			.await
			.ok_or(Error::JobNotFound(job_id))?;

		if job.status.is_terminal() {
			return Err(Error::JobAlreadyFinished(job_id));
		}

		let comm = self
			.workers
			.read()
			.await
			.get(&job.partition_key)
			.map(PartitionWorker::comm)
			.ok_or(Error::Shutdown)?;

		comm.cancel(job_id).await
	}

	pub async fn job(&self, job_id: JobId) -> Option<ClusterJob> {
		self.ctx.jobs.get(job_id).await
	}

	pub fn store(&self) -> &Arc<ClusterStore> {
		&self.ctx.store
	}

	/// Cancels queued jobs and lets the running ones finish. Later submissions fail with [`Error::Shutdown`].
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			warn!("Trying to shutdown a job coordinator that was already shutdown");
			return;
		}

		let workers = self
			.workers
			.write()
			.await
			.drain()
			.map(|(_, worker)| worker)
			.collect::<Vec<_>>();

		debug!(workers = workers.len(), "Shutting down partition workers");

		workers
			.into_iter()
			.map(PartitionWorker::shutdown)
			.collect::<Vec<_>>()
			.join()
			.await;
	}
}
