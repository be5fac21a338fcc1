use std::{collections::VecDeque, panic::AssertUnwindSafe, pin::pin, sync::Arc, time::Duration};

use async_channel as chan;
use futures::{FutureExt, StreamExt};
use futures_concurrency::stream::Merge;
use tokio::{spawn, sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::{
	error::Error,
	incident::IncidentPoint,
	job::{CancelFlag, ClusterJob, JobId, JobKind},
	partition::PartitionKey,
};

use super::{
	execute::{self, BatchReport, IncrementalReport},
	message::{IncidentOutcomes, WorkerMessage},
	IncrementalTicket, JobContext,
};

/// The single writer of one partition.
#[derive(Debug)]
pub(super) struct PartitionWorker {
	comm: WorkerComm,
	handle: JoinHandle<()>,
}

impl PartitionWorker {
	#[instrument(name = "partition_worker", skip(ctx), fields(partition = %partition_key))]
	pub(super) fn spawn(partition_key: PartitionKey, ctx: Arc<JobContext>) -> Self {
		let (msgs_tx, msgs_rx) = chan::bounded(ctx.config.worker_queue_capacity);

		let handle = spawn({
			let partition_key = partition_key.clone();

			async move {
				trace!("Partition worker starting...");
				while let Err(e) = spawn(
					run(partition_key.clone(), Arc::clone(&ctx), msgs_rx.clone()).in_current_span(),
				)
				.await
				{
					if e.is_panic() {
						error!(?e, "Partition worker critically failed and will restart;");
					} else {
						trace!("Partition worker received shutdown signal and will exit...");
						break;
					}
				}

				info!("Partition worker gracefully shutdown");
			}
			.in_current_span()
		});

		Self {
			comm: WorkerComm {
				partition_key,
				msgs_tx,
			},
			handle,
		}
	}

	pub(super) fn comm(&self) -> WorkerComm {
		self.comm.clone()
	}

	#[instrument(skip(self), fields(partition = %self.comm.partition_key))]
	pub(super) async fn shutdown(self) {
		let (tx, rx) = oneshot::channel();

		if self
			.comm
			.msgs_tx
			.send(WorkerMessage::ShutdownRequest(tx))
			.await
			.is_err()
		{
			warn!("Partition worker channel closed before shutdown request");
		} else if rx.await.is_err() {
			warn!("Partition worker dropped shutdown ack");
		}

		if let Err(e) = self.handle.await {
			if e.is_panic() {
				error!(?e, "Partition worker critically failed");
			}
		}
	}
}

/// Cheap handle to talk to a partition worker.
#[derive(Debug, Clone)]
pub(super) struct WorkerComm {
	partition_key: PartitionKey,
	msgs_tx: chan::Sender<WorkerMessage>,
}

impl WorkerComm {
	pub(super) async fn submit_incidents(
		&self,
		incidents: Vec<IncidentPoint>,
	) -> Result<IncrementalTicket, Error> {
		let count = incidents.len();
		let (outcomes_tx, outcomes_rx) = oneshot::channel();
		let (ack, ack_rx) = oneshot::channel();

		self.send(WorkerMessage::SubmitIncidents {
			incidents,
			outcomes_tx,
			ack,
		})
		.await?;

		let job_id = ack_rx.await.map_err(|_| Error::Shutdown)?;

		Ok(IncrementalTicket::new(job_id, count, outcomes_rx))
	}

	pub(super) async fn submit_catch_up(&self) -> Result<JobId, Error> {
		let (ack, ack_rx) = oneshot::channel();

		self.send(WorkerMessage::SubmitCatchUp { ack }).await?;

		ack_rx.await.map_err(|_| Error::Shutdown)
	}

	pub(super) async fn submit_batch(
		&self,
		k_hint: Option<usize>,
		deadline: Duration,
	) -> Result<JobId, Error> {
		let (ack, ack_rx) = oneshot::channel();

		self.send(WorkerMessage::SubmitBatch {
			k_hint,
			deadline,
			ack,
		})
		.await?;

		ack_rx.await.map_err(|_| Error::Shutdown)
	}

	pub(super) async fn cancel(&self, job_id: JobId) -> Result<(), Error> {
		let (ack, ack_rx) = oneshot::channel();

		self.send(WorkerMessage::Cancel { job_id, ack }).await?;

		ack_rx.await.map_err(|_| Error::Shutdown)?
	}

	async fn send(&self, msg: WorkerMessage) -> Result<(), Error> {
		self.msgs_tx.send(msg).await.map_err(|_| {
			trace!(partition = %self.partition_key, "Partition worker channel closed");
			Error::Shutdown
		})
	}
}

#[derive(Debug)]
struct Submitter {
	count: usize,
	outcomes_tx: oneshot::Sender<IncidentOutcomes>,
}

/// The one incremental job of a partition still accepting incidents.
#[derive(Debug)]
struct PendingIncremental {
	job_id: JobId,
	incidents: Vec<IncidentPoint>,
	submitters: Vec<Submitter>,
	catch_up: bool,
}

impl PendingIncremental {
	fn absorb(
		&mut self,
		incidents: Vec<IncidentPoint>,
		outcomes_tx: Option<oneshot::Sender<IncidentOutcomes>>,
		catch_up: bool,
	) {
		if let Some(outcomes_tx) = outcomes_tx {
			self.submitters.push(Submitter {
				count: incidents.len(),
				outcomes_tx,
			});
		}

		self.incidents.extend(incidents);
		self.catch_up |= catch_up;
	}
}

#[derive(Debug)]
enum QueuedJob {
	Incremental(PendingIncremental),
	Batch {
		job_id: JobId,
		k_hint: Option<usize>,
		deadline: Duration,
	},
}

impl QueuedJob {
	const fn job_id(&self) -> JobId {
		match self {
			Self::Incremental(PendingIncremental { job_id, .. }) | Self::Batch { job_id, .. } => {
				*job_id
			}
		}
	}
}

struct RunningJob {
	job_id: JobId,
	kind: JobKind,
	cancel: CancelFlag,
	handle: JoinHandle<()>,
}

pub(super) async fn run(
	partition_key: PartitionKey,
	ctx: Arc<JobContext>,
	msgs_rx: chan::Receiver<WorkerMessage>,
) {
	enum StreamMessage {
		Commands(WorkerMessage),
		JobDone(JobId),
	}

	let (done_tx, done_rx) = chan::bounded(1);
	let pending_rx = msgs_rx.clone();

	let mut queue = VecDeque::new();
	let mut running: Option<RunningJob> = None;
	let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

	let mut msg_stream = pin!((
		msgs_rx.map(StreamMessage::Commands),
		done_rx.map(StreamMessage::JobDone),
	)
		.merge());

	while let Some(msg) = msg_stream.next().await {
		match msg {
			// Dropping the acks lets submitters know we're going away
			StreamMessage::Commands(
				WorkerMessage::SubmitIncidents { .. }
				| WorkerMessage::SubmitCatchUp { .. }
				| WorkerMessage::SubmitBatch { .. },
			) if shutdown_ack.is_some() => {
				trace!("Rejecting submission, partition worker is shutting down");
			}

			StreamMessage::Commands(WorkerMessage::SubmitIncidents {
				incidents,
				outcomes_tx,
				ack,
			}) => {
				let job_id =
					enqueue_incremental(&ctx, &partition_key, &mut queue, incidents, Some(outcomes_tx), false)
						.await;

				if ack.send(job_id).is_err() {
					warn!("Submit incidents channel closed before sending ack");
				}
			}

			StreamMessage::Commands(WorkerMessage::SubmitCatchUp { ack }) => {
				let job_id =
					enqueue_incremental(&ctx, &partition_key, &mut queue, Vec::new(), None, true).await;

				if ack.send(job_id).is_err() {
					warn!("Submit catch up channel closed before sending ack");
				}
			}

			StreamMessage::Commands(WorkerMessage::SubmitBatch {
				k_hint,
				deadline,
				ack,
			}) => {
				let job_id = JobId::new_v4();

				ctx.jobs
					.insert(ClusterJob::new(
						job_id,
						partition_key.clone(),
						JobKind::Batch,
					))
					.await;

				queue.push_back(QueuedJob::Batch {
					job_id,
					k_hint,
					deadline,
				});

				trace!(%job_id, queued = queue.len(), "Batch job queued");

				if ack.send(job_id).is_err() {
					warn!("Submit batch channel closed before sending ack");
				}
			}

			StreamMessage::Commands(WorkerMessage::Cancel { job_id, ack }) => {
				let res = cancel_job(&ctx, &mut queue, running.as_ref(), job_id).await;

				if ack.send(res).is_err() {
					warn!("Cancel job channel closed before sending ack");
				}
			}

			StreamMessage::Commands(WorkerMessage::ShutdownRequest(ack)) => {
				for job in queue.drain(..) {
					cancel_queued(&ctx, job).await;
				}

				if running.is_none() {
					reject_pending(&pending_rx);
					if ack.send(()).is_err() {
						warn!("Shutdown request channel closed before sending ack");
					}
					return;
				}

				trace!("Waiting for the running job before shutting down");
				shutdown_ack = Some(ack);
			}

			StreamMessage::JobDone(job_id) => {
				if let Some(RunningJob {
					job_id: running_id,
					handle,
					..
				}) = running.take()
				{
					if running_id != job_id {
						error!(%job_id, %running_id, "Job done report doesn't match the running job");
					}

					if let Err(e) = handle.await {
						error!(%job_id, ?e, "Job failed to join");
					}
				}

				if let Some(ack) = shutdown_ack.take() {
					reject_pending(&pending_rx);
					if ack.send(()).is_err() {
						warn!("Shutdown request channel closed before sending ack");
					}
					return;
				}
			}
		}

		if running.is_none() && shutdown_ack.is_none() {
			if let Some(job) = queue.pop_front() {
				running = Some(dispatch(&ctx, &partition_key, job, &done_tx).await);
			}
		}
	}
}

/// Closes the worker channel and drops whatever is still buffered in it, so those submitters see their acks dropped.
fn reject_pending(msgs_rx: &chan::Receiver<WorkerMessage>) {
	msgs_rx.close();

	let mut rejected = 0usize;
	while msgs_rx.try_recv().is_ok() {
		rejected += 1;
	}

	if rejected > 0 {
		debug!(rejected, "Dropped messages that arrived during shutdown");
	}
}

async fn enqueue_incremental(
	ctx: &JobContext,
	partition_key: &PartitionKey,
	queue: &mut VecDeque<QueuedJob>,
	incidents: Vec<IncidentPoint>,
	outcomes_tx: Option<oneshot::Sender<IncidentOutcomes>>,
	catch_up: bool,
) -> JobId {
	let count = incidents.len();

	if let Some(pending) = queue.iter_mut().find_map(|job| match job {
		QueuedJob::Incremental(pending) => Some(pending),
		QueuedJob::Batch { .. } => None,
	}) {
		pending.absorb(incidents, outcomes_tx, catch_up);

		ctx.jobs
			.update(pending.job_id, |job| job.incident_count += count)
			.await;

		trace!(
			job_id = %pending.job_id,
			total_incidents = pending.incidents.len(),
			"Coalesced into the pending incremental job"
		);

		return pending.job_id;
	}

	let job_id = JobId::new_v4();

	let mut job = ClusterJob::new(job_id, partition_key.clone(), JobKind::Incremental);
	job.incident_count = count;
	ctx.jobs.insert(job).await;

	let mut pending = PendingIncremental {
		job_id,
		incidents: Vec::with_capacity(count),
		submitters: Vec::new(),
		catch_up: false,
	};
	pending.absorb(incidents, outcomes_tx, catch_up);
	queue.push_back(QueuedJob::Incremental(pending));

	trace!(%job_id, queued = queue.len(), "Incremental job queued");

	job_id
}

async fn cancel_job(
	ctx: &JobContext,
	queue: &mut VecDeque<QueuedJob>,
	running: Option<&RunningJob>,
	job_id: JobId,
) -> Result<(), Error> {
	if let Some(running) = running.filter(|running| running.job_id == job_id) {
		if ctx
			.jobs
			.get(job_id)
			.await
			.is_some_and(|job| job.status.is_terminal())
		{
			return Err(Error::JobAlreadyFinished(job_id));
		}

		return match running.kind {
			JobKind::Batch => {
				running.cancel.cancel();
				debug!(%job_id, "Cancel flag set on the running batch job");
				Ok(())
			}
			JobKind::Incremental => Err(Error::JobNotCancellable(job_id)),
		};
	}

	let maybe_index = queue.iter().position(|job| job.job_id() == job_id);

	if let Some(job) = maybe_index.and_then(|index| queue.remove(index)) {
		cancel_queued(ctx, job).await;
		return Ok(());
	}

	match ctx.jobs.get(job_id).await {
		Some(job) if job.status.is_terminal() => Err(Error::JobAlreadyFinished(job_id)),
		_ => Err(Error::JobNotFound(job_id)),
	}
}

async fn cancel_queued(ctx: &JobContext, job: QueuedJob) {
	let job_id = job.job_id();

	ctx.jobs.update(job_id, ClusterJob::mark_cancelled).await;

	if let QueuedJob::Incremental(PendingIncremental { submitters, .. }) = job {
		for Submitter { count, outcomes_tx } in submitters {
			if outcomes_tx
				.send((0..count).map(|_| Err(Error::JobCancelled(job_id))).collect())
				.is_err()
			{
				trace!(%job_id, "Incident submitter went away before the cancellation");
			}
		}
	}

	info!(%job_id, "Queued job cancelled");
}

async fn dispatch(
	ctx: &Arc<JobContext>,
	partition_key: &PartitionKey,
	job: QueuedJob,
	done_tx: &chan::Sender<JobId>,
) -> RunningJob {
	let job_id = job.job_id();
	let kind = match job {
		QueuedJob::Incremental(_) => JobKind::Incremental,
		QueuedJob::Batch { .. } => JobKind::Batch,
	};

	ctx.jobs.update(job_id, ClusterJob::mark_running).await;

	let cancel = CancelFlag::new(job_id);

	let handle = spawn({
		let ctx = Arc::clone(ctx);
		let partition_key = partition_key.clone();
		let cancel = cancel.clone();
		let done_tx = done_tx.clone();

		async move {
			match job {
				QueuedJob::Incremental(pending) => {
					run_incremental(&ctx, &partition_key, pending).await;
				}
				QueuedJob::Batch {
					k_hint, deadline, ..
				} => run_batch(&ctx, &partition_key, k_hint, deadline, &cancel).await,
			}

			if done_tx.send(job_id).await.is_err() {
				warn!(%job_id, "Partition worker went away before the job done report");
			}
		}
		.in_current_span()
	});

	trace!(%job_id, %kind, "Job dispatched");

	RunningJob {
		job_id,
		kind,
		cancel,
		handle,
	}
}

async fn run_incremental(ctx: &JobContext, partition_key: &PartitionKey, pending: PendingIncremental) {
	let PendingIncremental {
		job_id,
		incidents,
		submitters,
		catch_up,
	} = pending;

	let result = AssertUnwindSafe(execute::incremental(
		ctx,
		partition_key,
		job_id,
		incidents,
		catch_up,
	))
	.catch_unwind()
	.await
	.unwrap_or_else(|panic| {
		Err(Error::JobPanicked {
			job_id,
			message: execute::panic_message(&*panic),
		})
	});

	match result {
		Ok(IncrementalReport {
			results,
			committed_version,
		}) => {
			let rejected = results.iter().filter(|res| res.is_err()).count();

			ctx.jobs
				.update(job_id, |job| job.mark_succeeded(committed_version))
				.await;

			info!(%job_id, ?committed_version, rejected, "Incremental job succeeded");

			let mut results = results.into_iter();
			for Submitter { count, outcomes_tx } in submitters {
				if outcomes_tx
					.send(results.by_ref().take(count).collect())
					.is_err()
				{
					trace!(%job_id, "Incident submitter went away before receiving outcomes");
				}
			}
		}

		Err(e) => {
			finish_unsuccessful(ctx, job_id, &e).await;

			for Submitter { count, outcomes_tx } in submitters {
				if outcomes_tx
					.send((0..count).map(|_| Err(incident_error(job_id, &e))).collect())
					.is_err()
				{
					trace!(%job_id, "Incident submitter went away before receiving outcomes");
				}
			}
		}
	}
}

async fn run_batch(
	ctx: &JobContext,
	partition_key: &PartitionKey,
	k_hint: Option<usize>,
	deadline: Duration,
	cancel: &CancelFlag,
) {
	let job_id = cancel.job_id();

	let result = AssertUnwindSafe(execute::batch(ctx, partition_key, k_hint, deadline, cancel))
		.catch_unwind()
		.await
		.unwrap_or_else(|panic| {
			Err(Error::JobPanicked {
				job_id,
				message: execute::panic_message(&*panic),
			})
		});

	match result {
		Ok(BatchReport {
			committed_version,
			iterations,
			converged,
		}) => {
			ctx.jobs
				.update(job_id, |job| {
					job.iterations = Some(iterations);
					job.convergence_capped = !converged;
					job.mark_succeeded(Some(committed_version));
				})
				.await;

			if converged {
				info!(%job_id, committed_version, iterations, "Batch job succeeded");
			} else {
				warn!(
					%job_id,
					committed_version,
					iterations,
					"Batch job succeeded without converging"
				);
			}
		}

		Err(e) => finish_unsuccessful(ctx, job_id, &e).await,
	}
}

async fn finish_unsuccessful(ctx: &JobContext, job_id: JobId, e: &Error) {
	match e {
		Error::JobCancelled(_) => {
			ctx.jobs.update(job_id, ClusterJob::mark_cancelled).await;
			info!(%job_id, "Job cancelled");
		}
		Error::JobPanicked { .. } => {
			ctx.jobs.update(job_id, |job| job.mark_failed(e)).await;
			error!(%job_id, %e, "Job panicked;");
		}
		_ => {
			ctx.jobs.update(job_id, |job| job.mark_failed(e)).await;
			warn!(%job_id, %e, "Job failed;");
		}
	}
}

/// Per incident copy of a job wide failure.
fn incident_error(job_id: JobId, e: &Error) -> Error {
	match e {
		Error::JobCancelled(id) => Error::JobCancelled(*id),
		Error::IncrementalNotAllowed { year, current_year } => Error::IncrementalNotAllowed {
			year: *year,
			current_year: *current_year,
		},
		Error::Shutdown => Error::Shutdown,
		e => Error::JobFailed {
			job_id,
			message: e.to_string(),
		},
	}
}
