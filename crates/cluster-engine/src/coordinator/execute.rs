use std::{any::Any, collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{
	task::{spawn_blocking, JoinError},
	time::{timeout_at, Instant},
};
use tracing::{debug, error, instrument, trace, warn, Span};

use crate::{
	batch::{self, BatchClusterer},
	cluster::PartitionMode,
	error::Error,
	incident::IncidentPoint,
	job::{CancelFlag, JobId},
	online::OnlineClusterer,
	partition::PartitionKey,
};

use super::{message::IncidentOutcomes, JobContext};

#[derive(Debug)]
pub(super) struct IncrementalReport {
	/// Outcomes of the submitted incidents only, catch up incidents excluded.
	pub results: IncidentOutcomes,
	pub committed_version: Option<u64>,
}

#[derive(Debug)]
pub(super) struct BatchReport {
	pub committed_version: u64,
	pub iterations: usize,
	pub converged: bool,
}

#[instrument(
	skip_all,
	fields(partition = %key, job_id = %job_id, incidents = incidents.len(), catch_up = catch_up),
	err
)]
pub(super) async fn incremental(
	ctx: &JobContext,
	key: &PartitionKey,
	job_id: JobId,
	mut incidents: Vec<IncidentPoint>,
	catch_up: bool,
) -> Result<IncrementalReport, Error> {
	let started = Instant::now();
	let submitted = incidents.len();

	if catch_up {
		let snapshot = ctx.store.snapshot(key).await;
		let pending = incidents
			.iter()
			.map(|incident| incident.id)
			.collect::<HashSet<_>>();

		let missing = ctx
			.source
			.list_by_partition(key)
			.await?
			.into_iter()
			.filter(|incident| {
				!pending.contains(&incident.id) && !snapshot.contains_incident(incident.id)
			})
			.collect::<Vec<_>>();

		debug!(missing = missing.len(), "Catching up unclustered incidents");
		incidents.extend(missing);
	}

	let clusterer = OnlineClusterer::from_config(&ctx.config);
	let current_year = ctx.config.current_year_or_now();
	let threshold = ctx.config.incremental_sanity_threshold;

	for attempt in 0..=ctx.config.commit_retries {
		let snapshot = ctx.store.snapshot(key).await;
		let mut outcome = clusterer.apply(&snapshot, &incidents, current_year)?;

		let elapsed = started.elapsed();
		if elapsed > threshold {
			return Err(Error::IncrementalSanityExceeded { elapsed, threshold });
		}

		if outcome.accepted == 0 {
			trace!("Nothing to commit, every incident was rejected");
			outcome.results.truncate(submitted);
			return Ok(IncrementalReport {
				results: outcome.results,
				committed_version: None,
			});
		}

		match ctx.store.commit(outcome.state, snapshot.version).await {
			Ok(committed) => {
				outcome.results.truncate(submitted);
				return Ok(IncrementalReport {
					results: outcome.results,
					committed_version: Some(committed.version),
				});
			}
			Err(Error::StoreCommitConflict { found, .. }) => {
				trace!(attempt, found, "Retrying incremental commit against a fresh snapshot");
			}
			Err(e) => return Err(e),
		}
	}

	Err(Error::CommitRetriesExhausted {
		partition: key.clone(),
	})
}

#[instrument(skip_all, fields(partition = %key, job_id = %cancel.job_id(), k_hint = ?k_hint), err)]
pub(super) async fn batch(
	ctx: &JobContext,
	key: &PartitionKey,
	k_hint: Option<usize>,
	deadline: Duration,
	cancel: &CancelFlag,
) -> Result<BatchReport, Error> {
	let deadline_at = Instant::now() + deadline;

	ctx.store.set_mode(key, PartitionMode::Recomputing).await;

	let result = AssertUnwindSafe(recompute(ctx, key, k_hint, deadline, deadline_at, cancel))
		.catch_unwind()
		.await
		.unwrap_or_else(|panic| {
			Err(Error::JobPanicked {
				job_id: cancel.job_id(),
				message: panic_message(&*panic),
			})
		});

	// Committed batch states are already stable, this only matters on failures
	ctx.store.set_mode(key, PartitionMode::Stable).await;

	result
}

async fn recompute(
	ctx: &JobContext,
	key: &PartitionKey,
	k_hint: Option<usize>,
	deadline: Duration,
	deadline_at: Instant,
	cancel: &CancelFlag,
) -> Result<BatchReport, Error> {
	let job_id = cancel.job_id();

	let snapshot = ctx.store.snapshot(key).await;
	let Ok(listed) = timeout_at(deadline_at, ctx.source.list_by_partition(key)).await else {
		warn!(?deadline, "Batch job ran past its deadline while listing incidents");
		return Err(Error::JobTimedOut { job_id, deadline });
	};
	let points = listed?;
	debug!(points = points.len(), "Listed partition incidents");

	let clusterer = BatchClusterer::from_config(&ctx.config);

	let mut handle = spawn_blocking({
		let cancel = cancel.clone();
		let previous = Arc::clone(&snapshot);
		let span = Span::current();

		move || {
			span.in_scope(|| {
				clusterer.run(&previous, &points, k_hint, &cancel, &mut rand::thread_rng())
			})
		}
	});

	let outcome = match timeout_at(deadline_at, &mut handle).await {
		Ok(Ok(outcome)) => outcome?,
		Ok(Err(e)) => return Err(join_error(job_id, e)),
		Err(_) => {
			warn!(?deadline, "Batch job ran past its deadline, cancelling it");
			cancel.cancel();

			if let Err(e) = handle.await {
				error!(?e, "Timed out batch job failed to join");
			}

			return Err(Error::JobTimedOut { job_id, deadline });
		}
	};

	if !outcome.converged {
		warn!(
			error = %Error::ConvergenceTimeout {
				iterations: outcome.iterations
			},
			"Committing the best state reached"
		);
	}

	let (iterations, converged) = (outcome.iterations, outcome.converged);
	let mut next = outcome.state;
	let mut expected_version = snapshot.version;

	for attempt in 0..=ctx.config.commit_retries {
		// Past this point the job can't be cancelled anymore
		cancel.check()?;

		match ctx.store.commit(next.clone(), expected_version).await {
			Ok(committed) => {
				return Ok(BatchReport {
					committed_version: committed.version,
					iterations,
					converged,
				})
			}
			Err(Error::StoreCommitConflict { found, .. }) => {
				trace!(attempt, found, "Rebasing batch state on the current version");
				let current = ctx.store.snapshot(key).await;
				next = batch::rebase(next, &current);
				expected_version = current.version;
			}
			Err(e) => return Err(e),
		}
	}

	Err(Error::CommitRetriesExhausted {
		partition: key.clone(),
	})
}

pub(super) fn join_error(job_id: JobId, e: JoinError) -> Error {
	if e.is_panic() {
		Error::JobPanicked {
			job_id,
			message: panic_message(&*e.into_panic()),
		}
	} else {
		Error::Shutdown
	}
}

pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
	panic
		.downcast_ref::<&str>()
		.map(|message| (*message).to_string())
		.or_else(|| panic.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "unknown panic payload".to_string())
}
