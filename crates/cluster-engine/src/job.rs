use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use super::{error::Error, partition::PartitionKey};

/// A unique identifier for a clustering job using the [`uuid`](https://docs.rs/uuid) crate.
pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
	Incremental,
	Batch,
}

impl fmt::Display for JobKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Incremental => write!(f, "incremental"),
			Self::Batch => write!(f, "batch"),
		}
	}
}

/// `Queued -> Running -> {Succeeded | Failed | Cancelled}`, the last three being terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Queued,
	Running,
	Succeeded,
	Failed,
	Cancelled,
}

impl JobStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Queued => write!(f, "queued"),
			Self::Running => write!(f, "running"),
			Self::Succeeded => write!(f, "succeeded"),
			Self::Failed => write!(f, "failed"),
			Self::Cancelled => write!(f, "cancelled"),
		}
	}
}

/// The audit record of a clustering job, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterJob {
	pub job_id: JobId,
	pub partition_key: PartitionKey,
	pub kind: JobKind,
	pub status: JobStatus,
	pub created_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub finished_at: Option<DateTime<Utc>>,
	pub error: Option<String>,
	/// Incidents carried by an incremental job, coalesced submissions included.
	pub incident_count: usize,
	/// Batch job hit the iteration cap, its state was still committed.
	pub convergence_capped: bool,
	pub iterations: Option<usize>,
	pub committed_version: Option<u64>,
}

impl ClusterJob {
	pub(crate) fn new(job_id: JobId, partition_key: PartitionKey, kind: JobKind) -> Self {
		Self {
			job_id,
			partition_key,
			kind,
			status: JobStatus::Queued,
			created_at: Utc::now(),
			started_at: None,
			finished_at: None,
			error: None,
			incident_count: 0,
			convergence_capped: false,
			iterations: None,
			committed_version: None,
		}
	}

	pub(crate) fn mark_running(&mut self) {
		self.status = JobStatus::Running;
		self.started_at = Some(Utc::now());
	}

	pub(crate) fn mark_succeeded(&mut self, committed_version: Option<u64>) {
		self.status = JobStatus::Succeeded;
		self.committed_version = committed_version;
		self.finished_at = Some(Utc::now());
	}

	pub(crate) fn mark_failed(&mut self, error: &Error) {
		self.status = JobStatus::Failed;
		self.error = Some(error.to_string());
		self.finished_at = Some(Utc::now());
	}

	pub(crate) fn mark_cancelled(&mut self) {
		self.status = JobStatus::Cancelled;
		self.finished_at = Some(Utc::now());
	}
}

/// Cooperative cancellation signal shared between the coordinator and a running job.
///
/// Jobs check it at safe points and bail out with [`Error::JobCancelled`] before committing anything.
#[derive(Debug, Clone)]
pub struct CancelFlag {
	job_id: JobId,
	cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
	#[must_use]
	pub fn new(job_id: JobId) -> Self {
		Self {
			job_id,
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	#[must_use]
	pub const fn job_id(&self) -> JobId {
		self.job_id
	}

	pub fn cancel(&self) {
		trace!(job_id = %self.job_id, "Setting cancel flag");
		self.cancelled.store(true, Ordering::Release);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::Acquire)
	}

	pub fn check(&self) -> Result<(), Error> {
		if self.is_cancelled() {
			trace!(job_id = %self.job_id, "Job noticed cancellation");
			Err(Error::JobCancelled(self.job_id))
		} else {
			Ok(())
		}
	}
}
