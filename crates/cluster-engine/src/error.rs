use std::{fmt, path::Path, time::Duration};

use thiserror::Error;

use super::{
	incident::IncidentId,
	job::JobId,
	partition::{PartitionKey, Year},
};

#[derive(Debug, Error)]
pub enum Error {
	// Request validation
	#[error("invalid partition: {reason}")]
	InvalidPartition { reason: String },
	#[error("invalid coordinates for incident <id='{id}', lat='{latitude}', lon='{longitude}'>")]
	InvalidCoordinates {
		id: IncidentId,
		latitude: f64,
		longitude: f64,
	},
	#[error("incremental clustering is only allowed for the current year <year='{year}', current_year='{current_year}'>")]
	IncrementalNotAllowed { year: Year, current_year: Year },
	#[error("incident already clustered <id='{incident_id}', partition='{partition}'>")]
	DuplicateIncident {
		incident_id: IncidentId,
		partition: PartitionKey,
	},
	#[error("incident <id='{incident_id}'> belongs to partition '{found}', not '{expected}'")]
	PartitionMismatch {
		incident_id: IncidentId,
		expected: PartitionKey,
		found: PartitionKey,
	},
	#[error("k hint must be at least 1")]
	InvalidKHint,

	// Job lifecycle
	#[error("batch clustering stopped at the iteration cap before converging <iterations='{iterations}'>")]
	ConvergenceTimeout { iterations: usize },
	#[error("job cancelled <id='{0}'>")]
	JobCancelled(JobId),
	#[error("job timed out <id='{job_id}', deadline='{deadline:?}'>")]
	JobTimedOut { job_id: JobId, deadline: Duration },
	#[error("job not found <id='{0}'>")]
	JobNotFound(JobId),
	#[error("running incremental job can't be cancelled <id='{0}'>")]
	JobNotCancellable(JobId),
	#[error("job already finished <id='{0}'>")]
	JobAlreadyFinished(JobId),
	#[error("job panicked <id='{job_id}'>: {message}")]
	JobPanicked { job_id: JobId, message: String },
	#[error("job failed <id='{job_id}'>: {message}")]
	JobFailed { job_id: JobId, message: String },
	#[error("incremental job exceeded sanity threshold <elapsed='{elapsed:?}', threshold='{threshold:?}'>")]
	IncrementalSanityExceeded {
		elapsed: Duration,
		threshold: Duration,
	},

	// Store
	#[error("commit conflict on partition '{partition}' <expected_version='{expected}', found_version='{found}'>")]
	StoreCommitConflict {
		partition: PartitionKey,
		expected: u64,
		found: u64,
	},
	#[error("gave up committing to partition '{partition}' after repeated conflicts")]
	CommitRetriesExhausted { partition: PartitionKey },

	// Collaborators and setup
	#[error("incident source error: {0}")]
	Source(String),
	#[error(transparent)]
	ConfigIO(#[from] FileIOError),
	#[error("failed to parse engine config: {0}")]
	ConfigParse(#[from] serde_json::Error),
	#[error("invalid engine config: {0}")]
	InvalidConfig(String),
	#[error("cluster engine is shutting down")]
	Shutdown,
}

impl Error {
	/// Errors that only concern a single incident and must never take down a job.
	#[must_use]
	pub const fn is_incident_local(&self) -> bool {
		matches!(
			self,
			Self::DuplicateIncident { .. } | Self::PartitionMismatch { .. }
		)
	}
}

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: std::io::Error,
	pub maybe_context: Option<&'static str>,
}

impl fmt::Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl<P: AsRef<Path>> From<(P, std::io::Error)> for FileIOError {
	fn from((path, source): (P, std::io::Error)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}
}

impl<P: AsRef<Path>> From<(P, std::io::Error, &'static str)> for FileIOError {
	fn from((path, source, context): (P, std::io::Error, &'static str)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context),
		}
	}
}
