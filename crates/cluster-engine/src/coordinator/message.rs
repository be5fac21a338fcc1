use std::time::Duration;

use tokio::sync::oneshot;

use crate::{cluster::ClusterId, error::Error, incident::IncidentPoint, job::JobId};

pub(crate) type IncidentOutcomes = Vec<Result<ClusterId, Error>>;

#[derive(Debug)]
pub(crate) enum WorkerMessage {
	SubmitIncidents {
		incidents: Vec<IncidentPoint>,
		outcomes_tx: oneshot::Sender<IncidentOutcomes>,
		ack: oneshot::Sender<JobId>,
	},
	SubmitCatchUp {
		ack: oneshot::Sender<JobId>,
	},
	SubmitBatch {
		k_hint: Option<usize>,
		deadline: Duration,
		ack: oneshot::Sender<JobId>,
	},
	Cancel {
		job_id: JobId,
		ack: oneshot::Sender<Result<(), Error>>,
	},
	ShutdownRequest(oneshot::Sender<()>),
}
