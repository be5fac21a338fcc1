#![allow(dead_code)]

use cm_cluster_engine::{
	ClusterEngine, ClusterJob, DistrictId, EngineConfig, Error, IncidentId, IncidentPoint,
	IncidentRecord, IncidentSource, InMemoryIncidentSource, JobCoordinator, JobId, PartitionKey,
	Year,
};

use std::{
	f64::consts::PI,
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::StdRng, Rng};
use tokio::{
	sync::watch,
	time::{sleep, timeout},
};

pub const CURRENT_YEAR: Year = 2024;
pub const SOURCE: &str = "cbt";

const WAIT_LIMIT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub fn config() -> EngineConfig {
	EngineConfig {
		current_year: Some(CURRENT_YEAR),
		..Default::default()
	}
}

pub fn key(year: Year) -> PartitionKey {
	PartitionKey::new(year, SOURCE).expect("valid partition key")
}

pub fn record(id: IncidentId, latitude: f64, longitude: f64, year: Year) -> IncidentRecord {
	IncidentRecord {
		id,
		latitude,
		longitude,
		timestamp: Utc::now(),
		district_id: None,
		category: "theft".to_string(),
		year: Some(year),
		month: Some(6),
		source_type: Some(SOURCE.to_string()),
	}
}

pub fn district_record(
	id: IncidentId,
	latitude: f64,
	longitude: f64,
	year: Year,
	district_id: DistrictId,
) -> IncidentRecord {
	IncidentRecord {
		district_id: Some(district_id),
		..record(id, latitude, longitude, year)
	}
}

pub fn point(id: IncidentId, latitude: f64, longitude: f64) -> IncidentPoint {
	IncidentPoint::from_record(&record(id, latitude, longitude, CURRENT_YEAR))
		.expect("valid incident")
}

/// Normally distributed incidents around `center`, `sigma` in degrees.
pub fn gaussian_blob(
	rng: &mut StdRng,
	first_id: IncidentId,
	center: (f64, f64),
	sigma: f64,
	count: usize,
	year: Year,
) -> Vec<IncidentRecord> {
	(first_id..)
		.take(count)
		.map(|id| {
			// Box-Muller
			let u1 = rng.gen_range(f64::EPSILON..1.0);
			let u2 = rng.gen::<f64>();
			let radius = (-2.0 * u1.ln()).sqrt();
			let theta = 2.0 * PI * u2;

			record(
				id,
				center.0 + sigma * radius * theta.cos(),
				center.1 + sigma * radius * theta.sin(),
				year,
			)
		})
		.collect()
}

/// Source whose listings block until [`GatedSource::open`] is called, so jobs can be held running.
#[derive(Debug)]
pub struct GatedSource {
	pub inner: InMemoryIncidentSource,
	gate_tx: watch::Sender<bool>,
	listings: AtomicUsize,
}

impl GatedSource {
	pub fn new() -> Self {
		let (gate_tx, _gate_rx) = watch::channel(false);

		Self {
			inner: InMemoryIncidentSource::new(),
			gate_tx,
			listings: AtomicUsize::new(0),
		}
	}

	pub fn open(&self) {
		self.gate_tx.send_replace(true);
	}

	pub fn listings(&self) -> usize {
		self.listings.load(Ordering::Acquire)
	}

	/// Waits until some job is blocked listing incidents.
	pub async fn wait_for_listing(&self, count: usize) {
		timeout(WAIT_LIMIT, async {
			while self.listings() < count {
				sleep(POLL_INTERVAL).await;
			}
		})
		.await
		.expect("no job listed incidents in time");
	}
}

#[async_trait]
impl IncidentSource for GatedSource {
	async fn list_by_partition(&self, key: &PartitionKey) -> Result<Vec<IncidentPoint>, Error> {
		self.listings.fetch_add(1, Ordering::AcqRel);

		let mut gate_rx = self.gate_tx.subscribe();
		loop {
			if *gate_rx.borrow_and_update() {
				break;
			}
			gate_rx
				.changed()
				.await
				.map_err(|e| Error::Source(e.to_string()))?;
		}

		self.inner.list_by_partition(key).await
	}

	fn subscribe_inserts(&self) -> chan::Receiver<IncidentRecord> {
		self.inner.subscribe_inserts()
	}
}

/// Source that panics the first time it's listed, and works afterwards.
#[derive(Debug, Default)]
pub struct PanickingSource {
	inner: InMemoryIncidentSource,
	listings: AtomicUsize,
}

#[async_trait]
impl IncidentSource for PanickingSource {
	async fn list_by_partition(&self, key: &PartitionKey) -> Result<Vec<IncidentPoint>, Error> {
		if self.listings.fetch_add(1, Ordering::AcqRel) == 0 {
			panic!("incident source exploded");
		}

		self.inner.list_by_partition(key).await
	}

	fn subscribe_inserts(&self) -> chan::Receiver<IncidentRecord> {
		self.inner.subscribe_inserts()
	}
}

pub async fn wait_for_job(coordinator: &JobCoordinator, job_id: JobId) -> ClusterJob {
	timeout(WAIT_LIMIT, async {
		loop {
			if let Some(job) = coordinator
				.job(job_id)
				.await
				.filter(|job| job.status.is_terminal())
			{
				return job;
			}
			sleep(POLL_INTERVAL).await;
		}
	})
	.await
	.expect("job didn't finish in time")
}

pub async fn wait_for_engine_job(engine: &ClusterEngine, job_id: JobId) -> ClusterJob {
	timeout(WAIT_LIMIT, async {
		loop {
			let job = engine.job_status(job_id).await.expect("job is retained");
			if job.status.is_terminal() {
				return job;
			}
			sleep(POLL_INTERVAL).await;
		}
	})
	.await
	.expect("job didn't finish in time")
}

/// Waits until the partition holds at least `members` clustered incidents.
pub async fn wait_for_members(engine: &ClusterEngine, key: &PartitionKey, members: usize) {
	timeout(WAIT_LIMIT, async {
		while engine.current_clusters(key).await.total_members() < members {
			sleep(POLL_INTERVAL).await;
		}
	})
	.await
	.expect("incidents weren't clustered in time");
}
