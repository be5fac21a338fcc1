use std::{path::Path, time::Duration};

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::{
	error::{Error, FileIOError},
	geo::DistanceMetric,
	partition::Year,
};

/// Tunables for the clustering engine.
///
/// The defaults suit city scale data with haversine distances; `assignment_radius` follows the metric's unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	pub metric: DistanceMetric,
	/// Max distance from a centroid for an incoming incident to join that cluster.
	pub assignment_radius: f64,
	pub k_min: usize,
	pub k_max: usize,
	/// Lloyd's iteration cap for batch jobs.
	pub max_iterations: usize,
	#[serde(with = "duration_millis")]
	pub batch_deadline: Duration,
	/// An incremental job running longer than this is treated as a bug.
	#[serde(with = "duration_millis")]
	pub incremental_sanity_threshold: Duration,
	pub commit_retries: usize,
	#[serde(with = "duration_millis")]
	pub job_retention: Duration,
	pub max_retained_jobs: usize,
	pub worker_queue_capacity: usize,
	/// Overrides the wall clock year, incremental clustering is only allowed for this year.
	pub current_year: Option<Year>,
	pub logging: LoggingConfig,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			metric: DistanceMetric::Haversine,
			assignment_radius: 500.0,
			k_min: 1,
			k_max: 64,
			max_iterations: 100,
			batch_deadline: Duration::from_secs(30),
			incremental_sanity_threshold: Duration::from_secs(2),
			commit_retries: 8,
			job_retention: Duration::from_secs(60 * 60),
			max_retained_jobs: 1024,
			worker_queue_capacity: 64,
			current_year: None,
			logging: LoggingConfig::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	/// `EnvFilter` directive used when `RUST_LOG` isn't set.
	pub directive: String,
	pub with_file_and_line: bool,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			directive: "info,cm_cluster_engine=debug".to_string(),
			with_file_and_line: false,
		}
	}
}

impl EngineConfig {
	/// Loads and validates a JSON config file, missing fields take their defaults.
	pub async fn load(path: impl AsRef<Path> + Send) -> Result<Self, Error> {
		let path = path.as_ref();

		let bytes = fs::read(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "Failed to read engine config")))?;

		let config = serde_json::from_slice::<Self>(&bytes)?;
		config.validate()?;

		debug!(?config, "Loaded engine config");
		info!(path = %path.display(), "Engine config loaded");

		Ok(config)
	}

	pub async fn save(&self, path: impl AsRef<Path> + Send) -> Result<(), Error> {
		let path = path.as_ref();

		fs::write(path, serde_json::to_vec_pretty(self)?)
			.await
			.map_err(|e| Error::from(FileIOError::from((path, e, "Failed to write engine config"))))
	}

	/// The only year open to incremental clustering: the override if set, the wall clock year otherwise.
	#[must_use]
	pub fn current_year_or_now(&self) -> Year {
		self.current_year.unwrap_or_else(|| Utc::now().year())
	}

	pub fn validate(&self) -> Result<(), Error> {
		if !(self.assignment_radius.is_finite() && self.assignment_radius > 0.0) {
			return Err(Error::InvalidConfig(format!(
				"assignment_radius must be a positive number, got {}",
				self.assignment_radius
			)));
		}

		if self.k_min == 0 {
			return Err(Error::InvalidConfig("k_min must be at least 1".to_string()));
		}

		if self.k_min > self.k_max {
			return Err(Error::InvalidConfig(format!(
				"k_min ({}) can't be greater than k_max ({})",
				self.k_min, self.k_max
			)));
		}

		if self.max_iterations == 0 {
			return Err(Error::InvalidConfig(
				"max_iterations must be at least 1".to_string(),
			));
		}

		if self.batch_deadline.is_zero() {
			return Err(Error::InvalidConfig(
				"batch_deadline must be greater than zero".to_string(),
			));
		}

		if self.worker_queue_capacity == 0 {
			return Err(Error::InvalidConfig(
				"worker_queue_capacity must be at least 1".to_string(),
			));
		}

		Ok(())
	}
}

mod duration_millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	#[allow(clippy::cast_possible_truncation)]
	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
