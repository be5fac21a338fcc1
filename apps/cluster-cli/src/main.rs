use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cm_cluster_engine::{
	logging, ClusterEngine, ClusterJob, DistrictId, EngineConfig, Error, IncidentRecord,
	InMemoryIncidentSource, JobId, JobStatus, RecomputeRequest, ResolvePartition, Year,
};
use serde_json::json;
use tokio::{fs, time::sleep};
use tracing::{debug, info, warn};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "cm-cluster", about = "Crime map cluster engine operator CLI")]
struct Cli {
	/// Engine config file (JSON), defaults are used when omitted
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Recompute one partition from scratch and print the resulting clusters
	Batch {
		/// JSON array of incident records
		#[arg(short, long)]
		incidents: PathBuf,
		#[arg(long)]
		year: Year,
		#[arg(long)]
		source: String,
		#[arg(long)]
		district: Option<DistrictId>,
		/// Number of clusters, derived from the partition size when omitted
		#[arg(short)]
		k: Option<usize>,
		/// Overrides the configured batch deadline
		#[arg(long)]
		deadline_ms: Option<u64>,
	},
	/// Feed incidents one by one as live arrivals and print every partition touched
	Replay {
		/// JSON array of incident records
		#[arg(short, long)]
		incidents: PathBuf,
		/// Year accepted for incremental clustering, defaults to the config's then to today's
		#[arg(long)]
		current_year: Option<Year>,
	},
	/// Write the default engine config
	InitConfig {
		#[arg(short, long)]
		out: PathBuf,
	},
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let mut config = match &cli.config {
		Some(path) => EngineConfig::load(path)
			.await
			.with_context(|| format!("Failed to load engine config from {}", path.display()))?,
		None => EngineConfig::default(),
	};

	logging::init(&config.logging).context("Failed to initialize logging")?;

	match cli.command {
		Commands::Batch {
			incidents,
			year,
			source,
			district,
			k,
			deadline_ms,
		} => {
			let mut request = RecomputeRequest::batch(year, source);
			if let Some(district_id) = district {
				request = request.with_district(district_id);
			}
			if let Some(k_hint) = k {
				request = request.with_k_hint(k_hint);
			}
			if let Some(deadline_ms) = deadline_ms {
				request = request.with_deadline(Duration::from_millis(deadline_ms));
			}

			batch(config, &incidents, &request).await
		}

		Commands::Replay {
			incidents,
			current_year,
		} => {
			if current_year.is_some() {
				config.current_year = current_year;
			}

			replay(config, &incidents).await
		}

		Commands::InitConfig { out } => {
			config.save(&out).await?;
			info!(path = %out.display(), "Engine config written");
			Ok(())
		}
	}
}

async fn read_incidents(path: &Path) -> Result<Vec<IncidentRecord>> {
	let bytes = fs::read(path)
		.await
		.with_context(|| format!("Failed to read incidents from {}", path.display()))?;

	let records = serde_json::from_slice::<Vec<IncidentRecord>>(&bytes)
		.with_context(|| format!("Failed to parse incidents from {}", path.display()))?;

	debug!(count = records.len(), path = %path.display(), "Incidents loaded");

	Ok(records)
}

async fn wait_for_job(engine: &ClusterEngine, job_id: JobId) -> Result<ClusterJob> {
	loop {
		let job = engine.job_status(job_id).await?;
		if job.status.is_terminal() {
			return Ok(job);
		}
		sleep(JOB_POLL_INTERVAL).await;
	}
}

fn print_json(value: &serde_json::Value) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

async fn batch(config: EngineConfig, incidents: &Path, request: &RecomputeRequest) -> Result<()> {
	let partition_key = request.partition_key()?;

	let source = Arc::new(InMemoryIncidentSource::new());
	source.extend(read_incidents(incidents).await?).await;

	let engine = ClusterEngine::new(config, source)?;

	let job_id = engine.request_recompute(request).await?;
	info!(%job_id, partition = %partition_key, "Batch job submitted");

	let job = wait_for_job(&engine, job_id).await;
	let state = engine.current_clusters(&partition_key).await;

	engine.shutdown().await;

	let job = job?;
	print_json(&json!({
		"job": job,
		"partition": &*state,
	}))?;

	if job.status != JobStatus::Succeeded {
		bail!(
			"Batch job {job_id} ended {}: {}",
			job.status,
			job.error.as_deref().unwrap_or("no error reported")
		);
	}

	Ok(())
}

async fn replay(config: EngineConfig, incidents: &Path) -> Result<()> {
	let records = read_incidents(incidents).await?;

	let engine = ClusterEngine::new(config, Arc::new(InMemoryIncidentSource::new()))?;
	let current_year = engine.current_year();

	let mut tickets = Vec::with_capacity(records.len());
	let (mut clustered, mut rejected, mut skipped) = (0usize, 0usize, 0usize);

	for record in records {
		let incident_id = record.id;

		match engine.submit_incident(record).await {
			Ok(ticket) => tickets.push((incident_id, ticket)),
			Err(Error::IncrementalNotAllowed { year, .. }) => {
				debug!(incident_id, year, current_year, "Skipping historical incident");
				skipped += 1;
			}
			Err(e) => {
				warn!(incident_id, %e, "Incident rejected;");
				rejected += 1;
			}
		}
	}

	for (incident_id, ticket) in tickets {
		for outcome in ticket.outcomes().await {
			match outcome {
				Ok(_) => clustered += 1,
				Err(e) => {
					warn!(incident_id, %e, "Incident not clustered;");
					rejected += 1;
				}
			}
		}
	}

	let mut partitions = Vec::new();
	for partition_key in engine.partitions().await {
		partitions.push(engine.current_clusters(&partition_key).await);
	}

	engine.shutdown().await;

	info!(clustered, rejected, skipped, "Replay finished");

	print_json(&json!({
		"current_year": current_year,
		"clustered": clustered,
		"rejected": rejected,
		"skipped": skipped,
		"partitions": partitions.iter().map(|state| &**state).collect::<Vec<_>>(),
	}))
}
