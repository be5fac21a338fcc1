use cm_cluster_engine::{
	ClusterEngine, ClusterId, EngineConfig, Error, IncidentId, InMemoryIncidentSource, JobId,
	JobKind, JobStatus, PartitionMode, RecomputeRequest,
};

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use futures::StreamExt;
use futures_concurrency::future::Join;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{spawn, time::timeout};
use tracing_test::traced_test;

mod common;

use common::{
	config, district_record, gaussian_blob, key, record, wait_for_engine_job, wait_for_members,
	CURRENT_YEAR, SOURCE,
};

fn engine(config: EngineConfig) -> (ClusterEngine, Arc<InMemoryIncidentSource>) {
	let source = Arc::new(InMemoryIncidentSource::new());
	let engine = ClusterEngine::new(config, source.clone()).expect("valid engine config");
	(engine, source)
}

async fn submit(
	engine: &ClusterEngine,
	id: IncidentId,
	latitude: f64,
	longitude: f64,
) -> ClusterId {
	let outcomes = engine
		.submit_incident(record(id, latitude, longitude, CURRENT_YEAR))
		.await
		.expect("incident submitted")
		.outcomes()
		.await;

	*outcomes[0].as_ref().expect("incident clustered")
}

#[tokio::test]
#[traced_test]
async fn incidents_join_or_spawn_clusters() {
	let (engine, _source) = engine(config());
	let key = key(CURRENT_YEAR);

	let c1 = submit(&engine, 1, 10.0, 20.0).await;

	let state = engine.current_clusters(&key).await;
	assert_eq!(state.version, 1);
	let cluster = &state.clusters[&c1];
	assert_eq!(cluster.member_count, 1);
	assert!((cluster.centroid_lat - 10.0).abs() < 1e-12);
	assert!((cluster.centroid_lon - 20.0).abs() < 1e-12);

	let b = submit(&engine, 2, 10.001, 20.001).await;
	assert_eq!(b, c1);

	let state = engine.current_clusters(&key).await;
	let cluster = &state.clusters[&c1];
	assert_eq!(cluster.member_count, 2);
	assert!((cluster.centroid_lat - 10.0005).abs() < 1e-9);
	assert!((cluster.centroid_lon - 20.0005).abs() < 1e-9);

	let c2 = submit(&engine, 3, 50.0, 60.0).await;
	assert_ne!(c2, c1);

	let state = engine.current_clusters(&key).await;
	assert_eq!(state.version, 3);
	assert_eq!(state.clusters.len(), 2);
	assert_eq!(state.total_members(), 3);
	assert_eq!(state.clusters[&c2].member_count, 1);

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn assignment_radius_decides_membership() {
	// A and B are about 156 meters apart
	for (radius, joins) in [(100.0, false), (500.0, true), (2_000.0, true)] {
		let (engine, _source) = engine(EngineConfig {
			assignment_radius: radius,
			..config()
		});

		let mut clusters = Vec::new();
		for (id, latitude, longitude) in [(1, 10.0, 20.0), (2, 10.001, 20.001)] {
			clusters.push(submit(&engine, id, latitude, longitude).await);
		}

		assert_eq!(clusters[0] == clusters[1], joins, "radius {radius}");
		assert_eq!(
			engine.current_clusters(&key(CURRENT_YEAR)).await.total_members(),
			2
		);

		engine.shutdown().await;
	}
}

#[tokio::test]
#[traced_test]
async fn incremental_work_is_only_for_the_current_year() {
	let (engine, _source) = engine(config());

	assert!(matches!(
		engine
			.request_recompute(&RecomputeRequest::incremental(2020, SOURCE))
			.await,
		Err(Error::IncrementalNotAllowed {
			year: 2020,
			current_year: CURRENT_YEAR
		})
	));

	assert!(matches!(
		engine.submit_incident(record(1, 10.0, 20.0, 2020)).await,
		Err(Error::IncrementalNotAllowed { year: 2020, .. })
	));

	assert!(engine.partitions().await.is_empty());
	assert_eq!(engine.current_clusters(&key(2020)).await.version, 0);

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn malformed_requests_are_rejected() {
	let (engine, _source) = engine(config());

	let request = RecomputeRequest {
		year: Some(CURRENT_YEAR),
		source_type: None,
		district_id: None,
		kind: JobKind::Batch,
		k_hint: None,
		deadline: None,
	};
	assert!(matches!(
		engine.request_recompute(&request).await,
		Err(Error::InvalidPartition { .. })
	));

	assert!(matches!(
		engine
			.request_recompute(&RecomputeRequest::batch(2021, SOURCE).with_k_hint(0))
			.await,
		Err(Error::InvalidKHint)
	));

	assert!(matches!(
		engine
			.submit_incident(record(1, 95.0, 20.0, CURRENT_YEAR))
			.await,
		Err(Error::InvalidCoordinates { id: 1, .. })
	));

	let unknown = JobId::new_v4();
	assert!(matches!(
		engine.job_status(unknown).await,
		Err(Error::JobNotFound(id)) if id == unknown
	));

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn resubmitting_an_incident_changes_nothing() {
	let (engine, _source) = engine(config());
	let key = key(CURRENT_YEAR);

	submit(&engine, 1, 10.0, 20.0).await;
	let before = engine.current_clusters(&key).await;

	let ticket = engine
		.submit_incident(record(1, 10.0, 20.0, CURRENT_YEAR))
		.await
		.expect("incident submitted");
	let job_id = ticket.job_id();
	let second = ticket.outcomes().await;
	assert!(matches!(
		second[0],
		Err(Error::DuplicateIncident { incident_id: 1, .. })
	));

	let job = wait_for_engine_job(&engine, job_id).await;
	assert_eq!(job.status, JobStatus::Succeeded);
	assert_eq!(job.committed_version, None);

	let after = engine.current_clusters(&key).await;
	assert_eq!(after.version, before.version);
	assert_eq!(after.total_members(), 1);

	engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn concurrent_submissions_are_serialized_per_partition() {
	let (engine, _source) = engine(config());
	let engine = Arc::new(engine);
	let key = key(CURRENT_YEAR);

	let handles = (0..100i32)
		.map(|id| {
			let engine = Arc::clone(&engine);
			spawn(async move {
				let latitude = 10.0 + f64::from(id % 10) * 0.01;
				let longitude = 20.0 + f64::from(id / 10) * 0.01;

				let ticket = engine
					.submit_incident(record(i64::from(id), latitude, longitude, CURRENT_YEAR))
					.await
					.expect("incident submitted");
				let job_id = ticket.job_id();

				(job_id, ticket.outcomes().await)
			})
		})
		.collect::<Vec<_>>();

	let mut job_ids = HashSet::new();
	for res in handles.join().await {
		let (job_id, outcomes) = res.expect("task didn't panic");
		assert!(outcomes[0].is_ok());
		job_ids.insert(job_id);
	}

	let state = engine.current_clusters(&key).await;
	assert_eq!(state.total_members(), 100);
	assert_eq!(
		state
			.clusters
			.values()
			.map(|cluster| cluster.member_count)
			.sum::<usize>(),
		100
	);
	// Every incremental job committed exactly once
	assert_eq!(state.version, job_ids.len() as u64);

	engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn batch_recompute_finds_gaussian_blobs() {
	let (engine, source) = engine(config());
	let year = 2019;
	let key = key(year);
	let centers = [(41.0, 2.0), (41.5, 2.5), (40.5, 1.5)];

	let mut rng = StdRng::seed_from_u64(42);
	let records = centers
		.iter()
		.zip([1, 1_001, 2_001])
		.flat_map(|(center, first_id)| gaussian_blob(&mut rng, first_id, *center, 0.001, 200, year))
		.collect::<Vec<_>>();
	let coordinates = records
		.iter()
		.map(|record| (record.id, (record.latitude, record.longitude)))
		.collect::<HashMap<_, _>>();
	source.extend(records).await;

	let job_id = engine
		.request_recompute(&RecomputeRequest::batch(year, SOURCE).with_k_hint(3))
		.await
		.expect("batch submitted");

	let job = wait_for_engine_job(&engine, job_id).await;
	assert_eq!(job.status, JobStatus::Succeeded);
	assert_eq!(job.kind, JobKind::Batch);
	assert!(!job.convergence_capped);
	assert!(job.iterations.is_some_and(|iterations| iterations >= 1));

	let state = engine.current_clusters(&key).await;
	assert_eq!(state.version, 1);
	assert_eq!(state.mode, PartitionMode::Stable);
	assert_eq!(state.k_hint, Some(3));
	assert_eq!(state.clusters.len(), 3);
	assert_eq!(state.total_members(), 600);

	for (latitude, longitude) in centers {
		assert!(
			state.clusters.values().any(|cluster| {
				(cluster.centroid_lat - latitude).abs() < 5e-4
					&& (cluster.centroid_lon - longitude).abs() < 5e-4
			}),
			"no cluster around ({latitude}, {longitude})"
		);
	}

	for cluster in state.clusters.values() {
		assert_eq!(cluster.member_count, cluster.member_ids.len());

		let (sum_lat, sum_lon) = cluster
			.member_ids
			.iter()
			.map(|id| coordinates[id])
			.fold((0.0, 0.0), |(lat, lon), (member_lat, member_lon)| {
				(lat + member_lat, lon + member_lon)
			});
		let count = cluster.member_count as f64;

		assert!((cluster.centroid_lat - sum_lat / count).abs() < 1e-9);
		assert!((cluster.centroid_lon - sum_lon / count).abs() < 1e-9);
	}

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn incremental_recompute_catches_up_unclustered_incidents() {
	let (engine, source) = engine(config());
	let key = key(CURRENT_YEAR);

	submit(&engine, 1, 10.0, 20.0).await;

	source
		.extend([
			record(1, 10.0, 20.0, CURRENT_YEAR),
			record(2, 10.0005, 20.0005, CURRENT_YEAR),
			record(3, 30.0, 40.0, CURRENT_YEAR),
		])
		.await;

	let job_id = engine
		.request_recompute(&RecomputeRequest::incremental(CURRENT_YEAR, SOURCE))
		.await
		.expect("catch up submitted");

	let job = wait_for_engine_job(&engine, job_id).await;
	assert_eq!(job.status, JobStatus::Succeeded);
	assert_eq!(job.committed_version, Some(2));

	let state = engine.current_clusters(&key).await;
	assert_eq!(state.total_members(), 3);
	assert_eq!(state.clusters.len(), 2);
	assert_eq!(state.cluster_of(1), state.cluster_of(2));

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn subscribers_follow_committed_versions() {
	let (engine, _source) = engine(config());
	let key = key(CURRENT_YEAR);

	let mut updates = engine.subscribe(&key).await;

	let initial = updates.next().await.expect("initial state");
	assert_eq!(initial.version, 0);
	assert!(initial.clusters.is_empty());

	for (id, latitude, longitude) in [(1, 10.0, 20.0), (2, 10.001, 20.001), (3, 50.0, 60.0)] {
		submit(&engine, id, latitude, longitude).await;
	}

	let mut last_version = initial.version;
	let mut clusters = 0;
	while last_version < 3 {
		let event = updates.next().await.expect("engine is still running");
		assert!(event.version > last_version);
		assert!(!event.changes.is_empty());
		last_version = event.version;
		clusters = event.clusters.len();
	}
	assert_eq!(clusters, 2);

	engine.shutdown().await;

	assert!(updates.next().await.is_none());
}

#[tokio::test]
#[traced_test]
async fn subscribers_get_diffs_between_versions() {
	let (engine, _source) = engine(config());
	let key = key(CURRENT_YEAR);

	let mut updates = engine.subscribe(&key).await;
	updates.next().await.expect("initial state");

	submit(&engine, 1, 10.0, 20.0).await;
	let event = updates.next().await.expect("first commit");
	assert_eq!(event.version, 1);
	assert_eq!(event.changes.added.len(), 1);
	assert!(event.changes.updated.is_empty());

	submit(&engine, 2, 10.001, 20.001).await;
	let event = updates.next().await.expect("second commit");
	assert_eq!(event.version, 2);
	assert!(event.changes.added.is_empty());
	assert_eq!(event.changes.updated.len(), 1);
	assert_eq!(event.changes.updated[0].member_count, 2);
	assert!(event.changes.removed.is_empty());

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn inserted_incidents_are_ingested() {
	let (engine, source) = engine(config());

	source.insert(record(1, 10.0, 20.0, 2020)).await;
	source.insert(record(2, 10.0, 20.0, CURRENT_YEAR)).await;

	wait_for_members(&engine, &key(CURRENT_YEAR), 1).await;

	// Historical incidents wait for a batch recompute
	assert_eq!(engine.partitions().await, vec![key(CURRENT_YEAR)]);

	engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn ingest_feeds_clustered_district_partitions() {
	let (engine, source) = engine(config());
	let base = key(CURRENT_YEAR);
	let district = base.with_district(7);

	let job_id = engine
		.request_recompute(&RecomputeRequest::batch(CURRENT_YEAR, SOURCE).with_district(7))
		.await
		.expect("batch submitted");
	assert_eq!(
		wait_for_engine_job(&engine, job_id).await.status,
		JobStatus::Succeeded
	);

	source
		.insert(district_record(1, 10.0, 20.0, CURRENT_YEAR, 7))
		.await;

	wait_for_members(&engine, &base, 1).await;
	wait_for_members(&engine, &district, 1).await;

	let scoped = engine.current_clusters(&district).await;
	assert!(scoped
		.clusters
		.values()
		.all(|cluster| cluster.partition_key == district));

	source
		.insert(district_record(2, 10.0, 20.0, CURRENT_YEAR, 8))
		.await;

	wait_for_members(&engine, &base, 2).await;

	assert_eq!(engine.current_clusters(&district).await.total_members(), 1);
	assert!(!engine.partitions().await.contains(&base.with_district(8)));

	engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn subscribing_to_a_district_doesnt_start_clustering_it() {
	let (engine, source) = engine(config());
	let base = key(CURRENT_YEAR);
	let district = base.with_district(7);

	let mut updates = engine.subscribe(&district).await;
	assert_eq!(updates.next().await.expect("initial state").version, 0);

	source
		.insert(district_record(1, 10.0, 20.0, CURRENT_YEAR, 7))
		.await;

	wait_for_members(&engine, &base, 1).await;

	assert!(timeout(Duration::from_millis(200), updates.next())
		.await
		.is_err());

	let scoped = engine.current_clusters(&district).await;
	assert_eq!(scoped.version, 0);
	assert!(scoped.clusters.is_empty());

	engine.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn shutdown_rejects_later_work() {
	let (engine, _source) = engine(config());

	engine.shutdown().await;

	assert!(matches!(
		engine
			.submit_incident(record(1, 10.0, 20.0, CURRENT_YEAR))
			.await,
		Err(Error::Shutdown)
	));
	assert!(matches!(
		engine
			.request_recompute(&RecomputeRequest::batch(2021, SOURCE))
			.await,
		Err(Error::Shutdown)
	));

	// Second shutdown is a no-op
	engine.shutdown().await;
}
