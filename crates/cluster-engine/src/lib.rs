//!
//! # Cluster Engine
//!
//! Groups crime incident locations into spatial clusters, independently for every partition (reporting year,
//! source type and optionally district).
//!
//! - Incidents of the current year are clustered incrementally as they arrive, with online k-means;
//! - Any partition can be recomputed from scratch with k-means++ and Lloyd's iterations;
//! - At most one job mutates a partition at a time, jobs of different partitions run in parallel;
//! - Subscribers get the latest cluster set of a partition every time it changes.
//!
//! ## Basic example
//!
//! ```
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use cm_cluster_engine::{ClusterEngine, EngineConfig, InMemoryIncidentSource, IncidentRecord, PartitionKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = ClusterEngine::new(
//!         EngineConfig {
//!             current_year: Some(2024),
//!             ..Default::default()
//!         },
//!         Arc::new(InMemoryIncidentSource::new()),
//!     )
//!     .expect("valid config");
//!
//!     let ticket = engine
//!         .submit_incident(IncidentRecord {
//!             id: 1,
//!             latitude: 10.0,
//!             longitude: 20.0,
//!             timestamp: Utc::now(),
//!             district_id: None,
//!             category: "theft".to_string(),
//!             year: Some(2024),
//!             month: Some(5),
//!             source_type: Some("cbt".to_string()),
//!         })
//!         .await
//!         .expect("incident submitted");
//!
//!     assert!(ticket.outcomes().await[0].is_ok());
//!
//!     let key = PartitionKey::new(2024, "cbt").expect("valid key");
//!     assert_eq!(engine.current_clusters(&key).await.clusters.len(), 1);
//!
//!     engine.shutdown().await;
//! }
//! ```
#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod batch;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod geo;
pub mod incident;
pub mod job;
pub mod logging;
pub mod online;
pub mod partition;
pub mod store;

pub use batch::{BatchClusterer, BatchOutcome};
pub use broadcast::{Broadcaster, ClusterUpdateEvent, ClusterUpdates};
pub use cluster::{Cluster, ClusterDiff, ClusterId, PartitionMode, PartitionState};
pub use config::{EngineConfig, LoggingConfig};
pub use coordinator::{IncrementalTicket, JobCoordinator};
pub use engine::{ClusterEngine, RecomputeRequest};
pub use error::{Error, FileIOError};
pub use geo::{Coordinate, DistanceMetric};
pub use incident::{IncidentId, IncidentPoint, IncidentRecord, IncidentSource, InMemoryIncidentSource};
pub use job::{CancelFlag, ClusterJob, JobId, JobKind, JobStatus};
pub use online::{OnlineClusterer, OnlineOutcome};
pub use partition::{resolve, DistrictId, PartitionKey, ResolvePartition, Year};
pub use store::ClusterStore;
