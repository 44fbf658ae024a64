//! LRS Stream Engine: drives the load-reporting bidirectional
//! stream sharing a channel's transport with ADS, aggregating per-cluster,
//! per-locality stats drained from a [`LoadStore`] into periodic
//! `LoadStatsRequest`s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::config::core::v3::Locality as LocalityProto;
use envoy_types::pb::envoy::config::endpoint::v3::cluster_stats::DroppedRequests;
use envoy_types::pb::envoy::config::endpoint::v3::{
	ClusterStats, EndpointLoadMetricStats, UpstreamLocalityStats,
};
use envoy_types::pb::envoy::service::load_stats::v3::{LoadStatsRequest, LoadStatsResponse};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xds_core::strng::Strng;

use crate::backoff::BackoffConfig;
use crate::bootstrap::{Node, ServerConfig};
use crate::error::Error;
use crate::transport::Transport;

/// The minimum report interval this engine will honor, regardless of what a
/// server requests.
const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct LocalityKey {
	pub region: String,
	pub zone: String,
	pub sub_zone: String,
}

impl LocalityKey {
	fn to_proto(&self) -> LocalityProto {
		LocalityProto {
			region: self.region.clone(),
			zone: self.zone.clone(),
			sub_zone: self.sub_zone.clone(),
		}
	}
}

#[derive(Clone, Copy, Debug, Default)]
struct RequestStats {
	issued: u64,
	in_progress: i64,
	succeeded: u64,
	errored: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct LoadMetric {
	count: u64,
	sum: f64,
}

#[derive(Debug, Default)]
struct LocalityLoad {
	request_stats: RequestStats,
	load_metrics: HashMap<String, LoadMetric>,
}

#[derive(Debug, Default)]
struct ClusterLoad {
	locality_stats: HashMap<LocalityKey, LocalityLoad>,
	drops: HashMap<String, u64>,
	total_drops: u64,
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
struct ClusterKey {
	cluster_name: String,
	eds_service_name: String,
}

/// Per-(cluster, eds-service-name) load accounting. Issued/succeeded/errored/drops/load-metric counters drain (reset
/// to zero) on every emission; `in_progress` is a live gauge and is never
/// drained.
#[derive(Clone, Default)]
pub struct LoadStore {
	inner: Arc<Mutex<HashMap<ClusterKey, ClusterLoad>>>,
}

impl LoadStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn entry<'a>(
		inner: &'a mut HashMap<ClusterKey, ClusterLoad>,
		cluster: &str,
		eds_service_name: &str,
	) -> &'a mut ClusterLoad {
		inner
			.entry(ClusterKey {
				cluster_name: cluster.to_string(),
				eds_service_name: eds_service_name.to_string(),
			})
			.or_default()
	}

	pub fn record_issued(&self, cluster: &str, eds_service_name: &str, locality: &LocalityKey) {
		let mut inner = self.inner.lock();
		let stats = &mut Self::entry(&mut inner, cluster, eds_service_name)
			.locality_stats
			.entry(locality.clone())
			.or_default()
			.request_stats;
		stats.issued += 1;
		stats.in_progress += 1;
	}

	pub fn record_succeeded(&self, cluster: &str, eds_service_name: &str, locality: &LocalityKey) {
		let mut inner = self.inner.lock();
		let stats = &mut Self::entry(&mut inner, cluster, eds_service_name)
			.locality_stats
			.entry(locality.clone())
			.or_default()
			.request_stats;
		stats.succeeded += 1;
		stats.in_progress -= 1;
	}

	pub fn record_errored(&self, cluster: &str, eds_service_name: &str, locality: &LocalityKey) {
		let mut inner = self.inner.lock();
		let stats = &mut Self::entry(&mut inner, cluster, eds_service_name)
			.locality_stats
			.entry(locality.clone())
			.or_default()
			.request_stats;
		stats.errored += 1;
		stats.in_progress -= 1;
	}

	pub fn record_drop(&self, cluster: &str, eds_service_name: &str, category: &str) {
		let mut inner = self.inner.lock();
		let load = Self::entry(&mut inner, cluster, eds_service_name);
		*load.drops.entry(category.to_string()).or_insert(0) += 1;
		load.total_drops += 1;
	}

	pub fn record_load_metric(
		&self,
		cluster: &str,
		eds_service_name: &str,
		locality: &LocalityKey,
		name: &str,
		value: f64,
	) {
		let mut inner = self.inner.lock();
		let metric = Self::entry(&mut inner, cluster, eds_service_name)
			.locality_stats
			.entry(locality.clone())
			.or_default()
			.load_metrics
			.entry(name.to_string())
			.or_default();
		metric.count += 1;
		metric.sum += value;
	}

	/// Drains every tracked cluster into proto `ClusterStats`, filtered to
	/// `wanted` if non-empty (an empty list means "report every cluster",
	/// the LRS convention for a server that did not narrow the set).
	fn drain(&self, wanted: &[String], interval: prost_types::Duration) -> Vec<ClusterStats> {
		let mut inner = self.inner.lock();
		inner
			.iter_mut()
			.filter(|(key, _)| wanted.is_empty() || wanted.contains(&key.cluster_name))
			.map(|(key, load)| {
				let upstream_locality_stats = load
					.locality_stats
					.iter_mut()
					.map(|(locality, stats)| {
						let load_metric_stats = stats
							.load_metrics
							.drain()
							.map(|(metric_name, m)| EndpointLoadMetricStats {
								metric_name,
								num_requests_finished_with_metric: m.count,
								total_metric_value: m.sum,
							})
							.collect();
						let rs = stats.request_stats;
						stats.request_stats.issued = 0;
						stats.request_stats.succeeded = 0;
						stats.request_stats.errored = 0;
						UpstreamLocalityStats {
							locality: Some(locality.to_proto()),
							total_successful_requests: rs.succeeded,
							total_requests_in_progress: rs.in_progress.max(0) as u64,
							total_error_requests: rs.errored,
							total_issued_requests: rs.issued,
							load_metric_stats,
							upstream_endpoint_stats: Vec::new(),
							priority: 0,
						}
					})
					.collect();
				let dropped_requests = load
					.drops
					.drain()
					.map(|(category, dropped_count)| DroppedRequests {
						category,
						dropped_count,
					})
					.collect();
				let total_dropped_requests = load.total_drops;
				load.total_drops = 0;
				ClusterStats {
					cluster_name: key.cluster_name.clone(),
					cluster_service_name: key.eds_service_name.clone(),
					upstream_locality_stats,
					total_dropped_requests,
					dropped_requests,
					load_report_interval: Some(interval),
				}
			})
			.collect()
	}
}

/// One LRS engine per xDS channel, sharing the same
/// underlying transport connection with ADS for the same server.
pub struct LrsEngine {
	server: ServerConfig,
	target: Strng,
	node: Node,
	transport: Arc<dyn Transport>,
	backoff: BackoffConfig,
	store: LoadStore,
}

impl LrsEngine {
	pub fn new(
		server: ServerConfig,
		target: Strng,
		node: Node,
		transport: Arc<dyn Transport>,
		backoff: BackoffConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			server,
			target,
			node,
			transport,
			backoff,
			store: LoadStore::new(),
		})
	}

	pub fn store(&self) -> LoadStore {
		self.store.clone()
	}

	pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
		tokio::spawn(async move { self.run().await })
	}

	async fn run(self: Arc<Self>) {
		let mut attempt: u32 = 0;
		loop {
			match self.run_stream().await {
				Ok(()) => {
					info!(server = %self.server.target_uri, "lrs stream closed cleanly");
					attempt = 0;
				}
				Err(err) => {
					warn!(server = %self.server.target_uri, target = %self.target, error = %err, "lrs stream failed");
				}
			}
			let delay = self.backoff.delay(attempt);
			attempt = attempt.saturating_add(1);
			tokio::time::sleep(delay).await;
		}
	}

	async fn run_stream(&self) -> Result<(), Error> {
		let (req_tx, mut req_rx) = mpsc::unbounded_channel::<LoadStatsRequest>();
		let outbound = async_stream::stream! {
			while let Some(req) = req_rx.recv().await {
				yield req;
			}
		};
		let outbound = Box::pin(outbound);

		req_tx
			.send(LoadStatsRequest {
				node: Some(self.node.to_proto()),
				cluster_stats: Vec::new(),
			})
			.map_err(|e| Error::RequestFailure(Box::new(e)))?;

		let mut inbound = self.transport.open_lrs(outbound).await?;

		let first: LoadStatsResponse = match tokio_stream::StreamExt::next(&mut inbound).await {
			Some(Ok(resp)) => resp,
			Some(Err(e)) => return Err(Error::from(e)),
			None => return Ok(()),
		};

		let mut clusters = first.clusters;
		let mut interval = negotiate_interval(first.load_reporting_interval);
		debug!(server = %self.server.target_uri, ?clusters, ?interval, "lrs reporting started");

		loop {
			tokio::select! {
				_ = tokio::time::sleep(interval) => {
					let proto_interval = prost_types::Duration {
						seconds: interval.as_secs() as i64,
						nanos: interval.subsec_nanos() as i32,
					};
					let cluster_stats = self.store.drain(&clusters, proto_interval);
					if !cluster_stats.is_empty() {
						req_tx
							.send(LoadStatsRequest { node: None, cluster_stats })
							.map_err(|e| Error::RequestFailure(Box::new(e)))?;
					}
				}
				msg = tokio_stream::StreamExt::next(&mut inbound) => {
					match msg {
						Some(Ok(resp)) => {
							clusters = resp.clusters;
							interval = negotiate_interval(resp.load_reporting_interval);
						}
						Some(Err(e)) => return Err(Error::from(e)),
						None => return Ok(()),
					}
				}
			}
		}
	}
}

fn negotiate_interval(requested: Option<prost_types::Duration>) -> Duration {
	let requested = requested
		.map(|d| Duration::new(d.seconds.max(0) as u64, d.nanos.max(0) as u32))
		.unwrap_or(MIN_REPORT_INTERVAL);
	requested.max(MIN_REPORT_INTERVAL)
}
