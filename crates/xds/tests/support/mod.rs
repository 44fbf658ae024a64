//! A fake [`Transport`] driven entirely in-memory, per spec.md §9: "the
//! builder abstraction in §4.3 exists so that tests can substitute a fake
//! that directly produces DiscoveryResponses." Each call to `open_ads`/
//! `open_lrs` (i.e. every connect/reconnect attempt the engine makes) yields
//! a fresh [`FakeAdsConnection`]/[`FakeLrsConnection`] that the test can push
//! responses into, inspect sent requests from, and fail on demand.

use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::envoy::service::load_stats::v3::{LoadStatsRequest, LoadStatsResponse};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;
use xds_client::error::Error;
use xds_client::transport::{BoxFuture, InboundAds, InboundLrs, OutboundAds, OutboundLrs, Transport};

/// Installs a `tracing` subscriber writing to the test harness's captured
/// output, so a failing scenario's `debug!`/`warn!` lines from `ads.rs`/
/// `authority.rs` show up in `cargo test -- --nocapture`. Safe to call from
/// every test: only the first call in a process actually installs one.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init();
}

/// One simulated ADS connection: the requests the engine sent on it, and a
/// sender the test uses to push responses (or a terminal error) into the
/// engine's `Recv` loop.
pub struct FakeAdsConnection {
	pub sent: Arc<Mutex<Vec<DiscoveryRequest>>>,
	responses: mpsc::UnboundedSender<Result<DiscoveryResponse, Status>>,
}

impl FakeAdsConnection {
	pub fn send_response(&self, response: DiscoveryResponse) {
		let _ = self.responses.send(Ok(response));
	}

	pub fn fail(&self, status: Status) {
		let _ = self.responses.send(Err(status));
	}

	pub fn requests(&self) -> Vec<DiscoveryRequest> {
		self.sent.lock().clone()
	}

	/// Polls until at least `n` requests have been observed on this
	/// connection, or panics after a generous timeout — avoids a fixed
	/// `sleep` race between "request sent" and "test asserts on it".
	pub async fn wait_for_request_count(&self, n: usize) {
		for _ in 0..200 {
			if self.sent.lock().len() >= n {
				return;
			}
			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
		}
		panic!("timed out waiting for {n} requests, saw {}", self.sent.lock().len());
	}
}

pub struct FakeLrsConnection {
	pub sent: Arc<Mutex<Vec<LoadStatsRequest>>>,
	responses: mpsc::UnboundedSender<Result<LoadStatsResponse, Status>>,
}

impl FakeLrsConnection {
	pub fn send_response(&self, response: LoadStatsResponse) {
		let _ = self.responses.send(Ok(response));
	}
}

/// Shared in-memory transport. Every `open_ads`/`open_lrs` call registers a
/// new connection and notifies whoever is awaiting `next_ads_connection`/
/// `next_lrs_connection`.
pub struct FakeTransport {
	ads_conn_tx: mpsc::UnboundedSender<FakeAdsConnection>,
	ads_conn_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeAdsConnection>>,
	lrs_conn_tx: mpsc::UnboundedSender<FakeLrsConnection>,
	lrs_conn_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeLrsConnection>>,
}

impl FakeTransport {
	pub fn new() -> Arc<Self> {
		let (ads_conn_tx, ads_conn_rx) = mpsc::unbounded_channel();
		let (lrs_conn_tx, lrs_conn_rx) = mpsc::unbounded_channel();
		Arc::new(Self {
			ads_conn_tx,
			ads_conn_rx: tokio::sync::Mutex::new(ads_conn_rx),
			lrs_conn_tx,
			lrs_conn_rx: tokio::sync::Mutex::new(lrs_conn_rx),
		})
	}

	/// Awaits the next ADS connection attempt the engine makes — the first
	/// call corresponds to the initial stream, the second to the first
	/// reconnect after a failure, and so on.
	pub async fn next_ads_connection(&self) -> FakeAdsConnection {
		self.ads_conn_rx
			.lock()
			.await
			.recv()
			.await
			.expect("transport dropped before a connection was opened")
	}

	pub async fn next_lrs_connection(&self) -> FakeLrsConnection {
		self.lrs_conn_rx
			.lock()
			.await
			.recv()
			.await
			.expect("transport dropped before an lrs connection was opened")
	}
}

impl Transport for FakeTransport {
	fn open_ads(&self, outbound: OutboundAds) -> BoxFuture<'static, Result<InboundAds, Error>> {
		let sent = Arc::new(Mutex::new(Vec::new()));
		let sent_for_task = sent.clone();
		tokio::spawn(async move {
			let mut outbound = outbound;
			while let Some(req) = tokio_stream::StreamExt::next(&mut outbound).await {
				sent_for_task.lock().push(req);
			}
		});
		let (responses_tx, responses_rx) = mpsc::unbounded_channel();
		let conn = FakeAdsConnection { sent, responses: responses_tx };
		let _ = self.ads_conn_tx.send(conn);
		let stream: InboundAds = Box::pin(UnboundedReceiverStream::new(responses_rx));
		Box::pin(async move { Ok(stream) })
	}

	fn open_lrs(&self, outbound: OutboundLrs) -> BoxFuture<'static, Result<InboundLrs, Error>> {
		let sent = Arc::new(Mutex::new(Vec::new()));
		let sent_for_task = sent.clone();
		tokio::spawn(async move {
			let mut outbound = outbound;
			while let Some(req) = tokio_stream::StreamExt::next(&mut outbound).await {
				sent_for_task.lock().push(req);
			}
		});
		let (responses_tx, responses_rx) = mpsc::unbounded_channel();
		let conn = FakeLrsConnection { sent, responses: responses_tx };
		let _ = self.lrs_conn_tx.send(conn);
		let stream: InboundLrs = Box::pin(UnboundedReceiverStream::new(responses_rx));
		Box::pin(async move { Ok(stream) })
	}
}

pub fn listener_any(name: &str, address_port: u32) -> envoy_types::pb::google::protobuf::Any {
	use envoy_types::pb::envoy::config::core::v3::{Address, SocketAddress, address, socket_address};
	use envoy_types::pb::envoy::config::listener::v3::Listener;
	use prost::Message;

	let listener = Listener {
		name: name.to_string(),
		address: Some(Address {
			address: Some(address::Address::SocketAddress(SocketAddress {
				address: "127.0.0.1".to_string(),
				port_specifier: Some(socket_address::PortSpecifier::PortValue(address_port)),
				..Default::default()
			})),
		}),
		..Default::default()
	};
	envoy_types::pb::google::protobuf::Any {
		type_url: xds_client::decode::LISTENER_TYPE_URL.to_string(),
		value: listener.encode_to_vec(),
	}
}

pub fn invalid_listener_any(name: &str) -> envoy_types::pb::google::protobuf::Any {
	use envoy_types::pb::envoy::config::listener::v3::Listener;
	use prost::Message;

	// Neither `api_listener` nor `address` set: decode::decode_listener
	// rejects this, per its one semantic check.
	let listener = Listener {
		name: name.to_string(),
		..Default::default()
	};
	envoy_types::pb::google::protobuf::Any {
		type_url: xds_client::decode::LISTENER_TYPE_URL.to_string(),
		value: listener.encode_to_vec(),
	}
}
