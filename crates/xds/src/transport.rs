//! Pluggable transport abstraction (spec.md §9: "Pluggable transport is
//! desirable but not required: the builder abstraction... exists so tests
//! can substitute a fake that directly produces DiscoveryResponses"). The
//! product transport is gRPC-framed bidirectional streaming (spec.md §1
//! non-goals: no other transport is a product requirement); this
//! abstraction exists purely to let `tests/` drive the engines without a
//! real network connection.

use std::future::Future;
use std::pin::Pin;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::envoy::service::load_stats::v3::load_reporting_service_client::LoadReportingServiceClient;
use envoy_types::pb::envoy::service::load_stats::v3::{LoadStatsRequest, LoadStatsResponse};
use tokio_stream::Stream;
use tonic::transport::Channel;
use tonic::Status;

use crate::error::Error;

pub type OutboundAds = Pin<Box<dyn Stream<Item = DiscoveryRequest> + Send>>;
pub type InboundAds = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
pub type OutboundLrs = Pin<Box<dyn Stream<Item = LoadStatsRequest> + Send>>;
pub type InboundLrs = Pin<Box<dyn Stream<Item = Result<LoadStatsResponse, Status>> + Send>>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens the ADS and LRS bidi streams to one management server. Implemented
/// by [`GrpcTransport`] for production use and by a `FakeTransport` under
/// `tests/support` for the scenarios in spec.md §8.
pub trait Transport: Send + Sync + 'static {
	fn open_ads(&self, outbound: OutboundAds) -> BoxFuture<'static, Result<InboundAds, Error>>;
	fn open_lrs(&self, outbound: OutboundLrs) -> BoxFuture<'static, Result<InboundLrs, Error>>;
}

/// Real transport: one lazily-connected `tonic::transport::Channel` shared
/// by the ADS and LRS clients of a single server, per spec.md §3 "xDS
/// Channel... owns the transport to one management server plus its ADS and
/// LRS engines".
pub struct GrpcTransport {
	target_uri: String,
}

impl GrpcTransport {
	pub fn new(target_uri: String) -> Self {
		Self { target_uri }
	}
}

impl Transport for GrpcTransport {
	fn open_ads(&self, outbound: OutboundAds) -> BoxFuture<'static, Result<InboundAds, Error>> {
		let target = self.target_uri.clone();
		Box::pin(async move {
			let channel = Channel::from_shared(target.clone())
				.map_err(|e| Error::Connection(target.clone(), e))?
				.connect()
				.await
				.map_err(|e| Error::Connection(target.clone(), e))?;
			let mut client = AggregatedDiscoveryServiceClient::new(channel)
				.max_decoding_message_size(200 * 1024 * 1024);
			let response = client
				.stream_aggregated_resources(tonic::Request::new(outbound))
				.await?;
			let stream: InboundAds = Box::pin(response.into_inner());
			Ok(stream)
		})
	}

	fn open_lrs(&self, outbound: OutboundLrs) -> BoxFuture<'static, Result<InboundLrs, Error>> {
		let target = self.target_uri.clone();
		Box::pin(async move {
			let channel = Channel::from_shared(target.clone())
				.map_err(|e| Error::Connection(target.clone(), e))?
				.connect()
				.await
				.map_err(|e| Error::Connection(target.clone(), e))?;
			let mut client = LoadReportingServiceClient::new(channel);
			let response = client.stream_load_stats(tonic::Request::new(outbound)).await?;
			let stream: InboundLrs = Box::pin(response.into_inner());
			Ok(stream)
		})
	}
}
