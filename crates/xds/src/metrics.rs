use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use xds_core::metrics::{IncrementRecorder, Recorder};
use xds_core::strng::Strng;

use crate::error::Error;

/// Labels shared by the two per-resource-update counters named in spec.md §6.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceUpdateLabels {
	pub target: String,
	pub server: String,
	pub resource_type: String,
}

/// Labels for the server-failure counter named in spec.md §6.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServerFailureLabels {
	pub target: String,
	pub server: String,
}

/// The events this crate's counters record, one variant per spec.md §6
/// counter — the same shape as the `ConnectionTerminationReason` event enum
/// `agent-xds` records through `agent_core::metrics::Recorder`, generalized
/// to this crate's three counters.
pub enum Event<'a> {
	ResourceUpdateValid {
		target: &'a Strng,
		server: &'a Strng,
		resource_type: &'static str,
	},
	ResourceUpdateInvalid {
		target: &'a Strng,
		server: &'a Strng,
		resource_type: &'static str,
	},
	ServerFailure {
		target: &'a Strng,
		server: &'a Strng,
	},
}

/// `grpc.xds_client.*` counters. Off by default: a freshly constructed
/// [`Metrics`] records into counters nobody scrapes until [`Metrics::register`]
/// attaches them to a live [`Registry`], matching spec.md §6 ("Metrics are
/// off by default; call sites record only when a recorder is attached").
#[derive(Clone, Debug, Default)]
pub struct Metrics {
	resource_updates_valid: Family<ResourceUpdateLabels, Counter>,
	resource_updates_invalid: Family<ResourceUpdateLabels, Counter>,
	server_failure: Family<ServerFailureLabels, Counter>,
}

impl<'a> Recorder<Event<'a>, u64> for Metrics {
	fn record(&self, event: Event<'a>, count: u64) {
		match event {
			Event::ResourceUpdateValid { target, server, resource_type } => {
				self
					.resource_updates_valid
					.get_or_create(&ResourceUpdateLabels {
						target: target.to_string(),
						server: server.to_string(),
						resource_type: resource_type.to_string(),
					})
					.inc_by(count);
			}
			Event::ResourceUpdateInvalid { target, server, resource_type } => {
				self
					.resource_updates_invalid
					.get_or_create(&ResourceUpdateLabels {
						target: target.to_string(),
						server: server.to_string(),
						resource_type: resource_type.to_string(),
					})
					.inc_by(count);
			}
			Event::ServerFailure { target, server } => {
				self
					.server_failure
					.get_or_create(&ServerFailureLabels {
						target: target.to_string(),
						server: server.to_string(),
					})
					.inc_by(count);
			}
		}
	}
}

impl Metrics {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers this client's counters into `registry`, under an
	/// `xds_client` sub-registry, following the `agent-core::metrics::
	/// sub_registry` convention this workspace already uses.
	pub fn register(&self, registry: &mut Registry) {
		let sub = registry.sub_registry_with_prefix("xds_client");
		sub.register(
			"resource_updates_valid",
			"Number of resource updates that were successfully decoded",
			self.resource_updates_valid.clone(),
		);
		sub.register(
			"resource_updates_invalid",
			"Number of resource updates that failed to decode",
			self.resource_updates_invalid.clone(),
		);
		sub.register(
			"server_failure",
			"Number of streams that failed without a successful response",
			self.server_failure.clone(),
		);
	}

	pub fn record_valid(&self, target: &Strng, server: &Strng, resource_type: &'static str) {
		self.increment(Event::ResourceUpdateValid { target, server, resource_type });
	}

	pub fn record_invalid(&self, target: &Strng, server: &Strng, resource_type: &'static str) {
		self.increment(Event::ResourceUpdateInvalid { target, server, resource_type });
	}

	pub fn record_server_failure(&self, target: &Strng, server: &Strng) {
		self.increment(Event::ServerFailure { target, server });
	}
}

/// Whether a stream failure should be counted as a "server failure" per
/// spec.md §4.3: only if no response was received on the failed stream.
pub fn is_server_failure(received_any_response: bool, _err: &Error) -> bool {
	!received_any_response
}
