//! Resource Type Registry (spec.md §3): a process-wide mapping from a
//! well-known type URL to a descriptor telling the ADS engine how to decode
//! a resource of that type and whether its SotW responses are guaranteed to
//! name every subscribed resource.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::decode::{self, Decoded};
use crate::error::Error;

pub type DecodeFn = fn(payload: &[u8]) -> Result<Decoded, Error>;

#[derive(Clone, Copy)]
pub struct ResourceTypeDescriptor {
	pub type_url: &'static str,
	pub type_name: &'static str,
	/// See spec.md §3 and the Open Question decision in `DESIGN.md`: all
	/// four built-in types are state-of-the-world, so names absent from a
	/// complete response are deleted (subject to the first-response grace
	/// period in spec.md §4.3 item 3).
	pub all_required_in_sotw: bool,
	pub decode: DecodeFn,
}

impl std::fmt::Debug for ResourceTypeDescriptor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResourceTypeDescriptor")
			.field("type_url", &self.type_url)
			.field("type_name", &self.type_name)
			.field("all_required_in_sotw", &self.all_required_in_sotw)
			.finish()
	}
}

static LISTENER: ResourceTypeDescriptor = ResourceTypeDescriptor {
	type_url: decode::LISTENER_TYPE_URL,
	type_name: "envoy.config.listener.v3.Listener",
	all_required_in_sotw: true,
	decode: decode::decode_listener,
};

static ROUTE_CONFIGURATION: ResourceTypeDescriptor = ResourceTypeDescriptor {
	type_url: decode::ROUTE_CONFIGURATION_TYPE_URL,
	type_name: "envoy.config.route.v3.RouteConfiguration",
	all_required_in_sotw: true,
	decode: decode::decode_route_configuration,
};

static CLUSTER: ResourceTypeDescriptor = ResourceTypeDescriptor {
	type_url: decode::CLUSTER_TYPE_URL,
	type_name: "envoy.config.cluster.v3.Cluster",
	all_required_in_sotw: true,
	decode: decode::decode_cluster,
};

static CLUSTER_LOAD_ASSIGNMENT: ResourceTypeDescriptor = ResourceTypeDescriptor {
	type_url: decode::CLUSTER_LOAD_ASSIGNMENT_TYPE_URL,
	type_name: "envoy.config.endpoint.v3.ClusterLoadAssignment",
	all_required_in_sotw: true,
	decode: decode::decode_cluster_load_assignment,
};

static DEFAULT_REGISTRY: Lazy<HashMap<&'static str, ResourceTypeDescriptor>> = Lazy::new(|| {
	[LISTENER, ROUTE_CONFIGURATION, CLUSTER, CLUSTER_LOAD_ASSIGNMENT]
		.into_iter()
		.map(|d| (d.type_url, d))
		.collect()
});

/// A registry of known resource types, defaulting to the four types
/// spec.md §6 names as supported, but extensible so a host process can
/// register additional type URLs (e.g. a wrapped `udpa.type.v1.TypedStruct`)
/// without forking this crate.
#[derive(Clone, Debug, Default)]
pub struct Registry {
	extra: HashMap<&'static str, ResourceTypeDescriptor>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, descriptor: ResourceTypeDescriptor) {
		self.extra.insert(descriptor.type_url, descriptor);
	}

	pub fn lookup(&self, type_url: &str) -> Option<&ResourceTypeDescriptor> {
		self.extra
			.get(type_url)
			.or_else(|| DEFAULT_REGISTRY.get(type_url))
	}

	/// Every type URL known to this registry, default plus host-registered.
	pub fn all_type_urls(&self) -> Vec<&'static str> {
		DEFAULT_REGISTRY.keys().chain(self.extra.keys()).copied().collect()
	}
}
