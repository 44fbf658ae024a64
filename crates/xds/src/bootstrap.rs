//! Narrow bootstrap-configuration interface the client consumes. This crate
//! does not parse bootstrap *files*; that parser is an external
//! collaborator, but this module defines the shapes it must produce,
//! derived with `serde::Deserialize` so a host's own parser can feed these
//! directly.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::Node as NodeProto;
use indexmap::IndexMap;
use serde::Deserialize;

/// The node descriptor sent on the first request of every fresh stream.
/// Kept deliberately small; `metadata` round-trips into the proto
/// `Node.metadata` struct verbatim.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Node {
	pub id: String,
	pub cluster: String,
	#[serde(default)]
	pub locality: Option<Locality>,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
	#[serde(default)]
	pub user_agent_name: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Locality {
	#[serde(default)]
	pub region: String,
	#[serde(default)]
	pub zone: String,
	#[serde(default)]
	pub sub_zone: String,
}

impl Node {
	pub fn to_proto(&self) -> NodeProto {
		let metadata = if self.metadata.is_empty() {
			None
		} else {
			let fields = self
				.metadata
				.iter()
				.map(|(k, v)| {
					(
						k.clone(),
						prost_types::Value {
							kind: Some(prost_types::value::Kind::StringValue(v.clone())),
						},
					)
				})
				.collect();
			Some(prost_types::Struct { fields })
		};
		NodeProto {
			id: self.id.clone(),
			cluster: self.cluster.clone(),
			locality: self.locality.as_ref().map(|l| {
				envoy_types::pb::envoy::config::core::v3::Locality {
					region: l.region.clone(),
					zone: l.zone.clone(),
					sub_zone: l.sub_zone.clone(),
				}
			}),
			metadata,
			user_agent_name: self.user_agent_name.clone(),
			..Default::default()
		}
	}
}

/// A server a channel can be opened to. The ordered `server_configs` list on
/// an authority is `Vec<ServerConfig>`; failover walks it in
/// order and wraps back to the start.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
	pub target_uri: String,
	#[serde(default)]
	pub channel_creds: ChannelCreds,
	#[serde(default)]
	pub server_features: Vec<String>,
}

impl ServerConfig {
	/// Canonical string used as the channel pool key:
	/// target URI, credential descriptor, and feature list so that servers
	/// differing only in features never share a channel they couldn't
	/// actually share (e.g. `ignore_resource_deletion` changes engine
	/// behavior, not just transport).
	pub fn canonical_key(&self) -> String {
		let mut features = self.server_features.clone();
		features.sort();
		format!(
			"{}|{:?}|{}",
			self.target_uri,
			self.channel_creds,
			features.join(",")
		)
	}

	pub fn ignores_resource_deletion(&self) -> bool {
		self
			.server_features
			.iter()
			.any(|f| f == "ignore_resource_deletion")
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
pub enum ChannelCreds {
	#[default]
	Insecure,
	Tls,
}

/// An authority's own failover list; falls back to
/// the bootstrap's top-level `servers` when empty, matching the documented
/// grpc-xds/Envoy bootstrap semantics for per-authority server lists.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthorityConfig {
	#[serde(default)]
	pub servers: Vec<ServerConfig>,
}

/// The narrow slice of a parsed bootstrap file this crate needs. A host
/// process's bootstrap-file parser (out of scope here) produces one of
/// these.
#[derive(Clone, Debug, Deserialize)]
pub struct BootstrapConfig {
	pub node: Node,
	pub servers: Vec<ServerConfig>,
	#[serde(default)]
	pub authorities: IndexMap<String, AuthorityConfig>,
}

impl BootstrapConfig {
	pub fn node_id(&self) -> &str {
		&self.node.id
	}

	/// Resolves the ordered failover list for an authority name (`""` is
	/// the unnamed top-level authority). Returns `None` if `name` is
	/// non-empty and absent from `authorities`.
	pub fn servers_for(&self, name: &str) -> Option<&[ServerConfig]> {
		if name.is_empty() {
			return Some(&self.servers);
		}
		self.authorities.get(name).map(|a| {
			if a.servers.is_empty() {
				self.servers.as_slice()
			} else {
				a.servers.as_slice()
			}
		})
	}
}
