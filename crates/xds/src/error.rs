use std::fmt;

use thiserror::Error;

/// The full error taxonomy this crate surfaces. Every variant that is
/// ever surfaced to a watcher is rendered through [`with_node_id`] so the
/// bootstrap node ID is always present in the text.
#[derive(Debug, Error)]
pub enum Error {
	#[error("connecting to {0}: {1}")]
	Connection(String, #[source] tonic::transport::Error),

	#[error("transport error: {0}")]
	Transport(#[from] tonic::transport::Error),

	#[error("grpc stream failed: {0}")]
	GrpcStatus(#[from] tonic::Status),

	#[error("sending request failed: {0}")]
	RequestFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

	#[error("decode failure for {name}: {source}")]
	Decode {
		name: String,
		#[source]
		source: prost::DecodeError,
	},

	#[error("response missing resource payload for {0}")]
	MissingResource(String),

	#[error("invalid resource {name}: {reason}")]
	InvalidResource { name: String, reason: String },

	#[error("response missing type_url")]
	MissingTypeUrl,

	#[error("unknown resource type: {0}")]
	UnknownResourceType(String),

	#[error("no authority configured for name {name:?}")]
	MissingAuthority { name: String },

	#[error("client is closed")]
	Closed,
}

impl Error {
	/// Render a message suitable for delivery to a watcher as `ResourceError`
	/// or `AmbientError`, always carrying the bootstrap node ID.
	pub fn with_node_id(&self, node_id: &str) -> ResourceError {
		ResourceError {
			message: format!("node {node_id}: {self}"),
		}
	}

	/// The resource name a decode/validation failure is about, if any. Used
	/// to route a NACK's per-name `ResourceError`/`AmbientError` to the
	/// right cache entry even though the resource failed to decode.
	pub fn resource_name(&self) -> &str {
		match self {
			Error::Decode { name, .. } => name,
			Error::InvalidResource { name, .. } => name,
			Error::MissingResource(name) => name,
			_ => "",
		}
	}
}

/// A terminal (for a given cache entry) or ambient (non-invalidating) error
/// delivered to a watcher. Carries only a rendered message: the underlying
/// cause has already been logged by the engine that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceError {
	pub message: String,
}

impl ResourceError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}
}

impl fmt::Display for ResourceError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.message)
	}
}

impl std::error::Error for ResourceError {}
