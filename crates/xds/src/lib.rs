//! An xDS aggregated-discovery-service client: watch-based
//! resource subscriptions over a shared gRPC channel per management server,
//! with federation, failover, and load reporting.

pub mod ads;
pub mod authority;
pub mod backoff;
pub mod bootstrap;
pub mod cache;
pub mod channel;
pub mod client;
pub mod decode;
pub mod error;
pub mod lrs;
pub mod metrics;
pub mod name;
pub mod pool;
pub mod registry;
pub mod serializer;
pub mod transport;
pub mod watcher;

pub use bootstrap::{AuthorityConfig, BootstrapConfig, ChannelCreds, Node, ServerConfig};
pub use client::{AuthorityDump, Cancel, ClientDump, TransportFactory, XdsClient, XdsClientConfig};
pub use error::{Error, ResourceError};
pub use lrs::LoadStore;
pub use name::ResourceName;
pub use pool::Release;
pub use registry::{ResourceTypeDescriptor, Registry};
pub use watcher::{OnDone, ResourceWatcher};
