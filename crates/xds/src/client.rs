//! Client Core: composes the callback serializer, the
//! channel pool, and per-authority state behind the four public operations:
//! `watch_resource`, `report_load`, `dump_resources`, `close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use xds_core::strng::Strng;

use crate::authority::{Authority, ResourceSnapshot};
use crate::backoff::BackoffConfig;
use crate::bootstrap::{BootstrapConfig, ServerConfig};
use crate::channel::XdsChannel;
use crate::error::{Error, ResourceError};
use crate::lrs::LoadStore;
use crate::metrics::Metrics;
use crate::name::ResourceName;
use crate::pool::{ChannelPool, Release};
use crate::registry::Registry;
use crate::serializer::Serializer;
use crate::transport::{GrpcTransport, Transport};
use crate::watcher::{self, OnDone, ResourceWatcher, WatcherId};

/// Builds a [`Transport`] for a given server. Production clients never
/// override the default (a `GrpcTransport` per server); tests substitute a
/// `FakeTransport`-backed factory.
pub type TransportFactory = Arc<dyn Fn(&ServerConfig) -> Arc<dyn Transport> + Send + Sync>;

fn default_transport_factory() -> TransportFactory {
	Arc::new(|server: &ServerConfig| -> Arc<dyn Transport> { Arc::new(GrpcTransport::new(server.target_uri.clone())) })
}

/// Tunables a host can override per client: the
/// per-client target label used on metrics, and the watch-expiry timeout
/// (default 15s) so tests can shrink it.
#[derive(Clone, Debug)]
pub struct XdsClientConfig {
	pub target: Strng,
	pub watch_expiry: Duration,
	pub backoff: BackoffConfig,
}

impl XdsClientConfig {
	pub fn new(target: impl Into<Strng>) -> Self {
		Self {
			target: target.into(),
			..Self::default()
		}
	}

	pub fn with_watch_expiry(mut self, watch_expiry: Duration) -> Self {
		self.watch_expiry = watch_expiry;
		self
	}

	pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
		self.backoff = backoff;
		self
	}
}

impl Default for XdsClientConfig {
	fn default() -> Self {
		Self {
			target: Strng::default(),
			watch_expiry: Duration::from_secs(15),
			backoff: BackoffConfig::default(),
		}
	}
}

struct AuthorityHandle {
	authority: Arc<Authority>,
	channel: Arc<XdsChannel>,
	release: Release,
	expiry_task: JoinHandle<()>,
	failover_task: JoinHandle<()>,
}

#[derive(Default)]
struct ClientState {
	authorities: IndexMap<Strng, AuthorityHandle>,
}

#[derive(Clone, Copy)]
enum Purpose {
	Authority,
	Lrs,
}

/// Composes the client's pieces. Always held behind `Arc` so
/// `watch_resource`/`report_load` can hand back a [`Cancel`] carrying a
/// strong reference back to the client.
pub struct XdsClient {
	config: XdsClientConfig,
	bootstrap: BootstrapConfig,
	registry: Registry,
	metrics: Arc<Metrics>,
	pool: Arc<ChannelPool>,
	serializer: Arc<Serializer>,
	transport_factory: TransportFactory,
	state: Mutex<ClientState>,
	closed: AtomicBool,
}

impl XdsClient {
	pub fn new(config: XdsClientConfig, bootstrap: BootstrapConfig) -> Arc<Self> {
		Self::new_with_transport_factory(config, bootstrap, default_transport_factory())
	}

	/// Test/host-injectable constructor: every channel this client ever
	/// creates is built through `transport_factory` instead of always
	/// dialing real gRPC.
	pub fn new_with_transport_factory(
		config: XdsClientConfig,
		bootstrap: BootstrapConfig,
		transport_factory: TransportFactory,
	) -> Arc<Self> {
		Arc::new(Self {
			config,
			bootstrap,
			registry: Registry::new(),
			metrics: Arc::new(Metrics::new()),
			pool: ChannelPool::new(),
			serializer: Arc::new(Serializer::new()),
			transport_factory,
			state: Mutex::new(ClientState::default()),
			closed: AtomicBool::new(false),
		})
	}

	/// Registers a host-provided resource-type descriptor in addition to
	/// the four built-in types, before any watches are registered.
	pub fn register_resource_type(&mut self, descriptor: crate::registry::ResourceTypeDescriptor) {
		self.registry.register(descriptor);
	}

	pub fn metrics(&self) -> Arc<Metrics> {
		self.metrics.clone()
	}

	/// Resolves `resource_name`'s authority, registers `watcher`, and
	/// ensures a subscription request goes out. Returns a
	/// no-op cancel and synchronously dispatches a terminal `ResourceError`
	/// if the name is malformed, its authority is missing from bootstrap, or
	/// the client is already closed.
	pub fn watch_resource<T, W>(self: &Arc<Self>, type_url: &'static str, name: &str, watcher: W) -> Cancel
	where
		T: Send + Sync + 'static,
		W: ResourceWatcher<T>,
	{
		let erased = watcher::erase::<T, W>(watcher);

		if self.closed.load(Ordering::SeqCst) {
			let err = Error::Closed.with_node_id(self.bootstrap.node_id());
			self.serializer.enqueue(move || erased.on_resource_error(err, OnDone::noop()));
			return Cancel::noop();
		}

		let parsed = match ResourceName::parse(name) {
			Ok(p) => p,
			Err(reason) => {
				let err = ResourceError::new(format!(
					"node {}: invalid resource name {name:?}: {reason}",
					self.bootstrap.node_id()
				));
				self.serializer.enqueue(move || erased.on_resource_error(err, OnDone::noop()));
				return Cancel::noop();
			}
		};
		let canonical = parsed.canonical();
		let authority_name = parsed.authority().to_string();

		let (authority, channel) = match self.get_or_create_authority(&authority_name) {
			Ok(pair) => pair,
			Err(err) => {
				let rendered = err.with_node_id(self.bootstrap.node_id());
				self.serializer.enqueue(move || erased.on_resource_error(rendered, OnDone::noop()));
				return Cancel::noop();
			}
		};

		let (watcher_id, is_new) = authority.add_watcher(type_url, canonical.clone(), erased);
		if is_new {
			channel.resubscribe();
		}
		Cancel::new(self.clone(), Strng::from(authority_name.as_str()), type_url, canonical, watcher_id)
	}

	/// Acquires (or joins) the LRS stream for `server`, incrementing its
	/// ref count on the shared channel. The returned
	/// `Release` decrements the ref count and stops reporting once it is
	/// the last user of this channel's LRS stream.
	pub fn report_load(self: &Arc<Self>, server: ServerConfig) -> (LoadStore, Release) {
		let key = server.canonical_key();
		let (channel, release) = self.acquire_channel(key, server, Purpose::Lrs);
		let store = channel.start_lrs();
		(store, release)
	}

	/// Per-authority diagnostic snapshot, suitable for a debug endpoint.
	pub fn dump_resources(&self) -> ClientDump {
		let state = self.state.lock();
		let authorities = state
			.authorities
			.iter()
			.map(|(name, handle)| AuthorityDump {
				name: name.to_string(),
				active_server: handle.authority.active_server_uri(),
				resources: handle.authority.snapshot(),
			})
			.collect();
		ClientDump {
			node_id: self.bootstrap.node_id().to_string(),
			authorities,
		}
	}

	/// Tears down every authority, then releases every channel reference it
	/// held. Idempotent. The serializer has no
	/// explicit shutdown call here: once the last `Arc<Serializer>` (held by
	/// this client and, while they lived, its authorities) drops, its
	/// sender half drops, the background task observes a closed channel at
	/// its next `recv().await`, and exits on its own — see `serializer.rs`.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let handles: Vec<AuthorityHandle> = {
			let mut state = self.state.lock();
			state.authorities.drain(..).map(|(_, h)| h).collect()
		};
		for handle in handles {
			handle.expiry_task.abort();
			handle.failover_task.abort();
			handle.channel.remove_authority(&handle.authority);
			handle.release.release();
		}
	}

	fn cancel_watch(&self, authority_name: &Strng, type_url: &'static str, name: &Strng, id: WatcherId) {
		let (authority, channel) = {
			let state = self.state.lock();
			match state.authorities.get(authority_name) {
				Some(handle) => (handle.authority.clone(), handle.channel.clone()),
				None => return,
			}
		};
		if authority.remove_watcher(type_url, name, id) {
			channel.resubscribe();
		}
	}

	fn get_or_create_authority(self: &Arc<Self>, name: &str) -> Result<(Arc<Authority>, Arc<XdsChannel>), Error> {
		let name_key = Strng::from(name);
		let mut state = self.state.lock();
		if let Some(handle) = state.authorities.get(&name_key) {
			return Ok((handle.authority.clone(), handle.channel.clone()));
		}
		let servers = self
			.bootstrap
			.servers_for(name)
			.filter(|s| !s.is_empty())
			.ok_or_else(|| Error::MissingAuthority { name: name.to_string() })?;

		let authority = Arc::new(Authority::new(
			name_key.clone(),
			servers.to_vec(),
			self.bootstrap.node_id().to_string(),
			self.config.watch_expiry,
			self.serializer.clone(),
		));
		let active = authority.active_server();
		let key = active.canonical_key();
		let (channel, release) = self.acquire_channel(key, active, Purpose::Authority);
		channel.add_authority(authority.clone());

		let expiry_task = spawn_expiry_task(authority.clone());
		let failover_task = spawn_failover_task(self.clone(), name_key.clone());

		state.authorities.insert(
			name_key,
			AuthorityHandle {
				authority: authority.clone(),
				channel: channel.clone(),
				release,
				expiry_task,
				failover_task,
			},
		);
		Ok((authority, channel))
	}

	fn acquire_channel(&self, key: String, server: ServerConfig, purpose: Purpose) -> (Arc<XdsChannel>, Release) {
		let transport_factory = self.transport_factory.clone();
		let registry = self.registry.clone();
		let metrics = self.metrics.clone();
		let target = self.config.target.clone();
		let node = self.bootstrap.node.clone();
		let backoff = self.config.backoff;
		let make = move || {
			let transport = (transport_factory)(&server);
			XdsChannel::new_with_transport(
				server.clone(),
				target.clone(),
				node.clone(),
				registry.clone(),
				metrics.clone(),
				backoff,
				transport,
			)
		};
		match purpose {
			Purpose::Authority => self.pool.acquire_for_authority(key, make),
			Purpose::Lrs => self.pool.acquire_for_lrs(key, make),
		}
	}

	/// Moves `authority_name`'s subscription onto a newly acquired channel
	/// for `next`, as part of failover. The old channel reference is
	/// released only after the authority has been added to the new one, so
	/// a shared channel (another authority still using the old server)
	/// never observes a gap.
	fn switch_authority_channel(self: &Arc<Self>, authority_name: &Strng, next: ServerConfig) {
		let mut state = self.state.lock();
		let Some(handle) = state.authorities.get_mut(authority_name) else {
			return;
		};
		let key = next.canonical_key();
		let (new_channel, new_release) = self.acquire_channel(key, next, Purpose::Authority);
		new_channel.add_authority(handle.authority.clone());
		let old_channel = std::mem::replace(&mut handle.channel, new_channel);
		old_channel.remove_authority(&handle.authority);
		let old_release = std::mem::replace(&mut handle.release, new_release);
		old_release.release();
	}
}

fn spawn_expiry_task(authority: Arc<Authority>) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			match authority.sweep_expired(std::time::Instant::now()) {
				Some(deadline) => {
					tokio::select! {
						_ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
						_ = authority.expiry_notified() => {}
					}
				}
				None => authority.expiry_notified().await,
			}
		}
	})
}

/// Polls the channel's consecutive-stream-failure counter and drives the
/// authority through `advance_failover`/`note_recovered`. A fixed 200ms poll
/// interval was chosen over a notify-based design because the failure
/// counter lives on the ADS engine, one layer away from the authority that
/// needs to react to it, and polling avoids threading a second cross-module
/// `Notify` through `channel.rs` for a signal that only needs sub-second
/// responsiveness, not immediate wakeup.
fn spawn_failover_task(client: Arc<XdsClient>, authority_name: Strng) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut last_seen = 0u32;
		loop {
			tokio::time::sleep(Duration::from_millis(200)).await;
			let (authority, channel) = {
				let state = client.state.lock();
				match state.authorities.get(&authority_name) {
					Some(handle) => (handle.authority.clone(), handle.channel.clone()),
					None => return,
				}
			};
			let failures = channel.consecutive_stream_failures();
			if failures == 0 {
				if last_seen != 0 {
					debug!(authority = %authority_name, "xds server recovered");
					authority.note_recovered();
				}
			} else if failures > last_seen {
				warn!(authority = %authority_name, failures, "xds server failing, advancing failover");
				let next = authority.advance_failover();
				client.switch_authority_channel(&authority_name, next);
			}
			last_seen = failures;
		}
	})
}

struct CancelInner {
	client: Arc<XdsClient>,
	authority_name: Strng,
	type_url: &'static str,
	name: Strng,
	watcher_id: WatcherId,
}

/// Returned by [`XdsClient::watch_resource`]. Idempotent: calling `cancel()`
/// (or dropping it) more than once only removes the watcher once.
pub struct Cancel {
	inner: Option<CancelInner>,
	fired: bool,
}

impl Cancel {
	fn new(client: Arc<XdsClient>, authority_name: Strng, type_url: &'static str, name: Strng, watcher_id: WatcherId) -> Self {
		Self {
			inner: Some(CancelInner {
				client,
				authority_name,
				type_url,
				name,
				watcher_id,
			}),
			fired: false,
		}
	}

	fn noop() -> Self {
		Self { inner: None, fired: true }
	}

	pub fn cancel(mut self) {
		self.fire();
	}

	fn fire(&mut self) {
		if self.fired {
			return;
		}
		self.fired = true;
		if let Some(inner) = self.inner.take() {
			inner
				.client
				.cancel_watch(&inner.authority_name, inner.type_url, &inner.name, inner.watcher_id);
		}
	}
}

impl Drop for Cancel {
	fn drop(&mut self) {
		self.fire();
	}
}

#[derive(Clone, Debug, Serialize)]
pub struct ClientDump {
	pub node_id: String,
	pub authorities: Vec<AuthorityDump>,
}

impl ClientDump {
	/// Renders the snapshot as JSON, suitable for serving from a debug
	/// endpoint.
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string_pretty(self)
	}
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthorityDump {
	pub name: String,
	pub active_server: String,
	pub resources: Vec<ResourceSnapshot>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bootstrap::{ChannelCreds, Node};
	use crate::decode::LISTENER_TYPE_URL;
	use std::sync::Mutex as StdMutex;

	fn bootstrap_with_servers() -> BootstrapConfig {
		BootstrapConfig {
			node: Node {
				id: "test-node".into(),
				cluster: "test-cluster".into(),
				locality: None,
				metadata: Default::default(),
				user_agent_name: "xds-client-test".into(),
			},
			servers: vec![ServerConfig {
				target_uri: "http://127.0.0.1:1".into(),
				channel_creds: ChannelCreds::Insecure,
				server_features: Vec::new(),
			}],
			authorities: Default::default(),
		}
	}

	struct RecordingWatcher {
		errors: Arc<StdMutex<Vec<String>>>,
	}

	impl ResourceWatcher<envoy_types::pb::envoy::config::listener::v3::Listener> for RecordingWatcher {
		fn on_changed(&self, _data: Arc<envoy_types::pb::envoy::config::listener::v3::Listener>, on_done: OnDone) {
			on_done.done();
		}
		fn on_resource_error(&self, err: ResourceError, on_done: OnDone) {
			self.errors.lock().unwrap().push(err.to_string());
			on_done.done();
		}
		fn on_ambient_error(&self, err: ResourceError, on_done: OnDone) {
			self.errors.lock().unwrap().push(err.to_string());
			on_done.done();
		}
	}

	#[tokio::test]
	async fn missing_authority_reports_synchronous_error() {
		let client = XdsClient::new(XdsClientConfig::new("test-target"), bootstrap_with_servers());
		let errors = Arc::new(StdMutex::new(Vec::new()));
		let watcher = RecordingWatcher { errors: errors.clone() };
		let _cancel = client.watch_resource::<envoy_types::pb::envoy::config::listener::v3::Listener, _>(
			LISTENER_TYPE_URL,
			"xdstp://unknown-authority/Listener/l1",
			watcher,
		);
		tokio::time::sleep(Duration::from_millis(20)).await;
		let seen = errors.lock().unwrap();
		assert_eq!(seen.len(), 1);
		assert!(seen[0].contains("test-node"));
		client.close();
	}

	#[tokio::test]
	async fn cancel_is_idempotent() {
		let client = XdsClient::new(XdsClientConfig::new("test-target"), bootstrap_with_servers());
		let errors = Arc::new(StdMutex::new(Vec::new()));
		let watcher = RecordingWatcher { errors };
		let cancel =
			client.watch_resource::<envoy_types::pb::envoy::config::listener::v3::Listener, _>(LISTENER_TYPE_URL, "my-listener", watcher);
		cancel.cancel();
		client.close();
	}

	#[tokio::test]
	async fn close_is_idempotent() {
		let client = XdsClient::new(XdsClientConfig::new("test-target"), bootstrap_with_servers());
		client.close();
		client.close();
	}

	#[tokio::test]
	async fn dump_resources_reports_registered_authority() {
		let client = XdsClient::new(XdsClientConfig::new("test-target"), bootstrap_with_servers());
		let errors = Arc::new(StdMutex::new(Vec::new()));
		let watcher = RecordingWatcher { errors };
		let _cancel =
			client.watch_resource::<envoy_types::pb::envoy::config::listener::v3::Listener, _>(LISTENER_TYPE_URL, "my-listener", watcher);
		let dump = client.dump_resources();
		assert_eq!(dump.node_id, "test-node");
		assert_eq!(dump.authorities.len(), 1);
		assert_eq!(dump.authorities[0].resources.len(), 1);
		client.close();
	}
}
