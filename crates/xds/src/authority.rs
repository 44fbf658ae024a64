//! Authority: owns per-resource caches for its federation namespace,
//! multiplexes subscriptions onto an active channel, and fails over across
//! an ordered server list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use xds_core::strng::Strng;

use crate::bootstrap::ServerConfig;
use crate::cache::{CacheEntry, UpdateStatus, WatchState};
use crate::decode::AnyResource;
use crate::error::ResourceError;
use crate::serializer::Serializer;
use crate::watcher::{AnyWatcher, OnDone, WatcherId};

/// Per-(type_url, canonical name) caches for one authority, plus its
/// failover bookkeeping.
pub struct Authority {
	pub name: Strng,
	node_id: String,
	watch_expiry: Duration,
	serializer: Arc<Serializer>,
	state: Mutex<AuthorityState>,
	next_watcher_id: AtomicU64,
	/// Fired whenever a cache entry gains a fresh expiry deadline, so a
	/// per-authority expiry task can wake immediately instead of polling.
	expiry_notify: Notify,
}

/// A single resource's diagnostic snapshot, for `Client::dump_resources()`.
#[derive(Clone, Debug, Serialize)]
pub struct ResourceSnapshot {
	pub type_url: &'static str,
	pub name: String,
	pub version: String,
	pub status: String,
	pub received_at_secs_ago: Option<f64>,
	pub error: Option<String>,
}

struct AuthorityState {
	server_configs: Vec<ServerConfig>,
	active_server_index: usize,
	consecutive_failures: u32,
	caches: HashMap<&'static str, IndexMap<Strng, CacheEntry>>,
}

impl Authority {
	pub fn new(
		name: Strng,
		server_configs: Vec<ServerConfig>,
		node_id: String,
		watch_expiry: Duration,
		serializer: Arc<Serializer>,
	) -> Self {
		Self {
			name,
			node_id,
			watch_expiry,
			serializer,
			state: Mutex::new(AuthorityState {
				server_configs,
				active_server_index: 0,
				consecutive_failures: 0,
				caches: HashMap::new(),
			}),
			next_watcher_id: AtomicU64::new(1),
			expiry_notify: Notify::new(),
		}
	}

	/// Waits until a cache entry gains a fresh expiry deadline. Used by the
	/// per-authority expiry task to avoid fixed-interval polling.
	pub async fn expiry_notified(&self) {
		self.expiry_notify.notified().await;
	}

	/// Per-resource diagnostic snapshot across every type this authority
	/// caches, for `Client::dump_resources()`.
	pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
		let state = self.state.lock();
		state
			.caches
			.iter()
			.flat_map(|(type_url, by_name)| {
				by_name.iter().map(move |(name, entry)| ResourceSnapshot {
					type_url,
					name: name.to_string(),
					version: entry.md.version.to_string(),
					status: format!("{:?}", entry.md.status),
					received_at_secs_ago: entry
						.decoded
						.is_some()
						.then(|| entry.md.timestamp.elapsed().as_secs_f64()),
					error: entry.error.as_ref().map(|e| e.to_string()),
				})
			})
			.collect()
	}

	pub fn active_server_uri(&self) -> String {
		self.active_server().target_uri
	}

	pub fn active_server(&self) -> ServerConfig {
		let state = self.state.lock();
		state.server_configs[state.active_server_index].clone()
	}

	/// Advances to the next server in the failover list, wrapping around.
	/// Returns the newly active config.
	pub fn advance_failover(&self) -> ServerConfig {
		let mut state = self.state.lock();
		state.consecutive_failures += 1;
		state.active_server_index = (state.active_server_index + 1) % state.server_configs.len();
		let next = state.server_configs[state.active_server_index].clone();
		warn!(authority = %self.name, server = %next.target_uri, "failing over to next xds server");
		next
	}

	/// A successful response resets the failure counter: a server that
	/// recovers starts its failover count fresh.
	pub fn note_recovered(&self) {
		self.state.lock().consecutive_failures = 0;
	}

	fn alloc_watcher_id(&self) -> WatcherId {
		self.next_watcher_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Registers a watcher for `(type_url, name)`. If a cached value or
	/// error already exists, the appropriate callback is dispatched
	/// immediately (via the serializer) with a no-op `OnDone`; this is not
	/// part of any in-flight response's flow-control gate. Returns the
	/// watcher id (for `remove_watcher`) and whether this is the first
	/// watcher for a previously-unwatched name (the caller must then ensure
	/// a subscription request goes out).
	pub fn add_watcher(
		&self,
		type_url: &'static str,
		name: Strng,
		watcher: Arc<dyn AnyWatcher>,
	) -> (WatcherId, bool) {
		let id = self.alloc_watcher_id();
		let mut state = self.state.lock();
		let by_name = state.caches.entry(type_url).or_default();
		let is_new = !by_name.contains_key(&name);
		let entry = by_name
			.entry(name.clone())
			.or_insert_with(|| CacheEntry::new_requested(name.clone(), self.watch_expiry, Instant::now()));

		if let Some(decoded) = entry.decoded.clone() {
			let watcher_for_dispatch = watcher.clone();
			self.serializer
				.enqueue(move || watcher_for_dispatch.on_changed(decoded, OnDone::noop()));
		} else if let Some(err) = entry.error.clone() {
			let watcher_for_dispatch = watcher.clone();
			self.serializer
				.enqueue(move || watcher_for_dispatch.on_resource_error(err, OnDone::noop()));
		}
		entry.watchers.insert(id, watcher);
		debug!(authority = %self.name, type_url, %name, watcher = id, "watch registered");
		drop(state);
		if is_new {
			self.expiry_notify.notify_waiters();
		}
		(id, is_new)
	}

	/// Removes a watcher registration. Idempotent: removing an
	/// already-removed id is a no-op. Returns whether the cache entry was
	/// dropped as a result (last watcher left and nothing else references
	/// the resource), so the caller can decide whether to unsubscribe.
	pub fn remove_watcher(&self, type_url: &'static str, name: &str, id: WatcherId) -> bool {
		let mut state = self.state.lock();
		let Some(by_name) = state.caches.get_mut(type_url) else {
			return false;
		};
		let Some(entry) = by_name.get_mut(name) else {
			return false;
		};
		entry.watchers.shift_remove(&id);
		if entry.watchers.is_empty() {
			by_name.shift_remove(name);
			debug!(authority = %self.name, type_url, name, "last watcher removed, dropping cache entry");
			true
		} else {
			false
		}
	}

	/// The current subscription set for `type_url`: every name with at
	/// least one watcher.
	pub fn subscribed_names(&self, type_url: &str) -> Vec<Strng> {
		let state = self.state.lock();
		state
			.caches
			.get(type_url)
			.map(|by_name| by_name.keys().cloned().collect())
			.unwrap_or_default()
	}

	/// Applies an accepted resource and dispatches `ResourceChanged` to
	/// every current watcher, but only if `raw` differs from the
	/// previously cached bytes (byte-exact equality, per the Open Question
	/// decision recorded in `DESIGN.md`). `make_on_done` is called once per
	/// dispatched watcher so the caller (the ADS engine) can wire each
	/// callback into this response's flow-control gate.
	pub fn on_update_and_dispatch(
		&self,
		type_url: &'static str,
		name: &Strng,
		raw: Bytes,
		decoded: AnyResource,
		version: Strng,
		nonce: Strng,
		mut make_on_done: impl FnMut() -> OnDone,
	) {
		let changed;
		let watchers: Vec<Arc<dyn AnyWatcher>>;
		{
			let mut state = self.state.lock();
			let Some(by_name) = state.caches.get_mut(type_url) else {
				return;
			};
			let Some(entry) = by_name.get_mut(name) else {
				return;
			};
			changed = entry.raw.as_ref() != Some(&raw);
			entry.raw = Some(raw);
			entry.decoded = Some(decoded.clone());
			entry.error = None;
			entry.md.version = version;
			entry.md.nonce = nonce;
			entry.md.timestamp = Instant::now();
			entry.md.status = UpdateStatus::Received;
			entry.watch_state = WatchState::Received;
			entry.expires_at = None;
			watchers = if changed {
				entry.watchers.values().cloned().collect()
			} else {
				Vec::new()
			};
		}
		if !changed {
			return;
		}
		for w in watchers {
			let on_done = make_on_done();
			let decoded = decoded.clone();
			self.serializer.enqueue(move || w.on_changed(decoded, on_done));
		}
	}

	/// NACK handling: preserves any previously cached good value and
	/// surfaces `AmbientError` to watchers that have one, or `ResourceError`
	/// to watchers that don't.
	pub fn on_nack(
		&self,
		type_url: &'static str,
		name: &Strng,
		nonce: Strng,
		err: ResourceError,
		mut make_on_done: impl FnMut() -> OnDone,
	) {
		let had_good_value;
		let watchers: Vec<Arc<dyn AnyWatcher>>;
		{
			let mut state = self.state.lock();
			let Some(by_name) = state.caches.get_mut(type_url) else {
				return;
			};
			let Some(entry) = by_name.get_mut(name) else {
				return;
			};
			had_good_value = entry.has_good_value();
			entry.error = Some(err.clone());
			entry.md.nonce = nonce;
			entry.md.timestamp = Instant::now();
			entry.md.status = UpdateStatus::Nacked;
			watchers = entry.watchers.values().cloned().collect();
		}
		for w in watchers {
			let on_done = make_on_done();
			let err = err.clone();
			if had_good_value {
				self.serializer.enqueue(move || w.on_ambient_error(err, on_done));
			} else {
				self.serializer.enqueue(move || w.on_resource_error(err, on_done));
			}
		}
	}

	/// Resource-does-not-exist: a name that was part of the
	/// subscription but absent from a later complete SotW response. Clears
	/// the cached value and fires `ResourceError` on every watcher.
	pub fn on_not_exist(&self, type_url: &'static str, name: &Strng) {
		let watchers: Vec<Arc<dyn AnyWatcher>>;
		{
			let mut state = self.state.lock();
			let Some(by_name) = state.caches.get_mut(type_url) else {
				return;
			};
			let Some(entry) = by_name.get_mut(name) else {
				return;
			};
			entry.raw = None;
			entry.decoded = None;
			entry.md.status = UpdateStatus::NotFound;
			entry.watch_state = WatchState::NotOnStream;
			let err = ResourceError::new(format!(
				"node {}: resource {name} of type {type_url} does not exist",
				self.node_id
			));
			entry.error = Some(err);
			watchers = entry.watchers.values().cloned().collect();
		}
		info!(authority = %self.name, type_url, %name, "resource does not exist");
		for w in watchers {
			let err = ResourceError::new(format!(
				"node {}: resource {name} of type {type_url} does not exist",
				self.node_id
			));
			self.serializer.enqueue(move || w.on_resource_error(err, OnDone::noop()));
		}
	}

	/// Stream failure after at least one response had been seen on this
	/// authority's cache: downgrade not-yet-received watches to ambient
	/// errors, preserving cached values.
	pub fn on_stream_failure(&self, type_url: &'static str, err: ResourceError) {
		let to_notify: Vec<(Strng, Arc<dyn AnyWatcher>, bool)>;
		{
			let mut state = self.state.lock();
			let Some(by_name) = state.caches.get_mut(type_url) else {
				return;
			};
			to_notify = by_name
				.iter_mut()
				.flat_map(|(name, entry)| {
					entry.watch_state = WatchState::Requested;
					let has_good = entry.has_good_value();
					entry
						.watchers
						.values()
						.cloned()
						.map(move |w| (name.clone(), w, has_good))
						.collect::<Vec<_>>()
				})
				.collect();
		}
		for (_name, w, has_good) in to_notify {
			let err = err.clone();
			if has_good {
				self.serializer.enqueue(move || w.on_ambient_error(err, OnDone::noop()));
			} else {
				self.serializer.enqueue(move || w.on_resource_error(err, OnDone::noop()));
			}
		}
	}

	/// Sweeps expired (never-received) watches, firing `ResourceError` and
	/// transitioning to `Timeout`. Returns
	/// the earliest remaining deadline, if any, so the caller can
	/// reschedule its sleep.
	pub fn sweep_expired(&self, now: Instant) -> Option<Instant> {
		let mut fired: Vec<(Strng, &'static str, Vec<Arc<dyn AnyWatcher>>)> = Vec::new();
		let mut next_deadline = None;
		{
			let mut state = self.state.lock();
			for (type_url, by_name) in state.caches.iter_mut() {
				let type_url: &'static str = *type_url;
				for (name, entry) in by_name.iter_mut() {
					match entry.expires_at {
						Some(deadline) if deadline <= now => {
							entry.watch_state = WatchState::Timeout;
							entry.md.status = UpdateStatus::Timeout;
							entry.expires_at = None;
							fired.push((name.clone(), type_url, entry.watchers.values().cloned().collect()));
						}
						Some(deadline) => {
							next_deadline = Some(match next_deadline {
								Some(d) if d < deadline => d,
								_ => deadline,
							});
						}
						None => {}
					}
				}
			}
		}
		for (name, type_url, watchers) in fired {
			warn!(authority = %self.name, type_url, %name, "watch expired before first response");
			let node_id = self.node_id.clone();
			for w in watchers {
				let name = name.clone();
				let node_id = node_id.clone();
				self.serializer.enqueue(move || {
					w.on_resource_error(
						ResourceError::new(format!(
							"node {node_id}: watch for {name} of type {type_url} timed out"
						)),
						OnDone::noop(),
					)
				});
			}
		}
		next_deadline
	}
}
