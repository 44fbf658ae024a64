//! ADS Stream Engine: owns one bidirectional
//! `StreamAggregatedResources` call to a single management server, drives
//! the Starting/Connecting/Streaming/Backoff state machine, composes
//! requests, decodes and validates responses, and dispatches accepted or
//! rejected resources to every interested authority's cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xds_core::strng::Strng;

use crate::backoff::BackoffConfig;
use crate::bootstrap::{Node, ServerConfig};
use crate::error::{Error, ResourceError};
use crate::metrics::{is_server_failure, Metrics};
use crate::registry::Registry;
use crate::transport::Transport;
use crate::watcher::OnDone;

use crate::authority::Authority;

/// Gates the next `Recv` on every watcher callback dispatched for the
/// current response having fired its `OnDone` (flow control). One gate is
/// created per processed response; creating
/// a fresh `OnDone` via `make_on_done()` increments `pending`, and each
/// firing decrements it and notifies once it reaches zero.
struct ResponseGate {
	pending: Arc<AtomicUsize>,
	notify: Arc<Notify>,
}

impl ResponseGate {
	fn new() -> Self {
		Self {
			pending: Arc::new(AtomicUsize::new(0)),
			notify: Arc::new(Notify::new()),
		}
	}

	fn make_on_done(&self) -> OnDone {
		self.pending.fetch_add(1, Ordering::SeqCst);
		let pending = self.pending.clone();
		let notify = self.notify.clone();
		OnDone::new(move || {
			if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
				notify.notify_waiters();
			}
		})
	}

	/// Waits until every callback dispatched through this gate has fired.
	async fn closed(&self) {
		loop {
			// Register interest in the next notification *before* checking
			// `pending`: `notify_waiters()` wakes only already-registered
			// waiters and stores no permit, so checking the counter first
			// would let a decrement-to-zero-and-notify race land in the gap
			// between the load and the `.await` and be lost forever.
			let notified = self.notify.notified();
			if self.pending.load(Ordering::SeqCst) == 0 {
				return;
			}
			notified.await;
		}
	}
}

/// Per-type stream bookkeeping the engine needs across responses: the last
/// accepted version/nonce (for ACKs) and whether any response has ever been
/// received for this type on the *current* stream generation (controls
/// whether a does-not-exist sweep is eligible, via the first-response grace
/// period below).
#[derive(Default, Clone)]
struct TypeStreamState {
	version: Strng,
	nonce: Strng,
	seen_first_response: bool,
}

struct EngineState {
	authorities: Vec<Arc<Authority>>,
	type_state: HashMap<&'static str, TypeStreamState>,
}

/// One ADS engine per xDS channel. Reconnects to
/// the *same* `server` with exponential backoff; migrating to a different
/// server in a failover list is a decision made above this layer (the
/// authority/client), which re-resolves a different channel from the pool.
pub struct AdsEngine {
	server: ServerConfig,
	target: Strng,
	node: Node,
	transport: Arc<dyn Transport>,
	registry: Registry,
	metrics: Arc<Metrics>,
	backoff: BackoffConfig,
	state: Mutex<EngineState>,
	resubscribe: Notify,
	consecutive_stream_failures: AtomicU32,
}

impl AdsEngine {
	pub fn new(
		server: ServerConfig,
		target: Strng,
		node: Node,
		transport: Arc<dyn Transport>,
		registry: Registry,
		metrics: Arc<Metrics>,
		backoff: BackoffConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			server,
			target,
			node,
			transport,
			registry,
			metrics,
			backoff,
			state: Mutex::new(EngineState {
				authorities: Vec::new(),
				type_state: HashMap::new(),
			}),
			resubscribe: Notify::new(),
			consecutive_stream_failures: AtomicU32::new(0),
		})
	}

	/// Number of consecutive stream attempts that failed without a single
	/// accepted response. A higher layer (the authority) can poll this to
	/// decide whether to fail over to the next server in its list.
	pub fn consecutive_stream_failures(&self) -> u32 {
		self.consecutive_stream_failures.load(Ordering::Relaxed)
	}

	pub fn add_authority(&self, authority: Arc<Authority>) {
		let mut state = self.state.lock();
		if !state.authorities.iter().any(|a| Arc::ptr_eq(a, &authority)) {
			state.authorities.push(authority);
		}
		drop(state);
		self.resubscribe.notify_waiters();
	}

	pub fn remove_authority(&self, authority: &Arc<Authority>) {
		let mut state = self.state.lock();
		state.authorities.retain(|a| !Arc::ptr_eq(a, authority));
		drop(state);
		self.resubscribe.notify_waiters();
	}

	/// Nudges the run loop to re-send the current subscription set, e.g.
	/// after a new resource name was added to an already-subscribed
	/// authority/type.
	pub fn resubscribe_now(&self) {
		self.resubscribe.notify_waiters();
	}

	/// Spawns the engine's run loop. The returned handle is owned by the
	/// channel; dropping it (via abort on `close()`) tears the stream down.
	pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
		tokio::spawn(async move { self.run().await })
	}

	async fn run(self: Arc<Self>) {
		let mut attempt: u32 = 0;
		loop {
			match self.run_stream().await {
				Ok(()) => {
					info!(server = %self.server.target_uri, "ads stream closed cleanly");
					attempt = 0;
				}
				Err(err) => {
					warn!(server = %self.server.target_uri, error = %err, "ads stream failed");
				}
			}
			let delay = self.backoff.delay(attempt);
			attempt = attempt.saturating_add(1);
			tokio::time::sleep(delay).await;
		}
	}

	/// Desired subscription set per type: union of every interested
	/// authority's watched names for that type.
	fn desired_names(&self, type_url: &str) -> Vec<String> {
		let state = self.state.lock();
		let mut names: Vec<String> = state
			.authorities
			.iter()
			.flat_map(|a| a.subscribed_names(type_url))
			.map(|n| n.to_string())
			.collect();
		names.sort();
		names.dedup();
		names
	}

	fn all_type_urls(&self) -> Vec<&'static str> {
		self.registry.all_type_urls()
	}

	async fn run_stream(&self) -> Result<(), Error> {
		let (req_tx, mut req_rx) = mpsc::unbounded_channel::<DiscoveryRequest>();
		let mut received_any_response = false;

		// Fresh stream: a node proto must accompany the first request only,
		// and every type's ACK state resets.
		{
			let mut state = self.state.lock();
			for ts in state.type_state.values_mut() {
				*ts = TypeStreamState::default();
			}
		}
		let mut node_sent = false;

		let outbound = async_stream::stream! {
			while let Some(req) = req_rx.recv().await {
				yield req;
			}
		};

		// Seed the initial subscription requests for every resource type
		// with at least one watcher, before opening the stream, so the very
		// first bytes establish the full subscription set.
		for type_url in self.all_type_urls() {
			let names = self.desired_names(type_url);
			if names.is_empty() {
				continue;
			}
			let node = if !node_sent { Some(self.node.to_proto()) } else { None };
			node_sent = true;
			let _ = req_tx.send(DiscoveryRequest {
				type_url: type_url.to_string(),
				resource_names: names,
				node,
				..Default::default()
			});
		}

		let outbound = Box::pin(outbound);
		let mut inbound = self
			.transport
			.open_ads(outbound)
			.await
			.map_err(|e| self.note_stream_result(false, e))?;

		loop {
			tokio::select! {
				_ = self.resubscribe.notified() => {
					for type_url in self.all_type_urls() {
						let names = self.desired_names(type_url);
						if names.is_empty() {
							continue;
						}
						let node = if !node_sent { Some(self.node.to_proto()) } else { None };
						node_sent = true;
						// A resubscribe due to a newly added watcher on a type that
						// already has an accepted version/nonce on this stream must
						// carry them: an empty version_info here would read as a
						// fresh subscription rather than "add to my existing one".
						let (version_info, response_nonce) = {
							let state = self.state.lock();
							match state.type_state.get(type_url) {
								Some(ts) => (ts.version.to_string(), ts.nonce.to_string()),
								None => (String::new(), String::new()),
							}
						};
						let _ = req_tx.send(DiscoveryRequest {
							type_url: type_url.to_string(),
							resource_names: names,
							version_info,
							response_nonce,
							node,
							..Default::default()
						});
					}
				}
				msg = tokio_stream::StreamExt::next(&mut inbound) => {
					let Some(msg) = msg else {
						return Ok(());
					};
					let response = msg.map_err(Error::from).map_err(|e| self.note_stream_result(received_any_response, e))?;
					received_any_response = true;
					self.consecutive_stream_failures.store(0, Ordering::Relaxed);
					if let Err(e) = self.handle_response(response, &req_tx).await {
						warn!(server = %self.server.target_uri, error = %e, "failed to process ads response");
					}
				}
			}
		}
	}

	fn note_stream_result(&self, received_any_response: bool, err: Error) -> Error {
		if is_server_failure(received_any_response, &err) {
			self.consecutive_stream_failures.fetch_add(1, Ordering::Relaxed);
			self.metrics.record_server_failure(&self.target, &Strng::from(self.server.target_uri.as_str()));
		}
		let node_id = self.node.id.clone();
		let rendered = err.with_node_id(&node_id);
		self.notify_all_ambient(rendered);
		err
	}

	fn notify_all_ambient(&self, err: ResourceError) {
		let state = self.state.lock();
		for authority in state.authorities.iter() {
			for type_url in self.all_type_urls() {
				authority.on_stream_failure(type_url, err.clone());
			}
		}
	}

	async fn handle_response(
		&self,
		response: DiscoveryResponse,
		req_tx: &mpsc::UnboundedSender<DiscoveryRequest>,
	) -> Result<(), Error> {
		if response.type_url.is_empty() {
			return Err(Error::MissingTypeUrl);
		}
		let type_url: &'static str = self
			.registry
			.lookup(&response.type_url)
			.map(|d| d.type_url)
			.ok_or_else(|| Error::UnknownResourceType(response.type_url.clone()))?;

		let descriptor = self.registry.lookup(type_url).expect("looked up above");
		let version = Strng::from(response.version_info.as_str());
		let nonce = Strng::from(response.nonce.as_str());

		debug!(
			server = %self.server.target_uri,
			type_url,
			version = %version,
			nonce = %nonce,
			count = response.resources.len(),
			"received ads response"
		);

		let gate = ResponseGate::new();
		let mut seen_names: Vec<Strng> = Vec::with_capacity(response.resources.len());
		let mut reject: Option<String> = None;

		for any in &response.resources {
			match (descriptor.decode)(&any.value) {
				Ok(decoded) => {
					let name = Strng::from(decoded.name.as_str());
					seen_names.push(name.clone());
					self.metrics.record_valid(&self.target, &Strng::from(self.server.target_uri.as_str()), type_url);
					let raw = Bytes::copy_from_slice(&any.value);
					let state = self.state.lock();
					for authority in state.authorities.iter() {
						authority.on_update_and_dispatch(
							type_url,
							&name,
							raw.clone(),
							decoded.value.clone(),
							version.clone(),
							nonce.clone(),
							|| gate.make_on_done(),
						);
					}
				}
				Err(e) => {
					self.metrics.record_invalid(&self.target, &Strng::from(self.server.target_uri.as_str()), type_url);
					let msg = reject.get_or_insert_with(String::new);
					if !msg.is_empty() {
						msg.push_str("; ");
					}
					msg.push_str(&e.to_string());
					let name = Strng::from(e.resource_name());
					let err = e.with_node_id(&self.node.id);
					let state = self.state.lock();
					for authority in state.authorities.iter() {
						authority.on_nack(type_url, &name, nonce.clone(), err.clone(), || gate.make_on_done());
					}
				}
			}
		}

		// Resource-does-not-exist detection for SotW types kicks in only
		// once a first response has been seen for this type on this stream
		// generation (the first response establishes the baseline; an empty
		// first response legitimately means "no resources exist yet" and
		// must not be treated as a mass deletion of not-yet-resolved watches
		// that simply haven't arrived).
		// An ACK echoes the just-received version; a NACK must echo the
		// *previously accepted* version (possibly empty, if nothing has
		// ever been accepted for this type on this stream), never the
		// version of the response being rejected.
		let (first_response_for_type, ack_version) = {
			let mut state = self.state.lock();
			let ts = state.type_state.entry(type_url).or_default();
			let was_first = !ts.seen_first_response;
			ts.seen_first_response = true;
			let ack_version = if reject.is_none() {
				ts.version = version.clone();
				version.clone()
			} else {
				ts.version.clone()
			};
			ts.nonce = nonce.clone();
			(was_first, ack_version)
		};

		if descriptor.all_required_in_sotw
			&& !first_response_for_type
			&& reject.is_none()
			&& !self.server.ignores_resource_deletion()
		{
			let subscribed: Vec<Strng> = {
				let state = self.state.lock();
				let mut all = Vec::new();
				for authority in state.authorities.iter() {
					all.extend(authority.subscribed_names(type_url));
				}
				all
			};
			let seen: std::collections::HashSet<&Strng> = seen_names.iter().collect();
			for name in subscribed.iter().filter(|n| !seen.contains(n)) {
				let state = self.state.lock();
				for authority in state.authorities.iter() {
					authority.on_not_exist(type_url, name);
				}
			}
		}

		// Flow control: the next Recv waits for every dispatched callback
		// from this response to finish.
		gate.closed().await;

		let error_detail = reject.map(|message| RpcStatus {
			code: tonic::Code::InvalidArgument as i32,
			message,
			details: Vec::new(),
		});
		req_tx
			.send(DiscoveryRequest {
				type_url: type_url.to_string(),
				version_info: ack_version.to_string(),
				response_nonce: nonce.to_string(),
				error_detail,
				..Default::default()
			})
			.map_err(|e| Error::RequestFailure(Box::new(e)))?;

		Ok(())
	}
}
