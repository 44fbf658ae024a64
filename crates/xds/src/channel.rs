//! xDS Channel: owns the transport to one management server plus its ADS
//! and (lazily started) LRS engines. Reference-counted by the pool; closing
//! tears down both engine tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use xds_core::strng::Strng;

use crate::ads::AdsEngine;
use crate::authority::Authority;
use crate::backoff::BackoffConfig;
use crate::bootstrap::{Node, ServerConfig};
use crate::lrs::{LoadStore, LrsEngine};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::transport::Transport;

/// One shared channel per distinct `ServerConfig`, owning the
/// ADS engine unconditionally and the LRS engine only while at least one
/// caller has started load reporting on it.
pub struct XdsChannel {
	server: ServerConfig,
	target: Strng,
	node: Node,
	transport: Arc<dyn Transport>,
	backoff: BackoffConfig,
	ads: Arc<AdsEngine>,
	ads_task: Mutex<Option<JoinHandle<()>>>,
	lrs: Mutex<Option<(Arc<LrsEngine>, JoinHandle<()>)>>,
	closed: AtomicBool,
}

impl XdsChannel {
	pub fn new(
		server: ServerConfig,
		target: Strng,
		node: Node,
		registry: Registry,
		metrics: Arc<Metrics>,
		backoff: BackoffConfig,
	) -> Arc<Self> {
		let transport: Arc<dyn Transport> =
			Arc::new(crate::transport::GrpcTransport::new(server.target_uri.clone()));
		Self::new_with_transport(server, target, node, registry, metrics, backoff, transport)
	}

	/// Test/host-injectable constructor: takes an explicit [`Transport`]
	/// instead of always dialing real gRPC.
	pub fn new_with_transport(
		server: ServerConfig,
		target: Strng,
		node: Node,
		registry: Registry,
		metrics: Arc<Metrics>,
		backoff: BackoffConfig,
		transport: Arc<dyn Transport>,
	) -> Arc<Self> {
		let ads = AdsEngine::new(
			server.clone(),
			target.clone(),
			node.clone(),
			transport.clone(),
			registry,
			metrics,
			backoff,
		);
		let ads_task = ads.clone().spawn();
		Arc::new(Self {
			server,
			target,
			node,
			transport,
			backoff,
			ads,
			ads_task: Mutex::new(Some(ads_task)),
			lrs: Mutex::new(None),
			closed: AtomicBool::new(false),
		})
	}

	pub fn add_authority(&self, authority: Arc<Authority>) {
		self.ads.add_authority(authority);
	}

	pub fn remove_authority(&self, authority: &Arc<Authority>) {
		self.ads.remove_authority(authority);
	}

	pub fn resubscribe(&self) {
		self.ads.resubscribe_now();
	}

	pub fn consecutive_stream_failures(&self) -> u32 {
		self.ads.consecutive_stream_failures()
	}

	/// Starts the LRS engine if not already running, idempotently, and
	/// returns its [`LoadStore`] handle. LRS shares this
	/// channel's transport/backoff machinery.
	pub fn start_lrs(&self) -> LoadStore {
		let mut lrs = self.lrs.lock();
		if let Some((engine, _)) = lrs.as_ref() {
			return engine.store();
		}
		let engine = LrsEngine::new(
			self.server.clone(),
			self.target.clone(),
			self.node.clone(),
			self.transport.clone(),
			self.backoff,
		);
		let task = engine.clone().spawn();
		let store = engine.store();
		*lrs = Some((engine, task));
		store
	}

	/// Stops the LRS engine, if running. Called by the pool once
	/// `lrs_ref_count` reaches zero while the channel itself stays open:
	/// canceling the last LRS user stops the stream, but the channel itself
	/// is closed only when the authority ref count also reaches zero.
	pub fn stop_lrs(&self) {
		if let Some((_, task)) = self.lrs.lock().take() {
			task.abort();
		}
	}

	/// Tears down both engine tasks. Idempotent.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(task) = self.ads_task.lock().take() {
			task.abort();
		}
		self.stop_lrs();
	}
}

impl Drop for XdsChannel {
	fn drop(&mut self) {
		self.close();
	}
}
