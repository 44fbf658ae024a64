//! End-to-end ADS scenarios from spec.md §8, driven through [`FakeTransport`]
//! so no real network connection is needed.

mod support;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use indexmap::IndexMap;

use support::{invalid_listener_any, listener_any, FakeTransport};
use xds_client::bootstrap::{AuthorityConfig, BootstrapConfig, ChannelCreds, Node, ServerConfig};
use xds_client::decode::LISTENER_TYPE_URL;
use xds_client::watcher::OnDone;
use xds_client::{ResourceWatcher, XdsClient, XdsClientConfig};

fn server(uri: &str) -> ServerConfig {
	ServerConfig {
		target_uri: uri.to_string(),
		channel_creds: ChannelCreds::Insecure,
		server_features: Vec::new(),
	}
}

fn bootstrap(uri: &str) -> BootstrapConfig {
	BootstrapConfig {
		node: Node {
			id: "test-node".into(),
			cluster: "test-cluster".into(),
			locality: None,
			metadata: Default::default(),
			user_agent_name: "xds-client-test".into(),
		},
		servers: vec![server(uri)],
		authorities: IndexMap::new(),
	}
}

fn bootstrap_with_authority(uri: &str, authority_name: &str) -> BootstrapConfig {
	let mut b = bootstrap(uri);
	b.authorities.insert(
		authority_name.to_string(),
		AuthorityConfig {
			servers: vec![server(uri)],
		},
	);
	b
}

/// A watcher that records every callback it receives and, unless told to
/// hold, immediately fires `on_done`. Tests that need to assert flow-control
/// behavior construct it with `hold = true` and release callbacks by hand.
struct RecordingWatcher {
	changed: Arc<StdMutex<Vec<Arc<Listener>>>>,
	resource_errors: Arc<StdMutex<Vec<String>>>,
	ambient_errors: Arc<StdMutex<Vec<String>>>,
	held: Arc<StdMutex<Vec<OnDone>>>,
	hold: bool,
}

impl RecordingWatcher {
	fn new(hold: bool) -> Self {
		Self {
			changed: Arc::new(StdMutex::new(Vec::new())),
			resource_errors: Arc::new(StdMutex::new(Vec::new())),
			ambient_errors: Arc::new(StdMutex::new(Vec::new())),
			held: Arc::new(StdMutex::new(Vec::new())),
			hold,
		}
	}

	fn release_all(&self) {
		for on_done in self.held.lock().unwrap().drain(..) {
			on_done.done();
		}
	}
}

impl ResourceWatcher<Listener> for RecordingWatcher {
	fn on_changed(&self, data: Arc<Listener>, on_done: OnDone) {
		self.changed.lock().unwrap().push(data);
		if self.hold {
			self.held.lock().unwrap().push(on_done);
		} else {
			on_done.done();
		}
	}

	fn on_resource_error(&self, err: xds_client::ResourceError, on_done: OnDone) {
		self.resource_errors.lock().unwrap().push(err.to_string());
		on_done.done();
	}

	fn on_ambient_error(&self, err: xds_client::ResourceError, on_done: OnDone) {
		self.ambient_errors.lock().unwrap().push(err.to_string());
		on_done.done();
	}
}

fn listener_response(version: &str, nonce: &str, names: &[(&str, u32)]) -> DiscoveryResponse {
	DiscoveryResponse {
		version_info: version.to_string(),
		resources: names.iter().map(|(n, p)| listener_any(n, *p)).collect(),
		type_url: LISTENER_TYPE_URL.to_string(),
		nonce: nonce.to_string(),
		error_detail: None,
		..Default::default()
	}
}

/// Scenario 1: two watchers fan out from one response; the engine's next
/// `Recv` does not happen until both watchers' `on_done` fire.
#[tokio::test(flavor = "multi_thread")]
async fn single_resource_fan_out_with_flow_control() {
	support::init_tracing();
	let transport = FakeTransport::new();
	let transport_for_factory = transport.clone();
	let client = XdsClient::new_with_transport_factory(
		XdsClientConfig::new("t"),
		bootstrap("http://fake"),
		Arc::new(move |_server| transport_for_factory.clone() as Arc<dyn xds_client::transport::Transport>),
	);

	let w1 = Arc::new(RecordingWatcher::new(true));
	let w2 = Arc::new(RecordingWatcher::new(true));
	let _c1 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L", RecordingWatcherRef(w1.clone()));
	let _c2 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L", RecordingWatcherRef(w2.clone()));

	let conn = transport.next_ads_connection().await;
	conn.wait_for_request_count(1).await;

	conn.send_response(listener_response("1", "n1", &[("L", 1)]));

	// Give the engine time to dispatch to both watchers; it must not issue a
	// second request (an ACK) until both on_done fire.
	tokio::time::sleep(Duration::from_millis(80)).await;
	assert_eq!(w1.changed.lock().unwrap().len(), 1);
	assert_eq!(w2.changed.lock().unwrap().len(), 1);
	assert_eq!(conn.requests().len(), 1, "ack must not be sent before both watchers finish");

	w1.release_all();
	tokio::time::sleep(Duration::from_millis(30)).await;
	assert_eq!(conn.requests().len(), 1, "ack must not be sent until every watcher finishes");

	w2.release_all();
	conn.wait_for_request_count(2).await;
	let ack = &conn.requests()[1];
	assert_eq!(ack.version_info, "1");
	assert_eq!(ack.response_nonce, "n1");

	client.close();
}

/// Scenario 2: a NACK never overwrites a previously cached good value, and a
/// newly registered watcher sees the cached good value, not the rejected one.
#[tokio::test(flavor = "multi_thread")]
async fn nack_preserves_previous_value() {
	support::init_tracing();
	let transport = FakeTransport::new();
	let transport_for_factory = transport.clone();
	let client = XdsClient::new_with_transport_factory(
		XdsClientConfig::new("t"),
		bootstrap("http://fake"),
		Arc::new(move |_server| transport_for_factory.clone() as Arc<dyn xds_client::transport::Transport>),
	);

	let w1 = Arc::new(RecordingWatcher::new(false));
	let _c1 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L", RecordingWatcherRef(w1.clone()));

	let conn = transport.next_ads_connection().await;
	conn.wait_for_request_count(1).await;
	conn.send_response(listener_response("1", "n1", &[("L", 1)]));
	conn.wait_for_request_count(2).await; // ack for v1

	assert_eq!(w1.changed.lock().unwrap().len(), 1);

	// Now an invalid v2.
	let bad = DiscoveryResponse {
		version_info: "2".to_string(),
		resources: vec![invalid_listener_any("L")],
		type_url: LISTENER_TYPE_URL.to_string(),
		nonce: "n2".to_string(),
		error_detail: None,
		..Default::default()
	};
	conn.send_response(bad);
	conn.wait_for_request_count(3).await; // nack

	let nack = &conn.requests()[2];
	assert_eq!(nack.version_info, "1", "nack must echo the previously accepted version");
	assert!(nack.error_detail.is_some());

	assert_eq!(w1.changed.lock().unwrap().len(), 1, "no new ResourceChanged from the rejected update");
	assert_eq!(w1.ambient_errors.lock().unwrap().len(), 1, "existing good value -> ambient error");

	// A second watcher registering now must see the cached v1 value, not the
	// rejected v2.
	let w2 = Arc::new(RecordingWatcher::new(false));
	let _c2 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L", RecordingWatcherRef(w2.clone()));
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(w2.changed.lock().unwrap().len(), 1);
	assert_eq!(w2.changed.lock().unwrap()[0].name, "L");

	client.close();
}

/// Scenario 3: two watchers naming the same resource with differently
/// ordered `xdstp://` context parameters share one subscription and receive
/// the same update.
#[tokio::test(flavor = "multi_thread")]
async fn context_parameter_order_is_canonicalized() {
	support::init_tracing();
	let transport = FakeTransport::new();
	let transport_for_factory = transport.clone();
	let client = XdsClient::new_with_transport_factory(
		XdsClientConfig::new("t"),
		bootstrap_with_authority("http://fake", "auth"),
		Arc::new(move |_server| transport_for_factory.clone() as Arc<dyn xds_client::transport::Transport>),
	);

	let w1 = Arc::new(RecordingWatcher::new(false));
	let w2 = Arc::new(RecordingWatcher::new(false));
	let name1 = "xdstp://auth/envoy.config.listener.v3.Listener/L?a=1&b=2";
	let name2 = "xdstp://auth/envoy.config.listener.v3.Listener/L?b=2&a=1";
	let _c1 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, name1, RecordingWatcherRef(w1.clone()));
	let _c2 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, name2, RecordingWatcherRef(w2.clone()));

	let conn = transport.next_ads_connection().await;
	conn.wait_for_request_count(1).await;
	let initial = &conn.requests()[0];
	assert_eq!(
		initial.resource_names.len(),
		1,
		"both names must canonicalize to a single subscription entry"
	);

	let canonical_name = initial.resource_names[0].clone();
	conn.send_response(listener_response("1", "n1", &[(canonical_name.as_str(), 1)]));
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(w1.changed.lock().unwrap().len(), 1);
	assert_eq!(w2.changed.lock().unwrap().len(), 1);
	assert_eq!(w1.changed.lock().unwrap()[0].name, canonical_name);
	assert_eq!(w2.changed.lock().unwrap()[0].name, canonical_name);

	client.close();
}

/// Scenario 4: a resource accepted in one response but absent from a later
/// complete state-of-the-world response is reported does-not-exist.
#[tokio::test(flavor = "multi_thread")]
async fn resource_does_not_exist_after_deletion() {
	support::init_tracing();
	let transport = FakeTransport::new();
	let transport_for_factory = transport.clone();
	let client = XdsClient::new_with_transport_factory(
		XdsClientConfig::new("t"),
		bootstrap("http://fake"),
		Arc::new(move |_server| transport_for_factory.clone() as Arc<dyn xds_client::transport::Transport>),
	);

	let w1 = Arc::new(RecordingWatcher::new(false));
	let _c1 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L", RecordingWatcherRef(w1.clone()));

	let conn = transport.next_ads_connection().await;
	conn.wait_for_request_count(1).await;
	conn.send_response(listener_response("1", "n1", &[("L", 1)]));
	conn.wait_for_request_count(2).await;
	assert_eq!(w1.changed.lock().unwrap().len(), 1);

	// Next complete response omits "L" entirely.
	conn.send_response(listener_response("2", "n2", &[]));
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(
		w1.resource_errors.lock().unwrap().len(),
		1,
		"deletion must fire ResourceError, not AmbientError"
	);

	client.close();
}

/// Scenario 5: the first request on a fresh stream carries the node proto;
/// subsequent requests on the same stream omit it; after a stream restart the
/// first request again carries it.
#[tokio::test(flavor = "multi_thread")]
async fn node_proto_only_on_first_request_per_stream() {
	support::init_tracing();
	let transport = FakeTransport::new();
	let transport_for_factory = transport.clone();
	let fast_backoff = xds_client::backoff::BackoffConfig {
		base: Duration::from_millis(10),
		multiplier: 1.0,
		max: Duration::from_millis(10),
		jitter: 0.0,
	};
	let client = XdsClient::new_with_transport_factory(
		XdsClientConfig::new("t").with_backoff(fast_backoff),
		bootstrap("http://fake"),
		Arc::new(move |_server| transport_for_factory.clone() as Arc<dyn xds_client::transport::Transport>),
	);

	let w1 = Arc::new(RecordingWatcher::new(false));
	let _c1 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L", RecordingWatcherRef(w1.clone()));

	let conn = transport.next_ads_connection().await;
	conn.wait_for_request_count(1).await;
	assert!(conn.requests()[0].node.is_some(), "first request on a fresh stream carries node");

	conn.send_response(listener_response("1", "n1", &[("L", 1)]));
	conn.wait_for_request_count(2).await; // ack
	assert!(conn.requests()[1].node.is_none(), "ack omits node");

	let w2 = Arc::new(RecordingWatcher::new(false));
	let _c2 = client.watch_resource::<Listener, _>(LISTENER_TYPE_URL, "L2", RecordingWatcherRef(w2.clone()));
	conn.wait_for_request_count(3).await; // resubscribe with new name
	assert!(conn.requests()[2].node.is_none(), "same-stream resubscribe omits node");

	// Kill the stream; the engine must reconnect and resend the node proto.
	conn.fail(tonic::Status::unavailable("boom"));
	let conn2 = transport.next_ads_connection().await;
	conn2.wait_for_request_count(1).await;
	assert!(
		conn2.requests()[0].node.is_some(),
		"first request after stream restart carries node again"
	);

	client.close();
}

/// Scenario 6: two authorities sharing one `ServerConfig` share one channel;
/// the channel closes only once both authorities' watches are gone.
#[tokio::test(flavor = "multi_thread")]
async fn channel_sharing_and_close() {
	support::init_tracing();
	let transport = FakeTransport::new();
	let transport_for_factory = transport.clone();
	let mut bootstrap = bootstrap_with_authority("http://fake", "auth-a");
	bootstrap.authorities.insert(
		"auth-b".to_string(),
		AuthorityConfig {
			servers: vec![server("http://fake")],
		},
	);
	let client = XdsClient::new_with_transport_factory(
		XdsClientConfig::new("t"),
		bootstrap,
		Arc::new(move |_server| transport_for_factory.clone() as Arc<dyn xds_client::transport::Transport>),
	);

	let w1 = Arc::new(RecordingWatcher::new(false));
	let w2 = Arc::new(RecordingWatcher::new(false));
	let c1 = client.watch_resource::<Listener, _>(
		LISTENER_TYPE_URL,
		"xdstp://auth-a/envoy.config.listener.v3.Listener/L",
		RecordingWatcherRef(w1.clone()),
	);
	let c2 = client.watch_resource::<Listener, _>(
		LISTENER_TYPE_URL,
		"xdstp://auth-b/envoy.config.listener.v3.Listener/L",
		RecordingWatcherRef(w2.clone()),
	);

	// Both authorities resolve the same ServerConfig -> exactly one channel.
	let _conn = transport.next_ads_connection().await;
	tokio::time::sleep(Duration::from_millis(30)).await;

	c1.cancel();
	tokio::time::sleep(Duration::from_millis(30)).await;
	// The channel must still be reachable for authority b; dropping c2 next
	// must tear it down. We cannot directly introspect pool state from this
	// integration test without a second connection attempt, so we instead
	// assert that closing the client (which releases both authorities) does
	// not panic or hang, exercising the full teardown path.
	c2.cancel();
	client.close();
}

/// A thin `ResourceWatcher<Listener>` wrapper over `Arc<RecordingWatcher>` so
/// the same watcher can be registered from multiple call sites in a test
/// while the client's generic bound only requires `ResourceWatcher<T>` (not
/// `Arc<dyn ResourceWatcher<T>>`).
struct RecordingWatcherRef(Arc<RecordingWatcher>);

impl ResourceWatcher<Listener> for RecordingWatcherRef {
	fn on_changed(&self, data: Arc<Listener>, on_done: OnDone) {
		self.0.on_changed(data, on_done);
	}
	fn on_resource_error(&self, err: xds_client::ResourceError, on_done: OnDone) {
		self.0.on_resource_error(err, on_done);
	}
	fn on_ambient_error(&self, err: xds_client::ResourceError, on_done: OnDone) {
		self.0.on_ambient_error(err, on_done);
	}
}
