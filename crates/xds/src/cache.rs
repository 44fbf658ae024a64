//! Resource Watch State and Cache Entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use xds_core::strng::Strng;

use crate::decode::AnyResource;
use crate::error::ResourceError;
use crate::watcher::{AnyWatcher, WatcherId};

/// Per-(type, name) watch lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
	/// A watch was registered and a subscription request has been sent (or
	/// is pending send); no response has named this resource yet.
	Requested,
	/// At least one `Recv` on the current stream has started; still
	/// waiting for this resource specifically.
	Started,
	/// A response named this resource (successfully or not); it has a
	/// current `status` in `UpdateMetadata`.
	Received,
	/// The watch-expiry timer fired before the first accept.
	Timeout,
	/// Not present in the current subscription (no watcher, no longer
	/// referenced by an in-flight response).
	NotOnStream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
	Requested,
	Received,
	Nacked,
	NotFound,
	Timeout,
}

#[derive(Clone, Debug)]
pub struct UpdateMetadata {
	pub version: Strng,
	pub nonce: Strng,
	pub timestamp: Instant,
	pub status: UpdateStatus,
}

/// Per-authority, per-type, per-canonicalized-name cache entry.
///
/// Invariants: if `md.status == Received`, `decoded` is
/// `Some` and `error` is `None`; if `md.status == Nacked`, the previously
/// accepted `decoded`/`raw` are preserved and `error` reflects the NACK; the
/// entry only exists while it has a watcher or is named by the current
/// subscription/in-flight response (enforced by `Authority`, not by this
/// type).
pub struct CacheEntry {
	pub name: Strng,
	pub raw: Option<Bytes>,
	pub decoded: Option<AnyResource>,
	pub md: UpdateMetadata,
	pub error: Option<ResourceError>,
	pub watchers: IndexMap<WatcherId, Arc<dyn AnyWatcher>>,
	pub watch_state: WatchState,
	/// Set when the watch is first registered for a not-yet-present name;
	/// cleared on first accept. Compared against "now" by the authority's
	/// expiry sweep.
	pub expires_at: Option<Instant>,
}

impl CacheEntry {
	pub fn new_requested(name: Strng, expiry: Duration, now: Instant) -> Self {
		Self {
			name,
			raw: None,
			decoded: None,
			md: UpdateMetadata {
				version: Strng::default(),
				nonce: Strng::default(),
				timestamp: now,
				status: UpdateStatus::Requested,
			},
			error: None,
			watchers: IndexMap::new(),
			watch_state: WatchState::Requested,
			expires_at: Some(now + expiry),
		}
	}

	pub fn has_good_value(&self) -> bool {
		self.decoded.is_some()
	}
}
