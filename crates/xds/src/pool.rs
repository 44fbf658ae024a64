//! Channel Pool (spec.md §4.5): a process-wide map from a canonical
//! `ServerConfig` key to a shared [`crate::channel::XdsChannel`], reference
//! counted by interested authorities and LRS users.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::XdsChannel;

struct Entry {
	channel: Arc<XdsChannel>,
	interested_authorities: usize,
	lrs_ref_count: usize,
}

#[derive(Default)]
pub struct ChannelPool {
	entries: Mutex<HashMap<String, Entry>>,
}

/// Releases one reference acquired from the pool. Idempotent: calling
/// `release()` (or dropping it) more than once only decrements once.
pub struct Release {
	pool: Arc<ChannelPool>,
	key: String,
	purpose: Purpose,
	fired: bool,
}

#[derive(Clone, Copy)]
enum Purpose {
	Authority,
	Lrs,
}

impl Release {
	pub fn release(mut self) {
		self.fire();
	}

	fn fire(&mut self) {
		if self.fired {
			return;
		}
		self.fired = true;
		self.pool.release(&self.key, self.purpose);
	}
}

impl Drop for Release {
	fn drop(&mut self) {
		self.fire();
	}
}

impl ChannelPool {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Acquires (creating via `make` if necessary) the channel keyed by
	/// `key`, marking this caller as an interested authority. Per spec.md
	/// §4.5, the pool lock is held only around the map mutation; `make` is
	/// only invoked while the lock is held and only for a genuinely new key,
	/// so there is no racing-construction case to reconcile and no risk of
	/// a slow connect blocking unrelated pool operations (channel
	/// construction itself is non-blocking — connecting happens lazily
	/// inside the channel's own background task).
	pub fn acquire_for_authority(
		self: &Arc<Self>,
		key: String,
		make: impl FnOnce() -> Arc<XdsChannel>,
	) -> (Arc<XdsChannel>, Release) {
		self.acquire(key, make, Purpose::Authority)
	}

	pub fn acquire_for_lrs(
		self: &Arc<Self>,
		key: String,
		make: impl FnOnce() -> Arc<XdsChannel>,
	) -> (Arc<XdsChannel>, Release) {
		self.acquire(key, make, Purpose::Lrs)
	}

	fn acquire(
		self: &Arc<Self>,
		key: String,
		make: impl FnOnce() -> Arc<XdsChannel>,
		purpose: Purpose,
	) -> (Arc<XdsChannel>, Release) {
		let mut entries = self.entries.lock();
		let entry = entries.entry(key.clone()).or_insert_with(|| {
			debug!(key = %key, "creating new xds channel");
			Entry {
				channel: make(),
				interested_authorities: 0,
				lrs_ref_count: 0,
			}
		});
		match purpose {
			Purpose::Authority => entry.interested_authorities += 1,
			Purpose::Lrs => entry.lrs_ref_count += 1,
		}
		let channel = entry.channel.clone();
		drop(entries);
		(
			channel,
			Release {
				pool: self.clone(),
				key,
				purpose,
				fired: false,
			},
		)
	}

	fn release(&self, key: &str, purpose: Purpose) {
		enum Outcome {
			None,
			StopLrs(Arc<XdsChannel>),
			Close(Arc<XdsChannel>),
		}
		let outcome = {
			let mut entries = self.entries.lock();
			let Some(entry) = entries.get_mut(key) else {
				return;
			};
			match purpose {
				Purpose::Authority => entry.interested_authorities = entry.interested_authorities.saturating_sub(1),
				Purpose::Lrs => entry.lrs_ref_count = entry.lrs_ref_count.saturating_sub(1),
			}
			if entry.interested_authorities == 0 && entry.lrs_ref_count == 0 {
				Outcome::Close(entries.remove(key).expect("just matched").channel)
			} else if matches!(purpose, Purpose::Lrs) && entry.lrs_ref_count == 0 {
				Outcome::StopLrs(entry.channel.clone())
			} else {
				Outcome::None
			}
		};
		// Channel mutation happens after the lock is dropped (spec.md §4.5:
		// "Locks are never held across channel close").
		match outcome {
			Outcome::Close(channel) => {
				debug!("closing xds channel, last reference released");
				channel.close();
			}
			Outcome::StopLrs(channel) => {
				debug!("stopping lrs, last lrs reference released");
				channel.stop_lrs();
			}
			Outcome::None => {}
		}
	}

	#[cfg(test)]
	pub(crate) fn channel_count(&self) -> usize {
		self.entries.lock().len()
	}
}
