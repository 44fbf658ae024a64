//! Watcher contract (spec.md §3 "Watcher"). A watcher is notified through
//! three callbacks, each carrying an [`OnDone`] continuation that must be
//! invoked (or dropped) exactly once. The engine will not issue its next
//! `Recv` until every `OnDone` dispatched for a given response has fired —
//! see `ads.rs`.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::decode::AnyResource;
use crate::error::ResourceError;

/// A completion continuation. Dropping it is equivalent to calling it
/// explicitly — the flow-control gate in `ads.rs` only cares that it fires
/// exactly once per dispatched callback, which `Drop` guarantees even if a
/// watcher panics or forgets to call `done()`.
pub struct OnDone(Option<Box<dyn FnOnce() + Send>>);

impl OnDone {
	pub(crate) fn new(on_fire: impl FnOnce() + Send + 'static) -> Self {
		Self(Some(Box::new(on_fire)))
	}

	/// A no-op `OnDone` for callbacks dispatched outside of a live response
	/// cycle (e.g. the synchronous delivery of an already-cached value to a
	/// newly registered watcher).
	pub fn noop() -> Self {
		Self(None)
	}

	pub fn done(mut self) {
		if let Some(f) = self.0.take() {
			f();
		}
	}
}

impl Drop for OnDone {
	fn drop(&mut self) {
		if let Some(f) = self.0.take() {
			f();
		}
	}
}

/// Typed watcher capability for a resource of type `T`, per spec.md §3.
pub trait ResourceWatcher<T>: Send + Sync + 'static {
	/// Delivers a newly accepted value.
	fn on_changed(&self, data: Arc<T>, on_done: OnDone);
	/// Delivers a terminal-for-this-resource condition when no cached value
	/// exists yet (NACK before first accept, deletion, timeout, missing
	/// authority, channel creation failure).
	fn on_resource_error(&self, err: ResourceError, on_done: OnDone);
	/// Delivers a transient condition that does not invalidate a previously
	/// cached value (stream failure after a response was seen, NACK when a
	/// good cached value exists).
	fn on_ambient_error(&self, err: ResourceError, on_done: OnDone);
}

/// Type-erased form of [`ResourceWatcher`] so the cache can hold a
/// homogeneous collection of watchers per resource regardless of the
/// concrete decoded type. Mirrors the teacher's `HandlerWrapper` /
/// `RawHandler` split in `agent-xds::client`.
pub(crate) trait AnyWatcher: Send + Sync + 'static {
	fn on_changed(&self, data: AnyResource, on_done: OnDone);
	fn on_resource_error(&self, err: ResourceError, on_done: OnDone);
	fn on_ambient_error(&self, err: ResourceError, on_done: OnDone);
}

pub(crate) struct WatcherAdapter<T, W> {
	inner: W,
	_marker: PhantomData<fn() -> T>,
}

impl<T, W> WatcherAdapter<T, W> {
	pub fn new(inner: W) -> Self {
		Self {
			inner,
			_marker: PhantomData,
		}
	}
}

impl<T, W> AnyWatcher for WatcherAdapter<T, W>
where
	T: Send + Sync + 'static,
	W: ResourceWatcher<T>,
{
	fn on_changed(&self, data: AnyResource, on_done: OnDone) {
		match data.downcast::<T>() {
			Ok(typed) => self.inner.on_changed(typed, on_done),
			Err(_) => {
				// A registry/name mismatch would be a programming error in
				// this crate, not a watcher-caused condition; we still must
				// not panic the stream task, so surface it as a resource
				// error instead.
				self.inner.on_resource_error(
					ResourceError::new("internal error: decoded type mismatch"),
					on_done,
				);
			}
		}
	}

	fn on_resource_error(&self, err: ResourceError, on_done: OnDone) {
		self.inner.on_resource_error(err, on_done);
	}

	fn on_ambient_error(&self, err: ResourceError, on_done: OnDone) {
		self.inner.on_ambient_error(err, on_done);
	}
}

pub(crate) fn erase<T, W>(watcher: W) -> Arc<dyn AnyWatcher>
where
	T: Send + Sync + 'static,
	W: ResourceWatcher<T>,
{
	Arc::new(WatcherAdapter::<T, W>::new(watcher))
}

/// Opaque identity for a registered watcher, used as the cache's watcher-set
/// key so `cancel` can remove exactly one registration.
pub type WatcherId = u64;
