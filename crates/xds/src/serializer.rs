//! Callback Serializer (spec.md §4.1, §5): a single-consumer FIFO queue
//! that runs every watcher-visible callback for the whole client, so
//! watcher code never observes concurrent invocation.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dedicated, ordered executor for watcher callbacks. Backed by an
/// unbounded channel: the flow-control discipline in `ads.rs` is what keeps
/// the number of in-flight callbacks bounded, not this queue.
pub struct Serializer {
	tx: mpsc::UnboundedSender<Job>,
	task: JoinHandle<()>,
}

impl Serializer {
	pub fn new() -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
		let task = tokio::spawn(async move {
			while let Some(job) = rx.recv().await {
				job();
			}
		});
		Self { tx, task }
	}

	/// Enqueues `job` to run after every previously enqueued job on this
	/// serializer. Silently drops the job if the serializer has already
	/// been closed (client shutdown raced with a dispatch).
	pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
		let _ = self.tx.send(Box::new(job));
	}

	/// Stops accepting new jobs and waits for the queue to drain, per
	/// spec.md §5 "Close() cancels the root context; every task observes
	/// cancellation at its next suspension point and exits."
	pub async fn close(self) {
		drop(self.tx);
		let _ = self.task.await;
	}
}

impl Default for Serializer {
	fn default() -> Self {
		Self::new()
	}
}
