use std::time::Duration;

pub use internal::{DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Watch as DrainWatcher};
use tracing::{Instrument, debug, info, warn};

/// Constructs a new drain pair.
/// * `DrainTrigger` starts a drain and waits for it to complete.
/// * `DrainWatcher` is held by anything that wants to participate in the drain. It can be
///   cloned; a drain will not complete until every outstanding `DrainWatcher` is dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Runs a future with graceful shutdown support.
///
/// `make_future` is handed a `DrainWatcher` it should hold while active (and watch, via
/// `wait_for_drain`, to learn when to start winding down) plus a `force_shutdown` receiver that
/// fires once the graceful deadline has elapsed, at which point in-flight work must terminate
/// immediately rather than waiting for a natural end.
pub async fn run_with_drain<F, O>(component: String, drain: DrainWatcher, deadline: Duration, make_future: F)
where
	F: AsyncFnOnce(DrainWatcher, tokio::sync::watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = tokio::sync::watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();

	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(component, "drain started, waiting {:?} for connections to complete", deadline);
			if tokio::time::timeout(deadline, sub_drain_signal.start_drain_and_wait(DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!(component, "drain duration expired with pending connections, forcing shutdown");
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);
		(Signal { drained_rx, signal_tx }, Watch { drained_tx, signal_rx })
	}

	enum Never {}

	/// Immediate tears down connections at once; Graceful lets in-flight requests finish first.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers and waits for them to release.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watches for a drain command.
	///
	/// All `Watch` instances must be dropped for `Signal::start_drain_and_wait` to complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the drain"]
	#[derive(Clone)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Watch {
		/// Resolves once a drain has been signaled, returning a handle to hold until the
		/// watcher has finished winding down its own work.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted is_some"))
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl Signal {
		pub fn count(&self) -> usize {
			self.signal_tx.receiver_count()
		}

		/// Signals all watchers to begin draining and waits for every handle to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn graceful_drain_waits_for_watchers() {
		let (trigger, watcher) = new();
		let done = Arc::new(AtomicUsize::new(0));

		for i in 1..=3u64 {
			let watcher = watcher.clone();
			let done = done.clone();
			tokio::spawn(async move {
				let release = watcher.wait_for_drain().await;
				tokio::time::sleep(Duration::from_millis(i * 5)).await;
				done.fetch_add(1, Ordering::SeqCst);
				drop(release);
			});
		}
		drop(watcher);

		assert_eq!(done.load(Ordering::SeqCst), 0);
		tokio::select! {
			_ = tokio::time::sleep(Duration::from_secs(1)) => panic!("timed out"),
			_ = trigger.start_drain_and_wait(DrainMode::Graceful) => {
				assert_eq!(done.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn immediate_drain_reports_mode() {
		let (trigger, watcher) = new();
		tokio::spawn(trigger.start_drain_and_wait(DrainMode::Immediate));
		let release = watcher.wait_for_drain().await;
		assert_eq!(release.mode(), DrainMode::Immediate);
	}
}
