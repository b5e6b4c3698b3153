// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use tokio::sync::mpsc;

/// The reason a shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
	/// SIGTERM/SIGINT or a double Ctrl+C: tear down immediately.
	Immediate,
	/// SIGUSR1: drain in-flight work before exiting.
	Drain,
}

pub struct Shutdown {
	shutdown_tx: mpsc::Sender<ShutdownKind>,
	shutdown_rx: mpsc::Receiver<ShutdownKind>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown { shutdown_tx, shutdown_rx }
	}

	/// Returns a trigger that can be used to request a shutdown explicitly (e.g. from a test).
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger { shutdown_tx: self.shutdown_tx.clone() }
	}

	/// Waits for a termination or drain signal, returning which kind was observed.
	pub async fn wait(mut self) -> ShutdownKind {
		imp::shutdown(&mut self.shutdown_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<ShutdownKind>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self, kind: ShutdownKind) {
		let _ = self.shutdown_tx.send(kind).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	use super::ShutdownKind;

	pub(super) async fn shutdown(receiver: &mut Receiver<ShutdownKind>) -> ShutdownKind {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {
				tokio::spawn(async move {
					watch_signal(SignalKind::interrupt(), "SIGINT").await;
					info!("double Ctrl+C, exiting immediately");
					process::exit(0);
				});
				ShutdownKind::Immediate
			}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => ShutdownKind::Immediate,
			_ = watch_signal(SignalKind::user_defined1(), "SIGUSR1") => ShutdownKind::Drain,
			kind = receiver.recv() => {
				info!("received explicit shutdown signal");
				kind.unwrap_or(ShutdownKind::Immediate)
			}
		}
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind).expect("failed to register signal handler").recv().await;
		info!("received signal {}", name);
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	use super::ShutdownKind;

	pub(super) async fn shutdown(receiver: &mut Receiver<ShutdownKind>) -> ShutdownKind {
		tokio::select! {
			_ = tokio::signal::windows::ctrl_c().expect("failed to register signal handler").recv() => {
				info!("received signal, starting shutdown");
				ShutdownKind::Immediate
			}
			kind = receiver.recv() => kind.unwrap_or(ShutdownKind::Immediate),
		}
	}
}
