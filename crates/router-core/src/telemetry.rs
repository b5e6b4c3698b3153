// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::sync::OnceLock;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

static INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// An `EnvFilter` directive string, e.g. `"info,gorouter=debug"`. Falls back to `RUST_LOG`,
	/// then `info`, when unset.
	pub filter: Option<String>,
	#[serde(default)]
	pub format: LogFormat,
	/// Directory to additionally write rolling daily log files into. Stderr logging is always on;
	/// this adds a second, non-blocking file sink on top of it.
	pub directory: Option<String>,
}

struct ChronoLocal;

impl tracing_subscriber::fmt::time::FormatTime for ChronoLocal {
	fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
		write!(w, "{}", chrono::Utc::now().to_rfc3339())
	}
}

/// Keeps the `tracing-appender` worker thread alive for the process lifetime. Dropping it stops
/// the background flush, so `init` leaks it deliberately.
static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Initializes the global `tracing` subscriber. Safe to call more than once; only the first
/// call takes effect, matching the teacher's `OnceCell`-guarded setup. Also bridges the `log`
/// crate (used by some dependencies) into `tracing` so its records pass through the same filter
/// and formatting.
pub fn init(cfg: &Config) {
	INIT.get_or_init(|| {
		let _ = tracing_log::LogTracer::init();

		let filter = cfg
			.filter
			.clone()
			.map(EnvFilter::new)
			.unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

		let registry = tracing_subscriber::registry().with(filter);
		let file_layer = cfg.directory.as_deref().map(|dir| {
			let appender = tracing_appender::rolling::daily(dir, "gorouter.log");
			let (writer, guard) = tracing_appender::non_blocking(appender);
			let _ = FILE_GUARD.set(guard);
			tracing_subscriber::fmt::layer().json().with_target(true).with_writer(writer)
		});

		let layer: Box<dyn Layer<_> + Send + Sync> = match cfg.format {
			LogFormat::Text => {
				let layer = tracing_subscriber::fmt::layer()
					.with_target(true)
					.with_timer(ChronoLocal)
					.with_writer(std::io::stderr);
				Box::new(layer)
			},
			LogFormat::Json => {
				let layer = tracing_subscriber::fmt::layer()
					.json()
					.with_target(true)
					.with_timer(ChronoLocal)
					.with_writer(std::io::stderr);
				Box::new(layer)
			},
		};
		registry.with(layer).with(file_layer).init();
	});
}
