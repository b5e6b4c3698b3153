use std::sync::Mutex;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use router_core::prelude::*;

/// Decouples the core from the concrete metrics backend: the registry, proxy handler and bus
/// subscriber emit typed events here rather than poking a Prometheus registry directly.
pub trait Reporter: Send + Sync {
	fn observe(&self, event: RouterEvent);
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
	RouteRegistered { host: Strng, path: String },
	EndpointRegistered { host: Strng, path: String },
	EndpointUnregistered { host: Strng, path: String },
	RouteUnregistered { host: Strng, path: String },
	RoutesPruned { count: u64 },
	BusConnected,
	BusDisconnected,
	RequestCompleted { status: u16, component: Option<Strng>, latency: std::time::Duration },
	WebsocketUpgrade { ok: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
enum StatusClass {
	C2xx,
	C3xx,
	C4xx,
	C5xx,
	Xxx,
}

impl From<u16> for StatusClass {
	fn from(status: u16) -> Self {
		match status / 100 {
			2 => StatusClass::C2xx,
			3 => StatusClass::C3xx,
			4 => StatusClass::C4xx,
			5 => StatusClass::C5xx,
			_ => StatusClass::Xxx,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct StatusLabels {
	status: StatusClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct ComponentLabels {
	component: String,
}

/// Default `Reporter`, backed by `prometheus_client`. Exposed by the control surface both as the
/// `/varz` JSON rollup spec.md names and, ambiently, as a Prometheus text-format scrape target.
pub struct PrometheusReporter {
	registry: Mutex<Registry>,
	routes_registered: Counter,
	endpoints_registered: Counter,
	endpoints_unregistered: Counter,
	routes_unregistered: Counter,
	routes_pruned: Counter,
	bus_connected: Gauge,
	requests_by_status: Family<StatusLabels, Counter>,
	requests_by_component: Family<ComponentLabels, Counter>,
	request_latency: Histogram,
	websocket_upgrades: Counter,
	websocket_failures: Counter,
}

impl PrometheusReporter {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let routes_registered = Counter::default();
		let endpoints_registered = Counter::default();
		let endpoints_unregistered = Counter::default();
		let routes_unregistered = Counter::default();
		let routes_pruned = Counter::default();
		let bus_connected = Gauge::default();
		let requests_by_status = Family::<StatusLabels, Counter>::default();
		let requests_by_component = Family::<ComponentLabels, Counter>::default();
		let request_latency = Histogram::new(exponential_buckets(0.001, 2.0, 16));
		let websocket_upgrades = Counter::default();
		let websocket_failures = Counter::default();

		registry.register("gorouter_routes_registered", "routes registered", routes_registered.clone());
		registry.register("gorouter_endpoints_registered", "endpoints registered", endpoints_registered.clone());
		registry.register("gorouter_endpoints_unregistered", "endpoints unregistered", endpoints_unregistered.clone());
		registry.register("gorouter_routes_unregistered", "routes unregistered", routes_unregistered.clone());
		registry.register("gorouter_routes_pruned", "routes pruned", routes_pruned.clone());
		registry.register("gorouter_bus_connected", "1 if the message bus is connected", bus_connected.clone());
		registry.register("gorouter_requests_by_status", "requests by status class", requests_by_status.clone());
		registry.register("gorouter_requests_by_component", "requests by component tag", requests_by_component.clone());
		registry.register("gorouter_request_duration_seconds", "request latency", request_latency.clone());
		registry.register("gorouter_websocket_upgrades", "successful websocket upgrades", websocket_upgrades.clone());
		registry.register("gorouter_websocket_failures", "failed websocket upgrades", websocket_failures.clone());

		Self {
			registry: Mutex::new(registry),
			routes_registered,
			endpoints_registered,
			endpoints_unregistered,
			routes_unregistered,
			routes_pruned,
			bus_connected,
			requests_by_status,
			requests_by_component,
			request_latency,
			websocket_upgrades,
			websocket_failures,
		}
	}

	/// Registers the tokio runtime collector (task counts, queue depth) under the same registry
	/// so `/varz`'s `metrics_text` carries scheduler health alongside routing counters.
	pub fn register_runtime_metrics(&self, handle: &tokio::runtime::Handle) {
		router_core::tokio_metrics::TokioCollector::register(&mut self.registry.lock().unwrap(), handle);
	}

	pub fn encode_text(&self) -> String {
		let mut buf = String::new();
		prometheus_client::encoding::text::encode(&mut buf, &self.registry.lock().unwrap()).unwrap_or_default();
		buf
	}
}

impl Default for PrometheusReporter {
	fn default() -> Self {
		Self::new()
	}
}

impl Reporter for PrometheusReporter {
	fn observe(&self, event: RouterEvent) {
		match event {
			RouterEvent::RouteRegistered { .. } => {
				self.routes_registered.inc();
			},
			RouterEvent::EndpointRegistered { .. } => {
				self.endpoints_registered.inc();
			},
			RouterEvent::EndpointUnregistered { .. } => {
				self.endpoints_unregistered.inc();
			},
			RouterEvent::RouteUnregistered { .. } => {
				self.routes_unregistered.inc();
			},
			RouterEvent::RoutesPruned { count } => {
				self.routes_pruned.inc_by(count);
				info!(count, "routes_pruned");
			},
			RouterEvent::BusConnected => {
				self.bus_connected.set(1);
			},
			RouterEvent::BusDisconnected => {
				self.bus_connected.set(0);
			},
			RouterEvent::RequestCompleted { status, component, latency } => {
				self
					.requests_by_status
					.get_or_create(&StatusLabels { status: status.into() })
					.inc();
				if let Some(component) = component {
					self
						.requests_by_component
						.get_or_create(&ComponentLabels { component: component.to_string() })
						.inc();
				}
				self.request_latency.observe(latency.as_secs_f64());
			},
			RouterEvent::WebsocketUpgrade { ok: true } => {
				self.websocket_upgrades.inc();
			},
			RouterEvent::WebsocketUpgrade { ok: false } => {
				self.websocket_failures.inc();
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_class_buckets_by_hundreds() {
		assert_eq!(StatusClass::from(204), StatusClass::C2xx);
		assert_eq!(StatusClass::from(301), StatusClass::C3xx);
		assert_eq!(StatusClass::from(404), StatusClass::C4xx);
		assert_eq!(StatusClass::from(503), StatusClass::C5xx);
	}

	#[test]
	fn route_registered_event_increments_counter_and_appears_in_encoded_text() {
		let reporter = PrometheusReporter::new();
		reporter.observe(RouterEvent::RouteRegistered { host: "api.example.com".into(), path: String::new() });
		let text = reporter.encode_text();
		assert!(text.contains("gorouter_routes_registered_total 1"));
	}

	#[test]
	fn request_completed_increments_status_and_component_families() {
		let reporter = PrometheusReporter::new();
		reporter.observe(RouterEvent::RequestCompleted { status: 200, component: Some("router".into()), latency: std::time::Duration::from_millis(5) });
		let text = reporter.encode_text();
		assert!(text.contains("gorouter_requests_by_status"));
		assert!(text.contains("gorouter_requests_by_component"));
	}

	#[test]
	fn bus_connected_gauge_toggles() {
		let reporter = PrometheusReporter::new();
		reporter.observe(RouterEvent::BusConnected);
		assert!(reporter.encode_text().contains("gorouter_bus_connected 1"));
		reporter.observe(RouterEvent::BusDisconnected);
		assert!(reporter.encode_text().contains("gorouter_bus_connected 0"));
	}

	#[test]
	fn websocket_upgrade_outcome_increments_the_matching_counter() {
		let reporter = PrometheusReporter::new();
		reporter.observe(RouterEvent::WebsocketUpgrade { ok: true });
		reporter.observe(RouterEvent::WebsocketUpgrade { ok: false });
		let text = reporter.encode_text();
		assert!(text.contains("gorouter_websocket_upgrades_total 1"));
		assert!(text.contains("gorouter_websocket_failures_total 1"));
	}
}
