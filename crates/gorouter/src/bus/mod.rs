use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use router_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::metrics::{Reporter, RouterEvent};
use crate::registry::Registry;
use crate::types::{Endpoint, ModificationTag, Protocol};

const SUBJECT_REGISTER: &str = "router.register";
const SUBJECT_UNREGISTER: &str = "router.unregister";
const SUBJECT_START: &str = "router.start";
const SUBJECT_GREET: &str = "router.greet";

/// Wire schema for `router.register` / `router.unregister`, per spec.md §4.2. Unknown fields are
/// ignored by `serde`'s default (non-`deny_unknown_fields`) behavior; a missing `uris` list is a
/// drop, handled by `#[serde(default)]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterMessage {
	pub host: Strng,
	pub port: u16,
	pub tls_port: Option<u16>,
	#[serde(default)]
	pub uris: Vec<Strng>,
	#[serde(default)]
	pub tags: BTreeMap<Strng, Strng>,
	pub app: Option<Strng>,
	pub stale_threshold_in_seconds: Option<u64>,
	pub private_instance_id: Option<Strng>,
	pub private_instance_index: Option<u32>,
	pub isolation_segment: Option<Strng>,
	pub server_cert_domain_san: Option<Strng>,
	pub route_service_url: Option<Strng>,
	pub protocol: Option<Protocol>,
	pub endpoint_updated_at_ns: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMessage {
	pub id: Strng,
	pub hosts: Vec<Strng>,
	pub minimum_register_interval_in_seconds: u64,
	pub prune_threshold_in_seconds: u64,
}

#[derive(Clone)]
pub struct SubscriberConfig {
	pub router_id: Strng,
	pub backend_tls_enabled: bool,
	pub minimum_register_interval: Duration,
	pub prune_threshold: Duration,
	pub suspend_pruning_if_unavailable: bool,
}

/// Ingests `router.register`/`router.unregister` off the bus and applies them to the `Registry`;
/// announces `router.start` on connect and answers `router.greet` requests; toggles the
/// registry's pruning-suspended flag with the connection state when configured to do so.
pub struct Subscriber {
	client: async_nats::Client,
	registry: Arc<Registry>,
	reporter: Arc<dyn Reporter>,
	cfg: SubscriberConfig,
}

impl Subscriber {
	pub async fn connect(servers: &str, registry: Arc<Registry>, reporter: Arc<dyn Reporter>, cfg: SubscriberConfig) -> anyhow::Result<Self> {
		let client = async_nats::connect(servers).await?;
		reporter.observe(RouterEvent::BusConnected);
		if cfg.suspend_pruning_if_unavailable {
			registry.suspend_pruning(false);
		}
		Ok(Self { client, registry, reporter, cfg })
	}

	pub async fn announce_start(&self) -> anyhow::Result<()> {
		let msg = StartMessage {
			id: self.cfg.router_id.clone(),
			hosts: Vec::new(),
			minimum_register_interval_in_seconds: self.cfg.minimum_register_interval.as_secs(),
			prune_threshold_in_seconds: self.cfg.prune_threshold.as_secs(),
		};
		let payload = serde_json::to_vec(&msg)?;
		self.client.publish(SUBJECT_START, payload.into()).await?;
		Ok(())
	}

	/// Runs the subscription loops for register/unregister/greet until `shutdown` fires.
	pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<()>) -> anyhow::Result<()> {
		let mut register_sub = self.client.subscribe(SUBJECT_REGISTER).await?;
		let mut unregister_sub = self.client.subscribe(SUBJECT_UNREGISTER).await?;
		let mut greet_sub = self.client.subscribe(SUBJECT_GREET).await?;

		loop {
			tokio::select! {
				Some(msg) = register_sub.next() => self.handle_register(&msg.payload),
				Some(msg) = unregister_sub.next() => self.handle_unregister(&msg.payload),
				Some(msg) = greet_sub.next() => {
					if let Some(reply) = msg.reply {
						let payload = StartMessage {
							id: self.cfg.router_id.clone(),
							hosts: Vec::new(),
							minimum_register_interval_in_seconds: self.cfg.minimum_register_interval.as_secs(),
							prune_threshold_in_seconds: self.cfg.prune_threshold.as_secs(),
						};
						if let Ok(bytes) = serde_json::to_vec(&payload) {
							let _ = self.client.publish(reply, bytes.into()).await;
						}
					}
				}
				_ = shutdown.changed() => return Ok(()),
			}
		}
	}

	fn handle_register(&self, payload: &[u8]) {
		apply_register(&self.registry, &self.cfg, payload);
	}

	fn handle_unregister(&self, payload: &[u8]) {
		apply_unregister(&self.registry, &self.cfg, payload);
	}
}

fn apply_register(registry: &Registry, cfg: &SubscriberConfig, payload: &[u8]) {
	let Ok(msg) = serde_json::from_slice::<RegisterMessage>(payload) else {
		error!("malformed router.register payload");
		return;
	};
	if msg.uris.is_empty() {
		return;
	}
	let Some(endpoint) = resolve_endpoint(cfg, &msg) else {
		return;
	};
	for uri in &msg.uris {
		registry.register(uri, endpoint.clone());
	}
}

fn apply_unregister(registry: &Registry, cfg: &SubscriberConfig, payload: &[u8]) {
	let Ok(msg) = serde_json::from_slice::<RegisterMessage>(payload) else {
		error!("malformed router.unregister payload");
		return;
	};
	if msg.uris.is_empty() {
		return;
	}
	let (host, port) = resolve_addr(cfg, &msg);
	let tag = ModificationTag::new(msg.private_instance_id.clone().unwrap_or_default(), msg.endpoint_updated_at_ns.unwrap_or_else(now_ns));
	for uri in &msg.uris {
		registry.unregister(uri, &host, port, &tag);
	}
}

/// Interprets a register message's TLS fields per spec.md §4.2: if backend TLS is enabled
/// and `tls_port` is present, use it with `use_tls=true` and require `server_cert_domain_san`;
/// otherwise use `port` with `use_tls=false`, rejecting messages that carry only `tls_port`
/// while TLS is disabled.
fn resolve_endpoint(cfg: &SubscriberConfig, msg: &RegisterMessage) -> Option<Endpoint> {
	let (use_tls, port) = match (cfg.backend_tls_enabled, msg.tls_port) {
		(true, Some(tls_port)) => {
			if msg.server_cert_domain_san.is_none() {
				error!(host = %msg.host, "register with tls_port missing server_cert_domain_san, rejecting");
				return None;
			}
			(true, tls_port)
		},
		(false, Some(_)) if msg.port == 0 => {
			error!(host = %msg.host, "register carries only tls_port while backend TLS is disabled, rejecting");
			return None;
		},
		_ => (false, msg.port),
	};
	let resolved_ns = msg.endpoint_updated_at_ns.unwrap_or_else(now_ns);
	let updated_at = SystemTime::UNIX_EPOCH + Duration::from_nanos(resolved_ns);
	Some(Endpoint {
		host: msg.host.clone(),
		port,
		app_id: msg.app.clone().unwrap_or_default(),
		private_instance_id: msg.private_instance_id.clone().unwrap_or_default(),
		private_instance_index: msg.private_instance_index,
		tags: msg.tags.clone(),
		use_tls,
		server_cert_domain_san: msg.server_cert_domain_san.clone(),
		isolation_segment: msg.isolation_segment.clone().unwrap_or_default(),
		protocol: msg.protocol.unwrap_or(Protocol::Http1),
		stale_threshold: msg.stale_threshold_in_seconds.map(Duration::from_secs),
		modification_tag: ModificationTag::new(msg.private_instance_id.clone().unwrap_or_default(), resolved_ns),
		route_service_url: msg.route_service_url.clone(),
		load_balancing_algorithm: None,
		updated_at,
	})
}

fn resolve_addr(cfg: &SubscriberConfig, msg: &RegisterMessage) -> (Strng, u16) {
	match (cfg.backend_tls_enabled, msg.tls_port) {
		(true, Some(tls_port)) => (msg.host.clone(), tls_port),
		_ => (msg.host.clone(), msg.port),
	}
}

/// Fallback modification index for messages that omit `endpoint_updated_at_ns`: current wall-clock
/// nanoseconds, so a timestamp-less heartbeat still strictly supersedes the previous tag from the
/// same publisher instead of tying against a constant.
fn now_ns() -> u64 {
	SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::RegistryConfig;

	fn cfg(backend_tls_enabled: bool) -> SubscriberConfig {
		SubscriberConfig {
			router_id: "router-1".into(),
			backend_tls_enabled,
			minimum_register_interval: Duration::from_secs(20),
			prune_threshold: Duration::from_secs(120),
			suspend_pruning_if_unavailable: false,
		}
	}

	fn msg(json: &str) -> RegisterMessage {
		serde_json::from_str(json).unwrap()
	}

	#[test]
	fn register_message_deserializes_minimal_payload() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"uris":["app.example.com"]}"#);
		assert_eq!(m.host.as_str(), "10.0.0.1");
		assert_eq!(m.port, 6060);
		assert_eq!(m.uris.len(), 1);
		assert!(m.tags.is_empty());
	}

	#[test]
	fn register_message_ignores_unknown_fields() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"uris":[],"something_new":42}"#);
		assert_eq!(m.host.as_str(), "10.0.0.1");
	}

	#[test]
	fn resolve_endpoint_plaintext_when_tls_disabled() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"uris":["a"]}"#);
		let e = resolve_endpoint(&cfg(false), &m).unwrap();
		assert!(!e.use_tls);
		assert_eq!(e.port, 6060);
	}

	#[test]
	fn resolve_endpoint_uses_tls_port_when_enabled_and_san_present() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"tls_port":6061,"uris":["a"],"server_cert_domain_san":"backend.internal"}"#);
		let e = resolve_endpoint(&cfg(true), &m).unwrap();
		assert!(e.use_tls);
		assert_eq!(e.port, 6061);
		assert_eq!(e.server_cert_domain_san.as_deref(), Some("backend.internal"));
	}

	#[test]
	fn resolve_endpoint_rejects_tls_port_without_san() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"tls_port":6061,"uris":["a"]}"#);
		assert!(resolve_endpoint(&cfg(true), &m).is_none());
	}

	#[test]
	fn resolve_endpoint_rejects_tls_only_registration_when_backend_tls_disabled() {
		let m = msg(r#"{"host":"10.0.0.1","port":0,"tls_port":6061,"uris":["a"]}"#);
		assert!(resolve_endpoint(&cfg(false), &m).is_none());
	}

	#[test]
	fn resolve_addr_prefers_tls_port_when_enabled() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"tls_port":6061,"uris":["a"]}"#);
		assert_eq!(resolve_addr(&cfg(true), &m), (Strng::from("10.0.0.1"), 6061));
	}

	#[test]
	fn resolve_addr_falls_back_to_plain_port() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"uris":["a"]}"#);
		assert_eq!(resolve_addr(&cfg(false), &m), (Strng::from("10.0.0.1"), 6060));
	}

	#[test]
	fn resolve_endpoint_without_timestamp_still_advances_on_reregister() {
		let m = msg(r#"{"host":"10.0.0.1","port":6060,"uris":["a"],"private_instance_id":"pi-1"}"#);
		let first = resolve_endpoint(&cfg(false), &m).unwrap();
		std::thread::sleep(Duration::from_millis(1));
		let second = resolve_endpoint(&cfg(false), &m).unwrap();
		assert!(second.modification_tag.supersedes(&first.modification_tag));
		assert!(second.updated_at > first.updated_at);
	}

	#[test]
	fn handle_register_without_timestamp_refreshes_updated_at_on_heartbeat() {
		let registry = Registry::new(RegistryConfig::default(), Arc::new(crate::metrics::PrometheusReporter::new()));
		let subscriber_cfg = cfg(false);
		let payload = br#"{"host":"10.0.0.1","port":6060,"uris":["app.example.com"],"private_instance_id":"pi-1"}"#;
		apply_register(&registry, &subscriber_cfg, payload);
		let first_updated_at = registry.lookup("app.example.com", |p| p.find(&"10.0.0.1".into(), 6060).map(|e| e.updated_at)).unwrap();
		std::thread::sleep(Duration::from_millis(1));
		apply_register(&registry, &subscriber_cfg, payload);
		let second_updated_at = registry.lookup("app.example.com", |p| p.find(&"10.0.0.1".into(), 6060).map(|e| e.updated_at)).unwrap();
		assert!(second_updated_at > first_updated_at, "heartbeat re-register without a timestamp must still advance updated_at");
	}

	#[test]
	fn handle_unregister_without_timestamp_removes_endpoint_registered_without_one() {
		let registry = Registry::new(RegistryConfig::default(), Arc::new(crate::metrics::PrometheusReporter::new()));
		let subscriber_cfg = cfg(false);
		let payload = br#"{"host":"10.0.0.1","port":6060,"uris":["app.example.com"],"private_instance_id":"pi-1"}"#;
		apply_register(&registry, &subscriber_cfg, payload);
		assert_eq!(registry.num_endpoints(), 1);
		std::thread::sleep(Duration::from_millis(1));
		apply_unregister(&registry, &subscriber_cfg, payload);
		assert_eq!(registry.num_endpoints(), 0, "unregister without a timestamp must still remove the endpoint registered without one");
	}

	#[test]
	fn start_message_serializes_camel_case() {
		let s = StartMessage {
			id: "router-1".into(),
			hosts: vec!["10.0.0.1".into()],
			minimum_register_interval_in_seconds: 20,
			prune_threshold_in_seconds: 120,
		};
		let json = serde_json::to_string(&s).unwrap();
		assert!(json.contains("\"minimumRegisterIntervalInSeconds\":20"));
	}
}
