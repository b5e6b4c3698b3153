use std::time::Duration;

use router_core::prelude::*;
use serde::Deserialize;

use crate::registry::ShardingMode;
use crate::types::LoadBalancingAlgorithm;

fn default_port() -> u16 {
	8080
}
fn default_status_port() -> u16 {
	8081
}
fn default_prune_interval() -> Duration {
	Duration::from_secs(30)
}
fn default_stale_threshold() -> Duration {
	Duration::from_secs(120)
}
fn default_endpoint_timeout() -> Duration {
	Duration::from_secs(60)
}
fn default_endpoint_dial_timeout() -> Duration {
	Duration::from_secs(5)
}
fn default_max_conns() -> u32 {
	0 // 0 == unlimited
}
fn default_drain_timeout() -> Duration {
	Duration::from_secs(15)
}
fn default_drain_wait() -> Duration {
	Duration::from_secs(0)
}
fn default_healthcheck_user_agent() -> String {
	"HTTP-Monitor/1.1".to_string()
}
fn default_route_service_timeout() -> Duration {
	Duration::from_secs(60)
}

mod serde_dur_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsServer {
	pub host: String,
	pub port: u16,
	pub user: Option<String>,
	pub pass: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
	#[serde(default = "default_status_port")]
	pub port: u16,
	pub user: Option<String>,
	pub pass: Option<String>,
	pub routes_password: Option<String>,
}

impl Default for StatusConfig {
	fn default() -> Self {
		Self { port: default_status_port(), user: None, pass: None, routes_password: None }
	}
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackendsConfig {
	#[serde(default = "default_max_conns")]
	pub max_conns: u32,
	#[serde(default)]
	pub enable_tls: bool,
	pub ca_certs: Option<String>,
	pub tls_pem: Option<String>,
	#[serde(default)]
	pub skip_ssl_validation: bool,
	pub cipher_suite: Option<String>,
}

/// The typed, in-memory configuration surface the core requires to start. Loading it from disk
/// (file discovery, env overlay, secret files) is an external collaborator's job per spec.md §1;
/// this struct is the contract that collaborator hands the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	#[serde(default = "default_port")]
	pub port: u16,
	pub ssl_port: Option<u16>,
	#[serde(default)]
	pub status: StatusConfig,
	#[serde(default)]
	pub nats: Vec<NatsServer>,

	#[serde(default = "default_prune_interval", with = "serde_dur_secs")]
	pub prune_stale_droplets_interval: Duration,
	#[serde(default = "default_stale_threshold", with = "serde_dur_secs")]
	pub droplet_stale_threshold: Duration,
	#[serde(default)]
	pub suspend_pruning_if_nats_unavailable: bool,

	#[serde(default)]
	pub empty_pool_response_code_503: bool,
	#[serde(default, with = "serde_dur_secs")]
	pub empty_pool_timeout: Duration,

	#[serde(default, with = "serde_dur_secs")]
	pub start_response_delay_interval: Duration,
	#[serde(default = "default_drain_timeout", with = "serde_dur_secs")]
	pub drain_timeout: Duration,
	#[serde(default = "default_drain_wait", with = "serde_dur_secs")]
	pub drain_wait: Duration,

	#[serde(default = "default_endpoint_timeout", with = "serde_dur_secs")]
	pub endpoint_timeout: Duration,
	#[serde(default = "default_endpoint_dial_timeout", with = "serde_dur_secs")]
	pub endpoint_dial_timeout: Duration,
	#[serde(default)]
	pub backends: BackendsConfig,

	#[serde(default)]
	pub default_balancing_algorithm: LoadBalancingAlgorithm,

	#[serde(default)]
	pub force_forwarded_proto_https: bool,
	#[serde(default)]
	pub sanitize_forwarded_proto: bool,

	#[serde(default = "default_healthcheck_user_agent")]
	pub healthcheck_user_agent: String,

	pub trace_key: Option<String>,

	#[serde(default)]
	pub enable_proxy: bool,

	pub route_services_secret: Option<String>,
	pub route_services_secret_decrypt_only: Option<String>,
	#[serde(default = "default_route_service_timeout", with = "serde_dur_secs")]
	pub route_service_timeout: Duration,
	#[serde(default)]
	pub route_service_recommend_https: bool,

	#[serde(default)]
	pub routing_table_sharding_mode: ShardingMode,
	#[serde(default)]
	pub isolation_segments: Vec<Strng>,

	pub availability_zone: Option<Strng>,
	#[serde(default)]
	pub balancing_algorithm_az_preference: bool,

	#[serde(default)]
	pub logging: router_core::telemetry::Config,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			port: default_port(),
			ssl_port: None,
			status: StatusConfig::default(),
			nats: Vec::new(),
			prune_stale_droplets_interval: default_prune_interval(),
			droplet_stale_threshold: default_stale_threshold(),
			suspend_pruning_if_nats_unavailable: false,
			empty_pool_response_code_503: false,
			empty_pool_timeout: Duration::from_secs(0),
			start_response_delay_interval: Duration::from_secs(0),
			drain_timeout: default_drain_timeout(),
			drain_wait: default_drain_wait(),
			endpoint_timeout: default_endpoint_timeout(),
			endpoint_dial_timeout: default_endpoint_dial_timeout(),
			backends: BackendsConfig::default(),
			default_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
			force_forwarded_proto_https: false,
			sanitize_forwarded_proto: false,
			healthcheck_user_agent: default_healthcheck_user_agent(),
			trace_key: None,
			enable_proxy: false,
			route_services_secret: None,
			route_services_secret_decrypt_only: None,
			route_service_timeout: default_route_service_timeout(),
			route_service_recommend_https: false,
			routing_table_sharding_mode: ShardingMode::default(),
			isolation_segments: Vec::new(),
			availability_zone: None,
			balancing_algorithm_az_preference: false,
			logging: router_core::telemetry::Config::default(),
		}
	}
}

impl Config {
	pub fn from_yaml(raw: &str) -> anyhow::Result<Config> {
		Ok(serde_yaml::from_str(raw)?)
	}

	pub fn registry_config(&self) -> crate::registry::RegistryConfig {
		crate::registry::RegistryConfig {
			default_load_balancing_algorithm: self.default_balancing_algorithm,
			droplet_stale_threshold: self.droplet_stale_threshold,
			prune_interval: self.prune_stale_droplets_interval,
			empty_pool_response_code_503: self.empty_pool_response_code_503,
			empty_pool_timeout: self.empty_pool_timeout,
			sharding_mode: self.routing_table_sharding_mode,
			isolation_segments: self.isolation_segments.clone(),
		}
	}
}
