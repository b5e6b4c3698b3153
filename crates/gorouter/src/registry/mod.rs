mod trie;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use router_core::prelude::*;

use crate::metrics::{Reporter, RouterEvent};
use crate::types::{Endpoint, EndpointPool, LoadBalancingAlgorithm, ModificationTag};
use trie::HostTrie;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteDumpEndpoint {
	pub address: String,
	pub protocol: crate::types::Protocol,
	pub tls: bool,
	pub ttl: u64,
	pub route_service_url: Option<Strng>,
	pub tags: std::collections::BTreeMap<Strng, Strng>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShardingMode {
	#[default]
	All,
	SharedAndSegments,
	Segments,
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
	pub default_load_balancing_algorithm: LoadBalancingAlgorithm,
	pub droplet_stale_threshold: Duration,
	pub prune_interval: Duration,
	pub empty_pool_response_code_503: bool,
	pub empty_pool_timeout: Duration,
	pub sharding_mode: ShardingMode,
	pub isolation_segments: Vec<Strng>,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			default_load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
			droplet_stale_threshold: Duration::from_secs(120),
			prune_interval: Duration::from_secs(30),
			empty_pool_response_code_503: false,
			empty_pool_timeout: Duration::from_secs(0),
			sharding_mode: ShardingMode::All,
			isolation_segments: Vec::new(),
		}
	}
}

struct Inner {
	hosts: HashMap<Strng, HostTrie>,
	time_of_last_update: SystemTime,
}

/// The dynamic routing table: a case-folded hostname -> path-trie map of endpoint pools.
/// Lookups take a shared read lock and never block on the pruner or subscriber, which take the
/// exclusive lock only while applying a batch of mutations (never while a reader walks the trie).
pub struct Registry {
	inner: RwLock<Inner>,
	cfg: RegistryConfig,
	reporter: Arc<dyn Reporter>,
	num_endpoints: AtomicU64,
	pruning_suspended: std::sync::atomic::AtomicBool,
}

fn case_fold_host(host: &str) -> Strng {
	host.to_ascii_lowercase().into()
}

/// Splits `host_and_path` (no scheme) into `(host, path)`, stripping any query string. Returns
/// `None` if the remaining path contains an unterminated percent-escape.
fn split_host_path(host_and_path: &str) -> Option<(Strng, String)> {
	let without_query = host_and_path.split(['?', '#']).next().unwrap_or("");
	let (host, path) = match without_query.split_once('/') {
		Some((h, p)) => (h, format!("/{p}")),
		None => (without_query, String::new()),
	};
	if has_unterminated_percent_escape(&path) {
		return None;
	}
	Some((case_fold_host(host), path))
}

fn has_unterminated_percent_escape(path: &str) -> bool {
	let bytes = path.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		if bytes[i] == b'%' {
			if i + 2 >= bytes.len() || !bytes[i + 1].is_ascii_hexdigit() || !bytes[i + 2].is_ascii_hexdigit() {
				return true;
			}
			i += 3;
		} else {
			i += 1;
		}
	}
	false
}

impl Registry {
	pub fn new(cfg: RegistryConfig, reporter: Arc<dyn Reporter>) -> Self {
		Self {
			inner: RwLock::new(Inner { hosts: HashMap::new(), time_of_last_update: SystemTime::now() }),
			cfg,
			reporter,
			num_endpoints: AtomicU64::new(0),
			pruning_suspended: std::sync::atomic::AtomicBool::new(false),
		}
	}

	fn accepts_segment(&self, isolation_segment: &str) -> bool {
		match self.cfg.sharding_mode {
			ShardingMode::All => true,
			ShardingMode::Segments => self.cfg.isolation_segments.iter().any(|s| s.as_str() == isolation_segment),
			ShardingMode::SharedAndSegments => {
				isolation_segment.is_empty() || self.cfg.isolation_segments.iter().any(|s| s.as_str() == isolation_segment)
			},
		}
	}

	/// Idempotent: creates the pool on first sight of `(host, path)`, replaces the stored
	/// endpoint only if `endpoint.modification_tag` supersedes what's there, and emits
	/// `route-registered`/`endpoint-registered` only on first creation.
	pub fn register(&self, host_and_path: &str, endpoint: Endpoint) {
		if !self.accepts_segment(&endpoint.isolation_segment) {
			return;
		}
		let Some((host, path)) = split_host_path(host_and_path) else {
			debug!(host_and_path, "register: unterminated percent-escape, dropping");
			return;
		};
		let mut inner = self.inner.write();
		let trie = inner.hosts.entry(host.clone()).or_default();
		let pool_slot = trie.pool_mut(&path);
		let pool_is_new = pool_slot.is_none();
		let pool = pool_slot.get_or_insert_with(|| EndpointPool::new(self.cfg.default_load_balancing_algorithm));
		let endpoint_is_new = pool.upsert(endpoint);
		inner.time_of_last_update = SystemTime::now();
		drop(inner);

		if pool_is_new {
			self.reporter.observe(RouterEvent::RouteRegistered { host: host.clone(), path: path.clone() });
		}
		if endpoint_is_new {
			self.num_endpoints.fetch_add(1, Ordering::Relaxed);
			self.reporter.observe(RouterEvent::EndpointRegistered { host, path });
		}
		debug!(host_and_path, "register");
	}

	/// Removes the endpoint if the stored tag is not strictly newer; schedules the pool for
	/// removal per the empty-pool policy once it becomes empty.
	pub fn unregister(&self, host_and_path: &str, host: &Strng, port: u16, tag: &ModificationTag) {
		let Some((canon_host, path)) = split_host_path(host_and_path) else {
			return;
		};
		let mut inner = self.inner.write();
		let Some(trie) = inner.hosts.get_mut(&canon_host) else {
			return;
		};
		let Some(pool) = trie.pool_mut(&path).as_mut() else {
			return;
		};
		let removed = pool.remove(host, port, tag);
		let became_empty = removed && pool.is_empty();
		if became_empty && !self.cfg.empty_pool_response_code_503 {
			trie.remove_if_empty(&path);
		}
		inner.time_of_last_update = SystemTime::now();
		drop(inner);

		if removed {
			self.num_endpoints.fetch_sub(1, Ordering::Relaxed);
			self.reporter.observe(RouterEvent::EndpointUnregistered { host: canon_host.clone(), path: path.clone() });
			if became_empty {
				self.reporter.observe(RouterEvent::RouteUnregistered { host: canon_host, path });
			}
		}
		debug!(host_and_path, "unregister");
	}

	fn lookup_trie<'a, F, R>(&'a self, host_and_path: &str, f: F) -> Option<R>
	where
		F: Fn(&trie::HostTrie, &str) -> Option<R>,
	{
		let (host, path) = split_host_path(host_and_path)?;
		let inner = self.inner.read();
		if let Some(t) = inner.hosts.get(&host)
			&& let Some(r) = f(t, &path)
		{
			return Some(r);
		}
		for candidate in trie::wildcard_candidates(&host) {
			let candidate: Strng = candidate.into();
			if let Some(t) = inner.hosts.get(&candidate)
				&& let Some(r) = f(t, &path)
			{
				return Some(r);
			}
		}
		None
	}

	/// Host/path lookup with wildcard fallback, most specific match wins.
	pub fn lookup<R>(&self, host_and_path: &str, pick: impl Fn(&EndpointPool) -> Option<R>) -> Option<R> {
		self.lookup_trie(host_and_path, |t, path| t.lookup_longest_prefix(path).and_then(&pick))
	}

	pub fn lookup_with_app_instance(&self, host_and_path: &str, app_id: &str, index: u32) -> Option<Arc<Endpoint>> {
		self.lookup(host_and_path, |p| p.find_by_app_instance(app_id, index).cloned())
	}

	pub fn lookup_with_process_instance(&self, host_and_path: &str, process_id: &str, index: Option<u32>) -> Vec<Arc<Endpoint>> {
		match index {
			Some(idx) => self
				.lookup(host_and_path, |p| p.find_by_process_instance(process_id, idx).cloned())
				.into_iter()
				.collect(),
			None => self.lookup(host_and_path, |p| Some(p.find_all_by_process_id(process_id))).unwrap_or_default(),
		}
	}

	pub fn num_uris(&self) -> usize {
		self.inner.read().hosts.values().map(|t| t.num_pools()).sum()
	}

	pub fn num_endpoints(&self) -> u64 {
		self.num_endpoints.load(Ordering::Relaxed)
	}

	pub fn time_of_last_update(&self) -> SystemTime {
		self.inner.read().time_of_last_update
	}

	pub fn ms_since_last_update(&self) -> u128 {
		SystemTime::now()
			.duration_since(self.time_of_last_update())
			.unwrap_or_default()
			.as_millis()
	}

	pub fn suspend_pruning(&self, suspended: bool) {
		self.pruning_suspended.store(suspended, Ordering::Relaxed);
	}

	pub fn is_pruning_suspended(&self) -> bool {
		self.pruning_suspended.load(Ordering::Relaxed)
	}

	/// One pruning pass: if suspended, refresh every endpoint so nothing looks stale the moment
	/// suspension lifts; otherwise drop endpoints whose staleness threshold has elapsed and
	/// delete pools that have been empty longer than the empty-pool timeout.
	pub fn prune_once(&self) {
		let now = SystemTime::now();
		let mut inner = self.inner.write();
		if self.is_pruning_suspended() {
			info!("prune-suspended");
			for trie in inner.hosts.values_mut() {
				for pool in trie.iter_pools_mut() {
					pool.refresh_all(now);
				}
			}
			return;
		}
		let mut pruned = 0usize;
		for trie in inner.hosts.values_mut() {
			for pool in trie.iter_pools_mut() {
				pruned += pool.prune_stale(now, self.cfg.droplet_stale_threshold);
			}
		}
		for trie in inner.hosts.values_mut() {
			let stale_empty = trie.empty_pool_paths(now, self.cfg.empty_pool_timeout, self.cfg.empty_pool_response_code_503);
			for node_path in stale_empty {
				trie.remove_if_empty(&node_path);
			}
		}
		inner.hosts.retain(|_, t| !t.is_empty());
		if pruned > 0 {
			self.num_endpoints.fetch_sub(pruned as u64, Ordering::Relaxed);
			self.reporter.observe(RouterEvent::RoutesPruned { count: pruned as u64 });
		}
	}

	/// Serializes the table for the `/routes` control-surface endpoint: a mapping from URI to
	/// an array of endpoint objects, per spec.md §4.5.
	pub fn dump_routes(&self) -> std::collections::BTreeMap<String, Vec<RouteDumpEndpoint>> {
		let inner = self.inner.read();
		let mut out = std::collections::BTreeMap::new();
		for (host, trie) in inner.hosts.iter() {
			for (path, pool) in trie.iter_pools_with_paths() {
				let uri = if path.is_empty() { host.to_string() } else { format!("{host}{path}") };
				let endpoints = pool
					.endpoints()
					.map(|e| RouteDumpEndpoint {
						address: e.to_string(),
						protocol: e.protocol,
						tls: e.use_tls,
						ttl: e.stale_threshold.unwrap_or(self.cfg.droplet_stale_threshold).as_secs(),
						route_service_url: e.route_service_url.clone(),
						tags: e.tags.clone(),
					})
					.collect();
				out.insert(uri, endpoints);
			}
		}
		out
	}

	pub async fn run_pruning_cycle(self: &Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<()>) {
		let mut ticker = tokio::time::interval(self.cfg.prune_interval);
		loop {
			tokio::select! {
				_ = ticker.tick() => self.prune_once(),
				_ = shutdown.changed() => return,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics::PrometheusReporter;
	use crate::types::{ModificationTag, Protocol};

	fn endpoint(host: &str, port: u16) -> Endpoint {
		Endpoint {
			host: host.into(),
			port,
			app_id: "app".into(),
			private_instance_id: format!("{host}-{port}").into(),
			private_instance_index: None,
			tags: Default::default(),
			use_tls: false,
			server_cert_domain_san: None,
			isolation_segment: "".into(),
			protocol: Protocol::Http1,
			stale_threshold: None,
			modification_tag: ModificationTag::new("g1", 1),
			route_service_url: None,
			load_balancing_algorithm: None,
			updated_at: SystemTime::now(),
		}
	}

	fn registry(cfg: RegistryConfig) -> Registry {
		Registry::new(cfg, Arc::new(PrometheusReporter::new()))
	}

	#[test]
	fn split_host_path_lowercases_host_and_strips_query() {
		let (host, path) = split_host_path("Api.Example.com/foo/bar?x=1").unwrap();
		assert_eq!(host, Strng::from("api.example.com"));
		assert_eq!(path, "/foo/bar");
	}

	#[test]
	fn split_host_path_bare_host_has_empty_path() {
		let (host, path) = split_host_path("api.example.com").unwrap();
		assert_eq!(host, Strng::from("api.example.com"));
		assert_eq!(path, "");
	}

	#[test]
	fn split_host_path_rejects_unterminated_percent_escape() {
		assert!(split_host_path("api.example.com/foo%2").is_none());
	}

	#[test]
	fn register_then_lookup_case_insensitive() {
		let reg = registry(RegistryConfig::default());
		reg.register("Api.Example.com", endpoint("10.0.0.1", 80));
		let found = reg.lookup("api.example.com", |p| p.endpoints().next().cloned());
		assert!(found.is_some());
	}

	#[test]
	fn lookup_falls_back_to_wildcard_host() {
		let reg = registry(RegistryConfig::default());
		reg.register("*.example.com", endpoint("10.0.0.1", 80));
		let found = reg.lookup("api.example.com", |p| p.endpoints().next().cloned());
		assert!(found.is_some());
	}

	#[test]
	fn exact_host_wins_over_wildcard() {
		let reg = registry(RegistryConfig::default());
		reg.register("*.example.com", endpoint("10.0.0.1", 80));
		reg.register("api.example.com", endpoint("10.0.0.2", 80));
		let found = reg.lookup("api.example.com", |p| p.endpoints().next().cloned()).unwrap();
		assert_eq!(found.host, Strng::from("10.0.0.2"));
	}

	#[test]
	fn unregister_is_idempotent_on_unknown_route() {
		let reg = registry(RegistryConfig::default());
		reg.unregister("api.example.com", &"10.0.0.1".into(), 80, &ModificationTag::new("g1", 1));
		assert_eq!(reg.num_endpoints(), 0);
	}

	#[test]
	fn unregister_removes_pool_by_default() {
		let reg = registry(RegistryConfig::default());
		reg.register("api.example.com", endpoint("10.0.0.1", 80));
		assert_eq!(reg.num_uris(), 1);
		reg.unregister("api.example.com", &"10.0.0.1".into(), 80, &ModificationTag::new("g1", 2));
		assert_eq!(reg.num_uris(), 0);
		assert_eq!(reg.num_endpoints(), 0);
	}

	#[test]
	fn empty_pool_response_code_503_keeps_pool_until_timeout_prune() {
		let cfg = RegistryConfig {
			empty_pool_response_code_503: true,
			empty_pool_timeout: Duration::from_secs(60),
			..RegistryConfig::default()
		};
		let reg = registry(cfg);
		reg.register("api.example.com", endpoint("10.0.0.1", 80));
		reg.unregister("api.example.com", &"10.0.0.1".into(), 80, &ModificationTag::new("g1", 2));
		assert_eq!(reg.num_uris(), 1, "pool should still be visible (503) immediately after going empty");
		let found = reg.lookup("api.example.com", |p| Some(p.is_empty()));
		assert_eq!(found, Some(true));
	}

	#[test]
	fn prune_once_drops_stale_endpoints() {
		let reg = registry(RegistryConfig { droplet_stale_threshold: Duration::from_secs(1), ..RegistryConfig::default() });
		let mut stale = endpoint("10.0.0.1", 80);
		stale.updated_at = SystemTime::now() - Duration::from_secs(10);
		reg.register("api.example.com", stale);
		reg.prune_once();
		assert_eq!(reg.num_endpoints(), 0);
	}

	#[test]
	fn prune_suspended_refreshes_instead_of_dropping() {
		let reg = registry(RegistryConfig { droplet_stale_threshold: Duration::from_secs(1), ..RegistryConfig::default() });
		let mut stale = endpoint("10.0.0.1", 80);
		stale.updated_at = SystemTime::now() - Duration::from_secs(10);
		reg.register("api.example.com", stale);
		reg.suspend_pruning(true);
		reg.prune_once();
		assert_eq!(reg.num_endpoints(), 1, "suspended pruning must not drop endpoints");
	}

	#[test]
	fn sharding_mode_segments_rejects_unmatched_segment() {
		let cfg = RegistryConfig { sharding_mode: ShardingMode::Segments, isolation_segments: vec!["prod".into()], ..RegistryConfig::default() };
		let reg = registry(cfg);
		let mut e = endpoint("10.0.0.1", 80);
		e.isolation_segment = "dev".into();
		reg.register("api.example.com", e);
		assert_eq!(reg.num_endpoints(), 0);
	}

	#[test]
	fn modification_tag_ordering_rejects_stale_register() {
		let reg = registry(RegistryConfig::default());
		let mut newer = endpoint("10.0.0.1", 80);
		newer.modification_tag = ModificationTag::new("g1", 5);
		reg.register("api.example.com", newer);
		let mut older = endpoint("10.0.0.1", 80);
		older.modification_tag = ModificationTag::new("g1", 1);
		reg.register("api.example.com", older);
		let found = reg.lookup("api.example.com", |p| p.endpoints().next().cloned()).unwrap();
		assert_eq!(found.modification_tag.index, 5);
	}
}
