use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use router_core::prelude::*;

use crate::types::{Endpoint, LoadBalancingAlgorithm, Strng};

/// The set of endpoints serving one route, plus the pool-level policy. Endpoints are keyed by
/// canonical `host:port` so a re-register on the same address collapses into the existing slot
/// rather than duplicating it.
#[derive(Debug)]
pub struct EndpointPool {
	pub route_service_url: Option<Strng>,
	default_load_balancing_algorithm: LoadBalancingAlgorithm,
	endpoints: HashMap<(Strng, u16), Arc<Endpoint>>,
	round_robin_cursor: AtomicUsize,
	pub empty_since: Option<SystemTime>,
}

impl EndpointPool {
	pub fn new(default_load_balancing_algorithm: LoadBalancingAlgorithm) -> Self {
		Self {
			route_service_url: None,
			default_load_balancing_algorithm,
			endpoints: HashMap::new(),
			round_robin_cursor: AtomicUsize::new(0),
			empty_since: None,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.endpoints.is_empty()
	}

	pub fn len(&self) -> usize {
		self.endpoints.len()
	}

	pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
		self.endpoints.values()
	}

	/// The pool's effective algorithm is the most recently registered non-empty endpoint
	/// override, else the table default.
	pub fn load_balancing_algorithm(&self) -> LoadBalancingAlgorithm {
		self
			.endpoints
			.values()
			.filter_map(|e| e.load_balancing_algorithm)
			.last()
			.unwrap_or(self.default_load_balancing_algorithm)
	}

	/// Inserts or replaces an endpoint. Returns `true` if this is the first time this
	/// `host:port` has been seen (the registry uses this to decide whether to emit
	/// `endpoint-registered`).
	pub fn upsert(&mut self, endpoint: Endpoint) -> bool {
		let key = endpoint.canonical_addr();
		self.route_service_url = endpoint.route_service_url.clone();
		self.empty_since = None;
		match self.endpoints.get(&key) {
			Some(existing) if !endpoint.modification_tag.supersedes(&existing.modification_tag) => false,
			Some(_) => {
				self.endpoints.insert(key, Arc::new(endpoint));
				false
			},
			None => {
				self.endpoints.insert(key, Arc::new(endpoint));
				true
			},
		}
	}

	/// Removes an endpoint if the stored tag is not strictly newer than `tag`. Returns `true` if
	/// something was removed.
	pub fn remove(&mut self, host: &Strng, port: u16, tag: &crate::types::ModificationTag) -> bool {
		let key = (host.clone(), port);
		let should_remove = match self.endpoints.get(&key) {
			Some(existing) => !existing.modification_tag.supersedes(tag),
			None => false,
		};
		if should_remove {
			self.endpoints.remove(&key);
			if self.endpoints.is_empty() {
				self.empty_since = Some(SystemTime::now());
			}
		}
		should_remove
	}

	pub fn find(&self, host: &Strng, port: u16) -> Option<&Arc<Endpoint>> {
		self.endpoints.get(&(host.clone(), port))
	}

	pub fn find_by_private_instance_id(&self, id: &str) -> Option<&Arc<Endpoint>> {
		self.endpoints.values().find(|e| e.private_instance_id.as_str() == id)
	}

	pub fn find_by_app_instance(&self, app_id: &str, index: u32) -> Option<&Arc<Endpoint>> {
		self
			.endpoints
			.values()
			.find(|e| e.app_id.as_str() == app_id && e.private_instance_index == Some(index))
	}

	pub fn find_all_by_process_id(&self, process_id: &str) -> Vec<Arc<Endpoint>> {
		self
			.endpoints
			.values()
			.filter(|e| e.process_id() == Some(process_id))
			.cloned()
			.collect()
	}

	pub fn find_by_process_instance(&self, process_id: &str, index: u32) -> Option<&Arc<Endpoint>> {
		self
			.endpoints
			.values()
			.find(|e| e.process_id() == Some(process_id) && e.private_instance_index == Some(index))
	}

	/// Drops any endpoint whose staleness threshold has elapsed. Returns the number pruned.
	pub fn prune_stale(&mut self, now: SystemTime, default_threshold: std::time::Duration) -> usize {
		let before = self.endpoints.len();
		self.endpoints.retain(|_, e| {
			let threshold = e.stale_threshold.unwrap_or(default_threshold);
			now.duration_since(e.updated_at).unwrap_or_default() <= threshold
		});
		let pruned = before - self.endpoints.len();
		if pruned > 0 && self.endpoints.is_empty() {
			self.empty_since = Some(now);
		}
		pruned
	}

	/// Bumps every endpoint's `updated_at` to `now`, used while pruning is suspended so nothing
	/// appears stale the moment suspension lifts.
	pub fn refresh_all(&mut self, now: SystemTime) {
		for e in self.endpoints.values_mut() {
			let mut refreshed = (**e).clone();
			refreshed.updated_at = now;
			*e = Arc::new(refreshed);
		}
	}

	/// Advances the round-robin cursor, skipping any endpoint in `failed`. Returns `None` if
	/// every endpoint has failed or the pool is empty.
	pub fn next_round_robin(&self, failed: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
		let candidates: Vec<&Arc<Endpoint>> = self
			.endpoints
			.values()
			.filter(|e| !failed.iter().any(|f| Arc::ptr_eq(f, e)))
			.collect();
		if candidates.is_empty() {
			return None;
		}
		let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
		Some(candidates[idx].clone())
	}

	pub fn least_connection<F>(&self, failed: &[Arc<Endpoint>], in_flight: F) -> Option<Arc<Endpoint>>
	where
		F: Fn(&Endpoint) -> usize,
	{
		let candidates: Vec<&Arc<Endpoint>> = self
			.endpoints
			.values()
			.filter(|e| !failed.iter().any(|f| Arc::ptr_eq(f, e)))
			.collect();
		let min = candidates.iter().map(|e| in_flight(e)).min()?;
		let ties: Vec<&Arc<Endpoint>> = candidates.into_iter().filter(|e| in_flight(e) == min).collect();
		let idx = rand::random_range(0..ties.len());
		ties.get(idx).map(|e| (*e).clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{ModificationTag, Protocol};

	fn endpoint(host: &str, port: u16, guid: &str, index: u64) -> Endpoint {
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
			modification_tag: ModificationTag::new(guid, index),
			route_service_url: None,
			load_balancing_algorithm: None,
			updated_at: SystemTime::now(),
		}
	}

	#[test]
	fn upsert_reports_first_sight_only() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		assert!(pool.upsert(endpoint("10.0.0.1", 80, "g1", 1)));
		assert!(!pool.upsert(endpoint("10.0.0.1", 80, "g1", 2)));
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn upsert_rejects_stale_modification_tag() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		pool.upsert(endpoint("10.0.0.1", 80, "g1", 5));
		pool.upsert(endpoint("10.0.0.1", 80, "g1", 2));
		let stored = pool.find(&"10.0.0.1".into(), 80).unwrap();
		assert_eq!(stored.modification_tag.index, 5);
	}

	#[test]
	fn upsert_accepts_differing_guid_regardless_of_index() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		pool.upsert(endpoint("10.0.0.1", 80, "g1", 9));
		pool.upsert(endpoint("10.0.0.1", 80, "g2", 0));
		let stored = pool.find(&"10.0.0.1".into(), 80).unwrap();
		assert_eq!(stored.modification_tag.guid, Strng::from("g2"));
	}

	#[test]
	fn remove_respects_modification_tag_ordering() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		pool.upsert(endpoint("10.0.0.1", 80, "g1", 5));
		let stale_tag = ModificationTag::new("g1", 1);
		assert!(!pool.remove(&"10.0.0.1".into(), 80, &stale_tag));
		assert_eq!(pool.len(), 1);
		let newer_tag = ModificationTag::new("g1", 9);
		assert!(pool.remove(&"10.0.0.1".into(), 80, &newer_tag));
		assert!(pool.is_empty());
		assert!(pool.empty_since.is_some());
	}

	#[test]
	fn round_robin_distributes_within_tolerance() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		for i in 0..4u16 {
			pool.upsert(endpoint(&format!("10.0.0.{i}"), 80, "g1", i as u64));
		}
		let mut counts = HashMap::new();
		for _ in 0..400 {
			let picked = pool.next_round_robin(&[]).unwrap();
			*counts.entry(picked.host.clone()).or_insert(0u32) += 1;
		}
		assert_eq!(counts.len(), 4);
		for count in counts.values() {
			assert!((80..=120).contains(count), "count {count} outside 20% tolerance of 100");
		}
	}

	#[test]
	fn round_robin_skips_failed_endpoints() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		pool.upsert(endpoint("10.0.0.1", 80, "g1", 1));
		pool.upsert(endpoint("10.0.0.2", 80, "g1", 1));
		let failed = pool.find(&"10.0.0.1".into(), 80).unwrap().clone();
		for _ in 0..10 {
			let picked = pool.next_round_robin(std::slice::from_ref(&failed)).unwrap();
			assert_eq!(picked.host, Strng::from("10.0.0.2"));
		}
	}

	#[test]
	fn round_robin_empty_pool_returns_none() {
		let pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		assert!(pool.next_round_robin(&[]).is_none());
	}

	#[test]
	fn least_connection_picks_minimum_in_flight() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::LeastConnection);
		pool.upsert(endpoint("10.0.0.1", 80, "g1", 1));
		pool.upsert(endpoint("10.0.0.2", 80, "g1", 1));
		let picked = pool.least_connection(&[], |e| if e.host == Strng::from("10.0.0.1") { 5 } else { 0 }).unwrap();
		assert_eq!(picked.host, Strng::from("10.0.0.2"));
	}

	#[test]
	fn prune_stale_drops_only_expired_endpoints() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		let mut old = endpoint("10.0.0.1", 80, "g1", 1);
		old.updated_at = SystemTime::now() - std::time::Duration::from_secs(500);
		pool.upsert(old);
		pool.upsert(endpoint("10.0.0.2", 80, "g1", 1));
		let pruned = pool.prune_stale(SystemTime::now(), std::time::Duration::from_secs(120));
		assert_eq!(pruned, 1);
		assert_eq!(pool.len(), 1);
		assert!(pool.find(&"10.0.0.2".into(), 80).is_some());
	}

	#[test]
	fn effective_load_balancing_algorithm_prefers_endpoint_override() {
		let mut pool = EndpointPool::new(LoadBalancingAlgorithm::RoundRobin);
		let mut e = endpoint("10.0.0.1", 80, "g1", 1);
		e.load_balancing_algorithm = Some(LoadBalancingAlgorithm::LeastConnection);
		pool.upsert(e);
		assert_eq!(pool.load_balancing_algorithm(), LoadBalancingAlgorithm::LeastConnection);
	}
}
