use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use router_core::prelude::*;

use crate::types::{Endpoint, EndpointPool, LoadBalancingAlgorithm};

/// Per-backend in-flight request counts, consulted by the least-connection algorithm. Kept
/// outside `Endpoint` since endpoints are replaced wholesale on every register.
#[derive(Default)]
pub struct InFlightTracker {
	counts: Mutex<HashMap<(Strng, u16), std::sync::Arc<AtomicUsize>>>,
}

pub struct InFlightGuard {
	counter: std::sync::Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.counter.fetch_sub(1, Ordering::Relaxed);
	}
}

impl InFlightTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn begin(&self, endpoint: &Endpoint) -> InFlightGuard {
		let key = endpoint.canonical_addr();
		let counter = self.counts.lock().entry(key).or_insert_with(|| std::sync::Arc::new(AtomicUsize::new(0))).clone();
		counter.fetch_add(1, Ordering::Relaxed);
		InFlightGuard { counter }
	}

	fn count_of(&self, endpoint: &Endpoint) -> usize {
		self.counts.lock().get(&endpoint.canonical_addr()).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
	}
}

/// Selects the next endpoint to try, applying availability-zone preference before the pool's
/// configured algorithm, per spec.md §4.3: "if configured, prefer endpoints whose AZ matches the
/// gorouter's own AZ; if none match, fall back to any."
pub fn pick_endpoint(
	pool: &EndpointPool,
	failed: &[std::sync::Arc<Endpoint>],
	own_az: Option<&str>,
	az_preference: bool,
	in_flight: &InFlightTracker,
) -> Option<std::sync::Arc<Endpoint>> {
	if az_preference
		&& let Some(az) = own_az
	{
		let mut excluding_other_az: Vec<std::sync::Arc<Endpoint>> = failed.to_vec();
		excluding_other_az.extend(pool.endpoints().filter(|e| e.az() != Some(az)).cloned());
		if let Some(picked) = run_algorithm(pool, &excluding_other_az, in_flight) {
			return Some(picked);
		}
	}
	run_algorithm(pool, failed, in_flight)
}

fn run_algorithm(pool: &EndpointPool, failed: &[std::sync::Arc<Endpoint>], in_flight: &InFlightTracker) -> Option<std::sync::Arc<Endpoint>> {
	match pool.load_balancing_algorithm() {
		LoadBalancingAlgorithm::RoundRobin => pool.next_round_robin(failed),
		LoadBalancingAlgorithm::LeastConnection => pool.least_connection(failed, |e| in_flight.count_of(e)),
	}
}
