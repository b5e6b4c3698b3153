use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use router_core::prelude::*;

pub mod pool;
pub use pool::EndpointPool;

/// Either a backend speaks plain HTTP/1.1 over TCP, or it expects the router to open TLS. The
/// upstream is always HTTP/1.1 on the wire; this tag only records what the operator declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Http1,
	Http2,
}

impl Default for Protocol {
	fn default() -> Self {
		Protocol::Http1
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingAlgorithm {
	#[default]
	RoundRobin,
	LeastConnection,
}

/// A `{guid, index}` pair used to order concurrent register/unregister messages for the same
/// `(host, port)` without a central clock. Two tags with different `guid`s are incomparable in
/// the Lamport sense; callers treat that case as "always accept" since it means a fresh identity,
/// not a reordering of the same stream of updates.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModificationTag {
	pub guid: Strng,
	pub index: u64,
}

impl ModificationTag {
	pub fn new(guid: impl Into<Strng>, index: u64) -> Self {
		Self { guid: guid.into(), index }
	}

	/// `true` if `self` should replace a stored tag of `other`: strictly newer wins, a
	/// differing guid (a restarted publisher) always wins, ties and older losses do not.
	pub fn supersedes(&self, other: &ModificationTag) -> bool {
		match self.partial_cmp_same_guid(other) {
			Some(Ordering::Greater) => true,
			Some(_) => false,
			None => true,
		}
	}

	fn partial_cmp_same_guid(&self, other: &ModificationTag) -> Option<Ordering> {
		if self.guid != other.guid {
			return None;
		}
		Some(self.index.cmp(&other.index))
	}
}

/// Opaque key→value metadata attached to an endpoint. The well-known `component` tag classifies
/// traffic for per-component counters; `process_id` backs `lookup_with_process_instance`.
pub type Tags = BTreeMap<Strng, Strng>;

#[derive(Clone, Debug)]
pub struct Endpoint {
	pub host: Strng,
	pub port: u16,
	pub app_id: Strng,
	pub private_instance_id: Strng,
	pub private_instance_index: Option<u32>,
	pub tags: Tags,
	pub use_tls: bool,
	pub server_cert_domain_san: Option<Strng>,
	pub isolation_segment: Strng,
	pub protocol: Protocol,
	pub stale_threshold: Option<std::time::Duration>,
	pub modification_tag: ModificationTag,
	pub route_service_url: Option<Strng>,
	pub load_balancing_algorithm: Option<LoadBalancingAlgorithm>,
	pub updated_at: SystemTime,
}

impl Endpoint {
	/// The `(host, port)` pair backend connection pools key by, per the §5 pooling contract.
	pub fn canonical_addr(&self) -> (Strng, u16) {
		(self.host.clone(), self.port)
	}

	pub fn az(&self) -> Option<&str> {
		self.tags.get(&arcstr::literal!("az")).map(|s| s.as_str())
	}

	pub fn process_id(&self) -> Option<&str> {
		self.tags.get(&arcstr::literal!("process_id")).map(|s| s.as_str())
	}

	pub fn component(&self) -> Option<&str> {
		self.tags.get(&arcstr::literal!("component")).map(|s| s.as_str())
	}

	/// `use_tls` implies a SAN to verify against; construction sites are expected to uphold this
	/// (the bus subscriber rejects messages that would violate it before an `Endpoint` exists).
	pub fn is_well_formed(&self) -> bool {
		!self.use_tls || self.server_cert_domain_san.is_some()
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl PartialEq for Endpoint {
	fn eq(&self, other: &Self) -> bool {
		self.host == other.host && self.port == other.port
	}
}
impl Eq for Endpoint {}
