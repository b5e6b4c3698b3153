use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use router_core::prelude::*;

use crate::types::EndpointPool;

/// A segment-addressed node in the host/path trie. Modelled as tagged variants over an arena of
/// nodes indexed by integer handle rather than `Rc`/`RefCell` parent-child links, so the registry
/// can walk and mutate the tree without fighting the borrow checker over cyclic ownership.
#[derive(Debug, Default)]
pub struct TrieNode {
	/// Pool registered for this exact node's path, if any.
	pub pool: Option<EndpointPool>,
	/// Children keyed by the next path segment (e.g. `/foo/bar` -> child "bar" under child "foo").
	pub children: HashMap<Strng, usize>,
}

/// One per normalized (case-folded) hostname: the root of that host's path trie, plus whether
/// the hostname itself was registered as a `*.`-prefixed wildcard.
#[derive(Debug)]
pub struct HostTrie {
	nodes: Vec<TrieNode>,
}

impl Default for HostTrie {
	fn default() -> Self {
		Self { nodes: vec![TrieNode::default()] }
	}
}

const ROOT: usize = 0;

impl HostTrie {
	fn split_path(path: &str) -> Vec<&str> {
		path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
	}

	/// Walks to the node for `path`, creating intermediate segments as needed.
	pub fn node_for_mut(&mut self, path: &str) -> usize {
		let mut cur = ROOT;
		for seg in Self::split_path(path) {
			let seg: Strng = seg.into();
			cur = match self.nodes[cur].children.get(&seg) {
				Some(&next) => next,
				None => {
					let next = self.nodes.len();
					self.nodes.push(TrieNode::default());
					self.nodes[cur].children.insert(seg, next);
					next
				},
			};
		}
		cur
	}

	pub fn pool_mut(&mut self, path: &str) -> &mut Option<EndpointPool> {
		let idx = self.node_for_mut(path);
		&mut self.nodes[idx].pool
	}

	/// Longest-prefix lookup along segment boundaries: walks as far down the trie as `path`
	/// allows, remembering the deepest node that actually carries a pool.
	pub fn lookup_longest_prefix(&self, path: &str) -> Option<&EndpointPool> {
		let mut cur = ROOT;
		let mut best: Option<&EndpointPool> = self.nodes[ROOT].pool.as_ref();
		for seg in Self::split_path(path) {
			let Some(&next) = self.nodes[cur].children.get(seg) else {
				break;
			};
			cur = next;
			if let Some(p) = self.nodes[cur].pool.as_ref() {
				best = Some(p);
			}
		}
		best
	}

	pub fn lookup_longest_prefix_mut(&mut self, path: &str) -> Option<&mut EndpointPool> {
		let mut cur = ROOT;
		let mut best = ROOT;
		for seg in Self::split_path(path) {
			let Some(&next) = self.nodes[cur].children.get(seg) else {
				break;
			};
			cur = next;
			if self.nodes[cur].pool.is_some() {
				best = cur;
			}
		}
		self.nodes[best].pool.as_mut()
	}

	/// Drops the pool at `path` if it exists and is empty. Leaves the node itself (it may still
	/// have children with their own pools).
	pub fn remove_if_empty(&mut self, path: &str) {
		let mut cur = ROOT;
		for seg in Self::split_path(path) {
			match self.nodes[cur].children.get(seg) {
				Some(&next) => cur = next,
				None => return,
			}
		}
		if self.nodes[cur].pool.as_ref().is_some_and(|p| p.is_empty()) {
			self.nodes[cur].pool = None;
		}
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.iter().all(|n| n.pool.is_none())
	}

	pub fn iter_pools(&self) -> impl Iterator<Item = &EndpointPool> {
		self.nodes.iter().filter_map(|n| n.pool.as_ref())
	}

	pub fn iter_pools_mut(&mut self) -> impl Iterator<Item = &mut EndpointPool> {
		self.nodes.iter_mut().filter_map(|n| n.pool.as_mut())
	}

	pub fn num_pools(&self) -> usize {
		self.nodes.iter().filter(|n| n.pool.is_some()).count()
	}

	/// Yields every `(path, pool)` pair in the trie, depth-first, for dumping the full table.
	pub fn iter_pools_with_paths(&self) -> Vec<(String, &EndpointPool)> {
		let mut out = Vec::new();
		self.collect_pools_with_paths(ROOT, String::new(), &mut out);
		out
	}

	fn collect_pools_with_paths<'a>(&'a self, node: usize, prefix: String, out: &mut Vec<(String, &'a EndpointPool)>) {
		if let Some(pool) = &self.nodes[node].pool {
			out.push((prefix.clone(), pool));
		}
		for (seg, &child) in &self.nodes[node].children {
			let child_prefix = format!("{prefix}/{seg}");
			self.collect_pools_with_paths(child, child_prefix, out);
		}
	}

	/// Paths of pools that have been empty longer than `timeout`. Only meaningful under the
	/// `empty_pool_response_code_503` policy — the default policy deletes an empty pool
	/// immediately at unregister time instead of waiting here.
	pub fn empty_pool_paths(&self, now: SystemTime, timeout: Duration, under_503_policy: bool) -> Vec<String> {
		let mut out = Vec::new();
		if under_503_policy {
			self.collect_empty_paths(ROOT, String::new(), now, timeout, &mut out);
		}
		out
	}

	fn collect_empty_paths(&self, node: usize, prefix: String, now: SystemTime, timeout: Duration, out: &mut Vec<String>) {
		if let Some(pool) = &self.nodes[node].pool
			&& pool.is_empty()
			&& let Some(since) = pool.empty_since
			&& now.duration_since(since).unwrap_or_default() >= timeout
		{
			out.push(prefix.clone());
		}
		for (seg, &child) in &self.nodes[node].children {
			let child_prefix = format!("{prefix}/{seg}");
			self.collect_empty_paths(child, child_prefix, now, timeout, out);
		}
	}
}

/// Computes the wildcard fallback chain for a host, most specific first:
/// `a.b.example` -> [`*.b.example`, `*.example`].
pub fn wildcard_candidates(host: &str) -> Vec<String> {
	let labels: Vec<&str> = host.split('.').collect();
	let mut out = Vec::new();
	for i in 1..labels.len() {
		out.push(format!("*.{}", labels[i..].join(".")));
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::LoadBalancingAlgorithm;

	fn pool() -> EndpointPool {
		EndpointPool::new(LoadBalancingAlgorithm::RoundRobin)
	}

	#[test]
	fn wildcard_candidates_most_specific_first() {
		assert_eq!(wildcard_candidates("a.b.example.com"), vec!["*.b.example.com", "*.example.com", "*.com"]);
	}

	#[test]
	fn wildcard_candidates_empty_for_single_label_host() {
		assert!(wildcard_candidates("localhost").is_empty());
	}

	#[test]
	fn longest_prefix_prefers_deeper_registered_path() {
		let mut trie = HostTrie::default();
		*trie.pool_mut("/") = Some(pool());
		*trie.pool_mut("/foo/bar") = Some(pool());
		assert!(trie.lookup_longest_prefix("/foo/bar/baz").is_some());
		assert!(trie.lookup_longest_prefix("/foo/other").is_some(), "falls back to the root pool");
	}

	#[test]
	fn lookup_longest_prefix_stops_at_first_unregistered_segment() {
		let mut trie = HostTrie::default();
		*trie.pool_mut("/foo") = Some(pool());
		assert!(trie.lookup_longest_prefix("/bar").is_none());
	}

	#[test]
	fn remove_if_empty_drops_only_empty_pools() {
		let mut trie = HostTrie::default();
		*trie.pool_mut("/foo") = Some(pool());
		trie.remove_if_empty("/foo");
		assert!(trie.pool_mut("/foo").is_none());
	}

	#[test]
	fn num_pools_counts_every_node_with_a_pool() {
		let mut trie = HostTrie::default();
		*trie.pool_mut("/") = Some(pool());
		*trie.pool_mut("/foo") = Some(pool());
		*trie.pool_mut("/foo/bar") = Some(pool());
		assert_eq!(trie.num_pools(), 3);
	}

	#[test]
	fn iter_pools_with_paths_includes_root() {
		let mut trie = HostTrie::default();
		*trie.pool_mut("/") = Some(pool());
		*trie.pool_mut("/foo") = Some(pool());
		let paths: Vec<String> = trie.iter_pools_with_paths().into_iter().map(|(p, _)| p).collect();
		assert!(paths.contains(&String::new()));
		assert!(paths.contains(&"/foo".to_string()));
	}
}
