// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Tracks whether the process has finished starting up.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Registers a startup dependency; readiness is blocked until the returned guard is dropped.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady { parent: self.to_owned(), name: name.to_string() }
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.pending().is_empty()
	}
}

pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		let dur = telemetry::APPLICATION_START_TIME.elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking server ready", self.name);
		} else {
			info!("task '{}' complete ({dur:?}), still awaiting {left} tasks", self.name);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_ready_has_no_pending_tasks() {
		let ready = Ready::new();
		assert!(ready.is_ready());
		assert!(ready.pending().is_empty());
	}

	#[test]
	fn registered_task_blocks_until_dropped() {
		let ready = Ready::new();
		let block = ready.register_task("startup");
		assert!(!ready.is_ready());
		assert!(ready.pending().contains("startup"));
		drop(block);
		assert!(ready.is_ready());
	}

	#[test]
	fn multiple_tasks_all_must_complete() {
		let ready = Ready::new();
		let a = ready.register_task("a");
		let b = ready.register_task("b");
		assert_eq!(ready.pending().len(), 2);
		drop(a);
		assert!(!ready.is_ready(), "b is still outstanding");
		drop(b);
		assert!(ready.is_ready());
	}

	#[test]
	fn subtask_registers_against_the_same_parent() {
		let ready = Ready::new();
		let parent = ready.register_task("parent");
		let child = parent.subtask("child");
		assert!(ready.pending().contains("parent"));
		assert!(ready.pending().contains("child"));
		drop(parent);
		assert!(!ready.is_ready(), "child still outstanding after parent completes");
		drop(child);
		assert!(ready.is_ready());
	}

	#[test]
	fn cloned_handle_observes_the_same_state() {
		let ready = Ready::new();
		let clone = ready.clone();
		let block = ready.register_task("shared");
		assert!(clone.pending().contains("shared"));
		drop(block);
		assert!(clone.is_ready());
	}
}
