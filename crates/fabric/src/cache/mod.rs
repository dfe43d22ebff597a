//! Pluggable key/value persistence for subscription state, rule-set ETags, and group selections
//! (§6 "Persisted cache layout"). The core only needs get/set/delete semantics; the trait lets
//! callers swap a file-backed store for an in-memory one in tests without touching call sites.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabric_core::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("serialize error: {0}")]
	Serialize(#[from] serde_json::Error),
}

/// State persisted for a remote provider or rule-set between process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedSubscription {
	pub last_updated_unix: i64,
	pub last_etag: Option<String>,
	pub content: Option<String>,
	pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedRuleSet {
	pub last_updated_unix: i64,
	pub last_etag: Option<String>,
	pub content: Option<Vec<u8>>,
	pub content_hash: Option<String>,
}

pub trait Store: Send + Sync {
	fn get_subscription(&self, tag: &str) -> Option<SavedSubscription>;
	fn put_subscription(&self, tag: &str, value: SavedSubscription);
	fn get_rule_set(&self, tag: &str) -> Option<SavedRuleSet>;
	fn put_rule_set(&self, tag: &str, value: SavedRuleSet);
	fn get_selected(&self, group_tag: &str) -> Option<Strng>;
	fn put_selected(&self, group_tag: &str, outbound_tag: Strng);
}

#[derive(Default)]
struct Inner {
	subscriptions: HashMap<String, SavedSubscription>,
	rule_sets: HashMap<String, SavedRuleSet>,
	selected: HashMap<String, Strng>,
}

/// In-memory store, optionally mirrored to a JSON file on every write so state survives restarts
/// without pulling in a real embedded database — the core only ever needs whole-file load/save.
pub struct MemoryStore {
	inner: RwLock<Inner>,
	path: Option<PathBuf>,
}

#[derive(Default, Serialize, Deserialize)]
struct OnDisk {
	subscriptions: HashMap<String, SavedSubscription>,
	rule_sets: HashMap<String, SavedRuleSet>,
	selected: HashMap<String, String>,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(MemoryStore {
			inner: RwLock::new(Inner::default()),
			path: None,
		})
	}

	pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, Error> {
		let path = path.as_ref().to_path_buf();
		let inner = match fs_err::read(&path) {
			Ok(bytes) => {
				let on_disk: OnDisk = serde_json::from_slice(&bytes)?;
				Inner {
					subscriptions: on_disk.subscriptions,
					rule_sets: on_disk.rule_sets,
					selected: on_disk
						.selected
						.into_iter()
						.map(|(k, v)| (k, strng::new(v)))
						.collect(),
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Inner::default(),
			Err(e) => return Err(Error::Io(e)),
		};
		Ok(Arc::new(MemoryStore {
			inner: RwLock::new(inner),
			path: Some(path),
		}))
	}

	fn persist(&self, inner: &Inner) {
		let Some(path) = &self.path else { return };
		let on_disk = OnDisk {
			subscriptions: inner.subscriptions.clone(),
			rule_sets: inner.rule_sets.clone(),
			selected: inner.selected.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
		};
		match serde_json::to_vec(&on_disk) {
			Ok(bytes) => {
				if let Err(e) = fs_err::write(path, bytes) {
					warn!(err = %e, path = %path.display(), "failed to persist cache store");
				}
			},
			Err(e) => warn!(err = %e, "failed to serialize cache store"),
		}
	}
}

impl Store for MemoryStore {
	fn get_subscription(&self, tag: &str) -> Option<SavedSubscription> {
		self.inner.read().subscriptions.get(tag).cloned()
	}

	fn put_subscription(&self, tag: &str, value: SavedSubscription) {
		let mut inner = self.inner.write();
		inner.subscriptions.insert(tag.to_string(), value);
		self.persist(&inner);
	}

	fn get_rule_set(&self, tag: &str) -> Option<SavedRuleSet> {
		self.inner.read().rule_sets.get(tag).cloned()
	}

	fn put_rule_set(&self, tag: &str, value: SavedRuleSet) {
		let mut inner = self.inner.write();
		inner.rule_sets.insert(tag.to_string(), value);
		self.persist(&inner);
	}

	fn get_selected(&self, group_tag: &str) -> Option<Strng> {
		self.inner.read().selected.get(group_tag).cloned()
	}

	fn put_selected(&self, group_tag: &str, outbound_tag: Strng) {
		let mut inner = self.inner.write();
		inner.selected.insert(group_tag.to_string(), outbound_tag);
		self.persist(&inner);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_selected() {
		let store = MemoryStore::new();
		store.put_selected("sel", strng::new("p/a"));
		assert_eq!(store.get_selected("sel").as_deref(), Some("p/a"));
	}

	#[test]
	fn persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("cache.json");
		{
			let store = MemoryStore::open(&path).unwrap();
			store.put_subscription(
				"p",
				SavedSubscription {
					last_updated_unix: 1,
					last_etag: Some("v1".into()),
					content: Some("outbounds: []".into()),
					content_hash: None,
				},
			);
		}
		let reopened = MemoryStore::open(&path).unwrap();
		let saved = reopened.get_subscription("p").unwrap();
		assert_eq!(saved.last_etag.as_deref(), Some("v1"));
	}
}
