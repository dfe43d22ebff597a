//! Rule-sets: named, refreshable bundles of headless rules (§4.6, §3 "RuleSet").
//!
//! Three backing kinds share one lifecycle shape: hold a read-write-locked `Vec<RuleItem>` built
//! from the declared [`RuleKind`] trees, refresh it on some trigger (file watch, HTTP poll,
//! never), and fan callbacks out after each swap so the router and interested groups notice.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fabric_core::prelude::*;
use notify::Watcher;
use notify_debouncer_full::{DebouncedEvent, new_debouncer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::cache::{SavedRuleSet, Store};
use crate::rule::{InboundContext, RuleKind};

/// Hex digest used for cache integrity checks (§4.2.3, §7 `IntegrityFailure`).
fn content_hash(bytes: &[u8]) -> String {
	format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("parse error: {0}")]
	Parse(String),
	#[error("integrity check failed for rule-set {0}")]
	Integrity(Strng),
	#[error("http error: {0}")]
	Http(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
	Source,
	Binary,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSetOptions {
	Inline {
		tag: Strng,
		rules: Vec<RuleKind>,
	},
	Local {
		tag: Strng,
		path: PathBuf,
		#[serde(default)]
		format: Option<Format>,
	},
	Remote {
		tag: Strng,
		url: url::Url,
		#[serde(default, with = "crate::serdes::serde_dur_option")]
		update_interval: Option<Duration>,
		#[serde(default)]
		download_detour: Option<Strng>,
	},
}

impl RuleSetOptions {
	pub fn tag(&self) -> &Strng {
		match self {
			RuleSetOptions::Inline { tag, .. } => tag,
			RuleSetOptions::Local { tag, .. } => tag,
			RuleSetOptions::Remote { tag, .. } => tag,
		}
	}
}

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

type Callback = Arc<dyn Fn(&Strng) + Send + Sync>;

struct Metadata {
	contains_process_rule: bool,
	contains_wifi_rule: bool,
	contains_ip_cidr_rule: bool,
}

fn derive_metadata(rules: &[RuleKind]) -> Metadata {
	fn walk(rule: &RuleKind, m: &mut Metadata) {
		let items: &[crate::rule::RuleItem] = match rule {
			RuleKind::Default { items } => items,
			RuleKind::Logical { rules, .. } => {
				for r in rules {
					walk(r, m);
				}
				return;
			},
		};
		for item in items {
			match item {
				crate::rule::RuleItem::IpCidr { .. } => m.contains_ip_cidr_rule = true,
				crate::rule::RuleItem::Opaque { kind } if kind.as_str() == "process_name" => {
					m.contains_process_rule = true
				},
				crate::rule::RuleItem::Opaque { kind } if kind.as_str() == "wifi_ssid" => m.contains_wifi_rule = true,
				_ => {},
			}
		}
	}
	let mut m = Metadata {
		contains_process_rule: false,
		contains_wifi_rule: false,
		contains_ip_cidr_rule: false,
	};
	for rule in rules {
		walk(rule, &mut m);
	}
	m
}

/// A refcounted, swappable bundle of headless rules (§4.6, §9 "refcounted rule-sets").
pub struct RuleSet {
	pub tag: Strng,
	rules: RwLock<Arc<Vec<RuleKind>>>,
	refs: AtomicI32,
	callbacks: RwLock<Vec<Callback>>,
}

impl RuleSet {
	fn new(tag: Strng, rules: Vec<RuleKind>) -> Self {
		RuleSet {
			tag,
			rules: RwLock::new(Arc::new(rules)),
			refs: AtomicI32::new(0),
			callbacks: RwLock::new(Vec::new()),
		}
	}

	pub fn matches(&self, ctx: &InboundContext) -> bool {
		self.rules.read().iter().any(|r| matches_rule(r, ctx))
	}

	pub fn inc_ref(&self) {
		self.refs.fetch_add(1, Ordering::SeqCst);
	}

	pub fn dec_ref(&self) {
		let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
		assert!(prev > 0, "rule-set {}: negative refs", self.tag);
	}

	/// Frees the rule slice when unreferenced; the subscription cache is retained so a later
	/// `inc_ref` can rebuild without a re-fetch (§9).
	pub fn cleanup(&self) {
		if self.refs.load(Ordering::SeqCst) == 0 {
			*self.rules.write() = Arc::new(Vec::new());
		}
	}

	pub fn register_callback(&self, cb: Callback) {
		self.callbacks.write().push(cb);
	}

	/// Snapshots the callback list (cheap `Arc` clones) under the read lock, then invokes
	/// outside it so a callback that calls back into the rule-set cannot deadlock
	/// (§9 "callback fan-out under locks").
	fn swap(&self, rules: Vec<RuleKind>) {
		*self.rules.write() = Arc::new(rules);
		let tag = self.tag.clone();
		let snapshot: Vec<Callback> = self.callbacks.read().clone();
		for cb in snapshot {
			cb(&tag);
		}
	}
}

fn matches_rule(rule: &RuleKind, ctx: &InboundContext) -> bool {
	match rule {
		RuleKind::Default { items } => items.iter().all(|i| i.matches(ctx)),
		RuleKind::Logical { mode, rules } => match mode {
			crate::rule::LogicalMode::And => rules.iter().all(|r| matches_rule(r, ctx)),
			crate::rule::LogicalMode::Or => rules.iter().any(|r| matches_rule(r, ctx)),
		},
	}
}

/// Builds and, for Local/Remote kinds, starts the background refresh task for a rule-set.
pub async fn build(
	opts: RuleSetOptions,
	store: Arc<dyn Store>,
	http: reqwest::Client,
) -> Result<Arc<RuleSet>, Error> {
	match opts {
		RuleSetOptions::Inline { tag, rules } => Ok(Arc::new(RuleSet::new(tag, rules))),
		RuleSetOptions::Local { tag, path, format } => build_local(tag, path, format).await,
		RuleSetOptions::Remote {
			tag,
			url,
			update_interval,
			download_detour,
		} => build_remote(tag, url, update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL), download_detour, store, http).await,
	}
}

const SRS_MAGIC: &[u8; 4] = b"SRS1";
const SRS_VERSION: u8 = 1;

/// Encodes the `.srs` binary form: a 4-byte magic, a 1-byte version, a little-endian length
/// prefix, then JSON-encoded rules (§6 "Rule-Set format" — "length-prefixed records"; the source
/// schema itself is reused as the record payload rather than a bespoke field-by-field layout).
fn encode_binary(rules: &[RuleKind]) -> Result<Vec<u8>, Error> {
	let json = serde_json::to_vec(rules).map_err(|e| Error::Parse(e.to_string()))?;
	let mut out = Vec::with_capacity(json.len() + 9);
	out.extend_from_slice(SRS_MAGIC);
	out.write_u8(SRS_VERSION)?;
	out.write_u32::<LittleEndian>(json.len() as u32)?;
	out.extend_from_slice(&json);
	Ok(out)
}

fn decode_binary(bytes: &[u8]) -> Result<Vec<RuleKind>, Error> {
	let mut cursor = std::io::Cursor::new(bytes);
	let mut magic = [0u8; 4];
	std::io::Read::read_exact(&mut cursor, &mut magic)?;
	if &magic != SRS_MAGIC {
		return Err(Error::Parse("not a rule-set binary (bad magic)".to_string()));
	}
	let version = cursor.read_u8()?;
	if version != SRS_VERSION {
		return Err(Error::Parse(format!("unsupported rule-set binary version {version}")));
	}
	let len = cursor.read_u32::<LittleEndian>()? as usize;
	let start = cursor.position() as usize;
	let json = bytes
		.get(start..start + len)
		.ok_or_else(|| Error::Parse("truncated rule-set binary".to_string()))?;
	serde_json::from_slice(json).map_err(|e| Error::Parse(e.to_string()))
}

fn resolve_format(path: &PathBuf, format: Option<Format>) -> Format {
	format.unwrap_or_else(|| match path.extension().and_then(|e| e.to_str()) {
		Some("srs") => Format::Binary,
		_ => Format::Source,
	})
}

async fn load_source(path: &PathBuf, format: Format) -> Result<Vec<RuleKind>, Error> {
	let bytes = fs_err::tokio::read(path).await?;
	match format {
		Format::Source => serde_json::from_slice(&bytes).map_err(|e| Error::Parse(e.to_string())),
		Format::Binary => decode_binary(&bytes),
	}
}

async fn build_local(tag: Strng, path: PathBuf, format: Option<Format>) -> Result<Arc<RuleSet>, Error> {
	let format = resolve_format(&path, format);
	let rules = load_source(&path, format).await.unwrap_or_else(|e| {
		warn!(err = %e, tag = %tag, "failed to load rule-set file, starting empty");
		Vec::new()
	});
	let set = Arc::new(RuleSet::new(tag.clone(), rules));

	let (tx, mut rx) = mpsc::channel::<()>(1);
	let mut debouncer = new_debouncer(Duration::from_millis(300), None, move |res: notify_debouncer_full::DebounceEventResult| {
		if let Ok(events) = res {
			if events.iter().any(|e: &DebouncedEvent| !e.paths.is_empty()) {
				let _ = tx.try_send(());
			}
		}
	})
	.map_err(|e| Error::Io(std::io::Error::other(e)))?;
	debouncer
		.watcher()
		.watch(&path, notify::RecursiveMode::NonRecursive)
		.map_err(|e| Error::Io(std::io::Error::other(e)))?;

	let watched = set.clone();
	let watch_path = path.clone();
	tokio::spawn(async move {
		let _debouncer = debouncer;
		while rx.recv().await.is_some() {
			match load_source(&watch_path, format).await {
				Ok(rules) => {
					info!(tag = %watched.tag, "rule-set file reloaded");
					watched.swap(rules);
				},
				Err(e) => warn!(err = %e, tag = %watched.tag, "rule-set reload failed, keeping previous rules"),
			}
		}
	});

	Ok(set)
}

async fn build_remote(
	tag: Strng,
	url: url::Url,
	update_interval: Duration,
	// Parsed and persisted for schema compatibility but not applied: dialing the fetch itself
	// through a named outbound is out of scope (§1, SPEC_FULL.md Non-goals), the same boundary
	// that keeps `Outbound` free of real proxy-protocol dial implementations.
	_download_detour: Option<Strng>,
	store: Arc<dyn Store>,
	http: reqwest::Client,
) -> Result<Arc<RuleSet>, Error> {
	let cached = store.get_rule_set(tag.as_str());
	let initial_rules = cached
		.as_ref()
		.and_then(|c| {
			let bytes = c.content.as_ref()?;
			// §4.2.3: validate against the stored hash before trusting a cached rule-set blob.
			// Entries written before hashing existed carry no hash and are accepted as-is.
			let valid = match &c.content_hash {
				Some(h) => *h == content_hash(bytes),
				None => true,
			};
			if !valid {
				warn!(err = %Error::Integrity(tag.clone()), "cached rule-set failed integrity check, discarding");
				return None;
			}
			serde_json::from_slice::<Vec<RuleKind>>(bytes).ok()
		})
		.unwrap_or_default();
	let set = Arc::new(RuleSet::new(tag.clone(), initial_rules));
	let last_etag = cached.and_then(|c| c.last_etag);

	let fetcher = set.clone();
	tokio::spawn(async move {
		let mut etag = last_etag;
		loop {
			match fetch_once(&http, &url, etag.as_deref()).await {
				Ok(Some((rules, new_etag))) => {
					info!(tag = %fetcher.tag, "rule-set refreshed from remote");
					fetcher.swap(rules.clone());
					let content = serde_json::to_vec(&rules).ok();
					let hash = content.as_deref().map(content_hash);
					store.put_rule_set(
						fetcher.tag.as_str(),
						SavedRuleSet {
							last_updated_unix: 0,
							last_etag: new_etag.clone(),
							content,
							content_hash: hash,
						},
					);
					etag = new_etag;
				},
				Ok(None) => debug!(tag = %fetcher.tag, "rule-set not modified"),
				Err(e) => warn!(err = %e, tag = %fetcher.tag, "rule-set refresh failed, keeping previous rules"),
			}
			tokio::time::sleep(update_interval).await;
		}
	});

	Ok(set)
}

async fn fetch_once(
	http: &reqwest::Client,
	url: &url::Url,
	etag: Option<&str>,
) -> Result<Option<(Vec<RuleKind>, Option<String>)>, Error> {
	let mut req = http.get(url.clone());
	if let Some(etag) = etag {
		req = req.header(http::header::IF_NONE_MATCH, etag);
	}
	let resp = req.send().await.map_err(|e| Error::Http(e.to_string()))?;
	if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
		return Ok(None);
	}
	if !resp.status().is_success() {
		return Err(Error::Http(format!("unexpected status {}", resp.status())));
	}
	let new_etag = resp
		.headers()
		.get(http::header::ETAG)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string());
	let body = resp.bytes().await.map_err(|e| Error::Http(e.to_string()))?;
	let rules: Vec<RuleKind> = serde_json::from_slice(&body).map_err(|e| Error::Parse(e.to_string()))?;
	Ok(Some((rules, new_etag)))
}

/// Registry of rule-sets (§4.6, §3 "Ownership summary" — the router holds references via
/// refcount rather than owning rule-sets outright).
#[derive(Default)]
pub struct Manager {
	sets: RwLock<std::collections::HashMap<Strng, Arc<RuleSet>>>,
}

impl Manager {
	pub fn new() -> Self {
		Manager::default()
	}

	pub fn insert(&self, set: Arc<RuleSet>) {
		self.sets.write().insert(set.tag.clone(), set);
	}

	pub fn get(&self, tag: &str) -> Option<Arc<RuleSet>> {
		self.sets.read().get(tag).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::MemoryStore;

	#[tokio::test]
	async fn local_rule_set_reloads_on_write() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ruleset.json");
		fs_err::write(&path, r#"[{"mode":"default","items":[{"type":"is_private"}]}]"#).unwrap();

		let set = build_local(strng::new("rs"), path.clone(), None).await.unwrap();
		let ctx = InboundContext {
			is_private: true,
			..Default::default()
		};
		assert!(set.matches(&ctx));

		fs_err::write(&path, "[]").unwrap();
		tokio::time::sleep(Duration::from_millis(800)).await;
		assert!(!set.matches(&ctx));
	}

	#[test]
	fn refcount_cleanup_drops_rules_only_at_zero() {
		let set = RuleSet::new(strng::new("rs"), vec![RuleKind::Default { items: vec![] }]);
		set.inc_ref();
		set.cleanup();
		assert_eq!(set.rules.read().len(), 1);
		set.dec_ref();
		set.cleanup();
		assert_eq!(set.rules.read().len(), 0);
	}

	#[test]
	fn binary_rule_set_round_trips() {
		let rules = vec![RuleKind::Default { items: vec![] }];
		let encoded = encode_binary(&rules).unwrap();
		let decoded = decode_binary(&encoded).unwrap();
		assert_eq!(decoded.len(), 1);
	}

	#[test]
	fn binary_rule_set_rejects_unknown_version() {
		let rules = vec![RuleKind::Default { items: vec![] }];
		let mut encoded = encode_binary(&rules).unwrap();
		encoded[4] = SRS_VERSION + 1;
		assert!(decode_binary(&encoded).is_err());
	}

	#[test]
	fn binary_rule_set_rejects_bad_magic() {
		assert!(decode_binary(b"NOPE").is_err());
	}

	#[test]
	fn format_is_inferred_from_srs_extension() {
		assert_eq!(resolve_format(&PathBuf::from("rules.srs"), None), Format::Binary);
		assert_eq!(resolve_format(&PathBuf::from("rules.json"), None), Format::Source);
		assert_eq!(
			resolve_format(&PathBuf::from("rules.json"), Some(Format::Binary)),
			Format::Binary
		);
	}

	#[tokio::test]
	async fn local_rule_set_loads_binary_format() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ruleset.srs");
		let rules = vec![RuleKind::Default {
			items: vec![crate::rule::RuleItem::IsPrivate],
		}];
		fs_err::write(&path, encode_binary(&rules).unwrap()).unwrap();

		let set = build_local(strng::new("rs"), path, None).await.unwrap();
		let ctx = InboundContext {
			is_private: true,
			..Default::default()
		};
		assert!(set.matches(&ctx));
	}

	#[tokio::test]
	async fn remote_rule_set_etag_304_keeps_rules() {
		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.respond_with(
				wiremock::ResponseTemplate::new(200)
					.insert_header("ETag", "\"v1\"")
					.set_body_string(r#"[{"mode":"default","items":[{"type":"is_private"}]}]"#),
			)
			.up_to_n_times(1)
			.mount(&server)
			.await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.respond_with(wiremock::ResponseTemplate::new(304))
			.mount(&server)
			.await;

		let url = url::Url::parse(&server.uri()).unwrap();
		let http = reqwest::Client::new();
		let r1 = fetch_once(&http, &url, None).await.unwrap();
		assert!(r1.is_some());
		let r2 = fetch_once(&http, &url, Some("\"v1\"")).await.unwrap();
		assert!(r2.is_none());
	}

	#[tokio::test]
	async fn remote_rule_set_discards_cache_on_hash_mismatch() {
		let store = MemoryStore::new();
		let rules = vec![RuleKind::Default {
			items: vec![crate::rule::RuleItem::IsPrivate],
		}];
		store.put_rule_set(
			"rs",
			SavedRuleSet {
				last_updated_unix: 0,
				last_etag: None,
				content: Some(serde_json::to_vec(&rules).unwrap()),
				content_hash: Some("not-the-real-hash".to_string()),
			},
		);

		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.respond_with(wiremock::ResponseTemplate::new(304))
			.mount(&server)
			.await;
		let url = url::Url::parse(&server.uri()).unwrap();

		let set = build_remote(strng::new("rs"), url, Duration::from_secs(3600), None, store, reqwest::Client::new())
			.await
			.unwrap();
		let ctx = InboundContext {
			is_private: true,
			..Default::default()
		};
		assert!(!set.matches(&ctx), "a rule-set cache with a mismatched hash must be discarded");
	}

	#[tokio::test]
	async fn remote_rule_set_trusts_cache_with_matching_hash() {
		let store = MemoryStore::new();
		let rules = vec![RuleKind::Default {
			items: vec![crate::rule::RuleItem::IsPrivate],
		}];
		let content = serde_json::to_vec(&rules).unwrap();
		store.put_rule_set(
			"rs",
			SavedRuleSet {
				last_updated_unix: 0,
				last_etag: None,
				content_hash: Some(content_hash(&content)),
				content: Some(content),
			},
		);

		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.respond_with(wiremock::ResponseTemplate::new(304))
			.mount(&server)
			.await;
		let url = url::Url::parse(&server.uri()).unwrap();

		let set = build_remote(strng::new("rs"), url, Duration::from_secs(3600), None, store, reqwest::Client::new())
			.await
			.unwrap();
		let ctx = InboundContext {
			is_private: true,
			..Default::default()
		};
		assert!(set.matches(&ctx));
	}
}
