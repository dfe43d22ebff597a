//! Outbound providers: dynamic collections of outbounds loaded from inline config, local files,
//! or remote subscriptions (§3 "Provider", §4.2, §4.3).

pub mod parser;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fabric_core::prelude::*;
use notify::Watcher;
use notify_debouncer_full::{DebouncedEvent, new_debouncer};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch};

use crate::cache::{SavedSubscription, Store};
use crate::healthcheck::{History, ProbeTarget, probe_batch};
use crate::outbound::{self, OutboundOptions};
use parser::SubInfo;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("config invalid: {0}")]
	ConfigInvalid(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("parse error: {0}")]
	Parse(#[from] parser::Error),
	#[error("http error: {0}")]
	Http(String),
	#[error("provider {0} is updating")]
	Updating(Strng),
	#[error("integrity check failed for cached subscription {0}")]
	Integrity(Strng),
}

/// Hex digest used for cache integrity checks (§4.2.3, §7 `IntegrityFailure`).
fn content_hash(bytes: &[u8]) -> String {
	format!("{:x}", Sha256::digest(bytes))
}

const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthCheckOptions {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub timeout: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderOptions {
	Inline {
		tag: Strng,
		outbounds: Vec<OutboundOptions>,
	},
	Local {
		tag: Strng,
		path: PathBuf,
		#[serde(default)]
		health_check: HealthCheckOptions,
	},
	Remote {
		tag: Strng,
		url: url::Url,
		#[serde(default)]
		user_agent: Option<String>,
		#[serde(default, with = "crate::serdes::serde_dur_option")]
		update_interval: Option<Duration>,
		#[serde(default)]
		download_detour: Option<Strng>,
		#[serde(default)]
		health_check: HealthCheckOptions,
	},
}

impl ProviderOptions {
	pub fn tag(&self) -> &Strng {
		match self {
			ProviderOptions::Inline { tag, .. } => tag,
			ProviderOptions::Local { tag, .. } => tag,
			ProviderOptions::Remote { tag, .. } => tag,
		}
	}
}

type Callback = Arc<dyn Fn(&Strng) + Send + Sync>;

/// A running provider instance (§3, §4.2). All three kinds share this shape; only the refresh
/// trigger differs, which is why `Inline`/`Local`/`Remote` are constructed by three different
/// `build_*` functions rather than three separate types.
pub struct Provider {
	pub tag: Strng,
	pub provider_type: &'static str,
	outbounds: RwLock<Vec<OutboundOptions>>,
	updated_at: RwLock<std::time::Instant>,
	sub_info: RwLock<Option<SubInfo>>,
	callbacks: RwLock<Vec<Callback>>,
	checking: Arc<AtomicBool>,
	health_check: HealthCheckOptions,
	probe_url: Strng,
	history: Arc<History>,
	manager: Arc<outbound::Manager>,
	/// Flips to `true` once this provider completes its first refresh; `Manager::wait_all_updated`
	/// (§4.3) waits on this so the startup path never builds groups against a half-populated
	/// outbound universe.
	ready: watch::Sender<bool>,
	/// One-shot waiters registered by `Manager::add_update_task` (§4.3), fired the next time
	/// `apply_outbounds` completes after registration.
	update_waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Provider {
	pub fn outbounds(&self) -> Vec<OutboundOptions> {
		self.outbounds.read().clone()
	}

	pub fn updated_at(&self) -> std::time::Instant {
		*self.updated_at.read()
	}

	pub fn sub_info(&self) -> Option<SubInfo> {
		*self.sub_info.read()
	}

	pub fn register_callback(&self, cb: Callback) {
		self.callbacks.write().push(cb);
	}

	/// Resolves once this provider has completed at least one refresh (now or in the future).
	pub async fn wait_updated(&self) {
		let mut rx = self.ready.subscribe();
		if *rx.borrow() {
			return;
		}
		let _ = rx.changed().await;
	}

	fn mark_ready(&self) {
		let _ = self.ready.send(true);
	}

	/// §4.2 "UpdateOutbounds": diff old vs new, create/remove via the outbound manager, swap the
	/// provider's own slice, then fan callbacks out after the swap (invariant (c)).
	fn apply_outbounds(&self, new_opts: Vec<OutboundOptions>) {
		let old_opts = self.outbounds.read().clone();
		let namespaced = |opt: &OutboundOptions| -> OutboundOptions {
			namespace(&self.tag, opt)
		};

		let new_namespaced: Vec<OutboundOptions> = new_opts.iter().map(namespaced).collect();
		let new_tags: std::collections::HashSet<&Strng> = new_opts.iter().map(|o| o.tag()).collect();

		let retired: Vec<Strng> = old_opts
			.iter()
			.filter(|o| !new_tags.contains(o.tag()))
			.map(|o| namespace(&self.tag, o).tag().clone())
			.collect();
		self.manager.remove(&retired);

		let old_by_tag: std::collections::HashMap<&Strng, &OutboundOptions> =
			old_opts.iter().map(|o| (o.tag(), o)).collect();
		let changed: Vec<OutboundOptions> = new_opts
			.iter()
			.zip(new_namespaced.iter())
			.filter(|(opt, _)| match old_by_tag.get(opt.tag()) {
				Some(old) => *old != *opt,
				None => true,
			})
			.map(|(_, namespaced)| namespaced.clone())
			.collect();
		self.manager.apply(&changed, &[]);

		*self.outbounds.write() = new_opts;
		*self.updated_at.write() = std::time::Instant::now();

		if self.health_check.enabled {
			self.spawn_health_check();
		}

		let tag = self.tag.clone();
		let snapshot: Vec<Callback> = self.callbacks.read().clone();
		for cb in snapshot {
			cb(&tag);
		}

		self.mark_ready();
		let waiters: Vec<oneshot::Sender<()>> = std::mem::take(&mut *self.update_waiters.lock());
		for tx in waiters {
			let _ = tx.send(());
		}
	}

	fn spawn_health_check(&self) {
		let targets: Vec<ProbeTarget> = self
			.outbounds
			.read()
			.iter()
			.map(|o| ProbeTarget {
				tag: namespace(&self.tag, o).tag().clone(),
			})
			.collect();
		let http = reqwest::Client::new();
		let url = self.probe_url.clone();
		let history = self.history.clone();
		let checking = self.checking.clone();
		let timeout = self.health_check.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);
		tokio::spawn(async move {
			probe_batch(http, url, timeout, targets, history, checking).await;
		});
	}
}

fn namespace(provider_tag: &Strng, opt: &OutboundOptions) -> OutboundOptions {
	let tag = strng::new(format!("{provider_tag}/{}", opt.tag()));
	match opt {
		OutboundOptions::Direct { .. } => OutboundOptions::Direct { tag },
		OutboundOptions::Compatible { .. } => OutboundOptions::Compatible { tag },
		OutboundOptions::Opaque { kind, .. } => OutboundOptions::Opaque { tag, kind: kind.clone() },
	}
}

pub async fn build_inline(
	tag: Strng,
	outbounds: Vec<OutboundOptions>,
	manager: Arc<outbound::Manager>,
	history: Arc<History>,
) -> Arc<Provider> {
	let provider = Arc::new(Provider {
		tag,
		provider_type: "inline",
		outbounds: RwLock::new(Vec::new()),
		updated_at: RwLock::new(std::time::Instant::now()),
		sub_info: RwLock::new(None),
		callbacks: RwLock::new(Vec::new()),
		checking: Arc::new(AtomicBool::new(false)),
		health_check: HealthCheckOptions::default(),
		probe_url: strng::literal(DEFAULT_PROBE_URL),
		history,
		manager,
		ready: watch::channel(false).0,
		update_waiters: Mutex::new(Vec::new()),
	});
	provider.apply_outbounds(outbounds);
	provider
}

pub async fn build_local(
	tag: Strng,
	path: PathBuf,
	health_check: HealthCheckOptions,
	manager: Arc<outbound::Manager>,
	history: Arc<History>,
) -> Result<Arc<Provider>, Error> {
	let provider = Arc::new(Provider {
		tag: tag.clone(),
		provider_type: "local",
		outbounds: RwLock::new(Vec::new()),
		updated_at: RwLock::new(std::time::Instant::now()),
		sub_info: RwLock::new(None),
		callbacks: RwLock::new(Vec::new()),
		checking: Arc::new(AtomicBool::new(false)),
		probe_url: strng::new(health_check.url.clone().unwrap_or_else(|| DEFAULT_PROBE_URL.to_string())),
		health_check,
		history,
		manager,
		ready: watch::channel(false).0,
		update_waiters: Mutex::new(Vec::new()),
	});

	load_local_file(&provider, &path).await;
	// A missing/unparseable file still counts as "attempted" so `wait_all_updated` doesn't hang
	// forever on a provider that will only ever update again via the file watcher below.
	provider.mark_ready();

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

	let watched = provider.clone();
	let watch_path = path.clone();
	tokio::spawn(async move {
		let _debouncer = debouncer;
		while rx.recv().await.is_some() {
			load_local_file(&watched, &watch_path).await;
		}
	});

	Ok(provider)
}

async fn load_local_file(provider: &Arc<Provider>, path: &PathBuf) {
	match fs_err::tokio::read_to_string(path).await {
		Ok(content) => match parser::parse_subscription(&content) {
			Ok(outbounds) => {
				info!(tag = %provider.tag, count = outbounds.len(), "provider file loaded");
				provider.apply_outbounds(outbounds);
			},
			Err(e) => warn!(tag = %provider.tag, err = %e, "provider file parse failed, keeping previous outbounds"),
		},
		Err(e) => warn!(tag = %provider.tag, err = %e, "provider file read failed, keeping previous outbounds"),
	}
}

pub async fn build_remote(
	tag: Strng,
	url: url::Url,
	user_agent: Option<String>,
	update_interval: Duration,
	health_check: HealthCheckOptions,
	manager: Arc<outbound::Manager>,
	store: Arc<dyn Store>,
	http: reqwest::Client,
	history: Arc<History>,
) -> Arc<Provider> {
	let update_interval = update_interval.max(MIN_UPDATE_INTERVAL);
	let provider = Arc::new(Provider {
		tag: tag.clone(),
		provider_type: "remote",
		outbounds: RwLock::new(Vec::new()),
		updated_at: RwLock::new(std::time::Instant::now()),
		sub_info: RwLock::new(None),
		callbacks: RwLock::new(Vec::new()),
		checking: Arc::new(AtomicBool::new(false)),
		probe_url: strng::new(health_check.url.clone().unwrap_or_else(|| DEFAULT_PROBE_URL.to_string())),
		health_check,
		history,
		manager,
		ready: watch::channel(false).0,
		update_waiters: Mutex::new(Vec::new()),
	});

	if let Some(cached) = store.get_subscription(tag.as_str()) {
		if let Some(content) = &cached.content {
			// §4.2.3: validate the cached payload against its stored hash before trusting it.
			// Caches written before hashing existed carry no hash and are accepted as-is.
			let valid = match &cached.content_hash {
				Some(h) => *h == content_hash(content.as_bytes()),
				None => true,
			};
			if valid {
				if let Ok(outbounds) = parser::parse_subscription(content) {
					provider.apply_outbounds(outbounds);
				}
			} else {
				warn!(err = %Error::Integrity(tag.clone()), "cached subscription failed integrity check, discarding");
			}
		}
	}
	let last_etag = store.get_subscription(tag.as_str()).and_then(|c| c.last_etag);

	let fetching = Arc::new(AtomicBool::new(false));
	let loop_provider = provider.clone();
	tokio::spawn(async move {
		let mut etag = last_etag;
		loop {
			match fetch_once(&http, &url, etag.as_deref(), user_agent.as_deref(), &fetching).await {
				Ok(Some((outbounds, sub_info, new_etag, content))) => {
					info!(tag = %loop_provider.tag, count = outbounds.len(), "provider refreshed from remote");
					loop_provider.apply_outbounds(outbounds);
					*loop_provider.sub_info.write() = Some(sub_info);
					store.put_subscription(
						loop_provider.tag.as_str(),
						SavedSubscription {
							last_updated_unix: 0,
							last_etag: new_etag.clone(),
							content_hash: Some(content_hash(content.as_bytes())),
							content: Some(content),
						},
					);
					etag = new_etag;
				},
				Ok(None) => {
					debug!(tag = %loop_provider.tag, "provider not modified");
					loop_provider.mark_ready();
				},
				Err(Error::Updating(_)) => {},
				Err(e) => {
					warn!(tag = %loop_provider.tag, err = %e, "provider refresh failed, keeping previous outbounds");
					loop_provider.mark_ready();
				},
			}
			tokio::time::sleep(update_interval).await;
		}
	});

	provider
}

async fn fetch_once(
	http: &reqwest::Client,
	url: &url::Url,
	etag: Option<&str>,
	user_agent: Option<&str>,
	fetching: &Arc<AtomicBool>,
) -> Result<Option<(Vec<OutboundOptions>, SubInfo, Option<String>, String)>, Error> {
	if fetching.swap(true, Ordering::SeqCst) {
		return Err(Error::Updating(strng::literal("provider")));
	}
	let _guard = scopeguard(fetching);

	let mut req = http
		.get(url.clone())
		.header(http::header::USER_AGENT, user_agent.unwrap_or("fabric 0.1.0"));
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
	let header_sub_info = resp
		.headers()
		.get("subscription-userinfo")
		.and_then(|v| v.to_str().ok())
		.map(parser::parse_sub_info);
	let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

	let (sub_info, remainder) = match body.split_once('\n') {
		Some((first, rest)) if parser::parse_sub_info(first) != SubInfo::default() => {
			(parser::parse_sub_info(first), rest)
		},
		_ => (header_sub_info.unwrap_or_default(), body.as_str()),
	};
	let outbounds = parser::parse_subscription(remainder)?;
	Ok(Some((outbounds, sub_info, new_etag, body)))
}

struct DropGuard<'a>(&'a Arc<AtomicBool>);
impl Drop for DropGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}
fn scopeguard(flag: &Arc<AtomicBool>) -> DropGuard<'_> {
	DropGuard(flag)
}

/// Registry of providers (§4.3 "Provider Manager"). `wait_all_updated` lets the startup path
/// block until every registered provider has completed at least one refresh before the router
/// starts accepting traffic.
pub struct Manager {
	providers: RwLock<std::collections::HashMap<Strng, Arc<Provider>>>,
}

impl Default for Manager {
	fn default() -> Self {
		Self::new()
	}
}

impl Manager {
	pub fn new() -> Self {
		Manager {
			providers: RwLock::new(std::collections::HashMap::new()),
		}
	}

	pub fn insert(&self, provider: Arc<Provider>) {
		self.providers.write().insert(provider.tag.clone(), provider);
	}

	pub fn remove(&self, tag: &str) {
		self.providers.write().remove(tag);
	}

	pub fn get(&self, tag: &str) -> Option<Arc<Provider>> {
		self.providers.read().get(tag).cloned()
	}

	pub fn all(&self) -> Vec<Arc<Provider>> {
		self.providers.read().values().cloned().collect()
	}

	/// §4.3 `AddUpdateTask`: registers interest in `tag`'s next completed refresh. Returns `None`
	/// (the `ok = false` case) when no provider with that tag exists; otherwise a receiver that
	/// resolves once that provider's next `apply_outbounds` completes.
	pub fn add_update_task(&self, tag: &str) -> Option<oneshot::Receiver<()>> {
		let provider = self.get(tag)?;
		let (tx, rx) = oneshot::channel();
		provider.update_waiters.lock().push(tx);
		Some(rx)
	}

	/// §4.3 `WaitAllUpdated`: blocks until every currently registered provider has completed at
	/// least one refresh. Called once at startup before groups/router are built, so
	/// `effective_members` never resolves against a provider that hasn't had a chance to run yet.
	pub async fn wait_all_updated(&self) {
		for provider in self.all() {
			provider.wait_updated().await;
		}
	}
}

pub fn default_update_interval() -> Duration {
	DEFAULT_UPDATE_INTERVAL
}

pub fn default_probe_interval() -> Duration {
	DEFAULT_PROBE_INTERVAL
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn inline_provider_namespaces_tags() {
		let manager = Arc::new(outbound::Manager::new());
		let provider = build_inline(
			strng::new("p"),
			vec![OutboundOptions::Direct { tag: strng::new("a") }],
			manager.clone(),
			Arc::new(History::new()),
		)
		.await;
		assert!(manager.get("p/a").is_some());
		assert_eq!(provider.outbounds().len(), 1);
	}

	#[tokio::test]
	async fn wait_all_updated_resolves_for_inline_providers() {
		let manager = Arc::new(outbound::Manager::new());
		let pm = Manager::new();
		pm.insert(
			build_inline(
				strng::new("p"),
				vec![OutboundOptions::Direct { tag: strng::new("a") }],
				manager,
				Arc::new(History::new()),
			)
			.await,
		);
		tokio::time::timeout(Duration::from_millis(200), pm.wait_all_updated())
			.await
			.expect("inline providers are already updated by construction time");
	}

	#[tokio::test]
	async fn remote_provider_etag_304_keeps_outbounds() {
		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.respond_with(
				wiremock::ResponseTemplate::new(200)
					.insert_header("ETag", "\"v1\"")
					.set_body_string(r#"{"outbounds":[{"type":"direct","tag":"a"}]}"#),
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
		let fetching = Arc::new(AtomicBool::new(false));
		let r1 = fetch_once(&http, &url, None, None, &fetching).await.unwrap();
		assert!(r1.is_some());
		let (outbounds, _, etag, _) = r1.unwrap();
		assert_eq!(outbounds.len(), 1);
		assert_eq!(etag.as_deref(), Some("\"v1\""));

		let r2 = fetch_once(&http, &url, Some("\"v1\""), None, &fetching).await.unwrap();
		assert!(r2.is_none());
	}

	#[tokio::test]
	async fn remote_provider_discards_cache_on_hash_mismatch() {
		use crate::cache::MemoryStore;

		let store = MemoryStore::new();
		store.put_subscription(
			"p",
			SavedSubscription {
				last_updated_unix: 0,
				last_etag: None,
				content: Some(r#"{"outbounds":[{"type":"direct","tag":"a"}]}"#.to_string()),
				content_hash: Some("not-the-real-hash".to_string()),
			},
		);

		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.respond_with(wiremock::ResponseTemplate::new(304))
			.mount(&server)
			.await;
		let url = url::Url::parse(&server.uri()).unwrap();
		let manager = Arc::new(outbound::Manager::new());

		let provider = build_remote(
			strng::new("p"),
			url,
			None,
			Duration::from_secs(3600),
			HealthCheckOptions::default(),
			manager.clone(),
			store,
			reqwest::Client::new(),
			Arc::new(History::new()),
		)
		.await;
		assert!(manager.get("p/a").is_none(), "a subscription cache with a mismatched hash must be discarded");
		assert_eq!(provider.outbounds().len(), 0);
	}
}
