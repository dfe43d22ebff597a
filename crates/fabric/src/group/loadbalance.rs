//! LoadBalance group (§4.4.3): round-robin, consistent-hashing, and sticky-sessions dispatch
//! strategies over a set of alive (recently probed) outbounds.

use std::hash::Hasher;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use fabric_core::prelude::*;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{MemberSpec, effective_members};
use crate::healthcheck::{History, ProbeTarget, probe_batch};
use crate::outbound::{self, Outbound};
use crate::provider;
use crate::rule::InboundContext;

const MAX_REHASH_RETRIES: usize = 5;
const STICKY_CACHE_SIZE: usize = 1000;
const DEFAULT_STICKY_TTL: Duration = Duration::from_secs(600);
const DEFAULT_URL: &str = "http://www.gstatic.com/generate_204";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(180);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

fn now_secs() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
	RoundRobin,
	ConsistentHashing,
	StickySessions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalanceOptions {
	pub tag: Strng,
	#[serde(flatten)]
	pub members: MemberSpec,
	pub strategy: Strategy,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub sticky_ttl: Option<Duration>,
	/// §4.4.3 invariants: URL defaults to a known 204-generating HTTP URL, `interval` and
	/// `idle_timeout` default when zero/absent, and `interval` is clamped to at most
	/// `idle_timeout` the same way URLTest clamps its own ticker.
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub interval: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub idle_timeout: Option<Duration>,
}

/// Bucket-stable hash mapping a 64-bit key to `[0, n)`; changing `n` moves the minimum number of
/// keys (GLOSSARY "Jump-hash"). Matches the canonical Lamping/Veach jump consistent hash.
pub fn jump_hash(mut key: u64, num_buckets: i64) -> i64 {
	let mut b: i64 = -1;
	let mut j: i64 = 0;
	while j < num_buckets {
		b = j;
		key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
		j = ((b as f64 + 1.0) * ((1i64 << 31) as f64 / (((key >> 33) + 1) as f64))) as i64;
	}
	b
}

fn hash_key(key: &str) -> u64 {
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	hasher.write(key.as_bytes());
	hasher.finish()
}

/// Key priority for consistent-hashing/sticky-sessions: FQDN destination, sniffed host, domain,
/// else first destination address, else source-IP string (§4.4.3).
fn dispatch_key(ctx: &InboundContext) -> String {
	if let Some(fqdn) = &ctx.destination_fqdn {
		return fqdn.to_string();
	}
	if let Some(host) = &ctx.sniff_host {
		return host.to_string();
	}
	if let Some(domain) = &ctx.domain {
		return domain.to_string();
	}
	if let Some(ip) = &ctx.destination_ip {
		return ip.to_string();
	}
	ctx.source_ip.map(|ip: IpAddr| ip.to_string()).unwrap_or_default()
}

fn dispatch_key_with_src_dst(ctx: &InboundContext) -> String {
	let dst = dispatch_key(ctx);
	match ctx.source_ip {
		Some(src) => format!("{src}-{dst}"),
		None => dst,
	}
}

pub struct LoadBalance {
	pub tag: Strng,
	spec: MemberSpec,
	strategy: Strategy,
	sticky_ttl: Duration,
	url: Strng,
	interval: Duration,
	idle_timeout: Duration,
	members: RwLock<Vec<Arc<Outbound>>>,
	round_robin_index: AtomicUsize,
	sticky_cache: Mutex<LruCache<String, (usize, std::time::Instant)>>,
	pub history: Arc<History>,
	last_touch: AtomicU64,
	ticker_running: Arc<AtomicBool>,
	checking: Arc<AtomicBool>,
	http: reqwest::Client,
}

impl LoadBalance {
	pub fn new(opts: LoadBalanceOptions, om: &outbound::Manager, pm: &provider::Manager, history: Arc<History>, http: reqwest::Client) -> Self {
		let interval = opts.interval.unwrap_or(DEFAULT_INTERVAL);
		let idle_timeout = opts.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT).max(interval);
		LoadBalance {
			tag: opts.tag,
			members: RwLock::new(effective_members(&opts.members, om, pm)),
			spec: opts.members,
			strategy: opts.strategy,
			sticky_ttl: opts.sticky_ttl.unwrap_or(DEFAULT_STICKY_TTL),
			url: strng::new(opts.url.unwrap_or_else(|| DEFAULT_URL.to_string())),
			interval,
			idle_timeout,
			round_robin_index: AtomicUsize::new(0),
			sticky_cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(STICKY_CACHE_SIZE).unwrap())),
			history,
			last_touch: AtomicU64::new(0),
			ticker_running: Arc::new(AtomicBool::new(false)),
			checking: Arc::new(AtomicBool::new(false)),
			http,
		}
	}

	pub fn on_provider_update(&self, om: &outbound::Manager, pm: &provider::Manager) {
		*self.members.write() = effective_members(&self.spec, om, pm);
	}

	fn alive(&self, members: &[Arc<Outbound>]) -> Vec<Arc<Outbound>> {
		members
			.iter()
			.filter(|m| self.history.get(m.tag.as_str()).is_some())
			.cloned()
			.collect()
	}

	/// Marks the group as recently dispatched and restarts the probe loop if it had idled out,
	/// mirroring URLTest's own idle-ticker restart (§4.4.2, §4.4.3, §9 "idle-driven tickers").
	/// Without this, `alive()` can only ever be populated by some unrelated group or provider
	/// health-check that happens to probe the same tags.
	pub fn touch(self: &Arc<Self>) {
		self.last_touch.store(now_secs(), Ordering::SeqCst);
		if !self.ticker_running.load(Ordering::SeqCst) {
			self.spawn_loop(self.http.clone());
		}
	}

	fn idle(&self) -> bool {
		now_secs().saturating_sub(self.last_touch.load(Ordering::SeqCst)) > self.idle_timeout.as_secs()
	}

	/// Spawns the probe loop if not already running, populating `history` so `alive()` has
	/// something to filter on. The caller invokes this once after construction, and `touch()`
	/// invokes it again whenever the loop had previously idled out.
	pub fn spawn_loop(self: &Arc<Self>, http: reqwest::Client) {
		if self.ticker_running.swap(true, Ordering::SeqCst) {
			return;
		}
		let this = self.clone();
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(this.interval).await;
				if this.idle() {
					this.ticker_running.store(false, Ordering::SeqCst);
					return;
				}
				let targets: Vec<ProbeTarget> = this
					.members
					.read()
					.iter()
					.map(|m| ProbeTarget { tag: m.tag.clone() })
					.collect();
				probe_batch(
					http.clone(),
					this.url.clone(),
					Duration::from_secs(3),
					targets,
					this.history.clone(),
					this.checking.clone(),
				)
				.await;
			}
		});
	}

	/// `touch=true` marks an actual dispatch, advancing the round-robin index (§4.4.3).
	pub fn pick(&self, ctx: &InboundContext, touch: bool) -> Arc<Outbound> {
		let members = self.members.read().clone();
		match self.strategy {
			Strategy::RoundRobin => self.pick_round_robin(&members, touch),
			Strategy::ConsistentHashing => self.pick_consistent_hashing(&members, &dispatch_key(ctx)),
			Strategy::StickySessions => self.pick_sticky(&members, &dispatch_key_with_src_dst(ctx)),
		}
	}

	fn pick_round_robin(&self, members: &[Arc<Outbound>], touch: bool) -> Arc<Outbound> {
		let alive = self.alive(members);
		if alive.is_empty() {
			return members.first().cloned().unwrap_or_else(|| Arc::new(Outbound::compatible()));
		}
		let idx = if touch {
			self.round_robin_index.fetch_add(1, Ordering::SeqCst) % alive.len()
		} else {
			self.round_robin_index.load(Ordering::SeqCst) % alive.len()
		};
		alive[idx].clone()
	}

	fn pick_consistent_hashing(&self, members: &[Arc<Outbound>], key: &str) -> Arc<Outbound> {
		if members.is_empty() {
			return Arc::new(Outbound::compatible());
		}
		let alive = self.alive(members);
		if alive.is_empty() {
			return members[0].clone();
		}
		let mut hash = hash_key(key);
		for _ in 0..=MAX_REHASH_RETRIES {
			let idx = jump_hash(hash, alive.len() as i64) as usize;
			if let Some(member) = alive.get(idx) {
				return member.clone();
			}
			hash = hash.wrapping_add(1);
		}
		// Linear scan fallback, then index 0 as last resort (§4.4.3).
		alive.first().cloned().unwrap_or_else(|| members[0].clone())
	}

	fn pick_sticky(&self, members: &[Arc<Outbound>], key: &str) -> Arc<Outbound> {
		if members.is_empty() {
			return Arc::new(Outbound::compatible());
		}
		let alive = self.alive(members);
		if alive.is_empty() {
			return members[0].clone();
		}

		let mut cache = self.sticky_cache.lock();
		if let Some((idx, at)) = cache.get(key).copied() {
			if at.elapsed() <= self.sticky_ttl {
				if let Some(member) = alive.get(idx) {
					return member.clone();
				}
			}
		}

		let seed = hash_key(key) ^ hash_key(&format!("{:?}", std::time::Instant::now()));
		let mut hash = seed;
		let mut chosen = 0usize;
		let mut found = false;
		for _ in 0..=MAX_REHASH_RETRIES {
			let idx = jump_hash(hash, alive.len() as i64) as usize;
			if idx < alive.len() {
				chosen = idx;
				found = true;
				break;
			}
			hash = hash.wrapping_add(1);
		}
		if !found {
			chosen = 0;
		}
		cache.put(key.to_string(), (chosen, std::time::Instant::now()));
		alive[chosen].clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx_with_fqdn(fqdn: &str) -> InboundContext {
		InboundContext {
			destination_fqdn: Some(strng::new(fqdn)),
			..Default::default()
		}
	}

	fn setup(tags: &[&str]) -> (Arc<outbound::Manager>, provider::Manager, Arc<History>) {
		let om = Arc::new(outbound::Manager::new());
		let opts: Vec<_> = tags
			.iter()
			.map(|t| outbound::OutboundOptions::Direct { tag: strng::new(*t) })
			.collect();
		om.apply(&opts, &[]);
		let history = Arc::new(History::new());
		for t in tags {
			history.store(&strng::new(*t), 10);
		}
		(om, provider::Manager::new(), history)
	}

	#[test]
	fn consistent_hashing_is_stable_for_same_key() {
		let (om, pm, history) = setup(&["a", "b", "c", "d"]);
		let lb = LoadBalance::new(
			LoadBalanceOptions {
				tag: strng::new("lb"),
				members: MemberSpec {
					outbounds: vec![strng::new("a"), strng::new("b"), strng::new("c"), strng::new("d")],
					..Default::default()
				},
				strategy: Strategy::ConsistentHashing,
				sticky_ttl: None,
				url: None,
				interval: None,
				idle_timeout: None,
			},
			&om,
			&pm,
			history,
			reqwest::Client::new(),
		);
		let ctx = ctx_with_fqdn("example.com");
		let first = lb.pick(&ctx, false);
		let second = lb.pick(&ctx, false);
		assert_eq!(first.tag, second.tag);
	}

	#[test]
	fn consistent_hashing_skips_dead_outbound() {
		let (om, pm, history) = setup(&["a", "b", "c", "d"]);
		let lb = LoadBalance::new(
			LoadBalanceOptions {
				tag: strng::new("lb"),
				members: MemberSpec {
					outbounds: vec![strng::new("a"), strng::new("b"), strng::new("c"), strng::new("d")],
					..Default::default()
				},
				strategy: Strategy::ConsistentHashing,
				sticky_ttl: None,
				url: None,
				interval: None,
				idle_timeout: None,
			},
			&om,
			&pm,
			history.clone(),
			reqwest::Client::new(),
		);
		let ctx = ctx_with_fqdn("example.com");
		let first = lb.pick(&ctx, false);
		history.delete(first.tag.as_str());
		let second = lb.pick(&ctx, false);
		assert_ne!(first.tag, second.tag);
	}

	#[test]
	fn round_robin_advances_only_on_touch() {
		let (om, pm, history) = setup(&["a", "b"]);
		let lb = LoadBalance::new(
			LoadBalanceOptions {
				tag: strng::new("lb"),
				members: MemberSpec {
					outbounds: vec![strng::new("a"), strng::new("b")],
					..Default::default()
				},
				strategy: Strategy::RoundRobin,
				sticky_ttl: None,
				url: None,
				interval: None,
				idle_timeout: None,
			},
			&om,
			&pm,
			history,
			reqwest::Client::new(),
		);
		let ctx = InboundContext::default();
		let first = lb.pick(&ctx, false);
		let second = lb.pick(&ctx, false);
		assert_eq!(first.tag, second.tag);
	}

	#[test]
	fn jump_hash_is_bucket_stable() {
		let small = jump_hash(123456789, 4);
		assert!((0..4).contains(&small));
	}

	#[tokio::test(start_paused = true)]
	async fn touch_restarts_an_idled_out_ticker() {
		let om = Arc::new(outbound::Manager::new());
		om.apply(&[outbound::OutboundOptions::Direct { tag: strng::new("a") }], &[]);
		let lb = Arc::new(LoadBalance::new(
			LoadBalanceOptions {
				tag: strng::new("lb"),
				members: MemberSpec {
					outbounds: vec![strng::new("a")],
					..Default::default()
				},
				strategy: Strategy::RoundRobin,
				sticky_ttl: None,
				url: None,
				interval: Some(Duration::from_millis(10)),
				idle_timeout: Some(Duration::from_millis(10)),
			},
			&om,
			&provider::Manager::new(),
			Arc::new(History::new()),
			reqwest::Client::new(),
		));

		lb.spawn_loop(reqwest::Client::new());
		assert!(lb.ticker_running.load(Ordering::SeqCst));

		tokio::time::advance(Duration::from_millis(50)).await;
		tokio::task::yield_now().await;
		assert!(!lb.ticker_running.load(Ordering::SeqCst), "loop should have idled out");

		lb.touch();
		assert!(lb.ticker_running.load(Ordering::SeqCst), "touch should have restarted the loop");
	}
}
