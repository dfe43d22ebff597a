//! URLTest group (§4.4.2): periodic probing plus a lowest-delay selection with hysteresis, and
//! an idle-driven probe ticker that only runs while the group is actually being dispatched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::atomic::Ordering;
use std::time::Duration;

use fabric_core::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{MemberSpec, effective_members};
use crate::healthcheck::{History, ProbeTarget, probe_batch};
use crate::outbound::{self, Outbound};
use crate::provider;

const DEFAULT_URL: &str = "http://www.gstatic.com/generate_204";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(180);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
const DEFAULT_TOLERANCE_MS: u16 = 50;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UrlTestOptions {
	pub tag: Strng,
	#[serde(flatten)]
	pub members: MemberSpec,
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub interval: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub idle_timeout: Option<Duration>,
	#[serde(default)]
	pub tolerance_ms: Option<u16>,
}

pub struct UrlTest {
	pub tag: Strng,
	spec: MemberSpec,
	url: Strng,
	interval: Duration,
	idle_timeout: Duration,
	tolerance_ms: u16,
	members: RwLock<Vec<Arc<Outbound>>>,
	previous: RwLock<Option<Strng>>,
	last_touch: AtomicU64,
	ticker_running: Arc<AtomicBool>,
	pub history: Arc<History>,
	checking: Arc<AtomicBool>,
	http: reqwest::Client,
}

fn now_secs() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

impl UrlTest {
	pub fn new(opts: UrlTestOptions, om: &outbound::Manager, pm: &provider::Manager, history: Arc<History>, http: reqwest::Client) -> Self {
		let interval = opts.interval.unwrap_or(DEFAULT_INTERVAL);
		let idle_timeout = opts.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT).max(interval);
		UrlTest {
			tag: opts.tag,
			members: RwLock::new(effective_members(&opts.members, om, pm)),
			spec: opts.members,
			url: strng::new(opts.url.unwrap_or_else(|| DEFAULT_URL.to_string())),
			interval,
			idle_timeout,
			tolerance_ms: opts.tolerance_ms.unwrap_or(DEFAULT_TOLERANCE_MS),
			previous: RwLock::new(None),
			last_touch: AtomicU64::new(0),
			ticker_running: Arc::new(AtomicBool::new(false)),
			history,
			checking: Arc::new(AtomicBool::new(false)),
			http,
		}
	}

	pub fn on_provider_update(&self, om: &outbound::Manager, pm: &provider::Manager) {
		*self.members.write() = effective_members(&self.spec, om, pm);
	}

	/// §4.4.2: lowest recorded delay among alive members; ties within `tolerance` prefer the
	/// previously selected outbound to avoid flapping; absent history falls back to the first
	/// effective outbound.
	pub fn now(&self) -> Arc<Outbound> {
		let members = self.members.read();
		let previous = self.previous.read().clone();

		let mut best: Option<(Arc<Outbound>, u16)> = None;
		for member in members.iter() {
			let Some(entry) = self.history.get_fresh(member.tag.as_str(), self.interval * 3) else {
				continue;
			};
			let is_better = match &best {
				None => true,
				Some((_, best_delay)) => entry.delay_ms + self.tolerance_ms < *best_delay,
			};
			if is_better {
				best = Some((member.clone(), entry.delay_ms));
			}
		}

		let selected = match (&best, &previous) {
			(Some((candidate, candidate_delay)), Some(prev_tag)) => {
				if let Some(prev_member) = members.iter().find(|m| &m.tag == prev_tag) {
					if let Some(prev_entry) = self.history.get_fresh(prev_tag.as_str(), self.interval * 3) {
						if prev_entry.delay_ms <= candidate_delay.saturating_add(self.tolerance_ms) {
							prev_member.clone()
						} else {
							candidate.clone()
						}
					} else {
						candidate.clone()
					}
				} else {
					candidate.clone()
				}
			},
			(Some((candidate, _)), None) => candidate.clone(),
			(None, _) => members.first().cloned().unwrap_or_else(|| Arc::new(Outbound::compatible())),
		};

		*self.previous.write() = Some(selected.tag.clone());
		selected
	}

	/// Marks the group as recently dispatched and restarts the probe loop if it had idled out
	/// (§4.4.2, §9 "idle-driven tickers"). The loop only runs within `idle_timeout` of the last
	/// touch; `spawn_loop` stops itself once idle, so every dispatch after that must kick it
	/// awake again here rather than relying on the one-time call made at group construction.
	pub fn touch(self: &Arc<Self>) {
		self.last_touch.store(now_secs(), Ordering::SeqCst);
		if !self.ticker_running.load(Ordering::SeqCst) {
			self.spawn_loop(self.http.clone());
		}
	}

	fn idle(&self) -> bool {
		now_secs().saturating_sub(self.last_touch.load(Ordering::SeqCst)) > self.idle_timeout.as_secs()
	}

	/// Spawns the probe loop if not already running. The caller (group registry) invokes this
	/// once after construction, and `touch()` invokes it again whenever the loop had previously
	/// idled out. The first tick after a (re)start happens after `interval`, never immediately,
	/// to avoid a probe stampede when many idle groups wake at once (§9 caveat).
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
}

#[cfg(test)]
mod tests {
	use super::*;

	fn setup_members() -> (Arc<outbound::Manager>, provider::Manager) {
		let om = Arc::new(outbound::Manager::new());
		om.apply(
			&[
				outbound::OutboundOptions::Direct { tag: strng::new("a") },
				outbound::OutboundOptions::Direct { tag: strng::new("b") },
				outbound::OutboundOptions::Direct { tag: strng::new("c") },
			],
			&[],
		);
		(om, provider::Manager::new())
	}

	#[test]
	fn picks_lowest_delay() {
		let (om, pm) = setup_members();
		let history = Arc::new(History::new());
		history.store(&strng::new("a"), 120);
		history.store(&strng::new("b"), 40);
		history.store(&strng::new("c"), 60);

		let group = UrlTest::new(
			UrlTestOptions {
				tag: strng::new("ut"),
				members: MemberSpec {
					outbounds: vec![strng::new("a"), strng::new("b"), strng::new("c")],
					..Default::default()
				},
				url: None,
				interval: None,
				idle_timeout: None,
				tolerance_ms: Some(50),
			},
			&om,
			&pm,
			history.clone(),
			reqwest::Client::new(),
		);
		assert_eq!(group.now().tag.as_str(), "b");
	}

	#[test]
	fn stays_on_previous_within_tolerance() {
		let (om, pm) = setup_members();
		let history = Arc::new(History::new());
		history.store(&strng::new("a"), 120);
		history.store(&strng::new("b"), 40);
		history.store(&strng::new("c"), 60);
		let group = UrlTest::new(
			UrlTestOptions {
				tag: strng::new("ut"),
				members: MemberSpec {
					outbounds: vec![strng::new("a"), strng::new("b"), strng::new("c")],
					..Default::default()
				},
				url: None,
				interval: None,
				idle_timeout: None,
				tolerance_ms: Some(50),
			},
			&om,
			&pm,
			history.clone(),
			reqwest::Client::new(),
		);
		assert_eq!(group.now().tag.as_str(), "b");

		history.store(&strng::new("a"), 120);
		history.store(&strng::new("b"), 50);
		history.store(&strng::new("c"), 55);
		assert_eq!(group.now().tag.as_str(), "b");
	}

	#[tokio::test(start_paused = true)]
	async fn touch_restarts_an_idled_out_ticker() {
		let (om, pm) = setup_members();
		let group = Arc::new(UrlTest::new(
			UrlTestOptions {
				tag: strng::new("ut"),
				members: MemberSpec {
					outbounds: vec![strng::new("a")],
					..Default::default()
				},
				url: None,
				interval: Some(Duration::from_millis(10)),
				idle_timeout: Some(Duration::from_millis(10)),
				tolerance_ms: None,
			},
			&om,
			&pm,
			Arc::new(History::new()),
			reqwest::Client::new(),
		));

		group.spawn_loop(reqwest::Client::new());
		assert!(group.ticker_running.load(Ordering::SeqCst));

		tokio::time::advance(Duration::from_millis(50)).await;
		tokio::task::yield_now().await;
		assert!(!group.ticker_running.load(Ordering::SeqCst), "loop should have idled out");

		group.touch();
		assert!(group.ticker_running.load(Ordering::SeqCst), "touch should have restarted the loop");
	}
}
