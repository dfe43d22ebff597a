//! Outbound groups: Selector, URLTest, and LoadBalance aggregate outbounds into one dispatchable
//! outbound (§3 "Outbound group", §4.4).

pub mod loadbalance;
pub mod selector;
pub mod urltest;

use std::sync::Arc;

use fabric_core::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::Store;
use crate::outbound::{self, Outbound};
use crate::provider;
use loadbalance::{LoadBalance, LoadBalanceOptions};
use selector::{Selector, SelectorOptions};
use urltest::{UrlTest, UrlTestOptions};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("config invalid: {0}")]
	ConfigInvalid(String),
	#[error("outbound not found: {0}")]
	NotFound(Strng),
}

/// The member-selection config shared by all three group kinds (§4.4 "All groups share").
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemberSpec {
	#[serde(default)]
	pub outbounds: Vec<Strng>,
	#[serde(default)]
	pub providers: Vec<Strng>,
	#[serde(default)]
	pub use_all_providers: bool,
	#[serde(default, with = "serde_regex_option")]
	pub include: Option<Regex>,
	#[serde(default, with = "serde_regex_option")]
	pub exclude: Option<Regex>,
	#[serde(default)]
	pub interrupt_exist_connections: bool,
}

mod serde_regex_option {
	use regex::Regex;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Option<Regex>, s: S) -> Result<S::Ok, S::Error> {
		match value {
			Some(r) => s.serialize_str(r.as_str()),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Regex>, D::Error> {
		let raw: Option<String> = Option::deserialize(d)?;
		raw.map(|s| Regex::new(&s).map_err(serde::de::Error::custom)).transpose()
	}
}

/// Recomputes `(tags, members)` by merging explicit tags with filtered provider outbounds,
/// falling back to the synthetic `Compatible` outbound when the result would be empty
/// (§4.4 "Common reconfiguration on provider callback").
pub fn effective_members(
	spec: &MemberSpec,
	outbound_manager: &outbound::Manager,
	provider_manager: &provider::Manager,
) -> Vec<Arc<Outbound>> {
	let mut seen = std::collections::HashSet::new();
	let mut members = Vec::new();

	for tag in &spec.outbounds {
		if let Some(o) = outbound_manager.get(tag.as_str()) {
			if seen.insert(o.tag.clone()) {
				members.push(o);
			}
		}
	}

	let providers = if spec.use_all_providers {
		provider_manager.all()
	} else {
		spec.providers.iter().filter_map(|t| provider_manager.get(t.as_str())).collect()
	};
	for p in providers {
		for opt in p.outbounds() {
			let tag = strng::new(format!("{}/{}", p.tag, opt.tag()));
			if let Some(include) = &spec.include {
				if !include.is_match(&tag) {
					continue;
				}
			}
			if let Some(exclude) = &spec.exclude {
				if exclude.is_match(&tag) {
					continue;
				}
			}
			if let Some(o) = outbound_manager.get(tag.as_str()) {
				if seen.insert(o.tag.clone()) {
					members.push(o);
				}
			}
		}
	}

	if members.is_empty() {
		members.push(Arc::new(Outbound::compatible()));
	}
	members
}

/// Tagged-union config for the three group kinds (§4.4), dispatched the same way
/// `OutboundOptions`/`ProviderOptions`/`RuleSetOptions` are.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupOptions {
	Selector(SelectorOptions),
	UrlTest(UrlTestOptions),
	LoadBalance(LoadBalanceOptions),
}

impl GroupOptions {
	pub fn tag(&self) -> &Strng {
		match self {
			GroupOptions::Selector(o) => &o.tag,
			GroupOptions::UrlTest(o) => &o.tag,
			GroupOptions::LoadBalance(o) => &o.tag,
		}
	}
}

/// A constructed group instance, resolved to a live outbound on every dispatch (§3 "Outbound
/// group"). The router only ever calls `now`/`touch` through this enum, never the inner types
/// directly, so it stays agnostic to which strategy a tag was configured with.
pub enum Group {
	Selector(Arc<Selector>),
	UrlTest(Arc<UrlTest>),
	LoadBalance(Arc<LoadBalance>),
}

impl Group {
	pub fn tag(&self) -> &Strng {
		match self {
			Group::Selector(g) => &g.tag,
			Group::UrlTest(g) => &g.tag,
			Group::LoadBalance(g) => &g.tag,
		}
	}

	/// Resolves the group to a single dispatchable outbound for this flow. `ctx` only matters for
	/// `LoadBalance` (consistent-hashing/sticky-sessions key derivation); Selector and URLTest
	/// ignore it.
	pub fn now(&self, ctx: &crate::rule::InboundContext) -> Arc<Outbound> {
		match self {
			Group::Selector(g) => g.now(),
			Group::UrlTest(g) => {
				g.touch();
				g.now()
			},
			Group::LoadBalance(g) => {
				g.touch();
				g.pick(ctx, true)
			},
		}
	}

	/// Like [`Group::now`], but also returns the interrupt token for the resolved selection
	/// (§3 "Interrupt groups"). Only `Selector` ever cancels its token (on a changed
	/// `select_outbound`, when `interrupt_exist_connections` is set); the other two kinds hand
	/// back a token that never fires so callers have one calling convention regardless of
	/// strategy.
	pub fn now_with_interrupt(&self, ctx: &crate::rule::InboundContext) -> (Arc<Outbound>, tokio_util::sync::CancellationToken) {
		match self {
			Group::Selector(g) => g.now_with_interrupt(),
			Group::UrlTest(g) => {
				g.touch();
				(g.now(), tokio_util::sync::CancellationToken::new())
			},
			Group::LoadBalance(g) => {
				g.touch();
				(g.pick(ctx, true), tokio_util::sync::CancellationToken::new())
			},
		}
	}

	/// Starts the idle-driven probe loop for kinds that have one (URLTest, LoadBalance).
	/// Selector has no ticker of its own. Called once right after the group is constructed;
	/// `now`/`now_with_interrupt` restart it later if it had idled out.
	pub fn spawn_loop(self: &Arc<Self>, http: reqwest::Client) {
		match &**self {
			Group::Selector(_) => {},
			Group::UrlTest(g) => g.spawn_loop(http),
			Group::LoadBalance(g) => g.spawn_loop(http),
		}
	}

	pub fn on_provider_update(&self, om: &outbound::Manager, pm: &provider::Manager) {
		match self {
			Group::Selector(g) => g.on_provider_update(om, pm),
			Group::UrlTest(g) => g.on_provider_update(om, pm),
			Group::LoadBalance(g) => g.on_provider_update(om, pm),
		}
	}
}

pub fn build(
	opts: GroupOptions,
	store: Arc<dyn Store>,
	om: &outbound::Manager,
	pm: &provider::Manager,
	history: Arc<crate::healthcheck::History>,
	http: reqwest::Client,
) -> Result<Arc<Group>, Error> {
	Ok(match opts {
		GroupOptions::Selector(o) => Arc::new(Group::Selector(Arc::new(Selector::new(o, store, om, pm)))),
		GroupOptions::UrlTest(o) => Arc::new(Group::UrlTest(Arc::new(UrlTest::new(o, om, pm, history, http)))),
		GroupOptions::LoadBalance(o) => Arc::new(Group::LoadBalance(Arc::new(LoadBalance::new(o, om, pm, history, http)))),
	})
}

/// Registry of groups (§4.4). Groups are themselves resolvable as outbounds by tag, so the router
/// checks this before falling back to a plain outbound lookup.
#[derive(Default)]
pub struct Manager {
	groups: parking_lot::RwLock<std::collections::HashMap<Strng, Arc<Group>>>,
}

impl Manager {
	pub fn new() -> Self {
		Manager::default()
	}

	pub fn insert(&self, group: Arc<Group>) {
		self.groups.write().insert(group.tag().clone(), group);
	}

	pub fn get(&self, tag: &str) -> Option<Arc<Group>> {
		self.groups.read().get(tag).cloned()
	}

	pub fn all(&self) -> Vec<Arc<Group>> {
		self.groups.read().values().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn empty_membership_falls_back_to_compatible() {
		let om = outbound::Manager::new();
		let pm = provider::Manager::new();
		let members = effective_members(&MemberSpec::default(), &om, &pm);
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].tag.as_str(), outbound::COMPATIBLE_TAG);
	}

	#[tokio::test]
	async fn use_all_providers_includes_provider_members() {
		let om = Arc::new(outbound::Manager::new());
		let pm = provider::Manager::new();
		let p = provider::build_inline(
			strng::new("p"),
			vec![outbound::OutboundOptions::Direct { tag: strng::new("a") }],
			om.clone(),
			Arc::new(crate::healthcheck::History::new()),
		)
		.await;
		pm.insert(p);
		let spec = MemberSpec {
			use_all_providers: true,
			..Default::default()
		};
		let members = effective_members(&spec, &om, &pm);
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].tag.as_str(), "p/a");
	}
}
