//! Router decision flow (§4.7): classify a connection against ordered rules, resolve the winning
//! tag through groups or the outbound manager directly, and hand back the outbound to dial.

use std::sync::Arc;

use fabric_core::prelude::*;

use crate::group;
use crate::outbound::{self, Outbound};
use crate::rule::ruleset;
use crate::rule::{InboundContext, RuleItem, RuleOptions};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("default outbound {0} not found")]
	DefaultOutboundMissing(Strng),
	#[error("rule {0} references unknown outbound {1}")]
	RuleOutboundMissing(uuid::Uuid, Strng),
}

/// Matches `RuleItem::RuleSet`/`OutboundTag` against live registries, which `RuleItem::matches`
/// itself cannot do since it has no access to the rule-set/group registries (§4.5, §4.6).
fn item_matches(item: &RuleItem, ctx: &InboundContext, rule_sets: &ruleset::Manager, resolved_outbound: Option<&str>) -> bool {
	match item {
		RuleItem::RuleSet { tags } => tags.iter().any(|t| rule_sets.get(t.as_str()).is_some_and(|rs| rs.matches(ctx))),
		RuleItem::OutboundTag { tags } => resolved_outbound.is_some_and(|o| tags.iter().any(|t| t.as_str() == o)),
		other => other.matches(ctx),
	}
}

fn rule_matches(rule: &crate::rule::RuleKind, ctx: &InboundContext, rule_sets: &ruleset::Manager) -> bool {
	use crate::rule::{LogicalMode, RuleKind};
	match rule {
		RuleKind::Default { items } => items.iter().all(|i| item_matches(i, ctx, rule_sets, None)),
		RuleKind::Logical { mode, rules } => match mode {
			LogicalMode::And => rules.iter().all(|r| rule_matches(r, ctx, rule_sets)),
			LogicalMode::Or => rules.iter().any(|r| rule_matches(r, ctx, rule_sets)),
		},
	}
}

fn route_rule_matches(rule: &RuleOptions, ctx: &InboundContext, rule_sets: &ruleset::Manager) -> bool {
	if rule.disabled {
		return false;
	}
	let m = rule_matches(&rule.kind, ctx, rule_sets);
	if rule.invert { !m } else { m }
}

/// Owns the ordered rule list and the registries needed to resolve a matched tag into a live
/// outbound (§4.7, §3 "Ownership summary").
pub struct Router {
	rules: parking_lot::RwLock<Vec<RuleOptions>>,
	default_outbound: Strng,
	outbounds: Arc<outbound::Manager>,
	groups: Arc<group::Manager>,
	rule_sets: Arc<ruleset::Manager>,
}

impl Router {
	pub fn new(
		rules: Vec<RuleOptions>,
		default_outbound: Strng,
		outbounds: Arc<outbound::Manager>,
		groups: Arc<group::Manager>,
		rule_sets: Arc<ruleset::Manager>,
	) -> Result<Self, Error> {
		if !outbounds.contains(default_outbound.as_str()) && groups.get(default_outbound.as_str()).is_none() {
			return Err(Error::DefaultOutboundMissing(default_outbound));
		}
		Ok(Router {
			rules: parking_lot::RwLock::new(rules),
			default_outbound,
			outbounds,
			groups,
			rule_sets,
		})
	}

	/// Replaces the rule list wholesale; used when config is reloaded (rules themselves have no
	/// independent refresh trigger, unlike providers/rule-sets).
	pub fn set_rules(&self, rules: Vec<RuleOptions>) {
		*self.rules.write() = rules;
	}

	/// §4.7 decision flow: first matching enabled rule wins; otherwise the default outbound. The
	/// winning tag is then resolved through the group registry first (a group is itself an
	/// outbound-shaped tag), falling back to a direct outbound lookup.
	pub fn route(&self, ctx: &InboundContext) -> Arc<Outbound> {
		let tag = self.winning_tag(ctx);
		self.resolve(&tag, ctx)
	}

	/// Like [`Router::route`], but also returns the interrupt token tied to this resolution
	/// (§3 "Interrupt groups"). Callers that hold the connection open should race subsequent
	/// reads against the token (e.g. via [`Outbound::dial_tcp`]'s `InterruptibleStream`) so a
	/// later `SelectOutbound` on the winning group tears down connections dialed under the old
	/// selection.
	pub fn route_with_interrupt(&self, ctx: &InboundContext) -> (Arc<Outbound>, tokio_util::sync::CancellationToken) {
		let tag = self.winning_tag(ctx);
		self.resolve_with_interrupt(&tag, ctx)
	}

	fn winning_tag(&self, ctx: &InboundContext) -> Strng {
		self.rules
			.read()
			.iter()
			.find(|r| route_rule_matches(r, ctx, &self.rule_sets))
			.map(|r| r.outbound.clone())
			.unwrap_or_else(|| self.default_outbound.clone())
	}

	fn resolve(&self, tag: &str, ctx: &InboundContext) -> Arc<Outbound> {
		if let Some(group) = self.groups.get(tag) {
			return group.now(ctx);
		}
		self.outbounds
			.get(tag)
			.unwrap_or_else(|| Arc::new(Outbound::compatible()))
	}

	fn resolve_with_interrupt(&self, tag: &str, ctx: &InboundContext) -> (Arc<Outbound>, tokio_util::sync::CancellationToken) {
		if let Some(group) = self.groups.get(tag) {
			return group.now_with_interrupt(ctx);
		}
		let outbound = self.outbounds.get(tag).unwrap_or_else(|| Arc::new(Outbound::compatible()));
		(outbound, tokio_util::sync::CancellationToken::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::group::selector::{Selector, SelectorOptions};
	use crate::rule::{DomainMatchStrategy, LogicalMode, RuleKind};

	fn build_registries() -> (Arc<outbound::Manager>, crate::provider::Manager, Arc<group::Manager>, Arc<ruleset::Manager>) {
		let om = Arc::new(outbound::Manager::new());
		om.apply(
			&[
				outbound::OutboundOptions::Direct { tag: strng::new("direct") },
				outbound::OutboundOptions::Direct { tag: strng::new("proxy") },
			],
			&[],
		);
		(om, crate::provider::Manager::new(), Arc::new(group::Manager::new()), Arc::new(ruleset::Manager::new()))
	}

	fn ctx_with_domain(domain: &str) -> InboundContext {
		InboundContext {
			destination_fqdn: Some(strng::new(domain)),
			..Default::default()
		}
	}

	#[test]
	fn falls_back_to_default_outbound() {
		let (om, _pm, groups, rule_sets) = build_registries();
		let router = Router::new(vec![], strng::new("direct"), om, groups, rule_sets).unwrap();
		let routed = router.route(&InboundContext::default());
		assert_eq!(routed.tag.as_str(), "direct");
	}

	#[test]
	fn matching_rule_wins_over_default() {
		let (om, _pm, groups, rule_sets) = build_registries();
		let rule = RuleOptions {
			id: uuid::Uuid::new_v4(),
			kind: RuleKind::Default {
				items: vec![RuleItem::Domain {
					domains: vec![],
					domain_suffixes: vec![strng::new("example.com")],
					strategy: DomainMatchStrategy::FqdnOnly,
				}],
			},
			invert: false,
			disabled: false,
			outbound: strng::new("proxy"),
		};
		let router = Router::new(vec![rule], strng::new("direct"), om, groups, rule_sets).unwrap();
		let routed = router.route(&ctx_with_domain("www.example.com"));
		assert_eq!(routed.tag.as_str(), "proxy");
	}

	#[test]
	fn first_match_wins_over_later_rules() {
		let (om, _pm, groups, rule_sets) = build_registries();
		let rules = vec![
			RuleOptions {
				id: uuid::Uuid::new_v4(),
				kind: RuleKind::Default {
					items: vec![RuleItem::IsPrivate],
				},
				invert: true,
				disabled: false,
				outbound: strng::new("proxy"),
			},
			RuleOptions {
				id: uuid::Uuid::new_v4(),
				kind: RuleKind::Logical {
					mode: LogicalMode::Or,
					rules: vec![RuleKind::Default { items: vec![] }],
				},
				invert: false,
				disabled: false,
				outbound: strng::new("direct"),
			},
		];
		let router = Router::new(rules, strng::new("direct"), om, groups, rule_sets).unwrap();
		let routed = router.route(&InboundContext::default());
		assert_eq!(routed.tag.as_str(), "proxy");
	}

	#[test]
	fn rule_referencing_a_group_resolves_via_the_group_strategy() {
		let (om, pm, groups, rule_sets) = build_registries();
		let store = crate::cache::MemoryStore::new();
		let selector = Selector::new(
			SelectorOptions {
				tag: strng::new("sel"),
				members: group::MemberSpec {
					outbounds: vec![strng::new("proxy")],
					..Default::default()
				},
				default: None,
			},
			store,
			&om,
			&pm,
		);
		groups.insert(Arc::new(group::Group::Selector(Arc::new(selector))));

		let router = Router::new(vec![], strng::new("sel"), om, groups, rule_sets).unwrap();
		let routed = router.route(&InboundContext::default());
		assert_eq!(routed.tag.as_str(), "proxy");
	}

	#[test]
	fn missing_default_outbound_is_config_invalid() {
		let (om, _pm, groups, rule_sets) = build_registries();
		assert!(Router::new(vec![], strng::new("nonexistent"), om, groups, rule_sets).is_err());
	}

	#[test]
	fn reselecting_an_interrupt_group_cancels_the_old_token() {
		let (om, pm, groups, rule_sets) = build_registries();
		let store = crate::cache::MemoryStore::new();
		let selector = Arc::new(Selector::new(
			SelectorOptions {
				tag: strng::new("sel"),
				members: group::MemberSpec {
					outbounds: vec![strng::new("direct"), strng::new("proxy")],
					interrupt_exist_connections: true,
					..Default::default()
				},
				default: Some(strng::new("direct")),
			},
			store,
			&om,
			&pm,
		));
		groups.insert(Arc::new(group::Group::Selector(selector.clone())));

		let router = Router::new(vec![], strng::new("sel"), om, groups, rule_sets).unwrap();
		let (outbound, token) = router.route_with_interrupt(&InboundContext::default());
		assert_eq!(outbound.tag.as_str(), "direct");
		assert!(!token.is_cancelled());

		selector.select_outbound("proxy").unwrap();
		assert!(token.is_cancelled(), "a connection dialed under the old selection must observe the reselection");
	}
}
