//! Rule items and rules (§4.5). A rule item is a single matcher over an [`InboundContext`]; a
//! rule combines items (implicit AND, or explicit AND/OR) into a single action.

pub mod ruleset;

use std::net::IpAddr;

use fabric_core::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Selects which host field a domain-family item tests, mirroring the source's
/// `DomainMatchStrategy` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainMatchStrategy {
	#[default]
	Default,
	FqdnOnly,
	SniffHostOnly,
	PreferFqdn,
	PreferSniffHost,
}

/// Per-flow metadata threaded through the router and rule evaluation (§3 "InboundContext").
/// Created once per inbound connection and never shared across connections.
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
	pub inbound_tag: Option<Strng>,
	pub network: Option<crate::outbound::Network>,
	pub protocol: Option<Strng>,
	pub source_ip: Option<IpAddr>,
	pub source_port: Option<u16>,
	pub destination_fqdn: Option<Strng>,
	pub destination_ip: Option<IpAddr>,
	pub destination_port: Option<u16>,
	pub sniff_host: Option<Strng>,
	pub domain: Option<Strng>,
	pub is_private: bool,
	pub process_name: Option<Strng>,
	pub clash_mode: Option<Strng>,
}

impl InboundContext {
	fn domain_host(&self, strategy: DomainMatchStrategy) -> Option<&str> {
		use DomainMatchStrategy::*;
		match strategy {
			PreferFqdn => self
				.destination_fqdn
				.as_deref()
				.or(self.sniff_host.as_deref())
				.or(self.domain.as_deref()),
			FqdnOnly => self.destination_fqdn.as_deref(),
			SniffHostOnly => self.sniff_host.as_deref(),
			PreferSniffHost | Default => self
				.sniff_host
				.as_deref()
				.or(self.destination_fqdn.as_deref())
				.or(self.domain.as_deref()),
		}
	}
}

/// A single field matcher (§4.5). Only the matchers the core actually exercises in routing
/// decisions are implemented; kinds the source has but that depend on out-of-scope collaborators
/// (GeoIP/Geosite databases, WIFI SSID, process path) are accepted at parse time as `Opaque` so
/// config loading never fails on them, but they never match.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleItem {
	InboundTag { tags: Vec<Strng> },
	Network { networks: Vec<Strng> },
	Protocol { protocols: Vec<Strng> },
	Domain {
		domains: Vec<Strng>,
		domain_suffixes: Vec<Strng>,
		#[serde(default)]
		strategy: DomainMatchStrategy,
	},
	DomainKeyword {
		keywords: Vec<Strng>,
		#[serde(default)]
		strategy: DomainMatchStrategy,
	},
	DomainRegex {
		#[serde(with = "serde_regex")]
		regexes: Vec<Regex>,
		strategy: DomainMatchStrategy,
	},
	IpCidr {
		cidrs: Vec<ipnet::IpNet>,
		#[serde(default)]
		is_source: bool,
	},
	Port { ports: Vec<u16>, #[serde(default)] is_source: bool },
	PortRange {
		start: u16,
		end: u16,
		#[serde(default)]
		is_source: bool,
	},
	IsPrivate,
	ClashMode { mode: Strng },
	OutboundTag { tags: Vec<Strng> },
	RuleSet { tags: Vec<Strng> },
	Opaque { kind: Strng },
}

impl RuleItem {
	pub fn matches(&self, ctx: &InboundContext) -> bool {
		match self {
			RuleItem::InboundTag { tags } => ctx
				.inbound_tag
				.as_ref()
				.is_some_and(|t| tags.iter().any(|x| x == t)),
			RuleItem::Network { networks } => ctx.network.is_some_and(|n| {
				let name = match n {
					crate::outbound::Network::Tcp => "tcp",
					crate::outbound::Network::Udp => "udp",
				};
				networks.iter().any(|x| x.as_str() == name)
			}),
			RuleItem::Protocol { protocols } => ctx
				.protocol
				.as_ref()
				.is_some_and(|p| protocols.iter().any(|x| x == p)),
			RuleItem::Domain {
				domains,
				domain_suffixes,
				strategy,
			} => match ctx.domain_host(*strategy) {
				Some(host) => {
					let host = host.to_ascii_lowercase();
					domains.iter().any(|d| d.as_str() == host)
						|| domain_suffixes.iter().any(|s| host.ends_with(s.as_str()))
				},
				None => false,
			},
			RuleItem::DomainKeyword { keywords, strategy } => match ctx.domain_host(*strategy) {
				Some(host) => {
					let host = host.to_ascii_lowercase();
					keywords.iter().any(|k| host.contains(k.as_str()))
				},
				None => false,
			},
			RuleItem::DomainRegex { regexes, strategy } => match ctx.domain_host(*strategy) {
				Some(host) => regexes.iter().any(|r| r.is_match(host)),
				None => false,
			},
			RuleItem::IpCidr { cidrs, is_source } => {
				let ip = if *is_source { ctx.source_ip } else { ctx.destination_ip };
				ip.is_some_and(|ip| cidrs.iter().any(|c| c.contains(&ip)))
			},
			RuleItem::Port { ports, is_source } => {
				let port = if *is_source { ctx.source_port } else { ctx.destination_port };
				port.is_some_and(|p| ports.contains(&p))
			},
			RuleItem::PortRange { start, end, is_source } => {
				let port = if *is_source { ctx.source_port } else { ctx.destination_port };
				port.is_some_and(|p| p >= *start && p <= *end)
			},
			RuleItem::IsPrivate => ctx.is_private,
			RuleItem::ClashMode { mode } => ctx.clash_mode.as_ref().is_some_and(|m| m == mode),
			RuleItem::OutboundTag { .. } | RuleItem::RuleSet { .. } | RuleItem::Opaque { .. } => false,
		}
	}
}

/// How sub-clauses combine (§4.5): `default` ANDs item groups; `logical` combines sub-rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
	Default { items: Vec<RuleItem> },
	Logical { mode: LogicalMode, rules: Vec<RuleKind> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalMode {
	And,
	Or,
}

impl RuleKind {
	fn matches(&self, ctx: &InboundContext) -> bool {
		match self {
			RuleKind::Default { items } => items.iter().all(|i| i.matches(ctx)),
			RuleKind::Logical { mode, rules } => match mode {
				LogicalMode::And => rules.iter().all(|r| r.matches(ctx)),
				LogicalMode::Or => rules.iter().any(|r| r.matches(ctx)),
			},
		}
	}
}

/// A routing rule: a matcher tree plus the outbound tag to dispatch to (§3 "Rule").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleOptions {
	#[serde(default = "Uuid::new_v4")]
	pub id: Uuid,
	pub kind: RuleKind,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub disabled: bool,
	pub outbound: Strng,
}

impl RuleOptions {
	pub fn matches(&self, ctx: &InboundContext) -> bool {
		if self.disabled {
			return false;
		}
		let m = self.kind.matches(ctx);
		if self.invert { !m } else { m }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx_with_domain(domain: &str) -> InboundContext {
		InboundContext {
			destination_fqdn: Some(strng::new(domain)),
			..Default::default()
		}
	}

	#[test]
	fn domain_suffix_matches() {
		let item = RuleItem::Domain {
			domains: vec![],
			domain_suffixes: vec![strng::new("example.com")],
			strategy: DomainMatchStrategy::FqdnOnly,
		};
		assert!(item.matches(&ctx_with_domain("www.example.com")));
		assert!(!item.matches(&ctx_with_domain("example.net")));
	}

	#[test]
	fn invert_negates_result() {
		let rule = RuleOptions {
			id: Uuid::new_v4(),
			kind: RuleKind::Default {
				items: vec![RuleItem::IsPrivate],
			},
			invert: true,
			disabled: false,
			outbound: strng::new("direct"),
		};
		let ctx = InboundContext::default();
		assert!(rule.matches(&ctx));
	}

	#[test]
	fn disabled_rule_never_matches() {
		let rule = RuleOptions {
			id: Uuid::new_v4(),
			kind: RuleKind::Default { items: vec![] },
			invert: false,
			disabled: true,
			outbound: strng::new("direct"),
		};
		assert!(!rule.matches(&InboundContext::default()));
	}
}
