//! Selector group (§4.4.1): a single atomic selection, persisted to the cache store, with an
//! optional interrupt of in-flight connections on reconfiguration (§3 "Interrupt groups").

use std::sync::Arc;

use fabric_core::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Error, MemberSpec, effective_members};
use crate::cache::Store;
use crate::outbound::{self, Outbound};
use crate::provider;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorOptions {
	pub tag: Strng,
	#[serde(flatten)]
	pub members: MemberSpec,
	#[serde(default)]
	pub default: Option<Strng>,
}

pub struct Selector {
	pub tag: Strng,
	spec: MemberSpec,
	default: Option<Strng>,
	members: RwLock<Vec<Arc<Outbound>>>,
	selected: RwLock<Strng>,
	store: Arc<dyn Store>,
	/// The current "generation" token. Every connection dialed against this group's selection
	/// holds a clone; `select_outbound` cancels it and replaces it with a fresh one whenever the
	/// selection actually changes and `interrupt_exist_connections` is set, so every holder's
	/// next read/write observes the cancellation (§3 "Interrupt groups").
	generation: RwLock<CancellationToken>,
}

impl Selector {
	pub fn new(opts: SelectorOptions, store: Arc<dyn Store>, om: &outbound::Manager, pm: &provider::Manager) -> Self {
		let members = effective_members(&opts.members, om, pm);
		let initial = store
			.get_selected(opts.tag.as_str())
			.filter(|t| members.iter().any(|m| &m.tag == t))
			.or_else(|| opts.default.clone().filter(|t| members.iter().any(|m| &m.tag == t)))
			.unwrap_or_else(|| members[0].tag.clone());

		Selector {
			tag: opts.tag,
			spec: opts.members,
			default: opts.default,
			members: RwLock::new(members),
			selected: RwLock::new(initial),
			store,
			generation: RwLock::new(CancellationToken::new()),
		}
	}

	/// Recomputes the effective member list; called on every provider callback (§9 decision:
	/// unified caching behavior across Selector and LoadBalance).
	pub fn on_provider_update(&self, om: &outbound::Manager, pm: &provider::Manager) {
		let members = effective_members(&self.spec, om, pm);
		let still_valid = members.iter().any(|m| m.tag == *self.selected.read());
		*self.members.write() = members;
		if !still_valid {
			let fallback = self.members.read()[0].tag.clone();
			*self.selected.write() = fallback;
		}
	}

	pub fn now(&self) -> Arc<Outbound> {
		let tag = self.selected.read().clone();
		self.members
			.read()
			.iter()
			.find(|m| m.tag == tag)
			.cloned()
			.unwrap_or_else(|| Arc::new(Outbound::compatible()))
	}

	/// Like [`Selector::now`], but also hands back a clone of the current generation token so the
	/// caller can observe a later reselection (§3 "Interrupt groups").
	pub fn now_with_interrupt(&self) -> (Arc<Outbound>, CancellationToken) {
		(self.now(), self.generation.read().clone())
	}

	pub fn select_outbound(&self, tag: &str) -> Result<(), Error> {
		let members = self.members.read();
		if !members.iter().any(|m| m.tag.as_str() == tag) {
			return Err(Error::NotFound(strng::new(tag)));
		}
		drop(members);

		let changed = *self.selected.read() != tag;
		*self.selected.write() = strng::new(tag);
		self.store.put_selected(self.tag.as_str(), strng::new(tag));
		if changed && self.spec.interrupt_exist_connections {
			let old = std::mem::replace(&mut *self.generation.write(), CancellationToken::new());
			old.cancel();
		}
		Ok(())
	}

	pub fn default_tag(&self) -> Option<&Strng> {
		self.default.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::MemoryStore;

	fn setup() -> (Arc<outbound::Manager>, provider::Manager, Arc<dyn Store>) {
		let om = Arc::new(outbound::Manager::new());
		om.apply(
			&[
				outbound::OutboundOptions::Direct { tag: strng::new("p/a") },
				outbound::OutboundOptions::Direct { tag: strng::new("p/b") },
			],
			&[],
		);
		(om, provider::Manager::new(), MemoryStore::new())
	}

	#[test]
	fn selects_default_then_switches() {
		let (om, pm, store) = setup();
		let selector = Selector::new(
			SelectorOptions {
				tag: strng::new("sel"),
				members: MemberSpec {
					outbounds: vec![strng::new("p/a"), strng::new("p/b")],
					..Default::default()
				},
				default: Some(strng::new("p/b")),
			},
			store,
			&om,
			&pm,
		);
		assert_eq!(selector.now().tag.as_str(), "p/b");
		selector.select_outbound("p/a").unwrap();
		assert_eq!(selector.now().tag.as_str(), "p/a");
	}

	#[test]
	fn select_unknown_tag_errors() {
		let (om, pm, store) = setup();
		let selector = Selector::new(
			SelectorOptions {
				tag: strng::new("sel"),
				members: MemberSpec {
					outbounds: vec![strng::new("p/a")],
					..Default::default()
				},
				default: None,
			},
			store,
			&om,
			&pm,
		);
		assert!(selector.select_outbound("p/zzz").is_err());
	}

	#[test]
	fn generation_cancelled_only_on_change() {
		let (om, pm, store) = setup();
		let selector = Selector::new(
			SelectorOptions {
				tag: strng::new("sel"),
				members: MemberSpec {
					outbounds: vec![strng::new("p/a"), strng::new("p/b")],
					interrupt_exist_connections: true,
					..Default::default()
				},
				default: Some(strng::new("p/a")),
			},
			store,
			&om,
			&pm,
		);
		let (_, token) = selector.now_with_interrupt();
		selector.select_outbound("p/a").unwrap();
		assert!(!token.is_cancelled(), "reselecting the same tag must not cancel in-flight connections");

		selector.select_outbound("p/b").unwrap();
		assert!(token.is_cancelled(), "changing the selection must cancel holders of the old generation");

		let (_, fresh) = selector.now_with_interrupt();
		assert!(!fresh.is_cancelled());
	}

	#[test]
	fn no_interrupt_without_opt_in() {
		let (om, pm, store) = setup();
		let selector = Selector::new(
			SelectorOptions {
				tag: strng::new("sel"),
				members: MemberSpec {
					outbounds: vec![strng::new("p/a"), strng::new("p/b")],
					..Default::default()
				},
				default: Some(strng::new("p/a")),
			},
			store,
			&om,
			&pm,
		);
		let (_, token) = selector.now_with_interrupt();
		selector.select_outbound("p/b").unwrap();
		assert!(!token.is_cancelled(), "without interrupt_exist_connections the old generation must survive");
	}
}
