//! Raw format (§6): newline-separated proxy URIs (`vmess://…`, `ss://…`, `trojan://…`, ...).
//! Scheme-specific payload decoding is out of scope (non-goal: byte-level subscription
//! reproduction); the tag comes from the URI fragment, matching the convention every listed
//! scheme shares (`scheme://...#name`).

use url::Url;

use crate::outbound::OutboundOptions;
use fabric_core::strng;

const SCHEMES: &[&str] = &["vmess", "ss", "trojan", "vless", "ssh", "anytls", "hysteria", "hysteria2"];

pub fn parse(content: &str) -> anyhow::Result<Vec<OutboundOptions>> {
	let mut outbounds = Vec::new();
	for line in content.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let Some(scheme) = SCHEMES.iter().find(|s| line.starts_with(&format!("{s}://"))) else {
			continue;
		};
		let tag = Url::parse(line)
			.ok()
			.and_then(|u| u.fragment().map(|f| f.to_string()))
			.unwrap_or_else(|| format!("{scheme}-{}", outbounds.len()));
		outbounds.push(OutboundOptions::Opaque {
			tag: strng::new(tag),
			kind: strng::new(*scheme),
		});
	}
	Ok(outbounds)
}
