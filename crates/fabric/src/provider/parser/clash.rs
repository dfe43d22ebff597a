//! Clash format (§6): YAML with a top-level `proxies:` array; `name`/`type` select the schema.
//! Protocol-specific fields (cipher, UUID, TLS options, ...) are out of scope per the purpose
//! section's non-goals — only tag and type survive, as an [`OutboundOptions::Opaque`].

use serde::Deserialize;

use crate::outbound::OutboundOptions;
use fabric_core::strng;

#[derive(Deserialize)]
struct ClashConfig {
	#[serde(default)]
	proxies: Vec<ClashProxy>,
}

#[derive(Deserialize)]
struct ClashProxy {
	name: String,
	#[serde(rename = "type")]
	kind: String,
}

pub fn parse(content: &str) -> anyhow::Result<Vec<OutboundOptions>> {
	let config: ClashConfig = serde_yaml::from_str(content)?;
	Ok(config
		.proxies
		.into_iter()
		.map(|p| match p.kind.as_str() {
			"direct" => OutboundOptions::Direct { tag: strng::new(p.name) },
			kind => OutboundOptions::Opaque {
				tag: strng::new(p.name),
				kind: strng::new(kind),
			},
		})
		.collect())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_clash_proxies() {
		let yaml = "proxies:\n  - name: srv1\n    type: ss\n    server: 1.2.3.4\n    port: 443\n";
		let outbounds = parse(yaml).unwrap();
		assert_eq!(outbounds.len(), 1);
		assert_eq!(outbounds[0].tag().as_str(), "srv1");
	}
}
