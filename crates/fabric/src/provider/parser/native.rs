//! Native format (§6): `{"outbounds": [...]}` using the project's own outbound schema, i.e.
//! exactly [`OutboundOptions`]'s own `#[serde(tag = "type")]` encoding.

use serde::Deserialize;

use crate::outbound::OutboundOptions;

#[derive(Deserialize)]
struct NativeDoc {
	outbounds: Vec<OutboundOptions>,
}

pub fn parse(content: &str) -> anyhow::Result<Vec<OutboundOptions>> {
	let doc: NativeDoc = serde_json::from_str(content)?;
	Ok(doc.outbounds)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_native_outbounds() {
		let json = r#"{"outbounds":[{"type":"direct","tag":"a"}]}"#;
		let outbounds = parse(json).unwrap();
		assert_eq!(outbounds.len(), 1);
	}
}
