//! SIP008 format (§6): a JSON array of Shadowsocks servers, each `{"remarks", "server", ...}`.

use serde::Deserialize;

use crate::outbound::OutboundOptions;
use fabric_core::strng;

#[derive(Deserialize)]
struct Sip008Doc {
	#[serde(default)]
	servers: Vec<Sip008Server>,
}

#[derive(Deserialize)]
struct Sip008Server {
	remarks: String,
}

pub fn parse(content: &str) -> anyhow::Result<Vec<OutboundOptions>> {
	// SIP008 is sometimes a bare array, sometimes `{"version":1,"servers":[...]}`.
	if let Ok(doc) = serde_json::from_str::<Sip008Doc>(content) {
		return Ok(to_outbounds(doc.servers));
	}
	let servers: Vec<Sip008Server> = serde_json::from_str(content)?;
	Ok(to_outbounds(servers))
}

fn to_outbounds(servers: Vec<Sip008Server>) -> Vec<OutboundOptions> {
	servers
		.into_iter()
		.map(|s| OutboundOptions::Opaque {
			tag: strng::new(s.remarks),
			kind: strng::literal("shadowsocks"),
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_bare_array() {
		let json = r#"[{"remarks":"srv","server":"1.2.3.4","server_port":443,"password":"x","method":"aes-256-gcm"}]"#;
		assert_eq!(parse(json).unwrap().len(), 1);
	}

	#[test]
	fn parses_wrapped_document() {
		let json = r#"{"version":1,"servers":[{"remarks":"srv","server":"1.2.3.4","server_port":443,"password":"x","method":"aes-256-gcm"}]}"#;
		assert_eq!(parse(json).unwrap().len(), 1);
	}
}
