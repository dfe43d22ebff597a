//! Subscription parsers: decode fetched/loaded content into [`OutboundOptions`] (§6).
//!
//! [`parse_subscription`] tries each format in the documented order and returns the first
//! parser's output that yields at least one outbound (§4.2.2).

mod clash;
mod native;
mod raw;
mod sip008;

use base64::Engine;

use crate::outbound::OutboundOptions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("no parser recognized the subscription content")]
	NoServersFound,
}

/// Subscription quota/expiry metadata (§6 "subscription metadata line", §3 "SubInfo").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubInfo {
	pub upload: Option<i64>,
	pub download: Option<i64>,
	pub total: Option<i64>,
	pub expire: Option<i64>,
}

pub fn parse_sub_info(line: &str) -> SubInfo {
	let mut info = SubInfo::default();
	for pair in line.split(';') {
		let pair = pair.trim();
		let Some((key, value)) = pair.split_once('=') else { continue };
		let Ok(value) = value.trim().parse::<i64>() else { continue };
		match key.trim() {
			"upload" => info.upload = Some(value),
			"download" => info.download = Some(value),
			"total" => info.total = Some(value),
			"expire" => info.expire = Some(value),
			_ => {},
		}
	}
	info
}

/// Attempts base64-url decoding before each parser, matching the source's "decode, then try
/// each format" behavior (§6 "Base64-url decoding is attempted before each parser").
fn maybe_decode(content: &str) -> String {
	let trimmed = content.trim();
	match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed) {
		Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| content.to_string()),
		Err(_) => match base64::engine::general_purpose::STANDARD.decode(trimmed) {
			Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| content.to_string()),
			Err(_) => content.to_string(),
		},
	}
}

pub fn parse_subscription(content: &str) -> Result<Vec<OutboundOptions>, Error> {
	let decoded = maybe_decode(content);
	for candidate in [content, decoded.as_str()] {
		if let Ok(outbounds) = native::parse(candidate) {
			if !outbounds.is_empty() {
				return Ok(outbounds);
			}
		}
		if let Ok(outbounds) = clash::parse(candidate) {
			if !outbounds.is_empty() {
				return Ok(outbounds);
			}
		}
		if let Ok(outbounds) = sip008::parse(candidate) {
			if !outbounds.is_empty() {
				return Ok(outbounds);
			}
		}
		if let Ok(outbounds) = raw::parse(candidate) {
			if !outbounds.is_empty() {
				return Ok(outbounds);
			}
		}
	}
	Err(Error::NoServersFound)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_subscription_userinfo_line() {
		let info = parse_sub_info("upload=100;download=200;total=1000;expire=123456");
		assert_eq!(info.upload, Some(100));
		assert_eq!(info.expire, Some(123456));
	}
}
