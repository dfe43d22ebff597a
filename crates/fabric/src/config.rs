use std::cmp;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fabric_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::group::GroupOptions;
use crate::outbound::OutboundOptions;
use crate::provider::ProviderOptions;
use crate::rule::RuleOptions;
use crate::rule::ruleset::RuleSetOptions;
use crate::serdes;

/// Top level on-disk configuration. Deserialized via [`serdes::yamlviajson`] so that YAML and
/// JSON config files behave identically.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RawConfig {
	pub admin_addr: Option<String>,
	pub readiness_addr: Option<String>,
	pub worker_threads: Option<String>,
	pub termination_grace_period_seconds: Option<u64>,
	pub cache_dir: Option<PathBuf>,
	pub default_outbound: Option<String>,
	pub providers: Vec<ProviderOptions>,
	pub outbounds: Vec<OutboundOptions>,
	pub groups: Vec<GroupOptions>,
	pub rule_sets: Vec<RuleSetOptions>,
	pub rules: Vec<RuleOptions>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub admin_addr: SocketAddr,
	pub readiness_addr: SocketAddr,
	pub num_worker_threads: usize,
	pub termination_max_deadline: Duration,
	pub cache_dir: Option<PathBuf>,
	pub default_outbound: Option<Strng>,
	pub providers: Vec<ProviderOptions>,
	pub outbounds: Vec<OutboundOptions>,
	pub groups: Vec<GroupOptions>,
	pub rule_sets: Vec<RuleSetOptions>,
	pub rules: Vec<RuleOptions>,
}

pub fn parse_config(contents: String, filename: Option<PathBuf>) -> anyhow::Result<Config> {
	let raw: RawConfig = if contents.trim().is_empty() {
		RawConfig::default()
	} else {
		serdes::yamlviajson::from_str(&contents)?
	};

	let admin_addr = parse::<SocketAddr>("ADMIN_ADDR")?
		.or_else(|| raw.admin_addr.as_ref().and_then(|a| a.parse().ok()))
		.unwrap_or(SocketAddr::from(([127, 0, 0, 1], 15000)));
	let readiness_addr = parse::<SocketAddr>("READINESS_ADDR")?
		.or_else(|| raw.readiness_addr.as_ref().and_then(|a| a.parse().ok()))
		.unwrap_or(SocketAddr::from(([0, 0, 0, 0], 15021)));

	let grace_period = parse::<u64>("TERMINATION_GRACE_PERIOD_SECONDS")?.or(raw.termination_grace_period_seconds);
	let termination_max_deadline = match grace_period {
		Some(secs) => Duration::from_secs(cmp::max(secs.saturating_sub(1), 1)),
		None => Duration::from_secs(5),
	};

	let cache_dir = parse::<PathBuf>("FABRIC_CACHE_DIR")?.or(raw.cache_dir);

	info!(
		config_file = ?filename,
		providers = raw.providers.len(),
		outbounds = raw.outbounds.len(),
		rule_sets = raw.rule_sets.len(),
		rules = raw.rules.len(),
		"parsed configuration"
	);

	Ok(Config {
		admin_addr,
		readiness_addr,
		num_worker_threads: parse_worker_threads()?,
		termination_max_deadline,
		cache_dir,
		default_outbound: raw.default_outbound.map(strng::new),
		providers: raw.providers,
		outbounds: raw.outbounds,
		groups: raw.groups,
		rule_sets: raw.rule_sets,
		rules: raw.rules,
	})
}

pub(crate) fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {env}={val} ({})", e.to_string())),
		Err(_) => Ok(None),
	}
}

#[allow(dead_code)]
pub(crate) fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?
		.map(|ds| duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid env var {env}={ds} ({e})")))
		.transpose()
}

/// Parse worker thread configuration, supporting either a fixed count or `"NN%"` of CPU count.
fn parse_worker_threads() -> anyhow::Result<usize> {
	match parse::<String>("WORKER_THREADS")? {
		Some(value) => {
			if let Some(percent_str) = value.strip_suffix('%') {
				let percent: f64 = percent_str
					.parse()
					.map_err(|e| anyhow::anyhow!("invalid percentage: {e}"))?;
				if percent <= 0.0 || percent > 100.0 {
					anyhow::bail!("percentage must be between 0 and 100")
				}
				let cpu_count = get_cpu_count()?;
				Ok(((cpu_count as f64 * percent / 100.0).ceil() as usize).max(1))
			} else {
				value.parse::<usize>().map_err(|e| anyhow::anyhow!("invalid number: {e}"))
			}
		},
		None => get_cpu_count(),
	}
}

fn get_cpu_count() -> anyhow::Result<usize> {
	match parse::<usize>("CPU_LIMIT")? {
		Some(limit) => Ok(limit),
		None => Ok(num_cpus::get()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_has_defaults() {
		let cfg = parse_config("".to_string(), None).unwrap();
		assert_eq!(cfg.admin_addr.port(), 15000);
		assert!(cfg.providers.is_empty());
	}

	#[test]
	fn parses_minimal_provider_list() {
		let yaml = r#"
providers:
  - tag: p
    type: inline
    outbounds: []
"#;
		let cfg = parse_config(yaml.to_string(), None).unwrap();
		assert_eq!(cfg.providers.len(), 1);
	}
}
