//! Bounded-concurrency HTTP probe batch (§4.1, §5 "backpressure"). Mirrors the source's
//! `batch.New(ctx, batch.WithConcurrencyNum(10))` fan-out: up to 10 probes run concurrently per
//! batch, results land in a shared [`History`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fabric_core::prelude::*;
use futures::stream::{self, StreamExt};

use super::History;

const MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ProbeTarget {
	pub tag: Strng,
}

/// Runs one probe batch against `targets`, storing successes and deleting failures in `history`.
/// Single-flight per owner: pass the same `in_flight` flag for every batch belonging to one
/// provider or group; a concurrent caller observing `true` gets an empty result immediately
/// (§4.1 "A probe batch is single-flight per provider or group").
pub async fn probe_batch(
	http: reqwest::Client,
	url: Strng,
	timeout: Duration,
	targets: Vec<ProbeTarget>,
	history: Arc<History>,
	in_flight: Arc<AtomicBool>,
) -> HashMap<Strng, u16> {
	if in_flight.swap(true, Ordering::SeqCst) {
		return HashMap::new();
	}
	let _guard = InFlightGuard(&in_flight);

	let results: Vec<Option<(Strng, u16)>> = stream::iter(targets)
		.map(|target| {
			let http = http.clone();
			let url = url.clone();
			let history = history.clone();
			async move {
				match probe_one(&http, &url, timeout).await {
					Ok(delay_ms) => {
						history.store(&target.tag, delay_ms);
						debug!(tag = %target.tag, delay_ms, "outbound available");
						Some((target.tag, delay_ms))
					},
					Err(e) => {
						history.delete(target.tag.as_str());
						debug!(tag = %target.tag, err = %e, "outbound unavailable");
						None
					},
				}
			}
		})
		.buffer_unordered(MAX_CONCURRENCY)
		.collect()
		.await;

	results.into_iter().flatten().collect()
}

async fn probe_one(http: &reqwest::Client, url: &str, timeout: Duration) -> anyhow::Result<u16> {
	let start = Instant::now();
	let resp = tokio::time::timeout(timeout, http.get(url).send()).await??;
	if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NO_CONTENT {
		anyhow::bail!("unexpected status {}", resp.status());
	}
	let elapsed = start.elapsed().as_millis();
	Ok(u16::try_from(elapsed).unwrap_or(u16::MAX))
}

struct InFlightGuard<'a>(&'a Arc<AtomicBool>);

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn concurrent_batches_are_single_flight() {
		let flag = Arc::new(AtomicBool::new(true));
		let history = Arc::new(History::new());
		let result = probe_batch(
			reqwest::Client::new(),
			strng::new("http://example.invalid"),
			DEFAULT_TIMEOUT,
			vec![ProbeTarget { tag: strng::new("a") }],
			history,
			flag,
		)
		.await;
		assert!(result.is_empty());
	}

	#[tokio::test]
	async fn failed_probe_deletes_history_entry() {
		let history = Arc::new(History::new());
		history.store(&strng::new("a"), 10);
		let flag = Arc::new(AtomicBool::new(false));
		let _ = probe_batch(
			reqwest::Client::new(),
			strng::new("http://127.0.0.1:1"),
			Duration::from_millis(200),
			vec![ProbeTarget { tag: strng::new("a") }],
			history.clone(),
			flag,
		)
		.await;
		assert!(history.get("a").is_none());
	}
}
