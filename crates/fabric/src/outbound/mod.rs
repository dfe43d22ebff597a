//! The outbound manager: the single owner of live outbound instances, keyed by tag.
//!
//! Outbounds are immutable once created (§3 "Outbound"). Providers and groups never hold an
//! owning reference — only the tag — so a reconfiguration can always swap an outbound instance
//! without invalidating anyone else's view, as long as they re-resolve by tag.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use fabric_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A single direct outbound's fixed options, as decoded from config or a provider's subscription
/// content. `Direct`/`Compatible` are the only two dial-capable kinds the core models; every
/// other `type` (shadowsocks, vmess, vless, trojan, ...) is out of scope per the purpose section,
/// but the tag is preserved so rules and groups can still reference it by name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundOptions {
	Direct { tag: Strng },
	Compatible { tag: Strng },
	/// Any outbound type the core does not implement dialing for; retained only so routing and
	/// grouping can reference it by tag without the fabric refusing to load the config.
	Opaque {
		tag: Strng,
		#[serde(default)]
		kind: Strng,
	},
}

impl OutboundOptions {
	pub fn tag(&self) -> &Strng {
		match self {
			OutboundOptions::Direct { tag } => tag,
			OutboundOptions::Compatible { tag } => tag,
			OutboundOptions::Opaque { tag, .. } => tag,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
	Tcp,
	Udp,
}

pub const ALL_NETWORKS: [Network; 2] = [Network::Tcp, Network::Udp];

/// The conventional synthetic outbound used as a safe fallback whenever a group's effective
/// member list would otherwise be empty (§3, §4.4).
pub const COMPATIBLE_TAG: &str = "COMPATIBLE";

/// A live, immutable outbound instance. Dial implementations for real proxy protocols are out of
/// scope (§1); `Direct`/`Compatible` get a minimal real TCP dial (`dial_tcp`) so the router can
/// exercise §3's "Interrupt groups" end-to-end, but nothing here ever encapsulates traffic for a
/// remote protocol.
#[derive(Debug, Clone)]
pub struct Outbound {
	pub tag: Strng,
	pub networks: &'static [Network],
	pub kind: Strng,
}

impl Outbound {
	fn from_options(opts: &OutboundOptions) -> Self {
		match opts {
			OutboundOptions::Direct { tag } => Outbound {
				tag: tag.clone(),
				networks: &ALL_NETWORKS,
				kind: strng::literal("direct"),
			},
			OutboundOptions::Compatible { tag } => Outbound {
				tag: tag.clone(),
				networks: &ALL_NETWORKS,
				kind: strng::literal("compatible"),
			},
			OutboundOptions::Opaque { tag, kind } => Outbound {
				tag: tag.clone(),
				networks: &ALL_NETWORKS,
				kind: kind.clone(),
			},
		}
	}

	pub fn compatible() -> Self {
		Outbound {
			tag: strng::new(COMPATIBLE_TAG),
			networks: &ALL_NETWORKS,
			kind: strng::literal("compatible"),
		}
	}

	pub fn supports(&self, network: Network) -> bool {
		self.networks.contains(&network)
	}

	/// Dials `addr` directly, racing the connect against `interrupt` (§3 "Interrupt groups", S6).
	/// Only `direct`/`compatible` kinds are dial-capable; everything else (including opaque
	/// proxy-protocol outbounds) refuses with `ErrorKind::Unsupported` rather than pretending to
	/// dial a protocol this fabric doesn't implement. The destination comes from the inbound
	/// connection's own target, never from outbound config, matching how direct dialing has no
	/// notion of a configured remote address.
	pub async fn dial_tcp(&self, addr: SocketAddr, interrupt: CancellationToken) -> io::Result<InterruptibleStream<TcpStream>> {
		if self.kind.as_str() != "direct" && self.kind.as_str() != "compatible" {
			return Err(io::Error::new(
				io::ErrorKind::Unsupported,
				format!("outbound {} ({}) has no dial implementation", self.tag, self.kind),
			));
		}
		tokio::select! {
			biased;
			_ = interrupt.cancelled() => Err(io::Error::new(
				io::ErrorKind::ConnectionAborted,
				"outbound selection changed before connect completed",
			)),
			result = TcpStream::connect(addr) => result.map(|stream| InterruptibleStream::new(stream, interrupt)),
		}
	}
}

/// Wraps a stream so that once `interrupt` is cancelled, every subsequent read fails with
/// `ConnectionAborted` (§3 "Interrupt groups" — tearing down in-flight connections whose group
/// reselected). Only reads observe cancellation; writes pass through untouched so a caller can
/// still flush a final response after the read side is torn down.
#[derive(Debug)]
pub struct InterruptibleStream<S> {
	inner: S,
	interrupt: CancellationToken,
}

impl<S> InterruptibleStream<S> {
	pub fn new(inner: S, interrupt: CancellationToken) -> Self {
		InterruptibleStream { inner, interrupt }
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for InterruptibleStream<S> {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		if self.interrupt.is_cancelled() {
			return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "outbound selection changed")));
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InterruptibleStream<S> {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("outbound not found: {0}")]
	NotFound(Strng),
	#[error("duplicate outbound tag: {0}")]
	Duplicate(Strng),
}

/// Registry of live outbounds. Writes take the write lock to build a new snapshot map and then
/// swap it in; reads are lock-free against an immutable snapshot (§5 "OutboundManager").
#[derive(Default)]
pub struct Manager {
	snapshot: ArcSwap<HashMap<Strng, Arc<Outbound>>>,
}

impl Manager {
	pub fn new() -> Self {
		Manager {
			snapshot: ArcSwap::from_pointee(HashMap::new()),
		}
	}

	pub fn get(&self, tag: &str) -> Option<Arc<Outbound>> {
		self.snapshot.load().get(tag).cloned()
	}

	pub fn contains(&self, tag: &str) -> bool {
		self.snapshot.load().contains_key(tag)
	}

	/// Create or replace a set of outbounds in one atomic swap. `created` lists the final
	/// options that must exist after this call, `removed` the tags to drop. Recreating an
	/// existing tag with unchanged options is still a fresh instance — callers (the provider
	/// update path) are responsible for only including tags whose options actually changed.
	pub fn apply(&self, created: &[OutboundOptions], removed: &[Strng]) {
		let mut next = (**self.snapshot.load()).clone();
		for tag in removed {
			next.remove(tag.as_str());
		}
		for opts in created {
			let outbound = Outbound::from_options(opts);
			next.insert(outbound.tag.clone(), Arc::new(outbound));
		}
		self.snapshot.store(Arc::new(next));
		debug!(count = next_len(&self.snapshot), "outbound manager snapshot updated");
	}

	pub fn remove(&self, tags: &[Strng]) {
		let mut next = (**self.snapshot.load()).clone();
		for tag in tags {
			next.remove(tag.as_str());
		}
		self.snapshot.store(Arc::new(next));
	}

	pub fn tags(&self) -> Vec<Strng> {
		self.snapshot.load().keys().cloned().collect()
	}
}

fn next_len(snapshot: &ArcSwap<HashMap<Strng, Arc<Outbound>>>) -> usize {
	snapshot.load().len()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn apply_then_get() {
		let mgr = Manager::new();
		mgr.apply(&[OutboundOptions::Direct { tag: strng::new("a") }], &[]);
		assert!(mgr.get("a").is_some());
		assert!(mgr.get("b").is_none());
	}

	#[test]
	fn remove_drops_tag() {
		let mgr = Manager::new();
		mgr.apply(&[OutboundOptions::Direct { tag: strng::new("a") }], &[]);
		mgr.remove(&[strng::new("a")]);
		assert!(mgr.get("a").is_none());
	}

	#[test]
	fn idempotent_apply_of_same_options_keeps_tag() {
		let mgr = Manager::new();
		let opts = OutboundOptions::Direct { tag: strng::new("a") };
		mgr.apply(&[opts.clone()], &[]);
		mgr.apply(&[opts], &[]);
		assert!(mgr.get("a").is_some());
		assert_eq!(mgr.tags().len(), 1);
	}

	#[tokio::test]
	async fn dial_refuses_unsupported_kinds() {
		let outbound = Outbound::from_options(&OutboundOptions::Opaque {
			tag: strng::new("vmess-1"),
			kind: strng::literal("vmess"),
		});
		let err = outbound
			.dial_tcp("127.0.0.1:1".parse().unwrap(), CancellationToken::new())
			.await
			.unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::Unsupported);
	}

	/// S6: an in-flight stream's read must fail once the owning group reselects away from it.
	#[tokio::test]
	async fn interrupted_stream_read_fails_after_cancellation() {
		use tokio::io::AsyncReadExt;
		use tokio::net::TcpListener;

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut server, _) = listener.accept().await.unwrap();
			tokio::io::AsyncWriteExt::write_all(&mut server, b"hello").await.unwrap();
			std::future::pending::<()>().await;
		});

		let outbound = Outbound {
			tag: strng::new("direct"),
			networks: &ALL_NETWORKS,
			kind: strng::literal("direct"),
		};
		let interrupt = CancellationToken::new();
		let mut stream = outbound.dial_tcp(addr, interrupt.clone()).await.unwrap();

		let mut buf = [0u8; 5];
		stream.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		interrupt.cancel();
		let mut next = [0u8; 1];
		let err = stream.read(&mut next).await.unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
	}
}
