//! Minimal process liveness/readiness HTTP surface (§10.4), the one sliver of the management API
//! non-goal that the ambient stack still requires. Raw `hyper`, no framework: a single
//! `/healthz/ready` route that reports `fabric_core::readiness::Ready`'s pending task set.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use fabric_core::drain::DrainWatcher;
use fabric_core::prelude::*;
use fabric_core::readiness::Ready;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;

pub struct ReadinessServer {
	listener: TcpListener,
	ready: Ready,
	drain: DrainWatcher,
}

impl ReadinessServer {
	pub async fn bind(addr: SocketAddr, ready: Ready, drain: DrainWatcher) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		Ok(ReadinessServer { listener, ready, drain })
	}

	pub fn address(&self) -> SocketAddr {
		self.listener.local_addr().expect("bound listener has a local address")
	}

	pub fn spawn(self) {
		tokio::spawn(async move {
			let _drain = self.drain.clone();
			loop {
				let (stream, _) = match self.listener.accept().await {
					Ok(pair) => pair,
					Err(e) => {
						warn!(err = %e, "readiness server accept failed");
						continue;
					},
				};
				let ready = self.ready.clone();
				let drain = self.drain.clone();
				tokio::spawn(async move {
					let _drain = drain;
					let io = TokioIo::new(stream);
					let svc = service_fn(move |req| handle(req, ready.clone()));
					if let Err(e) = auto::Builder::new(TokioExecutor::new()).serve_connection(io, svc).await {
						debug!(err = %e, "readiness connection closed with error");
					}
				});
			}
		});
	}
}

async fn handle(req: Request<Incoming>, ready: Ready) -> Result<Response<Full<Bytes>>, Infallible> {
	let response = match req.uri().path() {
		"/healthz/ready" => {
			let pending = ready.pending();
			if pending.is_empty() {
				plaintext(StatusCode::OK, "ready\n".to_string())
			} else {
				let mut names: Vec<_> = pending.into_iter().collect();
				names.sort();
				plaintext(StatusCode::SERVICE_UNAVAILABLE, format!("not ready, pending: {}\n", names.join(", ")))
			}
		},
		_ => plaintext(StatusCode::NOT_FOUND, "not found\n".to_string()),
	};
	Ok(response)
}

fn plaintext(code: StatusCode, body: String) -> Response<Full<Bytes>> {
	Response::builder()
		.status(code)
		.header(hyper::header::CONTENT_TYPE, "text/plain")
		.body(Full::new(Bytes::from(body)))
		.expect("static headers and status always build a valid response")
}
