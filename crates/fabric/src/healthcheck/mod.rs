//! Probe runner and URL-test history (§4.1). Shared by providers (as a health check) and groups
//! (as a URL test): both ultimately call [`probe_batch`] and read results from [`History`].

pub mod history;
pub mod probe;

pub use history::History;
pub use probe::{probe_batch, ProbeTarget};
