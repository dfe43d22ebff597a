use std::fmt::{Display, Formatter};
use std::string::String;
use std::fmt;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_GIT_REVISION: &str = env!("FABRIC_BUILD_GIT_REVISION");
const BUILD_RUST_VERSION: &str = env!("FABRIC_BUILD_RUSTC_VERSION");
const BUILD_RUST_PROFILE: &str = env!("FABRIC_BUILD_PROFILE_NAME");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub git_revision: String,
	pub rust_version: String,
	pub build_profile: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION.to_string(),
			git_revision: BUILD_GIT_REVISION.to_string(),
			rust_version: BUILD_RUST_VERSION.to_string(),
			build_profile: BUILD_RUST_PROFILE.to_string(),
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{RustVersion:\"{}\", BuildProfile:\"{}\", Version:\"{}\", GitRevision:\"{}\"}}",
			self.rust_version, self.build_profile, self.version, self.git_revision
		)
	}
}
