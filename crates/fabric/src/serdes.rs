use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serializer};

/// serde_yaml represents things differently than just "JSON in YAML format". We don't want
/// that divergence visible to callers, so we transcode YAML through JSON.
pub mod yamlviajson {
	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> serde::de::Deserialize<'de>,
	{
		let json: serde_json::Value = serde_yaml_to_json(s)?;
		Ok(serde_json::from_value(json)?)
	}

	pub fn to_string<T>(value: &T) -> anyhow::Result<String>
	where
		T: ?Sized + serde::ser::Serialize,
	{
		let json = serde_json::to_value(value)?;
		Ok(serde_yaml::to_string(&json)?)
	}

	fn serde_yaml_to_json(s: &str) -> anyhow::Result<serde_json::Value> {
		let yaml: serde_yaml::Value = serde_yaml::from_str(s)?;
		Ok(serde_json::to_value(yaml)?)
	}
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_dur {
	pub use duration_str::deserialize_duration as deserialize;
	use duration_str::HumanFormat;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	pub use duration_str::deserialize_option_duration as deserialize;
	use duration_str::HumanFormat;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

pub fn ser_display<S: Serializer, T: Display>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&t.to_string())
}

/// A value loaded either inline from config, from a local file, or a URL, matching the three
/// source kinds a provider or rule-set may be defined with.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case", untagged)]
pub enum FileOrInline {
	File { file: PathBuf },
	Inline(String),
}

impl FileOrInline {
	pub fn load(&self) -> std::io::Result<String> {
		match self {
			FileOrInline::File { file } => fs_err::read_to_string(file),
			FileOrInline::Inline(s) => Ok(s.clone()),
		}
	}
}

pub fn de_parse<'de: 'a, 'a, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: TryFrom<&'a str>,
	<T as TryFrom<&'a str>>::Error: Display,
{
	let s: &'a str = <&str>::deserialize(deserializer)?;
	T::try_from(s).map_err(serde::de::Error::custom)
}
