// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;
use std::{env, fmt};

use once_cell::sync::Lazy;
use serde::Serializer;
use serde::ser::SerializeMap;
use thiserror::Error;
use tracing::{Event, Subscriber, field, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_core::Field;
use tracing_core::field::Visit;
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter, reload};
pub use value_bag::ValueBag;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

pub trait OptionExt<T>: Sized {
	fn display(&self) -> Option<ValueBag>
	where
		T: Display;
	fn debug(&self) -> Option<ValueBag>
	where
		T: Debug;
}

impl<T: 'static> OptionExt<T> for Option<T> {
	fn display(&self) -> Option<ValueBag>
	where
		T: Display,
	{
		self.as_ref().map(display)
	}
	fn debug(&self) -> Option<ValueBag>
	where
		T: Debug,
	{
		self.as_ref().map(debug)
	}
}

pub fn display<T: Display + 'static>(value: &T) -> ValueBag {
	ValueBag::capture_display(value)
}

pub fn debug<T: Debug + 'static>(value: &T) -> ValueBag {
	ValueBag::capture_debug(value)
}

/// A safe function to determine if a target is enabled.
/// Do NOT use `tracing::enabled!` which is broken (https://github.com/tokio-rs/tracing/issues/3345)
pub fn enabled(target: &'static str, level: &tracing::Level) -> bool {
	if let Some(handle) = LOG_HANDLE.get() {
		handle
			.with_current(|f| f.filter().would_enable(target, level))
			.unwrap_or_default()
	} else {
		false
	}
}

/// Sets up the global tracing subscriber, returning a guard that must be held for the
/// lifetime of the process to flush buffered log lines on exit.
pub fn setup_logging() -> WorkerGuard {
	Lazy::force(&APPLICATION_START_TIME);
	let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
	let use_json = env::var("LOG_FORMAT").unwrap_or_else(|_| "plain".to_string()) == "json";
	tracing_subscriber::registry()
		.with(fmt_layer(non_blocking, use_json))
		.init();
	guard
}

fn json_fmt(writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
	let format = tracing_subscriber::fmt::layer()
		.with_writer(writer)
		.event_format(FabricJsonFormat())
		.fmt_fields(FabricJsonFormat());
	Box::new(format)
}

fn plain_fmt(writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
	let format = tracing_subscriber::fmt::layer()
		.with_writer(writer)
		.event_format(FabricFormat())
		.fmt_fields(FabricFormat());
	Box::new(format)
}

fn fmt_layer(
	writer: NonBlocking,
	use_json: bool,
) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
	let format = if use_json {
		json_fmt(writer)
	} else {
		plain_fmt(writer)
	};
	let filter = default_filter();
	let (layer, reload) = reload::Layer::new(format.with_filter(filter));
	LOG_HANDLE
		.set(reload)
		.map_or_else(|_| warn!("setup log handler failed"), |_| {});
	Box::new(layer)
}

fn default_filter() -> filter::Targets {
	// DNS resolution and http client retries are noisy at info; keep them at warn unless
	// a caller explicitly overrides via RUST_LOG.
	let var: String = env::var("RUST_LOG")
		.map_err(|_| ())
		.map(|v| "reqwest=warn,hyper_util=warn,".to_string() + v.as_str())
		.unwrap_or_else(|_| "reqwest=warn,hyper_util=warn,info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Dynamically updates the logging level to *include* level. If `reset` is true, the entire
/// logging configuration is reset to the default filter before applying `level`.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	if let Some(handle) = LOG_HANDLE.get() {
		let new_directive = if let Ok(current) = handle.with_current(|f| f.filter().to_string()) {
			if reset {
				if level.is_empty() {
					default_filter().to_string()
				} else {
					format!("{},{}", default_filter(), level)
				}
			} else {
				format!("{current},{level}")
			}
		} else {
			level.to_string()
		};

		let new_filter = filter::Targets::from_str(&new_directive)?;
		info!("new log filter is {new_filter}");

		Ok(handle.modify(|layer| {
			*layer.filter_mut() = new_filter;
		})?)
	} else {
		warn!("failed to get log handle");
		Err(Error::Uninitialized)
	}
}

pub fn get_current_loglevel() -> Result<String, Error> {
	if let Some(handle) = LOG_HANDLE.get() {
		Ok(handle.with_current(|f| f.filter().to_string())?)
	} else {
		Err(Error::Uninitialized)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

struct FabricJsonFormat();
struct FabricFormat();

struct Visitor<'writer> {
	res: std::fmt::Result,
	is_empty: bool,
	writer: Writer<'writer>,
}

impl Visitor<'_> {
	fn write_padded(&mut self, value: &impl Debug) -> std::fmt::Result {
		let padding = if self.is_empty {
			self.is_empty = false;
			""
		} else {
			" "
		};
		write!(self.writer, "{padding}{value:?}")
	}
}

impl field::Visit for Visitor<'_> {
	fn record_str(&mut self, field: &field::Field, value: &str) {
		if self.res.is_err() {
			return;
		}
		self.record_debug(field, &value)
	}

	fn record_debug(&mut self, field: &field::Field, val: &dyn std::fmt::Debug) {
		self.res = match field.name() {
			name if name.starts_with("log.") => Ok(()),
			"message" => write!(self.writer, "{val:?}\t"),
			_ => self.write_padded(&format_args!("{}={:?}", field.name(), val)),
		}
	}
}

impl<'writer> FormatFields<'writer> for FabricFormat {
	fn format_fields<R: tracing_subscriber::field::RecordFields>(
		&self,
		writer: Writer<'writer>,
		fields: R,
	) -> std::fmt::Result {
		let mut visitor = Visitor {
			writer,
			res: Ok(()),
			is_empty: true,
		};
		fields.record(&mut visitor);
		visitor.res
	}
}

impl<S, N> FormatEvent<S, N> for FabricFormat
where
	S: Subscriber + for<'a> LookupSpan<'a>,
	N: for<'a> FormatFields<'a> + 'static,
{
	fn format_event(
		&self,
		ctx: &FmtContext<'_, S, N>,
		mut writer: Writer<'_>,
		event: &Event<'_>,
	) -> std::fmt::Result {
		let normalized_meta = event.normalized_metadata();
		SystemTime.format_time(&mut writer)?;
		let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
		write!(
			writer,
			"\t{}\t",
			meta.level().to_string().to_ascii_lowercase()
		)?;

		let target = meta.target();
		let target = target.strip_prefix("fabric::").unwrap_or(target);
		write!(writer, "{target}")?;

		if let Some(scope) = ctx.event_scope() {
			for span in scope.from_root() {
				write!(writer, ":{}", span.metadata().name())?;
				let ext = span.extensions();
				if let Some(fields) = &ext.get::<FormattedFields<N>>() {
					if !fields.is_empty() {
						write!(writer, "{{{fields}}}")?;
					}
				}
			}
		};
		if event.fields().any(|_| true) {
			write!(writer, "\t")?;
		}

		ctx.format_fields(writer.by_ref(), event)?;

		writeln!(writer)
	}
}

struct JsonVisitor<S: SerializeMap> {
	serializer: S,
	state: Result<(), S::Error>,
}

impl<S: SerializeMap> Visit for JsonVisitor<S> {
	fn record_bool(&mut self, field: &Field, value: bool) {
		if self.state.is_ok() {
			self.state = self.serializer.serialize_entry(field.name(), &value)
		}
	}

	fn record_i64(&mut self, field: &Field, value: i64) {
		if self.state.is_ok() {
			self.state = self.serializer.serialize_entry(field.name(), &value)
		}
	}

	fn record_u64(&mut self, field: &Field, value: u64) {
		if self.state.is_ok() {
			self.state = self.serializer.serialize_entry(field.name(), &value)
		}
	}

	fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
		if self.state.is_ok() {
			self.state = self
				.serializer
				.serialize_entry(field.name(), &format_args!("{value:?}"))
		}
	}
}

impl<'writer> FormatFields<'writer> for FabricJsonFormat {
	fn format_fields<R: tracing_subscriber::field::RecordFields>(
		&self,
		mut writer: Writer<'writer>,
		fields: R,
	) -> std::fmt::Result {
		let mut buf = Vec::new();
		let mut ser = serde_json::Serializer::new(&mut buf);
		let serializer = ser.serialize_map(None).map_err(|_| std::fmt::Error)?;
		let mut visitor = JsonVisitor {
			serializer,
			state: Ok(()),
		};
		fields.record(&mut visitor);
		visitor.state.map_err(|_| std::fmt::Error)?;
		visitor.serializer.end().map_err(|_| std::fmt::Error)?;
		write!(writer, "{}", String::from_utf8_lossy(&buf))
	}
}

impl<S, N> FormatEvent<S, N> for FabricJsonFormat
where
	S: Subscriber + for<'a> LookupSpan<'a>,
	N: for<'a> FormatFields<'a> + 'static,
{
	fn format_event(
		&self,
		ctx: &FmtContext<'_, S, N>,
		mut writer: Writer<'_>,
		event: &Event<'_>,
	) -> std::fmt::Result {
		let normalized_meta = event.normalized_metadata();
		let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
		write!(writer, "{{")?;
		write!(
			writer,
			"\"level\":\"{}\",",
			meta.level().to_string().to_ascii_lowercase()
		)?;
		write!(writer, "\"target\":\"{}\",", meta.target())?;
		write!(writer, "\"fields\":")?;
		ctx.format_fields(writer.by_ref(), event)?;
		writeln!(writer, "}}")
	}
}
