use std::path::PathBuf;

use clap::Parser;
use fabric::config;
use fabric_core::version;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	#[arg(long, value_name = "validate-only")]
	validate_only: bool,

	/// Print version (as a simple version string)
	#[arg(short = 'V', value_name = "version")]
	version_short: bool,

	/// Print version (as JSON)
	#[arg(long = "version")]
	version_long: bool,
}

fn main() -> anyhow::Result<()> {
	let _log_flush = fabric_core::telemetry::setup_logging();

	let args = Args::parse();
	let Args {
		config,
		file,
		validate_only,
		version_short,
		version_long,
	} = args;

	if version_short {
		println!("{}", version::BuildInfo::new().version);
		return Ok(());
	}
	if version_long {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.unwrap()
		.block_on(async move {
			let (contents, filename) = match (config, file) {
				(Some(_), Some(_)) => {
					anyhow::bail!("only one of --config or --file")
				},
				(Some(config), None) => (config, None),
				(None, Some(file)) => {
					let contents = fs_err::tokio::read_to_string(&file).await?;
					(contents, Some(file))
				},
				(None, None) => ("{}".to_string(), None),
			};
			let cfg = config::parse_config(contents, filename)?;
			if validate_only {
				println!("Configuration is valid!");
				return Ok(());
			}
			run(cfg).await
		})
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
	info!("version: {}", version::BuildInfo::new());
	fabric::app::run(cfg).await?.wait_termination().await
}
