use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use lloggs::{LoggingArgs, PreArgs, WorkerGuard};
use miette::{miette, Result};
use tracing::debug;

/// klaxon: alert routing, grouping, silencing, and notification dispatch
///
/// The daemon reads a YAML configuration describing routes, receivers, and
/// inhibit rules, groups incoming alerts, and dispatches notifications.
/// Send SIGHUP to reload the configuration without restarting.
#[derive(Debug, Clone, Parser)]
pub struct Args {
	#[command(flatten)]
	logging: LoggingArgs,

	/// Path to the YAML configuration file
	#[arg(long, env = "KLAXON_CONFIG", default_value = "klaxon.yml")]
	pub config: PathBuf,

	/// Directory for persisted silence/nflog snapshots
	///
	/// If omitted, silences and the notification log live in memory only
	/// and are lost on restart.
	#[arg(long, env = "KLAXON_DATA_DIR")]
	pub data_dir: Option<PathBuf>,

	/// Address the ambient status/metrics HTTP server binds to
	///
	/// Can be provided multiple times; the first address that successfully
	/// binds is used.
	#[arg(long, default_value = "[::1]:9093")]
	pub listen: Vec<SocketAddr>,
}

fn get_args() -> Result<(Args, WorkerGuard)> {
	let log_guard = PreArgs::parse().setup().map_err(|err| miette!("{err}"))?;

	debug!("parsing arguments");
	let args = Args::parse();

	let log_guard = match log_guard {
		Some(g) => g,
		None => args
			.logging
			.setup(|v| match v {
				0 => "klaxon=info",
				1 => "info,klaxon=debug",
				2 => "debug",
				3 => "debug,klaxon=trace",
				_ => "trace",
			})
			.map_err(|err| miette!("{err}"))?,
	};

	debug!(?args, "got arguments");
	Ok((args, log_guard))
}

#[tokio::main]
async fn main() -> Result<()> {
	let (args, _guard) = get_args()?;

	let mut daemon_config = klaxon::DaemonConfig::new(args.config).with_server_addrs(args.listen);
	if let Some(data_dir) = args.data_dir {
		daemon_config = daemon_config.with_data_dir(data_dir);
	}

	klaxon::run(daemon_config).await
}
