use clap::{Arg, ArgMatches};
use csi_driver::config::{ConfigStore, DriverConfig};
use nexentastor::RestConnector;
use std::{path::Path, sync::Arc};
use tracing::info;
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

mod config;
mod controller;
mod server;

use config::CsiControllerConfig;

/// Initialize the tracing subscriber; a `debug` driver config raises the default level.
fn initialize_tracing(args: &ArgMatches) {
    let debug = args
        .get_one::<String>("config")
        .and_then(|path| DriverConfig::from_file(Path::new(path)).ok())
        .map_or(false, |config| config.debug);
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stdout)
        .with_style(*args.get_one::<FmtStyle>("fmt-style").unwrap_or(&FmtStyle::Pretty))
        .with_colours(*args.get_one::<bool>("ansi-colours").unwrap_or(&true))
        .with_default_level(match debug {
            true => tracing::Level::DEBUG,
            false => tracing::Level::INFO,
        })
        .init("csi-controller");
}

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let args = clap::Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("NexentaStor block CSI controller plugin")
        .arg(
            Arg::new("socket")
                .long("csi-socket")
                .short('c')
                .env("CSI_SOCKET")
                .default_value(utils::CSI_CONTROLLER_SOCKET)
                .help("CSI socket path"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .env("DRIVER_CONFIG")
                .default_value(utils::DEFAULT_DRIVER_CONFIG)
                .help("Path of the driver config file"),
        )
        .arg(
            Arg::new("create-volume-limit")
                .long("create-volume-limit")
                .env("CREATE_VOLUME_LIMIT")
                .value_parser(clap::value_parser!(usize))
                .default_value("10")
                .help("Max number of CreateVolume calls in progress"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .env("REQUEST_TIMEOUT")
                .default_value("120s")
                .help("Timeout of a single CSI request"),
        )
        .arg(
            Arg::new("fmt-style")
                .long("fmt-style")
                .env("FMT_STYLE")
                .value_parser(clap::value_parser!(FmtStyle))
                .default_value("pretty")
                .help("Formatting style to be used while logging"),
        )
        .arg(
            Arg::new("ansi-colours")
                .long("ansi-colours")
                .env("ANSI_COLOURS")
                .value_parser(clap::value_parser!(bool))
                .default_value("true")
                .help("Use ANSI colors for the logs"),
        )
        .get_matches();

    initialize_tracing(&args);
    let cfg = CsiControllerConfig::initialize(&args)?;

    info!(
        config = %cfg.config_path().display(),
        "Starting NexentaStor CSI Controller"
    );

    let store = Arc::new(ConfigStore::new(
        cfg.config_path(),
        Arc::new(RestConnector::default()),
    ));
    let socket = args
        .get_one::<String>("socket")
        .map(String::as_str)
        .unwrap_or(utils::CSI_CONTROLLER_SOCKET);
    server::CsiServer::run(socket, cfg, store).await
}
