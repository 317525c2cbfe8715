//! NexentaStor block CSI node plugin.
//!
//! Implementation of the CSI node and identity services: mapping volumes to the node, attaching
//! them over iSCSI and staging them as block devices or filesystems.

use crate::{config::NodeConfig, iscsiadm::IscsiAdm, mounter::SystemMounter, node::Node};
use clap::{Arg, ArgMatches};
use csi_driver::{
    config::{ConfigStore, DriverConfig},
    csi::{identity_server::IdentityServer, node_server::NodeServer},
    identity_service::CsiIdentitySvc,
};
use nexentastor::RestConnector;
use std::{path::Path, sync::Arc};
use tonic::transport::Server;
use tracing::{error, info, warn};
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

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
        .init("csi-node");
}

pub(super) async fn main() -> anyhow::Result<()> {
    let matches = clap::Command::new(env!("CARGO_PKG_NAME"))
        .about("NexentaStor block CSI node plugin")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("csi-socket")
                .short('c')
                .long("csi-socket")
                .value_name("PATH")
                .env("CSI_SOCKET")
                .default_value(utils::CSI_NODE_SOCKET)
                .help("CSI gRPC listen socket"),
        )
        .arg(
            Arg::new("node-name")
                .short('n')
                .long("node-name")
                .value_name("NAME")
                .env("NODE_NAME")
                .help("Unique node name where this instance runs")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .env("DRIVER_CONFIG")
                .default_value(utils::DEFAULT_DRIVER_CONFIG)
                .help("Path of the driver config file"),
        )
        .arg(
            Arg::new("initiator-name-file")
                .long("initiator-name-file")
                .value_name("PATH")
                .default_value(utils::DEFAULT_INITIATOR_NAME_FILE)
                .help("File holding the IQN of the host iSCSI initiator"),
        )
        .arg(
            Arg::new("host-root")
                .long("host-root")
                .value_name("PATH")
                .env("HOST_ROOT")
                .default_value("/")
                .help("Where the host /dev and /sys are visible"),
        )
        .arg(
            Arg::new("zone")
                .long("zone")
                .env("NODE_ZONE")
                .help("Zone advertised in the node topology"),
        )
        .arg(
            Arg::new("iscsi-timeout")
                .long("iscsi-timeout")
                .value_name("DURATION")
                .help("Time to wait for an iSCSI device to appear, overriding the driver config"),
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

    initialize_tracing(&matches);
    let cfg = NodeConfig::initialize(&matches)?;

    info!(
        node.name = %cfg.node_name,
        config = %cfg.config_path.display(),
        "Starting NexentaStor CSI Node"
    );

    let csi_socket = matches
        .get_one::<String>("csi-socket")
        .map(String::as_str)
        .unwrap_or(utils::CSI_NODE_SOCKET);
    let store = Arc::new(ConfigStore::new(
        &cfg.config_path,
        Arc::new(RestConnector::default()),
    ));
    CsiServer::run(csi_socket, cfg, store).await
}

struct CsiServer {}

impl CsiServer {
    async fn run(
        csi_socket: &str,
        cfg: &'static NodeConfig,
        store: Arc<ConfigStore>,
    ) -> anyhow::Result<()> {
        let incoming = csi_driver::uds::incoming(csi_socket)?;

        // An unreadable config is not fatal: it can be fixed, or handed over in a request secret.
        if let Err(error) = store.refresh(None) {
            warn!(%error, "Driver config could not be loaded");
        }

        let node = Node::new(
            cfg.clone(),
            store.clone(),
            Arc::new(IscsiAdm::default()),
            Arc::new(SystemMounter::default()),
        );
        Server::builder()
            .add_service(NodeServer::new(node))
            .add_service(IdentityServer::new(CsiIdentitySvc::new(store)))
            .serve_with_incoming_shutdown(incoming, shutdown::Shutdown::wait())
            .await
            .map_err(|error| {
                error!(%error, "CsiServer failed");
                error.into()
            })
    }
}
