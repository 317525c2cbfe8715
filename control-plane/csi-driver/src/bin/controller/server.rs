use crate::{config::CsiControllerConfig, controller::CsiControllerSvc};
use csi_driver::{config::ConfigStore, identity_service::CsiIdentitySvc};
use rpc::csi::{controller_server::ControllerServer, identity_server::IdentityServer};

use std::{ops::Add, sync::Arc};
use tonic::transport::Server;
use tracing::{info, warn};

pub(crate) struct CsiServer {}

impl CsiServer {
    pub(crate) async fn run(
        csi_socket: &str,
        cfg: &'static CsiControllerConfig,
        store: Arc<ConfigStore>,
    ) -> anyhow::Result<()> {
        let incoming = csi_driver::uds::incoming(csi_socket)?;

        // An unreadable config is not fatal: it can be fixed, or handed over in a request secret.
        match store.refresh(None) {
            Ok(snapshot) => info!(
                appliances = snapshot.config().nexentastor_map.len(),
                "Driver config loaded"
            ),
            Err(error) => warn!(%error, "Driver config could not be loaded"),
        }

        Server::builder()
            .timeout(cfg.io_timeout().add(std::time::Duration::from_secs(3)))
            .add_service(IdentityServer::new(CsiIdentitySvc::new(store.clone())))
            .add_service(ControllerServer::new(CsiControllerSvc::new(
                store,
                cfg.create_volume_limit(),
            )))
            .serve_with_incoming_shutdown(incoming, shutdown::Shutdown::wait())
            .await
            .map_err(|error| anyhow::anyhow!("Failed to start gRPC server: {error}"))
    }
}
