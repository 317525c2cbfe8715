use crate::{config::ConfigStore, csi_plugin_name, plugin_capabilities::plugin_capabilities};
use rpc::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, ProbeRequest, ProbeResponse,
};

use std::{collections::HashMap, sync::Arc};
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

/// The CSI identity service, shared by the controller and the node plugins.
#[derive(Debug)]
pub struct CsiIdentitySvc {
    config: Arc<ConfigStore>,
}

impl CsiIdentitySvc {
    /// Identity service whose readiness follows the given config store.
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

const CSI_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tonic::async_trait]
impl rpc::csi::identity_server::Identity for CsiIdentitySvc {
    #[instrument(skip(self))]
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!(
            "Request to get CSI plugin info, plugin: {}:{}",
            csi_plugin_name(),
            CSI_PLUGIN_VERSION,
        );
        Ok(Response::new(GetPluginInfoResponse {
            name: csi_plugin_name(),
            vendor_version: CSI_PLUGIN_VERSION.to_string(),
            // Optional manifest is empty.
            manifest: HashMap::new(),
        }))
    }

    #[instrument(skip(self))]
    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: plugin_capabilities(),
        }))
    }

    #[instrument(skip(self))]
    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        // A plugin which cannot load its config is not ready, but must not be restarted either:
        // the config secret may simply not be mounted yet.
        let ready = match self.config.refresh(None) {
            Ok(_) => true,
            Err(error) => {
                warn!(%error, "Driver config is not loaded, CSI plugin is not ready");
                self.config.current().is_some()
            }
        };

        debug!("CSI plugin ready: {}", ready);
        Ok(Response::new(ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexentastor::mock::MockConnector;
    use rpc::csi::identity_server::Identity;

    #[tokio::test]
    async fn probe_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver-config-csi.yaml");
        let store = Arc::new(ConfigStore::new(&path, Arc::new(MockConnector::default())));
        let identity = CsiIdentitySvc::new(store);

        let probe = identity.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert_eq!(probe.into_inner().ready, Some(false));

        std::fs::write(&path, crate::config::tests::CONFIG).unwrap();
        let probe = identity.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert_eq!(probe.into_inner().ready, Some(true));

        let info = identity
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "nexentastor-block-csi-driver.nexenta.com");
    }
}
