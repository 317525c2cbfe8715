use crate::config::ConfigSnapshot;
use nexentastor::{NefError, Provider};
use std::sync::Arc;
use tonic::Status;
use tracing::{debug, warn};

/// The appliance serving a volume group.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub provider: Arc<dyn Provider>,
    pub volume_group: String,
    pub config_name: String,
}

/// Find the appliance which serves the volume group.
///
/// With a `config_name` only that appliance is queried, and the `zone`, if any, must be its
/// zone. Otherwise every appliance of the `zone` (or every appliance when no zone is requested)
/// is tried in configuration order, and the first one serving the volume group wins.
/// A missing `volume_group` is replaced by the default of the appliance being tried.
pub async fn resolve(
    snapshot: &ConfigSnapshot,
    volume_group: Option<&str>,
    zone: Option<&str>,
    config_name: Option<&str>,
) -> Result<Resolved, Status> {
    let volume_group = volume_group.filter(|v| !v.is_empty());
    let zone = zone.filter(|z| !z.is_empty());

    if let Some(config_name) = config_name.filter(|c| !c.is_empty()) {
        let appliance = snapshot.appliance(config_name).ok_or_else(|| {
            Status::not_found(format!("NexentaStor config '{config_name}' not found"))
        })?;
        if let Some(zone) = zone {
            if appliance.zone != zone {
                return Err(Status::failed_precondition(format!(
                    "requested zone [{zone}] does not match requested NexentaStor name [{config_name}]"
                )));
            }
        }
        let volume_group = volume_group.unwrap_or(&appliance.default_volume_group);
        return try_resolve(snapshot, config_name, volume_group)
            .await
            .map_err(|error| classify(volume_group, error));
    }

    let mut untrusted = None;
    for (name, appliance) in snapshot.appliances() {
        if zone.map_or(false, |zone| appliance.zone != zone) {
            continue;
        }
        let volume_group = volume_group.unwrap_or(&appliance.default_volume_group);
        match try_resolve(snapshot, name, volume_group).await {
            Ok(resolved) => return Ok(resolved),
            Err(error) if error.is_unknown_authority() => {
                warn!(config = %name, %error, "Untrusted NexentaStor certificate");
                untrusted = Some(error);
            }
            Err(error) => {
                debug!(config = %name, volume_group, %error, "Volume group not resolved");
            }
        }
    }
    match untrusted {
        Some(error) => Err(Status::unauthenticated(format!(
            "TLS certificate check error: {error}"
        ))),
        None => Err(Status::not_found(format!(
            "No nsProvider found for params: volumeGroup '{}', zone '{}'",
            volume_group.unwrap_or_default(),
            zone.unwrap_or_default()
        ))),
    }
}

async fn try_resolve(
    snapshot: &ConfigSnapshot,
    config_name: &str,
    volume_group: &str,
) -> Result<Resolved, NefError> {
    let resolver = snapshot
        .resolver(config_name)
        .ok_or_else(|| NefError::not_exist(format!("no resolver for '{config_name}'")))?;
    let provider = resolver.resolve_from_vg(volume_group).await?;
    Ok(Resolved {
        provider,
        volume_group: volume_group.to_string(),
        config_name: config_name.to_string(),
    })
}

fn classify(volume_group: &str, error: NefError) -> Status {
    if error.is_not_exist() {
        Status::not_found(error.to_string())
    } else if error.is_unknown_authority() {
        Status::unauthenticated(format!("TLS certificate check error: {error}"))
    } else {
        Status::internal(format!(
            "Cannot resolve '{volume_group}' on any NexentaStor(s): {error}"
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{tests::CONFIG, ConfigStore};
    use nexentastor::mock::{MockConnector, MockProvider};
    use std::io::Write;

    /// A config store over the test configuration, with the given appliance nodes registered.
    pub(crate) fn store(nodes: Vec<MockProvider>) -> (Arc<ConfigStore>, Vec<Arc<MockProvider>>) {
        let connector = MockConnector::default();
        let nodes = nodes
            .into_iter()
            .map(|node| connector.add(Arc::new(node)))
            .collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let (_, path) = file.keep().unwrap();
        let store = Arc::new(ConfigStore::new(path, Arc::new(connector)));
        store.refresh(None).unwrap();
        (store, nodes)
    }

    fn nodes() -> Vec<MockProvider> {
        vec![
            MockProvider::new("https://10.0.0.2:8443").with_volume_group("pool1/vg1", 1 << 40),
            MockProvider::new("https://10.0.0.3:8443")
                .with_volume_group("pool2/vg2", 1 << 40)
                .with_volume_group("pool2/shared", 1 << 40),
        ]
    }

    #[tokio::test]
    async fn by_config_name() {
        let (store, _) = store(nodes());
        let snapshot = store.current().unwrap();

        let resolved = resolve(&snapshot, None, None, Some("ns-1")).await.unwrap();
        assert_eq!(resolved.volume_group, "pool1/vg1");
        assert_eq!(resolved.config_name, "ns-1");
        assert_eq!(resolved.provider.address(), "https://10.0.0.2:8443");

        let error = resolve(&snapshot, None, Some("zone-2"), Some("ns-1"))
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::FailedPrecondition);

        let error = resolve(&snapshot, Some("pool1/none"), None, Some("ns-1"))
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::NotFound);

        let error = resolve(&snapshot, None, None, Some("ns-9")).await.unwrap_err();
        assert_eq!(error.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn first_serving_appliance() {
        let (store, _) = store(nodes());
        let snapshot = store.current().unwrap();

        let resolved = resolve(&snapshot, Some("pool2/shared"), None, None)
            .await
            .unwrap();
        assert_eq!(resolved.config_name, "ns-2");

        let resolved = resolve(&snapshot, None, Some("zone-2"), None).await.unwrap();
        assert_eq!(resolved.volume_group, "pool2/vg2");

        let error = resolve(&snapshot, Some("pool2/shared"), Some("zone-1"), None)
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn untrusted_certificate() {
        let (store, nodes) = store(nodes());
        let snapshot = store.current().unwrap();
        nodes[1].fail_all(Some(NefError::UnknownAuthority {
            address: "https://10.0.0.3:8443".into(),
            message: "x509".into(),
        }));
        let error = resolve(&snapshot, Some("pool2/vg2"), None, None)
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::Unauthenticated);

        nodes[1].fail_all(Some(NefError::appliance(500, "EIO", "boom")));
        let error = resolve(&snapshot, None, None, Some("ns-2"))
            .await
            .unwrap_err();
        assert_eq!(error.code(), tonic::Code::Internal);
    }
}
