use crate::{
    error::NefError,
    provider::Provider,
    rest::{RestArgs, RestProvider},
};

use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Connection parameters of an appliance, which may be an HA pair given as a comma separated
/// list of management addresses.
#[derive(Clone)]
pub struct ResolverArgs {
    pub address: String,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
    pub request_timeout: Duration,
    pub job_timeout: Duration,
}

impl std::fmt::Debug for ResolverArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverArgs")
            .field("address", &self.address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ResolverArgs {
    /// The individual node addresses.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.address
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

/// Finds which node of an appliance currently serves a volume group.
#[derive(Debug, Clone)]
pub struct Resolver {
    nodes: Vec<Arc<dyn Provider>>,
}

impl Resolver {
    /// A resolver with a REST provider for every address of the appliance.
    pub fn new(args: &ResolverArgs) -> Result<Self, NefError> {
        let nodes = args
            .addresses()
            .map(|address| {
                RestProvider::new(&RestArgs {
                    address: address.to_string(),
                    username: args.username.clone(),
                    password: args.password.clone(),
                    insecure_skip_verify: args.insecure_skip_verify,
                    request_timeout: args.request_timeout,
                    job_timeout: args.job_timeout,
                })
                .map(|p| Arc::new(p) as Arc<dyn Provider>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nodes })
    }
    /// A resolver over already built providers.
    pub fn from_providers(nodes: Vec<Arc<dyn Provider>>) -> Self {
        Self { nodes }
    }
    /// The provider of the first node on which the volume group exists.
    /// Errors other than "not exist" are remembered and returned if no node has it.
    pub async fn resolve_from_vg(&self, volume_group: &str) -> Result<Arc<dyn Provider>, NefError> {
        let mut failure = None;
        for node in &self.nodes {
            match node.get_volume_group(volume_group).await {
                Ok(_) => {
                    debug!(volume_group, node = node.address(), "Volume group resolved");
                    return Ok(node.clone());
                }
                Err(error) if error.is_not_exist() => {}
                Err(error) => {
                    warn!(volume_group, node = node.address(), %error, "Failed to query node");
                    failure = Some(error);
                }
            }
        }
        Err(failure.unwrap_or_else(|| NefError::NoProvider {
            volume_group: volume_group.to_string(),
            addresses: self
                .nodes
                .iter()
                .map(|n| n.address())
                .collect::<Vec<_>>()
                .join(","),
        }))
    }
}

/// Builds the resolver of an appliance.
pub trait Connector: Send + Sync {
    fn connect(&self, args: &ResolverArgs) -> Result<Resolver, NefError>;
}

/// Connects to real appliances over REST.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestConnector {}

impl Connector for RestConnector {
    fn connect(&self, args: &ResolverArgs) -> Result<Resolver, NefError> {
        Resolver::new(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    #[tokio::test]
    async fn resolves_node_serving_volume_group() {
        let a = Arc::new(MockProvider::new("https://a:8443"));
        let b = Arc::new(MockProvider::new("https://b:8443").with_volume_group("pool/vg", 100));
        let resolver = Resolver::from_providers(vec![a.clone(), b.clone()]);

        let provider = resolver.resolve_from_vg("pool/vg").await.unwrap();
        assert_eq!(provider.address(), "https://b:8443");

        let error = resolver.resolve_from_vg("pool/other").await.unwrap_err();
        assert!(error.is_not_exist());
        assert!(error.to_string().contains("https://a:8443,https://b:8443"));
    }

    #[tokio::test]
    async fn remembers_unexpected_failures() {
        let a = Arc::new(MockProvider::new("https://a:8443"));
        a.fail_all(Some(NefError::UnknownAuthority {
            address: "https://a:8443".into(),
            message: "x509: certificate signed by unknown authority".into(),
        }));
        let resolver = Resolver::from_providers(vec![a]);
        let error = resolver.resolve_from_vg("pool/vg").await.unwrap_err();
        assert!(error.is_unknown_authority());
    }

    #[test]
    fn addresses() {
        let args = ResolverArgs {
            address: "https://a:8443, https://b:8443,".into(),
            username: "admin".into(),
            password: "secret".into(),
            insecure_skip_verify: true,
            request_timeout: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1),
        };
        assert_eq!(
            args.addresses().collect::<Vec<_>>(),
            vec!["https://a:8443", "https://b:8443"]
        );
        assert!(!format!("{args:?}").contains("secret"));
        assert_eq!(Resolver::new(&args).unwrap().nodes.len(), 2);
    }
}
