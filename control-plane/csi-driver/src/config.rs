//! Driver configuration: the NexentaStor appliances the driver may provision from.
//!
//! The configuration is a YAML document, read from a file or handed over as the content of a
//! CSI request secret. Every load produces an immutable [`ConfigSnapshot`] holding the parsed
//! appliances together with their resolvers. The [`ConfigStore`] swaps snapshots atomically
//! whenever the content digest changes, so readers always see one consistent snapshot.

use nexentastor::{Connector, NefError, Resolver, ResolverArgs};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};

/// Configuration errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    #[snafu(display("Cannot read config file '{}': {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Cannot parse config: {source}"))]
    Parse { source: serde_yaml::Error },
    #[snafu(display("No NexentaStor appliance is configured"))]
    NoAppliance {},
    #[snafu(display("Parameter '{field}' is missing for NexentaStor '{config_name}'"))]
    MissingField {
        config_name: String,
        field: &'static str,
    },
    #[snafu(display("Parameter '{field}' of NexentaStor '{config_name}' is invalid: '{value}'"))]
    InvalidField {
        config_name: String,
        field: &'static str,
        value: String,
    },
    #[snafu(display("Cannot create NexentaStor resolver for '{config_name}': {source}"))]
    Connect {
        config_name: String,
        source: NefError,
    },
}

/// Accepts `750` as well as `"750"`: both are octal digits.
fn octal_digits<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Digits {
        Text(String),
        Number(u64),
    }
    Ok(match Option::<Digits>::deserialize(deserializer)? {
        Some(Digits::Text(text)) if text.is_empty() => None,
        Some(Digits::Text(text)) => Some(text),
        Some(Digits::Number(number)) => Some(number.to_string()),
        None => None,
    })
}

fn enabled() -> bool {
    true
}

/// Parse octal permission digits, eg: "750".
pub fn parse_permissions(value: &str) -> Option<u32> {
    u32::from_str_radix(value, 8).ok().filter(|p| *p <= 0o7777)
}

/// The configuration of a single NexentaStor appliance.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceConfig {
    /// Management address, or a comma separated list of addresses for an HA pair.
    pub rest_ip: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub default_volume_group: String,
    #[serde(default)]
    pub default_data_ip: String,
    #[serde(default)]
    pub default_target: String,
    #[serde(default)]
    pub default_target_group: String,
    #[serde(default)]
    pub default_host_group: String,
    #[serde(default, rename = "iSCSITargetPrefix")]
    pub iscsi_target_prefix: Option<String>,
    #[serde(default, rename = "defaultISCSIPort")]
    pub default_iscsi_port: Option<u16>,
    #[serde(default)]
    pub num_of_luns_per_target: Option<u32>,
    #[serde(default)]
    pub use_chap_auth: bool,
    #[serde(default)]
    pub chap_user: String,
    #[serde(default)]
    pub chap_secret: String,
    #[serde(default, deserialize_with = "octal_digits")]
    pub mount_point_permissions: Option<String>,
    /// Spread LUNs over targets dynamically, rather than always using the configured target.
    #[serde(default = "enabled")]
    pub dynamic_target_lun_allocation: bool,
    #[serde(default = "enabled")]
    pub insecure_skip_verify: bool,
    /// Seconds to wait for the iSCSI device to appear on a node.
    #[serde(default, rename = "iSCSITimeout")]
    pub iscsi_timeout: Option<u64>,
}

impl std::fmt::Debug for ApplianceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplianceConfig")
            .field("rest_ip", &self.rest_ip)
            .field("username", &self.username)
            .field("zone", &self.zone)
            .field("default_volume_group", &self.default_volume_group)
            .field("default_data_ip", &self.default_data_ip)
            .field("default_target", &self.default_target)
            .field("default_target_group", &self.default_target_group)
            .field("default_host_group", &self.default_host_group)
            .field("use_chap_auth", &self.use_chap_auth)
            .field("chap_user", &self.chap_user)
            .field(
                "dynamic_target_lun_allocation",
                &self.dynamic_target_lun_allocation,
            )
            .finish_non_exhaustive()
    }
}

impl ApplianceConfig {
    /// Prefix of the targets managed by the driver.
    pub fn iscsi_target_prefix(&self) -> &str {
        self.iscsi_target_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(utils::DEFAULT_ISCSI_TARGET_PREFIX)
    }
    /// The iSCSI portal port.
    pub fn iscsi_port(&self) -> u16 {
        self.default_iscsi_port.unwrap_or(utils::DEFAULT_ISCSI_PORT)
    }
    /// Ceiling of LUN mappings per target.
    pub fn luns_per_target(&self) -> u32 {
        self.num_of_luns_per_target
            .unwrap_or(utils::DEFAULT_LUNS_PER_TARGET)
    }
    /// Permissions of the mount points.
    pub fn mount_point_permissions(&self) -> u32 {
        self.mount_point_permissions
            .as_deref()
            .and_then(parse_permissions)
            .unwrap_or(utils::DEFAULT_MOUNT_POINT_PERMISSIONS)
    }
    /// Time to wait for the iSCSI device to appear, if configured.
    pub fn iscsi_timeout(&self) -> Option<Duration> {
        self.iscsi_timeout.map(Duration::from_secs)
    }
    /// Resolver connection parameters.
    pub fn resolver_args(&self) -> ResolverArgs {
        ResolverArgs {
            address: self.rest_ip.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
            request_timeout: rest_timeout(utils::DEFAULT_REST_TIMEOUT),
            job_timeout: rest_timeout(utils::DEFAULT_REST_JOB_TIMEOUT),
        }
    }

    fn validate(&self, config_name: &str) -> Result<(), ConfigError> {
        let required = [
            ("restIp", &self.rest_ip),
            ("username", &self.username),
            ("password", &self.password),
            ("defaultVolumeGroup", &self.default_volume_group),
            ("defaultDataIp", &self.default_data_ip),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return MissingField {
                config_name,
                field: *field,
            }
            .fail();
        }
        if let Some(value) = &self.mount_point_permissions {
            if parse_permissions(value).is_none() {
                return InvalidField {
                    config_name,
                    field: "mountPointPermissions",
                    value,
                }
                .fail();
            }
        }
        if self.num_of_luns_per_target == Some(0) {
            return InvalidField {
                config_name,
                field: "numOfLunsPerTarget",
                value: "0",
            }
            .fail();
        }
        if self.use_chap_auth && self.chap_secret.is_empty() {
            return MissingField {
                config_name,
                field: "chapSecret",
            }
            .fail();
        }
        Ok(())
    }
}

fn rest_timeout(value: &str) -> Duration {
    value
        .parse::<humantime::Duration>()
        .map(Into::into)
        .unwrap_or(Duration::from_secs(30))
}

/// The driver configuration document.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Appliances by config name, iterated in name order.
    pub nexentastor_map: BTreeMap<String, ApplianceConfig>,
    #[serde(default)]
    pub debug: bool,
}

impl DriverConfig {
    /// Parse and validate a YAML configuration document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).context(Parse)?;
        if config.nexentastor_map.is_empty() {
            return NoAppliance {}.fail();
        }
        for (name, appliance) in &config.nexentastor_map {
            appliance.validate(name)?;
        }
        Ok(config)
    }
    /// Read a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml(&read_file(path)?)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).context(Read { path })
}

/// A loaded configuration along with the resolvers of its appliances.
#[derive(Debug)]
pub struct ConfigSnapshot {
    digest: Vec<u8>,
    config: DriverConfig,
    resolvers: BTreeMap<String, Resolver>,
}

impl ConfigSnapshot {
    fn new(
        config: DriverConfig,
        digest: Vec<u8>,
        connector: &dyn Connector,
    ) -> Result<Self, ConfigError> {
        let resolvers = config
            .nexentastor_map
            .iter()
            .map(|(name, appliance)| {
                connector
                    .connect(&appliance.resolver_args())
                    .context(Connect { config_name: name })
                    .map(|resolver| (name.clone(), resolver))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            digest,
            config,
            resolvers,
        })
    }
    /// The configuration document.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
    /// The configuration of the named appliance.
    pub fn appliance(&self, config_name: &str) -> Option<&ApplianceConfig> {
        self.config.nexentastor_map.get(config_name)
    }
    /// All appliances, in name order.
    pub fn appliances(&self) -> impl Iterator<Item = (&String, &ApplianceConfig)> {
        self.config.nexentastor_map.iter()
    }
    /// The resolver of the named appliance.
    pub fn resolver(&self, config_name: &str) -> Option<&Resolver> {
        self.resolvers.get(config_name)
    }
}

/// Holds the current configuration snapshot and reloads it when its source changes.
pub struct ConfigStore {
    path: PathBuf,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<ConfigSnapshot>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// A store for the config file at `path`; nothing is loaded until the first refresh.
    pub fn new(path: impl Into<PathBuf>, connector: Arc<dyn Connector>) -> Self {
        Self {
            path: path.into(),
            connector,
            current: RwLock::new(None),
        }
    }
    /// The current snapshot, if any was loaded.
    pub fn current(&self) -> Option<Arc<ConfigSnapshot>> {
        self.current.read().clone()
    }
    /// Get the current snapshot, reloading it first if the source content changed.
    /// The source is the request secret when given, otherwise the config file.
    pub fn refresh(&self, secret: Option<&str>) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let text = match secret {
            Some(secret) => secret.to_string(),
            None => read_file(&self.path)?,
        };
        let digest = Sha256::digest(text.as_bytes()).to_vec();
        if let Some(current) = self.current.read().as_ref() {
            if current.digest == digest {
                return Ok(current.clone());
            }
        }

        let config = DriverConfig::from_yaml(&text)?;
        let snapshot = Arc::new(ConfigSnapshot::new(config, digest, self.connector.as_ref())?);
        let mut current = self.current.write();
        match current.as_ref() {
            Some(previous) if previous.digest == snapshot.digest => return Ok(previous.clone()),
            Some(_) => info!("Config has been changed, updating..."),
            None => debug!(config = ?snapshot.config, "Config loaded"),
        }
        *current = Some(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nexentastor::mock::MockConnector;

    pub(crate) const CONFIG: &str = r#"
nexentastor_map:
  ns-1:
    restIp: https://10.0.0.1:8443,https://10.0.0.2:8443
    username: admin
    password: verysecretpassword
    zone: zone-1
    defaultVolumeGroup: pool1/vg1
    defaultDataIp: 10.0.1.1
    mountPointPermissions: 750
  ns-2:
    restIp: https://10.0.0.3:8443
    username: admin
    password: verysecretpassword
    zone: zone-2
    defaultVolumeGroup: pool2/vg2
    defaultDataIp: 10.0.1.3
    defaultISCSIPort: 3261
    numOfLunsPerTarget: 2
    mountPointPermissions: "0700"
debug: true
"#;

    #[test]
    fn parse() {
        let config = DriverConfig::from_yaml(CONFIG).unwrap();
        assert!(config.debug);
        let names = config.nexentastor_map.keys().collect::<Vec<_>>();
        assert_eq!(names, vec!["ns-1", "ns-2"]);

        let ns1 = &config.nexentastor_map["ns-1"];
        assert_eq!(ns1.iscsi_port(), utils::DEFAULT_ISCSI_PORT);
        assert_eq!(ns1.luns_per_target(), utils::DEFAULT_LUNS_PER_TARGET);
        assert_eq!(ns1.iscsi_target_prefix(), utils::DEFAULT_ISCSI_TARGET_PREFIX);
        assert_eq!(ns1.mount_point_permissions(), 0o750);
        assert!(ns1.dynamic_target_lun_allocation);
        assert!(ns1.insecure_skip_verify);
        assert_eq!(ns1.resolver_args().addresses().count(), 2);

        let ns2 = &config.nexentastor_map["ns-2"];
        assert_eq!(ns2.iscsi_port(), 3261);
        assert_eq!(ns2.luns_per_target(), 2);
        assert_eq!(ns2.mount_point_permissions(), 0o700);
    }

    #[test]
    fn validation() {
        let missing = CONFIG.replace("    defaultDataIp: 10.0.1.3\n", "");
        assert!(matches!(
            DriverConfig::from_yaml(&missing),
            Err(ConfigError::MissingField {
                field: "defaultDataIp",
                ..
            })
        ));
        let permissions = CONFIG.replace("\"0700\"", "\"abc\"");
        assert!(matches!(
            DriverConfig::from_yaml(&permissions),
            Err(ConfigError::InvalidField { .. })
        ));
        assert!(matches!(
            DriverConfig::from_yaml("nexentastor_map: {}"),
            Err(ConfigError::NoAppliance {})
        ));
        assert!(matches!(
            DriverConfig::from_yaml("nexentastor_map: ["),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn password_is_not_printed() {
        let config = DriverConfig::from_yaml(CONFIG).unwrap();
        assert!(!format!("{config:?}").contains("verysecretpassword"));
    }

    #[test]
    fn reload_on_digest_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver-config-csi.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        let store = ConfigStore::new(&path, Arc::new(MockConnector::default()));
        assert!(store.current().is_none());

        let first = store.refresh(None).unwrap();
        let same = store.refresh(None).unwrap();
        assert!(Arc::ptr_eq(&first, &same));
        assert!(first.resolver("ns-1").is_some());

        let secret = CONFIG.replace("zone-1", "zone-9");
        let changed = store.refresh(Some(&secret)).unwrap();
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_eq!(changed.appliance("ns-1").unwrap().zone, "zone-9");
        assert!(Arc::ptr_eq(&changed, &store.current().unwrap()));

        // a broken secret leaves the current snapshot in place
        assert!(store.refresh(Some("nexentastor_map: [")).is_err());
        assert!(Arc::ptr_eq(&changed, &store.current().unwrap()));
    }

    #[test]
    fn missing_file() {
        let store = ConfigStore::new("/nonexistent/config.yaml", Arc::new(MockConnector::default()));
        assert!(matches!(store.refresh(None), Err(ConfigError::Read { .. })));
    }
}
