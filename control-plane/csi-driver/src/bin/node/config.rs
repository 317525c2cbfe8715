use anyhow::Context;
use clap::ArgMatches;
use once_cell::sync::OnceCell;
use std::{path::PathBuf, time::Duration};

static CONFIG: OnceCell<NodeConfig> = OnceCell::new();

/// Global CSI Node config.
#[derive(Debug, Clone)]
pub(crate) struct NodeConfig {
    /// Unique name of the node, reported as the CSI node id.
    pub(crate) node_name: String,
    /// Zone advertised in the node topology.
    pub(crate) zone: Option<String>,
    /// Path of the driver config file.
    pub(crate) config_path: PathBuf,
    /// File holding the IQN of the host initiator.
    pub(crate) initiator_name_file: PathBuf,
    /// Where the host `/dev` and `/sys` are visible.
    pub(crate) host_root: PathBuf,
    /// Overrides the device wait of every appliance.
    pub(crate) iscsi_timeout: Option<Duration>,
}

impl NodeConfig {
    /// Initialize global instance of the CSI node config.
    pub(crate) fn initialize(args: &ArgMatches) -> anyhow::Result<&'static Self> {
        anyhow::ensure!(CONFIG.get().is_none(), "CSI Node config already initialized");

        let node_name = args
            .get_one::<String>("node-name")
            .context("node name must be specified")?;
        let config_path = args
            .get_one::<String>("config")
            .context("driver config path must be specified")?;
        let initiator_name_file = args
            .get_one::<String>("initiator-name-file")
            .context("initiator name file must be specified")?;
        let host_root = args
            .get_one::<String>("host-root")
            .context("host root must be specified")?;
        let iscsi_timeout = args
            .get_one::<String>("iscsi-timeout")
            .map(|timeout| timeout.parse::<humantime::Duration>())
            .transpose()
            .context("invalid iSCSI timeout")?;

        Ok(CONFIG.get_or_init(|| Self {
            node_name: node_name.clone(),
            zone: args
                .get_one::<String>("zone")
                .filter(|zone| !zone.is_empty())
                .cloned(),
            config_path: config_path.into(),
            initiator_name_file: initiator_name_file.into(),
            host_root: host_root.into(),
            iscsi_timeout: iscsi_timeout.map(Into::into),
        }))
    }
}

/// The device wait when neither the command line nor the appliance sets one.
pub(crate) fn default_iscsi_timeout() -> Duration {
    humantime::parse_duration(utils::DEFAULT_ISCSI_TIMEOUT).unwrap_or(Duration::from_secs(300))
}
