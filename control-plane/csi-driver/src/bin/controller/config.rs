use anyhow::Context;
use clap::ArgMatches;
use once_cell::sync::OnceCell;
use std::{path::PathBuf, time::Duration};

static CONFIG: OnceCell<CsiControllerConfig> = OnceCell::new();

/// Global CSI Controller config.
#[derive(Debug)]
pub(crate) struct CsiControllerConfig {
    /// Path of the driver config file.
    config_path: PathBuf,
    /// Max number of CreateVolume calls in progress.
    create_volume_limit: usize,
    /// Timeout of a single gRPC request.
    io_timeout: Duration,
}

impl CsiControllerConfig {
    /// Initialize global instance of the CSI config.
    pub(crate) fn initialize(args: &ArgMatches) -> anyhow::Result<&'static Self> {
        anyhow::ensure!(
            CONFIG.get().is_none(),
            "CSI Controller config already initialized"
        );

        let config_path = args
            .get_one::<String>("config")
            .context("driver config path must be specified")?;

        let create_volume_limit = *args
            .get_one::<usize>("create-volume-limit")
            .context("create volume limit must be specified")?;
        anyhow::ensure!(
            create_volume_limit > 0,
            "create volume limit must be greater than zero"
        );

        let io_timeout = args
            .get_one::<String>("timeout")
            .context("I/O timeout must be specified")?
            .parse::<humantime::Duration>()?;

        Ok(CONFIG.get_or_init(|| Self {
            config_path: config_path.into(),
            create_volume_limit,
            io_timeout: io_timeout.into(),
        }))
    }

    /// Get the driver config file path.
    pub(crate) fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Get the max number of CreateVolume calls in progress.
    pub(crate) fn create_volume_limit(&self) -> usize {
        self.create_volume_limit
    }

    /// Get the gRPC request timeout.
    pub(crate) fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}
