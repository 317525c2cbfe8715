//! The open-iscsi initiator, driven through `iscsiadm`.
use crate::error::DeviceError;
use once_cell::sync::Lazy;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// The `iscsiadm` binary: `$ISCSIADM`, else the one in `PATH`.
static ISCSIADM: Lazy<String> = Lazy::new(|| {
    std::env::var("ISCSIADM")
        .ok()
        .or_else(|| {
            which::which("iscsiadm")
                .ok()
                .map(|path| path.display().to_string())
        })
        .unwrap_or_else(|| "iscsiadm".to_string())
});

/// Sessions of the node initiator with the appliance targets.
#[tonic::async_trait]
pub(crate) trait Initiator: Send + Sync + std::fmt::Debug {
    /// Discover the target behind the portal and log into it; when a session already exists,
    /// rescan it so that newly mapped LUNs show up.
    async fn login_rescan(&self, target: &str, portal: &str) -> Result<(), DeviceError>;
}

/// An `Initiator` using the host's `iscsiadm`.
#[derive(Debug, Default)]
pub(crate) struct IscsiAdm {}

fn discovery_args(portal: &str) -> Vec<&str> {
    vec!["-m", "discovery", "-t", "sendtargets", "-p", portal]
}

fn login_args<'a>(target: &'a str, portal: &'a str) -> Vec<&'a str> {
    vec!["-m", "node", "-T", target, "-p", portal, "-l"]
}

fn rescan_args<'a>(target: &'a str, portal: &'a str) -> Vec<&'a str> {
    vec!["-m", "node", "-T", target, "-p", portal, "--rescan"]
}

/// A failed login which only failed because the session is already there.
fn session_exists(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stdout).contains("already present")
        || String::from_utf8_lossy(&output.stderr).contains("already present")
}

fn describe(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    match stderr.trim() {
        "" => String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr => stderr.to_string(),
    }
}

impl IscsiAdm {
    async fn execute(args: &[&str]) -> Result<Output, DeviceError> {
        debug!(binary = %*ISCSIADM, ?args, "Executing");
        Ok(Command::new(&*ISCSIADM).args(args).output().await?)
    }
}

#[tonic::async_trait]
impl Initiator for IscsiAdm {
    async fn login_rescan(&self, target: &str, portal: &str) -> Result<(), DeviceError> {
        let output = Self::execute(&discovery_args(portal)).await?;
        if !output.status.success() {
            return Err(DeviceError::from(format!(
                "iSCSI discovery of {portal} failed: {}",
                describe(&output)
            )));
        }

        let output = Self::execute(&login_args(target, portal)).await?;
        if output.status.success() {
            info!(target, portal, "Logged into iSCSI target");
            return Ok(());
        }
        if !session_exists(&output) {
            return Err(DeviceError::login_rejected(format!(
                "Was not able to login to target {target} through {portal}: {}",
                describe(&output)
            )));
        }

        let output = Self::execute(&rescan_args(target, portal)).await?;
        if !output.status.success() {
            return Err(DeviceError::from(format!(
                "Failed to rescan the session of {target}: {}",
                describe(&output)
            )));
        }
        debug!(target, portal, "Rescanned iSCSI session");
        Ok(())
    }
}
