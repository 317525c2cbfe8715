//! Utility function for formatting a device with filesystem
use crate::filesystem_ops::FileSystem;
use csi_driver::retry::RetryPolicy;

use std::path::Path;
use tonic::Status;
use tracing::{debug, info, warn};

/// Prepare the filesystem before mount: a blank device is formatted, a device formatted with
/// the requested filesystem is left alone, and any other filesystem is refused.
pub(crate) async fn prepare_device(fstype: &FileSystem, device: &Path) -> Result<(), Status> {
    debug!("Probing device {}", device.display());
    let existing = FileSystem::probe(device).await.map_err(|error| {
        Status::internal(format!("Failed to probe device {}: {error}", device.display()))
    })?;

    match existing {
        Some(existing) if existing == fstype.as_ref() => {
            debug!("Found existing filesystem ({}) on device {}", existing, device.display());
            Ok(())
        }
        Some(existing) => Err(Status::failed_precondition(format!(
            "Volume {} is already formatted in {existing}, requested: {fstype}",
            device.display()
        ))),
        None => {
            let fs_ops = fstype.fs_ops().map_err(Status::invalid_argument)?;
            debug!("Creating new filesystem ({}) on device {}", fstype, device.display());
            let policy = RetryPolicy::format();
            policy
                .retry(|attempt| async move {
                    fs_ops.create(device).await.map_err(|error| {
                        warn!(attempt, %error, "Format failed");
                        error
                    })
                })
                .await
                .map_err(|error| {
                    Status::internal(format!(
                        "Could not format device {} in {}: {error}",
                        device.display(),
                        humantime::format_duration(policy.deadline())
                    ))
                })?;
            info!("Device {} formatted with {}", device.display(), fstype);
            Ok(())
        }
    }
}
