//! Host block devices of attached iSCSI LUNs.
//!
//! The plugin sees the host `/dev` and `/sys` under a host root, so every device path handed to
//! or returned from this module is a host path, and is only joined to the root when accessed.

use crate::error::DeviceError;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::process::Command;
use tracing::{debug, warn};

const BLOCKDEV: &str = "blockdev";

/// The `/dev/disk/by-path` link udev creates for a LUN of an iSCSI session.
pub(crate) fn by_path(portal: &str, target: &str, lun: u32) -> PathBuf {
    let lun = match lun {
        0 ..= 255 => lun.to_string(),
        _ => format!("0x{lun:04x}000000000000"),
    };
    PathBuf::from(format!(
        "/dev/disk/by-path/ip-{portal}-iscsi-{target}-lun-{lun}"
    ))
}

/// The host filesystem, as seen from within the plugin.
#[derive(Debug, Clone)]
pub(crate) struct Host {
    root: PathBuf,
}

impl Host {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The plugin's view of a host path.
    pub(crate) fn path(&self, path: &Path) -> PathBuf {
        self.root
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// The host path of a path seen from within the plugin, eg: the source of a mount made
    /// on `<root>/dev/sdc` is `/dev/sdc`.
    pub(crate) fn relative(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Whether the host path exists, following links.
    pub(crate) async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(self.path(path)).await.is_ok()
    }

    /// Resolve a link into the device node it points to, eg: `/dev/sdc`.
    pub(crate) async fn real_device(&self, link: &Path) -> Result<PathBuf, DeviceError> {
        let resolved = tokio::fs::canonicalize(self.path(link)).await?;
        let root = tokio::fs::canonicalize(&self.root).await?;
        match resolved.strip_prefix(&root) {
            Ok(relative) => Ok(Path::new("/").join(relative)),
            Err(_) => Err(DeviceError::from(format!(
                "{} resolves to {} outside of the host root",
                link.display(),
                resolved.display()
            ))),
        }
    }

    fn scsi_device_file(&self, device: &Path, file: &str) -> Result<PathBuf, DeviceError> {
        let name = device.file_name().ok_or_else(|| {
            DeviceError::from(format!("{} is not a device", device.display()))
        })?;
        Ok(self
            .path(Path::new("/sys/block"))
            .join(name)
            .join("device")
            .join(file))
    }

    /// Take the SCSI device offline and delete it, so that the kernel forgets the LUN.
    /// A device which is already gone is fine.
    pub(crate) async fn remove_device(&self, device: &Path) -> Result<(), DeviceError> {
        for (file, value) in [("state", "offline\n"), ("delete", "1")] {
            let path = self.scsi_device_file(device, file)?;
            match tokio::fs::write(&path, value).await {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    debug!(device = %device.display(), "SCSI device already removed");
                    return Ok(());
                }
                Err(error) => {
                    return Err(DeviceError::from(format!(
                        "Failed to write '{}' to {}: {error}",
                        value.trim(),
                        path.display()
                    )))
                }
            }
        }
        debug!(device = %device.display(), "SCSI device removed");
        Ok(())
    }

    /// Ask the kernel to re-read the capacity of the SCSI device.
    /// Failures are only logged, as the capacity may already be current.
    pub(crate) async fn rescan_device(&self, device: &Path) {
        let path = match self.scsi_device_file(device, "rescan") {
            Ok(path) => path,
            Err(error) => {
                warn!(%error, "Cannot rescan device");
                return;
            }
        };
        if let Err(error) = tokio::fs::write(&path, "1").await {
            warn!(%error, path = %path.display(), "Failed to rescan device");
        }
    }
}

/// Flush the buffers of the device, which also syncs a filesystem mounted on it.
pub(crate) async fn flush_buffers(device: &Path) -> Result<(), DeviceError> {
    let output = Command::new(BLOCKDEV)
        .arg("--flushbufs")
        .arg(device)
        .output()
        .await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such") {
        debug!(device = %device.display(), "Device gone, nothing to flush");
        return Ok(());
    }
    Err(DeviceError::from(format!(
        "Failed to flush buffers of {}: {}",
        device.display(),
        stderr.trim()
    )))
}

/// The size of the device in bytes.
pub(crate) async fn size_bytes(device: &Path) -> Result<u64, DeviceError> {
    let output = Command::new(BLOCKDEV)
        .arg("--getsize64")
        .arg(device)
        .output()
        .await?;
    if !output.status.success() {
        return Err(DeviceError::from(format!(
            "Failed to get the size of {}: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8(output.stdout)?.trim().parse::<u64>()?)
}

/// The IQN of the host initiator, from an `initiatorname.iscsi` file.
pub(crate) async fn read_initiator_name(path: &Path) -> Result<String, DeviceError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|error| {
        DeviceError::from(format!(
            "Failed to read the initiator name from {}: {error}",
            path.display()
        ))
    })?;
    parse_initiator_name(&content).ok_or_else(|| {
        DeviceError::from(format!("No InitiatorName found in {}", path.display()))
    })
}

fn parse_initiator_name(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lun_links() {
        assert_eq!(
            by_path("10.0.1.1:3260", "iqn.2005-07.com.nexenta:01:csi:tg", 7),
            PathBuf::from(
                "/dev/disk/by-path/ip-10.0.1.1:3260-iscsi-iqn.2005-07.com.nexenta:01:csi:tg-lun-7"
            )
        );
        assert_eq!(
            by_path("10.0.1.1:3260", "iqn.t", 256),
            PathBuf::from("/dev/disk/by-path/ip-10.0.1.1:3260-iscsi-iqn.t-lun-0x0100000000000000")
        );
    }

    #[test]
    fn initiator_names() {
        let file = "## generated\n#InitiatorName=iqn.commented\nInitiatorName=iqn.1993-08.org.debian:01:abc\n";
        assert_eq!(
            parse_initiator_name(file).as_deref(),
            Some("iqn.1993-08.org.debian:01:abc")
        );
        assert_eq!(parse_initiator_name("InitiatorName=\n"), None);
        assert_eq!(parse_initiator_name(""), None);
    }

    #[tokio::test]
    async fn devices_under_the_host_root() {
        let root = tempfile::tempdir().unwrap();
        let host = Host::new(root.path());
        let by_path = root.path().join("dev/disk/by-path");
        std::fs::create_dir_all(&by_path).unwrap();
        std::fs::write(root.path().join("dev/sdc"), "").unwrap();
        std::os::unix::fs::symlink("../../sdc", by_path.join("ip-lun-0")).unwrap();

        let link = Path::new("/dev/disk/by-path/ip-lun-0");
        assert!(host.exists(link).await);
        assert_eq!(host.real_device(link).await.unwrap(), PathBuf::from("/dev/sdc"));
        assert!(!host.exists(Path::new("/dev/disk/by-path/ip-lun-1")).await);
        assert_eq!(host.relative(&root.path().join("dev/sdc")), PathBuf::from("/dev/sdc"));
        assert_eq!(host.relative(Path::new("/dev/sdc")), PathBuf::from("/dev/sdc"));
        assert_eq!(
            Host::new("/").relative(Path::new("/dev/sdc")),
            PathBuf::from("/dev/sdc")
        );

        let device = root.path().join("sys/block/sdc/device");
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join("state"), "running").unwrap();
        std::fs::write(device.join("delete"), "").unwrap();
        host.remove_device(Path::new("/dev/sdc")).await.unwrap();
        assert_eq!(std::fs::read_to_string(device.join("state")).unwrap(), "offline\n");
        assert_eq!(std::fs::read_to_string(device.join("delete")).unwrap(), "1");

        // already gone
        host.remove_device(Path::new("/dev/sdd")).await.unwrap();
    }

    #[tokio::test]
    async fn initiator_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initiatorname.iscsi");
        std::fs::write(&path, "InitiatorName=iqn.node-1\n").unwrap();
        assert_eq!(read_initiator_name(&path).await.unwrap(), "iqn.node-1");
        assert!(read_initiator_name(&dir.path().join("missing")).await.is_err());
    }
}
