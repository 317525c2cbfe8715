//! This module consists of the various filesystem specific operations utility. Including creation
//! of filesystem, probing the filesystem present on a device and growing a filesystem.

use csi_driver::filesystem::FileSystem as Fs;
use once_cell::sync::Lazy;
use std::{path::Path, process::Output};
use tokio::process::Command;
use tonic::async_trait;
use tracing::{debug, trace};

/// Error type filesystem operations.
type Error = String;

/// Ext3 filesystem type.
pub(crate) struct Ext3Fs;
/// Ext4 filesystem type.
pub(crate) struct Ext4Fs;
/// XFS filesystem type.
pub(crate) struct XFs;

/// Filesystem type for csi node ops, wrapper over the parent Filesystem enum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FileSystem(Fs);

impl From<Fs> for FileSystem {
    fn from(value: Fs) -> Self {
        Self(value)
    }
}

impl AsRef<str> for FileSystem {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_ref())
    }
}

impl FileSystem {
    /// Convert the top level enumeration to specific filesystem types to access the supported
    /// operations by them.
    pub(crate) fn fs_ops(&self) -> Result<&dyn FileSystemOps, Error> {
        static EXT3FS: Ext3Fs = Ext3Fs {};
        static EXT4FS: Ext4Fs = Ext4Fs {};
        static XFS: XFs = XFs {};
        match self.0 {
            Fs::Ext3 => Ok(&EXT3FS),
            Fs::Ext4 => Ok(&EXT4FS),
            Fs::Xfs => Ok(&XFS),
            _ => Err(format!("Unsupported filesystem {self}")),
        }
    }

    /// The type of the filesystem on the device, None if blkid finds none.
    pub(crate) async fn probe(device: &Path) -> Result<Option<String>, Error> {
        let binary = "blkid";
        let output = Command::new(binary)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        // exit status 2: no recognizable signature
        if output.status.code() == Some(2) {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(format!(
                "{} command failed: {}",
                binary,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(blkid_type(&stdout))
    }
}

/// The `TYPE` of a blkid device line, eg: `/dev/sdc: UUID="..." TYPE="xfs"`.
fn blkid_type(line: &str) -> Option<String> {
    static TYPE: Lazy<Option<regex::Regex>> =
        Lazy::new(|| regex::Regex::new(r#"\bTYPE="(?P<fstype>[^"]*)""#).ok());
    TYPE.as_ref()?
        .captures(line)
        .map(|caps| caps["fstype"].to_string())
        .filter(|fstype| !fstype.is_empty())
}

#[async_trait]
pub(crate) trait FileSystemOps: Send + Sync {
    /// The fs util creating the filesystem, and its arguments up to the device.
    fn mkfs(&self) -> (&'static str, &'static [&'static str]);
    /// Create the filesystem using its fs util.
    async fn create(&self, device: &Path) -> Result<(), Error> {
        let (binary, args) = self.mkfs();
        debug!(device = %device.display(), "Executing {} {}", binary, args.join(" "));
        let output = Command::new(binary)
            .args(args)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary)
    }
    /// Grow the filesystem to the size of its device.
    async fn expand(&self, device: &Path, mount_path: &Path) -> Result<(), Error>;
}

async fn resize2fs(device: &Path) -> Result<(), Error> {
    let binary = "resize2fs";
    let output = Command::new(binary)
        .arg(device)
        .output()
        .await
        .map_err(|error| format!("failed to execute {binary}: {error}"))?;
    ack_command_output(output, binary)
}

#[async_trait]
impl FileSystemOps for Ext3Fs {
    fn mkfs(&self) -> (&'static str, &'static [&'static str]) {
        ("mkfs.ext3", &["-E", "nodiscard", "-F"])
    }

    async fn expand(&self, device: &Path, _mount_path: &Path) -> Result<(), Error> {
        resize2fs(device).await
    }
}

#[async_trait]
impl FileSystemOps for Ext4Fs {
    fn mkfs(&self) -> (&'static str, &'static [&'static str]) {
        ("mkfs.ext4", &["-E", "nodiscard", "-F"])
    }

    async fn expand(&self, device: &Path, _mount_path: &Path) -> Result<(), Error> {
        resize2fs(device).await
    }
}

#[async_trait]
impl FileSystemOps for XFs {
    fn mkfs(&self) -> (&'static str, &'static [&'static str]) {
        ("mkfs.xfs", &["-K", "-f"])
    }

    /// XFS grows through its mount point.
    async fn expand(&self, _device: &Path, mount_path: &Path) -> Result<(), Error> {
        let binary = "xfs_growfs";
        let output = Command::new(binary)
            .arg(mount_path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary)
    }
}

/// Logs the stdout and returns an error built from stderr if the command failed.
fn ack_command_output(output: Output, binary: &str) -> Result<(), Error> {
    trace!(
        "Output from {} command: {}, status code: {:?}",
        binary,
        String::from_utf8_lossy(&output.stdout),
        output.status.code()
    );

    if output.status.success() {
        return Ok(());
    }

    Err(format!(
        "{} command failed: {}",
        binary,
        String::from_utf8_lossy(&output.stderr)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_utils() {
        let xfs = FileSystem::from(Fs::Xfs);
        assert_eq!(xfs.fs_ops().unwrap().mkfs(), ("mkfs.xfs", &["-K", "-f"][..]));
        let ext4 = FileSystem::from(Fs::Ext4);
        assert_eq!(
            ext4.fs_ops().unwrap().mkfs(),
            ("mkfs.ext4", &["-E", "nodiscard", "-F"][..])
        );
        assert!(FileSystem::from(Fs::Unsupported("zfs".into()))
            .fs_ops()
            .is_err());
    }

    #[test]
    fn blkid_output() {
        assert_eq!(
            blkid_type(r#"/dev/sdc: UUID="0b1c" BLOCK_SIZE="512" TYPE="xfs""#).as_deref(),
            Some("xfs")
        );
        assert_eq!(
            blkid_type(r#"/dev/sdd: UUID="9e4f" SEC_TYPE="ext2" TYPE="ext3""#).as_deref(),
            Some("ext3")
        );
        assert_eq!(blkid_type(r#"/dev/sde: PTUUID="ab" PTTYPE="gpt""#), None);
    }
}
