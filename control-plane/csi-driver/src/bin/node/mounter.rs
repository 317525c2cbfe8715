//! The mount table and the mount operations of the host, behind a trait so that the staging
//! state machine can run against a fake host.

use crate::{
    dev,
    error::DeviceError,
    filesystem_ops::FileSystem,
    findmnt::{self, DeviceMount},
    format::prepare_device,
    mount,
};
use std::{io, path::Path};
use tonic::Status;

/// Mount operations on host devices and paths.
#[tonic::async_trait]
pub(crate) trait Mounter: Send + Sync + std::fmt::Debug {
    /// The mount whose mount point is `path`, if any.
    async fn get_mount(&self, path: &Path) -> Result<Option<DeviceMount>, DeviceError>;
    /// Make sure the device holds a filesystem of the given type, formatting a blank device.
    async fn prepare(&self, fstype: &FileSystem, device: &Path) -> Result<(), Status>;
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<(), io::Error>;
    fn bind_mount(&self, source: &Path, target: &Path, options: &[String])
        -> Result<(), io::Error>;
    fn unmount(&self, target: &Path) -> Result<(), io::Error>;
    /// Flush the buffers of the device, syncing a filesystem mounted on it.
    async fn flush(&self, device: &Path) -> Result<(), DeviceError>;
}

/// The mounts of the system the plugin runs on.
#[derive(Debug, Default)]
pub(crate) struct SystemMounter {}

#[tonic::async_trait]
impl Mounter for SystemMounter {
    async fn get_mount(&self, path: &Path) -> Result<Option<DeviceMount>, DeviceError> {
        findmnt::get_mount(path).await
    }
    async fn prepare(&self, fstype: &FileSystem, device: &Path) -> Result<(), Status> {
        prepare_device(fstype, device).await
    }
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<(), io::Error> {
        mount::filesystem_mount(device, target, fstype, options)
    }
    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        options: &[String],
    ) -> Result<(), io::Error> {
        mount::bind_mount(source, target, options)
    }
    fn unmount(&self, target: &Path) -> Result<(), io::Error> {
        mount::filesystem_unmount(target)
    }
    async fn flush(&self, device: &Path) -> Result<(), DeviceError> {
        dev::flush_buffers(device).await
    }
}
