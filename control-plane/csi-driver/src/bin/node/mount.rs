//! Utility functions for mounting and unmounting filesystems.

use std::{io::Error, path::Path};
use sys_mount::{unmount, FilesystemType, Mount, MountFlags, UnmountFlags};
use tracing::debug;

// Simple trait for checking if the readonly (ro) option
// is present in a "list" of options.
pub(crate) trait ReadOnly {
    fn readonly(&self) -> bool;
}

impl ReadOnly for [String] {
    fn readonly(&self) -> bool {
        self.iter().any(|entry| entry == "ro")
    }
}

// Split the options into the read only flag and the data string sys_mount expects.
fn parse(options: &[String]) -> (bool, String) {
    let mut list: Vec<&str> = Vec::new();
    let mut readonly: bool = false;

    for entry in options {
        match entry.as_str() {
            "ro" => readonly = true,
            "rw" => {}
            option => list.push(option),
        }
    }

    (readonly, list.join(","))
}

// Utility function used for displaying a list of options.
fn show(options: &[String]) -> String {
    let list: Vec<&str> = options
        .iter()
        .map(String::as_str)
        .filter(|value| *value != "rw")
        .collect();

    if list.is_empty() {
        return String::from("none");
    }

    list.join(",")
}

/// Mount a device to a directory (mountpoint).
pub(crate) fn filesystem_mount(
    device: &Path,
    target: &Path,
    fstype: &str,
    options: &[String],
) -> Result<(), Error> {
    let mut flags = MountFlags::empty();

    let (readonly, value) = parse(options);
    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    let builder = Mount::builder()
        .fstype(FilesystemType::Manual(fstype))
        .flags(flags);
    let builder = match value.is_empty() {
        true => builder,
        false => builder.data(&value),
    };
    builder.mount(device, target)?;

    debug!(
        "Filesystem ({}) on device {} mounted onto target {} (options: {})",
        fstype,
        device.display(),
        target.display(),
        show(options)
    );
    Ok(())
}

/// Unmount a device or a bind mount from a directory (mountpoint).
pub(crate) fn filesystem_unmount(target: &Path) -> Result<(), Error> {
    unmount(target, UnmountFlags::DETACH)?;
    debug!("Target {} unmounted", target.display());
    Ok(())
}

/// Bind mount a source directory onto a target directory, remounting it read only if the
/// options ask for it.
pub(crate) fn bind_mount(source: &Path, target: &Path, options: &[String]) -> Result<(), Error> {
    Mount::builder()
        .fstype(FilesystemType::Manual("none"))
        .flags(MountFlags::BIND)
        .mount(source, target)?;
    debug!(
        "Source {} bind mounted onto target {}",
        source.display(),
        target.display()
    );

    if options.readonly() {
        bind_remount(target, options)?;
    }
    Ok(())
}

/// Bind remount a path to modify mount options.
/// Assumes that target has already been bind mounted.
fn bind_remount(target: &Path, options: &[String]) -> Result<(), Error> {
    let mut flags = MountFlags::BIND | MountFlags::REMOUNT;

    let (readonly, value) = parse(options);
    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    let builder = Mount::builder()
        .fstype(FilesystemType::Manual("none"))
        .flags(flags);
    let builder = match value.is_empty() {
        true => builder,
        false => builder.data(&value),
    };
    builder.mount("none", target)?;

    debug!(
        "Target {} bind remounted (options: {})",
        target.display(),
        show(options)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_options() {
        let options = vec!["ro".to_string(), "noatime".to_string(), "rw".to_string()];
        assert!(options.readonly());
        assert_eq!(parse(&options), (true, "noatime".to_string()));
        assert_eq!(show(&options), "ro,noatime");
        assert_eq!(show(&["rw".to_string()]), "none");
        assert_eq!(parse(&[]), (false, String::new()));
    }
}
