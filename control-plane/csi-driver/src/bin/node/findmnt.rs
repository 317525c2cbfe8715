use crate::error::DeviceError;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

/// findmnt executable name.
const FIND_MNT: &str = "findmnt";
/// findmnt arguments, we only want source, target and filesystem type fields.
const FIND_MNT_ARGS: [&str; 3] = ["-J", "-o", "SOURCE,TARGET,FSTYPE"];

/// A mount, as listed by findmnt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct DeviceMount {
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) fstype: String,
    #[serde(default)]
    children: Vec<DeviceMount>,
}

impl DeviceMount {
    pub(crate) fn new(source: impl Into<String>, target: impl Into<String>, fstype: &str) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: fstype.to_string(),
            children: vec![],
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindMnt {
    filesystems: Vec<DeviceMount>,
}

/// The source of a bind mount of a device is reported differently across systems, eg:
/// `udev[/sdc]` or `devtmpfs[/sdc]`, which is `/dev/sdc`.
fn adjusted_source(source: &str) -> String {
    static RE_UDEVPATH: Lazy<Option<regex::Regex>> =
        Lazy::new(|| regex::Regex::new(r".*\[(?P<device>/.*)\]").ok());
    match RE_UDEVPATH.as_ref().and_then(|re| re.captures(source)) {
        Some(caps) => format!("/dev{}", &caps["device"]),
        None => source.to_string(),
    }
}

fn find_target(mounts: &[DeviceMount], target: &str) -> Option<DeviceMount> {
    mounts.iter().find_map(|mount| {
        if mount.target == target {
            return Some(DeviceMount::new(
                adjusted_source(&mount.source),
                mount.target.as_str(),
                &mount.fstype,
            ));
        }
        find_target(&mount.children, target)
    })
}

fn parse(json: &str, target: &str) -> Result<Option<DeviceMount>, DeviceError> {
    let table: FindMnt = serde_json::from_str(json)?;
    Ok(find_target(&table.filesystems, target))
}

/// The mount whose mount point is `path`, if any.
/// A path which is merely inside a mounted filesystem is not a match.
pub(crate) async fn get_mount(path: &Path) -> Result<Option<DeviceMount>, DeviceError> {
    let output = Command::new(FIND_MNT).args(FIND_MNT_ARGS).output().await?;
    if !output.status.success() {
        return Err(DeviceError::from(String::from_utf8(output.stderr)?));
    }
    let target = path.to_string_lossy();
    parse(&String::from_utf8(output.stdout)?, target.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
   "filesystems": [
      {"source": "/dev/sda1", "target": "/", "fstype": "ext4",
         "children": [
            {"source": "/dev/sdc", "target": "/var/lib/kubelet/plugins/kubernetes.io/csi/staging/pv-1/globalmount", "fstype": "xfs"},
            {"source": "udev[/sdc]", "target": "/var/lib/kubelet/pods/p/volumes/pv-1/mount", "fstype": "xfs",
               "children": [
                  {"source": "tmpfs", "target": "/var/lib/kubelet/pods/p/volumes/pv-1/mount/tmp", "fstype": "tmpfs"}
               ]
            }
         ]
      }
   ]
}"#;

    #[test]
    fn mounts_by_target() {
        let staging = parse(
            TABLE,
            "/var/lib/kubelet/plugins/kubernetes.io/csi/staging/pv-1/globalmount",
        )
        .unwrap()
        .unwrap();
        assert_eq!(staging.source, "/dev/sdc");
        assert_eq!(staging.fstype, "xfs");

        let publish = parse(TABLE, "/var/lib/kubelet/pods/p/volumes/pv-1/mount")
            .unwrap()
            .unwrap();
        assert_eq!(publish.source, "/dev/sdc");

        assert!(parse(TABLE, "/var/lib/kubelet").unwrap().is_none());
        assert!(parse("not json", "/").is_err());
    }
}
