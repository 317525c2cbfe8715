//! Volume and snapshot identifiers as persisted by the container orchestrator.
//!
//! A volume is addressed as `<configName>:<pool>/<volumeGroup>/<volumeName>` and a snapshot as
//! `<configName>:<pool>/<volumeGroup>/<volumeName>@<snapshotName>`, where `configName` selects
//! the appliance from the driver configuration.

use snafu::Snafu;
use std::{fmt, str::FromStr};

/// Identifier parsing errors.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum IdError {
    #[snafu(display("VolumeId is in wrong format: {id}"))]
    Malformed { id: String },
    #[snafu(display("SnapshotId is in wrong format: {id}"))]
    NoSnapshotName { id: String },
    #[snafu(display("Got wrong volume path: {path}"))]
    UnexpectedPath { path: String },
}

/// Number of path segments of a volume: pool, volume group and name.
const VOLUME_PATH_SEGMENTS: usize = 3;

/// The identifier of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    config_name: String,
    path: String,
}

impl VolumeId {
    pub fn new(config_name: &str, path: &str) -> Self {
        Self {
            config_name: config_name.to_string(),
            path: path.to_string(),
        }
    }
    /// The appliance configuration this volume lives on.
    pub fn config_name(&self) -> &str {
        &self.config_name
    }
    /// The volume path on the appliance.
    pub fn path(&self) -> &str {
        &self.path
    }
    /// The volume group holding the volume, for a `<pool>/<volumeGroup>/<name>` path.
    pub fn volume_group(&self) -> Result<&str, IdError> {
        if self.path.split('/').count() != VOLUME_PATH_SEGMENTS {
            return UnexpectedPath { path: &self.path }.fail();
        }
        Ok(self
            .path
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default())
    }
}

impl FromStr for VolumeId {
    type Err = IdError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let mut parts = id.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(config_name), Some(path), None) => Ok(Self::new(config_name, path)),
            _ => Malformed { id }.fail(),
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.config_name, self.path)
    }
}

/// The identifier of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    volume: VolumeId,
    name: String,
}

impl SnapshotId {
    pub fn new(volume: VolumeId, name: &str) -> Self {
        Self {
            volume,
            name: name.to_string(),
        }
    }
    /// The identifier of a snapshot given its full path on the appliance.
    pub fn from_path(config_name: &str, snapshot_path: &str) -> Self {
        let (volume, name) = snapshot_path
            .split_once('@')
            .unwrap_or((snapshot_path, ""));
        Self::new(VolumeId::new(config_name, volume), name)
    }
    /// The volume this snapshot was taken of.
    pub fn volume(&self) -> &VolumeId {
        &self.volume
    }
    /// The snapshot name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The snapshot path on the appliance, `<volume path>@<name>`.
    pub fn path(&self) -> String {
        format!("{}@{}", self.volume.path, self.name)
    }
}

impl FromStr for SnapshotId {
    type Err = IdError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let mut parts = id.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(volume), Some(name), None) => Ok(Self::new(volume.parse()?, name)),
            _ => NoSnapshotName { id }.fail(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.volume, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id() {
        let id: VolumeId = "ns-1:pool1/vg1/pvc-1".parse().unwrap();
        assert_eq!(id.config_name(), "ns-1");
        assert_eq!(id.path(), "pool1/vg1/pvc-1");
        assert_eq!(id.volume_group(), Ok("pool1/vg1"));
        assert_eq!(id.to_string(), "ns-1:pool1/vg1/pvc-1");
        assert_eq!(VolumeId::new("ns-1", "pool1/vg1/pvc-1"), id);
    }

    #[test]
    fn malformed_volume_id() {
        for id in ["", "pool1/vg1/pvc-1", "a:b:c"] {
            assert_eq!(
                id.parse::<VolumeId>(),
                Err(IdError::Malformed { id: id.to_string() })
            );
        }
        let nested: VolumeId = "ns-1:pool1/pvc-1".parse().unwrap();
        assert!(nested.volume_group().is_err());
        let deep: VolumeId = "ns-1:pool1/vg1/sub/pvc-1".parse().unwrap();
        assert!(deep.volume_group().is_err());
    }

    #[test]
    fn snapshot_id() {
        let id: SnapshotId = "ns-1:pool1/vg1/pvc-1@snap-1".parse().unwrap();
        assert_eq!(id.volume().path(), "pool1/vg1/pvc-1");
        assert_eq!(id.name(), "snap-1");
        assert_eq!(id.path(), "pool1/vg1/pvc-1@snap-1");
        assert_eq!(id.to_string(), "ns-1:pool1/vg1/pvc-1@snap-1");
        assert_eq!(SnapshotId::from_path("ns-1", "pool1/vg1/pvc-1@snap-1"), id);

        assert!(matches!(
            "ns-1:pool1/vg1/pvc-1".parse::<SnapshotId>(),
            Err(IdError::NoSnapshotName { .. })
        ));
        assert!(matches!(
            "pool1/vg1/pvc-1@snap-1".parse::<SnapshotId>(),
            Err(IdError::Malformed { .. })
        ));
    }
}
