use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A volume group, the container under which volumes are created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroup {
    pub path: String,
    #[serde(default)]
    pub bytes_available: u64,
    #[serde(default)]
    pub bytes_used: u64,
}

/// A block volume (zvol) exported over iSCSI.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub path: String,
    pub volume_size: u64,
}

impl Volume {
    /// The last path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// A snapshot of a volume, addressed as `<volume path>@<name>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub path: String,
    pub name: String,
    pub parent: String,
    pub creation_time: DateTime<Utc>,
}

/// The binding which exposes a volume as a numbered LUN to a host group via a target group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LunMapping {
    pub id: String,
    pub volume: String,
    pub target_group: String,
    pub host_group: String,
    pub lun: u32,
}

/// An iSCSI portal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub address: String,
    pub port: u16,
}

impl std::fmt::Display for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// An iSCSI target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IscsiTarget {
    pub name: String,
    #[serde(default = "no_authentication")]
    pub authentication: String,
    #[serde(default)]
    pub portals: Vec<Portal>,
}

fn no_authentication() -> String {
    "none".to_string()
}

/// A named set of targets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetGroup {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// A named set of initiators.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostGroup {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// The appliance record of a remote iSCSI initiator, carrying its CHAP credentials.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInitiator {
    pub name: String,
    #[serde(default)]
    pub chap_user: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeParams {
    pub path: String,
    pub volume_size: u64,
    pub sparse_volume: bool,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVolumeParams {
    pub volume_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyVolumeParams {
    /// Destroy the snapshots of the volume as well.
    pub destroy_snapshots: bool,
    /// Promote the most recent clone so that it survives the removal of its origin.
    pub promote_most_recent_clone_if_exists: bool,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CloneSnapshotParams {
    pub target_path: String,
}

/// Filter applied when listing LUN mappings; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LunMappingFilter {
    pub volume: Option<String>,
    pub target_group: Option<String>,
    pub host_group: Option<String>,
}

impl LunMappingFilter {
    pub fn volume(volume: &str) -> Self {
        Self {
            volume: Some(volume.to_string()),
            ..Default::default()
        }
    }
    pub fn target_group(target_group: &str) -> Self {
        Self {
            target_group: Some(target_group.to_string()),
            ..Default::default()
        }
    }
    /// Whether the given mapping passes this filter.
    pub fn matches(&self, mapping: &LunMapping) -> bool {
        let check = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        check(&self.volume, &mapping.volume)
            && check(&self.target_group, &mapping.target_group)
            && check(&self.host_group, &mapping.host_group)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateLunMappingParams {
    pub volume: String,
    pub target_group: String,
    pub host_group: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct CreateIscsiTargetParams {
    pub name: String,
    pub portals: Vec<Portal>,
}

#[derive(Serialize, Debug, Clone)]
pub struct UpdateIscsiTargetParams {
    pub authentication: String,
}

/// Create (or replace the members of) a target group or a host group.
#[derive(Serialize, Debug, Clone)]
pub struct GroupParams {
    pub name: String,
    pub members: Vec<String>,
}

/// CHAP credentials of a remote initiator.
#[derive(Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChapCredentials {
    pub chap_user: String,
    pub chap_secret: String,
}

impl std::fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("chap_user", &self.chap_user)
            .finish_non_exhaustive()
    }
}
