use crate::config::{parse_permissions, ApplianceConfig};
use nexentastor::ChapCredentials;
use std::{
    collections::HashMap,
    num::ParseIntError,
    str::{FromStr, ParseBoolError},
};
use strum_macros::{AsRefStr, Display, EnumString};

/// The StorageClass parameters of a volume.
#[derive(AsRefStr, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameters {
    #[strum(serialize = "volumeGroup")]
    VolumeGroup,
    #[strum(serialize = "configName")]
    ConfigName,
    #[strum(serialize = "sparseVolume")]
    SparseVolume,
    #[strum(serialize = "dataIP")]
    DataIp,
    #[strum(serialize = "target")]
    Target,
    #[strum(serialize = "hostGroup")]
    HostGroup,
    #[strum(serialize = "iSCSIPort")]
    IscsiPort,
    #[strum(serialize = "targetGroup")]
    TargetGroup,
    #[strum(serialize = "iSCSITargetPrefix")]
    IscsiTargetPrefix,
    #[strum(serialize = "numOfLunsPerTarget")]
    LunsPerTarget,
    #[strum(serialize = "useChapAuth")]
    UseChapAuth,
    #[strum(serialize = "chapUser")]
    ChapUser,
    #[strum(serialize = "chapSecret")]
    ChapSecret,
    #[strum(serialize = "mountPointPermissions")]
    MountPointPermissions,
}
impl Parameters {
    fn parse_bool(value: Option<&String>) -> Result<Option<bool>, ParseBoolError> {
        Ok(match value {
            Some(value) => value.parse::<bool>().map(Some)?,
            None => None,
        })
    }
    fn parse_u32(value: Option<&String>) -> Result<Option<u32>, ParseIntError> {
        Ok(match value {
            Some(value) => value.parse::<u32>().map(Some)?,
            None => None,
        })
    }
    fn parse_string(value: Option<&String>) -> Option<String> {
        value.filter(|v| !v.is_empty()).cloned()
    }
    /// Parse the value for `Self::SparseVolume`.
    pub fn sparse_volume(value: Option<&String>) -> Result<Option<bool>, ParseBoolError> {
        Self::parse_bool(value)
    }
    /// Parse the value for `Self::UseChapAuth`.
    pub fn use_chap_auth(value: Option<&String>) -> Result<Option<bool>, ParseBoolError> {
        Self::parse_bool(value.filter(|v| !v.is_empty()))
    }
    /// Parse the value for `Self::LunsPerTarget`.
    pub fn luns_per_target(value: Option<&String>) -> Result<Option<u32>, ParseIntError> {
        Self::parse_u32(value.filter(|v| !v.is_empty()))
    }
    /// Parse the value for `Self::IscsiPort`.
    pub fn iscsi_port(value: Option<&String>) -> Result<Option<u16>, ParseIntError> {
        Ok(match value.filter(|v| !v.is_empty()) {
            Some(value) => value.parse::<u16>().map(Some)?,
            None => None,
        })
    }
    /// Parse the octal value for `Self::MountPointPermissions`.
    pub fn mount_point_permissions(value: Option<&String>) -> Result<Option<u32>, String> {
        match value.filter(|v| !v.is_empty()) {
            Some(value) => parse_permissions(value)
                .map(Some)
                .ok_or_else(|| value.clone()),
            None => Ok(None),
        }
    }
}

/// The keys of the volume context handed from the controller to the node plugin.
#[derive(AsRefStr, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKey {
    #[strum(serialize = "DataIP")]
    DataIp,
    VolumeGroup,
    Target,
    TargetGroup,
    HostGroup,
    #[strum(serialize = "iSCSIPort")]
    IscsiPort,
    #[strum(serialize = "iSCSITargetPrefix")]
    IscsiTargetPrefix,
    #[strum(serialize = "numOfLunsPerTarget")]
    LunsPerTarget,
    #[strum(serialize = "useChapAuth")]
    UseChapAuth,
    #[strum(serialize = "chapUser")]
    ChapUser,
    #[strum(serialize = "chapSecret")]
    ChapSecret,
    #[strum(serialize = "mountPointPermissions")]
    MountPointPermissions,
}

/// Volume creation parameters, as requested through the StorageClass.
/// Values which are not set fall back to the appliance configuration.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct CreateParams {
    volume_group: Option<String>,
    config_name: Option<String>,
    sparse_volume: bool,
    data_ip: Option<String>,
    target: Option<String>,
    target_group: Option<String>,
    host_group: Option<String>,
    iscsi_port: Option<u16>,
    iscsi_target_prefix: Option<String>,
    luns_per_target: Option<u32>,
    use_chap_auth: Option<bool>,
    chap_user: Option<String>,
    chap_secret: Option<String>,
    mount_point_permissions: Option<u32>,
}
impl std::fmt::Debug for CreateParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateParams")
            .field("volume_group", &self.volume_group)
            .field("config_name", &self.config_name)
            .field("sparse_volume", &self.sparse_volume)
            .field("target", &self.target)
            .field("use_chap_auth", &self.use_chap_auth)
            .finish_non_exhaustive()
    }
}
impl CreateParams {
    /// Get the `Parameters::VolumeGroup` value.
    pub fn volume_group(&self) -> Option<&str> {
        self.volume_group.as_deref()
    }
    /// Get the `Parameters::ConfigName` value.
    pub fn config_name(&self) -> Option<&str> {
        self.config_name.as_deref()
    }
    /// Get the `Parameters::SparseVolume` value.
    pub fn sparse_volume(&self) -> bool {
        self.sparse_volume
    }
    /// The volume context of a volume created in `volume_group` of the given appliance:
    /// request parameters take precedence over the appliance configuration.
    pub fn volume_context(
        &self,
        appliance: &ApplianceConfig,
        volume_group: &str,
    ) -> Result<VolumeContext, tonic::Status> {
        let pick = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        let context = VolumeContext {
            data_ip: pick(&self.data_ip, &appliance.default_data_ip),
            volume_group: volume_group.to_string(),
            target: pick(&self.target, &appliance.default_target),
            target_group: pick(&self.target_group, &appliance.default_target_group),
            host_group: pick(&self.host_group, &appliance.default_host_group),
            iscsi_port: self.iscsi_port.unwrap_or_else(|| appliance.iscsi_port()),
            iscsi_target_prefix: pick(
                &self.iscsi_target_prefix,
                appliance.iscsi_target_prefix(),
            ),
            luns_per_target: self
                .luns_per_target
                .unwrap_or_else(|| appliance.luns_per_target()),
            use_chap_auth: self.use_chap_auth.unwrap_or(appliance.use_chap_auth),
            chap_user: pick(&self.chap_user, &appliance.chap_user),
            chap_secret: pick(&self.chap_secret, &appliance.chap_secret),
            mount_point_permissions: self
                .mount_point_permissions
                .unwrap_or_else(|| appliance.mount_point_permissions()),
        };
        context.validate()?;
        Ok(context)
    }
}
impl TryFrom<&HashMap<String, String>> for CreateParams {
    type Error = tonic::Status;

    fn try_from(args: &HashMap<String, String>) -> Result<Self, Self::Error> {
        let get = |p: Parameters| args.get(p.as_ref());
        let sparse_volume = Parameters::sparse_volume(get(Parameters::SparseVolume))
            .map_err(|error| {
                tonic::Status::invalid_argument(format!(
                    "Could not parse sparseVolume parameter = {:?}, error: {error}",
                    get(Parameters::SparseVolume)
                ))
            })?
            .unwrap_or(utils::DEFAULT_SPARSE_VOLUME);
        let iscsi_port = Parameters::iscsi_port(get(Parameters::IscsiPort))
            .map_err(|_| tonic::Status::invalid_argument("Invalid iSCSIPort"))?;
        let luns_per_target = Parameters::luns_per_target(get(Parameters::LunsPerTarget))
            .map_err(|_| tonic::Status::invalid_argument("Invalid numOfLunsPerTarget"))?;
        let use_chap_auth = Parameters::use_chap_auth(get(Parameters::UseChapAuth))
            .map_err(|_| tonic::Status::invalid_argument("Invalid useChapAuth, expected a bool"))?;
        let mount_point_permissions =
            Parameters::mount_point_permissions(get(Parameters::MountPointPermissions)).map_err(
                |value| {
                    tonic::Status::invalid_argument(format!(
                        "Invalid mountPointPermissions '{value}', expected octal digits"
                    ))
                },
            )?;

        Ok(Self {
            volume_group: Parameters::parse_string(get(Parameters::VolumeGroup)),
            config_name: Parameters::parse_string(get(Parameters::ConfigName)),
            sparse_volume,
            data_ip: Parameters::parse_string(get(Parameters::DataIp)),
            target: Parameters::parse_string(get(Parameters::Target)),
            target_group: Parameters::parse_string(get(Parameters::TargetGroup)),
            host_group: Parameters::parse_string(get(Parameters::HostGroup)),
            iscsi_port,
            iscsi_target_prefix: Parameters::parse_string(get(Parameters::IscsiTargetPrefix)),
            luns_per_target,
            use_chap_auth,
            chap_user: Parameters::parse_string(get(Parameters::ChapUser)),
            chap_secret: Parameters::parse_string(get(Parameters::ChapSecret)),
            mount_point_permissions,
        })
    }
}

/// Provisioning decisions travelling with a volume from CreateVolume to the node plugin.
/// Empty target, target group and host group values are left to the node to allocate.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeContext {
    pub data_ip: String,
    pub volume_group: String,
    pub target: String,
    pub target_group: String,
    pub host_group: String,
    pub iscsi_port: u16,
    pub iscsi_target_prefix: String,
    pub luns_per_target: u32,
    pub use_chap_auth: bool,
    pub chap_user: String,
    pub chap_secret: String,
    pub mount_point_permissions: u32,
}

impl std::fmt::Debug for VolumeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeContext")
            .field("data_ip", &self.data_ip)
            .field("volume_group", &self.volume_group)
            .field("target", &self.target)
            .field("target_group", &self.target_group)
            .field("host_group", &self.host_group)
            .field("iscsi_port", &self.iscsi_port)
            .field("iscsi_target_prefix", &self.iscsi_target_prefix)
            .field("luns_per_target", &self.luns_per_target)
            .field("use_chap_auth", &self.use_chap_auth)
            .field("chap_user", &self.chap_user)
            .field(
                "mount_point_permissions",
                &format_args!("{:o}", self.mount_point_permissions),
            )
            .finish_non_exhaustive()
    }
}

impl VolumeContext {
    /// The iSCSI portal, `<data ip>:<port>`.
    pub fn portal(&self) -> String {
        format!("{}:{}", self.data_ip, self.iscsi_port)
    }
    /// The CHAP credentials, when CHAP authentication is requested.
    pub fn chap(&self) -> Option<ChapCredentials> {
        self.use_chap_auth.then(|| ChapCredentials {
            chap_user: self.chap_user.clone(),
            chap_secret: self.chap_secret.clone(),
        })
    }
    fn validate(&self) -> Result<(), tonic::Status> {
        if self.data_ip.is_empty() {
            return Err(tonic::Status::invalid_argument("dataIP is not set"));
        }
        if self.luns_per_target == 0 {
            return Err(tonic::Status::invalid_argument(
                "numOfLunsPerTarget must be greater than zero",
            ));
        }
        if self.use_chap_auth && self.chap_secret.is_empty() {
            return Err(tonic::Status::invalid_argument(
                "useChapAuth is set to true, but chapSecret is not set",
            ));
        }
        Ok(())
    }

    /// Parse the context of a volume, taking the values of missing keys from the appliance
    /// configuration, which happens for volumes created before a key was introduced.
    pub fn from_map(
        map: &HashMap<String, String>,
        appliance: &ApplianceConfig,
    ) -> Result<Self, tonic::Status> {
        let get = |key: ContextKey| map.get(key.as_ref());
        let string = |key: ContextKey, default: &str| {
            get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };
        let context = Self {
            data_ip: string(ContextKey::DataIp, &appliance.default_data_ip),
            volume_group: string(ContextKey::VolumeGroup, &appliance.default_volume_group),
            target: string(ContextKey::Target, &appliance.default_target),
            target_group: string(ContextKey::TargetGroup, &appliance.default_target_group),
            host_group: string(ContextKey::HostGroup, &appliance.default_host_group),
            iscsi_port: Parameters::iscsi_port(get(ContextKey::IscsiPort))
                .map_err(|_| tonic::Status::invalid_argument("Invalid iSCSIPort"))?
                .unwrap_or_else(|| appliance.iscsi_port()),
            iscsi_target_prefix: string(
                ContextKey::IscsiTargetPrefix,
                appliance.iscsi_target_prefix(),
            ),
            luns_per_target: Parameters::luns_per_target(get(ContextKey::LunsPerTarget))
                .map_err(|_| tonic::Status::invalid_argument("Invalid numOfLunsPerTarget"))?
                .unwrap_or_else(|| appliance.luns_per_target()),
            use_chap_auth: Parameters::use_chap_auth(get(ContextKey::UseChapAuth))
                .map_err(|_| tonic::Status::invalid_argument("Invalid useChapAuth"))?
                .unwrap_or(appliance.use_chap_auth),
            chap_user: string(ContextKey::ChapUser, &appliance.chap_user),
            chap_secret: string(ContextKey::ChapSecret, &appliance.chap_secret),
            mount_point_permissions: Parameters::mount_point_permissions(get(
                ContextKey::MountPointPermissions,
            ))
            .map_err(|value| {
                tonic::Status::invalid_argument(format!(
                    "Invalid mountPointPermissions '{value}'"
                ))
            })?
            .unwrap_or_else(|| appliance.mount_point_permissions()),
        };
        context.validate()?;
        Ok(context)
    }

    /// Convert `Self` into the volume context map.
    pub fn into_map(self) -> HashMap<String, String> {
        HashMap::from([
            (ContextKey::DataIp.to_string(), self.data_ip),
            (ContextKey::VolumeGroup.to_string(), self.volume_group),
            (ContextKey::Target.to_string(), self.target),
            (ContextKey::TargetGroup.to_string(), self.target_group),
            (ContextKey::HostGroup.to_string(), self.host_group),
            (ContextKey::IscsiPort.to_string(), self.iscsi_port.to_string()),
            (
                ContextKey::IscsiTargetPrefix.to_string(),
                self.iscsi_target_prefix,
            ),
            (
                ContextKey::LunsPerTarget.to_string(),
                self.luns_per_target.to_string(),
            ),
            (
                ContextKey::UseChapAuth.to_string(),
                self.use_chap_auth.to_string(),
            ),
            (ContextKey::ChapUser.to_string(), self.chap_user),
            (ContextKey::ChapSecret.to_string(), self.chap_secret),
            (
                ContextKey::MountPointPermissions.to_string(),
                format!("{:o}", self.mount_point_permissions),
            ),
        ])
    }
}

/// Parse a volume context key, mostly useful to validate foreign maps.
pub fn is_context_key(key: &str) -> bool {
    ContextKey::from_str(key).is_ok()
}
