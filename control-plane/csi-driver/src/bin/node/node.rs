use crate::{
    config::{default_iscsi_timeout, NodeConfig},
    dev::{self, Host},
    error::DeviceError,
    filesystem_ops::FileSystem,
    iscsiadm::Initiator,
    mount::ReadOnly,
    mounter::Mounter,
};
use csi_driver::{
    allocator::{AllocationRequest, Allocator},
    config::{ConfigSnapshot, ConfigStore},
    context::VolumeContext,
    failure,
    filesystem::FileSystem as Fs,
    identity::VolumeId,
    limiter::VolumeOpGuard,
    plugin_capabilities::{access_mode_supported, node_capabilities},
    resolver::{resolve, Resolved},
    retry::RetryPolicy,
};
use nexentastor::{LunMappingFilter, Provider};
use rpc::csi::{
    node_server,
    volume_capability::{access_mode::Mode, AccessType, MountVolume},
    volume_usage::Unit,
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, Topology, VolumeCapability, VolumeUsage,
};

use nix::{errno::Errno, sys};
use std::{
    collections::HashMap,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, instrument, warn};

/// Name of the link to the device, under the staging path of a block volume.
const DEVICE_LINK: &str = "device";

/// What is staged at a staging path, by host device.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Staged {
    /// A block volume, linked as `device`.
    Link(PathBuf),
    /// A filesystem volume, mounted from the device.
    Mount(PathBuf),
}

impl Staged {
    fn device(&self) -> &Path {
        match self {
            Self::Link(device) | Self::Mount(device) => device,
        }
    }
}

/// The Csi Node implementation.
#[derive(Debug)]
pub(crate) struct Node {
    config: NodeConfig,
    store: Arc<ConfigStore>,
    initiator: Arc<dyn Initiator>,
    mounter: Arc<dyn Mounter>,
    host: Host,
    allocator: Allocator,
}

impl Node {
    /// Creates new node.
    pub(crate) fn new(
        config: NodeConfig,
        store: Arc<ConfigStore>,
        initiator: Arc<dyn Initiator>,
        mounter: Arc<dyn Mounter>,
    ) -> Node {
        let host = Host::new(&config.host_root);
        info!(node.name = %config.node_name, zone = ?config.zone, "Node topology");
        Self {
            config,
            store,
            initiator,
            mounter,
            host,
            allocator: Allocator::default(),
        }
    }

    /// Get the topology segments.
    fn segments(&self) -> HashMap<String, String> {
        self.config
            .zone
            .iter()
            .map(|zone| (utils::CSI_TOPOLOGY_KEY_ZONE.to_string(), zone.clone()))
            .collect()
    }

    fn refresh(&self, secrets: &HashMap<String, String>) -> Result<Arc<ConfigSnapshot>, Status> {
        self.store
            .refresh(rpc::csi::config_secret(secrets))
            .map_err(|error| failure!(Code::FailedPrecondition, "Cannot use config file: {}", error))
    }

    async fn initiator_name(&self) -> Result<String, Status> {
        dev::read_initiator_name(&self.config.initiator_name_file)
            .await
            .map_err(|error| failure!(Code::FailedPrecondition, "{}", error))
    }

    /// What is currently staged at the staging path.
    /// Failing to list the mounts is an error: an unknown mount must never be taken for none.
    async fn staged(&self, staging_path: &Path) -> Result<Option<Staged>, Status> {
        if let Ok(device) = tokio::fs::read_link(staging_path.join(DEVICE_LINK)).await {
            return Ok(Some(Staged::Link(device)));
        }
        let mount = self.mounter.get_mount(staging_path).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Cannot find the mount of {}: {}",
                staging_path.display(),
                error
            )
        })?;
        Ok(mount.map(|mount| Staged::Mount(self.host.relative(Path::new(&mount.source)))))
    }

    /// Log into the target until the LUN link shows up, returning the device it points to.
    async fn wait_for_device(
        &self,
        link: &Path,
        target: &str,
        portal: &str,
        timeout: Duration,
    ) -> Result<PathBuf, Status> {
        let host = &self.host;
        let initiator = self.initiator.as_ref();
        RetryPolicy::device(timeout)
            .retry(|attempt| async move {
                if host.exists(link).await {
                    return Ok(());
                }
                if let Err(error) = initiator.login_rescan(target, portal).await {
                    debug!(attempt, %error, "iSCSI rescan failed");
                }
                Err(format!("{} not found", link.display()))
            })
            .await
            .map_err(|error| {
                debug!(%error, "Giving up on the device");
                failure!(
                    Code::DeadlineExceeded,
                    "Could not find iSCSI device {} in {}",
                    link.display(),
                    humantime::format_duration(timeout)
                )
            })?;
        Ok(self.host.real_device(link).await?)
    }

    async fn stage_block(&self, device: &Path, staging_path: &Path) -> Result<(), Status> {
        let link = staging_path.join(DEVICE_LINK);
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            tokio::fs::remove_file(&link).await.map_err(DeviceError::from)?;
        }
        tokio::fs::symlink(device, &link).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to link {} to {}: {}",
                device.display(),
                link.display(),
                error
            )
        })?;
        info!(device = %device.display(), path = %link.display(), "Block volume staged");
        Ok(())
    }

    async fn stage_filesystem(
        &self,
        device: &Path,
        staging_path: &Path,
        fstype: &FileSystem,
        mount_volume: &MountVolume,
        permissions: u32,
    ) -> Result<(), Status> {
        let host_device = self.host.path(device);
        self.mounter.prepare(fstype, &host_device).await?;
        self.mounter
            .mount(
                &host_device,
                staging_path,
                fstype.as_ref(),
                &mount_volume.mount_flags,
            )
            .map_err(|error| mount_failure(device, error))?;
        set_permissions(staging_path, permissions).await?;
        info!(
            device = %device.display(),
            path = %staging_path.display(),
            %fstype,
            "Filesystem volume staged"
        );
        Ok(())
    }
}

/// Map a failed mount onto a status.
fn mount_failure(device: &Path, error: std::io::Error) -> Status {
    let code = match error.kind() {
        ErrorKind::PermissionDenied => Code::PermissionDenied,
        ErrorKind::InvalidInput => Code::InvalidArgument,
        _ => Code::Internal,
    };
    let message = format!("Failed to mount device {}: {error}", device.display());
    tracing::error!("{}", message);
    Status::new(code, message)
}

async fn set_permissions(path: &Path, mode: u32) -> Result<(), Status> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to set permissions {:o} on {}: {}",
                mode,
                path.display(),
                error
            )
        })
}

fn parse_volume_id(volume_id: &str) -> Result<VolumeId, Status> {
    VolumeId::from_str(volume_id).map_err(|error| {
        failure!(
            Code::InvalidArgument,
            "VolumeId is in wrong format: {}: {}",
            volume_id,
            error
        )
    })
}

/// Check that the access_mode from VolumeCapability is consistent with
/// the readonly status
fn check_access_mode(
    volume_capability: &Option<VolumeCapability>,
    readonly: bool,
) -> Result<(), String> {
    match volume_capability {
        Some(capability) => match &capability.access_mode {
            Some(access) => match Mode::try_from(access.mode) {
                Ok(mode) if !access_mode_supported(access.mode) => Err(format!(
                    "volume capability: unsupported access mode: {mode:?}"
                )),
                Ok(mode @ (Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly)) => {
                    if readonly {
                        return Ok(());
                    }
                    Err(format!("volume capability: invalid combination of access mode ({mode:?}) and mount flag (rw)"))
                }
                Ok(_) => Ok(()),
                Err(_) => Err(format!(
                    "volume capability: invalid access mode: {}",
                    access.mode
                )),
            },
            None => Err(String::from("volume capability: missing access mode")),
        },
        None => Err(String::from("missing volume capability")),
    }
}

/// Retrieve the AccessType from VolumeCapability
fn get_access_type(volume_capability: &Option<VolumeCapability>) -> Result<&AccessType, String> {
    match volume_capability {
        Some(capability) => match &capability.access_type {
            Some(access) => Ok(access),
            None => Err(String::from("volume capability: missing access type")),
        },
        None => Err(String::from("missing volume capability")),
    }
}

/// Destroy the LUN mappings of the volume to the host groups holding the initiator, leaving
/// the mappings of other nodes in place.
async fn destroy_node_mappings(
    provider: &dyn Provider,
    volume: &str,
    initiator: &str,
) -> Result<(), Status> {
    let host_groups = provider
        .get_host_groups()
        .await
        .map_err(|error| failure!(Code::Internal, "Cannot get host groups: {}", error))?
        .into_iter()
        .filter(|group| group.members.iter().any(|member| member == initiator))
        .map(|group| group.name)
        .collect::<Vec<_>>();
    let mappings = provider
        .get_lun_mappings(LunMappingFilter::volume(volume))
        .await
        .map_err(|error| {
            failure!(Code::Internal, "Cannot get LUN mappings of '{}': {}", volume, error)
        })?;
    for mapping in mappings
        .into_iter()
        .filter(|mapping| host_groups.contains(&mapping.host_group))
    {
        match provider.destroy_lun_mapping(&mapping.id).await {
            Err(error) if !error.is_not_exist() => {
                return Err(failure!(
                    Code::Internal,
                    "Cannot destroy LUN mapping '{}' of '{}': {}",
                    mapping.id,
                    volume,
                    error
                ))
            }
            _ => info!(?mapping, "LUN mapping destroyed"),
        }
    }
    Ok(())
}

#[tonic::async_trait]
impl node_server::Node for Node {
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let node_id = self.config.node_name.clone();

        debug!(node.id = %node_id, "NodeGetInfo request");

        let segments = self.segments();
        Ok(Response::new(NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: 0,
            accessible_topology: (!segments.is_empty()).then_some(Topology { segments }),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let capabilities = node_capabilities();
        debug!("NodeGetCapabilities request: {:?}", capabilities);
        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    /// Map the volume to this node, log into its target and wait for the device, then link it
    /// (block) or format and mount it (filesystem) at the staging path.
    /// A volume whose device is already staged there is left alone.
    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: missing staging path",
                &msg.volume_id
            ));
        }
        let access_type = get_access_type(&msg.volume_capability).map_err(|error| {
            failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: {}",
                &msg.volume_id,
                error
            )
        })?;
        let mode = msg
            .volume_capability
            .as_ref()
            .and_then(|capability| capability.access_mode.as_ref())
            .map_or(0, |access| access.mode);
        if !access_mode_supported(mode) {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: unsupported access mode {}",
                &msg.volume_id,
                mode
            ));
        }
        let filesystem = match access_type {
            AccessType::Mount(mount_volume) => {
                let fstype = FileSystem::from(Fs::parse_or_default(&mount_volume.fs_type));
                fstype.fs_ops().map_err(|error| {
                    failure!(
                        Code::InvalidArgument,
                        "Failed to stage volume {}: {}",
                        &msg.volume_id,
                        error
                    )
                })?;
                Some((fstype, mount_volume))
            }
            AccessType::Block(_) => None,
        };
        let volume = parse_volume_id(&msg.volume_id)?;
        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let snapshot = self.refresh(&msg.secrets)?;
        let appliance = snapshot.appliance(volume.config_name()).ok_or_else(|| {
            failure!(
                Code::NotFound,
                "NexentaStor config '{}' of volume {} not found",
                volume.config_name(),
                &msg.volume_id
            )
        })?;
        let context = VolumeContext::from_map(&msg.volume_context, appliance)?;
        let volume_group = volume
            .volume_group()
            .unwrap_or(context.volume_group.as_str());
        let Resolved { provider, .. } = resolve(
            &snapshot,
            Some(volume_group),
            None,
            Some(volume.config_name()),
        )
        .await?;

        let initiator = self.initiator_name().await?;
        let allocation = self
            .allocator
            .ensure_lun_mapping(
                provider.as_ref(),
                AllocationRequest {
                    volume: volume.path(),
                    initiator: &initiator,
                    context: &context,
                    dynamic: appliance.dynamic_target_lun_allocation,
                },
            )
            .await?;

        let portal = context.portal();
        self.initiator
            .login_rescan(&allocation.target, &portal)
            .await?;

        let staging_path = Path::new(&msg.staging_target_path);
        let staged = match tokio::fs::metadata(staging_path).await {
            Ok(_) => self.staged(staging_path).await?,
            Err(_) => {
                tokio::fs::create_dir_all(staging_path).await.map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to create staging path {}: {}",
                        staging_path.display(),
                        error
                    )
                })?;
                None
            }
        };
        set_permissions(staging_path, context.mount_point_permissions).await?;

        let timeout = self
            .config
            .iscsi_timeout
            .or_else(|| appliance.iscsi_timeout())
            .unwrap_or_else(default_iscsi_timeout);
        let link = dev::by_path(&portal, &allocation.target, allocation.lun);
        let device = self
            .wait_for_device(&link, &allocation.target, &portal, timeout)
            .await?;

        match &staged {
            Some(staged) if staged.device() == device => {
                info!(device = %device.display(), "Volume is already staged");
                return Ok(Response::new(NodeStageVolumeResponse {}));
            }
            Some(Staged::Mount(source)) => {
                return Err(failure!(
                    Code::FailedPrecondition,
                    "Staging path {} is already mounted from {}, not {}",
                    staging_path.display(),
                    source.display(),
                    device.display()
                ))
            }
            // a stale link is replaced
            _ => {}
        }

        match filesystem {
            None => self.stage_block(&device, staging_path).await?,
            Some((fstype, mount_volume)) => {
                self.stage_filesystem(
                    &device,
                    staging_path,
                    &fstype,
                    mount_volume,
                    context.mount_point_permissions,
                )
                .await?
            }
        }
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    /// Flush the staged device, unmap the volume from this node, take the staged mount or link
    /// down, delete the SCSI device and finally remove the staging path.
    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume {}: missing staging path",
                &msg.volume_id
            ));
        }
        let volume = parse_volume_id(&msg.volume_id)?;
        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let staging_path = Path::new(&msg.staging_target_path);
        if tokio::fs::symlink_metadata(staging_path).await.is_err() {
            debug!(path = %staging_path.display(), "Staging path is gone, nothing to unstage");
            return Ok(Response::new(NodeUnstageVolumeResponse {}));
        }

        let staged = self.staged(staging_path).await?;
        if let Some(staged) = &staged {
            self.mounter
                .flush(&self.host.path(staged.device()))
                .await?;
        }

        let snapshot = self.refresh(&HashMap::new())?;
        let volume_group = volume.volume_group().ok();
        match resolve(&snapshot, volume_group, None, Some(volume.config_name())).await {
            Ok(Resolved { provider, .. }) => {
                let initiator = self.initiator_name().await?;
                destroy_node_mappings(provider.as_ref(), volume.path(), &initiator).await?;
            }
            Err(status) if status.code() == Code::NotFound => {
                warn!(%status, "Volume appliance not found, leaving its LUN mappings");
            }
            Err(status) => return Err(status),
        }

        match &staged {
            Some(Staged::Link(_)) => {
                tokio::fs::remove_file(staging_path.join(DEVICE_LINK))
                    .await
                    .map_err(DeviceError::from)?;
            }
            Some(Staged::Mount(_)) => {
                self.mounter.unmount(staging_path).map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to unmount {}: {}",
                        staging_path.display(),
                        error
                    )
                })?;
            }
            None => {}
        }

        if let Some(staged) = &staged {
            if let Err(error) = self.host.remove_device(staged.device()).await {
                warn!(%error, device = %staged.device().display(), "Failed to remove SCSI device");
            }
        }

        // never recursive: whatever is left in there is not ours to delete
        match tokio::fs::remove_dir(staging_path).await {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(failure!(
                Code::Internal,
                "Failed to remove staging path {}: {}",
                staging_path.display(),
                error
            )),
            _ => {
                info!(path = %staging_path.display(), "Volume unstaged");
                Ok(Response::new(NodeUnstageVolumeResponse {}))
            }
        }
    }

    /// Link the staged device (block) or bind mount the staged filesystem at the target path.
    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume: missing volume id"
            ));
        }
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing target path",
                &msg.volume_id
            ));
        }
        // Note that the staging path is NOT optional,
        // as we advertise StageUnstageVolume.
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing staging path",
                &msg.volume_id
            ));
        }
        if let Err(error) = check_access_mode(&msg.volume_capability, msg.readonly) {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: {}",
                &msg.volume_id,
                error
            ));
        }
        let access_type = get_access_type(&msg.volume_capability).map_err(|error| {
            failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: {}",
                &msg.volume_id,
                error
            )
        })?;
        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let staging_path = Path::new(&msg.staging_target_path);
        let target_path = Path::new(&msg.target_path);
        if let Some(parent) = target_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DeviceError::from)?;
        }

        match access_type {
            AccessType::Block(_) => {
                let device = tokio::fs::read_link(staging_path.join(DEVICE_LINK))
                    .await
                    .map_err(|_| {
                        failure!(
                            Code::FailedPrecondition,
                            "Failed to publish volume {}: not staged at {}",
                            &msg.volume_id,
                            staging_path.display()
                        )
                    })?;
                match tokio::fs::read_link(target_path).await {
                    Ok(published) if published == device => {
                        debug!(path = %target_path.display(), "Volume is already published");
                        return Ok(Response::new(NodePublishVolumeResponse {}));
                    }
                    Ok(_) => tokio::fs::remove_file(target_path)
                        .await
                        .map_err(DeviceError::from)?,
                    Err(_) if tokio::fs::symlink_metadata(target_path).await.is_ok() => {
                        return Err(failure!(
                            Code::AlreadyExists,
                            "Failed to publish volume {}: {} exists and is not a device link",
                            &msg.volume_id,
                            target_path.display()
                        ))
                    }
                    Err(_) => {}
                }
                tokio::fs::symlink(&device, target_path)
                    .await
                    .map_err(DeviceError::from)?;
                info!(device = %device.display(), path = %target_path.display(), "Block volume published");
            }
            AccessType::Mount(mount_volume) => {
                if self.mounter.get_mount(staging_path).await?.is_none() {
                    return Err(failure!(
                        Code::FailedPrecondition,
                        "Failed to publish volume {}: not staged at {}",
                        &msg.volume_id,
                        staging_path.display()
                    ));
                }
                if self.mounter.get_mount(target_path).await?.is_some() {
                    debug!(path = %target_path.display(), "Volume is already published");
                    return Ok(Response::new(NodePublishVolumeResponse {}));
                }
                tokio::fs::create_dir_all(target_path)
                    .await
                    .map_err(DeviceError::from)?;
                let mut options = mount_volume.mount_flags.clone();
                if msg.readonly && !options.readonly() {
                    options.push("ro".to_string());
                }
                self.mounter
                    .bind_mount(staging_path, target_path, &options)
                    .map_err(|error| mount_failure(staging_path, error))?;
                info!(path = %target_path.display(), readonly = msg.readonly, "Filesystem volume published");
            }
        }
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    /// Unmount or unlink the target path, then remove it.
    /// A target path which does not exist was already unpublished.
    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume: missing volume id"
            ));
        }
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume {}: missing target path",
                msg.volume_id
            ));
        }
        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let target_path = Path::new(&msg.target_path);
        let metadata = match tokio::fs::symlink_metadata(target_path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = %target_path.display(), "Target path is gone, nothing to unpublish");
                return Ok(Response::new(NodeUnpublishVolumeResponse {}));
            }
            Err(error) => return Err(DeviceError::from(error).into()),
        };

        if !metadata.is_dir() {
            tokio::fs::remove_file(target_path)
                .await
                .map_err(DeviceError::from)?;
        } else {
            if self.mounter.get_mount(target_path).await?.is_some() {
                self.mounter.unmount(target_path).map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to unmount {}: {}",
                        target_path.display(),
                        error
                    )
                })?;
            }
            match tokio::fs::remove_dir(target_path).await {
                Err(error) if error.kind() != ErrorKind::NotFound => {
                    return Err(DeviceError::from(error).into())
                }
                _ => {}
            }
        }
        info!(path = %target_path.display(), "Volume unpublished");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    /// Get volume stats method evaluates and returns capacity metrics.
    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let msg = request.into_inner();
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume path"
            ));
        }

        let volume_path = Path::new(&msg.volume_path);
        let metadata = match tokio::fs::symlink_metadata(volume_path).await {
            Ok(metadata) => metadata,
            Err(_) => return Err(Status::new(Code::NotFound, "volume path doesn't exist")),
        };

        if metadata.is_dir() {
            debug!("Getting statfs metrics for : {:?}", volume_path);
            return match sys::statfs::statfs(volume_path) {
                Ok(info) => Ok(Response::new(NodeGetVolumeStatsResponse {
                    usage: vec![
                        VolumeUsage {
                            total: info.blocks() as i64 * info.block_size(),
                            unit: Unit::Bytes as i32,
                            available: info.blocks_available() as i64 * info.block_size(),
                            used: (info.blocks() - info.blocks_free()) as i64
                                * info.block_size(),
                        },
                        VolumeUsage {
                            total: info.files() as i64,
                            unit: Unit::Inodes as i32,
                            available: info.files_free() as i64,
                            used: (info.files() - info.files_free()) as i64,
                        },
                    ],
                    volume_condition: None,
                })),
                Err(err) => match err {
                    Errno::ENOENT => Err(Status::new(Code::NotFound, err.to_string())),
                    Errno::EIO => Err(Status::new(Code::Internal, err.to_string())),
                    Errno::ENOSYS => Err(Status::new(Code::Unavailable, err.to_string())),
                    Errno::ENOTDIR => Err(Status::new(Code::Internal, err.to_string())),
                    _ => Err(Status::new(Code::InvalidArgument, err.to_string())),
                },
            };
        }

        let device = tokio::fs::read_link(volume_path)
            .await
            .map_err(DeviceError::from)?;
        let total = dev::size_bytes(&self.host.path(&device)).await?;
        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![VolumeUsage {
                total: total as i64,
                unit: Unit::Bytes as i32,
                available: 0,
                used: 0,
            }],
            volume_condition: None,
        }))
    }

    /// Rescan the device so that it picks up the new capacity, and grow its filesystem, if any.
    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to expand volume: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to expand volume {}: missing volume path",
                &msg.volume_id
            ));
        }
        let volume = parse_volume_id(&msg.volume_id)?;
        let _guard = VolumeOpGuard::new(&msg.volume_id)?;

        let snapshot = self.refresh(&HashMap::new())?;
        let Resolved { provider, .. } = resolve(
            &snapshot,
            volume.volume_group().ok(),
            None,
            Some(volume.config_name()),
        )
        .await?;
        provider
            .get_volume(volume.path())
            .await
            .map_err(|error| match error.is_not_exist() {
                true => failure!(Code::NotFound, "Did not find volume {}: {}", volume.path(), error),
                false => failure!(Code::Internal, "Cannot get volume {}: {}", volume.path(), error),
            })?;

        let volume_path = Path::new(&msg.volume_path);
        let metadata = tokio::fs::symlink_metadata(volume_path)
            .await
            .map_err(|_| failure!(Code::NotFound, "Volume path {} not found", volume_path.display()))?;

        let block = match get_access_type(&msg.volume_capability) {
            Ok(AccessType::Block(_)) => true,
            Ok(AccessType::Mount(_)) => false,
            Err(_) => metadata.file_type().is_symlink(),
        };
        if block {
            let device = tokio::fs::read_link(volume_path)
                .await
                .map_err(DeviceError::from)?;
            self.host.rescan_device(&device).await;
        } else {
            let mount = self.mounter.get_mount(volume_path).await?.ok_or_else(|| {
                failure!(
                    Code::NotFound,
                    "Failed to expand volume {}: {} is not mounted",
                    &msg.volume_id,
                    volume_path.display()
                )
            })?;
            let device = self.host.relative(Path::new(&mount.source));
            self.host.rescan_device(&device).await;
            let fstype = FileSystem::from(Fs::parse_or_default(&mount.fstype));
            let fs_ops = fstype.fs_ops().map_err(|error| {
                failure!(
                    Code::InvalidArgument,
                    "Failed to expand volume {}: {}",
                    &msg.volume_id,
                    error
                )
            })?;
            fs_ops
                .expand(&self.host.path(&device), volume_path)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Failed to expand {} filesystem of volume {}: {}",
                        fstype,
                        &msg.volume_id,
                        error
                    )
                })?;
            info!(%fstype, device = %device.display(), "Filesystem expanded");
        }

        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: msg
                .capacity_range
                .map(|range| range.required_bytes)
                .unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findmnt::DeviceMount;
    use nexentastor::{
        mock::{MockConnector, MockProvider},
        CreateLunMappingParams,
    };
    use parking_lot::Mutex;
    use rpc::csi::{
        node_server::Node as _, volume_capability::BlockVolume, VolumeCapability,
    };
    use std::{
        io::Write,
        sync::atomic::{AtomicBool, Ordering},
    };
    use utils::bytes::GIB;

    const INITIATOR: &str = "iqn.1993-08.org.debian:01:node-1";
    const CONFIG: &str = r#"
nexentastor_map:
  ns-1:
    restIp: https://10.0.0.1:8443
    username: admin
    password: verysecretpassword
    zone: zone-1
    defaultVolumeGroup: pool1/vg1
    defaultDataIp: 10.0.1.1
"#;

    /// Attaches every LUN 0 of the target as `sdc`, under the host root.
    #[derive(Debug)]
    struct FakeInitiator {
        root: PathBuf,
        attach: bool,
        logins: Mutex<Vec<String>>,
    }

    #[tonic::async_trait]
    impl Initiator for FakeInitiator {
        async fn login_rescan(&self, target: &str, portal: &str) -> Result<(), DeviceError> {
            self.logins.lock().push(target.to_string());
            if self.attach {
                let link = self
                    .root
                    .join(dev::by_path(portal, target, 0).strip_prefix("/").unwrap());
                std::fs::create_dir_all(link.parent().unwrap()).unwrap();
                std::fs::write(self.root.join("dev/sdc"), "").unwrap();
                if std::fs::symlink_metadata(&link).is_err() {
                    std::os::unix::fs::symlink("../../sdc", &link).unwrap();
                }
            }
            Ok(())
        }
    }

    /// A mount table in memory. Devices are formatted and mounted by name only.
    #[derive(Debug, Default)]
    struct FakeMounter {
        mounts: Mutex<HashMap<PathBuf, DeviceMount>>,
        options: Mutex<HashMap<PathBuf, Vec<String>>>,
        formatted: Mutex<HashMap<PathBuf, String>>,
        flushed: Mutex<Vec<PathBuf>>,
        /// Listing the mounts fails, as when findmnt is missing.
        broken: AtomicBool,
    }

    impl FakeMounter {
        fn add_mount(&self, source: &Path, target: &Path, fstype: &str) {
            self.mounts.lock().insert(
                target.to_path_buf(),
                DeviceMount::new(
                    source.display().to_string(),
                    target.display().to_string(),
                    fstype,
                ),
            );
        }
    }

    #[tonic::async_trait]
    impl Mounter for FakeMounter {
        async fn get_mount(&self, path: &Path) -> Result<Option<DeviceMount>, DeviceError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DeviceError::from("findmnt: not found".to_string()));
            }
            Ok(self.mounts.lock().get(path).cloned())
        }
        async fn prepare(&self, fstype: &FileSystem, device: &Path) -> Result<(), Status> {
            let mut formatted = self.formatted.lock();
            match formatted.get(device) {
                Some(existing) if existing == fstype.as_ref() => Ok(()),
                Some(existing) => Err(Status::failed_precondition(format!(
                    "Volume {} is already formatted in {existing}, requested: {fstype}",
                    device.display()
                ))),
                None => {
                    formatted.insert(device.to_path_buf(), fstype.to_string());
                    Ok(())
                }
            }
        }
        fn mount(
            &self,
            device: &Path,
            target: &Path,
            fstype: &str,
            options: &[String],
        ) -> Result<(), std::io::Error> {
            self.add_mount(device, target, fstype);
            self.options
                .lock()
                .insert(target.to_path_buf(), options.to_vec());
            Ok(())
        }
        fn bind_mount(
            &self,
            source: &Path,
            target: &Path,
            options: &[String],
        ) -> Result<(), std::io::Error> {
            let mount = self
                .mounts
                .lock()
                .get(source)
                .cloned()
                .ok_or_else(|| std::io::Error::from(ErrorKind::InvalidInput))?;
            self.add_mount(Path::new(&mount.source), target, &mount.fstype);
            self.options
                .lock()
                .insert(target.to_path_buf(), options.to_vec());
            Ok(())
        }
        fn unmount(&self, target: &Path) -> Result<(), std::io::Error> {
            self.mounts
                .lock()
                .remove(target)
                .map(|_| ())
                .ok_or_else(|| std::io::Error::from(ErrorKind::InvalidInput))
        }
        async fn flush(&self, device: &Path) -> Result<(), DeviceError> {
            self.flushed.lock().push(device.to_path_buf());
            Ok(())
        }
    }

    struct Fixture {
        node: Node,
        volume_id: String,
        ns1: Arc<MockProvider>,
        initiator: Arc<FakeInitiator>,
        mounter: Arc<FakeMounter>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        /// The plugin's view of a host path.
        fn host_path(&self, path: &str) -> PathBuf {
            self.dir.path().join("host").join(path)
        }
    }

    /// A node and an appliance serving the volume `pool1/vg1/<volume>`.
    fn fixture(attach: bool, volume: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("host");
        std::fs::create_dir_all(&root).unwrap();

        let connector = MockConnector::default();
        let ns1 = connector.add(Arc::new(
            MockProvider::new("https://10.0.0.1:8443")
                .with_volume_group("pool1/vg1", 100 * GIB)
                .with_volume(&format!("pool1/vg1/{volume}"), 10 * GIB),
        ));
        let config_path = dir.path().join("driver-config-csi.yaml");
        std::fs::File::create(&config_path)
            .unwrap()
            .write_all(CONFIG.as_bytes())
            .unwrap();
        let initiator_name_file = dir.path().join("initiatorname.iscsi");
        std::fs::write(&initiator_name_file, format!("InitiatorName={INITIATOR}\n")).unwrap();

        let initiator = Arc::new(FakeInitiator {
            root: root.clone(),
            attach,
            logins: Mutex::new(vec![]),
        });
        let config = NodeConfig {
            node_name: "node-1".to_string(),
            zone: Some("zone-1".to_string()),
            config_path: config_path.clone(),
            initiator_name_file,
            host_root: root,
            iscsi_timeout: Some(Duration::from_millis(10)),
        };
        let store = Arc::new(ConfigStore::new(config_path, Arc::new(connector)));
        let mounter = Arc::new(FakeMounter::default());
        let node = Node::new(config, store, initiator.clone(), mounter.clone());
        Fixture {
            node,
            volume_id: format!("ns-1:pool1/vg1/{volume}"),
            ns1,
            initiator,
            mounter,
            dir,
        }
    }

    fn block_capability(mode: Mode) -> Option<VolumeCapability> {
        Some(VolumeCapability {
            access_mode: Some(rpc::csi::volume_capability::AccessMode { mode: mode as i32 }),
            access_type: Some(AccessType::Block(BlockVolume {})),
        })
    }

    fn mount_capability(mode: Mode, fs_type: &str) -> Option<VolumeCapability> {
        Some(VolumeCapability {
            access_mode: Some(rpc::csi::volume_capability::AccessMode { mode: mode as i32 }),
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.to_string(),
                ..Default::default()
            })),
        })
    }

    fn stage_request(f: &Fixture) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: f.volume_id.clone(),
            staging_target_path: f.dir.path().join("staging/pv-1").display().to_string(),
            volume_capability: block_capability(Mode::SingleNodeWriter),
            ..Default::default()
        }
    }

    fn stage_mount_request(f: &Fixture) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_capability: mount_capability(Mode::SingleNodeWriter, "ext4"),
            ..stage_request(f)
        }
    }

    fn unstage_request(f: &Fixture) -> NodeUnstageVolumeRequest {
        NodeUnstageVolumeRequest {
            volume_id: f.volume_id.clone(),
            staging_target_path: f.dir.path().join("staging/pv-1").display().to_string(),
        }
    }

    #[tokio::test]
    async fn node_info() {
        let f = fixture(true, "vol-info");
        let info = f
            .node
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "node-1");
        assert_eq!(
            info.accessible_topology.unwrap().segments[utils::CSI_TOPOLOGY_KEY_ZONE],
            "zone-1"
        );

        let capabilities = f
            .node
            .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(capabilities, node_capabilities());
    }

    #[tokio::test]
    async fn stage_invalid_requests() {
        let f = fixture(true, "vol-invalid");
        let requests = [
            NodeStageVolumeRequest {
                volume_id: String::new(),
                ..stage_request(&f)
            },
            NodeStageVolumeRequest {
                staging_target_path: String::new(),
                ..stage_request(&f)
            },
            NodeStageVolumeRequest {
                volume_capability: None,
                ..stage_request(&f)
            },
            NodeStageVolumeRequest {
                volume_id: "pool1/vg1/vol-a".to_string(),
                ..stage_request(&f)
            },
            NodeStageVolumeRequest {
                volume_capability: Some(VolumeCapability {
                    access_mode: Some(rpc::csi::volume_capability::AccessMode {
                        mode: Mode::SingleNodeWriter as i32,
                    }),
                    access_type: Some(AccessType::Mount(MountVolume {
                        fs_type: "btrfs".to_string(),
                        ..Default::default()
                    })),
                }),
                ..stage_request(&f)
            },
        ];
        for request in requests {
            let error = f
                .node
                .node_stage_volume(Request::new(request))
                .await
                .unwrap_err();
            assert_eq!(error.code(), Code::InvalidArgument, "{error:?}");
        }
        assert!(f.ns1.lun_mappings().is_empty());
    }

    #[tokio::test]
    async fn stage_block_volume() {
        let f = fixture(true, "vol-stage");
        let request = stage_request(&f);
        let staging_path = PathBuf::from(&request.staging_target_path);

        f.node
            .node_stage_volume(Request::new(request.clone()))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_link(staging_path.join(DEVICE_LINK)).unwrap(),
            PathBuf::from("/dev/sdc")
        );
        let mappings = f.ns1.lun_mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].volume, "pool1/vg1/vol-stage");
        assert!(f
            .ns1
            .host_groups()
            .iter()
            .any(|group| group.name == mappings[0].host_group
                && group.members == vec![INITIATOR.to_string()]));
        assert_eq!(
            std::fs::metadata(&staging_path).unwrap().permissions().mode() & 0o777,
            utils::DEFAULT_MOUNT_POINT_PERMISSIONS
        );

        // staging again reuses the mapping and leaves the staged device alone
        f.node
            .node_stage_volume(Request::new(request))
            .await
            .unwrap();
        assert_eq!(f.ns1.lun_mappings(), mappings);
        assert_eq!(f.initiator.logins.lock().len(), 2);
    }

    #[tokio::test]
    async fn stage_filesystem_volume() {
        let f = fixture(true, "vol-fs");
        let request = stage_mount_request(&f);
        let staging_path = PathBuf::from(&request.staging_target_path);

        for _ in 0 .. 2 {
            f.node
                .node_stage_volume(Request::new(request.clone()))
                .await
                .unwrap();
        }
        let mounts = f.mounter.mounts.lock().clone();
        assert_eq!(mounts.len(), 1);
        let mount = &mounts[&staging_path];
        assert_eq!(mount.source, f.host_path("dev/sdc").display().to_string());
        assert_eq!(mount.fstype, "ext4");
        assert_eq!(
            f.mounter.formatted.lock()[&f.host_path("dev/sdc")],
            "ext4".to_string()
        );
        assert_eq!(
            std::fs::metadata(&staging_path).unwrap().permissions().mode() & 0o777,
            utils::DEFAULT_MOUNT_POINT_PERMISSIONS
        );
        assert_eq!(f.ns1.lun_mappings().len(), 1);
    }

    #[tokio::test]
    async fn stage_over_another_device() {
        let f = fixture(true, "vol-busy");
        let request = stage_mount_request(&f);
        let staging_path = PathBuf::from(&request.staging_target_path);
        std::fs::create_dir_all(&staging_path).unwrap();
        f.mounter
            .add_mount(&f.host_path("dev/sdz"), &staging_path, "ext4");

        let error = f
            .node
            .node_stage_volume(Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);
        assert!(error.message().contains("/dev/sdz"), "{error:?}");
        assert_eq!(f.mounter.mounts.lock().len(), 1);
    }

    #[tokio::test]
    async fn stage_formatted_differently() {
        let f = fixture(true, "vol-xfs");
        f.mounter
            .formatted
            .lock()
            .insert(f.host_path("dev/sdc"), "xfs".to_string());

        let error = f
            .node
            .node_stage_volume(Request::new(stage_mount_request(&f)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);
        assert!(f.mounter.mounts.lock().is_empty());
    }

    #[tokio::test]
    async fn unstage_filesystem_volume() {
        let f = fixture(true, "vol-unstage-fs");
        f.node
            .node_stage_volume(Request::new(stage_mount_request(&f)))
            .await
            .unwrap();
        assert_eq!(f.ns1.lun_mappings().len(), 1);

        for _ in 0 .. 2 {
            f.node
                .node_unstage_volume(Request::new(unstage_request(&f)))
                .await
                .unwrap();
        }
        assert!(f.mounter.mounts.lock().is_empty());
        assert_eq!(*f.mounter.flushed.lock(), vec![f.host_path("dev/sdc")]);
        assert!(f.ns1.lun_mappings().is_empty());
        assert!(!f.dir.path().join("staging/pv-1").exists());
    }

    #[tokio::test]
    async fn unstage_block_volume() {
        let f = fixture(true, "vol-unstage-block");
        f.node
            .node_stage_volume(Request::new(stage_request(&f)))
            .await
            .unwrap();

        f.node
            .node_unstage_volume(Request::new(unstage_request(&f)))
            .await
            .unwrap();
        let staging_path = f.dir.path().join("staging/pv-1");
        assert!(std::fs::symlink_metadata(staging_path.join(DEVICE_LINK)).is_err());
        assert!(!staging_path.exists());
        assert_eq!(*f.mounter.flushed.lock(), vec![f.host_path("dev/sdc")]);
        assert!(f.ns1.lun_mappings().is_empty());
    }

    #[tokio::test]
    async fn unstage_with_unknown_mounts() {
        let f = fixture(true, "vol-unknown");
        f.node
            .node_stage_volume(Request::new(stage_mount_request(&f)))
            .await
            .unwrap();
        let data = f.dir.path().join("staging/pv-1/user-data.db");
        std::fs::write(&data, "data").unwrap();
        f.mounter.broken.store(true, Ordering::SeqCst);

        let error = f
            .node
            .node_unstage_volume(Request::new(unstage_request(&f)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::Internal);
        assert!(data.exists());
        assert_eq!(f.mounter.mounts.lock().len(), 1);
        assert_eq!(f.ns1.lun_mappings().len(), 1);
    }

    #[tokio::test]
    async fn unstage_leaves_unknown_files() {
        let f = fixture(true, "vol-leftover");
        let data = f.dir.path().join("staging/pv-1/user-data.db");
        std::fs::create_dir_all(data.parent().unwrap()).unwrap();
        std::fs::write(&data, "data").unwrap();

        let error = f
            .node
            .node_unstage_volume(Request::new(unstage_request(&f)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::Internal);
        assert!(data.exists());
        assert!(f.mounter.flushed.lock().is_empty());
    }

    #[tokio::test]
    async fn stage_device_timeout() {
        let f = fixture(false, "vol-timeout");
        let error = f
            .node
            .node_stage_volume(Request::new(stage_request(&f)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::DeadlineExceeded);
        assert!(error.message().contains("Could not find iSCSI device"));
        // the mapping stays for the next attempt
        assert_eq!(f.ns1.lun_mappings().len(), 1);
    }

    #[tokio::test]
    async fn publish_and_unpublish_block_volume() {
        let f = fixture(true, "vol-publish");
        let stage = stage_request(&f);
        f.node
            .node_stage_volume(Request::new(stage.clone()))
            .await
            .unwrap();

        let target_path = f.dir.path().join("pods/p-1/volumeDevices/pv-1");
        let publish = NodePublishVolumeRequest {
            volume_id: f.volume_id.clone(),
            staging_target_path: stage.staging_target_path.clone(),
            target_path: target_path.display().to_string(),
            volume_capability: block_capability(Mode::SingleNodeWriter),
            ..Default::default()
        };
        for _ in 0 .. 2 {
            f.node
                .node_publish_volume(Request::new(publish.clone()))
                .await
                .unwrap();
            assert_eq!(
                std::fs::read_link(&target_path).unwrap(),
                PathBuf::from("/dev/sdc")
            );
        }

        let unpublish = NodeUnpublishVolumeRequest {
            volume_id: f.volume_id.clone(),
            target_path: target_path.display().to_string(),
        };
        for _ in 0 .. 2 {
            f.node
                .node_unpublish_volume(Request::new(unpublish.clone()))
                .await
                .unwrap();
            assert!(std::fs::symlink_metadata(&target_path).is_err());
        }
    }

    #[tokio::test]
    async fn publish_and_unpublish_filesystem_volume() {
        let f = fixture(true, "vol-publish-fs");
        let stage = stage_mount_request(&f);
        f.node
            .node_stage_volume(Request::new(stage.clone()))
            .await
            .unwrap();

        let target_path = f.dir.path().join("pods/p-1/volumes/pv-1/mount");
        let publish = NodePublishVolumeRequest {
            volume_id: f.volume_id.clone(),
            staging_target_path: stage.staging_target_path.clone(),
            target_path: target_path.display().to_string(),
            volume_capability: mount_capability(Mode::SingleNodeWriter, "ext4"),
            readonly: true,
            ..Default::default()
        };
        for _ in 0 .. 2 {
            f.node
                .node_publish_volume(Request::new(publish.clone()))
                .await
                .unwrap();
        }
        let mounts = f.mounter.mounts.lock().clone();
        assert_eq!(mounts.len(), 2);
        assert_eq!(
            mounts[&target_path].source,
            f.host_path("dev/sdc").display().to_string()
        );
        assert!(f.mounter.options.lock()[&target_path].readonly());

        let unpublish = NodeUnpublishVolumeRequest {
            volume_id: f.volume_id.clone(),
            target_path: target_path.display().to_string(),
        };
        for _ in 0 .. 2 {
            f.node
                .node_unpublish_volume(Request::new(unpublish.clone()))
                .await
                .unwrap();
        }
        assert!(!target_path.exists());
        let mounts = f.mounter.mounts.lock().clone();
        assert_eq!(mounts.len(), 1);
        assert!(mounts.contains_key(Path::new(&stage.staging_target_path)));
    }

    #[tokio::test]
    async fn publish_invalid_requests() {
        let f = fixture(true, "vol-unstaged");
        let publish = NodePublishVolumeRequest {
            volume_id: f.volume_id.clone(),
            staging_target_path: f.dir.path().join("staging/pv-1").display().to_string(),
            target_path: f.dir.path().join("pods/p-1/pv-1").display().to_string(),
            volume_capability: block_capability(Mode::SingleNodeReaderOnly),
            ..Default::default()
        };

        // a reader only volume must be published read only
        let error = f
            .node
            .node_publish_volume(Request::new(publish.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);

        // nothing is staged
        let error = f
            .node
            .node_publish_volume(Request::new(NodePublishVolumeRequest {
                readonly: true,
                ..publish
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn unstage_without_staging_path() {
        let f = fixture(true, "vol-unstage");
        f.node
            .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
                volume_id: f.volume_id.clone(),
                staging_target_path: f.dir.path().join("staging/gone").display().to_string(),
            }))
            .await
            .unwrap();

        let error = f
            .node
            .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
                volume_id: f.volume_id.clone(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_mappings_only() {
        let provider = MockProvider::new("https://10.0.0.1:8443")
            .with_volume_group("pool1/vg1", GIB)
            .with_volume("pool1/vg1/vol-a", GIB)
            .with_target("iqn.t1", "none", "tg1")
            .with_host_group("hg-node-1", &[INITIATOR])
            .with_host_group("hg-node-2", &["iqn.1993-08.org.debian:01:node-2"]);
        for host_group in ["hg-node-1", "hg-node-2"] {
            provider
                .create_lun_mapping(CreateLunMappingParams {
                    volume: "pool1/vg1/vol-a".to_string(),
                    target_group: "tg1".to_string(),
                    host_group: host_group.to_string(),
                })
                .await
                .unwrap();
        }

        destroy_node_mappings(&provider, "pool1/vg1/vol-a", INITIATOR)
            .await
            .unwrap();
        let mappings = provider.lun_mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].host_group, "hg-node-2");

        // nothing left to destroy
        destroy_node_mappings(&provider, "pool1/vg1/vol-a", INITIATOR)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn volume_stats() {
        let f = fixture(true, "vol-stats");
        let stats = f
            .node
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
                volume_id: f.volume_id.clone(),
                volume_path: f.dir.path().display().to_string(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stats.usage.len(), 2);
        assert_eq!(stats.usage[0].unit, Unit::Bytes as i32);
        assert!(stats.usage[0].total > 0);
        assert_eq!(stats.usage[1].unit, Unit::Inodes as i32);

        let error = f
            .node
            .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
                volume_id: f.volume_id.clone(),
                volume_path: f.dir.path().join("missing").display().to_string(),
                staging_target_path: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn expand_missing_volume() {
        let f = fixture(true, "vol-expand");
        let error = f
            .node
            .node_expand_volume(Request::new(NodeExpandVolumeRequest {
                volume_id: "ns-1:pool1/vg1/vol-z".to_string(),
                volume_path: f.dir.path().display().to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::NotFound);
    }

    #[test]
    fn access_modes() {
        assert!(check_access_mode(&block_capability(Mode::SingleNodeWriter), false).is_ok());
        assert!(check_access_mode(&block_capability(Mode::MultiNodeReaderOnly), true).is_ok());
        assert!(check_access_mode(&block_capability(Mode::MultiNodeReaderOnly), false).is_err());
        assert!(check_access_mode(&block_capability(Mode::Unknown), false).is_err());
        assert!(check_access_mode(&None, false).is_err());
    }
}
