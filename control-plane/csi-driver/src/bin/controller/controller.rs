use csi_driver::{
    config::{ConfigSnapshot, ConfigStore},
    context::CreateParams,
    failure,
    identity::{IdError, SnapshotId, VolumeId},
    limiter::VolumeOpGuard,
    pagination::paginate,
    plugin_capabilities::{access_mode_supported, controller_capabilities},
    resolver::{resolve, Resolved},
    retry::RetryPolicy,
};
use nexentastor::{
    CloneSnapshotParams, CreateVolumeParams, DestroyVolumeParams, LunMappingFilter, Provider,
    Snapshot as NsSnapshot, UpdateVolumeParams,
};
use rpc::csi::{Topology as CsiTopology, *};

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, instrument, warn};

#[derive(Debug)]
pub(crate) struct CsiControllerSvc {
    config: Arc<ConfigStore>,
    create_volume_limiter: Arc<tokio::sync::Semaphore>,
    unpublish_policy: RetryPolicy,
}

impl CsiControllerSvc {
    pub(crate) fn new(config: Arc<ConfigStore>, create_volume_limit: usize) -> Self {
        Self {
            config,
            create_volume_limiter: Arc::new(tokio::sync::Semaphore::new(create_volume_limit)),
            unpublish_policy: RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60))
                .with_multiplier(1.0),
        }
    }
    #[cfg(test)]
    fn with_unpublish_policy(self, unpublish_policy: RetryPolicy) -> Self {
        Self {
            unpublish_policy,
            ..self
        }
    }
    async fn create_volume_permit(&self) -> Result<tokio::sync::SemaphorePermit, Status> {
        tokio::time::timeout(
            // if we take too long waiting for our turn just abort..
            Duration::from_secs(3),
            self.create_volume_limiter.acquire(),
        )
        .await
        .map_err(|_| Status::aborted("Too many create volumes in progress"))?
        .map_err(|_| Status::unavailable("Service is shutdown"))
    }
    /// The current driver config, reloaded from the request secret when it carries one.
    fn refresh(&self, secrets: &HashMap<String, String>) -> Result<Arc<ConfigSnapshot>, Status> {
        self.config
            .refresh(rpc::csi::config_secret(secrets))
            .map_err(|error| failure!(Code::FailedPrecondition, "Cannot use config file: {}", error))
    }
}

/// Check that every requested capability has a supported access mode.
fn check_volume_capabilities(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    for capability in capabilities {
        let mode = capability.access_mode.as_ref().map_or(0, |a| a.mode);
        if !access_mode_supported(mode) {
            return Err(Status::failed_precondition(format!(
                "Driver does not support volume capability mode: {:?}",
                volume_capability::access_mode::Mode::try_from(mode)
                    .unwrap_or(volume_capability::access_mode::Mode::Unknown)
            )));
        }
    }
    Ok(())
}

/// The zone of the first preferred topology, or else of the first requisite topology.
fn pick_availability_zone(requirement: Option<&TopologyRequirement>) -> Option<String> {
    let requirement = requirement?;
    requirement
        .preferred
        .iter()
        .chain(requirement.requisite.iter())
        .find_map(|topology| topology.segments.get(utils::CSI_TOPOLOGY_KEY_ZONE))
        .cloned()
}

/// The volume and its volume group, for ids of volumes this driver could have created.
fn parse_volume_id(volume_id: &str) -> Result<(VolumeId, String), IdError> {
    let volume = VolumeId::from_str(volume_id)?;
    let volume_group = volume.volume_group()?.to_string();
    Ok((volume, volume_group))
}

/// Resolve the appliance serving a volume, where "not found" means there is nothing to do.
async fn resolve_existing(
    snapshot: &ConfigSnapshot,
    volume: &VolumeId,
    volume_group: &str,
) -> Result<Option<Resolved>, Status> {
    match resolve(snapshot, Some(volume_group), None, Some(volume.config_name())).await {
        Ok(resolved) => Ok(Some(resolved)),
        Err(status) if status.code() == Code::NotFound => {
            info!(volume.id = %volume, "Volume not found, that's OK for deletion request");
            Ok(None)
        }
        Err(status) => Err(status),
    }
}

/// Destroy every LUN mapping of the volume.
async fn destroy_lun_mappings(provider: &dyn Provider, volume: &str) -> Result<(), Status> {
    let mappings = provider
        .get_lun_mappings(LunMappingFilter::volume(volume))
        .await
        .map_err(|error| {
            failure!(Code::Internal, "Cannot get LUN mappings of '{}': {}", volume, error)
        })?;
    for mapping in mappings {
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
            _ => debug!(?mapping, "LUN mapping destroyed"),
        }
    }
    Ok(())
}

/// Create a fresh volume; an existing volume is fine as long as its size matches.
async fn create_new_volume(
    provider: &dyn Provider,
    path: &str,
    size: u64,
    sparse_volume: bool,
) -> Result<(), Status> {
    let error = match provider
        .create_volume(CreateVolumeParams {
            path: path.to_string(),
            volume_size: size,
            sparse_volume,
        })
        .await
    {
        Ok(()) => {
            info!(volume = path, size = %utils::bytes::into_human(size), "Volume created");
            return Ok(());
        }
        Err(error) => error,
    };
    if !error.is_already_exist() {
        return Err(failure!(Code::Internal, "Cannot create volume '{}': {}", path, error));
    }
    let existing = provider.get_volume(path).await.map_err(|error| {
        failure!(Code::Internal, "Cannot get existing volume '{}': {}", path, error)
    })?;
    if existing.volume_size != size {
        return Err(failure!(
            Code::AlreadyExists,
            "Volume '{}' already exists, but with a different size: requested={}, existing={}",
            path,
            size,
            existing.volume_size
        ));
    }
    info!(volume = path, "Volume already exists");
    Ok(())
}

/// Clone a snapshot into a new volume.
async fn create_volume_from_snapshot(
    provider: &dyn Provider,
    snapshot_path: &str,
    path: &str,
) -> Result<(), Status> {
    let snapshot = provider.get_snapshot(snapshot_path).await.map_err(|error| {
        failure!(Code::NotFound, "Failed to find snapshot '{}': {}", snapshot_path, error)
    })?;
    match provider
        .clone_snapshot(
            &snapshot.path,
            CloneSnapshotParams {
                target_path: path.to_string(),
            },
        )
        .await
    {
        Ok(()) => info!(volume = path, snapshot = snapshot_path, "Volume cloned"),
        Err(error) if error.is_already_exist() => {
            info!(volume = path, "Volume already exists")
        }
        Err(error) => {
            return Err(failure!(
                Code::Internal,
                "Cannot create volume '{}' using snapshot '{}': {}",
                path,
                snapshot_path,
                error
            ))
        }
    }
    Ok(())
}

/// Clone a volume through a snapshot taken for the purpose.
async fn create_cloned_volume(
    provider: &dyn Provider,
    source_path: &str,
    name: &str,
    path: &str,
) -> Result<(), Status> {
    let snapshot_name = format!("{}-{name}", utils::CLONE_SNAPSHOT_PREFIX);
    let snapshot = create_snapshot_on_appliance(provider, source_path, &snapshot_name).await?;
    match provider
        .clone_snapshot(
            &snapshot.path,
            CloneSnapshotParams {
                target_path: path.to_string(),
            },
        )
        .await
    {
        Ok(()) => info!(volume = path, source = source_path, "Volume cloned"),
        Err(error) if error.is_already_exist() => {
            info!(volume = path, "Volume already exists")
        }
        Err(error) => {
            return Err(failure!(
                Code::NotFound,
                "Cannot create volume '{}' using snapshot '{}': {}",
                path,
                snapshot.path,
                error
            ))
        }
    }
    Ok(())
}

/// Take a snapshot of the volume. Snapshot names are unique across the volumes of a volume
/// group, as the orchestrator knows snapshots by name only.
async fn create_snapshot_on_appliance(
    provider: &dyn Provider,
    volume_path: &str,
    name: &str,
) -> Result<NsSnapshot, Status> {
    let parent = volume_path
        .rsplit_once('/')
        .map_or(volume_path, |(parent, _)| parent);
    let snapshots = provider.get_snapshots(parent, true).await.map_err(|error| {
        failure!(Code::NotFound, "Cannot get snapshots list for '{}': {}", parent, error)
    })?;
    if let Some(existing) = snapshots
        .iter()
        .find(|s| s.name == name && s.parent != volume_path)
    {
        return Err(failure!(
            Code::AlreadyExists,
            "Snapshot '{}' already exists for filesystem: {}",
            name,
            existing.path
        ));
    }

    let path = format!("{volume_path}@{name}");
    match provider.create_snapshot(&path).await {
        Ok(()) => info!(snapshot = %path, "Snapshot created"),
        Err(error) if error.is_already_exist() => debug!(snapshot = %path, "Snapshot exists"),
        Err(error) => {
            return Err(failure!(Code::Internal, "Cannot create snapshot '{}': {}", path, error))
        }
    }
    provider.get_snapshot(&path).await.map_err(|error| {
        failure!(Code::Internal, "Cannot get created snapshot '{}': {}", path, error)
    })
}

fn snapshot_to_csi(config_name: &str, snapshot: NsSnapshot) -> Snapshot {
    Snapshot {
        size_bytes: 0,
        snapshot_id: format!("{config_name}:{}", snapshot.path),
        source_volume_id: format!("{config_name}:{}", snapshot.parent),
        creation_time: Some(prost_types::Timestamp {
            seconds: snapshot.creation_time.timestamp(),
            nanos: snapshot.creation_time.timestamp_subsec_nanos() as i32,
        }),
        ready_to_use: true,
    }
}

#[tonic::async_trait]
impl rpc::csi::controller_server::Controller for CsiControllerSvc {
    #[instrument(err, skip_all, fields(volume.name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let args = request.into_inner();
        if args.name.is_empty() {
            return Err(Status::invalid_argument("req.Name must be provided"));
        }
        let snapshot = self.refresh(&args.secrets)?;

        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "req.VolumeCapabilities must be provided",
            ));
        }
        check_volume_capabilities(&args.volume_capabilities)?;
        let params = CreateParams::try_from(&args.parameters)?;

        let size = match args.capacity_range.as_ref().map(|r| r.required_bytes) {
            Some(bytes) if bytes < 0 => {
                return Err(Status::invalid_argument(
                    "Volume size must be a non-negative number",
                ))
            }
            Some(bytes) if bytes > 0 => bytes as u64,
            _ => utils::DEFAULT_VOLUME_SIZE,
        };

        enum Source {
            Snapshot(SnapshotId),
            Volume(VolumeId),
            Empty,
        }
        let source = match args
            .volume_content_source
            .as_ref()
            .map(|source| source.r#type.as_ref())
        {
            None => Source::Empty,
            Some(Some(volume_content_source::Type::Snapshot(source))) => {
                SnapshotId::from_str(&source.snapshot_id)
                    .map(Source::Snapshot)
                    .map_err(|error| {
                        failure!(Code::NotFound, "SnapshotId is in wrong format: {}", error)
                    })?
            }
            Some(Some(volume_content_source::Type::Volume(source))) => {
                VolumeId::from_str(&source.volume_id)
                    .map(Source::Volume)
                    .map_err(|error| {
                        failure!(Code::NotFound, "VolumeId is in wrong format: {}", error)
                    })?
            }
            Some(None) => {
                return Err(Status::invalid_argument(
                    "Only snapshots and volumes are supported as volume content source",
                ))
            }
        };
        let config_name = match &source {
            Source::Snapshot(id) => Some(id.volume().config_name()),
            Source::Volume(id) => Some(id.config_name()),
            Source::Empty => params.config_name(),
        };

        let _permit = self.create_volume_permit().await?;
        let _guard = VolumeOpGuard::new(&args.name)?;

        let zone = pick_availability_zone(args.accessibility_requirements.as_ref());
        let resolved = resolve(
            &snapshot,
            params.volume_group(),
            zone.as_deref(),
            config_name,
        )
        .await?;
        let appliance = snapshot
            .appliance(&resolved.config_name)
            .ok_or_else(|| Status::internal("Resolved appliance has no config"))?;
        let provider = resolved.provider.as_ref();
        let path = format!("{}/{}", resolved.volume_group, args.name);

        match &source {
            Source::Snapshot(id) => create_volume_from_snapshot(provider, &id.path(), &path).await?,
            Source::Volume(id) => {
                create_cloned_volume(provider, id.path(), &args.name, &path).await?
            }
            Source::Empty => {
                create_new_volume(provider, &path, size, params.sparse_volume()).await?
            }
        }
        // a clone has the size of its source
        let capacity = match &source {
            Source::Empty => size,
            _ => provider
                .get_volume(&path)
                .await
                .map_err(|error| {
                    failure!(Code::Internal, "Cannot get cloned volume '{}': {}", path, error)
                })?
                .volume_size,
        };

        let context = params.volume_context(appliance, &resolved.volume_group)?;
        let volume_id = VolumeId::new(&resolved.config_name, &path);
        debug!(volume.id = %volume_id, ?context, "Volume context");
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(rpc::csi::Volume {
                capacity_bytes: capacity as i64,
                volume_id: volume_id.to_string(),
                volume_context: context.into_map(),
                content_source: args.volume_content_source,
                accessible_topology: zone
                    .map(|zone| CsiTopology {
                        segments: HashMap::from([(
                            utils::CSI_TOPOLOGY_KEY_ZONE.to_string(),
                            zone,
                        )]),
                    })
                    .into_iter()
                    .collect(),
            }),
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let args = request.into_inner();
        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID must be provided"));
        }
        let snapshot = self.refresh(&args.secrets)?;

        let (volume, volume_group) = match parse_volume_id(&args.volume_id) {
            Ok(parsed) => parsed,
            Err(error) => {
                info!(%error, "Got wrong volumeId, but that is OK for deletion");
                return Ok(Response::new(DeleteVolumeResponse {}));
            }
        };
        let _guard = VolumeOpGuard::new(&args.volume_id)?;
        let Some(resolved) = resolve_existing(&snapshot, &volume, &volume_group).await? else {
            return Ok(Response::new(DeleteVolumeResponse {}));
        };
        let provider = resolved.provider.as_ref();

        destroy_lun_mappings(provider, volume.path()).await?;
        match provider
            .destroy_volume(
                volume.path(),
                DestroyVolumeParams {
                    destroy_snapshots: true,
                    promote_most_recent_clone_if_exists: true,
                },
            )
            .await
        {
            Ok(()) => info!(volume.id = %volume, "Volume deleted"),
            Err(error) if error.is_not_exist() => {
                info!(volume.id = %volume, "Volume not found, that's OK for deletion request")
            }
            Err(error) => {
                return Err(failure!(
                    Code::Internal,
                    "Cannot delete '{}' volume: {}",
                    volume.path(),
                    error
                ))
            }
        }
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let args = request.into_inner();
        if args.volume_capability.is_none() {
            return Err(Status::invalid_argument("Volume capability not provided"));
        }
        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID not provided"));
        }
        if args.node_id.is_empty() {
            return Err(Status::invalid_argument("Node ID not provided"));
        }
        let snapshot = self.refresh(&args.secrets)?;

        let volume = VolumeId::from_str(&args.volume_id).map_err(|error| {
            failure!(Code::NotFound, "VolumeId is in wrong format: {}", error)
        })?;
        let resolved = resolve(
            &snapshot,
            volume.volume_group().ok(),
            None,
            Some(volume.config_name()),
        )
        .await?;
        if let Err(error) = resolved.provider.get_volume(volume.path()).await {
            warn!(%error, "Failed to get volume");
            return Err(Status::not_found(format!(
                "Volume {} not found on NexentaStor",
                volume.path()
            )));
        }

        // All attach operations are done when the node stages the volume.
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: HashMap::new(),
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let args = request.into_inner();
        let snapshot = self.refresh(&args.secrets)?;
        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID must be provided"));
        }

        let (volume, volume_group) = match parse_volume_id(&args.volume_id) {
            Ok(parsed) => parsed,
            Err(error) => {
                info!(%error, "Got wrong volumeId, but that is OK for unpublish");
                return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
            }
        };
        let _guard = VolumeOpGuard::new(&args.volume_id)?;
        let Some(resolved) = resolve_existing(&snapshot, &volume, &volume_group).await? else {
            return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
        };
        let provider = resolved.provider.as_ref();

        let path = volume.path();
        destroy_lun_mappings(provider, path).await?;
        self.unpublish_policy
            .retry(|_| async move {
                let mappings = provider
                    .get_lun_mappings(LunMappingFilter::volume(path))
                    .await
                    .map_err(|error| error.to_string())?;
                match mappings.len() {
                    0 => Ok(()),
                    count => Err(format!("{count} LUN mapping(s) left")),
                }
            })
            .await
            .map_err(|error| {
                failure!(
                    Code::DeadlineExceeded,
                    "Luns did not get deleted in {}: {}",
                    humantime::format_duration(self.unpublish_policy.deadline()),
                    error
                )
            })?;

        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let args = request.into_inner();
        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID must be provided"));
        }
        VolumeId::from_str(&args.volume_id).map_err(|error| {
            failure!(Code::NotFound, "VolumeId is in wrong format: {}", error)
        })?;
        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "req.VolumeCapabilities must be provided",
            ));
        }
        self.refresh(&args.secrets)?;

        let response = match check_volume_capabilities(&args.volume_capabilities) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: args.volume_context,
                    volume_capabilities: args.volume_capabilities,
                    parameters: args.parameters,
                }),
                message: String::new(),
            },
            Err(status) => {
                warn!("{}", status.message());
                ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: status.message().to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(err, skip_all, fields(max_entries = request.get_ref().max_entries))]
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let args = request.into_inner();
        if args.max_entries < 0 {
            return Err(Status::invalid_argument(format!(
                "req.MaxEntries must be 0 or greater, got: {}",
                args.max_entries
            )));
        }
        let snapshot = self.refresh(&HashMap::new())?;

        let mut volumes = Vec::new();
        for (config_name, _) in snapshot.appliances() {
            let resolved = resolve(&snapshot, None, None, Some(config_name.as_str())).await?;
            let found = resolved
                .provider
                .get_volumes(&resolved.volume_group)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Cannot list volumes of '{}': {}",
                        resolved.volume_group,
                        error
                    )
                })?;
            volumes.extend(found.into_iter().map(|v| (config_name.clone(), v)));
        }

        let page = paginate(
            volumes,
            |(_, volume)| volume.path.as_str(),
            &args.starting_token,
            args.max_entries,
        )?;
        debug!(entries = page.entries.len(), next_token = %page.next_token, "Volumes listed");
        Ok(Response::new(ListVolumesResponse {
            entries: page
                .entries
                .into_iter()
                .map(|(config_name, volume)| list_volumes_response::Entry {
                    volume: Some(rpc::csi::Volume {
                        capacity_bytes: volume.volume_size as i64,
                        volume_id: VolumeId::new(&config_name, &volume.path).to_string(),
                        ..Default::default()
                    }),
                    status: None,
                })
                .collect(),
            next_token: page.next_token,
        }))
    }

    #[instrument(err, skip_all)]
    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        let args = request.into_inner();
        if let Err(status) = check_volume_capabilities(&args.volume_capabilities) {
            debug!("{}", status.message());
            return Ok(Response::new(GetCapacityResponse::default()));
        }
        let snapshot = self.refresh(&HashMap::new())?;
        let params = CreateParams::try_from(&args.parameters)?;
        let zone = args
            .accessible_topology
            .as_ref()
            .and_then(|topology| topology.segments.get(utils::CSI_TOPOLOGY_KEY_ZONE));

        let resolved = resolve(
            &snapshot,
            params.volume_group(),
            zone.map(String::as_str),
            params.config_name(),
        )
        .await?;
        let volume_group = resolved
            .provider
            .get_volume_group(&resolved.volume_group)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Cannot get volume group '{}': {}",
                    resolved.volume_group,
                    error
                )
            })?;
        let available_capacity = volume_group.bytes_available as i64;
        debug!(
            volume_group = %resolved.volume_group,
            available_capacity, "Available capacity"
        );
        Ok(Response::new(GetCapacityResponse {
            available_capacity,
            maximum_volume_size: Some(available_capacity),
            minimum_volume_size: None,
        }))
    }

    #[instrument(err, skip_all)]
    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: controller_capabilities(),
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().source_volume_id, snapshot.name = %request.get_ref().name))]
    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let args = request.into_inner();
        if args.source_volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "Snapshot source volume ID must be provided",
            ));
        }
        if args.name.is_empty() {
            return Err(Status::invalid_argument("Snapshot name must be provided"));
        }
        let snapshot = self.refresh(&args.secrets)?;

        let volume = VolumeId::from_str(&args.source_volume_id).map_err(|error| {
            failure!(Code::InvalidArgument, "VolumeId is in wrong format: {}", error)
        })?;
        let volume_group = volume.volume_group().map_err(|error| {
            failure!(Code::InvalidArgument, "VolumeId is in wrong format: {}", error)
        })?;
        let _guard = VolumeOpGuard::new(&args.source_volume_id)?;
        let resolved = resolve(
            &snapshot,
            Some(volume_group),
            None,
            Some(volume.config_name()),
        )
        .await?;

        let created =
            create_snapshot_on_appliance(resolved.provider.as_ref(), volume.path(), &args.name)
                .await?;
        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(snapshot_to_csi(volume.config_name(), created)),
        }))
    }

    #[instrument(err, skip_all, fields(snapshot.id = %request.get_ref().snapshot_id))]
    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let args = request.into_inner();
        if args.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("Snapshot ID must be provided"));
        }
        let snapshot = self.refresh(&args.secrets)?;

        let id = match SnapshotId::from_str(&args.snapshot_id) {
            Ok(id) => id,
            Err(IdError::NoSnapshotName { .. }) if !args.snapshot_id.contains('@') => {
                info!("Snapshot not found, that's OK for deletion request");
                return Ok(Response::new(DeleteSnapshotResponse {}));
            }
            Err(error) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "SnapshotId is in wrong format: {}",
                    error
                ))
            }
        };
        let volume_group = id.volume().volume_group().map_err(|error| {
            failure!(Code::InvalidArgument, "SnapshotId is in wrong format: {}", error)
        })?;
        let Some(resolved) = resolve_existing(&snapshot, id.volume(), volume_group).await? else {
            return Ok(Response::new(DeleteSnapshotResponse {}));
        };

        let path = id.path();
        match resolved.provider.destroy_snapshot(&path).await {
            Ok(()) => info!(snapshot = %path, "Snapshot deleted"),
            Err(error) if error.is_not_exist() => {
                info!(snapshot = %path, "Snapshot not found, that's OK for deletion request")
            }
            Err(error) if error.is_busy() => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to delete snapshot '{}', it has dependent filesystem: {}",
                    path,
                    error
                ))
            }
            Err(error) => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to delete snapshot '{}': {}",
                    path,
                    error
                ))
            }
        }
        Ok(Response::new(DeleteSnapshotResponse {}))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().source_volume_id, snapshot.id = %request.get_ref().snapshot_id))]
    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        let args = request.into_inner();
        if args.max_entries < 0 {
            return Err(Status::invalid_argument(format!(
                "req.MaxEntries must be 0 or greater, got: {}",
                args.max_entries
            )));
        }
        let snapshot = self.refresh(&args.secrets)?;
        let empty = || Ok(Response::new(ListSnapshotsResponse::default()));

        let snapshots = if !args.snapshot_id.is_empty() {
            let Ok(id) = SnapshotId::from_str(&args.snapshot_id) else {
                return empty();
            };
            let Ok(volume_group) = id.volume().volume_group() else {
                return empty();
            };
            let Some(resolved) = resolve_existing(&snapshot, id.volume(), volume_group).await?
            else {
                return empty();
            };
            match resolved.provider.get_snapshot(&id.path()).await {
                Ok(found) => vec![(resolved.config_name, found)],
                Err(error) if error.is_not_exist() => return empty(),
                Err(error) => {
                    return Err(failure!(
                        Code::Internal,
                        "Cannot get snapshot '{}': {}",
                        id.path(),
                        error
                    ))
                }
            }
        } else if !args.source_volume_id.is_empty() {
            let Ok(volume) = VolumeId::from_str(&args.source_volume_id) else {
                return empty();
            };
            let Ok(volume_group) = volume.volume_group() else {
                return empty();
            };
            let Some(resolved) = resolve_existing(&snapshot, &volume, volume_group).await? else {
                return empty();
            };
            resolved
                .provider
                .get_snapshots(volume.path(), true)
                .await
                .map_err(|error| {
                    failure!(
                        Code::Internal,
                        "Cannot get snapshot list for '{}': {}",
                        volume.path(),
                        error
                    )
                })?
                .into_iter()
                .map(|s| (resolved.config_name.clone(), s))
                .collect()
        } else {
            let mut snapshots = Vec::new();
            for (config_name, _) in snapshot.appliances() {
                let resolved = match resolve(&snapshot, None, None, Some(config_name.as_str())).await {
                    Ok(resolved) => resolved,
                    Err(status) if status.code() == Code::NotFound => {
                        warn!(config = %config_name, "{}", status.message());
                        continue;
                    }
                    Err(status) => return Err(status),
                };
                let found = resolved
                    .provider
                    .get_snapshots(&resolved.volume_group, true)
                    .await
                    .map_err(|error| {
                        failure!(
                            Code::Internal,
                            "Cannot get snapshot list for '{}': {}",
                            resolved.volume_group,
                            error
                        )
                    })?;
                snapshots.extend(found.into_iter().map(|s| (config_name.clone(), s)));
            }
            snapshots
        };

        let page = paginate(
            snapshots,
            |(_, snapshot)| snapshot.path.as_str(),
            &args.starting_token,
            args.max_entries,
        )?;
        Ok(Response::new(ListSnapshotsResponse {
            entries: page
                .entries
                .into_iter()
                .map(|(config_name, snapshot)| list_snapshots_response::Entry {
                    snapshot: Some(snapshot_to_csi(&config_name, snapshot)),
                })
                .collect(),
            next_token: page.next_token,
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let args = request.into_inner();
        let snapshot = self.refresh(&args.secrets)?;
        let required_bytes = args.capacity_range.as_ref().map_or(0, |r| r.required_bytes);
        if required_bytes <= 0 {
            return Err(Status::invalid_argument("GetRequiredBytes must be >0"));
        }
        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID must be provided"));
        }
        let volume = VolumeId::from_str(&args.volume_id).map_err(|error| {
            failure!(Code::InvalidArgument, "VolumeId is in wrong format: {}", error)
        })?;
        let Ok(volume_group) = volume.volume_group() else {
            info!("Got wrong volumeId, but that is OK for expansion");
            return Ok(Response::new(ControllerExpandVolumeResponse::default()));
        };
        let _guard = VolumeOpGuard::new(&args.volume_id)?;
        let resolved = resolve(
            &snapshot,
            Some(volume_group),
            None,
            Some(volume.config_name()),
        )
        .await?;
        let provider = resolved.provider.as_ref();

        let current = provider.get_volume(volume.path()).await.map_err(|error| {
            match error.is_not_exist() {
                true => failure!(Code::NotFound, "Volume '{}' not found: {}", volume.path(), error),
                false => failure!(Code::Internal, "Cannot get volume '{}': {}", volume.path(), error),
            }
        })?;
        let required_bytes = required_bytes as u64;
        if current.volume_size >= required_bytes {
            debug!(size = current.volume_size, "Volume is already large enough");
            return Ok(Response::new(ControllerExpandVolumeResponse {
                capacity_bytes: current.volume_size as i64,
                node_expansion_required: false,
            }));
        }

        provider
            .update_volume(
                volume.path(),
                UpdateVolumeParams {
                    volume_size: required_bytes,
                },
            )
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to expand volume '{}': {}",
                    volume.path(),
                    error
                )
            })?;
        info!(
            from = %utils::bytes::into_human(current.volume_size),
            to = %utils::bytes::into_human(required_bytes),
            "Volume expanded"
        );
        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: required_bytes as i64,
            node_expansion_required: true,
        }))
    }

    #[instrument(err, skip_all, fields(volume.id = %request.get_ref().volume_id))]
    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        let args = request.into_inner();
        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID must be provided"));
        }
        let snapshot = self.refresh(&HashMap::new())?;
        let volume = VolumeId::from_str(&args.volume_id).map_err(|error| {
            failure!(Code::NotFound, "VolumeId is in wrong format: {}", error)
        })?;
        let resolved = resolve(
            &snapshot,
            volume.volume_group().ok(),
            None,
            Some(volume.config_name()),
        )
        .await?;

        let (capacity_bytes, condition) = match resolved.provider.get_volume(volume.path()).await {
            Ok(found) => (
                found.volume_size as i64,
                VolumeCondition {
                    abnormal: false,
                    message: "Volume is available".to_string(),
                },
            ),
            Err(error) if error.is_not_exist() => {
                return Err(Status::not_found(format!(
                    "Volume {} not found on NexentaStor",
                    volume.path()
                )))
            }
            Err(error) => (
                0,
                VolumeCondition {
                    abnormal: true,
                    message: format!("Cannot get volume: {error}"),
                },
            ),
        };
        Ok(Response::new(ControllerGetVolumeResponse {
            volume: Some(rpc::csi::Volume {
                capacity_bytes,
                volume_id: args.volume_id,
                ..Default::default()
            }),
            status: Some(controller_get_volume_response::VolumeStatus {
                published_node_ids: vec![],
                volume_condition: Some(condition),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_driver::config::ConfigStore;
    use nexentastor::mock::{MockConnector, MockProvider};
    use rpc::csi::controller_server::Controller;
    use std::io::Write;
    use utils::bytes::GIB;

    const CONFIG: &str = r#"
nexentastor_map:
  ns-1:
    restIp: https://10.0.0.1:8443
    username: admin
    password: verysecretpassword
    zone: zone-1
    defaultVolumeGroup: pool1/vg1
    defaultDataIp: 10.0.1.1
    numOfLunsPerTarget: 16
  ns-2:
    restIp: https://10.0.0.2:8443
    username: admin
    password: verysecretpassword
    zone: zone-2
    defaultVolumeGroup: pool2/vg2
    defaultDataIp: 10.0.2.1
"#;

    struct Fixture {
        svc: CsiControllerSvc,
        ns1: Arc<MockProvider>,
        ns2: Arc<MockProvider>,
        _config: tempfile::NamedTempFile,
    }

    fn fixture() -> Fixture {
        let connector = MockConnector::default();
        let ns1 = connector.add(Arc::new(
            MockProvider::new("https://10.0.0.1:8443")
                .with_volume_group("pool1/vg1", 100 * GIB)
                .with_volume("pool1/vg1/vol-a", 10 * GIB)
                .with_volume("pool1/vg1/vol-b", 20 * GIB),
        ));
        let ns2 = connector.add(Arc::new(
            MockProvider::new("https://10.0.0.2:8443").with_volume_group("pool2/vg2", 50 * GIB),
        ));
        let mut config = tempfile::NamedTempFile::new().unwrap();
        config.write_all(CONFIG.as_bytes()).unwrap();
        let store = Arc::new(ConfigStore::new(config.path(), Arc::new(connector)));
        let svc = CsiControllerSvc::new(store, 4).with_unpublish_policy(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        ));
        Fixture {
            svc,
            ns1,
            ns2,
            _config: config,
        }
    }

    /// Add a volume of its own to a test, so that no two tests hold the guard of one volume.
    async fn add_volume(f: &Fixture, name: &str, volume_size: u64) -> String {
        let path = format!("pool1/vg1/{name}");
        f.ns1
            .create_volume(CreateVolumeParams {
                path: path.clone(),
                volume_size,
                sparse_volume: true,
            })
            .await
            .unwrap();
        format!("ns-1:{path}")
    }

    fn capability(mode: volume_capability::access_mode::Mode) -> VolumeCapability {
        VolumeCapability {
            access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
            access_type: Some(volume_capability::AccessType::Mount(
                volume_capability::MountVolume::default(),
            )),
        }
    }

    fn create_request(name: &str, bytes: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![capability(
                volume_capability::access_mode::Mode::SingleNodeWriter,
            )],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_volume() {
        let f = fixture();
        let volume = f
            .svc
            .create_volume(Request::new(create_request("pvc-1", GIB as i64)))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(volume.volume_id, "ns-1:pool1/vg1/pvc-1");
        assert_eq!(volume.volume_context["DataIP"], "10.0.1.1");
        assert_eq!(volume.volume_context["numOfLunsPerTarget"], "16");
        assert_eq!(volume.volume_context["VolumeGroup"], "pool1/vg1");
        assert!(volume.accessible_topology.is_empty());
        assert!(f.ns1.volumes().iter().any(|v| v.path == "pool1/vg1/pvc-1"));

        // same size is fine, a different one is not
        f.svc
            .create_volume(Request::new(create_request("pvc-1", GIB as i64)))
            .await
            .unwrap();
        let error = f
            .svc
            .create_volume(Request::new(create_request("pvc-1", 2 * GIB as i64)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn create_volume_defaults_and_zone() {
        let f = fixture();
        let mut request = create_request("pvc-2", 0);
        request.accessibility_requirements = Some(TopologyRequirement {
            requisite: vec![CsiTopology {
                segments: HashMap::from([(
                    utils::CSI_TOPOLOGY_KEY_ZONE.to_string(),
                    "zone-1".to_string(),
                )]),
            }],
            preferred: vec![CsiTopology {
                segments: HashMap::from([(
                    utils::CSI_TOPOLOGY_KEY_ZONE.to_string(),
                    "zone-2".to_string(),
                )]),
            }],
        });
        let volume = f
            .svc
            .create_volume(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(volume.volume_id, "ns-2:pool2/vg2/pvc-2");
        assert_eq!(volume.capacity_bytes, utils::DEFAULT_VOLUME_SIZE as i64);
        assert_eq!(
            volume.accessible_topology[0].segments[utils::CSI_TOPOLOGY_KEY_ZONE],
            "zone-2"
        );
        assert_eq!(f.ns2.volumes()[0].volume_size, utils::DEFAULT_VOLUME_SIZE);
    }

    #[tokio::test]
    async fn create_volume_invalid_requests() {
        let f = fixture();
        let error = f
            .svc
            .create_volume(Request::new(create_request("", 1)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);

        let mut request = create_request("pvc-3", 1);
        request.volume_capabilities = vec![capability(
            volume_capability::access_mode::Mode::SingleNodeMultiWriter,
        )];
        let error = f.svc.create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(error.code(), Code::FailedPrecondition);

        let mut request = create_request("pvc-3", 1);
        request
            .parameters
            .insert("sparseVolume".to_string(), "maybe".to_string());
        let error = f.svc.create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);

        let mut request = create_request("pvc-3", 1);
        request.volume_content_source = Some(VolumeContentSource { r#type: None });
        let error = f.svc.create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn clone_volume() {
        let f = fixture();
        let mut request = create_request("pvc-clone", GIB as i64);
        request.volume_content_source = Some(VolumeContentSource {
            r#type: Some(volume_content_source::Type::Volume(
                volume_content_source::VolumeSource {
                    volume_id: "ns-1:pool1/vg1/vol-a".to_string(),
                },
            )),
        });
        let volume = f
            .svc
            .create_volume(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(volume.volume_id, "ns-1:pool1/vg1/pvc-clone");
        assert_eq!(volume.capacity_bytes, 10 * GIB as i64);
        assert!(volume.content_source.is_some());
        assert!(f
            .ns1
            .snapshots()
            .iter()
            .any(|s| s.path == "pool1/vg1/vol-a@k8s-clone-snapshot-pvc-clone"));
        assert!(f.ns1.volumes().iter().any(|v| v.path == "pool1/vg1/pvc-clone"));
    }

    #[tokio::test]
    async fn delete_volume_is_idempotent() {
        let f = fixture();
        let volume_id = add_volume(&f, "vol-delete", GIB).await;
        for volume_id in ["garbage", "ns-1:pool1", "ns-1:a/b/c/d", "ns-9:pool9/vg9/x"] {
            f.svc
                .delete_volume(Request::new(DeleteVolumeRequest {
                    volume_id: volume_id.to_string(),
                    secrets: HashMap::new(),
                }))
                .await
                .unwrap();
        }
        for _ in 0 .. 2 {
            f.svc
                .delete_volume(Request::new(DeleteVolumeRequest {
                    volume_id: volume_id.clone(),
                    secrets: HashMap::new(),
                }))
                .await
                .unwrap();
        }
        assert!(f.ns1.volumes().iter().all(|v| v.path != "pool1/vg1/vol-delete"));
        let error = f
            .svc
            .delete_volume(Request::new(DeleteVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn snapshots() {
        let f = fixture();
        let create = |volume: &str, name: &str| CreateSnapshotRequest {
            source_volume_id: volume.to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        let snapshot = f
            .svc
            .create_snapshot(Request::new(create("ns-1:pool1/vg1/vol-a", "snap-1")))
            .await
            .unwrap()
            .into_inner()
            .snapshot
            .unwrap();
        assert_eq!(snapshot.snapshot_id, "ns-1:pool1/vg1/vol-a@snap-1");
        assert_eq!(snapshot.source_volume_id, "ns-1:pool1/vg1/vol-a");
        assert!(snapshot.ready_to_use);
        assert!(snapshot.creation_time.is_some());

        // again on the same volume is fine, on a sibling volume it is not
        f.svc
            .create_snapshot(Request::new(create("ns-1:pool1/vg1/vol-a", "snap-1")))
            .await
            .unwrap();
        let error = f
            .svc
            .create_snapshot(Request::new(create("ns-1:pool1/vg1/vol-b", "snap-1")))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::AlreadyExists);

        let error = f
            .svc
            .create_snapshot(Request::new(create("ns-1:pool1/vol-a", "snap-2")))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);

        let listed = f
            .svc
            .list_snapshots(Request::new(ListSnapshotsRequest {
                snapshot_id: "ns-1:pool1/vg1/vol-a@snap-1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.entries.len(), 1);
        let listed = f
            .svc
            .list_snapshots(Request::new(ListSnapshotsRequest {
                snapshot_id: "ns-1:pool1/vg1/vol-a@missing".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(listed.entries.is_empty());

        for snapshot_id in ["ns-1:pool1/vg1/vol-a@snap-1", "no-at-sign", "ns-1:pool1/vg1/vol-a@snap-1"] {
            f.svc
                .delete_snapshot(Request::new(DeleteSnapshotRequest {
                    snapshot_id: snapshot_id.to_string(),
                    secrets: HashMap::new(),
                }))
                .await
                .unwrap();
        }
        assert!(f.ns1.snapshots().is_empty());
        let error = f
            .svc
            .delete_snapshot(Request::new(DeleteSnapshotRequest {
                snapshot_id: "ns-1:pool1/vol-a@snap-1".to_string(),
                secrets: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn list_snapshots_pages() {
        let f = fixture();
        let volume_id = add_volume(&f, "vol-snaps", GIB).await;
        for name in ["s1", "s2", "s3"] {
            f.svc
                .create_snapshot(Request::new(CreateSnapshotRequest {
                    source_volume_id: volume_id.clone(),
                    name: name.to_string(),
                    ..Default::default()
                }))
                .await
                .unwrap();
        }
        let page = f
            .svc
            .list_snapshots(Request::new(ListSnapshotsRequest {
                max_entries: 2,
                source_volume_id: volume_id.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_token, "pool1/vg1/vol-snaps@s3");

        let page = f
            .svc
            .list_snapshots(Request::new(ListSnapshotsRequest {
                max_entries: 2,
                starting_token: page.next_token,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(page.entries.len(), 1);
        assert!(page.next_token.is_empty());
        let snapshot = page.entries[0].snapshot.as_ref().unwrap();
        assert_eq!(snapshot.snapshot_id, "ns-1:pool1/vg1/vol-snaps@s3");
        assert_eq!(snapshot.source_volume_id, volume_id);
    }

    #[tokio::test]
    async fn list_volumes_pages() {
        let f = fixture();
        let page = f
            .svc
            .list_volumes(Request::new(ListVolumesRequest {
                max_entries: 1,
                starting_token: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(page.entries.len(), 1);
        let volume = page.entries[0].volume.as_ref().unwrap();
        assert_eq!(volume.volume_id, "ns-1:pool1/vg1/vol-a");
        assert_eq!(volume.capacity_bytes, 10 * GIB as i64);
        assert_eq!(page.next_token, "pool1/vg1/vol-b");

        let page = f
            .svc
            .list_volumes(Request::new(ListVolumesRequest {
                max_entries: 1,
                starting_token: page.next_token,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            page.entries[0].volume.as_ref().unwrap().volume_id,
            "ns-1:pool1/vg1/vol-b"
        );
        assert!(page.next_token.is_empty());

        let error = f
            .svc
            .list_volumes(Request::new(ListVolumesRequest {
                max_entries: 1,
                starting_token: "pool1/vg1/nope".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::Aborted);
        let error = f
            .svc
            .list_volumes(Request::new(ListVolumesRequest {
                max_entries: -1,
                starting_token: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn expand_volume() {
        let f = fixture();
        let volume_id = add_volume(&f, "vol-expand", 10 * GIB).await;
        let expand = |volume_id: &str, bytes: u64| ControllerExpandVolumeRequest {
            volume_id: volume_id.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: bytes as i64,
                limit_bytes: 0,
            }),
            ..Default::default()
        };
        let response = f
            .svc
            .controller_expand_volume(Request::new(expand(&volume_id, 15 * GIB)))
            .await
            .unwrap()
            .into_inner();
        assert!(response.node_expansion_required);
        assert_eq!(response.capacity_bytes, 15 * GIB as i64);
        assert!(f
            .ns1
            .volumes()
            .iter()
            .any(|v| v.path == "pool1/vg1/vol-expand" && v.volume_size == 15 * GIB));

        let response = f
            .svc
            .controller_expand_volume(Request::new(expand(&volume_id, 5 * GIB)))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.node_expansion_required);

        let error = f
            .svc
            .controller_expand_volume(Request::new(expand(&volume_id, 0)))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::InvalidArgument);
        f.svc
            .controller_expand_volume(Request::new(expand("ns-1:pool1", GIB)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_and_unpublish() {
        let f = fixture();
        let volume_id = add_volume(&f, "vol-publish", GIB).await;
        let publish = |volume_id: &str| ControllerPublishVolumeRequest {
            volume_id: volume_id.to_string(),
            node_id: "node-1".to_string(),
            volume_capability: Some(capability(
                volume_capability::access_mode::Mode::SingleNodeWriter,
            )),
            ..Default::default()
        };
        f.svc
            .controller_publish_volume(Request::new(publish(&volume_id)))
            .await
            .unwrap();
        let error = f
            .svc
            .controller_publish_volume(Request::new(publish("ns-1:pool1/vg1/vol-z")))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::NotFound);
        let error = f
            .svc
            .controller_publish_volume(Request::new(publish("bad")))
            .await
            .unwrap_err();
        assert_eq!(error.code(), Code::NotFound);

        let unpublish = |volume_id: &str| ControllerUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            ..Default::default()
        };
        f.svc
            .controller_unpublish_volume(Request::new(unpublish(&volume_id)))
            .await
            .unwrap();
        f.svc
            .controller_unpublish_volume(Request::new(unpublish("bad")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capacity_and_capabilities() {
        let f = fixture();
        let capacity = f
            .svc
            .get_capacity(Request::new(GetCapacityRequest {
                accessible_topology: Some(CsiTopology {
                    segments: HashMap::from([(
                        utils::CSI_TOPOLOGY_KEY_ZONE.to_string(),
                        "zone-2".to_string(),
                    )]),
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(capacity.available_capacity, 50 * GIB as i64);
        assert_eq!(capacity.maximum_volume_size, Some(50 * GIB as i64));

        let validated = f
            .svc
            .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
                volume_id: "ns-1:pool1/vg1/vol-a".to_string(),
                volume_capabilities: vec![capability(
                    volume_capability::access_mode::Mode::SingleNodeSingleWriter,
                )],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(validated.confirmed.is_none());
        assert!(!validated.message.is_empty());

        let volume = f
            .svc
            .controller_get_volume(Request::new(ControllerGetVolumeRequest {
                volume_id: "ns-1:pool1/vg1/vol-b".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(volume.volume.unwrap().capacity_bytes, 20 * GIB as i64);
        assert!(!volume.status.unwrap().volume_condition.unwrap().abnormal);
    }
}
