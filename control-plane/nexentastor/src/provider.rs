use crate::{error::NefError, types::*};

/// Operations the CSI driver performs against a NexentaStor appliance.
/// Allocation and staging logic is written against this trait only.
#[async_trait::async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// The management address of this appliance.
    fn address(&self) -> &str;

    async fn get_volume_group(&self, path: &str) -> Result<VolumeGroup, NefError>;

    async fn get_volume(&self, path: &str) -> Result<Volume, NefError>;
    /// Volumes directly under the given volume group, ordered by path.
    async fn get_volumes(&self, parent: &str) -> Result<Vec<Volume>, NefError>;
    async fn create_volume(&self, params: CreateVolumeParams) -> Result<(), NefError>;
    async fn update_volume(&self, path: &str, params: UpdateVolumeParams) -> Result<(), NefError>;
    async fn destroy_volume(&self, path: &str, params: DestroyVolumeParams)
        -> Result<(), NefError>;

    async fn get_snapshot(&self, path: &str) -> Result<Snapshot, NefError>;
    /// Snapshots of the given dataset, and of its children when `recursive`, ordered by path.
    async fn get_snapshots(&self, parent: &str, recursive: bool)
        -> Result<Vec<Snapshot>, NefError>;
    async fn create_snapshot(&self, path: &str) -> Result<(), NefError>;
    async fn destroy_snapshot(&self, path: &str) -> Result<(), NefError>;
    async fn clone_snapshot(&self, path: &str, params: CloneSnapshotParams)
        -> Result<(), NefError>;

    async fn get_lun_mappings(&self, filter: LunMappingFilter)
        -> Result<Vec<LunMapping>, NefError>;
    async fn create_lun_mapping(&self, params: CreateLunMappingParams) -> Result<(), NefError>;
    async fn destroy_lun_mapping(&self, id: &str) -> Result<(), NefError>;

    async fn get_iscsi_target(&self, name: &str) -> Result<IscsiTarget, NefError>;
    async fn create_iscsi_target(&self, params: CreateIscsiTargetParams) -> Result<(), NefError>;
    async fn update_iscsi_target(
        &self,
        name: &str,
        params: UpdateIscsiTargetParams,
    ) -> Result<(), NefError>;

    async fn get_target_groups(&self) -> Result<Vec<TargetGroup>, NefError>;
    /// Create the target group, or replace its members if it already exists.
    async fn create_update_target_group(&self, params: GroupParams) -> Result<(), NefError>;

    async fn get_host_groups(&self) -> Result<Vec<HostGroup>, NefError>;
    async fn create_host_group(&self, params: GroupParams) -> Result<(), NefError>;

    async fn get_remote_initiator(&self, name: &str) -> Result<RemoteInitiator, NefError>;
    async fn create_remote_initiator(
        &self,
        name: &str,
        credentials: ChapCredentials,
    ) -> Result<(), NefError>;
    async fn update_remote_initiator(
        &self,
        name: &str,
        credentials: ChapCredentials,
    ) -> Result<(), NefError>;
}
