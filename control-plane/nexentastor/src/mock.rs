//! In-memory NexentaStor appliance.

use crate::{error::NefError, provider::Provider, resolver::*, types::*};

use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

#[derive(Default)]
struct State {
    volume_groups: BTreeMap<String, VolumeGroup>,
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
    lun_mappings: Vec<LunMapping>,
    next_mapping_id: u64,
    racing_mappings: usize,
    targets: BTreeMap<String, IscsiTarget>,
    target_groups: BTreeMap<String, TargetGroup>,
    host_groups: BTreeMap<String, HostGroup>,
    remote_initiators: BTreeMap<String, ChapCredentials>,
    calls: Vec<String>,
    failure: Option<(u16, String, String)>,
    tls_failure: bool,
}

/// An appliance node kept in memory, with the same error behaviour as a real one.
pub struct MockProvider {
    address: String,
    state: Mutex<State>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockProvider({})", self.address)
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

impl MockProvider {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(State::default()),
        }
    }
    pub fn with_volume_group(self, path: &str, bytes_available: u64) -> Self {
        self.state.lock().volume_groups.insert(
            path.to_string(),
            VolumeGroup {
                path: path.to_string(),
                bytes_available,
                bytes_used: 0,
            },
        );
        self
    }
    pub fn with_volume(self, path: &str, volume_size: u64) -> Self {
        self.state.lock().volumes.insert(
            path.to_string(),
            Volume {
                path: path.to_string(),
                volume_size,
            },
        );
        self
    }
    /// Add a target as the only member of its own target group.
    pub fn with_target(self, name: &str, authentication: &str, target_group: &str) -> Self {
        let mut state = self.state.lock();
        state.targets.insert(
            name.to_string(),
            IscsiTarget {
                name: name.to_string(),
                authentication: authentication.to_string(),
                portals: vec![],
            },
        );
        state.target_groups.insert(
            target_group.to_string(),
            TargetGroup {
                name: target_group.to_string(),
                members: vec![name.to_string()],
            },
        );
        drop(state);
        self
    }
    pub fn with_host_group(self, name: &str, members: &[&str]) -> Self {
        self.state.lock().host_groups.insert(
            name.to_string(),
            HostGroup {
                name: name.to_string(),
                members: members.iter().map(ToString::to_string).collect(),
            },
        );
        self
    }
    /// Map `count` filler volumes through the target group.
    pub fn with_lun_mappings(self, target_group: &str, count: usize) -> Self {
        let mut state = self.state.lock();
        for i in 0 .. count {
            let volume = format!("pool/filler/{target_group}-{i}");
            Self::map(&mut state, &volume, target_group, "filler");
        }
        drop(state);
        self
    }
    /// The next LUN mapping lands together with `count` mappings another node makes through
    /// the same target group.
    pub fn with_racing_lun_mappings(self, count: usize) -> Self {
        self.state.lock().racing_mappings = count;
        self
    }
    /// Make every call fail, with the appliance error if any.
    pub fn fail_all(&self, error: Option<NefError>) {
        let mut state = self.state.lock();
        match error {
            Some(NefError::UnknownAuthority { .. }) => state.tls_failure = true,
            Some(NefError::Response {
                status,
                code,
                message,
            }) => state.failure = Some((status, code, message)),
            Some(other) => state.failure = Some((500, "EIO".to_string(), other.to_string())),
            None => {
                state.tls_failure = false;
                state.failure = None;
            }
        }
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.state.lock().volumes.values().cloned().collect()
    }
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.state.lock().snapshots.values().cloned().collect()
    }
    pub fn lun_mappings(&self) -> Vec<LunMapping> {
        self.state.lock().lun_mappings.clone()
    }
    pub fn target(&self, name: &str) -> Option<IscsiTarget> {
        self.state.lock().targets.get(name).cloned()
    }
    pub fn target_groups(&self) -> Vec<TargetGroup> {
        self.state.lock().target_groups.values().cloned().collect()
    }
    pub fn host_groups(&self) -> Vec<HostGroup> {
        self.state.lock().host_groups.values().cloned().collect()
    }
    pub fn remote_initiator(&self, name: &str) -> Option<ChapCredentials> {
        self.state.lock().remote_initiators.get(name).cloned()
    }
    /// Mutating calls, in order, as `operation:resource`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn map(state: &mut State, volume: &str, target_group: &str, host_group: &str) -> u32 {
        let lun = state
            .lun_mappings
            .iter()
            .filter(|m| m.target_group == target_group && m.host_group == host_group)
            .map(|m| m.lun + 1)
            .max()
            .unwrap_or(0);
        state.next_mapping_id += 1;
        let id = state.next_mapping_id.to_string();
        state.lun_mappings.push(LunMapping {
            id,
            volume: volume.to_string(),
            target_group: target_group.to_string(),
            host_group: host_group.to_string(),
            lun,
        });
        lun
    }

    fn enter(&self, call: Option<String>) -> Result<parking_lot::MutexGuard<'_, State>, NefError> {
        let mut state = self.state.lock();
        if state.tls_failure {
            return Err(NefError::UnknownAuthority {
                address: self.address.clone(),
                message: "x509: certificate signed by unknown authority".to_string(),
            });
        }
        if let Some((status, code, message)) = &state.failure {
            return Err(NefError::appliance(*status, code, message.clone()));
        }
        if let Some(call) = call {
            state.calls.push(call);
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_volume_group(&self, path: &str) -> Result<VolumeGroup, NefError> {
        let state = self.enter(None)?;
        state
            .volume_groups
            .get(path)
            .cloned()
            .ok_or_else(|| NefError::not_exist(format!("volume group '{path}' not found")))
    }

    async fn get_volume(&self, path: &str) -> Result<Volume, NefError> {
        let state = self.enter(None)?;
        state
            .volumes
            .get(path)
            .cloned()
            .ok_or_else(|| NefError::not_exist(format!("volume '{path}' not found")))
    }

    async fn get_volumes(&self, parent: &str) -> Result<Vec<Volume>, NefError> {
        let state = self.enter(None)?;
        Ok(state
            .volumes
            .values()
            .filter(|v| parent_of(&v.path) == parent)
            .cloned()
            .collect())
    }

    async fn create_volume(&self, params: CreateVolumeParams) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("create_volume:{}", params.path)))?;
        if !state.volume_groups.contains_key(parent_of(&params.path)) {
            return Err(NefError::not_exist(format!(
                "volume group of '{}' not found",
                params.path
            )));
        }
        if state.volumes.contains_key(&params.path) {
            return Err(NefError::already_exist(format!(
                "volume '{}' already exists",
                params.path
            )));
        }
        state.volumes.insert(
            params.path.clone(),
            Volume {
                path: params.path,
                volume_size: params.volume_size,
            },
        );
        Ok(())
    }

    async fn update_volume(&self, path: &str, params: UpdateVolumeParams) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("update_volume:{path}")))?;
        match state.volumes.get_mut(path) {
            Some(volume) => {
                volume.volume_size = params.volume_size;
                Ok(())
            }
            None => Err(NefError::not_exist(format!("volume '{path}' not found"))),
        }
    }

    async fn destroy_volume(
        &self,
        path: &str,
        params: DestroyVolumeParams,
    ) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("destroy_volume:{path}")))?;
        if !state.volumes.contains_key(path) {
            return Err(NefError::not_exist(format!("volume '{path}' not found")));
        }
        let prefix = format!("{path}@");
        let has_snapshots = state.snapshots.keys().any(|s| s.starts_with(&prefix));
        if has_snapshots && !params.destroy_snapshots {
            return Err(NefError::busy(format!("volume '{path}' has snapshots")));
        }
        state.snapshots.retain(|s, _| !s.starts_with(&prefix));
        state.volumes.remove(path);
        Ok(())
    }

    async fn get_snapshot(&self, path: &str) -> Result<Snapshot, NefError> {
        let state = self.enter(None)?;
        state
            .snapshots
            .get(path)
            .cloned()
            .ok_or_else(|| NefError::not_exist(format!("snapshot '{path}' not found")))
    }

    async fn get_snapshots(
        &self,
        parent: &str,
        recursive: bool,
    ) -> Result<Vec<Snapshot>, NefError> {
        let state = self.enter(None)?;
        let child_prefix = format!("{parent}/");
        Ok(state
            .snapshots
            .values()
            .filter(|s| s.parent == parent || (recursive && s.parent.starts_with(&child_prefix)))
            .cloned()
            .collect())
    }

    async fn create_snapshot(&self, path: &str) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("create_snapshot:{path}")))?;
        let Some((parent, name)) = path.split_once('@') else {
            return Err(NefError::appliance(400, crate::error::codes::BAD_ARG, path));
        };
        if !state.volumes.contains_key(parent) {
            return Err(NefError::not_exist(format!("volume '{parent}' not found")));
        }
        if state.snapshots.contains_key(path) {
            return Err(NefError::already_exist(format!(
                "snapshot '{path}' already exists"
            )));
        }
        state.snapshots.insert(
            path.to_string(),
            Snapshot {
                path: path.to_string(),
                name: name.to_string(),
                parent: parent.to_string(),
                creation_time: Utc::now(),
            },
        );
        Ok(())
    }

    async fn destroy_snapshot(&self, path: &str) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("destroy_snapshot:{path}")))?;
        state
            .snapshots
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| NefError::not_exist(format!("snapshot '{path}' not found")))
    }

    async fn clone_snapshot(
        &self,
        path: &str,
        params: CloneSnapshotParams,
    ) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("clone_snapshot:{path}")))?;
        let Some(snapshot) = state.snapshots.get(path).cloned() else {
            return Err(NefError::not_exist(format!("snapshot '{path}' not found")));
        };
        if state.volumes.contains_key(&params.target_path) {
            return Err(NefError::already_exist(format!(
                "volume '{}' already exists",
                params.target_path
            )));
        }
        let volume_size = state
            .volumes
            .get(&snapshot.parent)
            .map(|v| v.volume_size)
            .unwrap_or_default();
        state.volumes.insert(
            params.target_path.clone(),
            Volume {
                path: params.target_path,
                volume_size,
            },
        );
        Ok(())
    }

    async fn get_lun_mappings(
        &self,
        filter: LunMappingFilter,
    ) -> Result<Vec<LunMapping>, NefError> {
        let state = self.enter(None)?;
        Ok(state
            .lun_mappings
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn create_lun_mapping(&self, params: CreateLunMappingParams) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!(
            "create_lun_mapping:{}:{}:{}",
            params.volume, params.target_group, params.host_group
        )))?;
        if !state.volumes.contains_key(&params.volume) {
            return Err(NefError::not_exist(format!(
                "volume '{}' not found",
                params.volume
            )));
        }
        if !state.target_groups.contains_key(&params.target_group) {
            return Err(NefError::not_exist(format!(
                "target group '{}' not found",
                params.target_group
            )));
        }
        if state.lun_mappings.iter().any(|m| {
            m.volume == params.volume
                && m.target_group == params.target_group
                && m.host_group == params.host_group
        }) {
            return Err(NefError::already_exist("lun mapping already exists"));
        }
        Self::map(
            &mut state,
            &params.volume,
            &params.target_group,
            &params.host_group,
        );
        for i in 0 .. std::mem::take(&mut state.racing_mappings) {
            let volume = format!("pool/racer/{}-{i}", params.target_group);
            Self::map(&mut state, &volume, &params.target_group, "racer");
        }
        Ok(())
    }

    async fn destroy_lun_mapping(&self, id: &str) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("destroy_lun_mapping:{id}")))?;
        let before = state.lun_mappings.len();
        state.lun_mappings.retain(|m| m.id != id);
        if state.lun_mappings.len() == before {
            return Err(NefError::not_exist(format!("lun mapping '{id}' not found")));
        }
        Ok(())
    }

    async fn get_iscsi_target(&self, name: &str) -> Result<IscsiTarget, NefError> {
        let state = self.enter(None)?;
        state
            .targets
            .get(name)
            .cloned()
            .ok_or_else(|| NefError::not_exist(format!("target '{name}' not found")))
    }

    async fn create_iscsi_target(&self, params: CreateIscsiTargetParams) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("create_iscsi_target:{}", params.name)))?;
        if state.targets.contains_key(&params.name) {
            return Err(NefError::already_exist(format!(
                "target '{}' already exists",
                params.name
            )));
        }
        state.targets.insert(
            params.name.clone(),
            IscsiTarget {
                name: params.name,
                authentication: "none".to_string(),
                portals: params.portals,
            },
        );
        Ok(())
    }

    async fn update_iscsi_target(
        &self,
        name: &str,
        params: UpdateIscsiTargetParams,
    ) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!(
            "update_iscsi_target:{name}:{}",
            params.authentication
        )))?;
        match state.targets.get_mut(name) {
            Some(target) => {
                target.authentication = params.authentication;
                Ok(())
            }
            None => Err(NefError::not_exist(format!("target '{name}' not found"))),
        }
    }

    async fn get_target_groups(&self) -> Result<Vec<TargetGroup>, NefError> {
        let state = self.enter(None)?;
        Ok(state.target_groups.values().cloned().collect())
    }

    async fn create_update_target_group(&self, params: GroupParams) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("create_update_target_group:{}", params.name)))?;
        state.target_groups.insert(
            params.name.clone(),
            TargetGroup {
                name: params.name,
                members: params.members,
            },
        );
        Ok(())
    }

    async fn get_host_groups(&self) -> Result<Vec<HostGroup>, NefError> {
        let state = self.enter(None)?;
        Ok(state.host_groups.values().cloned().collect())
    }

    async fn create_host_group(&self, params: GroupParams) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("create_host_group:{}", params.name)))?;
        if state.host_groups.contains_key(&params.name) {
            return Err(NefError::already_exist(format!(
                "host group '{}' already exists",
                params.name
            )));
        }
        state.host_groups.insert(
            params.name.clone(),
            HostGroup {
                name: params.name,
                members: params.members,
            },
        );
        Ok(())
    }

    async fn get_remote_initiator(&self, name: &str) -> Result<RemoteInitiator, NefError> {
        let state = self.enter(None)?;
        state
            .remote_initiators
            .get(name)
            .map(|c| RemoteInitiator {
                name: name.to_string(),
                chap_user: c.chap_user.clone(),
            })
            .ok_or_else(|| NefError::not_exist(format!("remote initiator '{name}' not found")))
    }

    async fn create_remote_initiator(
        &self,
        name: &str,
        credentials: ChapCredentials,
    ) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("create_remote_initiator:{name}")))?;
        if state.remote_initiators.contains_key(name) {
            return Err(NefError::already_exist(format!(
                "remote initiator '{name}' already exists"
            )));
        }
        state.remote_initiators.insert(name.to_string(), credentials);
        Ok(())
    }

    async fn update_remote_initiator(
        &self,
        name: &str,
        credentials: ChapCredentials,
    ) -> Result<(), NefError> {
        let mut state = self.enter(Some(format!("update_remote_initiator:{name}")))?;
        match state.remote_initiators.get_mut(name) {
            Some(existing) => {
                *existing = credentials;
                Ok(())
            }
            None => Err(NefError::not_exist(format!(
                "remote initiator '{name}' not found"
            ))),
        }
    }
}

/// Connects appliance addresses to mock providers registered beforehand.
#[derive(Default, Clone)]
pub struct MockConnector {
    nodes: Arc<Mutex<HashMap<String, Arc<MockProvider>>>>,
}

impl MockConnector {
    /// Register a node, reachable through its address.
    pub fn add(&self, node: Arc<MockProvider>) -> Arc<MockProvider> {
        self.nodes
            .lock()
            .insert(node.address().to_string(), node.clone());
        node
    }
}

impl Connector for MockConnector {
    fn connect(&self, args: &ResolverArgs) -> Result<Resolver, NefError> {
        let nodes = self.nodes.lock();
        let providers = args
            .addresses()
            .map(|address| match nodes.get(address) {
                Some(node) => node.clone() as Arc<dyn Provider>,
                None => Arc::new(MockProvider::new(address)) as Arc<dyn Provider>,
            })
            .collect();
        Ok(Resolver::from_providers(providers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lun_numbers_per_group_pair() {
        let node = MockProvider::new("https://a:8443")
            .with_volume_group("pool/vg", 1 << 30)
            .with_volume("pool/vg/a", 1)
            .with_volume("pool/vg/b", 1)
            .with_target("iqn:tg1", "none", "tg1");
        for volume in ["pool/vg/a", "pool/vg/b"] {
            node.create_lun_mapping(CreateLunMappingParams {
                volume: volume.into(),
                target_group: "tg1".into(),
                host_group: "hg".into(),
            })
            .await
            .unwrap();
        }
        let luns = node
            .get_lun_mappings(LunMappingFilter::target_group("tg1"))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.lun)
            .collect::<Vec<_>>();
        assert_eq!(luns, vec![0, 1]);

        let duplicate = node
            .create_lun_mapping(CreateLunMappingParams {
                volume: "pool/vg/a".into(),
                target_group: "tg1".into(),
                host_group: "hg".into(),
            })
            .await
            .unwrap_err();
        assert!(duplicate.is_already_exist());
    }

    #[tokio::test]
    async fn snapshots_follow_their_volume() {
        let node = MockProvider::new("https://a:8443")
            .with_volume_group("pool/vg", 1 << 30)
            .with_volume("pool/vg/a", 10);
        node.create_snapshot("pool/vg/a@s1").await.unwrap();
        let busy = node
            .destroy_volume("pool/vg/a", DestroyVolumeParams::default())
            .await
            .unwrap_err();
        assert!(busy.is_busy());
        node.clone_snapshot(
            "pool/vg/a@s1",
            CloneSnapshotParams {
                target_path: "pool/vg/b".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(node.get_volume("pool/vg/b").await.unwrap().volume_size, 10);
        assert_eq!(node.get_snapshots("pool/vg", true).await.unwrap().len(), 1);
        assert!(node.get_snapshots("pool/vg", false).await.unwrap().is_empty());
    }
}
