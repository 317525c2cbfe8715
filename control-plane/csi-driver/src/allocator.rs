//! Target and LUN allocation.
//!
//! A volume is exposed to a node through a LUN mapping binding it to a target group and to the
//! host group holding the node initiator. Dynamic allocation packs mappings on the least loaded
//! target which has the requested CHAP mode and is below the per target LUN ceiling, creating a
//! new target and target group when none qualifies.

use crate::context::VolumeContext;
use nexentastor::{
    ChapCredentials, CreateIscsiTargetParams, CreateLunMappingParams, GroupParams, LunMapping,
    LunMappingFilter, NefError, Portal, Provider, UpdateIscsiTargetParams,
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument};

/// Allocation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum AllocatorError {
    #[snafu(display("Failed to {operation}: {source}"))]
    Appliance { operation: String, source: NefError },
    #[snafu(display("iSCSI IQN not provided"))]
    NoInitiator {},
    #[snafu(display("chapSecret not provided"))]
    NoChapSecret {},
    #[snafu(display("LUN mapping of volume '{volume}' not found after its creation"))]
    MappingNotFound { volume: String },
    #[snafu(display("Target group '{target_group}' has no target"))]
    NoTarget { target_group: String },
}

impl From<AllocatorError> for tonic::Status {
    fn from(error: AllocatorError) -> Self {
        match &error {
            AllocatorError::Appliance { source, .. } if source.is_unknown_authority() => {
                tonic::Status::unauthenticated(error.to_string())
            }
            AllocatorError::NoInitiator {} | AllocatorError::NoChapSecret {} => {
                tonic::Status::invalid_argument(error.to_string())
            }
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

/// A volume mapped to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub target: String,
    pub target_group: String,
    pub host_group: String,
    pub lun: u32,
}

/// What to map, and how.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    /// Path of the volume on the appliance.
    pub volume: &'a str,
    /// IQN of the node initiator.
    pub initiator: &'a str,
    pub context: &'a VolumeContext,
    /// Pick targets by load rather than using the configured target.
    pub dynamic: bool,
}

/// Allocates targets and LUN mappings.
/// Allocations are serialized so that concurrent stagings do not pick the same target slot.
#[derive(Debug, Default)]
pub struct Allocator {
    serial: tokio::sync::Mutex<()>,
}

impl Allocator {
    /// Make sure the volume is mapped to the node, reusing any mapping it already has.
    #[instrument(skip(self, provider, request), fields(volume = request.volume), err)]
    pub async fn ensure_lun_mapping(
        &self,
        provider: &dyn Provider,
        request: AllocationRequest<'_>,
    ) -> Result<Allocation, AllocatorError> {
        let _serial = self.serial.lock().await;
        let context = request.context;

        let host_group = match context.host_group.as_str() {
            "" => ensure_host_group(provider, request.initiator).await?,
            host_group => host_group.to_string(),
        };

        let existing = provider
            .get_lun_mappings(LunMappingFilter {
                volume: Some(request.volume.to_string()),
                host_group: Some(host_group.clone()),
                ..Default::default()
            })
            .await
            .context(Appliance {
                operation: "list the LUN mappings of the volume",
            })?;
        if let Some(mapping) = existing.into_iter().next() {
            let target = target_of(provider, &mapping.target_group, context).await?;
            if let Some(chap) = context.chap() {
                set_chap_auth(provider, request.initiator, chap).await?;
            }
            debug!(?mapping, %target, "Volume is already mapped");
            return Ok(Allocation {
                target,
                target_group: mapping.target_group,
                host_group,
                lun: mapping.lun,
            });
        }

        // a reused target group is checked again once mapped, as the plugins of other nodes
        // allocate on the same appliance without this lock
        let reused = match request.dynamic {
            true => least_loaded_target(provider, context).await?,
            false => None,
        };
        let (mut target, mut target_group) = match &reused {
            Some((target, target_group)) => {
                debug!(%target, %target_group, "Reusing target");
                if let Some(chap) = context.chap() {
                    set_chap_auth(provider, request.initiator, chap).await?;
                }
                (target.clone(), target_group.clone())
            }
            None => create_new_target(provider, request.initiator, context).await?,
        };

        let mut mapping = map_volume(provider, request.volume, &target_group, &host_group).await?;
        if reused.is_some() && over_ceiling(provider, &target_group, context).await? {
            info!(%target_group, "Target group went over its LUN ceiling, moving to a new target");
            match provider.destroy_lun_mapping(&mapping.id).await {
                Err(error) if !error.is_not_exist() => {
                    return Err(error).context(Appliance {
                        operation: "destroy the LUN mapping over the ceiling",
                    })
                }
                _ => {}
            }
            (target, target_group) = create_new_target(
                provider,
                request.initiator,
                &VolumeContext {
                    target: String::new(),
                    target_group: String::new(),
                    ..context.clone()
                },
            )
            .await?;
            mapping = map_volume(provider, request.volume, &target_group, &host_group).await?;
        }
        info!(
            volume = request.volume,
            %target, %target_group, %host_group, lun = mapping.lun, "Volume mapped"
        );
        Ok(Allocation {
            target,
            target_group,
            host_group,
            lun: mapping.lun,
        })
    }
}

/// The host group holding the initiator, created if there is none.
pub async fn ensure_host_group(
    provider: &dyn Provider,
    initiator: &str,
) -> Result<String, AllocatorError> {
    if initiator.is_empty() {
        return Err(AllocatorError::NoInitiator {});
    }
    let host_groups = provider.get_host_groups().await.context(Appliance {
        operation: "list host groups",
    })?;
    if let Some(group) = host_groups
        .into_iter()
        .find(|g| g.members.iter().any(|m| m == initiator))
    {
        return Ok(group.name);
    }

    let name = format!("{}-{}", utils::HOST_GROUP_PREFIX, uuid::Uuid::new_v4());
    provider
        .create_host_group(GroupParams {
            name: name.clone(),
            members: vec![initiator.to_string()],
        })
        .await
        .context(Appliance {
            operation: format!("create host group '{name}'"),
        })?;
    info!(host_group = %name, initiator, "Host group created");
    Ok(name)
}

/// The target of a target group: the configured target if it is a member, otherwise the first
/// member with the driver prefix, otherwise the first member.
async fn target_of(
    provider: &dyn Provider,
    target_group: &str,
    context: &VolumeContext,
) -> Result<String, AllocatorError> {
    let members = provider
        .get_target_groups()
        .await
        .context(Appliance {
            operation: "list target groups",
        })?
        .into_iter()
        .find(|g| g.name == target_group)
        .map(|g| g.members)
        .unwrap_or_default();
    members
        .iter()
        .find(|m| !context.target.is_empty() && **m == context.target)
        .or_else(|| {
            members
                .iter()
                .find(|m| m.starts_with(&context.iscsi_target_prefix))
        })
        .or_else(|| members.first())
        .cloned()
        .ok_or_else(|| AllocatorError::NoTarget {
            target_group: target_group.to_string(),
        })
}

/// The least loaded target group among those with a driver target below the LUN ceiling and
/// in the requested CHAP mode, if any.
async fn least_loaded_target(
    provider: &dyn Provider,
    context: &VolumeContext,
) -> Result<Option<(String, String)>, AllocatorError> {
    let target_groups = provider.get_target_groups().await.context(Appliance {
        operation: "list target groups",
    })?;

    let ceiling = context.luns_per_target as usize;
    let mut chosen: Option<(usize, String, String)> = None;
    for group in target_groups {
        let members = group
            .members
            .iter()
            .filter(|m| m.starts_with(&context.iscsi_target_prefix))
            .collect::<Vec<_>>();
        if members.is_empty() {
            continue;
        }
        let luns = luns_of(provider, &group.name).await?;
        if luns >= ceiling || chosen.as_ref().map_or(false, |(min, ..)| luns >= *min) {
            continue;
        }
        for member in members {
            let target = provider
                .get_iscsi_target(member)
                .await
                .context(Appliance {
                    operation: format!("get target '{member}'"),
                })?;
            let chap = target.authentication == utils::CHAP_AUTHENTICATION;
            if chap != context.use_chap_auth {
                continue;
            }
            chosen = Some((luns, member.clone(), group.name.clone()));
            break;
        }
    }
    Ok(chosen.map(|(_, target, target_group)| (target, target_group)))
}

async fn luns_of(provider: &dyn Provider, target_group: &str) -> Result<usize, AllocatorError> {
    Ok(provider
        .get_lun_mappings(LunMappingFilter::target_group(target_group))
        .await
        .context(Appliance {
            operation: format!("list the LUN mappings of target group '{target_group}'"),
        })?
        .len())
}

async fn over_ceiling(
    provider: &dyn Provider,
    target_group: &str,
    context: &VolumeContext,
) -> Result<bool, AllocatorError> {
    Ok(luns_of(provider, target_group).await? > context.luns_per_target as usize)
}

/// Map the volume through the target group to the host group, returning the mapping.
async fn map_volume(
    provider: &dyn Provider,
    volume: &str,
    target_group: &str,
    host_group: &str,
) -> Result<LunMapping, AllocatorError> {
    match provider
        .create_lun_mapping(CreateLunMappingParams {
            volume: volume.to_string(),
            target_group: target_group.to_string(),
            host_group: host_group.to_string(),
        })
        .await
    {
        Err(error) if !error.is_already_exist() => {
            return Err(error).context(Appliance {
                operation: "create the LUN mapping",
            })
        }
        _ => {}
    }
    provider
        .get_lun_mappings(LunMappingFilter {
            volume: Some(volume.to_string()),
            target_group: Some(target_group.to_string()),
            host_group: Some(host_group.to_string()),
        })
        .await
        .context(Appliance {
            operation: "list the LUN mappings of the volume",
        })?
        .into_iter()
        .next()
        .ok_or_else(|| AllocatorError::MappingNotFound {
            volume: volume.to_string(),
        })
}

/// Create the configured target and target group, or a new dynamic pair if no target is set.
/// A CHAP target only requires CHAP once the initiator credentials are in place.
pub async fn create_new_target(
    provider: &dyn Provider,
    initiator: &str,
    context: &VolumeContext,
) -> Result<(String, String), AllocatorError> {
    let (target, target_group) = match context.target.as_str() {
        "" => {
            let target_group = uuid::Uuid::new_v4().to_string();
            (
                format!("{}:{target_group}", context.iscsi_target_prefix),
                target_group,
            )
        }
        target => {
            let target_group = match context.target_group.as_str() {
                "" => target.rsplit(':').next().unwrap_or(target).to_string(),
                target_group => target_group.to_string(),
            };
            (target.to_string(), target_group)
        }
    };

    match provider
        .create_iscsi_target(CreateIscsiTargetParams {
            name: target.clone(),
            portals: vec![Portal {
                address: context.data_ip.clone(),
                port: context.iscsi_port,
            }],
        })
        .await
    {
        Err(error) if !error.is_already_exist() => {
            return Err(error).context(Appliance {
                operation: format!("create target '{target}'"),
            })
        }
        _ => {}
    }

    let existing = provider
        .get_target_groups()
        .await
        .context(Appliance {
            operation: "list target groups",
        })?
        .into_iter()
        .find(|g| g.name == target_group);
    let members = match existing {
        Some(group) if group.members.contains(&target) => None,
        Some(group) => Some([group.members, vec![target.clone()]].concat()),
        None => Some(vec![target.clone()]),
    };
    if let Some(members) = members {
        provider
            .create_update_target_group(GroupParams {
                name: target_group.clone(),
                members,
            })
            .await
            .context(Appliance {
                operation: format!("create target group '{target_group}'"),
            })?;
    }

    if let Some(chap) = context.chap() {
        set_chap_auth(provider, initiator, chap).await?;
        provider
            .update_iscsi_target(
                &target,
                UpdateIscsiTargetParams {
                    authentication: utils::CHAP_AUTHENTICATION.to_string(),
                },
            )
            .await
            .context(Appliance {
                operation: format!("enable CHAP on target '{target}'"),
            })?;
    }
    info!(%target, %target_group, "Target created");
    Ok((target, target_group))
}

/// Store the CHAP credentials of the initiator on the appliance.
pub async fn set_chap_auth(
    provider: &dyn Provider,
    initiator: &str,
    credentials: ChapCredentials,
) -> Result<(), AllocatorError> {
    if initiator.is_empty() {
        return Err(AllocatorError::NoInitiator {});
    }
    if credentials.chap_secret.is_empty() {
        return Err(AllocatorError::NoChapSecret {});
    }
    match provider.get_remote_initiator(initiator).await {
        Ok(_) => provider
            .update_remote_initiator(initiator, credentials)
            .await
            .context(Appliance {
                operation: format!("update remote initiator '{initiator}'"),
            }),
        Err(error) if error.is_not_exist() => provider
            .create_remote_initiator(initiator, credentials)
            .await
            .context(Appliance {
                operation: format!("create remote initiator '{initiator}'"),
            }),
        Err(error) => Err(error).context(Appliance {
            operation: format!("get remote initiator '{initiator}'"),
        }),
    }
}
