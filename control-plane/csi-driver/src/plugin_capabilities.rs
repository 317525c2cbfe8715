use rpc::csi::{
    controller_service_capability::{self, rpc::Type as ControllerRpcType},
    node_service_capability::{self, rpc::Type as NodeRpcType},
    plugin_capability::{
        service::Type as PluginServiceType,
        volume_expansion::Type as PluginVolExpansionType,
        Service,
        Type::{Service as ServiceCapability, VolumeExpansion as VolExpansionCapability},
        VolumeExpansion,
    },
    volume_capability::access_mode::Mode as AccessMode,
    ControllerServiceCapability, NodeServiceCapability, PluginCapability,
};

/// Volume access modes supported by the driver.
pub const SUPPORTED_ACCESS_MODES: &[AccessMode] = &[
    AccessMode::SingleNodeReaderOnly,
    AccessMode::SingleNodeWriter,
    AccessMode::MultiNodeReaderOnly,
    AccessMode::MultiNodeSingleWriter,
    AccessMode::MultiNodeMultiWriter,
];

/// Whether the given raw access mode is supported.
pub fn access_mode_supported(mode: i32) -> bool {
    SUPPORTED_ACCESS_MODES.iter().any(|m| *m as i32 == mode)
}

/// This returns the exhaustive set of plugin capabilities, advertised by the identity service
/// of both the controller and the node plugins.
pub fn plugin_capabilities() -> Vec<PluginCapability> {
    let service_capabilities = &[
        PluginServiceType::ControllerService,
        PluginServiceType::VolumeAccessibilityConstraints,
    ];

    let expansion_capabilities = &[
        PluginVolExpansionType::Offline,
        PluginVolExpansionType::Online,
    ];

    let mut capabilities: Vec<PluginCapability> = Vec::new();
    capabilities.extend(service_capabilities.iter().map(|c| PluginCapability {
        r#type: Some(ServiceCapability(Service { r#type: *c as i32 })),
    }));
    capabilities.extend(expansion_capabilities.iter().map(|c| PluginCapability {
        r#type: Some(VolExpansionCapability(VolumeExpansion {
            r#type: *c as i32,
        })),
    }));

    capabilities
}

/// The RPCs of the controller service.
pub const CONTROLLER_RPCS: &[ControllerRpcType] = &[
    ControllerRpcType::CreateDeleteVolume,
    ControllerRpcType::PublishUnpublishVolume,
    ControllerRpcType::ListVolumes,
    ControllerRpcType::GetCapacity,
    ControllerRpcType::CreateDeleteSnapshot,
    ControllerRpcType::ListSnapshots,
    ControllerRpcType::CloneVolume,
    ControllerRpcType::ExpandVolume,
    ControllerRpcType::GetVolume,
    ControllerRpcType::VolumeCondition,
];

/// The capabilities of the controller service.
pub fn controller_capabilities() -> Vec<ControllerServiceCapability> {
    CONTROLLER_RPCS
        .iter()
        .map(|c| ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc { r#type: *c as i32 },
            )),
        })
        .collect()
}

/// The RPCs of the node service.
pub const NODE_RPCS: &[NodeRpcType] = &[
    NodeRpcType::StageUnstageVolume,
    NodeRpcType::ExpandVolume,
    NodeRpcType::GetVolumeStats,
];

/// The capabilities of the node service.
pub fn node_capabilities() -> Vec<NodeServiceCapability> {
    NODE_RPCS
        .iter()
        .map(|c| NodeServiceCapability {
            r#type: Some(node_service_capability::Type::Rpc(
                node_service_capability::Rpc { r#type: *c as i32 },
            )),
        })
        .collect()
}
