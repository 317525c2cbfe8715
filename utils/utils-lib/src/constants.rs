/// Various common constants used by the NexentaStor block CSI driver.

/// The product name.
pub const PRODUCT_NAME: &str = "nexentastor-block";
/// The domain of the product vendor.
pub const PRODUCT_DOMAIN_NAME: &str = "nexenta.com";

/// The CSI plugin name, as registered with the container orchestrator.
pub fn csi_plugin_name() -> String {
    format!("{PRODUCT_NAME}-csi-driver.{PRODUCT_DOMAIN_NAME}")
}

/// Topology key used to advertise and request availability zones.
pub const CSI_TOPOLOGY_KEY_ZONE: &str = "topology.kubernetes.io/zone";

/// Default location of the driver configuration file.
pub const DEFAULT_DRIVER_CONFIG: &str = "/config/driver-config-csi.yaml";

/// Default CSI socket for the controller plugin.
pub const CSI_CONTROLLER_SOCKET: &str = "/var/tmp/csi-controller.sock";
/// Default CSI socket for the node plugin.
pub const CSI_NODE_SOCKET: &str = "/var/tmp/csi.sock";

/// Default iSCSI portal port.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;
/// Default prefix of the iSCSI targets created by the driver.
pub const DEFAULT_ISCSI_TARGET_PREFIX: &str = "iqn.2005-07.com.nexenta:01:csi";
/// Default ceiling of LUN mappings a single target may carry.
pub const DEFAULT_LUNS_PER_TARGET: u32 = 256;
/// Default permissions of staged and published mount points.
pub const DEFAULT_MOUNT_POINT_PERMISSIONS: u32 = 0o750;
/// Volumes are thin provisioned unless requested otherwise.
pub const DEFAULT_SPARSE_VOLUME: bool = true;
/// Size used when the create request carries no capacity range.
pub const DEFAULT_VOLUME_SIZE: u64 = 1024 * 1024 * 1024;
/// Default filesystem for mount access volumes.
pub const DEFAULT_FS_TYPE: &str = "ext4";
/// Prefix of the host groups created by the node plugin.
pub const HOST_GROUP_PREFIX: &str = "csi";
/// Authentication mode of a CHAP protected iSCSI target.
pub const CHAP_AUTHENTICATION: &str = "chap";
/// Prefix of the snapshots taken to clone a volume.
pub const CLONE_SNAPSHOT_PREFIX: &str = "k8s-clone-snapshot";

/// Default time to wait for the iSCSI device to appear on the node.
pub const DEFAULT_ISCSI_TIMEOUT: &str = "300s";
/// Default host file holding the node initiator name.
pub const DEFAULT_INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// Default timeout of a single appliance REST request.
pub const DEFAULT_REST_TIMEOUT: &str = "30s";
/// Time after which an appliance asynchronous job is considered lost.
pub const DEFAULT_REST_JOB_TIMEOUT: &str = "60s";
