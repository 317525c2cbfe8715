//! Shared components of the NexentaStor block CSI controller and node plugins.

/// The CSI plugin's name.
pub use utils::csi_plugin_name;

/// The csi driver components.
pub use rpc::csi;

/// Log an error and build a `tonic::Status` with the same message.
#[macro_export]
macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ tracing::error!($msg); tonic::Status::new(tonic::Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); tracing::error!("{}", message); tonic::Status::new(tonic::Code::$code, message) }};
}

/// Target, target group, host group and LUN mapping allocation.
pub mod allocator;
/// Driver configuration and its hot reload.
pub mod config;
/// StorageClass parameters and volume contexts.
pub mod context;
/// Filesystems supported on mount access volumes.
pub mod filesystem;
/// Volume and snapshot ids.
pub mod identity;
/// The CSI identity service.
pub mod identity_service;
/// Volume concurrency limiter.
pub mod limiter;
/// Token based pagination of list calls.
pub mod pagination;
/// Contains tools to advertise the same set of capabilities across different
/// CSI microservices.
pub mod plugin_capabilities;
/// Resolution of the appliance serving a volume group.
pub mod resolver;
/// Retry with exponential backoff.
pub mod retry;
/// The CSI unix domain socket.
pub mod uds;
