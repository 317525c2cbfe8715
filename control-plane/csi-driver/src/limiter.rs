//! Volume Concurrency Limiter Module
//!
//! The Cluster Orchestrator is expected to keep at most one call in-flight per volume, but it
//! may lose that state, eg: when it restarts, and issue calls for the same volume concurrently.
//! Such calls are rejected with ABORTED and retried by the orchestrator.
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::HashSet;
use tracing::trace;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Existing Csi operation is in progress for volume: {}", id))]
    OperationInProgress { id: String },
    #[snafu(display("Volume id must not be empty"))]
    EmptyId {},
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OperationInProgress { .. } => tonic::Status::aborted(error.to_string()),
            Error::EmptyId { .. } => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}

/// Ensures there is no more than 1 in-flight operation for a given volume by taking a
/// reservation for the volume id. The reservation is returned when the guard is dropped.
#[derive(Debug)]
pub struct VolumeOpGuard {
    id: String,
}

impl VolumeOpGuard {
    /// Tries to take a new volume reservation and returns error if an existing
    /// operation is already in progress.
    pub fn new(id: &str) -> Result<Self, Error> {
        if id.is_empty() {
            return Err(Error::EmptyId {});
        }
        let mut inventory = volume_serializer().lock();
        if inventory.contains(id) {
            trace!(volume.id = %id, "Operation already exists for volume");
            return Err(Error::OperationInProgress { id: id.to_string() });
        }
        inventory.insert(id.to_string());
        trace!(volume.id = %id, "New reservation");
        Ok(Self { id: id.to_string() })
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        volume_serializer().lock().remove(&self.id);
    }
}

/// Returns or inits the set of volume ids which have operations in-flight.
fn volume_serializer() -> &'static Mutex<HashSet<String>> {
    static OPERATION_LIMITER: OnceCell<Mutex<HashSet<String>>> = OnceCell::new();

    OPERATION_LIMITER.get_or_init(|| Mutex::new(HashSet::new()))
}
