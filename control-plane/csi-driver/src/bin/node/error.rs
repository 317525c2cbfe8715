//! Definition of DeviceError used by the staging and unstaging code.
use std::{io::ErrorKind, string::FromUtf8Error};

/// A host device or command error.
pub(crate) struct DeviceError {
    pub(crate) message: String,
    pub(crate) source: DeviceErrorSource,
}

/// Possible device error kind sources.
pub(crate) enum DeviceErrorSource {
    None,
    StdIoError(std::io::Error),
    StdIntParseError(std::num::ParseIntError),
    SerdeError(serde_json::error::Error),
    FromUtf8Error(FromUtf8Error),
    /// The iSCSI target refused the session.
    LoginRejected,
}

impl DeviceError {
    /// The iSCSI login was refused by the target.
    pub(crate) fn login_rejected(message: String) -> DeviceError {
        DeviceError {
            message,
            source: DeviceErrorSource::LoginRejected,
        }
    }
}

impl std::fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIoError(error),
        }
    }
}

impl From<std::num::ParseIntError> for DeviceError {
    fn from(error: std::num::ParseIntError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIntParseError(error),
        }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError {
            message,
            source: DeviceErrorSource::None,
        }
    }
}

impl From<serde_json::error::Error> for DeviceError {
    fn from(error: serde_json::error::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::SerdeError(error),
        }
    }
}

impl From<FromUtf8Error> for DeviceError {
    fn from(error: FromUtf8Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::FromUtf8Error(error),
        }
    }
}

impl From<DeviceError> for tonic::Status {
    fn from(dev_error: DeviceError) -> Self {
        match dev_error.source {
            DeviceErrorSource::LoginRejected => tonic::Status::unauthenticated(dev_error.message),
            DeviceErrorSource::StdIoError(error) if error.kind() == ErrorKind::NotFound => {
                tonic::Status::not_found(dev_error.message)
            }
            DeviceErrorSource::StdIoError(error) if error.kind() == ErrorKind::PermissionDenied => {
                tonic::Status::permission_denied(dev_error.message)
            }
            _ => tonic::Status::internal(dev_error.message),
        }
    }
}
