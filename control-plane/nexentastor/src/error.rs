use snafu::Snafu;
use std::time::Duration;

/// Error codes reported by the NexentaStor REST API.
pub mod codes {
    /// The resource does not exist.
    pub const NOT_EXIST: &str = "ENOENT";
    /// The resource already exists.
    pub const ALREADY_EXIST: &str = "EEXIST";
    /// The resource is in use, eg: a snapshot with dependent clones.
    pub const BUSY: &str = "EBUSY";
    /// Invalid request arguments.
    pub const BAD_ARG: &str = "EBADARG";
    /// Invalid request arguments, as reported by older releases.
    pub const INVALID: &str = "EINVAL";
}

/// Errors returned by a NexentaStor provider.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum NefError {
    #[snafu(display("Invalid NexentaStor address '{address}': {source}"))]
    InvalidAddress {
        address: String,
        source: url::ParseError,
    },
    #[snafu(display("Failed to build the REST client for '{address}': {source}"))]
    Client {
        address: String,
        source: reqwest::Error,
    },
    #[snafu(display("{method} {url} failed: {source}"))]
    Request {
        method: String,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("TLS certificate of '{address}' signed by unknown authority: {message}"))]
    UnknownAuthority { address: String, message: String },
    #[snafu(display("NexentaStor error [{code}] {message} (HTTP {status})"))]
    Response {
        status: u16,
        code: String,
        message: String,
    },
    #[snafu(display("Failed to decode the response of {url}: {source}"))]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[snafu(display("Job {href} did not complete in {}", humantime::format_duration(*timeout)))]
    JobTimeout { href: String, timeout: Duration },
    #[snafu(display("Volume group '{volume_group}' not found on any of [{addresses}]"))]
    NoProvider {
        volume_group: String,
        addresses: String,
    },
}

impl NefError {
    /// An error as it would be reported by the appliance.
    pub fn appliance(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self::Response {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
    /// The resource does not exist.
    pub fn not_exist(message: impl Into<String>) -> Self {
        Self::appliance(404, codes::NOT_EXIST, message)
    }
    /// The resource already exists.
    pub fn already_exist(message: impl Into<String>) -> Self {
        Self::appliance(409, codes::ALREADY_EXIST, message)
    }
    /// The resource is busy.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::appliance(409, codes::BUSY, message)
    }
    fn code(&self) -> Option<&str> {
        match self {
            Self::Response { code, .. } => Some(code),
            _ => None,
        }
    }
    /// The requested resource does not exist on the appliance.
    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::NoProvider { .. } => true,
            Self::Response { status, code, .. } => code == codes::NOT_EXIST || *status == 404,
            _ => false,
        }
    }
    /// The resource to create already exists.
    pub fn is_already_exist(&self) -> bool {
        self.code() == Some(codes::ALREADY_EXIST)
    }
    /// The resource cannot be modified because it is in use.
    pub fn is_busy(&self) -> bool {
        self.code() == Some(codes::BUSY)
    }
    /// The request carried invalid arguments, eg: a malformed snapshot path.
    pub fn is_bad_arg(&self) -> bool {
        matches!(self.code(), Some(codes::BAD_ARG | codes::INVALID))
    }
    /// The appliance presented a certificate which is not trusted.
    pub fn is_unknown_authority(&self) -> bool {
        matches!(self, Self::UnknownAuthority { .. })
    }
}

/// Whether a transport error was caused by an untrusted server certificate.
pub(crate) fn is_certificate_error(error: &reqwest::Error) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(error);
    while let Some(error) = source {
        let text = error.to_string();
        if ["unknown authority", "UnknownIssuer", "certificate verify failed", "self signed"]
            .iter()
            .any(|pattern| text.contains(pattern))
        {
            return true;
        }
        source = error.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(NefError::not_exist("gone").is_not_exist());
        assert!(NefError::appliance(404, "ESOMETHING", "gone").is_not_exist());
        assert!(!NefError::already_exist("dup").is_not_exist());
        assert!(NefError::already_exist("dup").is_already_exist());
        assert!(NefError::busy("clones").is_busy());
        assert!(NefError::appliance(400, codes::INVALID, "bad").is_bad_arg());
        assert!(NefError::appliance(400, codes::BAD_ARG, "bad").is_bad_arg());
        let tls = NefError::UnknownAuthority {
            address: "https://10.0.0.1:8443".into(),
            message: "x509".into(),
        };
        assert!(tls.is_unknown_authority());
        assert!(!tls.is_not_exist());
        let missing = NefError::NoProvider {
            volume_group: "pool/vg".into(),
            addresses: "a,b".into(),
        };
        assert!(missing.is_not_exist());
    }
}
