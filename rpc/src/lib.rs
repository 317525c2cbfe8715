extern crate prost;
extern crate prost_derive;
extern crate tonic;

/// Container Storage Interface types, clients and server traits.
#[allow(clippy::derive_partial_eq_without_eq)]
#[allow(clippy::upper_case_acronyms)]
#[allow(clippy::large_enum_variant)]
pub mod csi {
    include!(concat!(env!("OUT_DIR"), "/csi.v1.rs"));

    /// Collapse a CSI secrets map into the single opaque secret used to refresh the
    /// driver configuration. Exactly one entry is expected.
    pub fn config_secret(secrets: &std::collections::HashMap<String, String>) -> Option<&str> {
        secrets.values().last().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::csi;
    use std::collections::HashMap;

    #[test]
    fn config_secret() {
        assert_eq!(csi::config_secret(&HashMap::new()), None);
        let secrets = HashMap::from([("config".to_string(), "debug: true".to_string())]);
        assert_eq!(csi::config_secret(&secrets), Some("debug: true"));
    }
}
