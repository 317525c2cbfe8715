//! This module consists of the filesystem type definition shared between controller and node.
use strum_macros::EnumString;

/// A type to enumerate the filesystems a volume may be formatted with.
#[derive(EnumString, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum FileSystem {
    Ext3,
    Ext4,
    Xfs,
    #[strum(disabled)]
    Unsupported(String),
}

impl FileSystem {
    /// Parse a requested filesystem, where an empty value selects the default.
    pub fn parse_or_default(value: &str) -> Self {
        let value = if value.is_empty() {
            utils::DEFAULT_FS_TYPE
        } else {
            value
        };
        value
            .parse()
            .unwrap_or_else(|_| Self::Unsupported(value.to_string()))
    }
}

// Implement as ref for the FileSystem.
impl AsRef<str> for FileSystem {
    fn as_ref(&self) -> &str {
        match self {
            FileSystem::Ext3 => "ext3",
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
            FileSystem::Unsupported(inner) => inner,
        }
    }
}

// Implement Display for the filesystem
impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::FileSystem;

    #[test]
    fn requested_filesystem() {
        assert_eq!(FileSystem::parse_or_default(""), FileSystem::Ext4);
        assert_eq!(FileSystem::parse_or_default("xfs"), FileSystem::Xfs);
        assert_eq!(
            FileSystem::parse_or_default("btrfs"),
            FileSystem::Unsupported("btrfs".into())
        );
    }
}
