//! Service version policy

use serde::{Deserialize, Serialize};

/// Version of the framework API implemented by the partition manager
pub const FRAMEWORK_VERSION: u32 = 0x0101;

/// Returned by `version()` for unknown or inaccessible services
pub const VERSION_NONE: u32 = 0;

/// How a service matches the version a client asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Clients built against this version or any older one are accepted
    #[default]
    Relaxed,
    /// Only the exact version is accepted
    Strict,
}

impl VersionPolicy {
    /// Checks a client's requested version against the published one
    pub fn accepts(&self, service_version: u32, client_version: u32) -> bool {
        match self {
            VersionPolicy::Relaxed => client_version <= service_version,
            VersionPolicy::Strict => client_version == service_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relaxed_accepts_older_clients() {
        assert!(VersionPolicy::Relaxed.accepts(2, 1));
        assert!(VersionPolicy::Relaxed.accepts(2, 2));
        assert!(!VersionPolicy::Relaxed.accepts(2, 3));
    }

    #[test]
    fn test_strict_requires_exact_match() {
        assert!(!VersionPolicy::Strict.accepts(2, 1));
        assert!(VersionPolicy::Strict.accepts(2, 2));
        assert!(!VersionPolicy::Strict.accepts(2, 3));
    }

    #[test]
    fn test_manifest_spelling() {
        let policy: VersionPolicy = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(policy, VersionPolicy::Strict);
    }
}
