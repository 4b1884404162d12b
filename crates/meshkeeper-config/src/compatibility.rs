//! Compatibility mode tables
//!
//! Compatibility mode keeps behaviour of the previous minor Istio release for
//! settings that the installer's own `compatibilityVersion` does not cover.
//! Update these tables with every Istio bump according to the release notes.

use std::collections::BTreeMap;

/// Settings injected when compatibility mode is enabled
///
/// Passed by value into the merger and the restart predicates so that tests
/// can substitute their own tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompatibilityTables {
    /// Environment variables set on the control plane container
    pub pilot_env: BTreeMap<String, String>,
    /// Proxy metadata set on the mesh default proxy configuration
    pub proxy_metadata: BTreeMap<String, String>,
}

impl CompatibilityTables {
    /// Tables with no entries
    pub fn empty() -> Self {
        Self {
            pilot_env: BTreeMap::new(),
            proxy_metadata: BTreeMap::new(),
        }
    }

    /// Whether toggling compatibility mode changes anything inside the sidecars
    pub fn affects_proxies(&self) -> bool {
        !self.proxy_metadata.is_empty()
    }
}

impl Default for CompatibilityTables {
    fn default() -> Self {
        let pilot_env = [
            (
                "PERSIST_OLDEST_FIRST_HEURISTIC_FOR_VIRTUAL_SERVICE_HOST_MATCHING",
                "true",
            ),
            ("VERIFY_CERTIFICATE_AT_CLIENT", "false"),
            ("ENABLE_AUTO_SNI", "false"),
        ];
        let proxy_metadata = [
            ("ENABLE_DEFERRED_CLUSTER_CREATION", "false"),
            ("ENABLE_DELIMITED_STATS_TAG_REGEX", "false"),
        ];
        Self {
            pilot_env: to_map(&pilot_env),
            proxy_metadata: to_map(&proxy_metadata),
        }
    }
}

fn to_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tables_are_populated() {
        let tables = CompatibilityTables::default();
        assert_eq!(tables.pilot_env["ENABLE_AUTO_SNI"], "false");
        assert_eq!(tables.pilot_env.len(), 3);
        assert!(tables.affects_proxies());
    }

    #[test]
    fn empty_tables_do_not_affect_proxies() {
        assert!(!CompatibilityTables::empty().affects_proxies());
    }
}
