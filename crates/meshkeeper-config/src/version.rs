//! Version gate for Istio upgrades
//!
//! Only patch changes and single minor upgrades are allowed. Pre-release and
//! build suffixes (for example `-distroless`) are ignored when comparing.

use std::fmt;

use semver::Version;

use meshkeeper_common::{Error, Result};

/// A `MAJOR.MINOR.PATCH` Istio version with any suffix dropped
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IstioVersion {
    /// Major version
    pub major: u64,
    /// Minor version
    pub minor: u64,
    /// Patch version
    pub patch: u64,
}

impl IstioVersion {
    /// Parse a version tag such as `1.24.2` or `1.24.2-distroless`
    pub fn parse(tag: &str) -> Result<Self> {
        let version = Version::parse(tag.trim()).map_err(|e| {
            Error::validation_for_field("istioVersion", format!("invalid version '{tag}': {e}"))
        })?;
        Ok(Self {
            major: version.major,
            minor: version.minor,
            patch: version.patch,
        })
    }

    /// The `MAJOR.(MINOR-1)` version used by the installer's compatibility mode
    pub fn previous_minor(&self) -> Result<String> {
        let minor = self.minor.checked_sub(1).ok_or_else(|| {
            Error::validation_for_field(
                "istioVersion",
                format!("version {self} has no previous minor version"),
            )
        })?;
        Ok(format!("{}.{}", self.major, minor))
    }
}

impl fmt::Display for IstioVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Check whether moving from `current` to `target` is allowed
///
/// The guards run in order: identical versions pass, then downgrades, major
/// changes and jumps of more than one minor version are rejected. A rejection
/// is returned as [`Error::VersionGate`].
pub fn check_update(current: &str, target: &str) -> Result<()> {
    let current_version = IstioVersion::parse(current)?;
    let target_version = IstioVersion::parse(target)?;
    check_versions(current_version, target_version)
}

fn check_versions(current: IstioVersion, target: IstioVersion) -> Result<()> {
    if current == target {
        return Ok(());
    }

    if target < current {
        return Err(Error::version_gate(format!(
            "target Istio version ({target}) is lower than current version ({current}) - downgrade not supported"
        )));
    }

    let higher = format!("target Istio version ({target}) is higher than current version ({current})");
    if target.major != current.major {
        return Err(Error::version_gate(format!(
            "{higher} - major version upgrade is not supported"
        )));
    }
    // Absolute difference, independent of the downgrade guard
    if target.minor.abs_diff(current.minor) > 1 {
        return Err(Error::version_gate(format!(
            "{higher} - the difference between versions exceed one minor version"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::same("1.24.1", "1.24.1")]
    #[case::patch_upgrade("1.24.1", "1.24.3")]
    #[case::minor_upgrade("1.24.1", "1.25.0")]
    #[case::minor_upgrade_with_patch("1.24.3", "1.25.2")]
    #[case::suffix_ignored("1.24.1-distroless", "1.24.1")]
    #[case::suffix_on_target("1.24.1", "1.25.0-distroless")]
    fn allowed_updates(#[case] current: &str, #[case] target: &str) {
        assert!(check_update(current, target).is_ok());
    }

    #[rstest]
    #[case::patch_downgrade("1.24.2", "1.24.1", "downgrade")]
    #[case::minor_downgrade("1.25.0", "1.24.9", "downgrade")]
    #[case::major_downgrade("2.0.0", "1.30.0", "downgrade")]
    #[case::major_upgrade("1.24.1", "2.0.0", "major")]
    #[case::two_minor_jump("1.22.0", "1.24.0", "exceed")]
    #[case::far_minor_jump("1.20.5", "1.25.0", "exceed")]
    #[case::two_minor_from_dot_zero("1.10.0", "1.12.0", "exceed")]
    fn rejected_updates(#[case] current: &str, #[case] target: &str, #[case] reason: &str) {
        let err = check_update(current, target).unwrap_err();
        assert!(matches!(err, Error::VersionGate { .. }));
        assert!(
            err.to_string().contains(reason),
            "'{err}' should mention '{reason}'"
        );
    }

    #[test]
    fn downgrade_message_names_both_versions() {
        let err = check_update("1.24.2", "1.24.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "target Istio version (1.24.1) is lower than current version (1.24.2) - downgrade not supported"
        );
    }

    #[test]
    fn invalid_tags_are_validation_errors() {
        assert!(matches!(
            check_update("1.24", "1.24.1").unwrap_err(),
            Error::Validation { .. }
        ));
        assert!(check_update("1.24.1", "latest").is_err());
    }

    #[rstest]
    #[case::beta("1.10.0-beta.1", IstioVersion { major: 1, minor: 10, patch: 0 })]
    #[case::distroless("1.24.2-distroless", IstioVersion { major: 1, minor: 24, patch: 2 })]
    #[case::padded(" 1.24.2 ", IstioVersion { major: 1, minor: 24, patch: 2 })]
    fn suffixes_parse_to_base_version(#[case] tag: &str, #[case] expected: IstioVersion) {
        assert_eq!(IstioVersion::parse(tag).unwrap(), expected);
    }

    #[rstest]
    #[case("1.24.2", "1.23")]
    #[case("2.1.0-distroless", "2.0")]
    fn previous_minor(#[case] tag: &str, #[case] expected: &str) {
        assert_eq!(IstioVersion::parse(tag).unwrap().previous_minor().unwrap(), expected);
    }

    #[test]
    fn previous_minor_of_zero_fails() {
        assert!(IstioVersion::parse("1.0.0").unwrap().previous_minor().is_err());
    }
}
