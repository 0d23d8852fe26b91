//! Metadata schema compatibility states and validation rules.

use serde::{Deserialize, Serialize};

use crate::version::Version;

state_set! {
    /// Compatibility of the installed metadata schema with the version this
    /// build supports.
    MetadataStates: u16 {
        NONEXISTING = 0 => "Nonexisting",
        /// A setup or upgrade is currently running.
        UPGRADING = 1 => "Upgrading",
        EQUAL = 2 => "Equal",
        MAJOR_HIGHER = 3 => "MajorHigher",
        MAJOR_LOWER = 4 => "MajorLower",
        MINOR_HIGHER = 5 => "MinorHigher",
        MINOR_LOWER = 6 => "MinorLower",
        PATCH_HIGHER = 7 => "PatchHigher",
        PATCH_LOWER = 8 => "PatchLower",
    }
}

impl MetadataStates {
    /// States that make the schema unusable by this build.
    pub const INCOMPATIBLE: MetadataStates =
        MetadataStates::MAJOR_HIGHER.union(MetadataStates::MAJOR_LOWER);

    /// Readable by this build, but written by a newer one.
    pub const COMPATIBLE_HIGHER: MetadataStates =
        MetadataStates::MINOR_HIGHER.union(MetadataStates::PATCH_HIGHER);

    /// Readable by this build, but in need of an upgrade.
    pub const COMPATIBLE_LOWER: MetadataStates =
        MetadataStates::MINOR_LOWER.union(MetadataStates::PATCH_LOWER);

    /// Classify an installed schema version against the supported one.
    pub fn compare(installed: Option<Version>, supported: Version) -> MetadataStates {
        let Some(installed) = installed else {
            return MetadataStates::NONEXISTING;
        };

        if installed.is_zero() {
            return MetadataStates::UPGRADING;
        }

        use std::cmp::Ordering::*;
        match (
            installed.major.cmp(&supported.major),
            installed.minor.cmp(&supported.minor),
            installed.patch.cmp(&supported.patch),
        ) {
            (Greater, _, _) => MetadataStates::MAJOR_HIGHER,
            (Less, _, _) => MetadataStates::MAJOR_LOWER,
            (Equal, Greater, _) => MetadataStates::MINOR_HIGHER,
            (Equal, Less, _) => MetadataStates::MINOR_LOWER,
            (Equal, Equal, Greater) => MetadataStates::PATCH_HIGHER,
            (Equal, Equal, Less) => MetadataStates::PATCH_LOWER,
            (Equal, Equal, Equal) => MetadataStates::EQUAL,
        }
    }
}

/// What to do when a metadata validation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MdsAction {
    None,
    Note,
    Warn,
    RaiseError,
}

/// One metadata validation: when the observed state is in `states`,
/// `action` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetadataValidation {
    pub states: MetadataStates,
    pub action: MdsAction,
}

impl MetadataValidation {
    /// Create a new validation.
    pub const fn new(states: MetadataStates, action: MdsAction) -> Self {
        Self { states, action }
    }

    /// Whether this validation applies to the observed state.
    pub fn matches(&self, observed: MetadataStates) -> bool {
        self.states.intersects(observed)
    }
}

/// Validations for operations that write cluster state.
pub fn mutating_validations() -> Vec<MetadataValidation> {
    vec![
        MetadataValidation::new(MetadataStates::UPGRADING, MdsAction::RaiseError),
        MetadataValidation::new(MetadataStates::INCOMPATIBLE, MdsAction::RaiseError),
        MetadataValidation::new(MetadataStates::COMPATIBLE_HIGHER, MdsAction::RaiseError),
        MetadataValidation::new(MetadataStates::COMPATIBLE_LOWER, MdsAction::Warn),
    ]
}

/// Validations for operations that only read cluster state.
pub fn read_only_validations() -> Vec<MetadataValidation> {
    vec![
        MetadataValidation::new(MetadataStates::UPGRADING, MdsAction::Warn),
        MetadataValidation::new(MetadataStates::INCOMPATIBLE, MdsAction::RaiseError),
        MetadataValidation::new(
            MetadataStates::COMPATIBLE_HIGHER.union(MetadataStates::COMPATIBLE_LOWER),
            MdsAction::Note,
        ),
    ]
}

/// Operator-facing explanation of a metadata state.
pub fn describe_state(state: MetadataStates, installed: Option<Version>, supported: Version) -> String {
    let installed = installed
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(none)".to_string());

    if state == MetadataStates::NONEXISTING {
        "The metadata schema does not exist".to_string()
    } else if state == MetadataStates::UPGRADING {
        "The metadata schema is being set up or upgraded, wait until it completes".to_string()
    } else if state == MetadataStates::EQUAL {
        format!("The metadata schema version {} is current", installed)
    } else if MetadataStates::INCOMPATIBLE.contains(state) {
        format!(
            "Incompatible metadata schema version {}, this build supports {}",
            installed, supported
        )
    } else if MetadataStates::COMPATIBLE_HIGHER.contains(state) {
        format!(
            "The metadata schema version {} is newer than the supported {}, \
             use a newer client to change the cluster",
            installed, supported
        )
    } else {
        format!(
            "The metadata schema version {} is older than {}, an upgrade is recommended",
            installed, supported
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED: Version = Version::new(2, 0, 0);

    #[test]
    fn test_compare() {
        let cmp = |v: Option<Version>| MetadataStates::compare(v, SUPPORTED);

        assert_eq!(cmp(None), MetadataStates::NONEXISTING);
        assert_eq!(cmp(Some(Version::new(0, 0, 0))), MetadataStates::UPGRADING);
        assert_eq!(cmp(Some(SUPPORTED)), MetadataStates::EQUAL);
        assert_eq!(cmp(Some(Version::new(3, 0, 0))), MetadataStates::MAJOR_HIGHER);
        assert_eq!(cmp(Some(Version::new(1, 0, 0))), MetadataStates::MAJOR_LOWER);
        assert_eq!(cmp(Some(Version::new(2, 1, 0))), MetadataStates::MINOR_HIGHER);
        assert_eq!(cmp(Some(Version::new(2, 0, 1))), MetadataStates::PATCH_HIGHER);
    }

    #[test]
    fn test_validation_matches() {
        let v = MetadataValidation::new(MetadataStates::COMPATIBLE_LOWER, MdsAction::Warn);
        assert!(v.matches(MetadataStates::PATCH_LOWER));
        assert!(!v.matches(MetadataStates::EQUAL));
    }

    #[test]
    fn test_equal_never_matches_standard_lists() {
        for v in mutating_validations().iter().chain(read_only_validations().iter()) {
            assert!(!v.matches(MetadataStates::EQUAL));
            assert!(!v.matches(MetadataStates::NONEXISTING));
        }
    }

    #[test]
    fn test_describe_state() {
        let msg = describe_state(
            MetadataStates::MAJOR_HIGHER,
            Some(Version::new(3, 0, 0)),
            SUPPORTED,
        );
        assert!(msg.contains("Incompatible"));
        assert!(msg.contains("3.0.0"));
    }
}
