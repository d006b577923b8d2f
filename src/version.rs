//! Chart version parsing and the fixed migration boundaries.

use std::fmt;

use crate::error::TobsError;

/// Exclusive upper bound of each version component.
const COMPONENT_BASE: u64 = 1000;

/// Maximum number of dot-separated components a version may carry.
const MAX_COMPONENTS: usize = 3;

/// A `major.minor.patch` chart version.
///
/// Ordering is derived from a packed integer key (base 1000 per component),
/// which preserves lexicographic ordering of the triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    /// Parse a version string with at least `component_count` numeric components.
    ///
    /// A leading `v` is accepted. Missing trailing components (when
    /// `component_count < 3`) default to zero.
    pub fn parse(input: &str, component_count: usize) -> Result<Self, TobsError> {
        let invalid = || TobsError::InvalidVersion(input.to_string());

        if component_count == 0 || component_count > MAX_COMPONENTS {
            return Err(invalid());
        }

        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() < component_count || parts.len() > MAX_COMPONENTS {
            return Err(invalid());
        }

        let mut components = [0u16; MAX_COMPONENTS];
        for (slot, part) in components.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let value: u64 = part.parse().map_err(|_| invalid())?;
            if value >= COMPONENT_BASE {
                return Err(invalid());
            }
            *slot = value as u16;
        }

        Ok(Self {
            major: components[0],
            minor: components[1],
            patch: components[2],
        })
    }

    /// Packed comparison key.
    pub const fn key(&self) -> u64 {
        (self.major as u64 * COMPONENT_BASE + self.minor as u64) * COMPONENT_BASE
            + self.patch as u64
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Versions at which the migration path changes shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationBoundaries {
    /// Deployments at or below this cannot be upgraded directly.
    pub legacy_unsupported: Version,
    /// First release that ships CRD-based metrics collection (kube-prometheus).
    pub crd_introduction: Version,
    /// Deployments below this need the promscale/tracing restructure.
    pub restructure: Version,
}

impl MigrationBoundaries {
    pub const LEGACY_UNSUPPORTED: &'static str = "0.2.2";
    pub const CRD_INTRODUCTION: &'static str = "0.4.0";
    pub const RESTRUCTURE: &'static str = "0.8.0";

    /// Parse boundaries from literal version strings.
    pub fn from_literals(
        legacy_unsupported: &str,
        crd_introduction: &str,
        restructure: &str,
    ) -> Result<Self, TobsError> {
        Ok(Self {
            legacy_unsupported: Version::parse(legacy_unsupported, 3)?,
            crd_introduction: Version::parse(crd_introduction, 3)?,
            restructure: Version::parse(restructure, 3)?,
        })
    }

    /// The boundaries shipped with this release of the tool.
    pub fn standard() -> Result<Self, TobsError> {
        Self::from_literals(
            Self::LEGACY_UNSUPPORTED,
            Self::CRD_INTRODUCTION,
            Self::RESTRUCTURE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn v(s: &str) -> Version {
        Version::parse(s, 3).unwrap()
    }

    #[test]
    fn test_parse_three_components() {
        let version = v("0.8.5");
        assert_eq!((version.major, version.minor, version.patch), (0, 8, 5));
    }

    #[test]
    fn test_parse_accepts_v_prefix() {
        assert_eq!(v("v1.6.1"), v("1.6.1"));
    }

    #[test]
    fn test_parse_round_trips_through_display() {
        for s in ["0.0.0", "0.2.2", "0.4.0", "1.10.3", "12.0.999", "999.999.999"] {
            assert_eq!(v(s).to_string(), s);
            assert_eq!(v(&v(s).to_string()), v(s));
        }
    }

    #[test]
    fn test_parse_fewer_components_fails() {
        assert!(matches!(
            Version::parse("0.8", 3),
            Err(TobsError::InvalidVersion(_))
        ));
        assert!(Version::parse("", 3).is_err());
    }

    #[test]
    fn test_parse_with_smaller_component_count() {
        let version = Version::parse("1.31", 2).unwrap();
        assert_eq!(version.to_string(), "1.31.0");
    }

    #[test]
    fn test_parse_non_numeric_fails() {
        assert!(Version::parse("0.x.1", 3).is_err());
        assert!(Version::parse("0.7.0-beta", 3).is_err());
        assert!(Version::parse("0..1", 3).is_err());
        assert!(Version::parse("-1.0.0", 3).is_err());
    }

    #[test]
    fn test_parse_rejects_overflowing_component() {
        assert!(Version::parse("0.1000.0", 3).is_err());
        assert!(Version::parse("0.0.99999999999999999999", 3).is_err());
    }

    #[test]
    fn test_parse_rejects_extra_components() {
        assert!(Version::parse("0.8.0.1", 3).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_component_count() {
        assert!(Version::parse("0.8.0", 0).is_err());
        assert!(Version::parse("0.8.0", 4).is_err());
    }

    #[test]
    fn test_key_preserves_lexicographic_order() {
        assert!(v("0.9.0") > v("0.8.999"));
        assert!(v("1.0.0") > v("0.999.999"));
        assert!(v("0.10.0") > v("0.9.0"));
        assert_eq!(v("999.999.999").key(), 999_999_999);
    }

    #[test]
    fn test_compare_is_antisymmetric_and_transitive() {
        let samples: Vec<Version> = ["0.1.0", "0.2.2", "0.3.0", "0.4.0", "0.8.0", "0.8.5", "1.0.0"]
            .iter()
            .map(|s| v(s))
            .collect();

        for a in &samples {
            for b in &samples {
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                for c in &samples {
                    if a.cmp(b) != Ordering::Greater && b.cmp(c) != Ordering::Greater {
                        assert_ne!(a.cmp(c), Ordering::Greater);
                    }
                }
            }
        }
    }

    #[test]
    fn test_standard_boundaries() {
        let b = MigrationBoundaries::standard().unwrap();
        assert_eq!(b.legacy_unsupported.to_string(), "0.2.2");
        assert_eq!(b.crd_introduction.to_string(), "0.4.0");
        assert_eq!(b.restructure.to_string(), "0.8.0");
    }

    #[test]
    fn test_boundaries_from_invalid_literal() {
        assert!(MigrationBoundaries::from_literals("0.2.2", "bogus", "0.8.0").is_err());
    }
}
