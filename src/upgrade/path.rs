//! Upgrade legality and migration path selection.

use std::fmt;

use crate::error::TobsError;
use crate::version::{MigrationBoundaries, Version};

/// What the deployed release looks like relative to the available chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// No release is installed; hand over to a fresh install.
    NoDeployment,
    /// Same or older chart and identical values: nothing to do.
    UpToDate,
    /// A newer chart is available.
    NewerChartAvailable,
    /// Same or older chart with different values: values-only refresh.
    SameChartRevalue,
}

/// Whether deciding the release state requires comparing values.
pub fn needs_values_comparison(latest: Version, deployed: Version) -> bool {
    latest <= deployed
}

/// Classify the release.
///
/// `values_identical` is only consulted when the chart is not newer.
/// Requesting `--same-chart` while a newer chart exists is contradictory and
/// fails instead of silently picking one of the two modes.
pub fn release_state(
    deployed: Option<Version>,
    latest: Version,
    same_chart: bool,
    values_identical: bool,
) -> Result<ReleaseState, TobsError> {
    let Some(deployed) = deployed else {
        return Ok(ReleaseState::NoDeployment);
    };

    if needs_values_comparison(latest, deployed) {
        if values_identical {
            Ok(ReleaseState::UpToDate)
        } else {
            Ok(ReleaseState::SameChartRevalue)
        }
    } else if same_chart {
        Err(TobsError::NewerChartWithSameChart {
            latest: latest.to_string(),
            deployed: deployed.to_string(),
        })
    } else {
        Ok(ReleaseState::NewerChartAvailable)
    }
}

/// Structural migration needed to carry deployed values to the target chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPath {
    /// Deployed too old for a direct jump; must step through an older release.
    LegacyUnsupported,
    /// Restructure values and resources into the 0.8 layout.
    PathTo0_8,
    /// Values are applied verbatim.
    NoOp,
}

impl fmt::Display for MigrationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LegacyUnsupported => "legacy (unsupported)",
            Self::PathTo0_8 => "restructure to 0.8",
            Self::NoOp => "values only",
        };
        f.write_str(name)
    }
}

/// The (deployed, target) pair a migration plan is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationWindow {
    pub deployed: Version,
    pub target: Version,
    pub boundaries: MigrationBoundaries,
    pub skip_crds: bool,
}

impl MigrationWindow {
    pub fn path(&self) -> MigrationPath {
        let b = &self.boundaries;
        if self.deployed <= b.legacy_unsupported && self.target > b.legacy_unsupported {
            MigrationPath::LegacyUnsupported
        } else if self.deployed < b.restructure {
            MigrationPath::PathTo0_8
        } else {
            MigrationPath::NoOp
        }
    }

    /// Fail with a terminal error when no migration may be attempted.
    pub fn ensure_supported(&self) -> Result<MigrationPath, TobsError> {
        match self.path() {
            MigrationPath::LegacyUnsupported => Err(TobsError::UnsupportedUpgrade {
                deployed: self.deployed.to_string(),
                boundary: self.boundaries.legacy_unsupported.to_string(),
            }),
            path => Ok(path),
        }
    }

    /// The upgrade moves from at-or-below the CRD boundary to at-or-above it.
    pub fn crosses_crd_boundary(&self) -> bool {
        let boundary = self.boundaries.crd_introduction;
        self.target >= boundary && self.deployed <= boundary && self.target != self.deployed
    }

    /// The deployed release predates CRD-based collection, so its metrics
    /// volume must be handed over to the new workload.
    pub fn needs_storage_migration(&self) -> bool {
        self.crosses_crd_boundary() && self.deployed < self.boundaries.crd_introduction
    }
}
