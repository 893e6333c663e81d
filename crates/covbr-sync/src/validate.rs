//! Structural and semantic checks run on every candidate before anything is persisted.

use std::collections::{BTreeSet, HashSet};

use covbr_adapters::Expectations;
use covbr_core::codec::is_region_code;
use covbr_core::{checked_total, MetricKind, Snapshot, ValidationCheck, ValidationError};
use serde::Serialize;
use tracing::warn;

/// Metrics every published record carries, whatever the source.
pub const MANDATORY_METRICS: [MetricKind; 2] = [MetricKind::Infected, MetricKind::Deceased];

/// Soft findings that do not block persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

/// Checks run in order and stop at the first failure:
/// presence, region codes and coverage, values and totals, then the
/// (non-blocking) monotonic comparison against `previous`.
pub fn validate(
    candidate: &Snapshot,
    expectations: &Expectations,
    declared: &[MetricKind],
    previous: Option<&Snapshot>,
) -> Result<ValidationReport, ValidationError> {
    check_presence(candidate, declared)?;
    check_regions(candidate, expectations)?;
    check_values(candidate)?;
    Ok(compare_with_previous(candidate, expectations, previous))
}

fn check_presence(candidate: &Snapshot, declared: &[MetricKind]) -> Result<(), ValidationError> {
    if candidate.region_codes().is_empty() {
        return Err(ValidationError::new(
            ValidationCheck::NoRegions,
            "no region observations extracted",
        ));
    }
    for kind in MANDATORY_METRICS.iter().chain(declared) {
        let present = candidate
            .by_region
            .get(kind)
            .is_some_and(|list| !list.is_empty());
        if !present {
            return Err(ValidationError::new(
                ValidationCheck::MissingMandatoryMetric,
                format!("{kind} has no per-region values"),
            ));
        }
    }
    Ok(())
}

fn check_regions(candidate: &Snapshot, expectations: &Expectations) -> Result<(), ValidationError> {
    for (kind, list) in &candidate.by_region {
        let mut seen = HashSet::new();
        for entry in list {
            if !is_region_code(&entry.state) {
                return Err(ValidationError::new(
                    ValidationCheck::MalformedRegionCode,
                    format!("{kind}: {:?} is not a two-letter region code", entry.state),
                ));
            }
            if !seen.insert(entry.state.as_str()) {
                return Err(ValidationError::new(
                    ValidationCheck::DuplicateRegion,
                    format!("{kind}: region {} appears more than once", entry.state),
                ));
            }
        }
        if let Some(expected) = expectations.full_coverage {
            if list.len() != expected {
                return Err(ValidationError::new(
                    ValidationCheck::CoverageMismatch,
                    format!("{kind}: expected {expected} regions, got {}", list.len()),
                ));
            }
        }
    }

    // Every row must carry every declared metric.
    let all_regions = candidate.region_codes();
    for (kind, list) in &candidate.by_region {
        let regions = list.iter().map(|c| c.state.as_str()).collect::<BTreeSet<_>>();
        if regions != all_regions {
            let missing = all_regions
                .difference(&regions)
                .copied()
                .collect::<Vec<_>>()
                .join(",");
            return Err(ValidationError::new(
                ValidationCheck::IncompleteRegionMetrics,
                format!("{kind}: no value for {missing}"),
            ));
        }
    }
    Ok(())
}

fn check_values(candidate: &Snapshot) -> Result<(), ValidationError> {
    for (kind, list) in &candidate.by_region {
        if let Some(negative) = list.iter().find(|c| c.count < 0) {
            return Err(ValidationError::new(
                ValidationCheck::NegativeValue,
                format!("{kind}: {} has {}", negative.state, negative.count),
            ));
        }
        let Some(sum) = checked_total(list) else {
            return Err(ValidationError::new(
                ValidationCheck::TotalsMismatch,
                format!("{kind}: regions sum overflows i64"),
            ));
        };
        let total = candidate.total(*kind);
        if total != Some(sum) {
            return Err(ValidationError::new(
                ValidationCheck::TotalsMismatch,
                format!("{kind}: total {total:?} but regions sum to {sum}"),
            ));
        }
    }
    Ok(())
}

fn compare_with_previous(
    candidate: &Snapshot,
    expectations: &Expectations,
    previous: Option<&Snapshot>,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(previous) = previous.filter(|_| expectations.monotonic_totals) else {
        return report;
    };
    for (kind, &total) in &candidate.metrics {
        if let Some(before) = previous.total(*kind) {
            if total < before {
                warn!(metric = %kind, before, after = total, "cumulative total decreased");
                report
                    .warnings
                    .push(format!("{kind} decreased from {before} to {total}"));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use covbr_core::codec::FEDERATIVE_UNITS;
    use covbr_core::RegionObservation;

    const DECLARED: [MetricKind; 2] = [MetricKind::Infected, MetricKind::Deceased];

    fn full_coverage() -> Expectations {
        Expectations {
            full_coverage: Some(27),
            monotonic_totals: true,
        }
    }

    fn snapshot_of(observations: &[RegionObservation]) -> Snapshot {
        let at = Utc.with_ymd_and_hms(2020, 4, 5, 21, 0, 0).unwrap();
        Snapshot::from_observations(observations, &DECLARED, at, "https://fixtures.test/", at)
            .unwrap()
    }

    fn all_units(infected: i64) -> Vec<RegionObservation> {
        FEDERATIVE_UNITS
            .iter()
            .map(|unit| {
                RegionObservation::new(unit.uf)
                    .with_metric(MetricKind::Infected, infected)
                    .with_metric(MetricKind::Deceased, 1)
            })
            .collect()
    }

    fn check_of(result: Result<ValidationReport, ValidationError>) -> ValidationCheck {
        result.expect_err("should fail").check
    }

    #[test]
    fn rejects_region_counts_whose_sum_overflows() {
        let mut snapshot = snapshot_of(&all_units(10));
        let infected = snapshot.by_region.get_mut(&MetricKind::Infected).unwrap();
        infected[0].count = i64::MAX;
        infected[1].count = i64::MAX;
        snapshot.metrics.insert(MetricKind::Infected, i64::MAX.wrapping_add(i64::MAX));
        let err = validate(&snapshot, &Expectations::default(), &DECLARED, None).unwrap_err();
        assert_eq!(err.check, ValidationCheck::TotalsMismatch);
        assert!(err.details.contains("overflows"));
    }

    #[test]
    fn accepts_exactly_full_coverage() {
        let snapshot = snapshot_of(&all_units(10));
        let report = validate(&snapshot, &full_coverage(), &DECLARED, None).unwrap();
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn rejects_one_region_short_of_full_coverage() {
        let mut observations = all_units(10);
        observations.pop();
        let snapshot = snapshot_of(&observations);
        assert_eq!(
            check_of(validate(&snapshot, &full_coverage(), &DECLARED, None)),
            ValidationCheck::CoverageMismatch
        );
        assert!(validate(&snapshot, &Expectations::default(), &DECLARED, None).is_ok());
    }

    #[test]
    fn empty_candidate_fails_first() {
        let snapshot = snapshot_of(&[]);
        assert_eq!(
            check_of(validate(&snapshot, &full_coverage(), &DECLARED, None)),
            ValidationCheck::NoRegions
        );
    }

    #[test]
    fn missing_metric_on_one_row_is_incomplete() {
        let observations = vec![
            RegionObservation::new("SP")
                .with_metric(MetricKind::Infected, 5)
                .with_metric(MetricKind::Deceased, 1),
            RegionObservation::new("RJ").with_metric(MetricKind::Infected, 2),
        ];
        let snapshot = snapshot_of(&observations);
        let err = validate(&snapshot, &Expectations::default(), &DECLARED, None).unwrap_err();
        assert_eq!(err.check, ValidationCheck::IncompleteRegionMetrics);
        assert!(err.details.contains("RJ"));
    }

    #[test]
    fn malformed_codes_and_duplicates_are_rejected() {
        let snapshot = snapshot_of(&[RegionObservation::new("São Paulo")
            .with_metric(MetricKind::Infected, 5)
            .with_metric(MetricKind::Deceased, 1)]);
        assert_eq!(
            check_of(validate(&snapshot, &Expectations::default(), &DECLARED, None)),
            ValidationCheck::MalformedRegionCode
        );

        let twice = RegionObservation::new("SP")
            .with_metric(MetricKind::Infected, 5)
            .with_metric(MetricKind::Deceased, 1);
        let snapshot = snapshot_of(&[twice.clone(), twice]);
        assert_eq!(
            check_of(validate(&snapshot, &Expectations::default(), &DECLARED, None)),
            ValidationCheck::DuplicateRegion
        );
    }

    #[test]
    fn negative_counts_and_tampered_totals_are_rejected() {
        let snapshot = snapshot_of(&[RegionObservation::new("SP")
            .with_metric(MetricKind::Infected, -1)
            .with_metric(MetricKind::Deceased, 0)]);
        assert_eq!(
            check_of(validate(&snapshot, &Expectations::default(), &DECLARED, None)),
            ValidationCheck::NegativeValue
        );

        let mut snapshot = snapshot_of(&all_units(2));
        snapshot.metrics.insert(MetricKind::Infected, 1);
        assert_eq!(
            check_of(validate(&snapshot, &full_coverage(), &DECLARED, None)),
            ValidationCheck::TotalsMismatch
        );
    }

    #[test]
    fn decreasing_totals_only_warn() {
        let previous = snapshot_of(&all_units(10));
        let candidate = snapshot_of(&all_units(9));
        let report = validate(&candidate, &full_coverage(), &DECLARED, Some(&previous)).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("infected decreased"));

        let relaxed = Expectations {
            monotonic_totals: false,
            ..full_coverage()
        };
        let report = validate(&candidate, &relaxed, &DECLARED, Some(&previous)).unwrap();
        assert!(report.warnings.is_empty());
    }
}
