//! Incremental history merge: what to append, what becomes the latest view.

use chrono::{DateTime, Utc};
use covbr_core::Snapshot;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub to_append: Vec<Snapshot>,
    pub latest: Snapshot,
}

/// Order candidates by source timestamp and keep those strictly newer than the
/// cursor. A timestamp is appended at most once, even if several candidates share it.
///
/// Returns `None` when there are no candidates at all; otherwise `latest` is the
/// chronologically last candidate whether or not anything is appended.
pub fn merge(mut candidates: Vec<Snapshot>, cursor: Option<DateTime<Utc>>) -> Option<MergeOutcome> {
    candidates.sort_by_key(|s| s.source_timestamp);
    let latest = candidates.last()?.clone();

    let mut high_water = cursor;
    let mut to_append = Vec::new();
    for candidate in candidates {
        let is_new = high_water.map_or(true, |seen| candidate.source_timestamp > seen);
        if is_new {
            high_water = Some(candidate.source_timestamp);
            to_append.push(candidate);
        }
    }
    Some(MergeOutcome { to_append, latest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use covbr_core::{MetricKind, RegionObservation};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 4, day, 20, 0, 0).unwrap()
    }

    fn candidate(day: u32, infected: i64) -> Snapshot {
        let obs = [RegionObservation::new("SP")
            .with_metric(MetricKind::Infected, infected)
            .with_metric(MetricKind::Deceased, 0)];
        Snapshot::from_observations(
            &obs,
            &[MetricKind::Infected, MetricKind::Deceased],
            at(day),
            "https://fixtures.test/",
            at(day),
        )
        .unwrap()
    }

    fn stamps(snapshots: &[Snapshot]) -> Vec<DateTime<Utc>> {
        snapshots.iter().map(|s| s.source_timestamp).collect()
    }

    #[test]
    fn empty_history_appends_everything() {
        let outcome = merge(vec![candidate(1, 1)], None).unwrap();
        assert_eq!(stamps(&outcome.to_append), vec![at(1)]);
    }

    #[test]
    fn candidate_equal_to_cursor_is_not_reappended() {
        let outcome = merge(vec![candidate(1, 1)], Some(at(1))).unwrap();
        assert!(outcome.to_append.is_empty());
        assert_eq!(outcome.latest.source_timestamp, at(1));

        let again = merge(vec![candidate(1, 1)], Some(at(1))).unwrap();
        assert_eq!(again, outcome);
    }

    #[test]
    fn appends_newer_than_cursor_in_order() {
        let outcome = merge(
            vec![candidate(3, 30), candidate(1, 10), candidate(2, 20)],
            Some(at(1)),
        )
        .unwrap();
        assert_eq!(stamps(&outcome.to_append), vec![at(2), at(3)]);
        assert_eq!(outcome.latest.total(MetricKind::Infected), Some(30));
    }

    #[test]
    fn latest_is_refreshed_even_when_older_than_cursor() {
        let outcome = merge(vec![candidate(1, 10)], Some(at(2))).unwrap();
        assert!(outcome.to_append.is_empty());
        assert_eq!(outcome.latest.source_timestamp, at(1));
    }

    #[test]
    fn duplicate_timestamps_append_once() {
        let outcome = merge(vec![candidate(2, 20), candidate(2, 21)], None).unwrap();
        assert_eq!(stamps(&outcome.to_append), vec![at(2)]);
    }

    #[test]
    fn no_candidates_means_no_outcome() {
        assert!(merge(Vec::new(), Some(at(1))).is_none());
    }
}
