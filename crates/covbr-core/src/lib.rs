//! Core domain model, error taxonomy and pure codecs for the COVID-19 Brazil pipeline.

pub mod codec;
pub mod timestamp;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "covbr-core";

pub const DEFAULT_READ_ME: &str = "https://apify.com/pocesar/covid-brazil";

/// Count kinds a source can report per region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Tested,
    NotInfected,
    Infected,
    Deceased,
    Suspicious,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Tested,
        MetricKind::NotInfected,
        MetricKind::Infected,
        MetricKind::Deceased,
        MetricKind::Suspicious,
    ];

    /// Field name of the total in the published snapshot shape.
    pub fn total_field(self) -> &'static str {
        match self {
            MetricKind::Tested => "totalTested",
            MetricKind::NotInfected => "testedNotInfected",
            MetricKind::Infected => "infected",
            MetricKind::Deceased => "deceased",
            MetricKind::Suspicious => "suspiciousCases",
        }
    }

    pub fn by_region_field(self) -> &'static str {
        match self {
            MetricKind::Tested => "testedByRegion",
            MetricKind::NotInfected => "testedNotInfectedByRegion",
            MetricKind::Infected => "infectedByRegion",
            MetricKind::Deceased => "deceasedByRegion",
            MetricKind::Suspicious => "suspiciousCasesByRegion",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.total_field())
    }
}

/// One region row after normalization: a resolved two-letter code plus whatever
/// metrics the row carried. Missing metrics are simply absent from the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionObservation {
    pub region_code: String,
    pub metrics: BTreeMap<MetricKind, i64>,
}

impl RegionObservation {
    pub fn new(region_code: impl Into<String>) -> Self {
        Self {
            region_code: region_code.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, kind: MetricKind, value: i64) -> Self {
        self.metrics.insert(kind, value);
        self
    }
}

/// Raw bytes handed over by the fetch collaborator for one successful request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCount {
    pub state: String,
    pub count: i64,
}

/// Sum of region counts, `None` when it does not fit in an `i64`.
pub fn checked_total(counts: &[RegionCount]) -> Option<i64> {
    counts
        .iter()
        .try_fold(0i64, |acc, c| acc.checked_add(c.count))
}

/// Timestamped set of region-level counts and their totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub source_timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<MetricKind, i64>,
    pub by_region: BTreeMap<MetricKind, Vec<RegionCount>>,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub read_me: String,
    pub version: Option<u32>,
}

impl Snapshot {
    /// Assemble a candidate from normalized observations. Totals are always the sum
    /// of the per-region counts; every declared metric gets a (possibly short) list.
    pub fn from_observations(
        observations: &[RegionObservation],
        declared: &[MetricKind],
        source_timestamp: DateTime<Utc>,
        source_url: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        let mut metrics: BTreeMap<MetricKind, i64> = BTreeMap::new();
        let mut by_region = BTreeMap::new();
        for &kind in declared {
            let counts = observations
                .iter()
                .filter_map(|obs| {
                    obs.metrics.get(&kind).map(|count| RegionCount {
                        state: obs.region_code.clone(),
                        count: *count,
                    })
                })
                .collect::<Vec<_>>();
            let total = checked_total(&counts)
                .ok_or_else(|| PipelineError::UnparsableNumber(format!("{kind} total overflows i64")))?;
            metrics.insert(kind, total);
            by_region.insert(kind, counts);
        }
        Ok(Self {
            source_timestamp,
            metrics,
            by_region,
            source_url: source_url.into(),
            fetched_at,
            read_me: DEFAULT_READ_ME.to_string(),
            version: None,
        })
    }

    pub fn with_read_me(mut self, read_me: impl Into<String>) -> Self {
        self.read_me = read_me.into();
        self
    }

    pub fn total(&self, kind: MetricKind) -> Option<i64> {
        self.metrics.get(&kind).copied()
    }

    /// Union of region codes across every per-region list.
    pub fn region_codes(&self) -> BTreeSet<&str> {
        self.by_region
            .values()
            .flatten()
            .map(|c| c.state.as_str())
            .collect()
    }

    pub fn to_record(&self) -> SnapshotRecord {
        let by = |kind: MetricKind| self.by_region.get(&kind).cloned();
        SnapshotRecord {
            total_tested: self.total(MetricKind::Tested),
            tested_not_infected: self.total(MetricKind::NotInfected),
            infected: self.total(MetricKind::Infected).unwrap_or_default(),
            deceased: self.total(MetricKind::Deceased).unwrap_or_default(),
            suspicious_cases: self.total(MetricKind::Suspicious),
            tested_by_region: by(MetricKind::Tested),
            tested_not_infected_by_region: by(MetricKind::NotInfected),
            infected_by_region: by(MetricKind::Infected),
            deceased_by_region: by(MetricKind::Deceased),
            suspicious_cases_by_region: by(MetricKind::Suspicious),
            source_url: self.source_url.clone(),
            last_updated_at_source: self.source_timestamp,
            last_updated_at_apify: self.fetched_at,
            read_me: self.read_me.clone(),
            version: self.version,
        }
    }
}

/// Persisted/published shape of a snapshot. Stable across source variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tested: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_not_infected: Option<i64>,
    pub infected: i64,
    pub deceased: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspicious_cases: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_by_region: Option<Vec<RegionCount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_not_infected_by_region: Option<Vec<RegionCount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infected_by_region: Option<Vec<RegionCount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deceased_by_region: Option<Vec<RegionCount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspicious_cases_by_region: Option<Vec<RegionCount>>,
    pub source_url: String,
    #[serde(with = "iso_millis")]
    pub last_updated_at_source: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub last_updated_at_apify: DateTime<Utc>,
    pub read_me: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl From<SnapshotRecord> for Snapshot {
    fn from(record: SnapshotRecord) -> Self {
        let mut metrics = BTreeMap::new();
        let mut by_region = BTreeMap::new();
        let totals = [
            (MetricKind::Tested, record.total_tested),
            (MetricKind::NotInfected, record.tested_not_infected),
            (MetricKind::Infected, Some(record.infected)),
            (MetricKind::Deceased, Some(record.deceased)),
            (MetricKind::Suspicious, record.suspicious_cases),
        ];
        for (kind, total) in totals {
            if let Some(total) = total {
                metrics.insert(kind, total);
            }
        }
        let lists = [
            (MetricKind::Tested, record.tested_by_region),
            (MetricKind::NotInfected, record.tested_not_infected_by_region),
            (MetricKind::Infected, record.infected_by_region),
            (MetricKind::Deceased, record.deceased_by_region),
            (MetricKind::Suspicious, record.suspicious_cases_by_region),
        ];
        for (kind, list) in lists {
            if let Some(list) = list {
                by_region.insert(kind, list);
            }
        }
        Snapshot {
            source_timestamp: record.last_updated_at_source,
            metrics,
            by_region,
            source_url: record.source_url,
            fetched_at: record.last_updated_at_apify,
            read_me: record.read_me,
            version: record.version,
        }
    }
}

/// ISO-8601 instants with millisecond precision and a `Z` suffix.
pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(instant: &DateTime<Utc>) -> String {
        instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    pub fn serialize<S: Serializer>(instant: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(instant))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    NoRegions,
    MissingMandatoryMetric,
    MalformedRegionCode,
    DuplicateRegion,
    IncompleteRegionMetrics,
    CoverageMismatch,
    NegativeValue,
    TotalsMismatch,
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationCheck::NoRegions => "no_regions",
            ValidationCheck::MissingMandatoryMetric => "missing_mandatory_metric",
            ValidationCheck::MalformedRegionCode => "malformed_region_code",
            ValidationCheck::DuplicateRegion => "duplicate_region",
            ValidationCheck::IncompleteRegionMetrics => "incomplete_region_metrics",
            ValidationCheck::CoverageMismatch => "coverage_mismatch",
            ValidationCheck::NegativeValue => "negative_value",
            ValidationCheck::TotalsMismatch => "totals_mismatch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{check}: {details}")]
pub struct ValidationError {
    pub check: ValidationCheck,
    pub details: String,
}

impl ValidationError {
    pub fn new(check: ValidationCheck, details: impl Into<String>) -> Self {
        Self {
            check,
            details: details.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed for {url}: {reason}")]
    FetchFailure {
        url: String,
        status: Option<u16>,
        reason: String,
    },
    #[error("empty payload: {0}")]
    EmptyPayload(String),
    #[error("malformed embedded payload: {reason}")]
    MalformedEmbeddedPayload { reason: String, slice: String },
    #[error("unresolvable region label {0:?}")]
    UnresolvableRegion(String),
    #[error("unparsable number {0:?}")]
    UnparsableNumber(String),
    #[error("unparsable timestamp {0:?}")]
    UnparsableTimestamp(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Stable key used to file diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::FetchFailure { .. } => "fetch_failure",
            PipelineError::EmptyPayload(_) => "empty_payload",
            PipelineError::MalformedEmbeddedPayload { .. } => "malformed_embedded_payload",
            PipelineError::UnresolvableRegion(_) => "unresolvable_region",
            PipelineError::UnparsableNumber(_) => "unparsable_number",
            PipelineError::UnparsableTimestamp(_) => "unparsable_timestamp",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Other(_) => "internal",
        }
    }

    /// Errors raised while interpreting an already-fetched payload.
    pub fn is_data_shape(&self) -> bool {
        !matches!(
            self,
            PipelineError::FetchFailure { .. } | PipelineError::Other(_)
        )
    }
}
