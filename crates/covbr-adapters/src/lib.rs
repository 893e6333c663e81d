//! Source adapter contracts + one adapter per historical source format.

pub mod feed;
pub mod normalize;

use chrono::{DateTime, FixedOffset, Utc};
use covbr_core::codec::FEDERATIVE_UNIT_COUNT;
use covbr_core::timestamp::resolve;
use covbr_core::{FetchedPage, MetricKind, PipelineError, Snapshot};
use serde::{Deserialize, Serialize};

pub use feed::{discover_detail_targets, DetailTarget};
pub use normalize::{
    html_timestamp_text, normalize, FormatHint, HtmlTableHint, JsonApiHint, NormalizedPayload,
    RawPayload, ScriptHint, TabularHint,
};

pub const CRATE_NAME: &str = "covbr-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    DashboardExport,
    JsonApi,
    Feed,
    EmbeddedScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlMode {
    /// One request, one candidate snapshot.
    Single,
    /// A feed document fans out into detail pages, each a candidate.
    Feed,
}

/// What a source promises about its data; drives the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Expectations {
    pub full_coverage: Option<usize>,
    pub monotonic_totals: bool,
}

/// A fully extracted page: the candidate plus the decoded payload it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub snapshot: Snapshot,
    pub payload: RawPayload,
}

/// Failure while extracting a page, carrying whatever should be captured for
/// offline inspection.
#[derive(Debug)]
pub struct ExtractionFailure {
    pub error: PipelineError,
    pub evidence: Vec<u8>,
    pub extension: &'static str,
}

impl ExtractionFailure {
    fn new(error: PipelineError, page: &FetchedPage, payload: Option<&RawPayload>) -> Self {
        if let PipelineError::MalformedEmbeddedPayload { slice, .. } = &error {
            let evidence = slice.as_bytes().to_vec();
            return Self {
                error,
                evidence,
                extension: "txt",
            };
        }
        match payload {
            Some(payload) => Self {
                evidence: payload.to_bytes(),
                extension: payload.extension(),
                error,
            },
            None => Self {
                evidence: page.body.clone(),
                extension: "bin",
                error,
            },
        }
    }
}

pub trait SourceAdapter: Send + Sync {
    fn format(&self) -> SourceFormat;

    fn crawl_mode(&self) -> CrawlMode {
        CrawlMode::Single
    }

    fn format_hint(&self) -> &FormatHint;

    /// Metric kinds every region row of this source is expected to carry.
    fn metrics(&self) -> &[MetricKind];

    fn expectations(&self) -> Expectations;

    fn decode(&self, bytes: &[u8]) -> Result<RawPayload, PipelineError> {
        RawPayload::from_bytes(self.format_hint(), bytes)
    }

    fn normalize(&self, payload: &RawPayload) -> Result<NormalizedPayload, PipelineError> {
        normalize(payload, self.format_hint())
    }

    /// Source timestamp of a page when it can be read without normalizing rows.
    /// `None` leaves the decision to a full `extract`.
    fn peek_timestamp(
        &self,
        _page: &FetchedPage,
        _local_offset: FixedOffset,
    ) -> Option<DateTime<Utc>> {
        None
    }

    /// Decode, normalize and timestamp-resolve one fetched page into a candidate.
    fn extract(
        &self,
        page: &FetchedPage,
        local_offset: FixedOffset,
    ) -> Result<Extracted, ExtractionFailure> {
        let payload = self
            .decode(&page.body)
            .map_err(|e| ExtractionFailure::new(e, page, None))?;
        let normalized = self
            .normalize(&payload)
            .map_err(|e| ExtractionFailure::new(e, page, Some(&payload)))?;
        let source_timestamp = resolve(&normalized.raw_timestamp, local_offset)
            .map_err(|e| ExtractionFailure::new(e, page, Some(&payload)))?;
        let snapshot = Snapshot::from_observations(
            &normalized.observations,
            self.metrics(),
            source_timestamp,
            page.url.clone(),
            page.fetched_at,
        )
        .map_err(|e| ExtractionFailure::new(e, page, Some(&payload)))?;
        Ok(Extracted { snapshot, payload })
    }
}

#[derive(Debug, Clone)]
struct DashboardExportAdapter {
    hint: FormatHint,
}

#[derive(Debug, Clone)]
struct JsonApiAdapter {
    hint: FormatHint,
}

#[derive(Debug, Clone)]
struct FeedPageAdapter {
    hint: FormatHint,
}

#[derive(Debug, Clone)]
struct EmbeddedScriptAdapter {
    hint: FormatHint,
}

const DASHBOARD_METRICS: [MetricKind; 4] = [
    MetricKind::Tested,
    MetricKind::Infected,
    MetricKind::NotInfected,
    MetricKind::Deceased,
];

const API_METRICS: [MetricKind; 2] = [MetricKind::Infected, MetricKind::Deceased];

const BULLETIN_METRICS: [MetricKind; 3] = [
    MetricKind::Suspicious,
    MetricKind::Infected,
    MetricKind::Deceased,
];

impl SourceAdapter for DashboardExportAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::DashboardExport
    }

    fn format_hint(&self) -> &FormatHint {
        &self.hint
    }

    fn metrics(&self) -> &[MetricKind] {
        &DASHBOARD_METRICS
    }

    fn expectations(&self) -> Expectations {
        Expectations {
            full_coverage: Some(FEDERATIVE_UNIT_COUNT),
            monotonic_totals: true,
        }
    }
}

impl SourceAdapter for JsonApiAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::JsonApi
    }

    fn format_hint(&self) -> &FormatHint {
        &self.hint
    }

    fn metrics(&self) -> &[MetricKind] {
        &API_METRICS
    }

    fn expectations(&self) -> Expectations {
        Expectations {
            full_coverage: Some(FEDERATIVE_UNIT_COUNT),
            monotonic_totals: true,
        }
    }
}

impl SourceAdapter for FeedPageAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Feed
    }

    fn crawl_mode(&self) -> CrawlMode {
        CrawlMode::Feed
    }

    fn format_hint(&self) -> &FormatHint {
        &self.hint
    }

    fn metrics(&self) -> &[MetricKind] {
        &BULLETIN_METRICS
    }

    // Bulletins list only the states with notifications; counts get revised.
    fn expectations(&self) -> Expectations {
        Expectations::default()
    }

    fn peek_timestamp(
        &self,
        page: &FetchedPage,
        local_offset: FixedOffset,
    ) -> Option<DateTime<Utc>> {
        let FormatHint::FeedHtml(hint) = &self.hint else {
            return None;
        };
        let RawPayload::Html(html) = self.decode(&page.body).ok()? else {
            return None;
        };
        let text = html_timestamp_text(&html, hint).ok()?;
        resolve(&text, local_offset).ok()
    }
}

impl SourceAdapter for EmbeddedScriptAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::EmbeddedScript
    }

    fn format_hint(&self) -> &FormatHint {
        &self.hint
    }

    fn metrics(&self) -> &[MetricKind] {
        &BULLETIN_METRICS
    }

    fn expectations(&self) -> Expectations {
        Expectations {
            full_coverage: None,
            monotonic_totals: true,
        }
    }
}

pub fn dashboard_export_adapter() -> impl SourceAdapter {
    DashboardExportAdapter {
        hint: FormatHint::Tabular(TabularHint {
            row_marker: "Unidade",
            label_column: 1,
            columns: vec![
                (MetricKind::Tested, 2),
                (MetricKind::Infected, 4),
                (MetricKind::NotInfected, 6),
                (MetricKind::Deceased, 8),
            ],
        }),
    }
}

pub fn json_api_adapter() -> impl SourceAdapter {
    JsonApiAdapter {
        hint: FormatHint::JsonApi(JsonApiHint {
            array_keys: vec!["results", "values"],
            region_key: "uid",
            metric_keys: vec![
                (MetricKind::Infected, "casosAcumulado"),
                (MetricKind::Deceased, "obitosAcumulado"),
            ],
            timestamp_key: "dt_updated",
        }),
    }
}

pub fn feed_page_adapter() -> impl SourceAdapter {
    FeedPageAdapter {
        hint: FormatHint::FeedHtml(HtmlTableHint {
            row_selector: "table tr",
            column_count: 4,
            label_column: 0,
            columns: vec![
                (MetricKind::Suspicious, 1),
                (MetricKind::Infected, 2),
                (MetricKind::Deceased, 3),
            ],
            timestamp_selector: ".documentModified, .data-atualizacao, time",
        }),
    }
}

pub fn embedded_script_adapter() -> impl SourceAdapter {
    EmbeddedScriptAdapter {
        hint: FormatHint::EmbeddedScript(ScriptHint {
            marker: "var database =",
            series_key: "brazil",
            values_key: "values",
            date_key: "date",
            time_key: "time",
            region_key: "uid",
            metric_keys: vec![
                (MetricKind::Suspicious, "suspects"),
                (MetricKind::Infected, "cases"),
                (MetricKind::Deceased, "deaths"),
            ],
        }),
    }
}

pub fn adapter_for_format(format: SourceFormat) -> Box<dyn SourceAdapter> {
    match format {
        SourceFormat::DashboardExport => Box::new(dashboard_export_adapter()),
        SourceFormat::JsonApi => Box::new(json_api_adapter()),
        SourceFormat::Feed => Box::new(feed_page_adapter()),
        SourceFormat::EmbeddedScript => Box::new(embedded_script_adapter()),
    }
}
