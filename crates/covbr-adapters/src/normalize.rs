//! Format-specific payload decoding and normalization into region observations.
//!
//! Nothing here validates: rows are sliced, parsed and mapped through the codec, and
//! anything structural (coverage, completeness, sign) is left to the validator.

use covbr_core::codec::{json_to_integer, json_to_region_code, to_integer, to_region_code};
use covbr_core::{MetricKind, PipelineError, RegionObservation};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Rows(Vec<Vec<String>>),
    Json(JsonValue),
    Html(String),
    Script(String),
}

impl RawPayload {
    /// Decode fetched bytes according to the format the adapter expects.
    pub fn from_bytes(hint: &FormatHint, bytes: &[u8]) -> Result<Self, PipelineError> {
        let text = String::from_utf8_lossy(bytes);
        match hint {
            FormatHint::Tabular(_) => decode_rows(&text).map(RawPayload::Rows),
            FormatHint::JsonApi(_) => serde_json::from_str(&text)
                .map(RawPayload::Json)
                .map_err(|e| PipelineError::EmptyPayload(format!("JSON API body is not JSON: {e}"))),
            FormatHint::FeedHtml(_) => Ok(RawPayload::Html(text.into_owned())),
            FormatHint::EmbeddedScript(_) => Ok(RawPayload::Script(text.into_owned())),
        }
    }

    /// Bytes suitable for a diagnostic capture of this payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RawPayload::Rows(rows) => serde_json::to_vec_pretty(rows).unwrap_or_default(),
            RawPayload::Json(value) => serde_json::to_vec_pretty(value).unwrap_or_default(),
            RawPayload::Html(text) | RawPayload::Script(text) => text.as_bytes().to_vec(),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            RawPayload::Rows(_) | RawPayload::Json(_) => "json",
            RawPayload::Html(_) | RawPayload::Script(_) => "html",
        }
    }
}

/// Rows captured from the dashboard export arrive as a JSON array of arrays; a plain
/// `;`-separated export is accepted as well.
fn decode_rows(text: &str) -> Result<Vec<Vec<String>>, PipelineError> {
    let trimmed = text.trim_start_matches('\u{feff}').trim();
    if trimmed.starts_with('[') {
        let rows: Vec<Vec<JsonValue>> = serde_json::from_str(trimmed).map_err(|e| {
            PipelineError::EmptyPayload(format!("tabular export is not a row array: {e}"))
        })?;
        return Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect());
    }
    Ok(trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split(';')
                .map(|cell| cell.trim().trim_matches('"').to_string())
                .collect()
        })
        .collect())
}

fn cell_to_string(cell: JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularHint {
    pub row_marker: &'static str,
    pub label_column: usize,
    pub columns: Vec<(MetricKind, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonApiHint {
    pub array_keys: Vec<&'static str>,
    pub region_key: &'static str,
    pub metric_keys: Vec<(MetricKind, &'static str)>,
    pub timestamp_key: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlTableHint {
    pub row_selector: &'static str,
    pub column_count: usize,
    pub label_column: usize,
    pub columns: Vec<(MetricKind, usize)>,
    pub timestamp_selector: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHint {
    pub marker: &'static str,
    pub series_key: &'static str,
    pub values_key: &'static str,
    pub date_key: &'static str,
    pub time_key: &'static str,
    pub region_key: &'static str,
    pub metric_keys: Vec<(MetricKind, &'static str)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatHint {
    Tabular(TabularHint),
    JsonApi(JsonApiHint),
    FeedHtml(HtmlTableHint),
    EmbeddedScript(ScriptHint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPayload {
    pub observations: Vec<RegionObservation>,
    pub raw_timestamp: String,
}

pub fn normalize(payload: &RawPayload, hint: &FormatHint) -> Result<NormalizedPayload, PipelineError> {
    match (payload, hint) {
        (RawPayload::Rows(rows), FormatHint::Tabular(hint)) => normalize_rows(rows, hint),
        (RawPayload::Json(value), FormatHint::JsonApi(hint)) => normalize_json(value, hint),
        (RawPayload::Html(html), FormatHint::FeedHtml(hint)) => normalize_html_table(html, hint),
        (RawPayload::Script(text), FormatHint::EmbeddedScript(hint)) => normalize_script(text, hint),
        _ => Err(PipelineError::EmptyPayload(
            "payload does not match the configured format".to_string(),
        )),
    }
}

fn normalize_rows(rows: &[Vec<String>], hint: &TabularHint) -> Result<NormalizedPayload, PipelineError> {
    let Some(footer) = rows.last() else {
        return Err(PipelineError::EmptyPayload("tabular export has no rows".to_string()));
    };
    let raw_timestamp = footer
        .first()
        .map(|cell| cell.trim().to_string())
        .unwrap_or_default();

    let mut observations = Vec::new();
    for row in rows {
        let is_region_row = row
            .first()
            .is_some_and(|cell| cell.trim_start().starts_with(hint.row_marker));
        if !is_region_row {
            continue;
        }
        let label = row.get(hint.label_column).map(String::as_str).unwrap_or_default();
        let mut observation = RegionObservation::new(to_region_code(label)?);
        for &(kind, idx) in &hint.columns {
            if let Some(cell) = row.get(idx) {
                observation.metrics.insert(kind, to_integer(cell)?);
            }
        }
        observations.push(observation);
    }
    debug!(rows = rows.len(), regions = observations.len(), "normalized tabular export");

    Ok(NormalizedPayload {
        observations,
        raw_timestamp,
    })
}

fn json_timestamp_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn insert_json_metrics(
    observation: &mut RegionObservation,
    item: &JsonValue,
    metric_keys: &[(MetricKind, &'static str)],
) -> Result<(), PipelineError> {
    for &(kind, key) in metric_keys {
        match item.get(key) {
            None | Some(JsonValue::Null) => {}
            Some(value) => {
                observation.metrics.insert(kind, json_to_integer(value)?);
            }
        }
    }
    Ok(())
}

fn normalize_json(value: &JsonValue, hint: &JsonApiHint) -> Result<NormalizedPayload, PipelineError> {
    let items = hint
        .array_keys
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            PipelineError::EmptyPayload(format!(
                "missing {} array",
                hint.array_keys.join("/")
            ))
        })?;
    if items.is_empty() {
        return Err(PipelineError::EmptyPayload(format!(
            "{} array is empty",
            hint.array_keys.join("/")
        )));
    }

    let mut observations = Vec::with_capacity(items.len());
    for item in items {
        let region = item
            .get(hint.region_key)
            .ok_or_else(|| PipelineError::UnresolvableRegion(item.to_string()))?;
        let mut observation = RegionObservation::new(json_to_region_code(region)?);
        insert_json_metrics(&mut observation, item, &hint.metric_keys)?;
        observations.push(observation);
    }

    let raw_timestamp = json_timestamp_text(value.get(hint.timestamp_key))
        .or_else(|| json_timestamp_text(items[0].get(hint.timestamp_key)))
        .unwrap_or_default();

    Ok(NormalizedPayload {
        observations,
        raw_timestamp,
    })
}

fn parse_selector(selector: &str) -> Result<Selector, PipelineError> {
    Selector::parse(selector)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("invalid selector {selector:?}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_html_table(html: &str, hint: &HtmlTableHint) -> Result<NormalizedPayload, PipelineError> {
    let document = Html::parse_document(html);
    let row_selector = parse_selector(hint.row_selector)?;
    let cell_selector = parse_selector("td")?;
    let timestamp_selector = parse_selector(hint.timestamp_selector)?;

    let mut observations = Vec::new();
    let mut skipped = 0usize;
    for row in document.select(&row_selector) {
        let cells = row.select(&cell_selector).map(element_text).collect::<Vec<_>>();
        if cells.len() != hint.column_count {
            skipped += 1;
            continue;
        }
        let mut observation = RegionObservation::new(to_region_code(&cells[hint.label_column])?);
        for &(kind, idx) in &hint.columns {
            if let Some(cell) = cells.get(idx) {
                observation.metrics.insert(kind, to_integer(cell)?);
            }
        }
        observations.push(observation);
    }
    debug!(regions = observations.len(), skipped, "normalized html table");

    Ok(NormalizedPayload {
        observations,
        raw_timestamp: timestamp_text(&document, &timestamp_selector),
    })
}

fn timestamp_text(document: &Html, selector: &Selector) -> String {
    document
        .select(selector)
        .next()
        .map(|el| {
            el.value()
                .attr("datetime")
                .map(str::to_string)
                .unwrap_or_else(|| element_text(el))
        })
        .unwrap_or_default()
}

/// Timestamp text of a bulletin page without touching its table rows.
pub fn html_timestamp_text(html: &str, hint: &HtmlTableHint) -> Result<String, PipelineError> {
    let document = Html::parse_document(html);
    Ok(timestamp_text(&document, &parse_selector(hint.timestamp_selector)?))
}

/// Parse the first JSON value after `marker`; trailing script is never read.
/// On failure the evidence runs up to the last closing brace after the marker.
fn slice_embedded_object(text: &str, marker: &str) -> Result<JsonValue, PipelineError> {
    let Some(start) = text.find(marker) else {
        return Err(PipelineError::EmptyPayload(format!("marker {marker:?} not found")));
    };
    let tail = &text[start + marker.len()..];
    let mut values = serde_json::Deserializer::from_str(tail).into_iter::<JsonValue>();
    let reason = match values.next() {
        Some(Ok(value)) => return Ok(value),
        Some(Err(err)) => err.to_string(),
        None => "no value after marker".to_string(),
    };
    let slice = match tail.rfind('}') {
        Some(end) => tail[..=end].trim(),
        None => tail.trim(),
    };
    Err(PipelineError::MalformedEmbeddedPayload {
        reason,
        slice: slice.to_string(),
    })
}

fn normalize_script(text: &str, hint: &ScriptHint) -> Result<NormalizedPayload, PipelineError> {
    let value = slice_embedded_object(text, hint.marker)?;
    let latest = value
        .get(hint.series_key)
        .and_then(JsonValue::as_array)
        .and_then(|series| series.last())
        .ok_or_else(|| PipelineError::EmptyPayload(format!("{} series is empty", hint.series_key)))?;

    let items = latest
        .get(hint.values_key)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| PipelineError::EmptyPayload(format!("latest entry has no {}", hint.values_key)))?;

    let mut observations = Vec::with_capacity(items.len());
    for item in items {
        let region = item
            .get(hint.region_key)
            .ok_or_else(|| PipelineError::UnresolvableRegion(item.to_string()))?;
        let mut observation = RegionObservation::new(json_to_region_code(region)?);
        insert_json_metrics(&mut observation, item, &hint.metric_keys)?;
        observations.push(observation);
    }

    let date = json_timestamp_text(latest.get(hint.date_key)).unwrap_or_default();
    let time = json_timestamp_text(latest.get(hint.time_key)).unwrap_or_default();

    Ok(NormalizedPayload {
        observations,
        raw_timestamp: format!("{date} {time}").trim().to_string(),
    })
}
