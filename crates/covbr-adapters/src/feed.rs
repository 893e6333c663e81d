//! Feed discovery: which detail pages of a news feed are worth fetching.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use covbr_core::PipelineError;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailTarget {
    pub url: String,
    pub title: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Parse an RSS/Atom document and keep one target per unique entry URL that
/// mentions any of `topic_keywords` (all entries when none are configured).
/// Feed order is preserved.
pub fn discover_detail_targets(
    feed_bytes: &[u8],
    topic_keywords: &[String],
) -> Result<Vec<DetailTarget>, PipelineError> {
    let parsed = feed_rs::parser::parse(feed_bytes)
        .map_err(|e| PipelineError::EmptyPayload(format!("unreadable feed: {e}")))?;
    let keywords = topic_keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for entry in &parsed.entries {
        let Some(link) = entry.links.first() else {
            continue;
        };
        let url = link.href.trim().to_string();
        let lowered = url.to_lowercase();
        if !keywords.is_empty() && !keywords.iter().any(|k| lowered.contains(k.as_str())) {
            continue;
        }
        if !seen.insert(url.clone()) {
            continue;
        }
        targets.push(DetailTarget {
            url,
            title: entry.title.as_ref().map(|t| t.content.clone()),
            published: entry.published.or(entry.updated),
        });
    }
    debug!(entries = parsed.entries.len(), targets = targets.len(), "discovered feed targets");
    Ok(targets)
}
