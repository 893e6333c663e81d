//! Two-stage crawl for feed sources: discover detail pages, then fetch and extract them.

use chrono::{DateTime, FixedOffset, Utc};
use covbr_adapters::{discover_detail_targets, DetailTarget, ExtractionFailure, SourceAdapter};
use covbr_core::{FetchedPage, PipelineError};
use covbr_storage::ResourceFetcher;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::Candidate;

#[derive(Debug)]
pub enum CrawlError {
    /// The feed itself could not be fetched.
    Fetch(PipelineError),
    /// A fetched document could not be interpreted; carries capture evidence.
    Extraction {
        url: String,
        failure: ExtractionFailure,
    },
}

#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub candidates: Vec<Candidate>,
    /// Pages older than the cursor, dropped before validation.
    pub discarded: usize,
    /// Detail fetches that failed after retries.
    pub failed: usize,
}

#[derive(Debug)]
enum CrawlState {
    DiscoverFeed,
    FetchDetail(Vec<DetailTarget>),
    Done,
}

pub struct CrawlController<'a> {
    pub fetcher: &'a dyn ResourceFetcher,
    pub adapter: &'a dyn SourceAdapter,
    pub source_id: &'a str,
    pub feed_url: &'a str,
    pub topic_keywords: &'a [String],
    pub local_offset: FixedOffset,
    pub cursor: Option<DateTime<Utc>>,
    pub max_concurrency: usize,
}

impl CrawlController<'_> {
    pub async fn run(&self) -> Result<CrawlOutcome, CrawlError> {
        let mut outcome = CrawlOutcome::default();
        let mut state = CrawlState::DiscoverFeed;
        loop {
            debug!(source_id = self.source_id, ?state, "crawl state");
            state = match state {
                CrawlState::DiscoverFeed => CrawlState::FetchDetail(self.discover().await?),
                CrawlState::FetchDetail(targets) => {
                    self.fetch_details(targets, &mut outcome).await?;
                    CrawlState::Done
                }
                CrawlState::Done => break,
            };
        }
        info!(
            source_id = self.source_id,
            candidates = outcome.candidates.len(),
            discarded = outcome.discarded,
            failed = outcome.failed,
            "feed crawl finished"
        );
        Ok(outcome)
    }

    async fn discover(&self) -> Result<Vec<DetailTarget>, CrawlError> {
        let feed = self
            .fetcher
            .fetch(self.source_id, self.feed_url)
            .await
            .map_err(CrawlError::Fetch)?;
        discover_detail_targets(&feed.body, self.topic_keywords).map_err(|error| {
            CrawlError::Extraction {
                url: feed.url.clone(),
                failure: ExtractionFailure {
                    error,
                    evidence: feed.body.clone(),
                    extension: "xml",
                },
            }
        })
    }

    async fn fetch_details(
        &self,
        targets: Vec<DetailTarget>,
        outcome: &mut CrawlOutcome,
    ) -> Result<(), CrawlError> {
        let pages: Vec<(String, Result<FetchedPage, PipelineError>)> = stream::iter(targets)
            .map(|target| async move {
                let fetched = self.fetcher.fetch(self.source_id, &target.url).await;
                (target.url, fetched)
            })
            .buffered(self.max_concurrency.max(1))
            .collect()
            .await;

        for (url, fetched) in pages {
            let page = match fetched {
                Ok(page) => page,
                Err(err) => {
                    warn!(url = %url, error = %err, "detail fetch failed; continuing");
                    outcome.failed += 1;
                    continue;
                }
            };
            if let Some(ts) = self.adapter.peek_timestamp(&page, self.local_offset) {
                if self.is_behind_cursor(ts) {
                    debug!(url = %url, %ts, "older than cursor; discarded before extraction");
                    outcome.discarded += 1;
                    continue;
                }
            }
            let extracted = self
                .adapter
                .extract(&page, self.local_offset)
                .map_err(|failure| CrawlError::Extraction {
                    url: url.clone(),
                    failure,
                })?;
            let snapshot = extracted.snapshot;
            if self.is_behind_cursor(snapshot.source_timestamp) {
                debug!(url = %url, ts = %snapshot.source_timestamp, "older than cursor; discarded");
                outcome.discarded += 1;
                continue;
            }
            outcome.candidates.push(Candidate { page, snapshot });
        }
        Ok(())
    }

    fn is_behind_cursor(&self, ts: DateTime<Utc>) -> bool {
        self.cursor.is_some_and(|cursor| ts < cursor)
    }
}
