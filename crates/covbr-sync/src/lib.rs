//! Run orchestration: fetch, extract, validate, merge, persist, report.

pub mod config;
pub mod crawl;
pub mod merge;
pub mod reports;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use covbr_adapters::{adapter_for_format, CrawlMode, ExtractionFailure, SourceAdapter};
use covbr_core::{FetchedPage, PipelineError, Snapshot, SnapshotRecord};
use covbr_storage::{
    DiagnosticSink, DiagnosticStore, FileSnapshotStore, HttpClientConfig, HttpFetcher,
    RawArtifactStore, ResourceFetcher, SnapshotStore,
};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use crawl::{CrawlController, CrawlError, CrawlOutcome};
pub use merge::{merge, MergeOutcome};
pub use validate::{validate, ValidationReport};

pub const CRATE_NAME: &str = "covbr-sync";

/// A fetched page and the snapshot extracted from it, not yet validated.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub page: FetchedPage,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub discarded: usize,
    pub failed_details: usize,
    pub appended: usize,
    pub cursor_before: Option<DateTime<Utc>>,
    pub cursor_after: Option<DateTime<Utc>>,
    pub latest_source_timestamp: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: SourceConfig,
    adapter: Box<dyn SourceAdapter>,
    fetcher: Arc<dyn ResourceFetcher>,
    store: Arc<dyn SnapshotStore>,
    diagnostics: Arc<dyn DiagnosticSink>,
    raw_store: RawArtifactStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: SourceConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            per_source_concurrency: source.max_detail_concurrency,
            ..config.http_client_config()
        })?;
        Ok(Self {
            adapter: adapter_for_format(source.format),
            fetcher: Arc::new(fetcher),
            store: Arc::new(FileSnapshotStore::new(config.data_dir.clone())),
            diagnostics: Arc::new(DiagnosticStore::new(config.diagnostics_dir.clone())),
            raw_store: RawArtifactStore::new(config.raw_dir()),
            config,
            source,
        })
    }

    pub fn with_collaborators(
        mut self,
        fetcher: Arc<dyn ResourceFetcher>,
        store: Arc<dyn SnapshotStore>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        self.fetcher = fetcher;
        self.store = store;
        self.diagnostics = diagnostics;
        self
    }

    /// Either fully succeeds (latest refreshed, zero or more history appends) or
    /// fails with nothing persisted.
    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source_id = %self.source.source_id);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid) -> Result<SyncRunSummary, PipelineError> {
        let started_at = Utc::now();
        let local_offset = self.source.local_offset()?;
        let previous = self.store.read_last_record().await?;
        let cursor_before = previous.as_ref().map(|s| s.source_timestamp);

        let gathered = self.gather(local_offset, cursor_before).await?;
        let mut candidates = gathered.candidates;
        candidates.sort_by_key(|c| c.snapshot.source_timestamp);

        let expectations = self.adapter.expectations();
        let mut reference = previous;
        let mut accepted = Vec::with_capacity(candidates.len());
        let mut warnings = Vec::new();
        for candidate in candidates {
            self.archive_raw(&candidate.page).await?;
            let snapshot = candidate.snapshot.with_read_me(self.source.read_me.clone());
            match validate(
                &snapshot,
                &expectations,
                self.adapter.metrics(),
                reference.as_ref(),
            ) {
                Ok(report) => warnings.extend(report.warnings),
                Err(err) => {
                    let evidence = serde_json::to_vec_pretty(&snapshot.to_record())
                        .context("serializing rejected candidate")?;
                    let err = PipelineError::Validation(err);
                    return Err(self
                        .capture_and_abort(err, &candidate.page.url, "json", &evidence)
                        .await);
                }
            }
            reference = Some(snapshot.clone());
            accepted.push(snapshot);
        }

        let merged = merge(accepted.clone(), cursor_before);
        let appended_stamps: Vec<DateTime<Utc>> = merged
            .as_ref()
            .map(|outcome| outcome.to_append.iter().map(|s| s.source_timestamp).collect())
            .unwrap_or_else(Vec::new);
        let cursor_after = appended_stamps.last().copied().or(cursor_before);

        // Reports go first so a report failure leaves the stores untouched.
        let run_dir = reports::run_dir(&self.config.reports_dir, run_id);
        let manifest_path =
            reports::export_region_counts(&run_dir, &accepted, &appended_stamps).await?;
        let summary = SyncRunSummary {
            run_id,
            source_id: self.source.source_id.clone(),
            started_at,
            finished_at: Utc::now(),
            candidates: accepted.len(),
            discarded: gathered.discarded,
            failed_details: gathered.failed,
            appended: appended_stamps.len(),
            cursor_before,
            cursor_after,
            latest_source_timestamp: merged.as_ref().map(|o| o.latest.source_timestamp),
            warnings,
            reports_dir: run_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        reports::write_run_summary(&run_dir, &summary).await?;

        match merged {
            Some(outcome) => {
                self.store.append_history(&outcome.to_append).await?;
                self.store.write_latest(&outcome.latest).await?;
                self.store.publish(&accepted).await?;
            }
            None => info!("no candidates survived; nothing persisted"),
        }

        info!(
            candidates = summary.candidates,
            appended = summary.appended,
            cursor = ?summary.cursor_after,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn gather(
        &self,
        local_offset: FixedOffset,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<CrawlOutcome, PipelineError> {
        match self.adapter.crawl_mode() {
            CrawlMode::Single => {
                let page = self
                    .fetcher
                    .fetch(&self.source.source_id, &self.source.url)
                    .await?;
                match self.adapter.extract(&page, local_offset) {
                    Ok(extracted) => Ok(CrawlOutcome {
                        candidates: vec![Candidate {
                            snapshot: extracted.snapshot,
                            page,
                        }],
                        ..CrawlOutcome::default()
                    }),
                    Err(failure) => Err(self.capture_failure(&page.url, failure).await),
                }
            }
            CrawlMode::Feed => {
                let controller = CrawlController {
                    fetcher: self.fetcher.as_ref(),
                    adapter: self.adapter.as_ref(),
                    source_id: &self.source.source_id,
                    feed_url: self.source.feed_url(),
                    topic_keywords: &self.source.topic_keywords,
                    local_offset,
                    cursor,
                    max_concurrency: self.source.max_detail_concurrency,
                };
                match controller.run().await {
                    Ok(outcome) => Ok(outcome),
                    Err(CrawlError::Fetch(err)) => Err(err),
                    Err(CrawlError::Extraction { url, failure }) => {
                        Err(self.capture_failure(&url, failure).await)
                    }
                }
            }
        }
    }

    async fn archive_raw(&self, page: &FetchedPage) -> anyhow::Result<()> {
        let extension = extension_for(&page.content_type);
        self.raw_store
            .store_bytes(page.fetched_at, &self.source.source_id, extension, &page.body)
            .await?;
        Ok(())
    }

    async fn capture_failure(&self, url: &str, failure: ExtractionFailure) -> PipelineError {
        self.capture_and_abort(failure.error, url, failure.extension, &failure.evidence)
            .await
    }

    /// The one place evidence of a data-shape failure is written.
    async fn capture_and_abort(
        &self,
        err: PipelineError,
        url: &str,
        extension: &str,
        evidence: &[u8],
    ) -> PipelineError {
        let kind = err.kind();
        if !err.is_data_shape() {
            error!(kind, url, error = %err, "run aborted");
            return err;
        }
        match self.diagnostics.capture(kind, extension, evidence).await {
            Ok(captured) => error!(
                kind,
                url,
                key = %captured.key,
                path = %captured.path.display(),
                error = %err,
                "run aborted; evidence captured"
            ),
            Err(capture_err) => error!(
                kind,
                url,
                error = %err,
                capture_error = %capture_err,
                "run aborted; diagnostic capture failed"
            ),
        }
        err
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    match mime {
        "application/json" => "json",
        "text/html" => "html",
        "application/rss+xml" | "application/atom+xml" | "application/xml" | "text/xml" => "xml",
        "text/plain" | "text/csv" => "txt",
        _ => "bin",
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, PipelineError> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let source = registry.enabled_source(&config.source_id)?.clone();
    let pipeline = SyncPipeline::new(config, source)?;
    pipeline.run_once().await
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub source_id: String,
    pub record: SnapshotRecord,
    pub warnings: Vec<String>,
}

/// Re-run extraction and validation over a stored payload without touching any store.
pub async fn replay_payload(source: &SourceConfig, path: &Path) -> Result<ReplayOutcome, PipelineError> {
    let body = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let page = FetchedPage {
        url: source.url.clone(),
        content_type: "application/octet-stream".to_string(),
        body,
        fetched_at: Utc::now(),
    };
    let adapter = adapter_for_format(source.format);
    let extracted = adapter
        .extract(&page, source.local_offset()?)
        .map_err(|failure| failure.error)?;
    let snapshot = extracted.snapshot.with_read_me(source.read_me.clone());
    let report = validate(&snapshot, &adapter.expectations(), adapter.metrics(), None)?;
    Ok(ReplayOutcome {
        source_id: source.source_id.clone(),
        record: snapshot.to_record(),
        warnings: report.warnings,
    })
}

pub async fn replay_from_env(
    source_id: Option<String>,
    path: &Path,
) -> Result<ReplayOutcome, PipelineError> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let source_id = source_id.unwrap_or(config.source_id);
    let source = registry.enabled_source(&source_id)?;
    replay_payload(source, path).await
}
