use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use covbr_core::{iso_millis, FetchedPage, MetricKind, PipelineError, ValidationCheck};
use covbr_storage::{DiagnosticStore, FileSnapshotStore, ResourceFetcher};
use covbr_sync::{SourceConfig, SourceRegistry, SyncConfig, SyncPipeline};
use tempfile::{tempdir, TempDir};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
}

fn fixture(rel: &str) -> Vec<u8> {
    let path = fixtures_root().join(rel);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Serves canned bodies by URL; anything unknown is a 404.
#[derive(Default)]
struct FixtureFetcher {
    bodies: HashMap<String, Vec<u8>>,
}

impl FixtureFetcher {
    fn with(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }
}

#[async_trait]
impl ResourceFetcher for FixtureFetcher {
    async fn fetch(&self, _source_id: &str, url: &str) -> Result<FetchedPage, PipelineError> {
        let body = self.bodies.get(url).ok_or_else(|| PipelineError::FetchFailure {
            url: url.to_string(),
            status: Some(404),
            reason: "http status 404".to_string(),
        })?;
        Ok(FetchedPage {
            url: url.to_string(),
            content_type: "application/octet-stream".to_string(),
            body: body.clone(),
            fetched_at: Utc::now(),
        })
    }
}

const REGISTRY: &str = r#"
sources:
  - source_id: ms-dashboard
    display_name: Dashboard
    enabled: true
    format: dashboard_export
    url: https://fixtures.test/dashboard
  - source_id: ms-json-api
    display_name: API
    enabled: true
    format: json_api
    url: https://fixtures.test/api
  - source_id: ms-feed
    display_name: Feed
    enabled: true
    format: feed
    url: https://fixtures.test/noticias
    feed_url: https://fixtures.test/noticias/rss
    topic_keywords: [coronavirus]
  - source_id: ms-embedded
    display_name: Embedded
    enabled: true
    format: embedded_script
    url: https://fixtures.test/embedded
"#;

fn source(source_id: &str) -> SourceConfig {
    SourceRegistry::from_yaml(REGISTRY)
        .unwrap()
        .enabled_source(source_id)
        .unwrap()
        .clone()
}

struct Harness {
    dir: TempDir,
    store: Arc<FileSnapshotStore>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::new(dir.path().join("data")));
        Self { dir, store }
    }

    fn diagnostics_dir(&self) -> PathBuf {
        self.dir.path().join("data").join("diagnostics")
    }

    fn pipeline(&self, source_id: &str, fetcher: FixtureFetcher) -> SyncPipeline {
        let config = SyncConfig::rooted_at(self.dir.path(), source_id);
        SyncPipeline::new(config, source(source_id))
            .unwrap()
            .with_collaborators(
                Arc::new(fetcher),
                self.store.clone(),
                Arc::new(DiagnosticStore::new(self.diagnostics_dir())),
            )
    }
}

fn dashboard_fetcher() -> FixtureFetcher {
    FixtureFetcher::default().with(
        "https://fixtures.test/dashboard",
        fixture("ms-dashboard/sample/rows.json"),
    )
}

fn feed_fetcher() -> FixtureFetcher {
    let mut fetcher = FixtureFetcher::default().with(
        "https://fixtures.test/noticias/rss",
        fixture("ms-feed/sample/feed.xml"),
    );
    for day in ["03-04", "04-04", "05-04"] {
        fetcher = fetcher.with(
            &format!("https://fixtures.test/noticias/coronavirus-boletim-{day}"),
            fixture(&format!("ms-feed/sample/coronavirus-boletim-{day}.html")),
        );
    }
    fetcher
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

#[tokio::test]
async fn dashboard_export_appends_once_then_only_refreshes_latest() {
    let harness = Harness::new();

    let first = harness
        .pipeline("ms-dashboard", dashboard_fetcher())
        .run_once()
        .await
        .expect("first run");
    assert_eq!(first.candidates, 1);
    assert_eq!(first.appended, 1);
    assert_eq!(first.cursor_before, None);
    assert_eq!(first.cursor_after, Some(utc(2020, 4, 5, 21)));

    let latest = harness.store.read_latest().await.unwrap().expect("latest written");
    assert_eq!(latest.total(MetricKind::Infected), Some(7884));
    assert_eq!(latest.total(MetricKind::Deceased), Some(302));
    assert_eq!(latest.total(MetricKind::Tested), Some(31995));
    assert_eq!(latest.total(MetricKind::NotInfected), Some(24111));
    let record = latest.to_record();
    assert_eq!(
        iso_millis::format(&record.last_updated_at_source),
        "2020-04-05T21:00:00.000Z"
    );
    assert_eq!(record.infected_by_region.map(|l| l.len()), Some(27));

    let second = harness
        .pipeline("ms-dashboard", dashboard_fetcher())
        .run_once()
        .await
        .expect("second run");
    assert_eq!(second.candidates, 1);
    assert_eq!(second.appended, 0);
    assert_eq!(second.cursor_before, Some(utc(2020, 4, 5, 21)));
    assert_eq!(second.latest_source_timestamp, Some(utc(2020, 4, 5, 21)));

    assert_eq!(harness.store.read_history().await.unwrap().len(), 1);
    assert_eq!(harness.store.read_dataset().await.unwrap().len(), 2);

    let run_dir = PathBuf::from(&second.reports_dir);
    assert!(run_dir.join("run.json").exists());
    assert!(run_dir.join("snapshots").join("region_counts.parquet").exists());
    assert!(PathBuf::from(&second.parquet_manifest).exists());
    let raw_root = harness.dir.path().join("data").join("raw").join("ms-dashboard");
    let archived = std::fs::read_dir(&raw_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .flat_map(|day| files_under(&day.path()))
        .count();
    assert_eq!(archived, 1, "identical payloads are archived once");
}

#[tokio::test]
async fn json_api_resolves_numeric_region_ids() {
    let harness = Harness::new();
    let fetcher = FixtureFetcher::default().with(
        "https://fixtures.test/api",
        fixture("ms-json-api/sample/portal.json"),
    );

    let summary = harness.pipeline("ms-json-api", fetcher).run_once().await.unwrap();
    assert_eq!(summary.appended, 1);

    let latest = harness.store.read_latest().await.unwrap().unwrap();
    assert_eq!(latest.total(MetricKind::Infected), Some(10292));
    assert_eq!(latest.total(MetricKind::Deceased), Some(502));
    assert!(latest.region_codes().contains("DF"));
    assert_eq!(latest.source_timestamp, utc(2020, 4, 5, 21));
}

#[tokio::test]
async fn feed_crawl_discards_pages_older_than_the_cursor() {
    let harness = Harness::new();

    let first = harness
        .pipeline("ms-feed", feed_fetcher())
        .run_once()
        .await
        .expect("first crawl");
    assert_eq!(first.candidates, 3);
    assert_eq!(first.appended, 3);
    assert_eq!(first.discarded, 0);
    let history = harness.store.read_history().await.unwrap();
    let stamps = history.iter().map(|s| s.source_timestamp).collect::<Vec<_>>();
    assert_eq!(
        stamps,
        vec![utc(2020, 4, 3, 20), utc(2020, 4, 4, 20), utc(2020, 4, 5, 21)]
    );

    let second = harness
        .pipeline("ms-feed", feed_fetcher())
        .run_once()
        .await
        .expect("second crawl");
    assert_eq!(second.discarded, 2);
    assert_eq!(second.candidates, 1);
    assert_eq!(second.appended, 0);
    assert_eq!(harness.store.read_history().await.unwrap().len(), 3);
    let latest = harness.store.read_latest().await.unwrap().unwrap();
    assert_eq!(latest.source_timestamp, utc(2020, 4, 5, 21));
}

#[tokio::test]
async fn failed_detail_pages_do_not_block_the_others() {
    let harness = Harness::new();
    let fetcher = FixtureFetcher::default()
        .with(
            "https://fixtures.test/noticias/rss",
            fixture("ms-feed/sample/feed.xml"),
        )
        .with(
            "https://fixtures.test/noticias/coronavirus-boletim-05-04",
            fixture("ms-feed/sample/coronavirus-boletim-05-04.html"),
        );

    let summary = harness.pipeline("ms-feed", fetcher).run_once().await.unwrap();
    assert_eq!(summary.failed_details, 2);
    assert_eq!(summary.appended, 1);
}

#[tokio::test]
async fn embedded_script_source_reads_the_last_day() {
    let harness = Harness::new();
    let fetcher = FixtureFetcher::default().with(
        "https://fixtures.test/embedded",
        fixture("ms-embedded/sample/page.html"),
    );
    let summary = harness.pipeline("ms-embedded", fetcher).run_once().await.unwrap();
    assert_eq!(summary.latest_source_timestamp, Some(utc(2020, 3, 20, 20)));
    let latest = harness.store.read_latest().await.unwrap().unwrap();
    assert_eq!(latest.total(MetricKind::Deceased), Some(11));
}

#[tokio::test]
async fn malformed_embedded_payload_is_captured_and_nothing_persists() {
    let harness = Harness::new();
    let fetcher = FixtureFetcher::default().with(
        "https://fixtures.test/embedded",
        b"<script>var database = {\"brazil\": [{\"date\": \"20/03/2020\", }</script>".to_vec(),
    );

    let err = harness
        .pipeline("ms-embedded", fetcher)
        .run_once()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "malformed_embedded_payload");

    let captured = files_under(&harness.diagnostics_dir().join("malformed_embedded_payload"));
    assert_eq!(captured.len(), 1);
    let evidence = std::fs::read_to_string(&captured[0]).unwrap();
    assert!(evidence.starts_with('{'));

    assert!(harness.store.read_latest().await.unwrap().is_none());
    assert!(harness.store.read_history().await.unwrap().is_empty());
}

#[tokio::test]
async fn incomplete_coverage_is_rejected_with_the_candidate_captured() {
    let harness = Harness::new();
    let mut portal: serde_json::Value =
        serde_json::from_slice(&fixture("ms-json-api/sample/portal.json")).unwrap();
    portal["results"].as_array_mut().unwrap().pop();
    let fetcher = FixtureFetcher::default().with(
        "https://fixtures.test/api",
        serde_json::to_vec(&portal).unwrap(),
    );

    let err = harness
        .pipeline("ms-json-api", fetcher)
        .run_once()
        .await
        .unwrap_err();
    match &err {
        PipelineError::Validation(v) => assert_eq!(v.check, ValidationCheck::CoverageMismatch),
        other => panic!("unexpected error {other:?}"),
    }

    let captured = files_under(&harness.diagnostics_dir().join("validation_error"));
    assert_eq!(captured.len(), 1);
    let candidate: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&captured[0]).unwrap()).unwrap();
    assert_eq!(candidate["infectedByRegion"].as_array().map(|a| a.len()), Some(26));
    assert!(harness.store.read_latest().await.unwrap().is_none());
}

#[tokio::test]
async fn fetch_failure_aborts_without_diagnostics() {
    let harness = Harness::new();
    let err = harness
        .pipeline("ms-dashboard", FixtureFetcher::default())
        .run_once()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::FetchFailure { status: Some(404), .. }));
    assert!(!harness.diagnostics_dir().exists());
    assert!(harness.store.read_latest().await.unwrap().is_none());
}

#[tokio::test]
async fn unwritable_reports_dir_fails_before_any_store_write() {
    let harness = Harness::new();
    std::fs::write(harness.dir.path().join("reports"), b"not a directory").unwrap();

    let err = harness
        .pipeline("ms-dashboard", dashboard_fetcher())
        .run_once()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "internal");

    assert!(harness.store.read_latest().await.unwrap().is_none());
    assert!(harness.store.read_history().await.unwrap().is_empty());
    assert!(harness.store.read_dataset().await.unwrap().is_empty());
}
