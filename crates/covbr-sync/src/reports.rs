use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use covbr_core::{iso_millis, Snapshot};
use covbr_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::SyncRunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn run_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

pub async fn write_run_summary(run_dir: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("run.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// One parquet row per candidate, metric and region, flagged with whether the
/// candidate went into history this run. Returns the manifest path.
pub async fn export_region_counts(
    run_dir: &Path,
    candidates: &[Snapshot],
    appended: &[DateTime<Utc>],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let counts_path = snapshot_dir.join("region_counts.parquet");
    write_region_counts_parquet(&counts_path, candidates, appended)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("region_counts", run_dir, &counts_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_region_counts_parquet(
    path: &Path,
    candidates: &[Snapshot],
    appended: &[DateTime<Utc>],
) -> Result<()> {
    let appended = appended.iter().collect::<BTreeSet<_>>();
    let mut stamps = Vec::new();
    let mut urls = Vec::new();
    let mut metrics = Vec::new();
    let mut states = Vec::new();
    let mut counts = Vec::new();
    let mut flags = Vec::new();
    for snapshot in candidates {
        let stamp = iso_millis::format(&snapshot.source_timestamp);
        let was_appended = appended.contains(&snapshot.source_timestamp);
        for (kind, list) in &snapshot.by_region {
            for entry in list {
                stamps.push(stamp.clone());
                urls.push(snapshot.source_url.clone());
                metrics.push(kind.to_string());
                states.push(entry.state.clone());
                counts.push(entry.count);
                flags.push(was_appended);
            }
        }
    }

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_timestamp", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("metric", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("count", DataType::Int64, false),
        ArrowField::new("appended", DataType::Boolean, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(stamps)),
            Arc::new(StringArray::from(urls)),
            Arc::new(StringArray::from(metrics)),
            Arc::new(StringArray::from(states)),
            Arc::new(Int64Array::from(counts)),
            Arc::new(BooleanArray::from(flags)),
        ],
    )
    .context("building region counts record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
