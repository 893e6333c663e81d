use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use covbr_core::{Snapshot, SnapshotRecord};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::write_atomically;

/// Key-value-plus-log persistence for accepted snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Last entry of the history log, the dedup cursor for the next run.
    async fn read_last_record(&self) -> anyhow::Result<Option<Snapshot>>;

    async fn write_latest(&self, snapshot: &Snapshot) -> anyhow::Result<()>;

    async fn append_history(&self, snapshots: &[Snapshot]) -> anyhow::Result<()>;

    /// Push accepted snapshots to the public dataset sink.
    async fn publish(&self, snapshots: &[Snapshot]) -> anyhow::Result<()>;
}

/// Directory-backed store: `latest.json`, `history.jsonl`, `dataset.jsonl`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join("latest.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.root.join("dataset.jsonl")
    }

    pub async fn read_latest(&self) -> anyhow::Result<Option<Snapshot>> {
        let path = self.latest_path();
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let record: SnapshotRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(record.into()))
    }

    pub async fn read_history(&self) -> anyhow::Result<Vec<Snapshot>> {
        read_jsonl(&self.history_path()).await
    }

    pub async fn read_dataset(&self) -> anyhow::Result<Vec<Snapshot>> {
        read_jsonl(&self.dataset_path()).await
    }
}

async fn read_jsonl(path: &Path) -> anyhow::Result<Vec<Snapshot>> {
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str::<SnapshotRecord>(line)
                .map(Snapshot::from)
                .with_context(|| format!("parsing {} entry {}", path.display(), idx + 1))
        })
        .collect()
}

async fn append_jsonl(path: &Path, snapshots: &[Snapshot]) -> anyhow::Result<()> {
    if snapshots.is_empty() {
        return Ok(());
    }
    let mut buffer = Vec::new();
    for snapshot in snapshots {
        serde_json::to_writer(&mut buffer, &snapshot.to_record())?;
        buffer.push(b'\n');
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(&buffer)
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.sync_data().await?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn read_last_record(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.read_history().await?.pop())
    }

    async fn write_latest(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&snapshot.to_record())?;
        write_atomically(&self.latest_path(), &bytes).await
    }

    async fn append_history(&self, snapshots: &[Snapshot]) -> anyhow::Result<()> {
        append_jsonl(&self.history_path(), snapshots).await
    }

    async fn publish(&self, snapshots: &[Snapshot]) -> anyhow::Result<()> {
        append_jsonl(&self.dataset_path(), snapshots).await
    }
}
