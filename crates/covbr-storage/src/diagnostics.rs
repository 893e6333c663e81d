use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::{sha256_hex, write_atomically};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedDiagnostic {
    pub kind: String,
    pub key: String,
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Single capture point for evidence of a failed run. Called once, at the
/// boundary where the failure is decided.
#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn capture(
        &self,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<CapturedDiagnostic>;
}

#[derive(Debug, Clone)]
pub struct DiagnosticStore {
    root: PathBuf,
}

impl DiagnosticStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn new_key() -> String {
        format!("{}-{}", Utc::now().format("%Y%m%d_%H%M%S"), Uuid::new_v4())
    }
}

#[async_trait]
impl DiagnosticSink for DiagnosticStore {
    async fn capture(
        &self,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<CapturedDiagnostic> {
        let key = Self::new_key();
        let ext = extension.trim_start_matches('.');
        let ext = if ext.is_empty() { "bin" } else { ext };
        let path = self.root.join(kind).join(format!("{key}.{ext}"));
        write_atomically(&path, bytes).await?;

        info!(kind, key = %key, path = %path.display(), bytes = bytes.len(), "captured diagnostic");
        Ok(CapturedDiagnostic {
            kind: kind.to_string(),
            key,
            path,
            sha256: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn captures_are_grouped_by_kind_with_unique_keys() {
        let dir = tempdir().expect("tempdir");
        let store = DiagnosticStore::new(dir.path());

        let first = store
            .capture("malformed_embedded_payload", "txt", b"{\"brazil\":[")
            .await
            .expect("first capture");
        let second = store
            .capture("malformed_embedded_payload", "txt", b"{\"brazil\":[")
            .await
            .expect("second capture");

        assert_ne!(first.key, second.key);
        assert_eq!(first.sha256, second.sha256);
        assert!(first
            .path
            .starts_with(dir.path().join("malformed_embedded_payload")));
        assert_eq!(first.path.extension().and_then(|e| e.to_str()), Some("txt"));
        assert_eq!(std::fs::read(&first.path).expect("read"), b"{\"brazil\":[");
    }
}
