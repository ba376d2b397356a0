//! Resume support.
//!
//! There is no journal. A page counts as done when its directory holds at
//! least one canonical entry artifact of non-trivial size: the artifacts are
//! the source of truth, so the checkpoint can never drift from them.

use crate::artifacts::{is_entry_artifact, load_entries};
use crate::config::ExtractionConfig;
use crate::model::CanonicalEntry;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStore {
    /// Smallest artifact size that counts as real output.
    pub min_bytes: u64,
    /// Ignore existing artifacts and reprocess every page.
    pub force: bool,
}

impl CheckpointStore {
    pub fn new(min_bytes: u64, force: bool) -> Self {
        Self { min_bytes, force }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(config.min_artifact_bytes, config.force_reprocess)
    }

    pub async fn is_done(&self, page_dir: &Path) -> bool {
        if self.force {
            return false;
        }
        let Ok(mut dir) = tokio::fs::read_dir(page_dir).await else {
            return false;
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name();
            if !is_entry_artifact(&name.to_string_lossy()) {
                continue;
            }
            if let Ok(meta) = item.metadata().await {
                if meta.is_file() && meta.len() >= self.min_bytes.max(1) {
                    debug!("Checkpoint hit: {}", item.path().display());
                    return true;
                }
            }
        }
        false
    }

    /// Entries saved by the run that completed this page.
    pub async fn load(&self, page_dir: &Path) -> Vec<CanonicalEntry> {
        load_entries(page_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_directory_is_not_done() {
        let store = CheckpointStore::new(16, false);
        assert!(!store.is_done(Path::new("/nonexistent/page-001")).await);
    }

    #[tokio::test]
    async fn trivial_or_unrelated_files_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("table-01.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("page-full.json"), vec![b'x'; 4096]).unwrap();
        std::fs::write(dir.path().join("segment-01.json"), vec![b'x'; 4096]).unwrap();
        let store = CheckpointStore::new(16, false);
        assert!(!store.is_done(dir.path()).await);
    }

    #[tokio::test]
    async fn real_artifact_counts_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chart-01.html"), vec![b'x'; 64]).unwrap();
        assert!(CheckpointStore::new(16, false).is_done(dir.path()).await);
        assert!(!CheckpointStore::new(16, true).is_done(dir.path()).await);
    }
}
