//! Batch-level summary index.
//!
//! `summary.json` lists every entry of every page and is rewritten after
//! each page completes. Pages finish in any order, so the merge is a
//! read-modify-write under a lock: the page's previous records are replaced
//! and everything is re-sorted by (page, kind, index) before writing.
//! Other pages' records are never touched, which keeps re-running a single
//! page safe.

use crate::artifacts::{atomic_write, escape_html, page_dir_name, PAGE_TEXT_HTML, PAGE_TEXT_JSON};
use crate::error::{PageError, Pdf2TablesError};
use crate::model::{CanonicalEntry, EntryKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_HTML: &str = "summary.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Table,
    Chart,
    Text,
}

impl From<EntryKind> for SummaryKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Table => SummaryKind::Table,
            EntryKind::Chart => SummaryKind::Chart,
        }
    }
}

/// One line of the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub page: usize,
    pub name: String,
    pub kind: SummaryKind,
    pub title: Option<String>,
    pub rows: usize,
    pub columns: usize,
    /// Paths relative to the output root.
    pub json: String,
    pub html: String,
}

impl SummaryRecord {
    pub fn from_entry(entry: &CanonicalEntry) -> Self {
        let dir = page_dir_name(entry.page);
        Self {
            page: entry.page,
            name: entry.name.clone(),
            kind: entry.kind.into(),
            title: entry.title.clone(),
            rows: entry.rows.len().saturating_sub(1),
            columns: entry.header().len(),
            json: format!("{dir}/{}.json", entry.name),
            html: format!("{dir}/{}.html", entry.name),
        }
    }

    /// Record for a fully transcribed text page.
    pub fn text_page(page: usize, title: Option<String>, sections: usize) -> Self {
        let dir = page_dir_name(page);
        Self {
            page,
            name: "page-text".into(),
            kind: SummaryKind::Text,
            title,
            rows: sections,
            columns: 0,
            json: format!("{dir}/{PAGE_TEXT_JSON}"),
            html: format!("{dir}/{PAGE_TEXT_HTML}"),
        }
    }

    fn index(&self) -> usize {
        self.name
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// The shared, lock-protected summary.
#[derive(Debug)]
pub struct SummaryIndex {
    root: PathBuf,
    records: Mutex<Vec<SummaryRecord>>,
}

impl SummaryIndex {
    /// Open the index under `root`, keeping records from earlier runs.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Pdf2TablesError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Pdf2TablesError::OutputWriteFailed {
                path: root.clone(),
                source: e,
            })?;
        let records = match tokio::fs::read(root.join(SUMMARY_JSON)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Existing {} is unreadable ({}); starting fresh", SUMMARY_JSON, e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            root,
            records: Mutex::new(records),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace `page`'s records with `records` and rewrite both files.
    pub async fn merge_page(&self, page: usize, records: Vec<SummaryRecord>) -> Result<(), PageError> {
        let mut all = self.records.lock().await;
        all.retain(|r| r.page != page);
        all.extend(records);
        all.sort_by(|a, b| (a.page, a.kind, a.index()).cmp(&(b.page, b.kind, b.index())));

        let json = serde_json::to_vec_pretty(&*all).map_err(|e| PageError::ArtifactWrite {
            page,
            path: self.root.join(SUMMARY_JSON),
            detail: e.to_string(),
        })?;
        for (name, bytes) in [
            (SUMMARY_JSON, json),
            (SUMMARY_HTML, summary_html(&all).into_bytes()),
        ] {
            let path = self.root.join(name);
            atomic_write(&path, &bytes)
                .await
                .map_err(|e| PageError::ArtifactWrite {
                    page,
                    path,
                    detail: e.to_string(),
                })?;
        }
        debug!("Summary now holds {} records", all.len());
        Ok(())
    }

    pub async fn records(&self) -> Vec<SummaryRecord> {
        self.records.lock().await.clone()
    }
}

fn summary_html(records: &[SummaryRecord]) -> String {
    let mut rows = String::new();
    for r in records {
        let kind = match r.kind {
            SummaryKind::Table => "table",
            SummaryKind::Chart => "chart",
            SummaryKind::Text => "text",
        };
        let shape = match r.kind {
            SummaryKind::Text => format!("{} sections", r.rows),
            _ => format!("{} × {}", r.rows, r.columns),
        };
        rows.push_str(&format!(
            "<tr><td>{}</td><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            r.page,
            escape_html(&r.html),
            escape_html(&r.name),
            kind,
            escape_html(r.title.as_deref().unwrap_or("")),
            shape
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Extraction summary</title>\n\
         <style>body{{font-family:sans-serif;margin:2em}}table{{border-collapse:collapse}}\
         th,td{{border:1px solid #999;padding:4px 8px}}th{{background:#eef2f5}}</style>\n</head>\n<body>\n\
         <h1>Extraction summary</h1>\n<p>{} entries</p>\n<table>\n\
         <thead><tr><th>Page</th><th>Entry</th><th>Kind</th><th>Title</th><th>Size</th></tr></thead>\n\
         <tbody>\n{}</tbody>\n</table>\n</body>\n</html>\n",
        records.len(),
        rows
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provenance;

    fn entry(page: usize, name: &str, kind: EntryKind) -> CanonicalEntry {
        CanonicalEntry {
            name: name.into(),
            page,
            kind,
            title: None,
            notes: None,
            rows: vec![vec!["h".into()], vec!["v".into()]],
            chart: None,
            provenance: Provenance::whole_page(),
        }
    }

    fn names(records: &[SummaryRecord]) -> Vec<String> {
        records.iter().map(|r| format!("{}:{}", r.page, r.name)).collect()
    }

    #[tokio::test]
    async fn merge_sorts_and_replaces_only_one_page() {
        let dir = tempfile::tempdir().unwrap();
        let index = SummaryIndex::open(dir.path()).await.unwrap();

        index
            .merge_page(
                3,
                vec![
                    SummaryRecord::from_entry(&entry(3, "chart-01", EntryKind::Chart)),
                    SummaryRecord::from_entry(&entry(3, "table-01", EntryKind::Table)),
                ],
            )
            .await
            .unwrap();
        index
            .merge_page(1, vec![SummaryRecord::from_entry(&entry(1, "table-01", EntryKind::Table))])
            .await
            .unwrap();
        assert_eq!(
            names(&index.records().await),
            vec!["1:table-01", "3:table-01", "3:chart-01"]
        );

        index
            .merge_page(3, vec![SummaryRecord::from_entry(&entry(3, "table-02", EntryKind::Table))])
            .await
            .unwrap();
        assert_eq!(names(&index.records().await), vec!["1:table-01", "3:table-02"]);

        let reopened = SummaryIndex::open(dir.path()).await.unwrap();
        assert_eq!(reopened.records().await.len(), 2);
        assert!(dir.path().join(SUMMARY_HTML).exists());
    }

    #[test]
    fn record_paths_are_relative() {
        let r = SummaryRecord::from_entry(&entry(12, "table-03", EntryKind::Table));
        assert_eq!(r.json, "page-012/table-03.json");
        assert_eq!(r.rows, 1);
        assert_eq!(r.columns, 1);
    }
}
