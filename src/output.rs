//! Result types returned by the extraction entry points.

use crate::error::PageError;
use crate::model::{CanonicalEntry, Classification, ReviewFlag};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Terminal state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Entries were extracted in this run.
    Extracted,
    /// A previous run already completed the page; its entries were reloaded.
    Resumed,
    /// The classifier found nothing to extract.
    Skipped,
    /// Extraction produced no entries (fallback disabled or unproductive).
    Aborted,
    /// A hard error ended the page.
    Failed,
}

/// How the entries were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Segmented,
    #[serde(rename = "fullpage")]
    WholePage,
    None,
}

/// States visited by the page state machine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    CheckCheckpoint,
    Classify,
    Skip,
    Segment,
    SegmentedExtract,
    Fallback,
    WholePageExtract,
    Validate,
    Normalize,
    Done,
}

/// Everything known about one processed page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    /// 1-indexed page number.
    pub page_number: usize,
    pub status: PageStatus,
    pub strategy: Strategy,
    pub output_directory: PathBuf,
    pub classification: Option<Classification>,
    pub entries: Vec<CanonicalEntry>,
    pub review_flags: Vec<ReviewFlag>,
    /// Requests sent to the vision service for this page.
    pub inference_calls: u32,
    pub trace: Vec<PageState>,
    pub duration_ms: u64,
    pub error: Option<PageError>,
}

impl PageReport {
    pub fn new(page_number: usize, output_directory: PathBuf) -> Self {
        Self {
            page_number,
            status: PageStatus::Aborted,
            strategy: Strategy::None,
            output_directory,
            classification: None,
            entries: Vec::new(),
            review_flags: Vec::new(),
            inference_calls: 0,
            trace: Vec::new(),
            duration_ms: 0,
            error: None,
        }
    }

    /// `true` unless the page ended in a hard error.
    pub fn is_ok(&self) -> bool {
        self.status != PageStatus::Failed
    }
}

/// Aggregate numbers for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages selected for this run.
    pub selected_pages: usize,
    pub extracted_pages: usize,
    pub resumed_pages: usize,
    pub skipped_pages: usize,
    pub aborted_pages: usize,
    pub failed_pages: usize,
    pub tables: usize,
    pub charts: usize,
    pub review_flags: usize,
    pub inference_calls: u64,
    pub render_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ExtractionStats {
    /// Tally `reports`; durations are filled in by the caller.
    pub fn from_reports(total_pages: usize, reports: &[PageReport]) -> Self {
        let count = |s: PageStatus| reports.iter().filter(|r| r.status == s).count();
        let entries = reports.iter().flat_map(|r| r.entries.iter());
        let tables = entries
            .clone()
            .filter(|e| e.kind == crate::model::EntryKind::Table)
            .count();
        Self {
            total_pages,
            selected_pages: reports.len(),
            extracted_pages: count(PageStatus::Extracted),
            resumed_pages: count(PageStatus::Resumed),
            skipped_pages: count(PageStatus::Skipped),
            aborted_pages: count(PageStatus::Aborted),
            failed_pages: count(PageStatus::Failed),
            tables,
            charts: entries.count() - tables,
            review_flags: reports.iter().map(|r| r.review_flags.len()).sum(),
            inference_calls: reports.iter().map(|r| r.inference_calls as u64).sum(),
            render_duration_ms: 0,
            total_duration_ms: 0,
        }
    }
}

/// Result of a whole run, pages sorted by number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub output_directory: PathBuf,
    pub pages: Vec<PageReport>,
    pub stats: ExtractionStats,
}

impl ExtractionOutput {
    /// All entries in (page, kind, index) order.
    pub fn entries(&self) -> impl Iterator<Item = &CanonicalEntry> {
        self.pages.iter().flat_map(|p| p.entries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, Provenance};

    fn report(page: usize, status: PageStatus, kinds: &[EntryKind]) -> PageReport {
        let mut r = PageReport::new(page, PathBuf::from(format!("out/page-{page:03}")));
        r.status = status;
        r.inference_calls = 2;
        r.entries = kinds
            .iter()
            .enumerate()
            .map(|(i, k)| CanonicalEntry {
                name: format!("{}-{:02}", k.prefix(), i + 1),
                page,
                kind: *k,
                title: None,
                notes: None,
                rows: vec![vec!["h".into()], vec!["v".into()]],
                chart: None,
                provenance: Provenance::whole_page(),
            })
            .collect();
        r
    }

    #[test]
    fn stats_tally_statuses_and_kinds() {
        let reports = vec![
            report(1, PageStatus::Extracted, &[EntryKind::Table, EntryKind::Chart]),
            report(2, PageStatus::Resumed, &[EntryKind::Table]),
            report(3, PageStatus::Skipped, &[]),
            report(4, PageStatus::Failed, &[]),
        ];
        let stats = ExtractionStats::from_reports(10, &reports);
        assert_eq!(stats.selected_pages, 4);
        assert_eq!(stats.extracted_pages, 1);
        assert_eq!(stats.resumed_pages, 1);
        assert_eq!(stats.failed_pages, 1);
        assert_eq!(stats.tables, 2);
        assert_eq!(stats.charts, 1);
        assert_eq!(stats.inference_calls, 8);
        assert!(!reports[3].is_ok());
    }

    #[test]
    fn strategy_serialises_like_the_page_payload() {
        assert_eq!(serde_json::to_string(&Strategy::WholePage).unwrap(), "\"fullpage\"");
        assert_eq!(serde_json::to_string(&Strategy::Segmented).unwrap(), "\"segmented\"");
    }
}
