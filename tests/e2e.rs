//! End-to-end tests for edgequake-pdf2tables.
//!
//! These tests use real PDF files in `./test_cases/`, bind pdfium and make
//! live LLM API calls. They are gated behind the `E2E_ENABLED` environment
//! variable so they do not run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=/path/to/libpdfium cargo test --test e2e -- --nocapture
//!
//! Input validation tests at the bottom need neither pdfium nor a provider
//! and always run.

use edgequake_pdf2tables::{
    extract_pdf, EntryKind, ExtractionConfig, PageSelection, PageStatus, Pdf2TablesError,
};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

// ── Live extraction (needs pdfium + LLM API) ─────────────────────────────────

/// First table page of a field-trial report: at least one rectangular table,
/// and a second run that resumes without a single inference call.
#[tokio::test]
async fn test_extract_then_resume() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("field_trials.pdf"));
    let out = tempfile::tempdir().unwrap();

    let config = ExtractionConfig::builder()
        .pages(PageSelection::Single(1))
        .build()
        .expect("valid config");

    let first = extract_pdf(&path, out.path(), &config)
        .await
        .expect("extraction should succeed");
    assert_eq!(first.stats.failed_pages, 0);
    assert!(first.stats.inference_calls >= 1);

    for entry in first.entries() {
        assert!(entry.is_rectangular(), "{} is ragged", entry.name);
        if entry.kind == EntryKind::Table {
            assert!(entry.rows.len() >= 2, "{} has no data rows", entry.name);
        }
        println!("{} {:?}: {} rows", entry.name, entry.title, entry.rows.len() - 1);
    }
    assert!(out.path().join("summary.json").exists());
    assert!(out.path().join("page-001/page-full.png").exists());

    if first.stats.extracted_pages == 1 {
        let second = extract_pdf(&path, out.path(), &config)
            .await
            .expect("resume should succeed");
        assert_eq!(second.pages[0].status, PageStatus::Resumed);
        assert_eq!(second.stats.inference_calls, 0);
        assert_eq!(second.pages[0].entries, first.pages[0].entries);
    }
}

/// Whole-page extraction only, on every page of a short document.
#[tokio::test]
async fn test_extract_without_segmentation() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("field_trials.pdf"));
    let out = tempfile::tempdir().unwrap();

    let config = ExtractionConfig::builder()
        .pages(PageSelection::Range(1, 3))
        .segmentation(false)
        .concurrency(3)
        .build()
        .expect("valid config");

    let result = extract_pdf(&path, out.path(), &config)
        .await
        .expect("extraction should succeed");
    assert_eq!(result.stats.selected_pages, result.pages.len());
    for page in &result.pages {
        println!("page {}: {:?} via {:?}", page.page_number, page.status, page.strategy);
    }
}

// ── Input validation (no pdfium, no LLM) ─────────────────────────────────────

#[tokio::test]
async fn test_missing_file_is_fatal() {
    let out = tempfile::tempdir().unwrap();
    let err = extract_pdf("/definitely/not/a/real/file.pdf", out.path(), &ExtractionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Pdf2TablesError::FileNotFound { .. }));
}

#[tokio::test]
async fn test_non_pdf_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fake = dir.path().join("notes.pdf");
    std::fs::write(&fake, b"hello, not a pdf").unwrap();
    let err = extract_pdf(&fake, dir.path().join("out"), &ExtractionConfig::default())
        .await
        .unwrap_err();
    match err {
        Pdf2TablesError::NotAPdf { magic, .. } => assert_eq!(&magic, b"hell"),
        other => panic!("expected NotAPdf, got {other}"),
    }
}
