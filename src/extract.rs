//! Eager (whole-batch) extraction entry points.
//!
//! ## Why eager vs. streaming?
//!
//! This module waits for every selected page, then returns one
//! [`ExtractionOutput`] with per-page reports sorted by page number and the
//! run's [`ExtractionStats`]. Use [`crate::stream::extract_stream`] instead
//! when you want reports as pages finish.
//!
//! Either way the artifacts on disk are the real output: each page writes
//! its own directory under the output root, and `summary.json` is merged
//! after every page.

use crate::artifacts::page_dir;
use crate::config::ExtractionConfig;
use crate::error::Pdf2TablesError;
use crate::model::PageTask;
use crate::output::{ExtractionOutput, ExtractionStats, PageReport, PageStatus};
use crate::pipeline::layout::LayoutEngineManager;
use crate::pipeline::page::PageExtractor;
use crate::pipeline::render;
use crate::pipeline::vision::{LlmVisionService, VisionService};
use crate::progress::ProgressCallback;
use crate::summary::SummaryIndex;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Extract every table and chart from a PDF into `output_dir`.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(ExtractionOutput)` as long as at least one page did not fail
/// (check `output.stats.failed_pages`).
///
/// # Errors
/// Returns `Err(Pdf2TablesError)` only for fatal errors:
/// - File not found / permission denied / not a PDF / wrong password
/// - Page selection matching no page
/// - No vision provider configured
/// - Every selected page failed
pub async fn extract_pdf(
    input: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TablesError> {
    let total_start = Instant::now();
    let prepared = prepare_pdf(input.as_ref(), output_dir.as_ref(), config).await?;
    let render_duration_ms = prepared.render_duration_ms;
    let total_pages = prepared.total_pages;
    let root = prepared.root.clone();

    let reports = run_batch(prepared.extractor, prepared.tasks, config).await;
    let mut output = finish(root, total_pages, reports)?;
    output.stats.render_duration_ms = render_duration_ms;
    output.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
    log_stats(&output.stats);
    Ok(output)
}

/// Extract from pages that are already rasterised.
///
/// `pages` holds `(page_number_1based, image)` pairs. Useful for scanned
/// images or when the caller renders pages itself.
pub async fn extract_images(
    pages: Vec<(usize, DynamicImage)>,
    output_dir: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TablesError> {
    let service: Arc<dyn VisionService> = Arc::new(LlmVisionService::from_config(config)?);
    let layout = Arc::new(LayoutEngineManager::from_config(config));
    extract_images_with(service, layout, pages, output_dir, config).await
}

/// [`extract_images`] with an explicit vision service and layout manager.
///
/// The seam for custom inference backends and for tests.
pub async fn extract_images_with(
    service: Arc<dyn VisionService>,
    layout: Arc<LayoutEngineManager>,
    pages: Vec<(usize, DynamicImage)>,
    output_dir: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TablesError> {
    let total_start = Instant::now();
    if pages.is_empty() {
        return Err(Pdf2TablesError::PageOutOfRange { page: 0, total: 0 });
    }
    let root = output_dir.as_ref().to_path_buf();
    let total_pages = pages.iter().map(|(p, _)| *p).max().unwrap_or(0);

    let extractor = build_extractor(service, layout, &root, config).await?;
    let tasks = pages
        .into_iter()
        .map(|(page, image)| PageTask::new(page, image, page_dir(&root, page)))
        .collect();

    let reports = run_batch(extractor, tasks, config).await;
    let mut output = finish(root, total_pages, reports)?;
    output.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
    log_stats(&output.stats);
    Ok(output)
}

/// Synchronous wrapper around [`extract_pdf`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TablesError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2TablesError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_pdf(input, output_dir, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Everything needed to start the page pool for a PDF.
pub(crate) struct PreparedRun {
    pub extractor: Arc<PageExtractor>,
    pub tasks: Vec<PageTask>,
    pub total_pages: usize,
    pub root: PathBuf,
    pub render_duration_ms: u64,
}

/// Validate the input, resolve the provider, rasterise the selection.
pub(crate) async fn prepare_pdf(
    input: &Path,
    output_dir: &Path,
    config: &ExtractionConfig,
) -> Result<PreparedRun, Pdf2TablesError> {
    info!("Starting extraction: {}", input.display());

    // ── Step 1: Validate input ───────────────────────────────────────────
    render::validate_pdf(input)?;

    // ── Step 2: Resolve the vision service ───────────────────────────────
    let service: Arc<dyn VisionService> = Arc::new(LlmVisionService::from_config(config)?);
    let layout = Arc::new(LayoutEngineManager::from_config(config));

    // ── Step 3: Select pages ─────────────────────────────────────────────
    let total_pages = render::page_count(input, config.password.as_deref()).await?;
    info!("PDF has {} pages", total_pages);
    let indices = config.pages.to_indices(total_pages);
    if indices.is_empty() {
        return Err(Pdf2TablesError::PageOutOfRange {
            page: 0,
            total: total_pages,
        });
    }
    debug!("Selected {} pages for extraction", indices.len());

    // ── Step 4: Rasterise ────────────────────────────────────────────────
    let render_start = Instant::now();
    let rendered = render::render_pages(input, config, &indices).await?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    info!("Rendered {} pages in {}ms", rendered.len(), render_duration_ms);

    // ── Step 5: Build tasks ──────────────────────────────────────────────
    let root = output_dir.to_path_buf();
    let extractor = build_extractor(service, layout, &root, config).await?;
    let tasks = rendered
        .into_iter()
        .map(|(idx, image)| PageTask::new(idx + 1, image, page_dir(&root, idx + 1)))
        .collect();

    Ok(PreparedRun {
        extractor,
        tasks,
        total_pages,
        root,
        render_duration_ms,
    })
}

async fn build_extractor(
    service: Arc<dyn VisionService>,
    layout: Arc<LayoutEngineManager>,
    root: &Path,
    config: &ExtractionConfig,
) -> Result<Arc<PageExtractor>, Pdf2TablesError> {
    let summary = Arc::new(SummaryIndex::open(root).await?);
    let extractor = PageExtractor::new(service, layout, Arc::new(config.clone())).with_summary(summary);
    Ok(Arc::new(extractor))
}

/// Process `tasks` on a bounded pool. Reports come back in completion order.
async fn run_batch(
    extractor: Arc<PageExtractor>,
    tasks: Vec<PageTask>,
    config: &ExtractionConfig,
) -> Vec<PageReport> {
    let total = tasks.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_start(total);
    }
    let reports: Vec<PageReport> =
        page_pool(extractor, tasks, config.concurrency, config.progress_callback.clone())
            .collect()
            .await;
    if let Some(ref cb) = config.progress_callback {
        cb.on_extraction_complete(total, reports.iter().filter(|r| r.is_ok()).count());
    }
    reports
}

/// The worker pool shared by the eager and streaming entry points.
pub(crate) fn page_pool(
    extractor: Arc<PageExtractor>,
    tasks: Vec<PageTask>,
    concurrency: usize,
    callback: Option<ProgressCallback>,
) -> impl futures::Stream<Item = PageReport> + Send {
    let total = tasks.len();
    stream::iter(tasks.into_iter().map(move |task| {
        let extractor = Arc::clone(&extractor);
        let callback = callback.clone();
        async move {
            let page = task.page_number;
            if let Some(ref cb) = callback {
                cb.on_page_start(page, total);
            }
            let report = extractor.process(task).await;
            if let Some(ref cb) = callback {
                notify(cb, &report, total);
            }
            report
        }
    }))
    .buffer_unordered(concurrency.max(1))
}

fn notify(cb: &ProgressCallback, report: &PageReport, total: usize) {
    let page = report.page_number;
    match report.status {
        PageStatus::Extracted => cb.on_page_complete(page, total, report.entries.len()),
        PageStatus::Resumed => cb.on_page_resumed(page, total),
        PageStatus::Skipped => cb.on_page_skipped(page, total, "no tables or charts"),
        PageStatus::Aborted => cb.on_page_skipped(page, total, "no entries extracted"),
        PageStatus::Failed => {
            let detail = report
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            cb.on_page_error(page, total, &detail)
        }
    }
}

fn finish(
    root: PathBuf,
    total_pages: usize,
    mut reports: Vec<PageReport>,
) -> Result<ExtractionOutput, Pdf2TablesError> {
    reports.sort_by_key(|r| r.page_number);

    if !reports.is_empty() && reports.iter().all(|r| !r.is_ok()) {
        let first_error = reports
            .iter()
            .find_map(|r| r.error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        return Err(Pdf2TablesError::AllPagesFailed {
            total: reports.len(),
            first_error,
        });
    }

    let stats = ExtractionStats::from_reports(total_pages, &reports);
    Ok(ExtractionOutput {
        output_directory: root,
        pages: reports,
        stats,
    })
}

fn log_stats(stats: &ExtractionStats) {
    info!(
        "Extraction complete: {} extracted, {} resumed, {} skipped, {} aborted, {} failed; \
         {} tables, {} charts, {} review flags, {} inference calls, {}ms",
        stats.extracted_pages,
        stats.resumed_pages,
        stats.skipped_pages,
        stats.aborted_pages,
        stats.failed_pages,
        stats.tables,
        stats.charts,
        stats.review_flags,
        stats.inference_calls,
        stats.total_duration_ms
    );
}
