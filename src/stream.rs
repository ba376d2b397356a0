//! Streaming extraction API: emit page reports as they complete.
//!
//! ## Why stream?
//!
//! Large documents take minutes. A stream lets callers react to each page
//! as soon as its artifacts are on disk: show progress, copy tables
//! elsewhere, or stop early, instead of waiting for the whole batch.
//!
//! Unlike the eager [`crate::extract::extract_pdf`], [`extract_stream`]
//! yields [`PageReport`] items in completion order (not page order). Sort
//! by `page_number` if order matters. The summary index is merged after
//! every page either way.

use crate::config::ExtractionConfig;
use crate::error::Pdf2TablesError;
use crate::extract::{page_pool, prepare_pdf};
use crate::output::PageReport;
use std::path::Path;
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of page reports.
pub type ReportStream = Pin<Box<dyn Stream<Item = PageReport> + Send>>;

/// Extract tables and charts from a PDF, streaming reports as pages finish.
///
/// Rendering happens before the stream is returned; inference runs as the
/// stream is polled, `config.concurrency` pages at a time.
///
/// # Returns
/// - `Ok(ReportStream)`: one [`PageReport`] per selected page. Failed pages
///   arrive as reports with `status == Failed`; the stream never stops early.
/// - `Err(Pdf2TablesError)`: fatal error before any page started.
pub async fn extract_stream(
    input: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ReportStream, Pdf2TablesError> {
    let prepared = prepare_pdf(input.as_ref(), output_dir.as_ref(), config).await?;
    info!("Streaming {} pages", prepared.tasks.len());
    let stream = page_pool(
        prepared.extractor,
        prepared.tasks,
        config.concurrency,
        config.progress_callback.clone(),
    );
    Ok(Box::pin(stream))
}
