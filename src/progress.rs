//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the batch moves through its pages.
//!
//! # Why callbacks instead of channels?
//!
//! A callback is the least invasive integration point: the host can forward
//! events to a channel, a job table or a terminal progress bar without the
//! library knowing how it communicates. The trait is `Send + Sync` because
//! pages run concurrently.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2tables::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     entries: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, entry_count: usize) {
//!         self.entries.fetch_add(entry_count, Ordering::SeqCst);
//!         eprintln!("Page {}/{}: {} entries", page_num, total_pages, entry_count);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { entries: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch runner as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `on_page_*` may be called concurrently from
/// different tasks; protect shared state with `Mutex` or atomics.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once, after the page selection is resolved.
    fn on_extraction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a worker picks up a page.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page was extracted, resumed, or skipped.
    ///
    /// # Arguments
    /// * `entry_count`: canonical tables and charts the page produced
    fn on_page_complete(&self, page_num: usize, total_pages: usize, entry_count: usize) {
        let _ = (page_num, total_pages, entry_count);
    }

    /// Called when the classifier found nothing to extract on a page.
    fn on_page_skipped(&self, page_num: usize, total_pages: usize, reason: &str) {
        let _ = (page_num, total_pages, reason);
    }

    /// Called when a page was resumed from its checkpoint without any call.
    fn on_page_resumed(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page fails and is recorded as failed.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after every page has been attempted.
    ///
    /// # Arguments
    /// * `success_count`: pages extracted, resumed or skipped
    fn on_extraction_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        resumed: AtomicUsize,
        errors: AtomicUsize,
        entries: AtomicUsize,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, entry_count: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            self.entries.fetch_add(entry_count, Ordering::SeqCst);
        }

        fn on_page_resumed(&self, _page_num: usize, _total_pages: usize) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_extraction_start(5);
        cb.on_page_start(1, 5);
        cb.on_page_complete(1, 5, 2);
        cb.on_page_resumed(2, 5);
        cb.on_page_skipped(4, 5, "text_only");
        cb.on_page_error(3, 5, "some error");
        cb.on_extraction_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_start(1, 3);
        tracker.on_page_complete(1, 3, 2);
        tracker.on_page_start(2, 3);
        tracker.on_page_resumed(2, 3);
        tracker.on_page_complete(2, 3, 1);
        tracker.on_page_start(3, 3);
        tracker.on_page_error(3, 3, "timeout");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.resumed.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.entries.load(Ordering::SeqCst), 3);
    }
}
