//! Error types for the edgequake-pdf2tables library.
//!
//! Four error types reflect four distinct failure scopes:
//!
//! * [`Pdf2TablesError`]: **fatal**, the run cannot proceed at all (bad
//!   input file, wrong password, provider not configured). Returned as
//!   `Err(Pdf2TablesError)` from the top-level `extract*` functions.
//!
//! * [`PageError`]: **non-fatal**, a single page failed (transport error
//!   after retries, artifact write failure) while every other page carries
//!   on. Stored inside [`crate::output::PageReport`].
//!
//! * [`ServiceError`]: one vision-inference call failed at the transport
//!   level. The retry loop decides whether to try again.
//!
//! * [`LayoutError`]: the layout-detection engine failed. Always soft: the
//!   page falls back to whole-page extraction.
//!
//! Malformed or schema-violating responses are deliberately *not* errors;
//! they are ordinary values ([`crate::payload::ExtractionPayload::Invalid`]).

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2tables library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PageReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum Pdf2TablesError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The page selection matched no page of the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Every page failed; nothing was extracted or resumed.
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a batch-level output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
You can:\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n\
  • Place libpdfium next to the pdf2tables executable.\n\
  • Install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Stored on [`crate::output::PageReport`] when a page fails.
/// The batch continues with the remaining pages.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The inference service failed after the retry budget was spent.
    #[error("Page {page}: inference failed after {attempts} attempts: {detail}")]
    ServiceFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The inference service kept timing out.
    #[error("Page {page}: inference timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The provider rejected our credentials.
    #[error("Page {page}: authentication failed: {detail}")]
    AuthFailed { page: usize, detail: String },

    /// An artifact could not be written to the page directory.
    #[error("Page {page}: failed to write '{path}': {detail}")]
    ArtifactWrite {
        page: usize,
        path: PathBuf,
        detail: String,
    },

    /// Image decoding, cropping or encoding failed.
    #[error("Page {page}: image processing failed: {detail}")]
    Image { page: usize, detail: String },
}

impl PageError {
    /// Lift a transport error from the vision service into a page failure.
    pub fn from_service(page: usize, attempts: u32, err: ServiceError) -> Self {
        match err {
            ServiceError::Timeout { secs } => PageError::Timeout { page, secs },
            ServiceError::Auth(detail) => PageError::AuthFailed { page, detail },
            other => PageError::ServiceFailed {
                page,
                attempts,
                detail: other.to_string(),
            },
        }
    }

    /// Page number this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ServiceFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::AuthFailed { page, .. }
            | PageError::ArtifactWrite { page, .. }
            | PageError::Image { page, .. } => *page,
        }
    }
}

/// Transport-level failure of one vision-inference call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The call exceeded the configured ceiling.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// 401/403 from the provider; retrying will not help.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// 429 from the provider.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Connection reset, 5xx, DNS, TLS, …
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ServiceError {
    /// Rate limits and transport blips are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::RateLimited(_) | ServiceError::Transport(_))
    }

    /// Classify a provider error from its rendered message.
    ///
    /// Providers surface HTTP status codes and vendor wording in the error
    /// text only, so the match is on well-known substrings.
    pub fn classify(message: &str, timeout_secs: u64) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            ServiceError::Timeout { secs: timeout_secs }
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("authentication")
            || lower.contains("invalid api key")
            || lower.contains("incorrect api key")
        {
            ServiceError::Auth(message.to_string())
        } else if lower.contains("429") || lower.contains("rate limit") {
            ServiceError::RateLimited(message.to_string())
        } else {
            ServiceError::Transport(message.to_string())
        }
    }
}

/// Failure of the layout-detection engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// No engine is installed or configured.
    #[error("layout engine unavailable: {0}")]
    Unavailable(String),

    /// The on-disk model cache is damaged (truncated download, partial write).
    #[error("layout model cache is corrupted: {0}")]
    CorruptedCache(String),

    /// The engine could not be constructed.
    #[error("layout engine initialisation failed: {0}")]
    Initialization(String),

    /// Detection ran but failed for this image.
    #[error("layout detection failed: {0}")]
    Inference(String),
}

impl LayoutError {
    /// Marker printed by model loaders when a cached weight file is truncated.
    pub const CORRUPTION_MARKER: &'static str = "unexpected end of data";

    pub fn is_corrupted_cache(&self) -> bool {
        match self {
            LayoutError::CorruptedCache(_) => true,
            LayoutError::Initialization(detail) | LayoutError::Inference(detail) => {
                detail.to_lowercase().contains(Self::CORRUPTION_MARKER)
            }
            LayoutError::Unavailable(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_pages_failed_display() {
        let e = Pdf2TablesError::AllPagesFailed {
            total: 4,
            first_error: "Page 1: inference timed out after 180s".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("All 4 pages"), "got: {msg}");
        assert!(msg.contains("180s"));
    }

    #[test]
    fn classify_timeout() {
        let e = ServiceError::classify("request timed out while reading body", 180);
        assert_eq!(e, ServiceError::Timeout { secs: 180 });
        assert!(!e.is_transient());
    }

    #[test]
    fn classify_auth() {
        let e = ServiceError::classify("API error: 401 Unauthorized", 60);
        assert!(matches!(e, ServiceError::Auth(_)));
        assert!(!e.is_transient());
    }

    #[test]
    fn classify_rate_limit_and_transport() {
        assert!(matches!(
            ServiceError::classify("HTTP 429 Too Many Requests", 60),
            ServiceError::RateLimited(_)
        ));
        let t = ServiceError::classify("connection reset by peer", 60);
        assert!(matches!(t, ServiceError::Transport(_)));
        assert!(t.is_transient());
    }

    #[test]
    fn page_error_from_service_maps_variants() {
        let e = PageError::from_service(7, 3, ServiceError::Timeout { secs: 30 });
        assert!(matches!(e, PageError::Timeout { page: 7, secs: 30 }));
        assert_eq!(e.page(), 7);

        let e = PageError::from_service(2, 1, ServiceError::Auth("bad key".into()));
        assert!(e.to_string().contains("bad key"));

        let e = PageError::from_service(5, 3, ServiceError::Transport("502".into()));
        assert!(e.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn corrupted_cache_detection() {
        assert!(LayoutError::CorruptedCache("x".into()).is_corrupted_cache());
        assert!(LayoutError::Initialization(
            "failed to load weights: Unexpected end of data".into()
        )
        .is_corrupted_cache());
        assert!(!LayoutError::Unavailable("no engine".into()).is_corrupted_cache());
        assert!(!LayoutError::Inference("oom".into()).is_corrupted_cache());
    }
}
