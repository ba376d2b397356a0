//! # edgequake-pdf2tables
//!
//! Extract tables and charts from PDF pages using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Tables in scientific PDFs are where text extractors fail hardest: merged
//! headers, rotated pages, charts with no underlying data. This crate
//! rasterises each page, lets a cheap model decide what the page holds,
//! crops every table and chart with a layout engine, and asks a vision model
//! to read each crop into structured JSON. The result is one canonical,
//! rectangular JSON + HTML artifact per element, resumable page by page.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Render     rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 2. Checkpoint skip pages whose artifacts already exist
//!  ├─ 3. Classify   one cheap call: tables? charts? how many? rotated?
//!  ├─ 4. Segment    layout detection, reading order, crop + enhance
//!  ├─ 5. Extract    one VLM call per crop, whole-page fallback
//!  ├─ 6. Validate   advisory review flags (counts, sparse, repeated rows)
//!  └─ 7. Normalize  rectangular rows, matrix repair, quadratic metrics,
//!                   per-page artifacts + batch summary
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2tables::{extract_pdf, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract_pdf("paper.pdf", "out", &config).await?;
//!     for entry in output.entries() {
//!         println!("page {} {}: {} rows", entry.page, entry.name, entry.rows.len() - 1);
//!     }
//!     eprintln!("{} inference calls", output.stats.inference_calls);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2tables` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2tables = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing models
//!
//! Classification runs on every page and only needs a coarse answer, so it
//! can use a cheap model (`classifier_model`). Extraction reads dense
//! numbers and benefits from the strongest vision model you can afford
//! (`model`).

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod output;
pub mod payload;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;
pub mod summary;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, PageSelection, TextPagePolicy};
pub use error::{LayoutError, PageError, Pdf2TablesError, ServiceError};
pub use extract::{extract_images, extract_images_with, extract_pdf, extract_sync};
pub use model::{CanonicalEntry, Classification, ContentKind, EntryKind, ReviewFlag};
pub use output::{ExtractionOutput, ExtractionStats, PageReport, PageStatus, Strategy};
pub use pipeline::layout::{LayoutEngine, LayoutEngineFactory, LayoutEngineManager};
pub use pipeline::page::PageExtractor;
pub use pipeline::vision::{VisionRequest, VisionService};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{extract_stream, ReportStream};
