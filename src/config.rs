//! Configuration types for table and chart extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share configs across workers, log them, and diff two runs to
//! understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! The config has grown past thirty fields. The builder lets callers set only
//! what they care about, clamps values into their valid range, and validates
//! cross-field constraints once in [`ExtractionConfigBuilder::build`].

use crate::error::Pdf2TablesError;
use crate::pipeline::enhance::EnhanceOptions;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2tables::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .concurrency(4)
///     .model("gpt-4.1")
///     .classifier_model("gpt-4.1-nano")
///     .max_segments(6)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    // ── Rendering ────────────────────────────────────────────────────────
    /// Rendering DPI used when rasterising each PDF page. Range: 72–600. Default: 300.
    ///
    /// Tables carry small digits and superscripts; 300 DPI keeps them legible
    /// after cropping. The crop is rescaled again before extraction, so the
    /// page itself only needs enough pixels for the layout engine.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    // ── Scheduling ───────────────────────────────────────────────────────
    /// Pages processed in parallel. Default: 3.
    ///
    /// Each page may issue several inference calls (classifier, one per
    /// segment, fallback), so the effective request rate is a multiple of
    /// this number.
    pub concurrency: usize,

    /// Reprocess pages even when canonical artifacts already exist. Default: false.
    pub force_reprocess: bool,

    /// Canonical artifacts smaller than this do not count as a checkpoint. Default: 16.
    pub min_artifact_bytes: u64,

    // ── Providers ────────────────────────────────────────────────────────
    /// Extraction model identifier, e.g. "gpt-4.1".
    pub model: Option<String>,

    /// Extraction provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed extraction provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Cheap model used for classification. Default: same as `model`.
    pub classifier_model: Option<String>,

    /// Provider for the classifier. Default: the extraction provider's name.
    pub classifier_provider_name: Option<String>,

    /// Pre-constructed classifier provider.
    pub classifier_provider: Option<Arc<dyn LLMProvider>>,

    // ── Pipeline switches ────────────────────────────────────────────────
    /// Ask the cheap model what the page contains before extracting. Default: true.
    pub classify: bool,

    /// Crop elements with the layout engine before extraction. Default: true.
    pub segmentation: bool,

    /// Pages (1-indexed) for which segmentation is never attempted.
    pub skip_segmentation_pages: BTreeSet<usize>,

    /// Fall back to one whole-page call when segmentation yields nothing. Default: true.
    pub fallback_to_full_page: bool,

    /// What to do with pages classified `text_only` or `none`. Default: skip.
    pub text_pages: TextPagePolicy,

    /// Append optimum/90 % columns to coefficient tables (`a`, `b`, `c`). Default: true.
    pub quadratic_metrics: bool,

    /// Expected element count above which counts are reconciled. Default: 2.
    pub review_threshold: usize,

    /// Language of labels the service should emit, e.g. "en", "pt-BR". Default: "en".
    pub locale: String,

    /// Custom system framing. If None, uses the built-in framing.
    pub system_prompt: Option<String>,

    // ── Segmentation ─────────────────────────────────────────────────────
    /// Layout engine language. Supported: "en", "ch". Default: "en".
    pub layout_lang: String,

    /// External layout detector executable (see [`crate::pipeline::layout::CommandLayoutEngine`]).
    pub layout_command: Option<PathBuf>,

    /// Model cache directory of the layout detector.
    pub layout_model_dir: Option<PathBuf>,

    /// Pixels added around each detected box. Default: 16.
    pub segment_padding: u32,

    /// Keep at most this many segments per page. Default: unlimited.
    pub max_segments: Option<usize>,

    /// Vertical tolerance in pixels when grouping boxes into reading rows. Default: 50.
    pub row_bucket_px: u32,

    /// Crop enhancement parameters.
    pub enhance: EnhanceOptions,

    /// Per-call ceiling on layout detection, in seconds. Default: 120.
    pub layout_timeout_secs: u64,

    // ── Inference ────────────────────────────────────────────────────────
    /// Retries after the first attempt for malformed responses and
    /// transient errors. Default: 2 (three attempts).
    pub max_retries: u32,

    /// Initial backoff after a transient error, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Delay before the single extra attempt after a timeout. Default: 5000.
    pub timeout_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 180.
    ///
    /// Large table crops routinely take a minute or more to answer. Calls
    /// beyond this ceiling are treated as failures.
    pub api_timeout_secs: u64,

    /// Sampling temperature on the first attempt. Default: 0.2.
    pub temperature: f32,

    /// Sampling temperature on later attempts. Default: 0.3.
    pub retry_temperature: f32,

    /// Force one temperature on every attempt (models that reject others).
    pub fixed_temperature: Option<f32>,

    /// Maximum tokens the service may generate per call. Default: 16384.
    pub max_tokens: usize,

    /// Receives per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 4000,
            password: None,
            pages: PageSelection::default(),
            concurrency: 3,
            force_reprocess: false,
            min_artifact_bytes: 16,
            model: None,
            provider_name: None,
            provider: None,
            classifier_model: None,
            classifier_provider_name: None,
            classifier_provider: None,
            classify: true,
            segmentation: true,
            skip_segmentation_pages: BTreeSet::new(),
            fallback_to_full_page: true,
            text_pages: TextPagePolicy::default(),
            quadratic_metrics: true,
            review_threshold: 2,
            locale: "en".to_string(),
            system_prompt: None,
            layout_lang: "en".to_string(),
            layout_command: None,
            layout_model_dir: None,
            segment_padding: 16,
            max_segments: None,
            row_bucket_px: 50,
            enhance: EnhanceOptions::default(),
            layout_timeout_secs: 120,
            max_retries: 2,
            retry_backoff_ms: 500,
            timeout_backoff_ms: 5000,
            api_timeout_secs: 180,
            temperature: 0.2,
            retry_temperature: 0.3,
            fixed_temperature: None,
            max_tokens: 16384,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("pages", &self.pages)
            .field("concurrency", &self.concurrency)
            .field("force_reprocess", &self.force_reprocess)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("classifier_model", &self.classifier_model)
            .field(
                "classifier_provider",
                &self.classifier_provider.as_ref().map(|_| "<dyn LLMProvider>"),
            )
            .field("classify", &self.classify)
            .field("segmentation", &self.segmentation)
            .field("fallback_to_full_page", &self.fallback_to_full_page)
            .field("text_pages", &self.text_pages)
            .field("layout_lang", &self.layout_lang)
            .field("layout_command", &self.layout_command)
            .field("max_segments", &self.max_segments)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("review_threshold", &self.review_threshold)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Whether segmentation should be tried for `page`.
    pub fn segmentation_enabled_for(&self, page: usize) -> bool {
        self.segmentation && !self.skip_segmentation_pages.contains(&page)
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(256);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn force_reprocess(mut self, v: bool) -> Self {
        self.config.force_reprocess = v;
        self
    }

    pub fn min_artifact_bytes(mut self, n: u64) -> Self {
        self.config.min_artifact_bytes = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn classifier_model(mut self, model: impl Into<String>) -> Self {
        self.config.classifier_model = Some(model.into());
        self
    }

    pub fn classifier_provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.classifier_provider_name = Some(name.into());
        self
    }

    pub fn classifier_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.classifier_provider = Some(provider);
        self
    }

    pub fn classify(mut self, v: bool) -> Self {
        self.config.classify = v;
        self
    }

    pub fn segmentation(mut self, v: bool) -> Self {
        self.config.segmentation = v;
        self
    }

    pub fn skip_segmentation_pages(mut self, pages: impl IntoIterator<Item = usize>) -> Self {
        self.config.skip_segmentation_pages = pages.into_iter().collect();
        self
    }

    pub fn fallback_to_full_page(mut self, v: bool) -> Self {
        self.config.fallback_to_full_page = v;
        self
    }

    pub fn text_pages(mut self, policy: TextPagePolicy) -> Self {
        self.config.text_pages = policy;
        self
    }

    pub fn quadratic_metrics(mut self, v: bool) -> Self {
        self.config.quadratic_metrics = v;
        self
    }

    pub fn review_threshold(mut self, n: usize) -> Self {
        self.config.review_threshold = n;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.config.locale = locale.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn layout_lang(mut self, lang: impl Into<String>) -> Self {
        self.config.layout_lang = lang.into();
        self
    }

    pub fn layout_command(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.layout_command = Some(program.into());
        self
    }

    pub fn layout_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.layout_model_dir = Some(dir.into());
        self
    }

    pub fn segment_padding(mut self, px: u32) -> Self {
        self.config.segment_padding = px.min(256);
        self
    }

    pub fn max_segments(mut self, n: usize) -> Self {
        self.config.max_segments = Some(n.max(1));
        self
    }

    pub fn row_bucket_px(mut self, px: u32) -> Self {
        self.config.row_bucket_px = px.max(1);
        self
    }

    pub fn enhance(mut self, options: EnhanceOptions) -> Self {
        self.config.enhance = options;
        self
    }

    pub fn layout_timeout_secs(mut self, secs: u64) -> Self {
        self.config.layout_timeout_secs = secs.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn timeout_backoff_ms(mut self, ms: u64) -> Self {
        self.config.timeout_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn retry_temperature(mut self, t: f32) -> Self {
        self.config.retry_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn fixed_temperature(mut self, t: f32) -> Self {
        self.config.fixed_temperature = Some(t.clamp(0.0, 2.0));
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n.max(256);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, Pdf2TablesError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Pdf2TablesError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(Pdf2TablesError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.locale.trim().is_empty() {
            return Err(Pdf2TablesError::InvalidConfig("Locale must not be empty".into()));
        }
        let e = &c.enhance;
        if e.target_long_side > e.max_long_side {
            return Err(Pdf2TablesError::InvalidConfig(format!(
                "Enhancement target long side {} exceeds maximum {}",
                e.target_long_side, e.max_long_side
            )));
        }
        if let (Some(name), None) = (&c.classifier_provider_name, &c.classifier_model) {
            if c.model.is_none() {
                return Err(Pdf2TablesError::InvalidConfig(format!(
                    "Classifier provider '{name}' needs a classifier model"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Treatment of pages the classifier reports as `text_only` or `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextPagePolicy {
    /// No further call. (default)
    #[default]
    Skip,
    /// One lightweight call collecting notes and legends.
    HarvestNotes,
    /// Transcribe the running text into structured sections.
    FullText,
}

/// Specifies which pages of the PDF to process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Process all pages (default).
    #[default]
    All,
    /// Process a single page (1-indexed).
    Single(usize),
    /// Process a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Process specific pages (1-indexed, in the given order).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Parse `all`, `5`, `3-15`, or a comma list mixing both (`1,3,10-15`).
    ///
    /// Reversed ranges are swapped; page 0 is rejected.
    pub fn parse(spec: &str) -> Result<Self, Pdf2TablesError> {
        let spec = spec.trim().to_lowercase();
        if spec.is_empty() || spec == "all" {
            return Ok(PageSelection::All);
        }

        let parse_page = |s: &str| -> Result<usize, Pdf2TablesError> {
            let n: usize = s.trim().parse().map_err(|_| {
                Pdf2TablesError::InvalidConfig(format!("Invalid page number: '{}'", s.trim()))
            })?;
            if n == 0 {
                return Err(Pdf2TablesError::InvalidConfig(
                    "Pages are 1-indexed, minimum is 1 (got 0)".into(),
                ));
            }
            Ok(n)
        };

        let mut pages = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((a, b)) => {
                    let (a, b) = (parse_page(a)?, parse_page(b)?);
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    pages.extend(lo..=hi);
                }
                None => pages.push(parse_page(part)?),
            }
        }

        Ok(match pages.as_slice() {
            [] => PageSelection::All,
            [single] => PageSelection::Single(*single),
            _ if !spec.contains(',') => {
                let lo = pages.iter().copied().min().unwrap_or(1);
                let hi = pages.iter().copied().max().unwrap_or(lo);
                PageSelection::Range(lo, hi)
            }
            _ => PageSelection::Set(pages),
        })
    }

    /// Expand into 0-indexed page numbers, dropping out-of-range pages and
    /// duplicates while keeping first-seen order.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let candidates: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => vec![*p],
            PageSelection::Range(start, end) => ((*start).max(1)..=(*end).min(total_pages)).collect(),
            PageSelection::Set(pages) => pages.clone(),
        };
        let mut seen = BTreeSet::new();
        candidates
            .into_iter()
            .filter(|&p| p >= 1 && p <= total_pages)
            .filter(|&p| seen.insert(p))
            .map(|p| p - 1)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.concurrency, 3);
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.api_timeout_secs, 180);
        assert_eq!(c.segment_padding, 16);
        assert_eq!(c.review_threshold, 2);
        assert!(c.fallback_to_full_page);
        assert_eq!(c.text_pages, TextPagePolicy::Skip);
    }

    #[test]
    fn builder_clamps() {
        let c = ExtractionConfig::builder()
            .dpi(5000)
            .concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 600);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn builder_rejects_blank_locale() {
        let err = ExtractionConfig::builder().locale("  ").build().unwrap_err();
        assert!(err.to_string().contains("Locale"));
    }

    #[test]
    fn segmentation_skip_list() {
        let c = ExtractionConfig::builder()
            .skip_segmentation_pages([4, 9])
            .build()
            .unwrap();
        assert!(c.segmentation_enabled_for(3));
        assert!(!c.segmentation_enabled_for(9));
    }

    #[test]
    fn parse_page_specs() {
        assert_eq!(PageSelection::parse("all").unwrap(), PageSelection::All);
        assert_eq!(PageSelection::parse("5").unwrap(), PageSelection::Single(5));
        assert_eq!(PageSelection::parse("3-6").unwrap(), PageSelection::Range(3, 6));
        assert_eq!(PageSelection::parse("6-3").unwrap(), PageSelection::Range(3, 6));
        assert_eq!(
            PageSelection::parse("1,3,10-12").unwrap(),
            PageSelection::Set(vec![1, 3, 10, 11, 12])
        );
        assert!(PageSelection::parse("0").is_err());
        assert!(PageSelection::parse("x-2").is_err());
    }

    #[test]
    fn indices_dedup_and_clamp() {
        let sel = PageSelection::Set(vec![3, 1, 3, 40]);
        assert_eq!(sel.to_indices(10), vec![2, 0]);
        assert_eq!(PageSelection::Range(8, 20).to_indices(10), vec![7, 8, 9]);
        assert_eq!(PageSelection::All.to_indices(2), vec![0, 1]);
        assert!(PageSelection::Single(11).to_indices(10).is_empty());
    }
}
