//! CLI binary for edgequake-pdf2tables.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints a run summary.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2tables::{
    extract_pdf, ExtractionConfig, ExtractionProgressCallback, ExtractionStats, PageSelection,
    ProgressCallback, TextPagePolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages finish out
/// of order, so start times are tracked per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed(&self, page: usize) -> String {
        let ms = self
            .start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&page)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }

    fn line(&self, mark: String, page: usize, total: usize, detail: String) {
        let elapsed = self.elapsed(page);
        self.bar.println(format!(
            "  {mark} Page {page:>3}/{total:<3}  {detail}  {elapsed}"
        ));
        self.bar.inc(1);
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting tables and charts from {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, entry_count: usize) {
        self.line(green("✓"), page_num, total, dim(&format!("{entry_count:>3} entries")));
    }

    fn on_page_skipped(&self, page_num: usize, total: usize, reason: &str) {
        self.line(dim("·"), page_num, total, dim(reason));
    }

    fn on_page_resumed(&self, page_num: usize, total: usize) {
        self.line(cyan("↺"), page_num, total, dim("already extracted"));
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = match error.char_indices().nth(79) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error.to_string(),
        };
        self.line(red("✗"), page_num, total, red(&msg));
    }

    fn on_extraction_complete(&self, total_pages: usize, success_count: usize) {
        let failed = self.errors.load(Ordering::SeqCst);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!("{} {} pages done", green("✔"), bold(&success_count.to_string()));
        } else {
            eprintln!(
                "{} {}/{} pages done  ({} failed)",
                if failed == total_pages { red("✘") } else { yellow("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Every page, artifacts under ./out
  pdf2tables paper.pdf -o out

  # A page range, re-running pages that already have artifacts
  pdf2tables --pages 3-15 --force paper.pdf -o out

  # Cheap classifier, strong extractor
  pdf2tables --classifier-model gpt-4.1-nano --model gpt-4.1 paper.pdf

  # Layout detection through an external detector process
  pdf2tables --layout-command ./detect-layout --layout-lang en paper.pdf

  # Transcribe text-only pages as well
  pdf2tables --text-pages full paper.pdf -o out

OUTPUT LAYOUT:
  out/summary.json, out/summary.html        every entry of every page
  out/page-NNN/table-NN.json|html           one canonical artifact per table
  out/page-NNN/chart-NN.json|html           one canonical artifact per chart
  out/page-NNN/REVIEW-MANUALLY.txt          advisory quality flags

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  PDF2TABLES_*            Fallback for every flag, e.g. PDF2TABLES_PAGES=1-4
"#;

/// Extract tables and charts from PDF pages using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2tables",
    version,
    about = "Extract tables and charts from PDF pages using Vision LLMs",
    long_about = "Extract every table and chart of a PDF into canonical JSON and HTML artifacts, \
one directory per page. Pages are classified by a cheap model, segmented by a layout engine and \
read by a vision model; finished pages are skipped on the next run.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Output directory for page artifacts and the summary.
    #[arg(short, long, env = "PDF2TABLES_OUTPUT", default_value = "pdf2tables-out")]
    output: PathBuf,

    /// Page selection: all, 5, 3-15, or 1,3,10-15.
    #[arg(long, env = "PDF2TABLES_PAGES", default_value = "all")]
    pages: String,

    /// Reprocess pages that already have artifacts.
    #[arg(long, env = "PDF2TABLES_FORCE")]
    force: bool,

    /// Pages processed in parallel.
    #[arg(short, long, env = "PDF2TABLES_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Extraction provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "PDF2TABLES_PROVIDER")]
    provider: Option<String>,

    /// Extraction model ID (e.g. gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "PDF2TABLES_MODEL")]
    model: Option<String>,

    /// Provider for the classification call. Defaults to --provider.
    #[arg(long, env = "PDF2TABLES_CLASSIFIER_PROVIDER")]
    classifier_provider: Option<String>,

    /// Model for the classification call (a cheap one is enough).
    #[arg(long, env = "PDF2TABLES_CLASSIFIER_MODEL")]
    classifier_model: Option<String>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PDF2TABLES_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TABLES_PASSWORD")]
    password: Option<String>,

    /// Skip classification; treat every page as holding one element.
    #[arg(long, env = "PDF2TABLES_NO_CLASSIFY")]
    no_classify: bool,

    /// Skip layout segmentation; always extract from the whole page.
    #[arg(long, env = "PDF2TABLES_NO_SEGMENTATION")]
    no_segmentation: bool,

    /// Pages extracted whole-page without segmentation, e.g. 4,9-11.
    #[arg(long, env = "PDF2TABLES_SKIP_SEGMENTATION_PAGES")]
    skip_segmentation_pages: Option<String>,

    /// Do not retry a page whole-page when segmentation yields nothing.
    #[arg(long, env = "PDF2TABLES_NO_FALLBACK")]
    no_fallback: bool,

    /// External layout detector invoked as `<cmd> --lang L --image PNG`.
    #[arg(long, env = "PDF2TABLES_LAYOUT_COMMAND")]
    layout_command: Option<PathBuf>,

    /// Layout engine language: en or ch.
    #[arg(long, env = "PDF2TABLES_LAYOUT_LANG", default_value = "en")]
    layout_lang: String,

    /// Model cache directory of the layout detector.
    #[arg(long, env = "PDF2TABLES_LAYOUT_MODEL_DIR")]
    layout_model_dir: Option<PathBuf>,

    /// Margin in pixels added around each detected element.
    #[arg(long, env = "PDF2TABLES_SEGMENT_PADDING", default_value_t = 16)]
    segment_padding: u32,

    /// Keep at most this many segments per page.
    #[arg(long, env = "PDF2TABLES_MAX_SEGMENTS")]
    max_segments: Option<usize>,

    /// Retries per inference call on malformed or failed responses.
    #[arg(long, env = "PDF2TABLES_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-call inference timeout in seconds.
    #[arg(long, env = "PDF2TABLES_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// Flag count mismatches only when more elements than this are expected.
    #[arg(long, env = "PDF2TABLES_REVIEW_THRESHOLD", default_value_t = 2)]
    review_threshold: usize,

    /// What to do with pages holding no tables or charts.
    #[arg(long, env = "PDF2TABLES_TEXT_PAGES", value_enum, default_value = "skip")]
    text_pages: TextPagesArg,

    /// Do not add derived quadratic-response columns.
    #[arg(long, env = "PDF2TABLES_NO_QUADRATIC")]
    no_quadratic: bool,

    /// Language of titles and notes in the output.
    #[arg(long, env = "PDF2TABLES_LOCALE", default_value = "en")]
    locale: String,

    /// Print the run result (ExtractionOutput) as JSON on stdout.
    #[arg(long, env = "PDF2TABLES_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2TABLES_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2TABLES_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2TABLES_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TextPagesArg {
    Skip,
    Notes,
    Full,
}

impl From<TextPagesArg> for TextPagePolicy {
    fn from(v: TextPagesArg) -> Self {
        match v {
            TextPagesArg::Skip => TextPagePolicy::Skip,
            TextPagesArg::Notes => TextPagePolicy::HarvestNotes,
            TextPagesArg::Full => TextPagePolicy::FullText,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The bar already reports every page; library INFO lines would tear it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run extraction ───────────────────────────────────────────────────
    let output = extract_pdf(&cli.input, &cli.output, &config)
        .await
        .with_context(|| format!("Extraction of {} failed", cli.input.display()))?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    }
    if !cli.quiet {
        print_summary(&output.stats, &cli.output);
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let pages = PageSelection::parse(&cli.pages).context("Invalid --pages")?;

    let mut builder = ExtractionConfig::builder()
        .pages(pages)
        .force_reprocess(cli.force)
        .concurrency(cli.concurrency)
        .dpi(cli.dpi)
        .classify(!cli.no_classify)
        .segmentation(!cli.no_segmentation)
        .fallback_to_full_page(!cli.no_fallback)
        .layout_lang(cli.layout_lang.clone())
        .segment_padding(cli.segment_padding)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .review_threshold(cli.review_threshold)
        .text_pages(cli.text_pages.into())
        .quadratic_metrics(!cli.no_quadratic)
        .locale(cli.locale.clone());

    if let Some(ref spec) = cli.skip_segmentation_pages {
        let skip = PageSelection::parse(spec).context("Invalid --skip-segmentation-pages")?;
        builder = builder.skip_segmentation_pages(explicit_pages(&skip)?);
    }
    if let Some(ref name) = cli.provider {
        builder = builder.provider_name(name.clone());
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref name) = cli.classifier_provider {
        builder = builder.classifier_provider_name(name.clone());
    }
    if let Some(ref model) = cli.classifier_model {
        builder = builder.classifier_model(model.clone());
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(ref cmd) = cli.layout_command {
        builder = builder.layout_command(cmd.clone());
    }
    if let Some(ref dir) = cli.layout_model_dir {
        builder = builder.layout_model_dir(dir.clone());
    }
    if let Some(n) = cli.max_segments {
        builder = builder.max_segments(n);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Page numbers named by a selection; `all` makes no sense for a skip list.
fn explicit_pages(selection: &PageSelection) -> Result<Vec<usize>> {
    Ok(match selection {
        PageSelection::All => anyhow::bail!("--skip-segmentation-pages needs explicit pages"),
        PageSelection::Single(p) => vec![*p],
        PageSelection::Range(a, b) => (*a..=*b).collect(),
        PageSelection::Set(pages) => pages.clone(),
    })
}

fn print_summary(stats: &ExtractionStats, output: &std::path::Path) {
    let mark = if stats.failed_pages == 0 {
        green("✔")
    } else {
        yellow("⚠")
    };
    eprintln!(
        "{mark}  {} tables, {} charts from {}/{} pages  {}ms  →  {}",
        stats.tables,
        stats.charts,
        stats.extracted_pages + stats.resumed_pages,
        stats.selected_pages,
        stats.total_duration_ms,
        bold(&output.display().to_string()),
    );
    eprintln!(
        "   {}",
        dim(&format!(
            "{} extracted, {} resumed, {} skipped, {} aborted, {} failed; \
             {} review flags; {} inference calls",
            stats.extracted_pages,
            stats.resumed_pages,
            stats.skipped_pages,
            stats.aborted_pages,
            stats.failed_pages,
            stats.review_flags,
            stats.inference_calls
        ))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_maps_onto_the_builder() {
        let cli = Cli::parse_from([
            "pdf2tables",
            "paper.pdf",
            "--pages",
            "2-4",
            "--text-pages",
            "notes",
            "--skip-segmentation-pages",
            "3,7",
            "--no-quadratic",
            "--max-segments",
            "5",
        ]);
        let config = build_config(&cli, None).unwrap();
        assert_eq!(config.pages, PageSelection::Range(2, 4));
        assert_eq!(config.text_pages, TextPagePolicy::HarvestNotes);
        assert!(!config.segmentation_enabled_for(7));
        assert!(config.segmentation_enabled_for(4));
        assert!(!config.quadratic_metrics);
        assert_eq!(config.max_segments, Some(5));
    }

    #[test]
    fn skip_list_rejects_all() {
        assert!(explicit_pages(&PageSelection::All).is_err());
        assert_eq!(explicit_pages(&PageSelection::Range(2, 4)).unwrap(), vec![2, 3, 4]);
    }
}
