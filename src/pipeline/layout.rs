//! Layout-detection engines and their process-scoped manager.
//!
//! ## Why a manager?
//!
//! Layout models are expensive to load, so engines are cached per language.
//! Their on-disk weights can also be truncated by an interrupted download,
//! which shows up as an "unexpected end of data" failure on every call.
//! [`LayoutEngineManager`] owns both concerns explicitly: a bounded LRU of
//! live engines, and a one-shot destructive cache reset that, if it does not
//! help, disables segmentation for the rest of the run.
//!
//! Every failure here is soft. Callers get an empty region list and fall
//! back to whole-page extraction.

use crate::config::ExtractionConfig;
use crate::error::LayoutError;
use crate::pipeline::encode::png_bytes;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Languages the layout models ship for.
pub const SUPPORTED_LANGS: &[&str] = &["en", "ch"];

/// Live engines kept at once.
pub const MAX_CACHED_ENGINES: usize = 2;

/// How often a running detector process is checked for exit.
const DETECTOR_POLL: Duration = Duration::from_millis(20);

/// One detected region in page pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRegion {
    #[serde(rename = "type", alias = "label")]
    pub label: String,
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    #[serde(default)]
    pub score: Option<f32>,
}

/// A loaded layout model.
pub trait LayoutEngine: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<LayoutRegion>, LayoutError>;
}

/// Builds engines and owns their on-disk model cache.
pub trait LayoutEngineFactory: Send + Sync {
    fn create(&self, lang: &str) -> Result<Arc<dyn LayoutEngine>, LayoutError>;

    /// Delete cached model files for `lang` so the next `create` re-fetches them.
    fn purge_cache(&self, lang: &str) -> Result<(), LayoutError>;
}

/// Process-scoped owner of layout engines.
pub struct LayoutEngineManager {
    factory: Arc<dyn LayoutEngineFactory>,
    /// Most recently used first.
    engines: Mutex<VecDeque<(String, Arc<dyn LayoutEngine>)>>,
    /// Whether the one destructive reset has run. Held for the whole
    /// recovery so concurrent pages wait for it instead of giving up.
    reset_done: Mutex<bool>,
    disabled: AtomicBool,
    unavailable_warned: AtomicBool,
    resets: AtomicUsize,
}

impl std::fmt::Debug for LayoutEngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutEngineManager")
            .field("cached", &self.cached_languages())
            .field("disabled", &self.is_disabled())
            .field("resets", &self.reset_count())
            .finish()
    }
}

impl LayoutEngineManager {
    pub fn new(factory: Arc<dyn LayoutEngineFactory>) -> Self {
        Self {
            factory,
            engines: Mutex::new(VecDeque::new()),
            reset_done: Mutex::new(false),
            disabled: AtomicBool::new(false),
            unavailable_warned: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
        }
    }

    /// Manager over a [`CommandLayoutEngine`], or over
    /// [`UnconfiguredLayoutFactory`] when no detector is configured.
    pub fn from_config(config: &ExtractionConfig) -> Self {
        match &config.layout_command {
            Some(program) => Self::new(Arc::new(CommandLayoutFactory {
                program: program.clone(),
                model_dir: config.layout_model_dir.clone(),
                timeout: Duration::from_secs(config.layout_timeout_secs),
            })),
            None => Self::new(Arc::new(UnconfiguredLayoutFactory)),
        }
    }

    /// Map `lang` onto a supported language, warning on fallback.
    pub fn normalize_lang(lang: &str) -> String {
        let lower = lang.trim().to_lowercase();
        if SUPPORTED_LANGS.contains(&lower.as_str()) {
            lower
        } else {
            warn!(
                "Layout language '{}' is not supported ({:?}); using 'en'",
                lang, SUPPORTED_LANGS
            );
            "en".to_string()
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Languages with a live engine, most recently used first.
    pub fn cached_languages(&self) -> Vec<String> {
        self.lock_engines().iter().map(|(l, _)| l.clone()).collect()
    }

    fn lock_engines(&self) -> std::sync::MutexGuard<'_, VecDeque<(String, Arc<dyn LayoutEngine>)>> {
        self.engines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn engine(&self, lang: &str) -> Result<Arc<dyn LayoutEngine>, LayoutError> {
        let mut engines = self.lock_engines();
        if let Some(pos) = engines.iter().position(|(l, _)| l == lang) {
            if let Some(entry) = engines.remove(pos) {
                let engine = Arc::clone(&entry.1);
                engines.push_front(entry);
                return Ok(engine);
            }
        }

        info!("Initialising layout engine for '{}'", lang);
        let engine = self.factory.create(lang)?;
        engines.push_front((lang.to_string(), Arc::clone(&engine)));
        while engines.len() > MAX_CACHED_ENGINES {
            if let Some((evicted, _)) = engines.pop_back() {
                debug!("Evicting layout engine for '{}'", evicted);
            }
        }
        Ok(engine)
    }

    /// Drop live engines and purge the model cache for `lang`.
    pub fn reset_cache(&self, lang: &str) -> Result<(), LayoutError> {
        self.lock_engines().clear();
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.factory.purge_cache(lang)
    }

    fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            warn!("Segmentation disabled for the rest of the run: {}", reason);
        }
    }

    fn try_detect(&self, image: &DynamicImage, lang: &str) -> Result<Vec<LayoutRegion>, LayoutError> {
        self.engine(lang)?.detect(image)
    }

    /// Detect regions; every failure yields an empty list.
    pub fn detect(&self, image: &DynamicImage, lang: &str) -> Vec<LayoutRegion> {
        if self.is_disabled() {
            return Vec::new();
        }
        let lang = Self::normalize_lang(lang);

        match self.try_detect(image, &lang) {
            Ok(regions) => regions,
            Err(err) if err.is_corrupted_cache() => self.recover(image, &lang, err),
            Err(LayoutError::Unavailable(detail)) => {
                if !self.unavailable_warned.swap(true, Ordering::SeqCst) {
                    warn!("Layout engine unavailable ({}); using whole-page extraction", detail);
                }
                self.disable("layout engine unavailable");
                Vec::new()
            }
            Err(err @ LayoutError::Initialization(_)) => {
                self.disable(&err.to_string());
                Vec::new()
            }
            Err(err) => {
                warn!("Layout detection failed: {}", err);
                Vec::new()
            }
        }
    }

    fn recover(&self, image: &DynamicImage, lang: &str, err: LayoutError) -> Vec<LayoutRegion> {
        let mut reset_done = self.reset_done.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_disabled() {
            return Vec::new();
        }
        if *reset_done {
            debug!("Layout model cache already reset; retrying detection ({})", err);
        } else {
            *reset_done = true;
            warn!("Layout model cache corrupted ({}); resetting and retrying once", err);
            if let Err(purge_err) = self.reset_cache(lang) {
                self.disable(&format!("cache reset failed ({purge_err})"));
                return Vec::new();
            }
        }
        match self.try_detect(image, lang) {
            Ok(regions) => {
                info!("Layout engine recovered after cache reset");
                regions
            }
            Err(retry_err) => {
                self.disable(&format!("detection still failing after reset ({retry_err})"));
                Vec::new()
            }
        }
    }
}

// ── External detector process ────────────────────────────────────────────

/// Layout engine backed by an external detector executable.
///
/// Invoked as `<program> --lang <lang> --image <png> [--model-dir <dir>]`;
/// prints a JSON list of `{type, bbox, score}` (or `{"regions": [...]}`)
/// on stdout. A detector still running after `timeout` is killed.
#[derive(Debug, Clone)]
pub struct CommandLayoutEngine {
    pub program: PathBuf,
    pub lang: String,
    pub model_dir: Option<PathBuf>,
    pub timeout: Duration,
}

/// Read a child pipe to the end on its own thread so the child never
/// blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl LayoutEngine for CommandLayoutEngine {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<LayoutRegion>, LayoutError> {
        let bytes = png_bytes(image).map_err(|e| LayoutError::Inference(e.to_string()))?;
        let mut file = tempfile::Builder::new()
            .prefix("pdf2tables-layout-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| LayoutError::Inference(format!("temp file: {e}")))?;
        file.write_all(&bytes)
            .and_then(|_| file.flush())
            .map_err(|e| LayoutError::Inference(format!("temp file: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--lang").arg(&self.lang).arg("--image").arg(file.path());
        if let Some(dir) = &self.model_dir {
            cmd.arg("--model-dir").arg(dir);
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    LayoutError::Unavailable(format!("{}: {e}", self.program.display()))
                }
                _ => LayoutError::Inference(e.to_string()),
            })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() < deadline => std::thread::sleep(DETECTOR_POLL),
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LayoutError::Inference(format!(
                        "detector killed after {}s",
                        self.timeout.as_secs()
                    )));
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LayoutError::Inference(format!("waiting for detector: {e}")));
                }
            }
        };
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(
                if stderr.to_lowercase().contains(LayoutError::CORRUPTION_MARKER) {
                    LayoutError::CorruptedCache(stderr)
                } else {
                    LayoutError::Inference(format!("detector exited with {}: {}", status, stderr))
                },
            );
        }

        parse_regions(&String::from_utf8_lossy(&stdout))
    }
}

/// Parse detector output: a list, or an object with a `regions` list.
pub fn parse_regions(stdout: &str) -> Result<Vec<LayoutRegion>, LayoutError> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| LayoutError::Inference(format!("invalid detector output: {e}")))?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut obj) => obj
            .remove("regions")
            .ok_or_else(|| LayoutError::Inference("detector output without 'regions'".into()))?,
        _ => return Err(LayoutError::Inference("detector output is not a list".into())),
    };
    serde_json::from_value(list).map_err(|e| LayoutError::Inference(format!("invalid region: {e}")))
}

/// Factory for [`CommandLayoutEngine`]s.
#[derive(Debug, Clone)]
pub struct CommandLayoutFactory {
    pub program: PathBuf,
    pub model_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl LayoutEngineFactory for CommandLayoutFactory {
    fn create(&self, lang: &str) -> Result<Arc<dyn LayoutEngine>, LayoutError> {
        let is_path = self.program.components().count() > 1;
        if is_path && !self.program.exists() {
            return Err(LayoutError::Unavailable(format!(
                "detector '{}' not found",
                self.program.display()
            )));
        }
        Ok(Arc::new(CommandLayoutEngine {
            program: self.program.clone(),
            lang: lang.to_string(),
            model_dir: self.model_dir.clone(),
            timeout: self.timeout,
        }))
    }

    fn purge_cache(&self, lang: &str) -> Result<(), LayoutError> {
        let Some(dir) = &self.model_dir else {
            return Ok(());
        };
        if dir.exists() {
            std::fs::remove_dir_all(dir)
                .map_err(|e| LayoutError::Initialization(format!("purge {}: {e}", dir.display())))?;
            warn!("Removed layout model cache {} ({})", dir.display(), lang);
        }
        Ok(())
    }
}

/// Stand-in used when no detector is configured; every page runs whole-page.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredLayoutFactory;

impl LayoutEngineFactory for UnconfiguredLayoutFactory {
    fn create(&self, _lang: &str) -> Result<Arc<dyn LayoutEngine>, LayoutError> {
        Err(LayoutError::Unavailable(
            "no layout detector configured (set --layout-command)".into(),
        ))
    }

    fn purge_cache(&self, _lang: &str) -> Result<(), LayoutError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine whose answers are consumed in order; the last one repeats.
    struct ScriptedEngine {
        answers: Mutex<VecDeque<Result<Vec<LayoutRegion>, LayoutError>>>,
    }

    impl LayoutEngine for ScriptedEngine {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<LayoutRegion>, LayoutError> {
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers.front().cloned().unwrap_or_else(|| Ok(Vec::new()))
            }
        }
    }

    struct ScriptedFactory {
        answers: Vec<Result<Vec<LayoutRegion>, LayoutError>>,
        created: AtomicUsize,
        purged: AtomicUsize,
        engine: Mutex<Option<Arc<ScriptedEngine>>>,
    }

    impl ScriptedFactory {
        fn new(answers: Vec<Result<Vec<LayoutRegion>, LayoutError>>) -> Arc<Self> {
            Arc::new(Self {
                answers,
                created: AtomicUsize::new(0),
                purged: AtomicUsize::new(0),
                engine: Mutex::new(None),
            })
        }
    }

    impl LayoutEngineFactory for ScriptedFactory {
        fn create(&self, _lang: &str) -> Result<Arc<dyn LayoutEngine>, LayoutError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let mut slot = self.engine.lock().unwrap();
            let engine = slot
                .get_or_insert_with(|| {
                    Arc::new(ScriptedEngine {
                        answers: Mutex::new(self.answers.clone().into()),
                    })
                })
                .clone();
            Ok(engine)
        }

        fn purge_cache(&self, _lang: &str) -> Result<(), LayoutError> {
            self.purged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn table() -> LayoutRegion {
        LayoutRegion {
            label: "table".into(),
            bbox: [0.0, 0.0, 10.0, 10.0],
            score: Some(0.9),
        }
    }

    fn corrupted() -> LayoutError {
        LayoutError::Initialization("load failed: unexpected end of data".into())
    }

    #[test]
    fn lru_keeps_two_engines() {
        let factory = ScriptedFactory::new(vec![Ok(vec![table()])]);
        let manager = LayoutEngineManager::new(factory.clone());
        let img = DynamicImage::new_rgb8(4, 4);
        manager.detect(&img, "en");
        manager.detect(&img, "ch");
        manager.detect(&img, "en");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(manager.cached_languages(), vec!["en", "ch"]);
    }

    #[test]
    fn unsupported_language_falls_back() {
        assert_eq!(LayoutEngineManager::normalize_lang("PT"), "en");
        assert_eq!(LayoutEngineManager::normalize_lang("ch"), "ch");
    }

    #[test]
    fn corrupted_cache_resets_once_and_recovers() {
        let factory = ScriptedFactory::new(vec![Err(corrupted()), Ok(vec![table()])]);
        let manager = LayoutEngineManager::new(factory.clone());
        let regions = manager.detect(&DynamicImage::new_rgb8(4, 4), "en");
        assert_eq!(regions.len(), 1);
        assert_eq!(factory.purged.load(Ordering::SeqCst), 1);
        assert_eq!(manager.reset_count(), 1);
        assert!(!manager.is_disabled());
    }

    #[test]
    fn persistent_corruption_disables_segmentation() {
        let factory = ScriptedFactory::new(vec![Err(corrupted())]);
        let manager = LayoutEngineManager::new(factory.clone());
        let img = DynamicImage::new_rgb8(4, 4);
        assert!(manager.detect(&img, "en").is_empty());
        assert!(manager.is_disabled());
        assert!(manager.detect(&img, "en").is_empty());
        assert_eq!(factory.purged.load(Ordering::SeqCst), 1);
    }

    /// Fails with a corrupted cache for the first `failing` calls, which all
    /// wait for each other before answering.
    struct RacingEngine {
        gate: std::sync::Barrier,
        failing: usize,
        calls: AtomicUsize,
    }

    impl LayoutEngine for RacingEngine {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<LayoutRegion>, LayoutError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failing {
                self.gate.wait();
                return Err(corrupted());
            }
            Ok(vec![table()])
        }
    }

    struct RacingFactory {
        engine: Arc<RacingEngine>,
        purged: AtomicUsize,
    }

    impl LayoutEngineFactory for RacingFactory {
        fn create(&self, _lang: &str) -> Result<Arc<dyn LayoutEngine>, LayoutError> {
            Ok(self.engine.clone())
        }

        fn purge_cache(&self, _lang: &str) -> Result<(), LayoutError> {
            self.purged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn concurrent_corruption_shares_one_reset() {
        let factory = Arc::new(RacingFactory {
            engine: Arc::new(RacingEngine {
                gate: std::sync::Barrier::new(2),
                failing: 2,
                calls: AtomicUsize::new(0),
            }),
            purged: AtomicUsize::new(0),
        });
        let manager = LayoutEngineManager::new(factory.clone());
        let img = DynamicImage::new_rgb8(4, 4);

        let found: Vec<usize> = std::thread::scope(|scope| {
            let pages: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| manager.detect(&img, "en").len()))
                .collect();
            pages.into_iter().map(|p| p.join().unwrap()).collect()
        });

        assert_eq!(found, vec![1, 1]);
        assert_eq!(factory.purged.load(Ordering::SeqCst), 1);
        assert!(!manager.is_disabled());
    }

    #[test]
    fn inference_error_is_soft_and_not_sticky() {
        let factory = ScriptedFactory::new(vec![
            Err(LayoutError::Inference("oom".into())),
            Ok(vec![table()]),
        ]);
        let manager = LayoutEngineManager::new(factory);
        let img = DynamicImage::new_rgb8(4, 4);
        assert!(manager.detect(&img, "en").is_empty());
        assert_eq!(manager.detect(&img, "en").len(), 1);
    }

    #[test]
    fn missing_detector_disables() {
        let manager = LayoutEngineManager::new(Arc::new(CommandLayoutFactory {
            program: PathBuf::from("/nonexistent/dir/layout-detect"),
            model_dir: None,
            timeout: Duration::from_secs(5),
        }));
        assert!(manager.detect(&DynamicImage::new_rgb8(4, 4), "en").is_empty());
        assert!(manager.is_disabled());
    }

    #[test]
    fn unconfigured_manager_is_soft() {
        let config = ExtractionConfig::default();
        let manager = LayoutEngineManager::from_config(&config);
        assert!(manager.detect(&DynamicImage::new_rgb8(4, 4), "en").is_empty());
        assert!(manager.is_disabled());
    }

    #[cfg(unix)]
    fn detector_script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("detect.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn command_engine(program: PathBuf, timeout: Duration) -> CommandLayoutEngine {
        CommandLayoutEngine {
            program,
            lang: "en".into(),
            model_dir: None,
            timeout,
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_reads_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = detector_script(
            dir.path(),
            r#"echo '[{"type":"table","bbox":[1,2,30,40],"score":0.7}]'"#,
        );
        let engine = command_engine(script, Duration::from_secs(10));
        let regions = engine.detect(&DynamicImage::new_rgb8(4, 4)).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox, [1.0, 2.0, 30.0, 40.0]);
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_reports_corruption_from_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = detector_script(dir.path(), "echo 'load: Unexpected end of data' >&2; exit 3");
        let engine = command_engine(script, Duration::from_secs(10));
        let err = engine.detect(&DynamicImage::new_rgb8(4, 4)).unwrap_err();
        assert!(err.is_corrupted_cache());
    }

    #[cfg(unix)]
    #[test]
    fn slow_detector_is_killed_at_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = detector_script(
            dir.path(),
            &format!("sleep 2\ntouch '{}'", marker.display()),
        );
        let engine = command_engine(script, Duration::from_millis(300));

        let started = Instant::now();
        let err = engine.detect(&DynamicImage::new_rgb8(4, 4)).unwrap_err();
        assert!(matches!(err, LayoutError::Inference(ref m) if m.contains("killed")));
        assert!(started.elapsed() < Duration::from_millis(1500));

        std::thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists(), "detector kept running after the deadline");
    }

    #[test]
    fn parse_list_and_object() {
        let regions = parse_regions(r#"[{"type":"table","bbox":[1,2,3,4],"score":0.8}]"#).unwrap();
        assert_eq!(regions[0].label, "table");
        assert_eq!(regions[0].bbox, [1.0, 2.0, 3.0, 4.0]);
        let regions = parse_regions(r#"{"regions":[{"label":"figure","bbox":[0,0,5,5]}]}"#).unwrap();
        assert_eq!(regions[0].label, "figure");
        assert!(regions[0].score.is_none());
        assert!(parse_regions("nope").is_err());
    }
}
