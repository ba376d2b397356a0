//! Per-page extraction state machine.
//!
//! ```text
//! CHECK_CHECKPOINT ─done──────────────────────────────────────────▶ DONE
//!        │
//!     CLASSIFY ──nothing to extract──▶ SKIP ──────────────────────▶ DONE
//!        │
//!     SEGMENT ──no segments──┐
//!        │                   ▼
//! SEGMENTED_EXTRACT ─none─▶ FALLBACK ─▶ WHOLEPAGE_EXTRACT
//!        │                                   │
//!        └──────────────▶ VALIDATE ◀─────────┘
//!                            │
//!                        NORMALIZE ─────────────────────────────▶ DONE
//! ```
//!
//! Each page runs start to finish on one worker. The shared state is the
//! layout manager, the summary index and the notes harvested from text
//! pages; all three synchronise internally.
//! Every visited state is recorded on the [`PageReport`] so tests and
//! callers can see which path a page took.

use crate::artifacts::{
    PageArtifacts, CLASSIFICATION, PAGE_IMAGE, PAGE_NOTES, PAGE_PAYLOAD, PAGE_TEXT_HTML,
    PAGE_TEXT_JSON, SEGMENTS_MANIFEST,
};
use crate::checkpoint::CheckpointStore;
use crate::config::{ExtractionConfig, TextPagePolicy};
use crate::error::PageError;
use crate::model::{CanonicalEntry, Classification, PageTask, Provenance, Segment};
use crate::output::{PageReport, PageState, PageStatus, Strategy};
use crate::payload::{ExtractionPayload, PayloadEntry, TextPayload};
use crate::pipeline::classify::classify;
use crate::pipeline::layout::LayoutEngineManager;
use crate::pipeline::normalize::{normalize_entries, NormalizeOptions};
use crate::pipeline::retry::{call_json, JsonCall, RetryPolicy};
use crate::pipeline::segment::segment;
use crate::pipeline::validate::{validate, PageValidation};
use crate::pipeline::vision::{ModelTier, VisionService};
use crate::prompts::{self, NOTES_PROMPT, TEXT_PROMPT};
use crate::summary::{SummaryIndex, SummaryRecord};
use image::DynamicImage;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

/// Drives pages through the state machine.
pub struct PageExtractor {
    service: Arc<dyn VisionService>,
    layout: Arc<LayoutEngineManager>,
    config: Arc<ExtractionConfig>,
    checkpoints: CheckpointStore,
    summary: Option<Arc<SummaryIndex>>,
    system_prompt: String,
    /// Notes harvested from text pages, by page number.
    harvested_notes: Mutex<BTreeMap<usize, String>>,
}

impl std::fmt::Debug for PageExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageExtractor")
            .field("service", &"<dyn VisionService>")
            .field("layout", &self.layout)
            .field("checkpoints", &self.checkpoints)
            .field("summary", &self.summary.as_ref().map(|s| s.root().to_path_buf()))
            .finish()
    }
}

/// Payload entries gathered for one page, with their origin.
#[derive(Default)]
struct Harvest {
    items: Vec<(PayloadEntry, Provenance)>,
    /// Some call returned a valid table/chart payload.
    any_valid: bool,
    segmentation: Vec<Value>,
    whole_page_response: Option<Value>,
}

impl PageExtractor {
    pub fn new(
        service: Arc<dyn VisionService>,
        layout: Arc<LayoutEngineManager>,
        config: Arc<ExtractionConfig>,
    ) -> Self {
        let system_prompt = prompts::system_prompt(config.system_prompt.as_deref(), &config.locale);
        Self {
            checkpoints: CheckpointStore::from_config(&config),
            service,
            layout,
            config,
            summary: None,
            system_prompt,
            harvested_notes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Merge each finished page into `summary`.
    pub fn with_summary(mut self, summary: Arc<SummaryIndex>) -> Self {
        self.summary = Some(summary);
        self
    }

    /// Run one page to a terminal state. Never panics, never returns an
    /// error: hard failures are recorded on the report.
    pub async fn process(&self, task: PageTask) -> PageReport {
        let start = Instant::now();
        let mut report = PageReport::new(task.page_number, task.output_directory.clone());
        if let Err(e) = self.run(&task, &mut report).await {
            error!("{}", e);
            // Entry files may already be gone; keep the summary in step.
            if let Err(purge) = self.merge_summary(task.page_number, &[], None).await {
                warn!("{}", purge);
            }
            report.status = PageStatus::Failed;
            report.error = Some(e);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    async fn run(&self, task: &PageTask, report: &mut PageReport) -> Result<(), PageError> {
        let page = task.page_number;
        let artifacts = PageArtifacts::new(page, &task.output_directory);

        // ── Checkpoint ───────────────────────────────────────────────────
        report.trace.push(PageState::CheckCheckpoint);
        if self.checkpoints.is_done(&task.output_directory).await {
            let entries = self.checkpoints.load(&task.output_directory).await;
            info!("Page {}: already extracted ({} entries), resuming", page, entries.len());
            report.status = PageStatus::Resumed;
            self.merge_summary(page, &entries, None).await?;
            report.entries = entries;
            report.trace.push(PageState::Done);
            return Ok(());
        }
        artifacts.clear_entries().await?;

        // ── Classify ─────────────────────────────────────────────────────
        report.trace.push(PageState::Classify);
        let verdict = classify(&*self.service, &task.source_image, &self.config, page).await;
        report.inference_calls += verdict.calls;
        let classification = verdict.classification;

        let image = match classification.rotation.apply(&task.source_image) {
            Some(rotated) => {
                info!("Page {}: rotated {}° upright", page, classification.rotation.degrees());
                Arc::new(rotated)
            }
            None => Arc::clone(&task.source_image),
        };
        artifacts.write_image(PAGE_IMAGE, &image).await?;
        artifacts.write_json(CLASSIFICATION, &classification).await?;
        report.classification = Some(classification.clone());

        if !classification.is_extractable() {
            report.trace.push(PageState::Skip);
            let text_record = self.handle_text_page(page, &image, &artifacts, report).await;
            artifacts.write_review(&[]).await?;
            report.status = PageStatus::Skipped;
            self.merge_summary(page, &[], text_record).await?;
            report.trace.push(PageState::Done);
            return Ok(());
        }

        // ── Segment / extract ────────────────────────────────────────────
        let mut harvest = Harvest::default();
        let attempted = self.config.segmentation_enabled_for(page);
        let segments = if attempted {
            report.trace.push(PageState::Segment);
            segment(
                page,
                Arc::clone(&image),
                classification.content_kind,
                classification.element_count,
                &self.config,
                &self.layout,
            )
            .await
        } else {
            info!("Page {}: segmentation disabled, using the whole page", page);
            Vec::new()
        };

        if !segments.is_empty() {
            report.trace.push(PageState::SegmentedExtract);
            report.strategy = Strategy::Segmented;
            self.extract_segments(page, &segments, &classification, &artifacts, &mut harvest, report)
                .await?;
        }

        if harvest.items.is_empty() {
            let go_whole_page = if attempted {
                let why = if segments.is_empty() {
                    "no segments detected"
                } else {
                    "segmented pass produced no entries"
                };
                if self.config.fallback_to_full_page {
                    warn!("Page {}: {}, falling back to whole-page extraction", page, why);
                    report.trace.push(PageState::Fallback);
                    true
                } else {
                    warn!("Page {}: {} and fallback is disabled, aborting page", page, why);
                    false
                }
            } else {
                true
            };
            if go_whole_page {
                report.trace.push(PageState::WholePageExtract);
                report.strategy = Strategy::WholePage;
                self.extract_whole_page(page, &image, &classification, &mut harvest, report)
                    .await?;
            }
        }

        // ── Validate ─────────────────────────────────────────────────────
        report.trace.push(PageState::Validate);
        let payload_entries: Vec<PayloadEntry> =
            harvest.items.iter().map(|(e, _)| e.clone()).collect();
        let check = PageValidation {
            page,
            expected: classification.element_count,
            threshold: self.config.review_threshold,
            entries: &payload_entries,
            any_valid_payload: harvest.any_valid,
        };
        let flags = validate(&check);
        artifacts.write_review(&flags).await?;
        report.review_flags = flags;

        artifacts
            .write_json(
                PAGE_PAYLOAD,
                &json!({
                    "page": page,
                    "mode": report.strategy,
                    "content_type": classification.content_kind,
                    "expected_count": classification.element_count,
                    "extracted_count": check.extracted(),
                    "type": "table_set",
                    "tables": payload_entries,
                    "segmentation": harvest.segmentation,
                    "response": harvest.whole_page_response,
                }),
            )
            .await?;

        // ── Normalize ────────────────────────────────────────────────────
        report.trace.push(PageState::Normalize);
        let options = NormalizeOptions {
            page,
            legend: classification
                .legend_text()
                .or_else(|| self.notes_before(page)),
            quadratic_metrics: self.config.quadratic_metrics,
        };
        let entries = normalize_entries(harvest.items, &options);
        for entry in &entries {
            artifacts.write_entry(entry).await?;
        }

        report.status = if entries.is_empty() {
            warn!("Page {}: no entries extracted", page);
            PageStatus::Aborted
        } else {
            info!(
                page,
                entries = entries.len(),
                "Page {}: {} entries ({:?})",
                page,
                entries.len(),
                report.strategy
            );
            PageStatus::Extracted
        };
        self.merge_summary(page, &entries, None).await?;
        report.entries = entries;
        report.trace.push(PageState::Done);
        Ok(())
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }

    async fn extract_segments(
        &self,
        page: usize,
        segments: &[Segment],
        classification: &Classification,
        artifacts: &PageArtifacts,
        harvest: &mut Harvest,
        report: &mut PageReport,
    ) -> Result<(), PageError> {
        let total = segments.len();
        let manifest: Vec<Value> = segments
            .iter()
            .map(|s| {
                json!({
                    "index": s.order_index,
                    "type": s.element_type,
                    "bbox": s.bounding_box,
                    "image": s.image_name(),
                    "score": s.confidence,
                })
            })
            .collect();
        for s in segments {
            artifacts.write_image(&s.image_name(), &s.image).await?;
        }
        artifacts
            .write_json(SEGMENTS_MANIFEST, &json!({"count": total, "segments": manifest}))
            .await?;

        let policy = self.policy();
        for s in segments {
            let hint = classification
                .characteristics
                .get(s.order_index - 1)
                .and_then(|c| c.hint());
            let prompt = prompts::segment_prompt(
                s.element_type,
                s.order_index,
                total,
                s.bounding_box,
                hint.as_deref(),
            );
            let label = format!("Page {page} segment {}/{total}", s.order_index);
            let call = JsonCall {
                tier: ModelTier::Extraction,
                image: &s.image,
                system: &self.system_prompt,
                prompt: &prompt,
                label: &label,
            };
            let outcome = match call_json(&*self.service, &policy, call, is_valid_payload).await {
                Ok(o) => o,
                Err(failure) => {
                    report.inference_calls += failure.calls;
                    return Err(PageError::from_service(page, failure.attempts, failure.error));
                }
            };
            report.inference_calls += outcome.calls;

            let json_name = s.image_name().replace(".png", ".json");
            let payload = outcome.value.as_ref().map(ExtractionPayload::from_value);
            artifacts
                .write_json(
                    &json_name,
                    &json!({
                        "index": s.order_index,
                        "type": s.element_type,
                        "bbox": s.bounding_box,
                        "attempts": outcome.attempts,
                        "valid": outcome.valid,
                        "response": outcome.value,
                    }),
                )
                .await?;

            let entries = match payload {
                Some(p) if p.is_valid() => {
                    harvest.any_valid |= produces_entries(&p);
                    p.into_entries()
                }
                Some(p) => {
                    warn!(
                        "Page {}: segment {} dropped ({})",
                        page,
                        s.order_index,
                        p.invalid_reason().unwrap_or("invalid payload")
                    );
                    Vec::new()
                }
                None => {
                    warn!("Page {}: segment {} dropped (no JSON in response)", page, s.order_index);
                    Vec::new()
                }
            };
            harvest.segmentation.push(json!({
                "index": s.order_index,
                "type": s.element_type,
                "bbox": s.bounding_box,
                "image": s.image_name(),
                "json": json_name,
                "entries": entries.len(),
                "valid": outcome.valid,
            }));
            let provenance = Provenance::from_segment(s);
            harvest
                .items
                .extend(entries.into_iter().map(|e| (e, provenance.clone())));
        }
        Ok(())
    }

    async fn extract_whole_page(
        &self,
        page: usize,
        image: &DynamicImage,
        classification: &Classification,
        harvest: &mut Harvest,
        report: &mut PageReport,
    ) -> Result<(), PageError> {
        let mut prompt =
            prompts::whole_page_prompt(classification.content_kind, classification.element_count);
        let hints: Vec<String> = classification
            .characteristics
            .iter()
            .filter_map(|c| c.hint())
            .collect();
        if !hints.is_empty() {
            prompt.push_str(&format!("\n\nClassifier notes: {}.", hints.join(" | ")));
        }
        let label = format!("Page {page} whole page");
        let call = JsonCall {
            tier: ModelTier::Extraction,
            image,
            system: &self.system_prompt,
            prompt: &prompt,
            label: &label,
        };
        let outcome = match call_json(&*self.service, &self.policy(), call, is_valid_payload).await {
            Ok(o) => o,
            Err(failure) => {
                report.inference_calls += failure.calls;
                return Err(PageError::from_service(page, failure.attempts, failure.error));
            }
        };
        report.inference_calls += outcome.calls;

        match outcome.value.as_ref().map(ExtractionPayload::from_value) {
            Some(p) if p.is_valid() => {
                harvest.any_valid |= produces_entries(&p);
                harvest
                    .items
                    .extend(p.into_entries().into_iter().map(|e| (e, Provenance::whole_page())));
            }
            Some(p) => warn!(
                "Page {}: whole-page response unusable after {} attempts ({})",
                page,
                outcome.attempts,
                p.invalid_reason().unwrap_or("invalid payload")
            ),
            None => warn!(
                "Page {}: whole-page response held no JSON after {} attempts",
                page, outcome.attempts
            ),
        }
        harvest.whole_page_response = outcome.value;
        Ok(())
    }

    /// Apply the text-page policy. Failures here only warn: the page is
    /// skipped either way.
    async fn handle_text_page(
        &self,
        page: usize,
        image: &DynamicImage,
        artifacts: &PageArtifacts,
        report: &mut PageReport,
    ) -> Option<SummaryRecord> {
        let kind = report
            .classification
            .as_ref()
            .map(|c| c.content_kind)
            .unwrap_or_default();
        let prompt = match self.config.text_pages {
            TextPagePolicy::Skip => {
                info!("Page {}: no tables or charts ({}), skipping", page, kind);
                return None;
            }
            TextPagePolicy::HarvestNotes => NOTES_PROMPT,
            TextPagePolicy::FullText => TEXT_PROMPT,
        };

        let label = format!("Page {page} text");
        let call = JsonCall {
            tier: ModelTier::Extraction,
            image,
            system: &self.system_prompt,
            prompt,
            label: &label,
        };
        let text = match call_json(&*self.service, &self.policy(), call, is_text_payload).await {
            Ok(outcome) => {
                report.inference_calls += outcome.calls;
                match outcome.value.as_ref().map(ExtractionPayload::from_value) {
                    Some(ExtractionPayload::Text(t)) => t,
                    _ => {
                        warn!("Page {}: text response unusable", page);
                        return None;
                    }
                }
            }
            Err(failure) => {
                report.inference_calls += failure.calls;
                warn!("Page {}: text extraction failed: {}", page, failure.error);
                return None;
            }
        };

        match self.config.text_pages {
            TextPagePolicy::HarvestNotes => {
                info!("Page {}: harvested {} notes", page, text.notes.len());
                self.keep_notes(page, &text.notes);
                let written = artifacts
                    .write_json(PAGE_NOTES, &json!({"page": page, "notes": text.notes}))
                    .await;
                if let Err(e) = written {
                    warn!("{}", e);
                }
                None
            }
            _ => self.write_text_page(page, &text, artifacts).await,
        }
    }

    async fn write_text_page(
        &self,
        page: usize,
        text: &TextPayload,
        artifacts: &PageArtifacts,
    ) -> Option<SummaryRecord> {
        let html = crate::artifacts::text_html(page, text);
        let written = match artifacts.write_json(PAGE_TEXT_JSON, text).await {
            Ok(_) => artifacts.write_bytes(PAGE_TEXT_HTML, html.as_bytes()).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(_) => {
                info!("Page {}: transcribed {} text sections", page, text.sections.len());
                Some(SummaryRecord::text_page(
                    page,
                    text.title.clone(),
                    text.sections.len(),
                ))
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    fn lock_notes(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, String>> {
        self.harvested_notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn keep_notes(&self, page: usize, notes: &[String]) {
        let notes: Vec<&str> = notes.iter().map(|n| n.trim()).filter(|n| !n.is_empty()).collect();
        if !notes.is_empty() {
            self.lock_notes().insert(page, notes.join("\n"));
        }
    }

    /// Notes from the closest text page before `page`, if one was harvested.
    fn notes_before(&self, page: usize) -> Option<String> {
        self.lock_notes()
            .range(..page)
            .next_back()
            .map(|(_, notes)| notes.clone())
    }

    async fn merge_summary(
        &self,
        page: usize,
        entries: &[CanonicalEntry],
        extra: Option<SummaryRecord>,
    ) -> Result<(), PageError> {
        let Some(summary) = &self.summary else {
            return Ok(());
        };
        let mut records: Vec<SummaryRecord> = entries.iter().map(SummaryRecord::from_entry).collect();
        records.extend(extra);
        summary.merge_page(page, records).await
    }
}

fn is_valid_payload(v: &Value) -> bool {
    ExtractionPayload::from_value(v).is_valid()
}

fn is_text_payload(v: &Value) -> bool {
    matches!(ExtractionPayload::from_value(v), ExtractionPayload::Text(_))
}

fn produces_entries(p: &ExtractionPayload) -> bool {
    matches!(
        p,
        ExtractionPayload::Table(_) | ExtractionPayload::TableSet(_) | ExtractionPayload::Chart(_)
    )
}
