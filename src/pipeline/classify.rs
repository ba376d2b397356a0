//! Page classification with the cheap model.
//!
//! Classification is advisory. Every failure path (disabled, transport
//! error, unreadable answer) yields [`Classification::optimistic`] so the
//! page is still processed rather than silently skipped.

use crate::config::ExtractionConfig;
use crate::model::{Classification, ContentKind, ElementCharacteristics, Rotation};
use crate::payload::scalar_text;
use crate::pipeline::retry::{call_json, JsonCall, RetryPolicy};
use crate::pipeline::vision::{ModelTier, VisionService};
use crate::prompts::{CLASSIFY_PROMPT, CLASSIFY_SYSTEM_PROMPT};
use image::DynamicImage;
use serde_json::Value;
use tracing::{info, warn};

/// Classification plus the number of requests it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyOutcome {
    pub classification: Classification,
    pub calls: u32,
}

pub async fn classify(
    service: &dyn VisionService,
    image: &DynamicImage,
    config: &ExtractionConfig,
    page: usize,
) -> ClassifyOutcome {
    if !config.classify {
        return ClassifyOutcome {
            classification: Classification::optimistic(),
            calls: 0,
        };
    }

    let label = format!("Page {page} classify");
    let call = JsonCall {
        tier: ModelTier::Classifier,
        image,
        system: CLASSIFY_SYSTEM_PROMPT,
        prompt: CLASSIFY_PROMPT,
        label: &label,
    };
    let policy = RetryPolicy::single_attempt(config);

    match call_json(service, &policy, call, looks_like_classification).await {
        Ok(outcome) => {
            let classification = match outcome.value.filter(|_| outcome.valid) {
                Some(value) => parse_classification(&value),
                None => {
                    warn!("Page {}: classifier answer unusable, assuming content", page);
                    Classification::optimistic()
                }
            };
            info!(
                "Page {}: classified has_content={} kind={} count={} rotation={}",
                page,
                classification.has_content,
                classification.content_kind,
                classification.element_count,
                classification.rotation.degrees()
            );
            ClassifyOutcome {
                classification,
                calls: outcome.calls,
            }
        }
        Err(failure) => {
            warn!(
                "Page {}: classification failed ({}), assuming content",
                page, failure.error
            );
            ClassifyOutcome {
                classification: Classification::optimistic(),
                calls: failure.calls,
            }
        }
    }
}

fn looks_like_classification(v: &Value) -> bool {
    v.get("has_content").is_some() || v.get("content_type").is_some()
}

/// Interpret a classifier answer.
///
/// A page is skipped only when the answer says so explicitly; an ambiguous
/// answer proceeds.
pub fn parse_classification(v: &Value) -> Classification {
    let kind = v
        .get("content_type")
        .and_then(Value::as_str)
        .map(ContentKind::from_label)
        .unwrap_or_default();
    let has_content = v.get("has_content").and_then(Value::as_bool);
    let count = v
        .get("count")
        .and_then(|c| c.as_u64().or_else(|| c.as_f64().map(|f| f.max(0.0) as u64)))
        .map(|c| c as usize);

    let rotation = v
        .get("rotation")
        .and_then(|r| r.as_i64().or_else(|| r.as_str().and_then(|s| s.trim().parse().ok())))
        .map(Rotation::from_degrees)
        .unwrap_or_default();

    let characteristics = v
        .get("elements")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(parse_characteristics).collect())
        .unwrap_or_default();

    if has_content == Some(false) || kind.is_textual() {
        let content_kind = if kind.is_textual() { kind } else { ContentKind::None };
        return Classification {
            has_content: false,
            content_kind,
            element_count: 0,
            rotation,
            characteristics,
        };
    }

    Classification {
        has_content: true,
        content_kind: kind,
        element_count: count.filter(|&c| c > 0).unwrap_or(1),
        rotation,
        characteristics,
    }
}

fn parse_characteristics(v: &Value) -> Option<ElementCharacteristics> {
    let obj = v.as_object()?;
    let text = |key: &str| {
        obj.get(key)
            .map(scalar_text)
            .filter(|s| !s.is_empty())
    };
    Some(ElementCharacteristics {
        element_type: text("type"),
        shape: text("shape"),
        color_semantics: text("color_semantics"),
        merged_cells: obj.get("merged_cells").and_then(Value::as_bool).unwrap_or(false),
        legend: text("legend"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_page() {
        let c = parse_classification(&json!({
            "has_content": true, "content_type": "table", "count": 2, "rotation": 90,
            "elements": [{"type": "table", "merged_cells": true, "legend": "C = green"}]
        }));
        assert!(c.is_extractable());
        assert_eq!(c.content_kind, ContentKind::Table);
        assert_eq!(c.element_count, 2);
        assert_eq!(c.rotation, Rotation::Quarter);
        assert!(c.characteristics[0].merged_cells);
        assert_eq!(c.legend_text().as_deref(), Some("C = green"));
    }

    #[test]
    fn text_only_page_is_skipped() {
        let c = parse_classification(&json!({
            "has_content": false, "content_type": "text_only", "count": 0
        }));
        assert!(!c.is_extractable());
        assert_eq!(c.content_kind, ContentKind::TextOnly);
    }

    #[test]
    fn explicit_no_content_without_kind() {
        let c = parse_classification(&json!({"has_content": false}));
        assert!(!c.is_extractable());
        assert_eq!(c.content_kind, ContentKind::None);
    }

    #[test]
    fn ambiguous_answer_proceeds() {
        let c = parse_classification(&json!({"content_type": "poster", "count": "many"}));
        assert!(c.is_extractable());
        assert_eq!(c.content_kind, ContentKind::Unknown);
        assert_eq!(c.element_count, 1);
    }

    #[test]
    fn rotation_as_string() {
        let c = parse_classification(&json!({"has_content": true, "rotation": "180"}));
        assert_eq!(c.rotation, Rotation::Half);
    }
}
