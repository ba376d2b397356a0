//! Domain types shared by every pipeline stage.

use crate::payload::ChartBody;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// One page to process.
///
/// Created once per selected page; the extractor never mutates it.
#[derive(Debug, Clone)]
pub struct PageTask {
    /// 1-indexed page number.
    pub page_number: usize,
    /// The rasterised page.
    pub source_image: Arc<DynamicImage>,
    /// Directory receiving every artifact of this page.
    pub output_directory: PathBuf,
}

impl PageTask {
    pub fn new(page_number: usize, source_image: DynamicImage, output_directory: PathBuf) -> Self {
        Self {
            page_number,
            source_image: Arc::new(source_image),
            output_directory,
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

/// What the classifier believes the page contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Table,
    Chart,
    Mixed,
    TextOnly,
    None,
    #[default]
    Unknown,
}

impl ContentKind {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "table" | "tables" => ContentKind::Table,
            "chart" | "charts" | "graph" | "figure" => ContentKind::Chart,
            "mixed" => ContentKind::Mixed,
            "text_only" | "text" => ContentKind::TextOnly,
            "none" | "empty" => ContentKind::None,
            _ => ContentKind::Unknown,
        }
    }

    /// Pages of these kinds carry nothing to extract.
    pub fn is_textual(self) -> bool {
        matches!(self, ContentKind::TextOnly | ContentKind::None)
    }

    /// Layout element types worth cropping for this kind of page.
    pub fn accepts(self, element: ElementType) -> bool {
        match self {
            ContentKind::Table => element == ElementType::Table,
            ContentKind::Chart => element == ElementType::Chart,
            _ => true,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentKind::Table => "table",
            ContentKind::Chart => "chart",
            ContentKind::Mixed => "mixed",
            ContentKind::TextOnly => "text_only",
            ContentKind::None => "none",
            ContentKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Clockwise rotation that brings the page upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    Upright,
    #[serde(rename = "90")]
    Quarter,
    #[serde(rename = "180")]
    Half,
    #[serde(rename = "270")]
    ThreeQuarter,
}

impl Rotation {
    /// Snap an arbitrary angle to the nearest quarter turn.
    pub fn from_degrees(degrees: i64) -> Self {
        let snapped = ((degrees.rem_euclid(360) + 45) / 90) % 4;
        match snapped {
            1 => Rotation::Quarter,
            2 => Rotation::Half,
            3 => Rotation::ThreeQuarter,
            _ => Rotation::Upright,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Upright => 0,
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarter => 270,
        }
    }

    /// Rotate `image` clockwise by this amount.
    pub fn apply(self, image: &DynamicImage) -> Option<DynamicImage> {
        match self {
            Rotation::Upright => None,
            Rotation::Quarter => Some(image.rotate90()),
            Rotation::Half => Some(image.rotate180()),
            Rotation::ThreeQuarter => Some(image.rotate270()),
        }
    }
}

/// Structural hints the classifier reports for one element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementCharacteristics {
    pub element_type: Option<String>,
    pub shape: Option<String>,
    pub color_semantics: Option<String>,
    #[serde(default)]
    pub merged_cells: bool,
    pub legend: Option<String>,
}

impl ElementCharacteristics {
    /// One-line prompt hint, or `None` when nothing useful was reported.
    pub fn hint(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(t) = &self.element_type {
            parts.push(t.clone());
        }
        if let Some(s) = &self.shape {
            parts.push(format!("shape: {s}"));
        }
        if self.merged_cells {
            parts.push("has merged cells (use colspan/rowspan)".to_string());
        }
        if let Some(c) = &self.color_semantics {
            parts.push(format!("colours mean: {c}"));
        }
        if let Some(l) = &self.legend {
            parts.push(format!("legend: {l}"));
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

/// The classifier's verdict for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub has_content: bool,
    pub content_kind: ContentKind,
    pub element_count: usize,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub characteristics: Vec<ElementCharacteristics>,
}

impl Classification {
    /// Safe default used when classification is disabled or fails:
    /// assume one element of unknown kind so the page is still processed.
    pub fn optimistic() -> Self {
        Self {
            has_content: true,
            content_kind: ContentKind::Unknown,
            element_count: 1,
            rotation: Rotation::Upright,
            characteristics: Vec::new(),
        }
    }

    /// `false` when the page should be skipped.
    pub fn is_extractable(&self) -> bool {
        self.has_content && !self.content_kind.is_textual()
    }

    /// Legend text reported for any element, joined.
    pub fn legend_text(&self) -> Option<String> {
        let legends: Vec<&str> = self
            .characteristics
            .iter()
            .filter_map(|c| c.legend.as_deref())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        (!legends.is_empty()).then(|| legends.join("\n"))
    }
}

// ── Segments ─────────────────────────────────────────────────────────────

/// Element types the extractor knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Table,
    Chart,
}

impl ElementType {
    /// Map a layout-engine label; unrelated labels (text, title, …) yield `None`.
    pub fn from_layout_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "table" => Some(ElementType::Table),
            "figure" | "chart" | "graphic" | "image" => Some(ElementType::Chart),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Table => f.write_str("table"),
            ElementType::Chart => f.write_str("chart"),
        }
    }
}

/// Axis-aligned box in page pixels, serialised as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl From<[u32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [u32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BoundingBox {
    /// Build from raw detector coordinates, clamped to the image.
    pub fn from_detection(coords: [f32; 4], width: u32, height: u32) -> Self {
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32).round() as u32;
        let (x1, x2) = (clamp(coords[0], width), clamp(coords[2], width));
        let (y1, y2) = (clamp(coords[1], height), clamp(coords[3], height));
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Grow by `margin` on every side without leaving the image.
    pub fn padded(&self, margin: u32, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.saturating_sub(margin),
            y1: self.y1.saturating_sub(margin),
            x2: self.x2.saturating_add(margin).min(width),
            y2: self.y2.saturating_add(margin).min(height),
        }
    }
}

/// A cropped element ready for extraction.
#[derive(Debug, Clone)]
pub struct Segment {
    pub element_type: ElementType,
    pub image: DynamicImage,
    /// Padded box in page coordinates.
    pub bounding_box: BoundingBox,
    /// 1-indexed position in reading order.
    pub order_index: usize,
    pub confidence: Option<f32>,
}

impl Segment {
    /// File name of the persisted crop.
    pub fn image_name(&self) -> String {
        format!("segment-{:02}.png", self.order_index)
    }
}

// ── Canonical output ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Table,
    Chart,
}

impl EntryKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntryKind::Table => "table",
            EntryKind::Chart => "chart",
        }
    }
}

/// Where an entry came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Segment image name, or the full-page image for whole-page extraction.
    pub source: String,
    pub bounding_box: Option<BoundingBox>,
    pub confidence: Option<f32>,
}

impl Provenance {
    pub fn whole_page() -> Self {
        Self {
            source: crate::artifacts::PAGE_IMAGE.to_string(),
            bounding_box: None,
            confidence: None,
        }
    }

    pub fn from_segment(segment: &Segment) -> Self {
        Self {
            source: segment.image_name(),
            bounding_box: Some(segment.bounding_box),
            confidence: segment.confidence,
        }
    }
}

/// One normalised table or chart, ready for writers.
///
/// `rows[0]` is the header row; every row has the header's length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    /// Artifact stem, e.g. `table-02`.
    pub name: String,
    pub page: usize,
    pub kind: EntryKind,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub rows: Vec<Vec<String>>,
    /// Series structure for charts; `rows` holds its tabular view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartBody>,
    pub provenance: Provenance,
}

impl CanonicalEntry {
    pub fn header(&self) -> &[String] {
        self.rows.first().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_rectangular(&self) -> bool {
        let width = self.header().len();
        self.rows.iter().all(|r| r.len() == width)
    }

    /// Numeric suffix of `name` (`table-03` → 3).
    pub fn index(&self) -> usize {
        self.name
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

// ── Review flags ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    CountMismatch,
    SparseTable,
    RepeatedRows,
    SeriesLengthMismatch,
}

/// A finding that needs a human to look at the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub page: usize,
    pub expected_count: usize,
    pub extracted_count: usize,
    pub kind: ReviewKind,
    pub reason: String,
}
