//! Advisory checks on a page's extraction.
//!
//! Nothing here rejects data. Every finding becomes a [`ReviewFlag`] that is
//! persisted for a human, and normalisation proceeds regardless.

use crate::model::{ReviewFlag, ReviewKind};
use crate::payload::{PayloadEntry, TableBody};
use crate::pipeline::normalize::table_rows;
use tracing::warn;

/// Sparse-table check applies above this many cells.
const SPARSE_MIN_CELLS: usize = 20;
const SPARSE_RATIO: f64 = 0.7;

/// Repeated-row check applies above these sizes.
const REPEAT_MIN_CELLS: usize = 100;
const REPEAT_MIN_ROWS: usize = 15;
const REPEAT_RATIO: f64 = 0.2;

/// A series this much longer than the x axis suggests `0,4` was split in two.
const SERIES_RATIO: f64 = 1.5;

/// Inputs for one page.
#[derive(Debug, Clone, Copy)]
pub struct PageValidation<'a> {
    pub page: usize,
    pub expected: usize,
    /// Count reconciliation runs only when `expected` exceeds this.
    pub threshold: usize,
    pub entries: &'a [PayloadEntry],
    /// Some call returned a valid payload, even if it held no entries.
    pub any_valid_payload: bool,
}

impl PageValidation<'_> {
    /// Number of elements the page is credited with.
    pub fn extracted(&self) -> usize {
        if self.entries.is_empty() && self.any_valid_payload {
            1
        } else {
            self.entries.len()
        }
    }
}

/// Run every heuristic; the result is empty when the page looks fine.
pub fn validate(input: &PageValidation<'_>) -> Vec<ReviewFlag> {
    let extracted = input.extracted();
    let flag = |kind: ReviewKind, reason: String| {
        warn!("Page {}: review needed: {}", input.page, reason);
        ReviewFlag {
            page: input.page,
            expected_count: input.expected,
            extracted_count: extracted,
            kind,
            reason,
        }
    };

    let mut flags = Vec::new();
    if input.expected > input.threshold && extracted != input.expected {
        flags.push(flag(
            ReviewKind::CountMismatch,
            format!(
                "expected {} elements, extracted {}",
                input.expected, extracted
            ),
        ));
    }

    for (i, entry) in input.entries.iter().enumerate() {
        let label = entry
            .title()
            .map(str::to_string)
            .unwrap_or_else(|| format!("element {}", i + 1));
        match entry {
            PayloadEntry::Table(table) => {
                let rows = table_rows(&table.body);
                if matches!(table.body, TableBody::Html { .. }) {
                    if let Some(ratio) = sparse_ratio(&rows) {
                        flags.push(flag(
                            ReviewKind::SparseTable,
                            format!(
                                "'{}': {:.0}% of data cells are empty (possible misread colour matrix)",
                                label,
                                ratio * 100.0
                            ),
                        ));
                    }
                }
                if let Some(ratio) = repeated_ratio(&rows) {
                    flags.push(flag(
                        ReviewKind::RepeatedRows,
                        format!(
                            "'{}': {:.0}% of consecutive rows are identical (possible copied rows)",
                            label,
                            ratio * 100.0
                        ),
                    ));
                }
            }
            PayloadEntry::Chart(chart) => {
                if let Some((x, longest)) = chart.chart.series_lengths() {
                    if x > 0 && longest as f64 > SERIES_RATIO * x as f64 {
                        flags.push(flag(
                            ReviewKind::SeriesLengthMismatch,
                            format!(
                                "'{}': a series has {} values for {} x categories (decimal comma split?)",
                                label, longest, x
                            ),
                        ));
                    }
                }
            }
        }
    }
    flags
}

/// Share of empty data cells when it exceeds the sparse threshold.
///
/// Data cells are every cell below the header except the row label.
pub fn sparse_ratio(rows: &[Vec<String>]) -> Option<f64> {
    let total: usize = rows.iter().map(Vec::len).sum();
    if total <= SPARSE_MIN_CELLS {
        return None;
    }
    let data: Vec<&String> = rows.iter().skip(1).flat_map(|r| r.iter().skip(1)).collect();
    if data.is_empty() {
        return None;
    }
    let empty = data.iter().filter(|c| c.trim().is_empty()).count();
    let ratio = empty as f64 / data.len() as f64;
    (ratio > SPARSE_RATIO).then_some(ratio)
}

/// Share of identical consecutive data-row pairs (label cell excluded) when
/// it exceeds the repetition threshold on a large table.
pub fn repeated_ratio(rows: &[Vec<String>]) -> Option<f64> {
    let total: usize = rows.iter().map(Vec::len).sum();
    let data = rows.get(1..).unwrap_or_default();
    if total <= REPEAT_MIN_CELLS || data.len() <= REPEAT_MIN_ROWS {
        return None;
    }
    let body = |r: &Vec<String>| r.iter().skip(1).map(|c| c.trim().to_string()).collect::<Vec<_>>();
    let pairs = data.len() - 1;
    let identical = data
        .windows(2)
        .filter(|w| {
            let (a, b) = (body(&w[0]), body(&w[1]));
            a == b && a.iter().any(|c| !c.is_empty())
        })
        .count();
    let ratio = identical as f64 / pairs as f64;
    (ratio > REPEAT_RATIO).then_some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ChartBody, ChartEntry, ChartSeries, TableEntry};

    fn table(html: String) -> PayloadEntry {
        PayloadEntry::Table(TableEntry {
            title: Some("T".into()),
            notes: None,
            body: TableBody::Html { html },
        })
    }

    fn html<S: AsRef<str>>(rows: &[Vec<S>]) -> String {
        let mut s = String::from("<table>");
        for r in rows {
            s.push_str("<tr>");
            for c in r {
                s.push_str(&format!("<td>{}</td>", c.as_ref()));
            }
            s.push_str("</tr>");
        }
        s.push_str("</table>");
        s
    }

    fn page<'a>(expected: usize, entries: &'a [PayloadEntry]) -> PageValidation<'a> {
        PageValidation {
            page: 7,
            expected,
            threshold: 2,
            entries,
            any_valid_payload: !entries.is_empty(),
        }
    }

    fn small() -> PayloadEntry {
        table(html(&[vec!["h", "x"], vec!["a", "1"]]))
    }

    #[test]
    fn count_mismatch_above_threshold() {
        let entries = vec![small(), small()];
        let flags = validate(&page(4, &entries));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, ReviewKind::CountMismatch);
        assert_eq!(flags[0].expected_count, 4);
        assert_eq!(flags[0].extracted_count, 2);
        assert_eq!(flags[0].page, 7);
    }

    #[test]
    fn count_at_threshold_is_not_checked() {
        let entries = vec![small()];
        assert!(validate(&page(2, &entries)).is_empty());
    }

    #[test]
    fn valid_payload_without_entries_counts_as_one() {
        let v = PageValidation {
            page: 1,
            expected: 3,
            threshold: 2,
            entries: &[],
            any_valid_payload: true,
        };
        assert_eq!(v.extracted(), 1);
    }

    #[test]
    fn sparse_colour_matrix_is_flagged() {
        let mut rows = vec![vec!["", "A", "B", "C", "D", "E"]];
        for label in ["a", "b", "c", "d", "e"] {
            rows.push(vec![label, "", "", "", "", "x"]);
        }
        let entries = vec![table(html(&rows))];
        let flags = validate(&page(1, &entries));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, ReviewKind::SparseTable);
    }

    #[test]
    fn repeated_rows_are_flagged() {
        let mut rows: Vec<Vec<String>> = vec![["Site", "a", "b", "c", "d", "e"]
            .map(String::from)
            .to_vec()];
        for i in 0..20 {
            let mut row = vec![format!("s{i}")];
            row.extend(["1", "2", "3", "4", "5"].map(String::from));
            rows.push(row);
        }
        let entries = vec![table(html(&rows))];
        let flags = validate(&page(1, &entries));
        assert!(flags.iter().any(|f| f.kind == ReviewKind::RepeatedRows));
    }

    #[test]
    fn distinct_rows_are_fine() {
        let grid: Vec<Vec<String>> = (0..20)
            .map(|i| (0..6).map(|j| format!("{}", i * 10 + j)).collect())
            .collect();
        assert!(repeated_ratio(&grid).is_none());
        assert!(sparse_ratio(&grid).is_none());
    }

    #[test]
    fn long_series_is_flagged() {
        let chart = PayloadEntry::Chart(ChartEntry {
            title: None,
            notes: None,
            chart: ChartBody::Series {
                x_label: "x".into(),
                x_unit: None,
                x_values: vec!["1".into(), "2".into()],
                y_label: None,
                series: vec![ChartSeries {
                    name: None,
                    values: vec![Some("0".into()), Some("4".into()), Some("1".into()), Some("2".into())],
                }],
            },
        });
        let entries = vec![chart];
        let flags = validate(&page(1, &entries));
        assert_eq!(flags[0].kind, ReviewKind::SeriesLengthMismatch);
    }
}
