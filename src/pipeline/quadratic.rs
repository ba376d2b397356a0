//! Derived optimum columns for quadratic response-curve tables.
//!
//! A coefficient table with columns `a`, `b`, `c` describes
//! `y = a + b·x − c·x²`, where `c` is printed as a magnitude. For each row
//! this module derives the input at the optimum, the optimum response, and
//! the input/response pair at 90 % of the optimum.
//!
//! The columns are appended, never substituted, and only when at least one
//! row yields a value.

use tracing::debug;

/// Headers of the four appended columns, in order.
pub const DERIVED_HEADERS: [&str; 4] = [
    "X* (kg N ha⁻¹)",
    "Y_max (kg ha⁻¹)",
    "X_90% (kg N ha⁻¹)",
    "Y_90% (kg ha⁻¹)",
];

/// Fraction of the optimum response used for the economic point.
const NINETY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadraticMetrics {
    pub x_opt: f64,
    pub y_opt: f64,
    /// `(x, y)` at 90 % of `y_opt`, when a non-negative root exists.
    pub ninety: Option<(f64, f64)>,
}

/// Metrics for one curve; `None` when `c` is zero or not finite.
pub fn metrics(a: f64, b: f64, c: f64) -> Option<QuadraticMetrics> {
    let c = c.abs();
    if c == 0.0 || !a.is_finite() || !b.is_finite() || !c.is_finite() {
        return None;
    }
    let x_opt = b / (2.0 * c);
    let y_opt = a + b * x_opt - c * x_opt * x_opt;

    // c·x² − b·x + (0.9·y* − a) = 0
    let y90 = NINETY * y_opt;
    let k = y90 - a;
    let disc = b * b - 4.0 * c * k;
    let ninety = (disc >= 0.0)
        .then(|| {
            let root = disc.sqrt();
            let mut roots = [(b - root) / (2.0 * c), (b + root) / (2.0 * c)];
            roots.sort_by(f64::total_cmp);
            roots.into_iter().find(|x| *x >= 0.0)
        })
        .flatten()
        .map(|x| (x, y90));

    Some(QuadraticMetrics {
        x_opt,
        y_opt,
        ninety,
    })
}

/// Parse a printed coefficient: decimal commas, typographic minus,
/// significance stars and a leading `+`/`±` are tolerated.
pub fn parse_coefficient(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .replace('\u{2212}', "-")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    s = s.trim_start_matches(['+', '±']).trim_end_matches('*').to_string();
    if s.contains(',') {
        s = if s.contains('.') {
            s.replace(',', "")
        } else {
            s.replace(',', ".")
        };
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// The table with the derived columns appended, or `None` when the table
/// has no `a`/`b`/`c` columns, is already augmented, or no row yields a
/// value.
pub fn augment(rows: &[Vec<String>]) -> Option<Vec<Vec<String>>> {
    let header = rows.first()?;
    if header.iter().any(|h| h == DERIVED_HEADERS[0]) {
        return None;
    }
    let column = |name: &str| header.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    let (ia, ib, ic) = (column("a")?, column("b")?, column("c")?);

    let derived: Vec<[String; 4]> = rows[1..]
        .iter()
        .map(|row| {
            let coef = |i: usize| row.get(i).and_then(|v| parse_coefficient(v));
            match (coef(ia), coef(ib), coef(ic)) {
                (Some(a), Some(b), Some(c)) => format_metrics(metrics(a, b, c)),
                _ => Default::default(),
            }
        })
        .collect();

    if derived.iter().all(|d| d.iter().all(String::is_empty)) {
        debug!("Coefficient table produced no derived values; left unchanged");
        return None;
    }

    let mut out = Vec::with_capacity(rows.len());
    let mut head = header.clone();
    head.extend(DERIVED_HEADERS.iter().map(|h| h.to_string()));
    out.push(head);
    for (row, extra) in rows[1..].iter().zip(derived) {
        let mut r = row.clone();
        r.extend(extra);
        out.push(r);
    }
    Some(out)
}

fn format_metrics(m: Option<QuadraticMetrics>) -> [String; 4] {
    let Some(m) = m else {
        return Default::default();
    };
    let (x90, y90) = match m.ninety {
        Some((x, y)) => (format!("{x:.1}"), format!("{y:.0}")),
        None => (String::new(), String::new()),
    };
    [format!("{:.1}", m.x_opt), format!("{:.0}", m.y_opt), x90, y90]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn optimum_of_reference_curve() {
        let m = metrics(100.0, 2.0, 0.01).unwrap();
        assert!((m.x_opt - 100.0).abs() < 1e-9);
        assert!((m.y_opt - 200.0).abs() < 1e-9);
        let (x90, y90) = m.ninety.unwrap();
        assert!((y90 - 180.0).abs() < 1e-9);
        // 0.01x² − 2x + 80 = 0, smaller root.
        assert!((x90 - 55.278).abs() < 1e-3);
    }

    #[test]
    fn zero_curvature_is_undefined() {
        assert!(metrics(1.0, 2.0, 0.0).is_none());
    }

    #[test]
    fn coefficient_parsing() {
        assert_eq!(parse_coefficient("0,0123"), Some(0.0123));
        assert_eq!(parse_coefficient(" \u{2212}1.5 "), Some(-1.5));
        assert_eq!(parse_coefficient("1,234.5"), Some(1234.5));
        assert_eq!(parse_coefficient("12.3**"), Some(12.3));
        assert_eq!(parse_coefficient("± 0.4"), Some(0.4));
        assert_eq!(parse_coefficient("n.s."), None);
        assert_eq!(parse_coefficient(""), None);
    }

    #[test]
    fn augment_appends_and_blanks_undefined_rows() {
        let rows = table(&[
            &["Panel", "a", "b", "c", "R²"],
            &["A", "100", "2", "0,01", "0.98"],
            &["B", "50", "1", "0", "0.90"],
        ]);
        let out = augment(&rows).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][5..], &DERIVED_HEADERS.map(String::from)[..]);
        assert_eq!(out[1][5], "100.0");
        assert_eq!(out[1][6], "200");
        assert_eq!(out[1][7], "55.3");
        assert_eq!(out[1][8], "180");
        assert_eq!(out[2].len(), 9);
        assert!(out[2][5..].iter().all(String::is_empty));
        assert_eq!(out[2][0], "B");
    }

    #[test]
    fn all_blank_means_unchanged() {
        let rows = table(&[&["a", "b", "c"], &["x", "y", "z"], &["1", "2", "0"]]);
        assert!(augment(&rows).is_none());
    }

    #[test]
    fn non_coefficient_table_is_untouched() {
        let rows = table(&[&["Year", "Yield"], &["2020", "3.1"]]);
        assert!(augment(&rows).is_none());
    }

    #[test]
    fn already_augmented_is_skipped() {
        let rows = table(&[&["a", "b", "c"], &["100", "2", "0.01"]]);
        let once = augment(&rows).unwrap();
        assert!(augment(&once).is_none());
    }
}
