use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::types::{CaseOutput, Dimensions};

/// Value the engine writes for SQL NULL.
pub const NULL_MARKER: &str = "%null%";

/// Parses a result document. Cases are the element children of the root in
/// document order; elements without a `name` attribute are skipped but still
/// advance the position used as the case id.
pub fn parse_results(xml: &str) -> Result<Vec<CaseOutput>> {
    let doc = roxmltree::Document::parse(xml).context("invalid result document")?;
    let mut cases = Vec::new();
    for (id, node) in doc.root_element().children().filter(|n| n.is_element()).enumerate() {
        let Some(name) = node.attribute("name").filter(|n| !n.is_empty()) else {
            continue;
        };
        let child_text = |tag: &str| -> Option<String> {
            node.children()
                .find(|c| c.has_tag_name(tag))
                .map(|c| c.text().unwrap_or_default().to_string())
        };
        let tuples = node.children().find(|c| c.has_tag_name("table")).map(|table| {
            table
                .children()
                .filter(|t| t.has_tag_name("tuple"))
                .flat_map(|t| t.children().filter(|v| v.has_tag_name("value")))
                .map(|v| v.text().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
        });
        cases.push(CaseOutput {
            name: name.to_string(),
            id,
            sql: child_text("sql"),
            query_time: child_text("query-time")
                .and_then(|t| t.trim().parse().ok())
                .unwrap_or(0.0),
            error: child_text("error").filter(|e| !e.is_empty()),
            error_type: child_text("error-type")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            tuples,
        });
    }
    Ok(cases)
}

pub fn load_results(path: &Path) -> Result<Vec<CaseOutput>> {
    let xml = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_results(&xml).with_context(|| format!("failed to parse {}", path.display()))
}

/// Exact string equality, or `|a - b| <= tolerance` when both sides are
/// finite numbers. The null marker only ever matches itself.
pub fn values_match(actual: &str, expected: &str, tolerance: Option<f64>) -> bool {
    if actual == expected {
        return true;
    }
    let Some(eps) = tolerance else {
        return false;
    };
    if actual == NULL_MARKER || expected == NULL_MARKER {
        return false;
    }
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(a), Ok(e)) if a.is_finite() && e.is_finite() => (a - e).abs() <= eps,
        _ => false,
    }
}

/// Per-dimension scores of one actual case against one expected case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseDiff {
    pub sql: usize,
    pub tuples: usize,
    pub error: usize,
    pub text: String,
}

impl CaseDiff {
    pub fn count(&self) -> usize {
        self.sql + self.tuples + self.error
    }
}

/// Scores `actual` against `expected` on the enabled dimensions only. A case
/// with no expected counterpart fails every enabled dimension.
pub fn diff_case(
    actual: &CaseOutput,
    expected: Option<&CaseOutput>,
    dims: Dimensions,
    tolerance: Option<f64>,
) -> CaseDiff {
    let mut diff = CaseDiff::default();
    let Some(expected) = expected else {
        diff.sql = usize::from(dims.sql);
        diff.tuples = if dims.tuples { actual.tuples().len().max(1) } else { 0 };
        diff.error = usize::from(dims.error);
        let _ = writeln!(diff.text, "Test case {} has no expected counterpart.", actual.name);
        return diff;
    };

    if dims.sql {
        diff.sql = diff_sql(actual.sql.as_deref(), expected.sql.as_deref(), &mut diff.text);
    }
    if dims.tuples {
        diff.tuples = diff_tuples(actual, expected, tolerance, &mut diff.text);
    }
    if dims.error {
        diff.error = diff_error(actual.error.as_deref(), expected.error.as_deref(), &mut diff.text);
    }
    diff
}

fn diff_sql(actual: Option<&str>, expected: Option<&str>, out: &mut String) -> usize {
    if actual == expected {
        return 0;
    }
    out.push_str("SQL\n");
    let _ = writeln!(out, "<<<<\n{}", actual.unwrap_or_default());
    let _ = writeln!(out, ">>>>\n{}", expected.unwrap_or_default());
    1
}

fn diff_tuples(actual: &CaseOutput, expected: &CaseOutput, tolerance: Option<f64>, out: &mut String) -> usize {
    let (a, e) = match (&actual.tuples, &expected.tuples) {
        (None, None) => return 0,
        (Some(a), Some(e)) => (a.as_slice(), e.as_slice()),
        (a, e) => {
            out.push_str("Tuples do not exist for one side.\n");
            let len = |t: &Option<Vec<String>>| t.as_ref().map_or(0, Vec::len);
            return len(a).abs_diff(len(e)).max(1);
        }
    };

    if a.len() != e.len() {
        out.push_str("Different number of tuples.\n");
    }
    if a.is_empty() {
        out.push_str("No 'actual' file tuples.\n");
    }
    out.push_str("Tuples\n");

    let mut count = a.len().abs_diff(e.len());
    for (av, ev) in a.iter().zip(e) {
        if !values_match(av, ev, tolerance) {
            count += 1;
            let _ = writeln!(out, " <<<< >>>> \n{av}\n{ev}");
        }
    }
    count
}

/// The expected error text must be contained in the actual one. When no
/// error is expected the actual case must not have one either.
fn diff_error(actual: Option<&str>, expected: Option<&str>, out: &mut String) -> usize {
    let matched = match (actual, expected) {
        (_, Some(e)) if e.trim().is_empty() => is_blank(actual),
        (Some(a), Some(e)) => a.contains(e.trim()),
        (None, Some(_)) => false,
        (a, None) => is_blank(a),
    };
    if matched {
        return 0;
    }
    out.push_str("Error\n");
    let _ = writeln!(out, "<<<<\n{}", actual.unwrap_or_default());
    let _ = writeln!(out, ">>>>\n{}", expected.unwrap_or_default());
    1
}

fn is_blank(s: Option<&str>) -> bool {
    s.map_or(true, |s| s.trim().is_empty())
}
