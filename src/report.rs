use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::FileOptions;

use crate::backend::ENGINE_OUTPUT_FILE;
use crate::plan::{Invocation, WorkItem};
use crate::scheduler::PhaseReport;
use crate::types::{Outcome, TestResult, Totals};
use crate::work::CompletedWork;

pub const ITEM_CSV: &str = "test_results.csv";
pub const ITEM_JSON: &str = "test_output.json";
pub const COMBINED_CSV: &str = "test_results_combined.csv";
pub const COMBINED_JSON: &str = "test_output_combined.json";
pub const ACTUALS_ZIP: &str = "actuals_combined.zip";
pub const LOGS_ZIP: &str = "engine_logs_combined.zip";

/// Values per test case kept in the tuple columns.
pub const TUPLE_DISPLAY_LIMIT: usize = 100;
/// Characters of engine output kept in the process output column.
pub const PROCESS_OUTPUT_LIMIT: usize = 4096;

const HARNESS_NAME: &str = "DSVERIFY";

pub fn csv_header(invocation: &Invocation) -> Vec<String> {
    let tuples = format!("({TUPLE_DISPLAY_LIMIT})tuples");
    let mut header: Vec<String> = [
        "Suite",
        "Test Set",
        "TDSName",
        "TestName",
        "TestPath",
        "Passed",
        "Closest Expected",
        "Diff count",
        "Test Case",
        "Test Type",
        "Process Output",
        "Error Msg",
        "Error Type",
        "Query Time (ms)",
        "Generated SQL",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.push(format!("Actual {tuples}"));
    header.push(format!("Expected {tuples}"));
    if invocation.tested_sql {
        header.push("Expected SQL".into());
        header.push("Expected Query Time (ms)".into());
    }
    if invocation.tested_error {
        header.push("Actual Error".into());
        header.push("Expected Error".into());
    }
    header
}

fn truncate_output(output: &str) -> String {
    match output.char_indices().nth(PROCESS_OUTPUT_LIMIT) {
        Some((cut, _)) => format!("{}<output_truncated>", &output[..cut]),
        None => output.to_string(),
    }
}

fn joined_tuples(values: &[String]) -> String {
    values.iter().take(TUPLE_DISPLAY_LIMIT).cloned().collect::<Vec<_>>().join("\n")
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// One row per test case, or a single summary row when the result has no cases.
pub fn csv_rows(item: &WorkItem, result: &TestResult) -> Vec<Vec<String>> {
    let inv = &item.invocation;
    let prefix = vec![
        inv.suite_name.clone(),
        inv.config_file.clone(),
        file_name(&inv.tds),
        result.display_name().to_string(),
        result.relative_test_file.clone(),
    ];
    let test_type = result.kind.label().to_string();
    let cmd_output = truncate_output(&result.cmd_output);

    if result.cases.is_empty() {
        let message = result.failure_message();
        let mut row = prefix;
        row.extend([
            result.all_passed().to_string(),
            String::new(),
            String::new(),
            String::new(),
            test_type,
            cmd_output,
            message.clone(),
            message,
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ]);
        if inv.tested_sql {
            row.extend([String::new(), String::new()]);
        }
        if inv.tested_error {
            row.extend([String::new(), String::new()]);
        }
        return vec![row];
    }

    let outcome = result.outcome();
    result
        .cases
        .iter()
        .map(|case| {
            let passed = result.case_passed(case);
            let expected = case.expected.as_ref();
            let (error_msg, error_type) = if passed && outcome == Outcome::Passed {
                (String::new(), String::new())
            } else {
                let msg = result.saved_error_message.clone().unwrap_or_else(|| {
                    let m = case.error_message();
                    if m.is_empty() { result.failure_message() } else { m }
                });
                (msg, result.error_type())
            };

            let mut row = prefix.clone();
            row.extend([
                passed.to_string(),
                case.matched_version.map(|v| v.to_string()).unwrap_or_default(),
                case.diff_count.to_string(),
                case.name().to_string(),
                test_type.clone(),
                cmd_output.clone(),
                error_msg,
                error_type,
                case.output.query_time.to_string(),
                case.output.sql.clone().unwrap_or_default(),
                joined_tuples(case.output.tuples()),
                expected.map(|e| joined_tuples(e.tuples())).unwrap_or_default(),
            ]);
            if inv.tested_sql {
                row.push(expected.and_then(|e| e.sql.clone()).unwrap_or_default());
                row.push(expected.map(|e| e.query_time.to_string()).unwrap_or_default());
            }
            if inv.tested_error {
                row.push(case.output.error.clone().unwrap_or_default());
                row.push(expected.and_then(|e| e.error.clone()).unwrap_or_default());
            }
            row
        })
        .collect()
}

/// JSON view of one [`TestResult`]. Failed records carry enough to replay the test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRecord {
    pub suite: String,
    pub class: String,
    pub test_name: String,
    pub duration: f64,
    pub case: String,
    pub test_file: String,
    pub test_type: String,
    pub test_config: Invocation,
    pub tds: String,
    #[serde(default)]
    pub password_file: Option<String>,
    #[serde(default)]
    pub expected_message: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl JsonRecord {
    /// Same fixture run against the same TDS in the same mode.
    pub fn same_test(&self, other: &JsonRecord) -> bool {
        self.test_file == other.test_file && self.tds == other.tds && self.test_type == other.test_type
    }

    pub fn new(item: &WorkItem, result: &TestResult) -> Self {
        let inv = &item.invocation;
        let name = result.display_name().to_string();
        let mut case = name.clone();
        if !result.kind.is_logical() {
            let mut failing: Vec<&str> = result
                .cases
                .iter()
                .filter(|c| !result.case_passed(c))
                .map(|c| c.name())
                .collect();
            failing.sort_unstable();
            if !failing.is_empty() {
                case = format!("{}:{}", name, failing.join(","));
            }
        }

        let mut record = JsonRecord {
            suite: inv.suite_name.clone(),
            class: HARNESS_NAME.to_string(),
            test_name: format!("{}.{}", inv.suite_name, name),
            duration: result.run_time_ms,
            case,
            test_file: result.relative_test_file.clone(),
            test_type: result.kind.flag().to_string(),
            test_config: inv.clone(),
            tds: inv.tds.clone(),
            password_file: item.test_set.password_file.clone(),
            expected_message: item.test_set.expected_message.clone(),
            expected: result.path_to_expected.as_ref().map(|p| p.to_string_lossy().into_owned()),
            failtype: None,
            message: None,
            actual: None,
        };
        if !result.all_passed() {
            let exceptions = result.exceptions();
            record.failtype = Some(if exceptions.is_empty() {
                "test_failure".to_string()
            } else {
                exceptions.join(",")
            });
            record.message = Some(result.failure_message_or_case_errors());
            record.actual = result.path_to_actual.as_ref().map(|p| p.to_string_lossy().into_owned());
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonReport {
    pub harness_name: String,
    pub actual_exp_paths_relative_to: String,
    #[serde(default)]
    pub successful_tests: Vec<JsonRecord>,
    #[serde(default)]
    pub disabled_tests: Vec<JsonRecord>,
    #[serde(default)]
    pub skipped_tests: Vec<JsonRecord>,
    #[serde(default)]
    pub failed_tests: Vec<JsonRecord>,
}

impl Default for JsonReport {
    fn default() -> Self {
        Self {
            harness_name: HARNESS_NAME.to_string(),
            actual_exp_paths_relative_to: "this".to_string(),
            successful_tests: Vec::new(),
            disabled_tests: Vec::new(),
            skipped_tests: Vec::new(),
            failed_tests: Vec::new(),
        }
    }
}

impl JsonReport {
    pub fn from_results(item: &WorkItem, results: &[TestResult]) -> Self {
        let mut report = JsonReport::default();
        for r in results {
            let record = JsonRecord::new(item, r);
            match r.outcome() {
                Outcome::Disabled => report.disabled_tests.push(record),
                Outcome::Skipped => report.skipped_tests.push(record),
                Outcome::Passed => report.successful_tests.push(record),
                Outcome::Failed => report.failed_tests.push(record),
            }
        }
        report
    }

    /// Appends every list of `other` without touching existing entries.
    pub fn extend(&mut self, other: JsonReport) {
        self.successful_tests.extend(other.successful_tests);
        self.disabled_tests.extend(other.disabled_tests);
        self.skipped_tests.extend(other.skipped_tests);
        self.failed_tests.extend(other.failed_tests);
    }

    /// Merges a later run into this report. Earlier failures of tests the
    /// later run passed are dropped.
    pub fn merge(&mut self, newer: JsonReport) {
        self.failed_tests
            .retain(|f| !newer.successful_tests.iter().any(|s| s.same_test(f)));
        self.extend(newer);
    }
}

/// Writes the per-item CSV and JSON into the item's output dir.
pub fn write_item_reports(output_dir: &Path, item: &WorkItem, results: &[TestResult]) -> Result<()> {
    let csv_path = output_dir.join(ITEM_CSV);
    let mut writer = csv::Writer::from_path(&csv_path).with_context(|| format!("failed to create {}", csv_path.display()))?;
    if !item.invocation.noheader {
        writer.write_record(csv_header(&item.invocation))?;
    }
    for r in results {
        for row in csv_rows(item, r) {
            writer.write_record(&row)?;
        }
    }
    writer.flush()?;

    let json_path = output_dir.join(ITEM_JSON);
    let json = serde_json::to_string(&JsonReport::from_results(item, results))?;
    fs::write(&json_path, json).with_context(|| format!("failed to write {}", json_path.display()))?;
    Ok(())
}

/// What a merge left behind.
#[derive(Debug, Default)]
pub struct MergeSummary {
    pub items: usize,
    pub rows: usize,
    /// Temp dirs kept because the run asked to leave them.
    pub kept_dirs: Vec<PathBuf>,
}

/// Folds per-item artifacts into run-wide files under `output_root`.
#[derive(Debug, Clone)]
pub struct ReportAggregator {
    pub output_root: PathBuf,
}

impl ReportAggregator {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    pub fn csv_path(&self) -> PathBuf {
        self.output_root.join(COMBINED_CSV)
    }

    pub fn json_path(&self) -> PathBuf {
        self.output_root.join(COMBINED_JSON)
    }

    pub fn actuals_zip_path(&self) -> PathBuf {
        self.output_root.join(ACTUALS_ZIP)
    }

    pub fn logs_zip_path(&self) -> PathBuf {
        self.output_root.join(LOGS_ZIP)
    }

    /// Removes artifacts of a previous run.
    pub fn reset(&self) -> Result<()> {
        for path in [self.csv_path(), self.json_path(), self.actuals_zip_path(), self.logs_zip_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
            }
        }
        Ok(())
    }

    /// Single threaded merge of every completed item, then temp dir cleanup.
    pub fn merge(&self, completed: Vec<CompletedWork>) -> Result<MergeSummary> {
        fs::create_dir_all(&self.output_root)
            .with_context(|| format!("failed to create {}", self.output_root.display()))?;
        let mut summary = MergeSummary::default();
        let mut json = self.load_json()?;
        let mut run_json = JsonReport::default();
        let csv_path = self.csv_path();
        let write_header = !csv_path.is_file() || fs::metadata(&csv_path).map(|m| m.len() == 0).unwrap_or(true);
        let csv_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)
            .with_context(|| format!("failed to open {}", csv_path.display()))?;
        let mut csv_out = csv::Writer::from_writer(csv_file);
        let mut header_written = !write_header;
        let mut actuals = ArchiveWriter::new(self.actuals_zip_path());
        let mut logs = ArchiveWriter::new(self.logs_zip_path());

        for work in completed {
            summary.items += 1;
            let item = &work.item;
            if !header_written {
                csv_out.write_record(csv_header(&item.invocation))?;
                header_written = true;
            }

            let dir = work.output_dir().map(Path::to_path_buf);
            let from_disk = dir.as_deref().and_then(|d| read_item_rows(&d.join(ITEM_CSV), !item.invocation.noheader));
            let rows = from_disk.unwrap_or_else(|| work.results.iter().flat_map(|r| csv_rows(item, r)).collect());
            for row in &rows {
                csv_out.write_record(row)?;
            }
            summary.rows += rows.len();

            let item_json = dir
                .as_deref()
                .and_then(|d| read_item_json(&d.join(ITEM_JSON)))
                .unwrap_or_else(|| JsonReport::from_results(item, &work.results));
            run_json.extend(item_json);

            if let Some(d) = dir.as_deref() {
                let folder = item.log_dir_name();
                actuals.add_matching(d, &folder, |rel| is_actual_file(rel))?;
                logs.add_matching(&d.join(&folder), &folder, |rel| is_log_file(rel))?;
            }

            if let Some(ws) = work.workspace {
                if item.invocation.leave_temp_dir {
                    summary.kept_dirs.push(ws.keep());
                } else if let Err(e) = ws.close() {
                    warn!("Could not remove temp dir: {}", e);
                }
            }
        }

        json.merge(run_json);
        csv_out.flush()?;
        actuals.finish()?;
        logs.finish()?;
        let json_path = self.json_path();
        fs::write(&json_path, serde_json::to_string(&json)?)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        Ok(summary)
    }

    fn load_json(&self) -> Result<JsonReport> {
        let path = self.json_path();
        if !path.is_file() {
            return Ok(JsonReport::default());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid report {}", path.display()))
    }
}

fn read_item_rows(path: &Path, has_header: bool) -> Option<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(has_header).flexible(true).from_path(path).ok()?;
    let mut rows = Vec::new();
    for record in reader.records() {
        match record {
            Ok(r) => rows.push(r.iter().map(str::to_string).collect()),
            Err(e) => {
                debug!("Bad row in {}: {}", path.display(), e);
                return None;
            }
        }
    }
    Some(rows)
}

fn read_item_json(path: &Path) -> Option<JsonReport> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn is_actual_file(rel: &Path) -> bool {
    rel.components().count() == 1
        && rel
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("actual."))
}

fn is_log_file(rel: &Path) -> bool {
    if rel.components().any(|c| c.as_os_str() == "crashdumps") {
        return true;
    }
    let Some(name) = rel.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name == ENGINE_OUTPUT_FILE || (name.starts_with("log") && name.ends_with(".txt"))
}

/// Lazily opened zip that appends to an existing archive.
struct ArchiveWriter {
    path: PathBuf,
    zip: Option<ZipWriter<File>>,
}

impl ArchiveWriter {
    fn new(path: PathBuf) -> Self {
        Self { path, zip: None }
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<File>> {
        if self.zip.is_none() {
            let zip = if self.path.is_file() {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.path)
                    .with_context(|| format!("failed to open {}", self.path.display()))?;
                ZipWriter::new_append(file).with_context(|| format!("failed to append to {}", self.path.display()))?
            } else {
                let file = File::create(&self.path).with_context(|| format!("failed to create {}", self.path.display()))?;
                ZipWriter::new(file)
            };
            self.zip = Some(zip);
        }
        self.zip
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("archive {} not open", self.path.display()))
    }

    /// Adds every file under `dir` accepted by `keep` as `<folder>/<relative path>`.
    fn add_matching(&mut self, dir: &Path, folder: &str, keep: impl Fn(&Path) -> bool) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(dir) else {
                continue;
            };
            if !keep(rel) {
                continue;
            }
            let name = format!("{}/{}", folder, rel.to_string_lossy().replace('\\', "/"));
            let mut src = File::open(entry.path()).with_context(|| format!("failed to open {}", entry.path().display()))?;
            let zip = self.writer()?;
            zip.start_file(name, FileOptions::default())?;
            io::copy(&mut src, zip)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        if let Some(mut zip) = self.zip.take() {
            zip.finish().with_context(|| format!("failed to finish {}", self.path.display()))?;
        }
        Ok(())
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!("{secs:.1}s")
    }
}

pub fn render_totals(totals: &Totals) -> String {
    format!(
        "Total: {}, Passed: {}, Failed: {}, Skipped: {}, Disabled: {}",
        totals.total,
        totals.passed.to_string().green(),
        if totals.failed > 0 {
            totals.failed.to_string().red().bold().to_string()
        } else {
            totals.failed.to_string().green().to_string()
        },
        if totals.skipped > 0 {
            totals.skipped.to_string().yellow().to_string()
        } else {
            totals.skipped.to_string()
        },
        totals.disabled
    )
}

pub fn render_phase_summary(label: &str, phase: &PhaseReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} ({} items, {} workers, {})\n",
        format!("[{label}]").bold(),
        render_totals(&phase.totals),
        phase.completed.len(),
        phase.workers,
        format_elapsed(phase.elapsed)
    ));
    for work in phase.completed.iter().filter(|w| w.failed()) {
        for r in work.results.iter().filter(|r| r.outcome() == Outcome::Failed) {
            let reason = r.error_state.map(|s| s.message()).unwrap_or("No results found.");
            out.push_str(&format!(
                "  {} {} {}\n",
                "[FAIL]".red().bold(),
                format!("{}/{}", work.item.test_set.config_name, r.display_name()).red(),
                reason
            ));
        }
    }
    out
}

pub fn print_phase_summary(label: &str, phase: &PhaseReport) {
    print!("{}", render_phase_summary(label, phase));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_output_is_truncated() {
        let long = "x".repeat(PROCESS_OUTPUT_LIMIT + 10);
        let out = truncate_output(&long);
        assert!(out.ends_with("<output_truncated>"));
        assert_eq!(out.len(), PROCESS_OUTPUT_LIMIT + "<output_truncated>".len());
        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn log_and_actual_filters() {
        assert!(is_actual_file(Path::new("actual.setup.math.txt")));
        assert!(!is_actual_file(Path::new("sub/actual.setup.math.txt")));
        assert!(is_log_file(Path::new("log_1.txt")));
        assert!(is_log_file(Path::new("engine_output.txt")));
        assert!(is_log_file(Path::new("crashdumps/dump.dmp")));
        assert!(!is_log_file(Path::new("tests.txt")));
    }

    #[test]
    fn optional_columns_follow_dimensions() {
        let mut inv = Invocation::default();
        assert_eq!(csv_header(&inv).len(), 17);
        inv.tested_sql = true;
        inv.tested_error = true;
        assert_eq!(csv_header(&inv).len(), 21);
    }
}
