use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::plan::TestKind;

/// Terminal classification of an item (or a case inside it) that did not
/// run to a normal, passing completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorState {
    Timeout,
    Aborted,
    Disabled,
    Skipped,
    ExpectedFailure,
    ResultMismatch,
    MissingActual,
    Other,
}

impl ErrorState {
    pub fn message(self) -> &'static str {
        match self {
            ErrorState::Timeout => "Test timed out.",
            ErrorState::Aborted => "Test was aborted.",
            ErrorState::Disabled => "Test disabled in plan.",
            ErrorState::Skipped => "Test not run because smoke tests failed.",
            ErrorState::ExpectedFailure => "Error is expected.",
            ErrorState::ResultMismatch => "Actual does not match expected.",
            ErrorState::MissingActual => "No actual file.",
            ErrorState::Other => "Error.",
        }
    }

    /// Single character progress marker.
    pub fn marker(self) -> char {
        match self {
            ErrorState::Timeout => 'T',
            ErrorState::Aborted => 'A',
            ErrorState::Disabled => 'D',
            ErrorState::Skipped => 'S',
            ErrorState::ExpectedFailure => '.',
            ErrorState::ResultMismatch => 'F',
            ErrorState::MissingActual => '?',
            ErrorState::Other => 'E',
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorState::Timeout => "timeout",
            ErrorState::Aborted => "aborted",
            ErrorState::Disabled => "disabled",
            ErrorState::Skipped => "skipped",
            ErrorState::ExpectedFailure => "expected_failure",
            ErrorState::ResultMismatch => "result_mismatch",
            ErrorState::MissingActual => "missing_actual",
            ErrorState::Other => "other",
        }
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Which comparison dimensions a run checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub sql: bool,
    pub tuples: bool,
    pub error: bool,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            sql: false,
            tuples: true,
            error: false,
        }
    }
}

/// One `<test>` element of a result document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaseOutput {
    pub name: String,
    pub id: usize,
    pub sql: Option<String>,
    pub query_time: f64,
    pub error: Option<String>,
    pub error_type: Option<String>,
    /// Flattened `<value>` texts of every `<tuple>`; `None` when the case has no `<table>`.
    pub tuples: Option<Vec<String>>,
}

impl CaseOutput {
    pub fn tuples(&self) -> &[String] {
        self.tuples.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseResult {
    pub output: CaseOutput,
    pub dims: Dimensions,
    pub passed_sql: bool,
    pub passed_tuples: bool,
    pub passed_error: bool,
    pub diff_count: usize,
    /// Expected file version this case was scored against.
    pub matched_version: Option<usize>,
    /// The expected case from that version, when it had one at this position.
    pub expected: Option<CaseOutput>,
    /// Set on placeholder cases that were never compared.
    pub error_state: Option<ErrorState>,
}

impl TestCaseResult {
    pub fn new(output: CaseOutput, dims: Dimensions) -> Self {
        Self {
            output,
            dims,
            passed_sql: false,
            passed_tuples: false,
            passed_error: false,
            diff_count: 0,
            matched_version: None,
            expected: None,
            error_state: None,
        }
    }

    pub fn placeholder(name: impl Into<String>, id: usize, state: ErrorState, dims: Dimensions) -> Self {
        let output = CaseOutput {
            name: name.into(),
            id,
            ..CaseOutput::default()
        };
        Self {
            error_state: Some(state),
            ..Self::new(output, dims)
        }
    }

    pub fn name(&self) -> &str {
        &self.output.name
    }

    pub fn all_passed(&self) -> bool {
        match self.error_state {
            Some(ErrorState::ExpectedFailure) => return true,
            Some(_) => return false,
            None => {}
        }
        (!self.dims.sql || self.passed_sql)
            && (!self.dims.tuples || self.passed_tuples)
            && (!self.dims.error || self.passed_error)
    }

    pub fn error_message(&self) -> String {
        if let Some(err) = self.output.error.as_deref().filter(|e| !e.trim().is_empty()) {
            return err.to_string();
        }
        if let Some(state) = self.error_state {
            return state.message().to_string();
        }
        if !self.all_passed() {
            return ErrorState::ResultMismatch.message().to_string();
        }
        String::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Disabled,
}

/// Aggregate for one fixture file of a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub name: String,
    pub test_file: PathBuf,
    pub relative_test_file: String,
    pub kind: TestKind,
    pub dims: Dimensions,
    pub cases: Vec<TestCaseResult>,
    pub error_state: Option<ErrorState>,
    pub saved_error_message: Option<String>,
    /// Expected file with the lowest total diff.
    pub matched_expected_version: usize,
    /// Sum of the per-case best diff counts.
    pub diff_count: usize,
    pub path_to_expected: Option<PathBuf>,
    pub path_to_actual: Option<PathBuf>,
    pub cmd_output: String,
    pub run_time_ms: f64,
}

impl TestResult {
    pub fn new(name: impl Into<String>, test_file: impl Into<PathBuf>, kind: TestKind, dims: Dimensions) -> Self {
        Self {
            name: name.into(),
            test_file: test_file.into(),
            relative_test_file: String::new(),
            kind,
            dims,
            cases: Vec::new(),
            error_state: None,
            saved_error_message: None,
            matched_expected_version: 0,
            diff_count: 0,
            path_to_expected: None,
            path_to_actual: None,
            cmd_output: String::new(),
            run_time_ms: 0.0,
        }
    }

    /// Result for a fixture that never produced per-case output. Logical tests
    /// get a single case; expression tests get one case per non-blank,
    /// non-comment line of the fixture.
    pub fn not_run(
        name: impl Into<String>,
        test_file: impl Into<PathBuf>,
        kind: TestKind,
        dims: Dimensions,
        state: ErrorState,
    ) -> Self {
        let mut result = Self::new(name, test_file, kind, dims);
        result.error_state = Some(state);
        result.fill_placeholders(state);
        result
    }

    pub fn fill_placeholders(&mut self, state: ErrorState) {
        self.cases = match self.kind {
            TestKind::Logical => vec![TestCaseResult::placeholder(state.message(), 0, state, self.dims)],
            TestKind::Expression => expression_lines(&self.test_file)
                .into_iter()
                .enumerate()
                .map(|(id, line)| TestCaseResult::placeholder(line, id, state, self.dims))
                .collect(),
        };
    }

    /// Name without the `setup.` prefix and the three letter extension.
    pub fn display_name(&self) -> &str {
        let Some(rest) = self.name.strip_prefix("setup.") else {
            return &self.name;
        };
        match rest.rsplit_once('.') {
            Some((stem, ext)) if ext.len() == 3 && ext.chars().all(|c| c.is_ascii_alphabetic()) => stem,
            _ => &self.name,
        }
    }

    pub fn all_passed(&self) -> bool {
        match self.error_state {
            Some(ErrorState::ExpectedFailure) => true,
            None | Some(ErrorState::ResultMismatch) => {
                !self.cases.is_empty() && self.cases.iter().all(|c| c.all_passed())
            }
            Some(_) => false,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self.error_state {
            Some(ErrorState::Disabled) => Outcome::Disabled,
            Some(ErrorState::Skipped) => Outcome::Skipped,
            _ if self.all_passed() => Outcome::Passed,
            _ => Outcome::Failed,
        }
    }

    pub fn case_passed(&self, case: &TestCaseResult) -> bool {
        self.error_state == Some(ErrorState::ExpectedFailure) || case.all_passed()
    }

    pub fn failure_count(&self) -> usize {
        self.cases.iter().filter(|c| !self.case_passed(c)).count()
    }

    pub fn failure_message(&self) -> String {
        if let Some(saved) = &self.saved_error_message {
            return saved.clone();
        }
        match self.error_state {
            Some(state) => state.message().to_string(),
            None => "No results found.".to_string(),
        }
    }

    pub fn failure_message_or_case_errors(&self) -> String {
        let mut msg = String::new();
        for case in &self.cases {
            let case_msg = case.error_message();
            if !case_msg.is_empty() {
                msg.push_str(&case_msg);
                msg.push('\n');
            }
        }
        if msg.is_empty() { self.failure_message() } else { msg }
    }

    /// Error types of the failing cases, only when no item level error applies.
    pub fn exceptions(&self) -> Vec<String> {
        if self.error_state.is_some_and(|s| s != ErrorState::ResultMismatch) {
            return Vec::new();
        }
        self.cases
            .iter()
            .filter(|c| !c.all_passed())
            .filter_map(|c| c.output.error_type.clone())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn error_type(&self) -> String {
        let exceptions = self.exceptions();
        if !exceptions.is_empty() {
            return exceptions.join(",");
        }
        self.error_state.map(|s| s.code().to_string()).unwrap_or_default()
    }
}

fn expression_lines(test_file: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(test_file) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .map(str::to_string)
        .collect()
}

/// Per test case counts for a phase or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub disabled: usize,
}

impl Totals {
    pub fn record(&mut self, result: &TestResult) {
        let outcome = result.outcome();
        if result.cases.is_empty() {
            self.count(outcome);
            return;
        }
        for case in &result.cases {
            match outcome {
                Outcome::Disabled | Outcome::Skipped => self.count(outcome),
                _ if result.case_passed(case) => self.count(Outcome::Passed),
                _ => self.count(Outcome::Failed),
            }
        }
    }

    fn count(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Disabled => self.disabled += 1,
        }
    }
}

impl std::ops::AddAssign for Totals {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.disabled += other.disabled;
    }
}
