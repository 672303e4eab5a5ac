use anyhow::{Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::paths::{FixturePaths, expected_candidates, expected_file_name};
use crate::plan::{Invocation, TestFile, TestKind};
use crate::results::{CaseDiff, diff_case, load_results};
use crate::types::{CaseOutput, ErrorState, TestCaseResult, TestResult};

/// Closest expected version found so far for one case.
#[derive(Clone)]
struct Scored {
    version: usize,
    diff: CaseDiff,
    expected: Option<CaseOutput>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Scores the actual file of one fixture against every expected candidate
/// and keeps the closest match per case and for the whole document.
pub fn compare_test(paths: &FixturePaths, test_file: &TestFile, invocation: &Invocation) -> TestResult {
    let kind = invocation.kind();
    let dims = invocation.dimensions();
    let mut result = TestResult::new(file_name(&test_file.path), &test_file.path, kind, dims);
    result.relative_test_file = test_file.relative_path.clone();
    result.path_to_actual = Some(paths.actual.clone());

    if !paths.actual.is_file() {
        debug!("Did not find actual file: {}", paths.actual.display());
        return mark_missing(result);
    }
    let actual = match load_results(&paths.actual) {
        Ok(cases) if !cases.is_empty() => cases,
        Ok(_) => {
            debug!("Actual file {} has no test cases", paths.actual.display());
            return mark_missing(result);
        }
        Err(e) => {
            debug!("Exception parsing actual file {}: {:#}", paths.actual.display(), e);
            return mark_missing(result);
        }
    };
    result.run_time_ms = actual.iter().map(|c| c.query_time).sum();

    let mut candidate_paths = expected_candidates(&paths.expected_dir, &paths.test_name);
    if candidate_paths.is_empty() && invocation.always_generate_expected {
        let target = paths.expected_dir.join(expected_file_name(&paths.test_name, 0));
        debug!("Copying actual [{}] to expected [{}]", paths.actual.display(), target.display());
        match fs::copy(&paths.actual, &target) {
            Ok(_) => candidate_paths.push(target),
            Err(e) => debug!("Could not create expected file {}: {}", target.display(), e),
        }
    }
    if candidate_paths.is_empty() {
        debug!("Did not find expected file for {}", paths.test_name);
        return fail_with_actual(result, actual, ErrorState::Other);
    }

    let tolerance = invocation.tolerance;
    let mut per_case: Vec<Option<Scored>> = vec![None; actual.len()];
    let mut best_doc: Option<(usize, PathBuf, usize)> = None;

    for (version, path) in candidate_paths.into_iter().enumerate() {
        let expected = match load_results(&path) {
            Ok(cases) => cases,
            Err(e) => {
                debug!("Exception parsing expected file {}: {:#}", path.display(), e);
                continue;
            }
        };
        debug!("Comparing {} to {}", paths.actual.display(), path.display());

        let mut total = 0;
        for (i, case) in actual.iter().enumerate() {
            let diff = diff_case(case, expected.get(i), dims, tolerance);
            let count = diff.count();
            total += count;
            if per_case[i].as_ref().map_or(true, |best| count < best.diff.count()) {
                per_case[i] = Some(Scored {
                    version,
                    diff,
                    expected: expected.get(i).cloned(),
                });
            }
        }

        if best_doc.as_ref().map_or(true, |(_, _, best_total)| total < *best_total) {
            best_doc = Some((version, path, total));
        }

        let settled = per_case.iter().all(|c| c.as_ref().is_some_and(|s| s.diff.count() == 0));
        if settled || total == 0 {
            break;
        }
    }

    let Some((best_version, best_path, _)) = best_doc else {
        debug!("No expected file for {} could be parsed", paths.test_name);
        return fail_with_actual(result, actual, ErrorState::Other);
    };

    let mut diff_text = String::new();
    result.cases = actual
        .into_iter()
        .zip(per_case)
        .map(|(output, scored)| {
            let mut case = TestCaseResult::new(output, dims);
            if let Some(scored) = scored {
                case.passed_sql = scored.diff.sql == 0;
                case.passed_tuples = scored.diff.tuples == 0;
                case.passed_error = scored.diff.error == 0;
                case.diff_count = scored.diff.count();
                case.matched_version = Some(scored.version);
                case.expected = scored.expected;
                if case.diff_count > 0 {
                    diff_text.push_str(&format!(
                        "Test case [{}] against expected version {}\n",
                        case.name(),
                        scored.version
                    ));
                    diff_text.push_str(&scored.diff.text);
                }
            }
            case
        })
        .collect();
    result.matched_expected_version = best_version;
    result.diff_count = result.cases.iter().map(|c| c.diff_count).sum();
    result.path_to_expected = Some(best_path);

    let diff_file = paths.diff();
    if result.all_passed() {
        debug!("Results match expected number: {}", best_version);
        if !invocation.verbose && !invocation.leave_temp_dir {
            let _ = fs::remove_file(&paths.actual);
            let _ = fs::remove_file(&diff_file);
        }
    } else {
        result.error_state = Some(ErrorState::ResultMismatch);
        save_diff(&result, &diff_text, &diff_file);
    }
    result
}

fn mark_missing(mut result: TestResult) -> TestResult {
    result.error_state = Some(ErrorState::MissingActual);
    result.fill_placeholders(ErrorState::MissingActual);
    result
}

fn fail_with_actual(mut result: TestResult, actual: Vec<CaseOutput>, state: ErrorState) -> TestResult {
    let dims = result.dims;
    result.error_state = Some(state);
    result.cases = actual.into_iter().map(|c| TestCaseResult::new(c, dims)).collect();
    result
}

/// Writes the per-case diff text next to the actual file.
fn save_diff(result: &TestResult, diff_text: &str, diff_file: &Path) {
    let actual_path = result.path_to_actual.as_deref().unwrap_or(Path::new(""));
    let expected_path = result.path_to_expected.as_deref().unwrap_or(Path::new(""));
    let text = format!(
        "Diff of [{}] and [{}].\n{}",
        actual_path.display(),
        expected_path.display(),
        diff_text
    );
    debug!("Saving diff of actual and expected as [{}]", diff_file.display());
    if let Err(e) = fs::write(diff_file, text) {
        debug!("Could not write diff file {}: {}", diff_file.display(), e);
    }
}

/// Diff count of an existing actual file against every expected candidate,
/// without running the engine.
pub fn diff_test(fixture: &Path, kind: TestKind, output_dir: &Path, invocation: &Invocation) -> Result<Vec<(PathBuf, usize)>> {
    let paths = FixturePaths::for_fixture(kind, fixture, output_dir);
    let actual = load_results(&paths.actual)?;
    let candidates = expected_candidates(&paths.expected_dir, &paths.test_name);
    if candidates.is_empty() {
        return Err(anyhow!(
            "no expected files for {} in {}",
            paths.test_name,
            paths.expected_dir.display()
        ));
    }
    let dims = invocation.dimensions();
    let mut counts = Vec::new();
    for path in candidates {
        let expected = load_results(&path)?;
        let total = actual
            .iter()
            .enumerate()
            .map(|(i, case)| diff_case(case, expected.get(i), dims, invocation.tolerance).count())
            .sum::<usize>();
        counts.push((path, total));
    }
    Ok(counts)
}
