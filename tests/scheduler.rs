mod common;

use common::{MockEngine, expression_fixture, expression_item, result_doc};
use dsverify::backend::EngineError;
use dsverify::command::Platform;
use dsverify::scheduler::{Halt, Scheduler, SchedulerOptions};
use dsverify::types::ErrorState;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

fn options(max_workers: usize) -> SchedulerOptions {
    SchedulerOptions {
        max_workers,
        ..SchedulerOptions::default()
    }
}

fn good_doc() -> String {
    result_doc(&[("1+1", &["2"])])
}

fn bad_doc() -> String {
    result_doc(&[("1+1", &["3"])])
}

/// One expression group per name, each with one fixture `setup.<group>.txt`
/// expecting `2`.
fn groups(root: &Path, names: &[&str]) {
    for g in names {
        expression_fixture(root, g, g, &["1+1"], &[good_doc()]);
    }
}

#[test]
fn all_items_pass() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["math", "string"]);
    let items = vec![
        expression_item(root, "pg", "math", false),
        expression_item(root, "pg", "string", false),
    ];

    let engine = MockEngine::answering(good_doc());
    let report = Scheduler::new(options(2)).run(items, &engine);

    assert_eq!(report.halted, None);
    assert_eq!(engine.call_count(), 2);
    let totals = report.totals();
    assert_eq!(totals.total, 2);
    assert_eq!(totals.passed, 2);
    assert_eq!(totals.failed, 0);
    let completed: Vec<_> = report.completed().collect();
    assert_eq!(completed[0].item.test_set.config_name, "expression.math.pg");
    assert_eq!(completed[1].item.test_set.config_name, "expression.string.pg");
    assert!(completed.iter().all(|w| w.output_dir().is_some()));
}

#[test]
fn required_smoke_tests_must_exist() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["math"]);
    let items = vec![expression_item(root, "pg", "math", false)];

    let engine = MockEngine::answering(good_doc());
    let opts = SchedulerOptions {
        require_smoke_test: true,
        ..options(1)
    };
    let report = Scheduler::new(opts).run(items, &engine);

    assert_eq!(report.halted, Some(Halt::NoSmokeTests));
    assert_eq!(engine.call_count(), 0);
    assert_eq!(report.totals().total, 0);
}

#[test]
fn failed_smoke_test_halts_when_required() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["smoke", "math"]);
    let items = vec![
        expression_item(root, "pg", "smoke", true),
        expression_item(root, "pg", "math", false),
    ];

    let engine = MockEngine::answering(bad_doc());
    let opts = SchedulerOptions {
        require_smoke_test: true,
        ..options(2)
    };
    let report = Scheduler::new(opts).run(items, &engine);

    assert_eq!(report.halted, Some(Halt::SmokeTestFailed));
    assert_eq!(report.failing_datasources, vec!["pg".to_string()]);
    assert_eq!(engine.call_count(), 1);
    assert!(report.main.completed.is_empty());
}

fn smoke_failure_items(root: &Path) -> Vec<dsverify::plan::WorkItem> {
    groups(root, &["pgsmoke", "pgmath", "mysmoke", "mymath"]);
    vec![
        expression_item(root, "pg", "pgsmoke", true),
        expression_item(root, "pg", "pgmath", false),
        expression_item(root, "my", "mysmoke", true),
        expression_item(root, "my", "mymath", false),
    ]
}

fn fails_pg_smoke() -> MockEngine {
    MockEngine::new(|req| {
        Ok(req
            .test_files
            .iter()
            .map(|f| {
                let name = f.file_name().unwrap().to_string_lossy().into_owned();
                let doc = if name == "setup.pgsmoke.txt" { bad_doc() } else { good_doc() };
                (name, doc)
            })
            .collect())
    })
}

#[test]
fn failed_smoke_test_skips_its_datasource() {
    let dir = tempdir().unwrap();
    let items = smoke_failure_items(dir.path());

    let engine = fails_pg_smoke();
    let report = Scheduler::new(options(2)).run(items, &engine);

    assert_eq!(report.halted, None);
    assert_eq!(report.failing_datasources, vec!["pg".to_string()]);
    // both smoke tests plus the healthy datasource's main item
    assert_eq!(engine.call_count(), 3);

    let main = &report.main.completed;
    assert_eq!(main.len(), 2);
    assert_eq!(main[0].item.datasource(), "pg");
    assert_eq!(main[0].error_state, Some(ErrorState::Skipped));
    assert_eq!(main[0].results[0].error_state, Some(ErrorState::Skipped));
    assert_eq!(main[1].item.datasource(), "my");
    assert!(!main[1].failed());
    assert_eq!(report.main.totals.skipped, 1);
}

#[test]
fn force_run_ignores_smoke_failures() {
    let dir = tempdir().unwrap();
    let items = smoke_failure_items(dir.path());

    let engine = fails_pg_smoke();
    let opts = SchedulerOptions {
        force_run: true,
        ..options(2)
    };
    let report = Scheduler::new(opts).run(items, &engine);

    assert_eq!(engine.call_count(), 4);
    assert_eq!(report.main.totals.skipped, 0);
    assert_eq!(report.main.totals.passed, 2);
}

#[test]
fn smoke_only_stops_after_first_phase() {
    let dir = tempdir().unwrap();
    let items = smoke_failure_items(dir.path());

    let engine = MockEngine::answering(good_doc());
    let opts = SchedulerOptions {
        smoke_only: true,
        ..options(2)
    };
    let report = Scheduler::new(opts).run(items, &engine);

    assert_eq!(report.halted, Some(Halt::SmokeOnly));
    assert_eq!(report.smoke.completed.len(), 2);
    assert!(report.main.completed.is_empty());
}

#[test]
fn abort_exit_code_stops_the_datasource() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["first", "second", "other"]);
    let items = vec![
        expression_item(root, "pg", "first", false),
        expression_item(root, "pg", "second", false),
        expression_item(root, "my", "other", false),
    ];

    let engine = MockEngine::new(|req| {
        if req.command_line.iter().any(|a| a.contains("expression_first_pg")) {
            return Err(EngineError::Failed {
                code: Some(18),
                output: "connection lost".into(),
            });
        }
        Ok(req
            .test_files
            .iter()
            .map(|f| (f.file_name().unwrap().to_string_lossy().into_owned(), good_doc()))
            .collect::<HashMap<_, _>>())
    });
    let report = Scheduler::new(options(1)).run(items, &engine);

    let main = &report.main.completed;
    assert_eq!(engine.call_count(), 2);
    assert_eq!(main[0].error_state, Some(ErrorState::Aborted));
    let first = &main[0].results[0];
    assert_eq!(first.cmd_output, "connection lost");
    assert!(first.saved_error_message.as_deref().unwrap().contains("code 18"));
    assert_eq!(main[1].error_state, Some(ErrorState::Aborted));
    assert!(main[1].workspace.is_none());
    assert!(!main[2].failed());
}

#[test]
fn timeout_marks_every_case() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    expression_fixture(root, "slow", "slow", &["1+1", "2+2"], &[good_doc()]);
    let items = vec![expression_item(root, "pg", "slow", false)];

    let engine = MockEngine::new(|_| Err(EngineError::Timeout(Duration::from_secs(1))));
    let report = Scheduler::new(options(1)).run(items, &engine);

    let work = &report.main.completed[0];
    assert_eq!(work.error_state, Some(ErrorState::Timeout));
    let result = &work.results[0];
    assert_eq!(result.cases.len(), 2);
    assert!(result.cases.iter().all(|c| c.error_state == Some(ErrorState::Timeout)));
    assert_eq!(report.totals().failed, 2);
}

#[test]
fn expected_message_turns_failure_into_pass() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["broken"]);
    let mut item = expression_item(root, "pg", "broken", false);
    item.test_set = item
        .test_set
        .with_expected_message(Some("unsupported function".into()));

    let engine = MockEngine::new(|_| {
        Err(EngineError::Failed {
            code: Some(1),
            output: "error: unsupported function FOO".into(),
        })
    });
    let report = Scheduler::new(options(1)).run(vec![item], &engine);

    let work = &report.main.completed[0];
    assert_eq!(work.error_state, Some(ErrorState::ExpectedFailure));
    assert!(!work.failed());
    assert_eq!(report.totals().passed, 1);
}

#[test]
fn disabled_sets_do_not_run() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["off"]);
    let mut item = expression_item(root, "pg", "off", false);
    item.test_set = item.test_set.with_enabled(false);

    let engine = MockEngine::answering(good_doc());
    let report = Scheduler::new(options(1)).run(vec![item], &engine);

    assert_eq!(engine.call_count(), 0);
    assert_eq!(report.main.completed[0].error_state, Some(ErrorState::Disabled));
    assert_eq!(report.totals().disabled, 1);
}

#[test]
fn empty_run_has_nothing_to_do() {
    let engine = MockEngine::answering(good_doc());
    let report = Scheduler::new(options(1)).run(Vec::new(), &engine);
    assert_eq!(report.halted, Some(Halt::NothingToRun));
}

#[test]
fn unusable_output_dir_fails_the_item_without_running_it() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["math"]);
    let blocker = root.join("not_a_dir");
    std::fs::write(&blocker, "x").unwrap();
    let mut item = expression_item(root, "pg", "math", false);
    item.invocation.custom_output_dir = Some(blocker.join("out"));

    let engine = MockEngine::answering(good_doc());
    let report = Scheduler::new(options(1)).run(vec![item], &engine);

    assert_eq!(engine.call_count(), 0);
    let completed: Vec<_> = report.completed().collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].error_state, Some(ErrorState::Other));
    assert!(completed[0].failed());
    assert!(completed[0].output_dir().is_none());
    assert_eq!(report.totals().failed, 1);
}

#[test]
fn item_thread_count_caps_the_pool() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    groups(root, &["math", "string", "date"]);
    let items: Vec<_> = ["math", "string", "date"]
        .iter()
        .map(|g| {
            let mut item = expression_item(root, "pg", g, false);
            item.invocation.thread_count = 1;
            item
        })
        .collect();

    let engine = MockEngine::answering(good_doc());
    let opts = SchedulerOptions {
        platform: Platform::Linux,
        ..options(4)
    };
    let report = Scheduler::new(opts).run(items, &engine);

    assert_eq!(report.main.workers, 1);
    assert_eq!(report.totals().passed, 3);
}
