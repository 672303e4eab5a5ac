mod common;

use common::write;
use dsverify::plan::TestKind;
use dsverify::replay::{ReplayOptions, load_failed_tests, regroup};
use std::path::Path;
use tempfile::tempdir;

fn record(test_file: &str, tds: &str, logical: bool) -> serde_json::Value {
    serde_json::json!({
        "test_file": test_file,
        "tds": tds,
        "test_config": {
            "suite_name": "pg",
            "logical": logical,
            "tested_tuples": true,
            "thread_count": 4,
            "timeout_seconds": 60,
            "output_dir": "/stale/output",
            "log_dir": "/stale/output/logs"
        }
    })
}

fn failed_file(dir: &Path, records: Vec<serde_json::Value>) -> std::path::PathBuf {
    let path = dir.join("test_output_combined.json");
    let doc = serde_json::json!({ "harness_name": "DSVERIFY", "failed_tests": records });
    write(&path, &doc.to_string());
    path
}

#[test]
fn records_sharing_dir_and_tds_become_one_item() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let tds = root.join("tds").join("cast_calcs.pg.tds");
    write(&tds, "<datasource/>");
    write(&root.join("exprtests/standard/setup.math.txt"), "1+1");
    write(&root.join("exprtests/standard/setup.string.txt"), "'a'");
    let tds = tds.to_string_lossy().into_owned();

    let path = failed_file(
        root,
        vec![
            record("exprtests/standard/setup.math.txt", &tds, false),
            record("exprtests/standard/setup.string.txt", &tds, false),
        ],
    );
    let failed = load_failed_tests(&path).unwrap();
    let items = regroup(&failed, root, &ReplayOptions::default());

    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.test_set.kind, TestKind::Expression);
    assert_eq!(item.invocation.suite_name, "pg");
    assert_eq!(item.invocation.thread_count, 4);
    assert!(item.invocation.output_dir().is_none());
    let files: Vec<_> = item.test_set.test_files().iter().map(|f| f.relative_path.clone()).collect();
    assert_eq!(
        files,
        vec![
            "exprtests/standard/setup.math.txt".to_string(),
            "exprtests/standard/setup.string.txt".to_string()
        ]
    );
}

#[test]
fn kind_splits_groups() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let tds = root.join("tds").join("cast_calcs.pg.tds");
    write(&tds, "<datasource/>");
    let tds = tds.to_string_lossy().into_owned();

    let path = failed_file(
        root,
        vec![
            record("tests/setup.a.xml", &tds, true),
            record("tests/setup.a.txt", &tds, false),
            record("tests/setup.b.xml", &tds, true),
        ],
    );
    let items = regroup(&load_failed_tests(&path).unwrap(), root, &ReplayOptions::default());

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].test_set.kind, TestKind::Logical);
    assert_eq!(items[1].test_set.kind, TestKind::Expression);
    assert!(items[0].invocation.logical);
}

#[test]
fn stale_tds_falls_back_to_root() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(&root.join("tds").join("cast_calcs.pg.tds"), "<datasource/>");

    let path = failed_file(
        root,
        vec![
            record("exprtests/setup.math.txt", "/gone/elsewhere/cast_calcs.pg.tds", false),
            record("exprtests/setup.other.txt", "/gone/missing.tds", false),
        ],
    );
    let options = ReplayOptions {
        thread_count: Some(1),
        leave_temp_dir: true,
        timeout_seconds: Some(5),
    };
    let items = regroup(&load_failed_tests(&path).unwrap(), root, &options);

    assert_eq!(items.len(), 1);
    let inv = &items[0].invocation;
    assert_eq!(Path::new(&inv.tds), root.join("tds").join("cast_calcs.pg.tds"));
    assert_eq!(inv.thread_count, 1);
    assert_eq!(inv.timeout_seconds, 5);
    assert!(inv.leave_temp_dir);
}
