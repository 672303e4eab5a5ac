mod common;

use common::write;
use dsverify::plan::{Invocation, TestKind, load_plans, parse_plan, select_plans};
use std::path::Path;
use tempfile::tempdir;

const PLAN: &str = r#"
Datasource: pg
RunTime:
  TimeoutSeconds: 120
  MaxThread: 2
  Override: -DConnectTimeout=5
  Schema: public
  EnginePaths:
    Linux: /opt/engine/tabquerytool
Tests:
  - Name: expression.standard
    Kind: expression
    Tds: cast_calcs.
    Pattern: exprtests/standard/setup.*.txt
    Exclusions: [string]
    SmokeTest: true
  - Name: logical.calcs.
    Kind: logical
    Tds: Staples.pg.tds
    Pattern: logicaltests/setup/calcs
    ExpectedMessage: not supported
  - Name: expression.lod
    Kind: expression
    Tds: cast_calcs.
    Pattern: exprtests/lod/setup.lod.txt
    Enabled: false
"#;

fn suite(root: &Path) {
    for f in ["setup.math.txt", "setup.string.txt", "expected.setup.math.txt"] {
        write(&root.join("exprtests/standard").join(f), "1+1");
    }
    write(&root.join("exprtests/standard/nested/setup.deep.txt"), "1+1");
    for f in ["setup.calcs.b1.dbo.xml", "setup.calcs.b2.dbo.xml"] {
        write(&root.join("logicaltests/setup/calcs").join(f), "<query/>");
    }
    write(&root.join("exprtests/lod/setup.lod.txt"), "1+1");
}

#[test]
fn plan_file_becomes_test_sets() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    suite(root);
    let plan_file = root.join("pg.yaml");

    let plan = parse_plan(PLAN, &plan_file).unwrap();
    assert_eq!(plan.name, "pg");
    assert_eq!(plan.root_dir, root);
    assert_eq!(plan.run_time.timeout_seconds, 120);
    assert_eq!(plan.run_time.max_threads, 2);
    assert_eq!(plan.run_time.schema_name.as_deref(), Some("public"));
    assert!(plan.run_time.engine_paths.is_some());
    assert_eq!(plan.test_sets.len(), 3);

    let expr = &plan.test_sets[0];
    assert_eq!(expr.config_name, "expression.standard.pg");
    assert_eq!(expr.tds_name, "cast_calcs.pg.tds");
    assert!(expr.smoke_test);
    let files: Vec<_> = expr.test_files().iter().map(|f| f.relative_path.as_str()).collect();
    assert_eq!(files, vec!["exprtests/standard/setup.math.txt"]);

    let logical = &plan.test_sets[1];
    assert_eq!(logical.config_name, "logical.calcs.pg");
    assert_eq!(logical.tds_name, "Staples.pg.tds");
    assert_eq!(logical.kind, TestKind::Logical);
    assert_eq!(logical.expected_message.as_deref(), Some("not supported"));
    assert_eq!(logical.test_files().len(), 2);

    assert!(!plan.test_sets[2].enabled);
}

#[test]
fn work_items_follow_filters() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    suite(root);
    let plan = parse_plan(PLAN, &root.join("pg.yaml")).unwrap();
    let template = Invocation::default();

    let all = plan.work_items(&template, None, None);
    assert_eq!(all.len(), 3);
    let item = &all[1];
    assert!(item.invocation.logical);
    assert_eq!(item.invocation.suite_name, "pg");
    assert_eq!(item.invocation.timeout_seconds, 120);
    assert_eq!(item.invocation.d_override, "-DConnectTimeout=5");
    assert_eq!(Path::new(&item.invocation.tds), root.join("tds").join("Staples.pg.tds"));
    assert!(all[0].is_smoke_test());
    assert!(!all[2].is_smoke_test());

    assert_eq!(plan.work_items(&template, Some("*"), None).len(), 1);
    let lod = plan.work_items(&template, None, Some("lod"));
    assert_eq!(lod.len(), 1);
    assert_eq!(lod[0].test_set.config_name, "expression.lod.pg");
}

#[test]
fn duplicate_test_set_names_are_rejected() {
    let yaml = r#"
Datasource: pg
Tests:
  - Name: expression.standard
    Kind: expression
    Tds: cast_calcs.
    Pattern: exprtests/standard
  - Name: expression.standard
    Kind: expression
    Tds: cast_calcs.
    Pattern: exprtests/lod
"#;
    let err = parse_plan(yaml, Path::new("pg.yaml")).unwrap_err();
    assert!(err.to_string().contains("twice"));
}

#[test]
fn plans_are_loaded_from_directories_and_selected_by_name() {
    let dir = tempdir().unwrap();
    let plans_dir = dir.path().join("plans");
    write(&plans_dir.join("pg.yaml"), "Datasource: pg\nTests: []\n");
    write(&plans_dir.join("mysql.yml"), "Datasource: mysql\n");
    write(&plans_dir.join("README.txt"), "not a plan");

    let plans = load_plans(&[plans_dir]).unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(select_plans(&plans, "all").unwrap().len(), 2);
    let picked = select_plans(&plans, "pg").unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].name, "pg");
    assert!(select_plans(&plans, "oracle").is_err());
}
