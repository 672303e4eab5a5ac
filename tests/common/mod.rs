#![allow(dead_code)]

use dsverify::backend::{Engine, EngineError, EngineOutput, EngineRequest};
use dsverify::paths::FixturePaths;
use dsverify::plan::{Invocation, TestKind, TestSet, WorkItem};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

pub fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Result document with one `<test>` per `(name, values)` pair.
pub fn result_doc(cases: &[(&str, &[&str])]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<results>\n");
    for (name, values) in cases {
        xml.push_str(&format!("  <test name=\"{name}\">\n    <table>\n"));
        for v in *values {
            xml.push_str(&format!("      <tuple><value>{v}</value></tuple>\n"));
        }
        xml.push_str("    </table>\n  </test>\n");
    }
    xml.push_str("</results>\n");
    xml
}

type Respond = dyn Fn(&EngineRequest) -> Result<HashMap<String, String>, EngineError> + Send + Sync;

/// Writes canned result documents where the real engine would, keyed by
/// fixture file name.
pub struct MockEngine {
    respond: Box<Respond>,
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl MockEngine {
    pub fn new(respond: impl Fn(&EngineRequest) -> Result<HashMap<String, String>, EngineError> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every fixture with the same document.
    pub fn answering(doc: String) -> Self {
        Self::new(move |req| {
            Ok(req
                .test_files
                .iter()
                .map(|f| (f.file_name().unwrap().to_string_lossy().into_owned(), doc.clone()))
                .collect())
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Engine for MockEngine {
    fn execute(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        self.calls.lock().unwrap().push(request.command_line.clone());
        let answers = (self.respond)(request)?;
        let kind = TestKind::from_logical(request.logical);
        for f in &request.test_files {
            let name = f.file_name().unwrap().to_string_lossy().into_owned();
            if let Some(doc) = answers.get(&name) {
                let paths = FixturePaths::for_fixture(kind, f, &request.output_dir);
                fs::write(&paths.engine_output, doc).map_err(EngineError::Io)?;
            }
        }
        Ok(EngineOutput {
            output: "ok".into(),
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Expression suite under `root/exprtests/<group>/` with one fixture and its
/// expected files.
pub fn expression_fixture(root: &Path, group: &str, test: &str, lines: &[&str], expected: &[String]) {
    let dir = root.join("exprtests").join(group);
    write(&dir.join(format!("setup.{test}.txt")), &lines.join("\n"));
    for (version, doc) in expected.iter().enumerate() {
        let name = if version == 0 {
            format!("expected.setup.{test}.txt")
        } else {
            format!("expected.setup.{test}.{version}.txt")
        };
        write(&dir.join(name), doc);
    }
}

pub fn expression_item(root: &Path, ds: &str, group: &str, smoke: bool) -> WorkItem {
    let config = format!("expression.{group}.{ds}");
    let test_set = TestSet::new(ds, root, &config, format!("cast_calcs.{ds}.tds"), TestKind::Expression, ds)
        .with_pattern(format!("exprtests/{group}/setup.*.txt"))
        .with_smoke_test(smoke);
    let invocation = Invocation {
        suite_name: ds.to_string(),
        config_file: config,
        tds: root.join("tds").join(format!("cast_calcs.{ds}.tds")).to_string_lossy().into_owned(),
        ..Invocation::default()
    };
    WorkItem::new(test_set, invocation)
}
