use anyhow::{Context, Result};
use rayon::prelude::*;
use sha2::{Digest, Sha224};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::backend::{Engine, EngineRequest};
use crate::command::{Platform, build_command_line};
use crate::compare::compare_test;
use crate::paths::FixturePaths;
use crate::plan::WorkItem;
use crate::report::write_item_reports;
use crate::scheduler::AbortRegistry;
use crate::types::{ErrorState, TestResult};

/// Name of the fixture list handed to the engine, inside the log dir.
pub const TEST_LIST_FILE: &str = "tests.txt";

/// Run-wide state a worker needs to execute an item.
#[derive(Debug, Clone, Copy)]
pub struct WorkContext<'a> {
    pub engine_path: &'a str,
    pub platform: Platform,
    pub aborts: &'a AbortRegistry,
    pub thread_id: usize,
}

/// An executed work item together with the isolated directory holding its
/// actual files, logs and per-item reports.
#[derive(Debug)]
pub struct CompletedWork {
    pub item: WorkItem,
    pub results: Vec<TestResult>,
    pub error_state: Option<ErrorState>,
    pub workspace: Option<TempDir>,
    pub elapsed: Duration,
}

impl CompletedWork {
    pub fn output_dir(&self) -> Option<&Path> {
        self.workspace.as_ref().map(TempDir::path)
    }

    pub fn failed(&self) -> bool {
        self.results.iter().any(|r| !r.all_passed())
    }
}

fn workspace_prefix(item: &WorkItem) -> String {
    let component = format!("{}_{}", item.invocation.suite_name, item.test_set.config_name);
    let digest = format!("{:x}", Sha224::digest(component.as_bytes()));
    format!("{}_", &digest[..16])
}

struct Workspace {
    dir: TempDir,
    log_dir: PathBuf,
    test_list: PathBuf,
}

fn prepare_workspace(item: &WorkItem) -> Result<Workspace> {
    let mut builder = tempfile::Builder::new();
    let prefix = workspace_prefix(item);
    builder.prefix(&prefix);
    let dir = match item.invocation.custom_output_dir.as_deref() {
        Some(base) => {
            fs::create_dir_all(base)
                .with_context(|| format!("failed to create output dir {}", base.display()))?;
            builder.tempdir_in(base)
        }
        None => builder.tempdir(),
    }
    .context("failed to create temporary output dir")?;

    let log_dir = dir.path().join(item.log_dir_name());
    fs::create_dir_all(&log_dir).with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let test_list = log_dir.join(TEST_LIST_FILE);
    let mut listing = String::new();
    for f in item.test_set.test_files() {
        listing.push_str(&f.path.to_string_lossy());
        listing.push('\n');
    }
    fs::write(&test_list, listing).with_context(|| format!("failed to write {}", test_list.display()))?;

    Ok(Workspace { dir, log_dir, test_list })
}

fn not_run(item: &WorkItem, state: ErrorState) -> Vec<TestResult> {
    let dims = item.invocation.dimensions();
    item.test_set
        .test_files()
        .iter()
        .map(|tf| {
            let name = tf.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let mut r = TestResult::not_run(name, &tf.path, item.test_set.kind, dims, state);
            r.relative_test_file = tf.relative_path.clone();
            r
        })
        .collect()
}

/// Attaches the engine output to the first result; later results refer back to it.
fn attach_saved_message(results: &mut [TestResult], saved: &str) {
    for (i, r) in results.iter_mut().enumerate() {
        r.saved_error_message = Some(if i == 0 {
            saved.to_string()
        } else {
            format!("Error. Previous error message is: {saved}")
        });
    }
}

fn finish(item: WorkItem, results: Vec<TestResult>, state: Option<ErrorState>, workspace: Option<TempDir>, start: Instant) -> CompletedWork {
    CompletedWork {
        item,
        results,
        error_state: state,
        workspace,
        elapsed: start.elapsed(),
    }
}

/// Runs one work item end to end. Never fails: every problem becomes an
/// [`ErrorState`] on the item's results.
pub fn execute(mut item: WorkItem, engine: &dyn Engine, ctx: &WorkContext<'_>) -> CompletedWork {
    let start = Instant::now();
    item.invocation.thread_id = ctx.thread_id;

    let gate = if !item.test_set.enabled {
        Some(ErrorState::Disabled)
    } else if item.test_set.skipped {
        Some(ErrorState::Skipped)
    } else if ctx.aborts.is_aborted(item.datasource()) {
        Some(ErrorState::Aborted)
    } else {
        None
    };
    if let Some(state) = gate {
        debug!("[{}] {} not run: {}", ctx.thread_id, item.test_set.config_name, state);
        let results = not_run(&item, state);
        return finish(item, results, Some(state), None, start);
    }

    let ws = match prepare_workspace(&item) {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[{}] {}: {:#}", ctx.thread_id, item.test_set.config_name, e);
            let mut results = not_run(&item, ErrorState::Other);
            attach_saved_message(&mut results, &format!("{e:#}"));
            return finish(item, results, Some(ErrorState::Other), None, start);
        }
    };

    item.invocation.output_dir = ws.dir.path().to_path_buf();
    item.invocation.log_dir = ws.log_dir.clone();
    let command_line = build_command_line(ctx.engine_path, ctx.platform, &item.test_set, &item.invocation, &ws.test_list);
    item.invocation.command_line = command_line.clone();

    let request = EngineRequest {
        command_line,
        test_files: item.test_set.test_files().iter().map(|f| f.path.clone()).collect(),
        logical: item.test_set.is_logical(),
        output_dir: ws.dir.path().to_path_buf(),
        log_dir: ws.log_dir.clone(),
        timeout: item.invocation.timeout(),
    };
    debug!("[{}] calling {}", ctx.thread_id, request.command_line.join(" "));

    let (results, state) = match engine.execute(&request) {
        Ok(out) => (compare_all(&item, ws.dir.path(), &out.output), None),
        Err(e) => {
            let state = e.classify(item.test_set.expected_message.as_deref());
            debug!("[{}] {} engine failed: {} ({})", ctx.thread_id, item.test_set.config_name, e, state.code());
            if state == ErrorState::Aborted {
                ctx.aborts.abort(item.datasource());
            }
            let mut results = not_run(&item, state);
            let saved = e.saved_message();
            attach_saved_message(&mut results, &saved);
            for r in &mut results {
                r.cmd_output = e.output().to_string();
            }
            (results, Some(state))
        }
    };

    debug!(
        "[{}] {} {}",
        ctx.thread_id,
        item.test_set.config_name,
        results.iter().map(progress_marker).collect::<String>()
    );
    if let Err(e) = write_item_reports(ws.dir.path(), &item, &results) {
        warn!("[{}] could not write reports for {}: {:#}", ctx.thread_id, item.test_set.config_name, e);
    }
    finish(item, results, state, Some(ws.dir), start)
}

fn progress_marker(result: &TestResult) -> char {
    match result.error_state {
        Some(state) => state.marker(),
        None if result.all_passed() => '.',
        None => ErrorState::ResultMismatch.marker(),
    }
}

fn compare_all(item: &WorkItem, output_dir: &Path, cmd_output: &str) -> Vec<TestResult> {
    let kind = item.test_set.kind;
    item.test_set
        .test_files()
        .par_iter()
        .map(|tf| {
            let paths = FixturePaths::for_fixture(kind, &tf.path, output_dir);
            if paths.engine_output != paths.actual && paths.engine_output.is_file() {
                debug!("Copying test process output {} to actual file {}", paths.engine_output.display(), paths.actual.display());
                if let Err(e) = fs::rename(&paths.engine_output, &paths.actual) {
                    debug!("Could not move {}: {}", paths.engine_output.display(), e);
                }
            }
            let mut result = compare_test(&paths, tf, &item.invocation);
            result.cmd_output = cmd_output.to_string();
            result
        })
        .collect()
}
