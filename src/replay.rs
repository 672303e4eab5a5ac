use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::plan::{Invocation, TestKind, TestSet, WorkItem};

/// One failed test as recorded in a previous run's JSON report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTestRecord {
    pub test_file: String,
    pub tds: String,
    pub test_config: Invocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedTestsFile {
    #[serde(default)]
    pub failed_tests: Vec<FailedTestRecord>,
}

pub fn load_failed_tests(path: &Path) -> Result<FailedTestsFile> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid failed test file {}", path.display()))
}

/// Overrides applied to every restored invocation.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub thread_count: Option<usize>,
    pub leave_temp_dir: bool,
    pub timeout_seconds: Option<u64>,
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Tests sharing a directory, a TDS and a kind land in the same group.
pub fn group_id(test_file: &str, tds: &str, kind: TestKind) -> String {
    let dir = Path::new(test_file)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let key = format!("{}_{}_{}", dir, base_name(tds), kind.letter()).replace('-', "_");
    format!("{:x}", Sha224::digest(key.as_bytes()))
}

/// The recorded TDS path when it still exists, otherwise `<root>/tds/<basename>`.
pub fn resolve_tds(root_dir: &Path, recorded: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(recorded);
    if direct.is_file() {
        return Ok(direct);
    }
    let fallback = root_dir.join("tds").join(base_name(recorded));
    if fallback.is_file() {
        return Ok(fallback);
    }
    Err(anyhow!(
        "TDS {} not found, also tried {}",
        recorded,
        fallback.display()
    ))
}

/// Rebuilds work items from failure records, one per `(suite, group)` in
/// first-seen order. Records whose TDS cannot be found are skipped.
pub fn regroup(file: &FailedTestsFile, root_dir: &Path, options: &ReplayOptions) -> Vec<WorkItem> {
    let mut groups: IndexMap<(String, String), WorkItem> = IndexMap::new();

    for record in &file.failed_tests {
        let tds = match resolve_tds(root_dir, &record.tds) {
            Ok(tds) => tds,
            Err(e) => {
                warn!("Skipping failed test {}: {:#}", record.test_file, e);
                continue;
            }
        };
        let kind = record.test_config.kind();
        let suite = record.test_config.suite_name.clone();
        let id = group_id(&record.test_file, &record.tds, kind);
        debug!("Found failed test: {} and tds {}", record.test_file, tds.display());

        let item = groups.entry((suite.clone(), id.clone())).or_insert_with(|| {
            let test_set = TestSet::new(&suite, root_dir, &id, tds.to_string_lossy(), kind, &suite)
                .with_password_file(record.password_file.clone())
                .with_expected_message(record.expected_message.clone());
            WorkItem::new(test_set, restore_invocation(&record.test_config, &tds, &id, options))
        });
        item.test_set.append_test_file(&record.test_file);
    }

    groups.into_values().collect()
}

fn restore_invocation(snapshot: &Invocation, tds: &Path, config_name: &str, options: &ReplayOptions) -> Invocation {
    let mut invocation = snapshot.clone();
    invocation.tds = tds.to_string_lossy().into_owned();
    invocation.config_file = config_name.to_string();
    invocation.output_dir = PathBuf::new();
    invocation.log_dir = PathBuf::new();
    invocation.command_line.clear();
    invocation.leave_temp_dir = options.leave_temp_dir;
    if let Some(threads) = options.thread_count {
        invocation.thread_count = threads;
    }
    if let Some(timeout) = options.timeout_seconds {
        invocation.timeout_seconds = timeout;
    }
    invocation
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_depends_on_dir_tds_and_kind() {
        let a = group_id("exprtests/standard/setup.math.txt", "tds/cast_calcs.pg.tds", TestKind::Expression);
        let b = group_id("exprtests/standard/setup.string.txt", "/other/cast_calcs.pg.tds", TestKind::Expression);
        let c = group_id("exprtests/standard/setup.math.txt", "tds/cast_calcs.pg.tds", TestKind::Logical);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 56);
    }

    #[test]
    fn dashes_are_normalized() {
        assert_eq!(
            group_id("a-b/setup.x.txt", "t.tds", TestKind::Expression),
            group_id("a_b/setup.x.txt", "t.tds", TestKind::Expression)
        );
    }
}
