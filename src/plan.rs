use anyhow::{Context, Result, anyhow};
use indexmap::IndexSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::types::Dimensions;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60 * 60;
pub const DEFAULT_THREAD_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Logical,
    Expression,
}

impl TestKind {
    pub fn from_logical(logical: bool) -> Self {
        if logical { TestKind::Logical } else { TestKind::Expression }
    }

    pub fn is_logical(self) -> bool {
        matches!(self, TestKind::Logical)
    }

    /// Engine-style short flag, also used in reports.
    pub fn flag(self) -> &'static str {
        match self {
            TestKind::Logical => "-q",
            TestKind::Expression => "-e",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TestKind::Logical => "logical",
            TestKind::Expression => "expression",
        }
    }

    pub fn letter(self) -> char {
        match self {
            TestKind::Logical => 'L',
            TestKind::Expression => 'E',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFile {
    pub root_dir: PathBuf,
    pub path: PathBuf,
    pub relative_path: String,
}

impl TestFile {
    pub fn new(root_dir: &Path, path: PathBuf) -> Self {
        let relative_path = path
            .strip_prefix(root_dir)
            .unwrap_or(path.as_path())
            .to_string_lossy()
            .replace('\\', "/");
        Self {
            root_dir: root_dir.to_path_buf(),
            path,
            relative_path,
        }
    }
}

/// Where a test set gets its fixture files from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestSource {
    /// A file, a directory, or a glob relative to the search dirs.
    Pattern(String),
    /// Explicit relative file paths, used when replaying failures.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct TestSet {
    pub ds_name: String,
    pub root_dir: PathBuf,
    pub config_name: String,
    pub tds_name: String,
    /// Comma separated regular expressions matched against fixture paths.
    pub exclusions: String,
    pub source: TestSource,
    pub kind: TestKind,
    pub suite_name: String,
    pub password_file: Option<String>,
    pub expected_message: Option<String>,
    pub smoke_test: bool,
    pub enabled: bool,
    pub skipped: bool,
    files: OnceLock<Vec<TestFile>>,
}

impl TestSet {
    pub fn new(
        ds_name: impl Into<String>,
        root_dir: impl Into<PathBuf>,
        config_name: impl Into<String>,
        tds_name: impl Into<String>,
        kind: TestKind,
        suite_name: impl Into<String>,
    ) -> Self {
        Self {
            ds_name: ds_name.into(),
            root_dir: root_dir.into(),
            config_name: config_name.into(),
            tds_name: tds_name.into(),
            exclusions: String::new(),
            source: TestSource::Pattern(String::new()),
            kind,
            suite_name: suite_name.into(),
            password_file: None,
            expected_message: None,
            smoke_test: false,
            enabled: true,
            skipped: false,
            files: OnceLock::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.source = TestSource::Pattern(pattern.into());
        self.files = OnceLock::new();
        self
    }

    pub fn with_exclusions(mut self, exclusions: impl Into<String>) -> Self {
        self.exclusions = exclusions.into();
        self.files = OnceLock::new();
        self
    }

    pub fn with_smoke_test(mut self, smoke_test: bool) -> Self {
        self.smoke_test = smoke_test;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_expected_message(mut self, message: Option<String>) -> Self {
        self.expected_message = message.filter(|m| !m.is_empty());
        self
    }

    pub fn with_password_file(mut self, password_file: Option<String>) -> Self {
        self.password_file = password_file.filter(|p| !p.is_empty());
        self
    }

    /// Adds one fixture to an explicit test set. Has no effect once the file
    /// list has been computed.
    pub fn append_test_file(&mut self, relative_path: impl Into<String>) {
        if let TestSource::Explicit(files) = &mut self.source {
            files.push(relative_path.into());
        } else {
            self.source = TestSource::Explicit(vec![relative_path.into()]);
        }
    }

    pub fn is_logical(&self) -> bool {
        self.kind.is_logical()
    }

    pub fn password_file_path(&self) -> PathBuf {
        let name = match &self.password_file {
            Some(p) => p.clone(),
            None => format!("{}.password", self.suite_name),
        };
        resource_path(&self.root_dir, &name, "tds")
    }

    pub fn tds_path(&self) -> PathBuf {
        resource_path(&self.root_dir, &self.tds_name, "tds")
    }

    /// Sorted fixture files, computed on first use and then cached.
    pub fn test_files(&self) -> &[TestFile] {
        self.files.get_or_init(|| match &self.source {
            TestSource::Pattern(pattern) => self.discover_pattern(pattern),
            TestSource::Explicit(files) => self.discover_explicit(files),
        })
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.root_dir.clone()];
        if let Ok(cwd) = std::env::current_dir() {
            let local = cwd.join("tests");
            if local != self.root_dir {
                dirs.push(local);
            }
        }
        dirs
    }

    fn discover_pattern(&self, pattern: &str) -> Vec<TestFile> {
        let mut found = Vec::new();
        let mut checked = Vec::new();
        for dir in self.search_dirs() {
            let allowed = dir.join(pattern);
            checked.push(allowed.display().to_string());
            if allowed.is_file() {
                found.push(TestFile::new(&dir, allowed));
            } else if allowed.is_dir() {
                if let Ok(entries) = fs::read_dir(&allowed) {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.is_file() {
                            found.push(TestFile::new(&dir, path));
                        }
                    }
                }
            } else {
                for path in glob_files(&dir, pattern) {
                    found.push(TestFile::new(&dir, path));
                }
            }
            if !found.is_empty() {
                break;
            }
        }
        if found.is_empty() {
            debug!("Could not find any tests for [{}]", checked.join("] or ["));
        }
        debug!("Found {} tests to run before exclusions", found.len());

        let exclusions = self.exclusion_regexes();
        found.retain(|f| {
            let path = f.path.to_string_lossy();
            !exclusions.iter().any(|re| re.is_match(&path))
        });
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found.dedup_by(|a, b| a.path == b.path);
        debug!("Found {} tests to run after exclusions", found.len());
        found
    }

    fn discover_explicit(&self, files: &[String]) -> Vec<TestFile> {
        let dirs = self.search_dirs();
        let mut found = Vec::new();
        for file in files {
            let hit = dirs
                .iter()
                .map(|dir| (dir, dir.join(file)))
                .find(|(_, path)| path.is_file());
            match hit {
                Some((dir, path)) => found.push(TestFile::new(dir, path)),
                None => debug!("Looking for file {} found nothing", file),
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found.dedup_by(|a, b| a.path == b.path);
        found
    }

    fn exclusion_regexes(&self) -> Vec<Regex> {
        let mut regexes = vec![
            Regex::new(&regex::escape("expected.")),
            Regex::new(&regex::escape("actual.")),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        for ex in self.exclusions.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match Regex::new(ex) {
                Ok(re) => regexes.push(re),
                Err(e) => warn!("Error compiling regular expression for test file exclusions: '{}': {}", ex, e),
            }
        }
        regexes
    }
}

impl PartialEq for TestSet {
    fn eq(&self, other: &Self) -> bool {
        self.ds_name == other.ds_name
            && self.root_dir == other.root_dir
            && self.config_name == other.config_name
            && self.tds_name == other.tds_name
            && self.exclusions == other.exclusions
            && self.source == other.source
            && self.kind == other.kind
            && self.suite_name == other.suite_name
    }
}

fn resource_path(root: &Path, name: &str, subdir: &str) -> PathBuf {
    let direct = Path::new(name);
    if direct.is_absolute() || direct.is_file() {
        return direct.to_path_buf();
    }
    root.join(subdir).join(name)
}

/// Expands a `*`/`?` glob relative to `base`. Wildcards never cross a path separator.
fn glob_files(base: &Path, pattern: &str) -> Vec<PathBuf> {
    let components: Vec<&str> = pattern.split(['/', '\\']).filter(|c| !c.is_empty()).collect();
    let fixed = components
        .iter()
        .take_while(|c| !c.contains(['*', '?']))
        .count();
    if fixed == components.len() {
        return Vec::new();
    }
    let start = components[..fixed].iter().fold(base.to_path_buf(), |p, c| p.join(c));
    let wild = &components[fixed..];
    let regex_src = wild
        .iter()
        .map(|c| glob_component_regex(c))
        .collect::<Vec<_>>()
        .join("/");
    let Ok(re) = Regex::new(&format!("^{regex_src}$")) else {
        return Vec::new();
    };

    WalkDir::new(&start)
        .min_depth(wild.len())
        .max_depth(wild.len())
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .strip_prefix(&start)
                .map(|rel| re.is_match(&rel.to_string_lossy().replace('\\', "/")))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

fn glob_component_regex(component: &str) -> String {
    let mut out = String::new();
    for ch in component.chars() {
        match ch {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}

/// Per-OS engine executables configured for a datasource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginePaths {
    pub linux: Option<String>,
    pub mac: Option<String>,
    pub mac_arm: Option<String>,
    pub windows: Option<String>,
}

impl EnginePaths {
    pub fn is_empty(&self) -> bool {
        self.linux.is_none() && self.mac.is_none() && self.mac_arm.is_none() && self.windows.is_none()
    }
}

/// Per-datasource execution knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTimeConfig {
    pub timeout_seconds: u64,
    /// 0 means no override of the run-wide worker count.
    pub max_threads: usize,
    pub d_override: String,
    pub run_as_perf: bool,
    pub schema_name: Option<String>,
    pub engine_paths: Option<EnginePaths>,
}

impl Default for RunTimeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_threads: 0,
            d_override: String::new(),
            run_as_perf: false,
            schema_name: None,
            engine_paths: None,
        }
    }
}

/// How a work item is run and compared. Serialized into failure records so a
/// replay can restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Invocation {
    pub tested_sql: bool,
    pub tested_tuples: bool,
    pub tested_error: bool,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub logical: bool,
    pub config_file: String,
    pub suite_name: String,
    pub d_override: String,
    pub verbose: bool,
    pub tds: String,
    pub noheader: bool,
    pub thread_count: usize,
    #[serde(skip)]
    pub thread_id: usize,
    pub leave_temp_dir: bool,
    #[serde(skip)]
    pub command_line: Vec<String>,
    pub custom_output_dir: Option<PathBuf>,
    pub timeout_seconds: u64,
    pub tolerance: Option<f64>,
    pub always_generate_expected: bool,
    pub run_time: Option<RunTimeConfig>,
}

impl Default for Invocation {
    fn default() -> Self {
        Self {
            tested_sql: false,
            tested_tuples: true,
            tested_error: false,
            output_dir: PathBuf::new(),
            log_dir: PathBuf::new(),
            logical: false,
            config_file: String::new(),
            suite_name: String::new(),
            d_override: String::new(),
            verbose: false,
            tds: String::new(),
            noheader: false,
            thread_count: DEFAULT_THREAD_COUNT,
            thread_id: 0,
            leave_temp_dir: false,
            command_line: Vec::new(),
            custom_output_dir: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            tolerance: None,
            always_generate_expected: false,
            run_time: None,
        }
    }
}

impl Invocation {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            sql: self.tested_sql,
            tuples: self.tested_tuples,
            error: self.tested_error,
        }
    }

    pub fn kind(&self) -> TestKind {
        TestKind::from_logical(self.logical)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Output dir of the run, or `None` before the item has a workspace.
    pub fn output_dir(&self) -> Option<&Path> {
        if self.output_dir.as_os_str().is_empty() { None } else { Some(&self.output_dir) }
    }
}

/// One test set paired with how to run it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub test_set: TestSet,
    pub invocation: Invocation,
}

impl WorkItem {
    pub fn new(test_set: TestSet, invocation: Invocation) -> Self {
        Self { test_set, invocation }
    }

    pub fn datasource(&self) -> &str {
        &self.test_set.ds_name
    }

    pub fn is_smoke_test(&self) -> bool {
        self.test_set.smoke_test && self.test_set.enabled
    }

    pub fn mark_skipped(&mut self) {
        self.test_set.skipped = true;
    }

    /// Name of the log subdirectory, also used as the archive folder.
    pub fn log_dir_name(&self) -> String {
        self.test_set.config_name.replace(['.', '*'], "_")
    }
}

#[derive(Debug, Clone)]
pub struct DatasourcePlan {
    pub name: String,
    pub root_dir: PathBuf,
    pub run_time: RunTimeConfig,
    pub test_sets: Vec<TestSet>,
    pub source: PathBuf,
}

impl DatasourcePlan {
    /// Builds one work item per test set. A filter of `*` or an empty string
    /// selects every set of that kind; when neither filter is given both
    /// kinds run.
    pub fn work_items(
        &self,
        template: &Invocation,
        logical_filter: Option<&str>,
        expression_filter: Option<&str>,
    ) -> Vec<WorkItem> {
        let any_filter = logical_filter.is_some() || expression_filter.is_some();
        let selected = |ts: &TestSet| -> bool {
            if !any_filter {
                return true;
            }
            let filter = match ts.kind {
                TestKind::Logical => logical_filter,
                TestKind::Expression => expression_filter,
            };
            match filter {
                None => false,
                Some(f) => f.is_empty() || f == "*" || ts.config_name.contains(f),
            }
        };

        let mut items = Vec::new();
        for ts in self.test_sets.iter().filter(|ts| selected(ts)) {
            if ts.enabled && ts.test_files().is_empty() {
                warn!("No tests found for config {}", ts.config_name);
            }
            let mut invocation = template.clone();
            invocation.suite_name = self.name.clone();
            invocation.timeout_seconds = self.run_time.timeout_seconds;
            invocation.logical = ts.is_logical();
            invocation.d_override = self.run_time.d_override.clone();
            invocation.tds = ts.tds_path().to_string_lossy().into_owned();
            invocation.config_file = ts.config_name.clone();
            invocation.run_time = Some(self.run_time.clone());
            items.push(WorkItem::new(ts.clone(), invocation));
        }
        items
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn joined(&self) -> String {
        match self {
            OneOrMany::One(s) => s.trim().to_string(),
            OneOrMany::Many(v) => v.iter().map(|s| s.trim()).collect::<Vec<_>>().join(","),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct RawEnginePaths {
    pub linux: Option<String>,
    pub mac: Option<String>,
    pub mac_arm: Option<String>,
    pub windows: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct RawRunTime {
    pub timeout_seconds: Option<u64>,
    pub max_thread: Option<usize>,
    #[serde(alias = "DOverride")]
    pub r#override: Option<String>,
    pub run_as_perf: Option<bool>,
    pub schema: Option<String>,
    pub engine_paths: Option<RawEnginePaths>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct RawTestSet {
    pub name: String,
    pub kind: TestKind,
    pub tds: String,
    pub pattern: String,
    pub exclusions: Option<OneOrMany>,
    pub password_file: Option<String>,
    pub expected_message: Option<String>,
    #[serde(default)]
    pub smoke_test: bool,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct RawPlan {
    pub datasource: String,
    pub root: Option<String>,
    pub run_time: Option<RawRunTime>,
    #[serde(default)]
    pub tests: Vec<RawTestSet>,
}

fn resolve_path_relative_to_plan(path: &str, plan_file: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match plan_file.parent() {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}

/// `cast_calcs.` becomes `cast_calcs.<ds>.tds`; names already ending in `.tds` are kept.
fn tds_name_for(prefix: &str, ds: &str) -> String {
    if prefix.ends_with(".tds") {
        prefix.to_string()
    } else {
        format!("{prefix}{ds}.tds")
    }
}

fn config_name_for(name: &str, ds: &str) -> String {
    let name = name.trim();
    if name.ends_with('.') {
        format!("{name}{ds}")
    } else {
        format!("{name}.{ds}")
    }
}

fn plan_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for p in paths {
        if p.is_dir() {
            for entry in WalkDir::new(p).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if let Some(ext) = path.extension() {
                    if ext == "yaml" || ext == "yml" {
                        files.push(path.to_path_buf());
                    }
                }
            }
        } else {
            files.push(p.clone());
        }
    }
    Ok(files)
}

pub fn parse_plan(content: &str, plan_file: &Path) -> Result<DatasourcePlan> {
    let raw: RawPlan = serde_yaml::from_str(content)
        .with_context(|| format!("invalid plan file {}", plan_file.display()))?;
    let ds = raw.datasource.trim().to_string();
    if ds.is_empty() {
        return Err(anyhow!("plan file {} has an empty Datasource", plan_file.display()));
    }
    let root_dir = match raw.root.as_deref() {
        Some(root) => resolve_path_relative_to_plan(root.trim(), plan_file),
        None => plan_file.parent().map(Path::to_path_buf).unwrap_or_default(),
    };

    let raw_rt = raw.run_time.unwrap_or_default();
    let defaults = RunTimeConfig::default();
    let engine_paths = raw_rt
        .engine_paths
        .map(|p| EnginePaths {
            linux: p.linux,
            mac: p.mac,
            mac_arm: p.mac_arm,
            windows: p.windows,
        })
        .filter(|p| !p.is_empty());
    let run_time = RunTimeConfig {
        timeout_seconds: raw_rt.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        max_threads: raw_rt.max_thread.unwrap_or(0),
        d_override: raw_rt.r#override.unwrap_or_default().trim().to_string(),
        run_as_perf: raw_rt.run_as_perf.unwrap_or(false),
        schema_name: raw_rt.schema.filter(|s| !s.trim().is_empty()),
        engine_paths,
    };

    let mut seen: IndexSet<String> = IndexSet::new();
    let mut test_sets = Vec::new();
    for t in raw.tests {
        let config_name = config_name_for(&t.name, &ds);
        if !seen.insert(config_name.clone()) {
            return Err(anyhow!(
                "plan file {} defines test set {} twice",
                plan_file.display(),
                config_name
            ));
        }
        let ts = TestSet::new(&ds, &root_dir, config_name, tds_name_for(t.tds.trim(), &ds), t.kind, &ds)
            .with_pattern(t.pattern.trim())
            .with_exclusions(t.exclusions.map(|e| e.joined()).unwrap_or_default())
            .with_password_file(t.password_file.map(|p| p.trim().to_string()))
            .with_expected_message(t.expected_message)
            .with_smoke_test(t.smoke_test)
            .with_enabled(t.enabled.unwrap_or(true));
        test_sets.push(ts);
    }

    Ok(DatasourcePlan {
        name: ds,
        root_dir,
        run_time,
        test_sets,
        source: plan_file.to_path_buf(),
    })
}

pub fn load_plans(paths: &[PathBuf]) -> Result<Vec<DatasourcePlan>> {
    let mut out = Vec::new();
    for f in plan_files(paths)? {
        let content = fs::read_to_string(&f)
            .with_context(|| format!("failed to read plan file {}", f.display()))?;
        out.push(parse_plan(&content, &f)?);
    }
    Ok(out)
}

/// Picks plans by a comma separated list of datasource names, or `all`.
pub fn select_plans<'a>(plans: &'a [DatasourcePlan], names: &str) -> Result<Vec<&'a DatasourcePlan>> {
    let wanted: Vec<&str> = names.split(',').map(str::trim).filter(|n| !n.is_empty()).collect();
    if wanted.is_empty() || wanted.iter().any(|n| n.eq_ignore_ascii_case("all")) {
        return Ok(plans.iter().collect());
    }
    wanted
        .iter()
        .map(|name| {
            plans
                .iter()
                .find(|p| p.name == *name)
                .ok_or_else(|| anyhow!("no plan found for datasource '{}'", name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_component_translation() {
        assert_eq!(glob_component_regex("setup.*.txt"), r"setup\.[^/]*\.txt");
        assert_eq!(glob_component_regex("b?.xml"), r"b[^/]\.xml");
    }

    #[test]
    fn tds_and_config_names() {
        assert_eq!(tds_name_for("cast_calcs.", "pg"), "cast_calcs.pg.tds");
        assert_eq!(tds_name_for("Staples.pg.tds", "pg"), "Staples.pg.tds");
        assert_eq!(config_name_for("expression.standard", "pg"), "expression.standard.pg");
        assert_eq!(config_name_for("logical.calcs.", "pg"), "logical.calcs.pg");
    }
}
