//! File naming conventions shared by the engine, the comparator and the
//! report archiver.
//!
//! Expression fixtures `setup.<t>.txt` are answered by `actual.setup.<t>.txt`
//! and compared against `expected.setup.<t>.txt`, `expected.setup.<t>.1.txt`
//! and so on, all living next to the fixture. Logical fixtures live under
//! `setup/<group>/` and their expected files under the sibling
//! `expected/<group>/` directory.

use std::path::{Path, PathBuf};

use crate::plan::TestKind;

/// Where the engine output, the actual file and the expected files of one
/// fixture live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixturePaths {
    /// Base test name, used to derive expected file names.
    pub test_name: String,
    /// File the engine writes.
    pub engine_output: PathBuf,
    /// File the comparator reads. Same as `engine_output` for expression tests.
    pub actual: PathBuf,
    pub expected_dir: PathBuf,
}

impl FixturePaths {
    pub fn for_fixture(kind: TestKind, fixture: &Path, output_dir: &Path) -> Self {
        match kind {
            TestKind::Expression => expression_paths(fixture, output_dir),
            TestKind::Logical => logical_paths(fixture, output_dir),
        }
    }

    pub fn diff(&self) -> PathBuf {
        diff_path(&self.actual)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn expression_paths(fixture: &Path, output_dir: &Path) -> FixturePaths {
    let name = file_name(fixture);
    let actual = output_dir.join(format!("actual.{name}"));
    FixturePaths {
        test_name: name,
        engine_output: actual.clone(),
        actual,
        expected_dir: fixture.parent().map(Path::to_path_buf).unwrap_or_default(),
    }
}

/// `setup.bugs.b1713.dbo.xml` runs as `setup.bugs.b1713.dbo-combined.xml`
/// and is compared as `actual.setup.bugs.b1713.xml`.
fn logical_paths(fixture: &Path, output_dir: &Path) -> FixturePaths {
    let name = file_name(fixture);
    let stem = name.strip_suffix(".xml").unwrap_or(&name);
    let engine_output = output_dir.join(format!("{stem}-combined.xml"));

    let mut parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        parts.truncate(parts.len() - 2);
    } else {
        parts.truncate(1);
    }
    let base = format!("{}.xml", parts.join("."));
    let actual = output_dir.join(format!("actual.{base}"));

    // setup/<group>/fixture -> expected/<group>/
    let group_dir = fixture.parent().unwrap_or(Path::new(""));
    let group = group_dir.file_name().map(PathBuf::from).unwrap_or_default();
    let expected_dir = group_dir
        .parent()
        .and_then(Path::parent)
        .map(|root| root.join("expected").join(&group))
        .unwrap_or_else(|| group_dir.to_path_buf());

    FixturePaths {
        test_name: base,
        engine_output,
        actual,
        expected_dir,
    }
}

/// `expected.<name>` for version 0, `expected.<stem>.<version>.<ext>` after that.
pub fn expected_file_name(test_name: &str, version: usize) -> String {
    if version == 0 {
        return format!("expected.{test_name}");
    }
    match test_name.rsplit_once('.') {
        Some((stem, ext)) => format!("expected.{stem}.{version}.{ext}"),
        None => format!("expected.{test_name}.{version}"),
    }
}

/// Every existing expected file, in version order, stopping at the first gap.
pub fn expected_candidates(expected_dir: &Path, test_name: &str) -> Vec<PathBuf> {
    (0..)
        .map(|v| expected_dir.join(expected_file_name(test_name, v)))
        .take_while(|p| p.is_file())
        .collect()
}

/// `actual.<stem>_diff.<ext>` next to the actual file.
pub fn diff_path(actual: &Path) -> PathBuf {
    let name = file_name(actual);
    let diff_name = match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_diff.{ext}"),
        None => format!("{name}_diff"),
    };
    actual.with_file_name(diff_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_versions() {
        assert_eq!(expected_file_name("setup.math.txt", 0), "expected.setup.math.txt");
        assert_eq!(expected_file_name("setup.math.txt", 2), "expected.setup.math.2.txt");
    }

    #[test]
    fn expression_paths_share_actual() {
        let p = FixturePaths::for_fixture(
            TestKind::Expression,
            Path::new("/suite/exprtests/standard/setup.math.txt"),
            Path::new("/tmp/run"),
        );
        assert_eq!(p.actual, Path::new("/tmp/run/actual.setup.math.txt"));
        assert_eq!(p.engine_output, p.actual);
        assert_eq!(p.expected_dir, Path::new("/suite/exprtests/standard"));
        assert_eq!(p.diff(), Path::new("/tmp/run/actual.setup.math_diff.txt"));
    }

    #[test]
    fn logical_paths_follow_setup_layout() {
        let p = FixturePaths::for_fixture(
            TestKind::Logical,
            Path::new("/suite/logicaltests/setup/calcs/setup.bugs.b1713.dbo.xml"),
            Path::new("/tmp/run"),
        );
        assert_eq!(p.engine_output, Path::new("/tmp/run/setup.bugs.b1713.dbo-combined.xml"));
        assert_eq!(p.actual, Path::new("/tmp/run/actual.setup.bugs.b1713.xml"));
        assert_eq!(p.test_name, "setup.bugs.b1713.xml");
        assert_eq!(p.expected_dir, Path::new("/suite/logicaltests/expected/calcs"));
    }
}
