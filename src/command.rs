use std::path::Path;

use crate::plan::{EnginePaths, Invocation, TestSet};

pub const DEFAULT_ENGINE: &str = "tabquerytool";
const LOGICAL_REWRITE_FLAG: &str = "-DLogicalQueryRewriteDisable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Mac,
    MacArm,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            Platform::MacArm
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Linux
        }
    }

    pub fn is_mac(self) -> bool {
        matches!(self, Platform::Mac | Platform::MacArm)
    }
}

impl EnginePaths {
    /// Configured executable for `platform`. Apple silicon falls back to the
    /// plain Mac entry.
    pub fn for_platform(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Linux => self.linux.as_deref(),
            Platform::Mac => self.mac.as_deref(),
            Platform::MacArm => self.mac_arm.as_deref().or(self.mac.as_deref()),
            Platform::Windows => self.windows.as_deref(),
        }
    }
}

/// Executable for an item: the plan's per-OS override when present,
/// otherwise the run-wide engine.
pub fn engine_for(default_engine: &str, platform: Platform, invocation: &Invocation) -> String {
    invocation
        .run_time
        .as_ref()
        .and_then(|rt| rt.engine_paths.as_ref())
        .and_then(|paths| paths.for_platform(platform))
        .filter(|p| !p.is_empty())
        .unwrap_or(default_engine)
        .to_string()
}

pub fn build_command_line(
    default_engine: &str,
    platform: Platform,
    test_set: &TestSet,
    invocation: &Invocation,
    test_list_path: &Path,
) -> Vec<String> {
    let list_arg = if invocation.logical {
        "--query-file-list"
    } else {
        "--expression-file-list"
    };

    let mut cmdline = vec![
        engine_for(default_engine, platform, invocation),
        list_arg.to_string(),
        test_list_path.to_string_lossy().into_owned(),
        "-d".to_string(),
        invocation.tds.clone(),
        "--combined".to_string(),
    ];

    if let Some(schema) = invocation.run_time.as_ref().and_then(|rt| rt.schema_name.as_deref()) {
        cmdline.push("--schema".to_string());
        cmdline.push(schema.to_string());
    }

    let password_file = test_set.password_file_path();
    if password_file.is_file() {
        cmdline.push("--password-file".to_string());
        cmdline.push(password_file.to_string_lossy().into_owned());
    }

    if let Some(output_dir) = invocation.output_dir() {
        cmdline.push("--output-dir".to_string());
        cmdline.push(output_dir.to_string_lossy().into_owned());
    }

    cmdline.push(format!("-DLogDir={}", invocation.log_dir.to_string_lossy()));
    cmdline.push("-DOverride=ProtocolServerNewLog".to_string());

    cmdline.extend(
        invocation
            .d_override
            .split(' ')
            .filter(|o| !o.is_empty())
            .map(str::to_string),
    );

    if !cmdline.iter().any(|arg| arg.contains(LOGICAL_REWRITE_FLAG)) {
        cmdline.push(format!("{LOGICAL_REWRITE_FLAG}=Funcall:RewriteConstantFuncall"));
    }

    cmdline.push("-DInMemoryLogicalCacheDisable".to_string());
    cmdline
}

/// The single-instance engine cannot run concurrently on macOS.
pub fn max_parallelism(desired: usize, platform: Platform, engine: &str) -> usize {
    if platform.is_mac() && engine.contains(DEFAULT_ENGINE) {
        return 1;
    }
    desired.max(1)
}
