use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

/// Strategy applied when captured output grows past the overflow threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Keep a bounded head and tail of the output and drop the middle.
    #[default]
    Truncate,
    /// Spill the full output to a file in the execution temp directory.
    Tmpfile,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Truncate => "truncate",
            Self::Tmpfile => "tmpfile",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "tmpfile" => Ok(Self::Tmpfile),
            other => Err(anyhow!(
                "unknown overflow policy `{other}` (expected `truncate` or `tmpfile`)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScriptsConfig {
    /// Wall-clock limit (in seconds) for a single script run.
    #[serde(default = "ScriptsConfig::default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Time (in milliseconds) between SIGTERM and SIGKILL when terminating.
    #[serde(default = "ScriptsConfig::default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    /// Captured output size (in bytes) after which the overflow policy applies.
    #[serde(default = "ScriptsConfig::default_overflow_threshold_bytes")]
    pub overflow_threshold_bytes: usize,
    /// Bytes of leading output kept when output is condensed.
    #[serde(default = "ScriptsConfig::default_head_bytes")]
    pub head_bytes: usize,
    /// Trailing lines kept when output is condensed.
    #[serde(default = "ScriptsConfig::default_tail_lines")]
    pub tail_lines: usize,
    /// Longest single line retained before it is cut.
    #[serde(default = "ScriptsConfig::default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Overflow policy used when the caller does not pick one.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Scripts directory, relative to the workspace root.
    #[serde(default = "ScriptsConfig::default_canonical_scripts_dir")]
    pub canonical_scripts_dir: String,
    /// Older scripts directory checked when the canonical one misses.
    #[serde(default = "ScriptsConfig::default_legacy_scripts_dir")]
    pub legacy_scripts_dir: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: Self::default_timeout_secs(),
            termination_grace_ms: Self::default_termination_grace_ms(),
            overflow_threshold_bytes: Self::default_overflow_threshold_bytes(),
            head_bytes: Self::default_head_bytes(),
            tail_lines: Self::default_tail_lines(),
            max_line_bytes: Self::default_max_line_bytes(),
            overflow_policy: OverflowPolicy::default(),
            canonical_scripts_dir: Self::default_canonical_scripts_dir(),
            legacy_scripts_dir: Self::default_legacy_scripts_dir(),
        }
    }
}

impl ScriptsConfig {
    const fn default_timeout_secs() -> u64 {
        300
    }

    const fn default_termination_grace_ms() -> u64 {
        2_000
    }

    const fn default_overflow_threshold_bytes() -> usize {
        200_000
    }

    const fn default_head_bytes() -> usize {
        8_000
    }

    const fn default_tail_lines() -> usize {
        200
    }

    const fn default_max_line_bytes() -> usize {
        64 * 1024
    }

    fn default_canonical_scripts_dir() -> String {
        ".wsrun/scripts".to_string()
    }

    fn default_legacy_scripts_dir() -> String {
        ".scripts".to_string()
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.default_timeout_secs > 0,
            "scripts.default_timeout_secs must be greater than zero"
        );
        ensure!(
            self.overflow_threshold_bytes > 0,
            "scripts.overflow_threshold_bytes must be greater than zero"
        );
        ensure!(
            self.head_bytes <= self.overflow_threshold_bytes,
            "scripts.head_bytes ({}) cannot exceed scripts.overflow_threshold_bytes ({})",
            self.head_bytes,
            self.overflow_threshold_bytes
        );
        ensure!(self.tail_lines > 0, "scripts.tail_lines must be at least 1");
        ensure!(
            self.max_line_bytes > 0,
            "scripts.max_line_bytes must be greater than zero"
        );
        for (key, dir) in [
            ("canonical_scripts_dir", &self.canonical_scripts_dir),
            ("legacy_scripts_dir", &self.legacy_scripts_dir),
        ] {
            ensure!(!dir.trim().is_empty(), "scripts.{key} cannot be empty");
            ensure!(
                !dir.starts_with('/') && !dir.split('/').any(|part| part == ".."),
                "scripts.{key} must be a relative path inside the workspace, got `{dir}`"
            );
        }
        Ok(())
    }
}
