//! Listing of runnable workspace scripts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wsrun_bash_runner::{Runtime, RuntimeError};
use wsrun_config::ScriptsConfig;

/// Header lines scanned for a description, shebang excluded.
const DESCRIPTION_SCAN_LINES: usize = 20;
const DESCRIPTION_PREFIX: &str = "description:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceScript {
    pub name: String,
    pub description: Option<String>,
    pub is_executable: bool,
    pub path: PathBuf,
}

#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    /// Scripts available under `workspace_root`, ordered by name.
    async fn discover(
        &self,
        runtime: &dyn Runtime,
        workspace_root: &Path,
    ) -> Result<Vec<WorkspaceScript>, RuntimeError>;
}

/// Scans the canonical scripts directory, then the legacy one. A name found in
/// the canonical directory hides the legacy entry.
#[derive(Debug, Clone)]
pub struct FsScriptCatalog {
    dirs: Vec<String>,
}

impl FsScriptCatalog {
    pub fn new(config: &ScriptsConfig) -> Self {
        Self {
            dirs: vec![
                config.canonical_scripts_dir.clone(),
                config.legacy_scripts_dir.clone(),
            ],
        }
    }
}

impl Default for FsScriptCatalog {
    fn default() -> Self {
        Self::new(&ScriptsConfig::default())
    }
}

#[async_trait]
impl ScriptCatalog for FsScriptCatalog {
    async fn discover(
        &self,
        runtime: &dyn Runtime,
        workspace_root: &Path,
    ) -> Result<Vec<WorkspaceScript>, RuntimeError> {
        let workspace = runtime.resolve_path(workspace_root).await?;
        let mut seen = HashSet::new();
        let mut scripts = Vec::new();

        for dir in &self.dirs {
            let dir_path = workspace.join(dir);
            let entries = match runtime.list_dir(&dir_path).await {
                Ok(entries) => entries,
                Err(err) if err.is_not_found() => {
                    debug!(dir = %dir_path.display(), "Scripts directory absent");
                    continue;
                }
                Err(err) => return Err(err),
            };

            for name in entries {
                if name.starts_with('.') || seen.contains(&name) {
                    continue;
                }
                let path = dir_path.join(&name);
                let stat = match runtime.stat(&path).await {
                    Ok(stat) => stat,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Skipping unreadable script");
                        continue;
                    }
                };
                if !stat.is_executable {
                    continue;
                }

                let description = match runtime.read_head(&path, DESCRIPTION_SCAN_LINES + 1).await
                {
                    Ok(head) => parse_description(&head),
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "Could not read script header");
                        None
                    }
                };
                seen.insert(name.clone());
                scripts.push(WorkspaceScript {
                    name,
                    description,
                    is_executable: true,
                    path,
                });
            }
        }

        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = scripts.len(), "Discovered workspace scripts");
        Ok(scripts)
    }
}

/// First `# Description: …` comment in the header, case-insensitive.
pub fn parse_description(head: &str) -> Option<String> {
    let mut lines = head.lines().peekable();
    if lines.peek().is_some_and(|line| line.starts_with("#!")) {
        lines.next();
    }
    lines.take(DESCRIPTION_SCAN_LINES).find_map(|line| {
        let comment = line.trim().strip_prefix('#')?.trim_start();
        let prefix = comment.get(..DESCRIPTION_PREFIX.len())?;
        if !prefix.eq_ignore_ascii_case(DESCRIPTION_PREFIX) {
            return None;
        }
        let text = comment[DESCRIPTION_PREFIX.len()..].trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}
