use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::remote::RemoteConfig;
use crate::scripts::ScriptsConfig;
use crate::{CONFIG_DIR_NAME, CONFIG_FILE_NAME, CONFIG_PATH_ENV};

/// Root of a `wsrun.toml` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WsrunConfig {
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl WsrunConfig {
    pub fn validate(&self) -> Result<()> {
        self.scripts.validate()?;
        self.remote.validate()?;
        Ok(())
    }
}

/// Where a configuration layer was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// `~/.wsrun/wsrun.toml`
    User { file: PathBuf },
    /// `<workspace>/.wsrun/wsrun.toml` or `<workspace>/wsrun.toml`
    Workspace { file: PathBuf },
    /// File named by `WSRUN_CONFIG_PATH`.
    Explicit { file: PathBuf },
}

impl ConfigLayerSource {
    pub fn file(&self) -> &Path {
        match self {
            Self::User { file } | Self::Workspace { file } | Self::Explicit { file } => file,
        }
    }
}

/// Recursively merge two TOML values.
///
/// If both values are tables, they are merged recursively.
/// Otherwise, the `overlay` value replaces the `base` value.
pub fn merge_toml_values(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                if let Some(base_value) = base_table.get_mut(key) {
                    merge_toml_values(base_value, value);
                } else {
                    base_table.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Loads and validates the effective configuration for a workspace.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: WsrunConfig,
    layers: Vec<ConfigLayerSource>,
}

impl ConfigManager {
    /// Load configuration for `workspace`, honouring `WSRUN_CONFIG_PATH`.
    ///
    /// Layers, lowest precedence first: user home, `<ws>/.wsrun/wsrun.toml`,
    /// `<ws>/wsrun.toml`, then the explicit file from the environment.
    pub fn load_from_workspace(workspace: impl AsRef<Path>) -> Result<Self> {
        let workspace = workspace.as_ref();
        let mut candidates = Vec::new();

        if let Some(home) = dirs::home_dir() {
            candidates.push(ConfigLayerSource::User {
                file: home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
            });
        }
        candidates.push(ConfigLayerSource::Workspace {
            file: workspace.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        });
        candidates.push(ConfigLayerSource::Workspace {
            file: workspace.join(CONFIG_FILE_NAME),
        });

        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            let trimmed = explicit.trim();
            if !trimmed.is_empty() {
                let file = PathBuf::from(trimmed);
                if !file.exists() {
                    anyhow::bail!(
                        "{CONFIG_PATH_ENV} points at {}, which does not exist",
                        file.display()
                    );
                }
                candidates.push(ConfigLayerSource::Explicit { file });
            }
        }

        Self::load_layers(candidates)
    }

    /// Load configuration from a single file, ignoring other layers.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_layers(vec![ConfigLayerSource::Explicit {
            file: path.as_ref().to_path_buf(),
        }])
    }

    fn load_layers(candidates: Vec<ConfigLayerSource>) -> Result<Self> {
        let mut effective = toml::Value::Table(toml::map::Map::new());
        let mut layers = Vec::new();

        for source in candidates {
            let file = source.file();
            if !file.exists() {
                continue;
            }
            let value = Self::load_toml_from_file(file)?;
            debug!(path = %file.display(), "Loaded configuration layer");
            merge_toml_values(&mut effective, &value);
            layers.push(source);
        }

        let config: WsrunConfig = effective
            .try_into()
            .context("Failed to deserialize effective configuration")?;
        config
            .validate()
            .context("Configuration failed validation")?;

        Ok(Self { config, layers })
    }

    fn load_toml_from_file(path: &Path) -> Result<toml::Value> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let value: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(value)
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &WsrunConfig {
        &self.config
    }

    pub fn into_config(self) -> WsrunConfig {
        self.config
    }

    /// Layers that contributed to the effective configuration, lowest first.
    pub fn layers(&self) -> &[ConfigLayerSource] {
        &self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverflowPolicy;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn missing_files_fall_back_to_defaults() -> Result<()> {
        let workspace = TempDir::new()?;
        // SAFETY: serialised test; no other thread reads the variable.
        unsafe { std::env::remove_var(CONFIG_PATH_ENV) };

        let manager = ConfigManager::load_from_workspace(workspace.path())?;
        assert_eq!(manager.config().scripts, ScriptsConfig::default());
        Ok(())
    }

    #[test]
    #[serial]
    fn workspace_root_file_overrides_dot_dir() -> Result<()> {
        let workspace = TempDir::new()?;
        unsafe { std::env::remove_var(CONFIG_PATH_ENV) };
        workspace
            .child(".wsrun/wsrun.toml")
            .write_str("[scripts]\ndefault_timeout_secs = 60\ntail_lines = 10\n")?;
        workspace
            .child("wsrun.toml")
            .write_str("[scripts]\ndefault_timeout_secs = 90\noverflow_policy = \"tmpfile\"\n")?;

        let manager = ConfigManager::load_from_workspace(workspace.path())?;
        let scripts = &manager.config().scripts;
        assert_eq!(scripts.default_timeout_secs, 90);
        assert_eq!(scripts.tail_lines, 10);
        assert_eq!(scripts.overflow_policy, OverflowPolicy::Tmpfile);
        assert_eq!(
            manager
                .layers()
                .iter()
                .filter(|layer| matches!(layer, ConfigLayerSource::Workspace { .. }))
                .count(),
            2
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn invalid_values_fail_validation() -> Result<()> {
        let workspace = TempDir::new()?;
        unsafe { std::env::remove_var(CONFIG_PATH_ENV) };
        workspace
            .child("wsrun.toml")
            .write_str("[scripts]\ndefault_timeout_secs = 0\n")?;

        assert!(ConfigManager::load_from_workspace(workspace.path()).is_err());
        Ok(())
    }

    #[test]
    fn explicit_file_is_loaded_alone() -> Result<()> {
        let workspace = TempDir::new()?;
        let file = workspace.child("custom.toml");
        file.write_str("[remote]\ntarget = \"builder@ci\"\n")?;

        let manager = ConfigManager::load_from_file(file.path())?;
        assert_eq!(manager.config().remote.target.as_deref(), Some("builder@ci"));
        assert_eq!(manager.config().remote.connect_timeout_secs, 15);
        Ok(())
    }
}
