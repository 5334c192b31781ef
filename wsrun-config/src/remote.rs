use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Settings for the ssh-backed remote runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// `user@host` (or an ssh config alias). `None` keeps execution local.
    #[serde(default)]
    pub target: Option<String>,
    /// Seconds allowed for opening the master connection.
    #[serde(default = "RemoteConfig::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Extra `-o Key=Value` options passed to every ssh invocation.
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

impl RemoteConfig {
    const fn default_connect_timeout_secs() -> u64 {
        15
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(target) = &self.target {
            ensure!(!target.trim().is_empty(), "remote.target cannot be blank");
        }
        for option in &self.ssh_options {
            ensure!(
                option.contains('='),
                "remote.ssh_options entries must look like Key=Value, got `{option}`"
            );
        }
        Ok(())
    }
}
