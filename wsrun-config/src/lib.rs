//! Configuration for the wsrun crates.
//!
//! [`ScriptsConfig`] holds the tunables of the execution engine (timeouts,
//! overflow thresholds, termination grace window, script directories) and
//! [`ConfigManager`] resolves them from layered `wsrun.toml` files.

pub mod loader;
pub mod remote;
pub mod scripts;

pub use loader::{ConfigLayerSource, ConfigManager, WsrunConfig, merge_toml_values};
pub use remote::RemoteConfig;
pub use scripts::{OverflowPolicy, ScriptsConfig};

/// File name looked up in the workspace and in `~/.wsrun`.
pub const CONFIG_FILE_NAME: &str = "wsrun.toml";

/// Directory (relative to the workspace root or home) holding wsrun state.
pub const CONFIG_DIR_NAME: &str = ".wsrun";

/// Environment variable pointing at an explicit config file.
pub const CONFIG_PATH_ENV: &str = "WSRUN_CONFIG_PATH";
