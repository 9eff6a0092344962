use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_ROOT_DIR: &str = "results";
pub const DEFAULT_SOCKET_PATH: &str = "formsaver.sock";
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 40;

/// Daemon settings: optional TOML file, overridable by environment, with
/// command-line flags applied on top by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub root_dir: PathBuf,
    pub socket_path: PathBuf,
    pub close_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|e| Error::InvalidSettings {
                    message: format!("{}: {e}", path.display()),
                })?
            }
            None => Self::default(),
        };
        settings.apply_env_from(
            std::env::var("FORMSAVER_ROOT").ok().as_deref(),
            std::env::var("FORMSAVER_SOCKET").ok().as_deref(),
        );
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_from(&mut self, root: Option<&str>, socket: Option<&str>) {
        if let Some(v) = root
            && !v.trim().is_empty()
        {
            self.root_dir = PathBuf::from(v);
        }
        if let Some(v) = socket
            && !v.trim().is_empty()
        {
            self.socket_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(Error::InvalidSettings {
                message: "root_dir must not be empty".to_string(),
            });
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::InvalidSettings {
                message: "socket_path must not be empty".to_string(),
            });
        }
        if self.close_grace_ms > 10_000 {
            return Err(Error::InvalidSettings {
                message: format!(
                    "close_grace_ms must be at most 10000, got {}",
                    self.close_grace_ms
                ),
            });
        }
        Ok(())
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}
