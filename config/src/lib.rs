//! Configuration loading for anchor.
//!
//! The config file is TOML, by default at `~/.anchor/config.toml`:
//!
//! ```toml
//! [analyzer]
//! command = "pyanalyzer"
//! args = ["--stdio"]
//!
//! [sync]
//! quiet_period_ms = 1000
//! ```
//!
//! Every section is optional. A missing file means defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use anchor_analyzer::{AnalyzerConfig, OrchestratorConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnchorConfig {
    /// Analyzer process to start. Without it nothing can be analyzed.
    #[serde(default)]
    pub analyzer: Option<AnalyzerConfig>,
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
}

impl AnchorConfig {
    /// Load from the default location. Read and parse failures are logged
    /// and treated as a missing file.
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{e}");
                Self::default()
            }
        }
    }

    /// Load from `path`; a file that does not exist yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".anchor").join("config.toml"))
}
