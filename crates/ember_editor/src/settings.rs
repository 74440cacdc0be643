//! Editor settings

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Editor settings, stored as JSON next to the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorSettings {
    /// Entities split off a shared instance per editor frame.
    pub build_batch_size: usize,
    /// Background build workers; 0 lets rayon decide.
    pub worker_threads: usize,
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Maximum number of components locked by background builds per sandbox.
    pub locked_component_capacity: usize,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            build_batch_size: 500,
            worker_threads: 0,
            log_level: "info".to_string(),
            locked_component_capacity: 64,
        }
    }
}

impl EditorSettings {
    /// Load settings, falling back to defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let io_error = |source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        };
        let text = serde_json::to_string_pretty(self).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, text).map_err(io_error)
    }
}
