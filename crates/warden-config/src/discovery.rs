//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/warden/config.toml` (XDG user config)
//! 2. `./warden.toml` (project-local)

use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, WardenConfig};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "warden.toml";

/// Default config filename within the XDG config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for XDG directory resolution.
const APP_NAME: &str = "warden";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "WARDEN_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: WardenConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Warnings generated during loading (unreadable or malformed layers).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
///
/// `config_dir` overrides both `WARDEN_CONFIG_DIR` and the platform default.
/// `project_dir` defaults to the current directory.
pub fn load_config(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = WardenConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_dir = config_dir.map(Path::to_path_buf).or_else(user_config_dir);
    if let Some(path) = user_dir.map(|dir| dir.join(USER_CONFIG_FILE)) {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<WardenConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    WardenConfig::from_toml(&contents)
}

/// The user config directory: `WARDEN_CONFIG_DIR`, else the platform default.
fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Try to load a config file and merge it into the existing config.
fn load_layer(config: &mut WardenConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
