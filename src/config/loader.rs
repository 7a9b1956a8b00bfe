use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, ConfigError};

use super::types::ConfigFile;

const DEFAULT_FILES: [&str; 2] = ["loadplane.toml", "loadplane.json"];

/// Loads the config file at `path`, or the first default file present in the
/// working directory.
///
/// # Errors
///
/// Returns an error when the config file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Option<ConfigFile>> {
    if let Some(path) = path {
        return load_config_file(Path::new(path)).map(Some);
    }
    for candidate in DEFAULT_FILES.iter().map(PathBuf::from) {
        if candidate.exists() {
            tracing::debug!("Using config {}", candidate.display());
            return load_config_file(&candidate).map(Some);
        }
    }
    Ok(None)
}

pub(crate) fn load_config_file(path: &Path) -> AppResult<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        AppError::config(ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|source| {
            AppError::config(ConfigError::ParseToml {
                path: path.to_path_buf(),
                source,
            })
        }),
        Some("json") => serde_json::from_str(&content).map_err(|source| {
            AppError::config(ConfigError::ParseJson {
                path: path.to_path_buf(),
                source,
            })
        }),
        Some(ext) => Err(AppError::config(ConfigError::UnsupportedExtension {
            ext: ext.to_owned(),
        })),
        None => Err(AppError::config(ConfigError::MissingExtension)),
    }
}
