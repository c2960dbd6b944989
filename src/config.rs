//! Extractor settings: which sources to try, in what order, and where the
//! private log lives. Read from a YAML or JSON file, then overridden from
//! the environment.

use crate::error::ConfigError;
use crate::types::{FileMetadataExtractor, Source, DEFAULT_LOGFILE_NAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_LOGFILE: &str = "FOOOCUS_META_LOGFILE";
pub const ENV_SOURCES: &str = "FOOOCUS_META_SOURCES";

fn default_logfile_name() -> String {
    DEFAULT_LOGFILE_NAME.to_string()
}

fn default_sources() -> Vec<Source> {
    Source::ALL.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Private log file name, looked up next to each image.
    #[serde(default = "default_logfile_name")]
    pub logfile_name: String,
    /// One private log for every image, instead of per directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Decoders to register, in the order they are tried.
    #[serde(default = "default_sources")]
    pub sources: Vec<Source>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            logfile_name: default_logfile_name(),
            log_file: None,
            sources: default_sources(),
        }
    }
}

impl ExtractorConfig {
    pub fn files(&self) -> FileMetadataExtractor {
        FileMetadataExtractor {
            logfile_name: self.logfile_name.clone(),
            log_file: self.log_file.clone(),
            ..FileMetadataExtractor::default()
        }
    }

    /// Applies `FOOOCUS_META_LOGFILE` and `FOOOCUS_META_SOURCES`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(ENV_LOGFILE).filter(|name| !name.trim().is_empty()) {
            self.logfile_name = name.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_SOURCES) {
            let sources = parse_source_list(&raw);
            if sources.is_empty() {
                log::warn!("{} has no usable sources, keeping {:?}", ENV_SOURCES, self.sources);
            } else {
                self.sources = sources;
            }
        }

        self
    }
}

pub fn parse_source(name: &str) -> Result<Source, ConfigError> {
    name.parse::<Source>().map_err(ConfigError::UnknownSource)
}

/// Comma-separated source names; unknown names are dropped with a warning.
pub fn parse_source_list(raw: &str) -> Vec<Source> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match parse_source(name) {
            Ok(source) => Some(source),
            Err(err) => {
                log::warn!("Ignoring configured source: {}", err);
                None
            }
        })
        .collect()
}

/// Reads a config file. `.json` is parsed as JSON, anything else as YAML.
pub fn read(path: &Path) -> Result<ExtractorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let parsed = match ext {
        "json" => serde_json::from_str(&content).map_err(|e| e.to_string()),
        _ => serde_yaml::from_str(&content).map_err(|e| e.to_string()), // yaml/yml
    };
    parsed.map_err(|message| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    })
}

/// Like [`read`], but falls back to the defaults when the file cannot be
/// used. Environment overrides are applied either way.
pub fn load(path: &Path) -> ExtractorConfig {
    let config = match read(path) {
        Ok(config) => {
            log::info!("Loaded config from {}", path.display());
            config
        }
        Err(err) => {
            log::warn!("{}; using defaults", err);
            ExtractorConfig::default()
        }
    };
    config.with_env_overrides()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::fs;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ExtractorConfig::default();
        assert_eq!(config.logfile_name, "log.html");
        assert_eq!(config.log_file, None);
        assert_eq!(config.sources, Source::ALL.to_vec());
        assert_eq!(config.files(), FileMetadataExtractor::default());
    }

    #[test]
    fn test_read_yaml_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "sources:\n  - stablediffusion\n  - fooocus\n").unwrap();

        let config = read(&path).unwrap();
        assert_eq!(config.sources, vec![Source::StableDiffusion, Source::Fooocus]);
        assert_eq!(config.logfile_name, "log.html");
    }

    #[test]
    fn test_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"logfile_name": "history.html", "log_file": "/shared/log.html"}"#,
        )
        .unwrap();

        let config = read(&path).unwrap();
        assert_eq!(config.logfile_name, "history.html");
        assert_eq!(config.log_file, Some(PathBuf::from("/shared/log.html")));
        assert_eq!(config.files().logfile_for(Path::new("/a/b.png")), PathBuf::from("/shared/log.html"));
    }

    #[test]
    fn test_read_rejects_unknown_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "sources: [fooocus, comfyui]\n").unwrap();
        assert!(matches!(read(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read(&dir.path().join("absent.yaml"));
        assert!(matches!(config, Err(ConfigError::Io { .. })));

        let loaded = load(&dir.path().join("absent.yaml"));
        assert_eq!(loaded.logfile_name, ExtractorConfig::default().logfile_name);
    }

    #[test]
    fn test_env_overrides() {
        let config = ExtractorConfig::default().with_overrides(lookup(&[
            (ENV_LOGFILE, " private.html "),
            (ENV_SOURCES, "ruinedfooocus, comfyui, FooocusPlus"),
        ]));
        assert_eq!(config.logfile_name, "private.html");
        assert_eq!(config.sources, vec![Source::RuinedFooocus, Source::FooocusPlus]);
    }

    #[test]
    fn test_env_overrides_ignore_empty_values() {
        let config = ExtractorConfig::default()
            .with_overrides(lookup(&[(ENV_LOGFILE, ""), (ENV_SOURCES, "comfyui, ,")]));
        assert_eq!(config, ExtractorConfig::default());
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(parse_source("fooocus").unwrap(), Source::Fooocus);
        assert!(matches!(
            parse_source("invokeai"),
            Err(ConfigError::UnknownSource(name)) if name == "invokeai"
        ));
    }
}
